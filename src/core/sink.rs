//! Persistence of labeled snapshots.

use crate::core::snapshot::LabeledRecord;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Column order of the labeled log.
pub const CSV_HEADER: &str = "foreground_app,idle_time,time_last_request,productive";

/// Destination for labeled rows.
pub trait LabelSink: Send + Sync {
    fn persist(&self, record: &LabeledRecord) -> Result<(), SinkError>;
}

/// Appends rows to a CSV file.
///
/// The header is written whenever the file is missing or empty. Writes are
/// serialized through an internal lock so rows never interleave.
#[derive(Debug)]
pub struct CsvSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LabelSink for CsvSink {
    fn persist(&self, record: &LabeledRecord) -> Result<(), SinkError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| SinkError::Io(e.to_string()))?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SinkError::Io(e.to_string()))?;

        let is_empty = file
            .metadata()
            .map(|m| m.len() == 0)
            .map_err(|e| SinkError::Io(e.to_string()))?;

        let mut out = String::new();
        if is_empty {
            out.push_str(CSV_HEADER);
            out.push('\n');
        }
        out.push_str(&format_row(record));
        out.push('\n');

        file.write_all(out.as_bytes())
            .map_err(|e| SinkError::Io(e.to_string()))?;
        Ok(())
    }
}

impl<S: LabelSink + ?Sized> LabelSink for std::sync::Arc<S> {
    fn persist(&self, record: &LabeledRecord) -> Result<(), SinkError> {
        (**self).persist(record)
    }
}

fn format_row(record: &LabeledRecord) -> String {
    format!(
        "{},{},{},{}",
        record.features.foreground_app,
        record.features.idle_time,
        record.features.time_last_request,
        record.productive
    )
}

/// Sink errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    Io(String),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Io(e) => write!(f, "Could not write labeled row: {e}"),
        }
    }
}

impl std::error::Error for SinkError {}
