//! Session transparency log.
//!
//! Counts what the harvester did with the user's attention: how many prompts
//! it raised, how they were answered, and how many rows reached disk. No
//! application names or sample values are kept here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Transparency statistics for the current session.
#[derive(Debug)]
pub struct TransparencyLog {
    /// Prompts raised, whatever their trigger
    snapshots_requested: AtomicU64,
    /// Prompts answered "productive"
    labels_productive: AtomicU64,
    /// Prompts answered "not productive"
    labels_unproductive: AtomicU64,
    /// Prompts that expired unanswered
    timeouts: AtomicU64,
    /// Prompts abandoned at shutdown
    discarded: AtomicU64,
    /// Rows appended to the labeled log
    rows_written: AtomicU64,
    /// Rows that could not be written
    persist_failures: AtomicU64,
    session_id: Uuid,
    session_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl TransparencyLog {
    pub fn new() -> Self {
        Self {
            snapshots_requested: AtomicU64::new(0),
            labels_productive: AtomicU64::new(0),
            labels_unproductive: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            session_id: Uuid::new_v4(),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a transparency log that loads from and saves to `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!("Could not load previous transparency stats: {}", e);
        }

        log
    }

    pub fn record_snapshot_requested(&self) {
        self.snapshots_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_label(&self, productive: bool) {
        let counter = if productive {
            &self.labels_productive
        } else {
            &self.labels_unproductive
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_row_written(&self) {
        self.rows_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn stats(&self) -> TransparencyStats {
        TransparencyStats {
            snapshots_requested: self.snapshots_requested.load(Ordering::Relaxed),
            labels_productive: self.labels_productive.load(Ordering::Relaxed),
            labels_unproductive: self.labels_unproductive.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            session_id: self.session_id,
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        self.stats().summary()
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedStats {
                snapshots_requested: stats.snapshots_requested,
                labels_productive: stats.labels_productive,
                labels_unproductive: stats.labels_unproductive,
                timeouts: stats.timeouts,
                discarded: stats.discarded,
                rows_written: stats.rows_written,
                persist_failures: stats.persist_failures,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.snapshots_requested
                    .store(persisted.snapshots_requested, Ordering::Relaxed);
                self.labels_productive
                    .store(persisted.labels_productive, Ordering::Relaxed);
                self.labels_unproductive
                    .store(persisted.labels_unproductive, Ordering::Relaxed);
                self.timeouts.store(persisted.timeouts, Ordering::Relaxed);
                self.discarded.store(persisted.discarded, Ordering::Relaxed);
                self.rows_written
                    .store(persisted.rows_written, Ordering::Relaxed);
                self.persist_failures
                    .store(persisted.persist_failures, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Default for TransparencyLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of transparency statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparencyStats {
    pub snapshots_requested: u64,
    pub labels_productive: u64,
    pub labels_unproductive: u64,
    pub timeouts: u64,
    pub discarded: u64,
    pub rows_written: u64,
    pub persist_failures: u64,
    /// Identifies this run in logs; not persisted
    pub session_id: Uuid,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

impl TransparencyStats {
    /// Prompts that reached any terminal state.
    pub fn resolved(&self) -> u64 {
        self.labels_productive + self.labels_unproductive + self.timeouts + self.discarded
    }

    /// Human-readable summary, ending with the privacy guarantee.
    pub fn summary(&self) -> String {
        format!(
            "Session Statistics ({}):\n\
             - Snapshots requested: {} ({} resolved)\n\
             - Labeled productive: {}\n\
             - Labeled not productive: {}\n\
             - Timed out: {}\n\
             - Discarded at shutdown: {}\n\
             - Rows written: {} ({} failed)\n\
             - Session duration: {} seconds\n\
             \n\
             Privacy Guarantee:\n\
             - Application names are stored only as hashes\n\
             - No window titles or input content captured\n\
             - All data stays on this machine",
            self.session_id,
            self.snapshots_requested,
            self.resolved(),
            self.labels_productive,
            self.labels_unproductive,
            self.timeouts,
            self.discarded,
            self.rows_written,
            self.persist_failures,
            self.session_duration_secs
        )
    }
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    snapshots_requested: u64,
    labels_productive: u64,
    labels_unproductive: u64,
    timeouts: u64,
    #[serde(default)]
    discarded: u64,
    rows_written: u64,
    #[serde(default)]
    persist_failures: u64,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared transparency log.
pub type SharedTransparencyLog = Arc<TransparencyLog>;

pub fn create_shared_log() -> SharedTransparencyLog {
    Arc::new(TransparencyLog::new())
}

pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedTransparencyLog {
    Arc::new(TransparencyLog::with_persistence(path))
}
