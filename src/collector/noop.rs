//! Probe for environments with no supported desktop backend.
//!
//! This exists so the harvester still runs (and still honours its timing
//! and labeling logic) on headless machines or unknown compositors. Every
//! query fails, and the tracker reports the sentinel application.

use crate::collector::types::Backend;
use crate::collector::{CollectorError, ForegroundProbe};
use std::time::Duration;

/// A probe that never answers.
#[derive(Debug, Clone, Copy)]
pub struct UnsupportedProbe {
    backend: Backend,
}

impl UnsupportedProbe {
    /// Create a probe standing in for `backend`.
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }
}

impl Default for UnsupportedProbe {
    fn default() -> Self {
        Self::new(Backend::Unsupported)
    }
}

impl ForegroundProbe for UnsupportedProbe {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn query_application(&self) -> Result<String, CollectorError> {
        Err(CollectorError::Unsupported("foreground application"))
    }

    fn query_idle(&self) -> Result<Duration, CollectorError> {
        Err(CollectorError::Unsupported("idle time"))
    }
}
