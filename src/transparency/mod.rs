//! Transparency module for the harvester.
//!
//! Keeps an auditable count of every prompt raised and how it ended, so the
//! user can see exactly how often they were asked and what was kept.

pub mod log;

// Re-export commonly used types
pub use log::{
    create_shared_log, create_shared_log_with_persistence, SharedTransparencyLog, TransparencyLog,
    TransparencyStats,
};
