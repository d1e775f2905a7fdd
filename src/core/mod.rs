//! Core functionality for the harvester.
//!
//! This module contains:
//! - The snapshot model and its state machine
//! - Feature derivation and the stable application hash
//! - Persistence of labeled rows

pub mod coordinator;
pub mod features;
pub mod sink;
pub mod snapshot;

// Re-export commonly used types
pub use coordinator::{CoordinatorConfig, CoordinatorEvent, SnapshotCoordinator};
pub use features::{stable_hash, FeatureVector};
pub use sink::{CsvSink, LabelSink, SinkError, CSV_HEADER};
pub use snapshot::{LabelEvent, LabeledRecord, Snapshot, SnapshotState, TriggerSource};
