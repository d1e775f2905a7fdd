//! Snapshot and label types.
//!
//! A snapshot binds one activity sample to one labeling prompt. It starts
//! out pending and ends in exactly one terminal state; a resolved snapshot
//! is a new value, never a mutation of the pending one.

use crate::collector::types::ActivitySample;
use crate::core::features::FeatureVector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    /// Waiting for the user's answer
    Pending,
    /// Answered before the deadline
    Labeled,
    /// Deadline passed without an answer
    TimedOut,
    /// Abandoned because the harvester shut down
    Discarded,
}

impl SnapshotState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SnapshotState::Pending)
    }
}

/// What caused a snapshot to be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// The plain interval elapsed
    Interval,
    /// The adaptive gate saw a confident "not productive" prediction
    Gate,
    /// A cooperating process sent `SNAP`
    Remote,
}

/// One labeling prompt and the sample it asks about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sequence: u64,
    pub sample: ActivitySample,
    pub state: SnapshotState,
    pub source: TriggerSource,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub(crate) fn pending(sequence: u64, sample: ActivitySample, source: TriggerSource) -> Self {
        Self {
            sequence,
            sample,
            state: SnapshotState::Pending,
            source,
            requested_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Produce the terminal form of a pending snapshot.
    pub(crate) fn resolve(self, state: SnapshotState) -> Self {
        debug_assert_eq!(self.state, SnapshotState::Pending);
        debug_assert!(state.is_terminal());
        Self {
            state,
            resolved_at: Some(Utc::now()),
            ..self
        }
    }
}

/// The user's answer to a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEvent {
    pub productive: bool,
    pub received_at: DateTime<Utc>,
}

impl LabelEvent {
    pub fn new(productive: bool) -> Self {
        Self {
            productive,
            received_at: Utc::now(),
        }
    }

    pub fn productive() -> Self {
        Self::new(true)
    }

    pub fn unproductive() -> Self {
        Self::new(false)
    }
}

/// One row of the persisted log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledRecord {
    #[serde(flatten)]
    pub features: FeatureVector,
    /// 1 = productive, 0 = not productive
    pub productive: u8,
}

impl LabeledRecord {
    pub fn new(sample: &ActivitySample, label: &LabelEvent) -> Self {
        Self {
            features: FeatureVector::from_sample(sample),
            productive: u8::from(label.productive),
        }
    }
}
