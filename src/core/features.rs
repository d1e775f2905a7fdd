//! Feature derivation from activity samples.
//!
//! The decision service and the persisted log both see a sample as three
//! numbers: a stable hash of the application identifier, idle milliseconds,
//! and attention-span milliseconds. Field names match the columns the
//! training scripts read.

use crate::collector::types::ActivitySample;
use serde::{Deserialize, Serialize};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Hash an application identifier to a stable integer.
///
/// 32-bit FNV-1a over the UTF-8 bytes. The result depends only on the
/// input string, never on the platform, process, or a random seed, so rows
/// written by different runs and machines stay comparable.
pub fn stable_hash(identifier: &str) -> u32 {
    identifier.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Numeric view of an [`ActivitySample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureVector {
    /// Stable hash of the application identifier
    pub foreground_app: u32,
    /// Idle milliseconds
    pub idle_time: u64,
    /// Attention-span milliseconds
    pub time_last_request: u64,
}

impl FeatureVector {
    pub fn from_sample(sample: &ActivitySample) -> Self {
        Self {
            foreground_app: stable_hash(&sample.application),
            idle_time: sample.idle_ms,
            time_last_request: sample.attention_span_ms,
        }
    }
}

impl From<&ActivitySample> for FeatureVector {
    fn from(sample: &ActivitySample) -> Self {
        Self::from_sample(sample)
    }
}
