//! Adaptive gating of snapshot prompts.
//!
//! On every idle tick the gate asks the decision service about the current
//! sample. A confident "not productive" fires a snapshot right away, a
//! confident "productive" suppresses the interval check for that tick, and
//! anything else leaves the plain interval in charge.

pub mod client;
pub mod stats;

pub use client::{
    parse_response, DecisionError, DecisionService, Prediction, PredictionFuture,
    TcpDecisionClient, DEFAULT_DECISION_TIMEOUT,
};
pub use stats::{GateStats, GateStatsSnapshot};

use crate::collector::types::ActivitySample;
use crate::core::features::FeatureVector;
use std::sync::Arc;
use std::time::Duration;

/// Default minimum confidence for the gate to override the interval.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.98;

/// What the sampling loop should do this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    /// Request a snapshot now, ignoring remaining interval time
    TriggerNow,
    /// Skip the interval check for this tick only
    Suppress,
    /// No instruction; the interval decides
    Defer(DeferReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    Unavailable,
    LowConfidence,
}

/// Pure gating policy.
///
/// A confidence exactly equal to `threshold` meets it.
pub fn decide(prediction: Option<Prediction>, threshold: f64) -> GateVerdict {
    match prediction {
        None => GateVerdict::Defer(DeferReason::Unavailable),
        Some(p) if p.confidence >= threshold => {
            if p.is_productive {
                GateVerdict::Suppress
            } else {
                GateVerdict::TriggerNow
            }
        }
        Some(_) => GateVerdict::Defer(DeferReason::LowConfidence),
    }
}

/// Couples a [`DecisionService`] with the gating policy and its counters.
pub struct AdaptiveGate {
    service: Arc<dyn DecisionService>,
    threshold: f64,
    timeout: Duration,
    stats: GateStats,
}

impl AdaptiveGate {
    pub fn new(service: Arc<dyn DecisionService>, threshold: f64, timeout: Duration) -> Self {
        Self {
            service,
            threshold,
            timeout,
            stats: GateStats::new(),
        }
    }

    /// Bound on one `evaluate` call.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn stats(&self) -> &GateStats {
        &self.stats
    }

    /// Ask for a prediction and turn it into a verdict.
    ///
    /// Never fails and never waits longer than the gate's timeout.
    pub async fn evaluate(&self, sample: &ActivitySample) -> GateVerdict {
        let features = FeatureVector::from_sample(sample);

        let prediction = match tokio::time::timeout(self.timeout, self.service.predict(&features))
            .await
        {
            Ok(Ok(prediction)) => Some(prediction),
            Ok(Err(e)) => {
                tracing::debug!("No prediction, falling back to interval: {}", e);
                None
            }
            Err(_) => {
                tracing::debug!("Decision service exceeded {:?}", self.timeout);
                None
            }
        };

        if let Some(p) = prediction {
            self.stats.record_prediction(p.confidence);
        }

        let verdict = decide(prediction, self.threshold);
        match verdict {
            GateVerdict::TriggerNow => self.stats.record_trigger(),
            GateVerdict::Suppress => self.stats.record_skip(),
            GateVerdict::Defer(reason) => {
                self.stats.record_fallback(reason == DeferReason::Unavailable)
            }
        }

        tracing::debug!(
            "Gate verdict {:?} for {} (confidence {:?})",
            verdict,
            sample.application,
            prediction.map(|p| p.confidence)
        );
        verdict
    }
}

impl std::fmt::Debug for AdaptiveGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveGate")
            .field("threshold", &self.threshold)
            .field("timeout", &self.timeout)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
