//! Gate diagnostics.
//!
//! Read-only observability state: nothing here feeds back into gating.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Confidence is accumulated in millionths so it fits an atomic integer.
const CONFIDENCE_SCALE: f64 = 1_000_000.0;

/// Running counters for the adaptive gate.
#[derive(Debug, Default)]
pub struct GateStats {
    predictions: AtomicU64,
    triggers: AtomicU64,
    skips: AtomicU64,
    fallbacks: AtomicU64,
    unavailable: AtomicU64,
    confidence_micros: AtomicU64,
}

impl GateStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_prediction(&self, confidence: f64) {
        self.predictions.fetch_add(1, Ordering::Relaxed);
        let micros = (confidence.clamp(0.0, 1.0) * CONFIDENCE_SCALE).round() as u64;
        self.confidence_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub(crate) fn record_trigger(&self) {
        self.triggers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skip(&self) {
        self.skips.fetch_add(1, Ordering::Relaxed);
    }

    /// A tick left to the interval, `unavailable` when no prediction came back.
    pub(crate) fn record_fallback(&self, unavailable: bool) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        if unavailable {
            self.unavailable.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> GateStatsSnapshot {
        let predictions = self.predictions.load(Ordering::Relaxed);
        let confidence_micros = self.confidence_micros.load(Ordering::Relaxed);
        let average_confidence = if predictions == 0 {
            0.0
        } else {
            confidence_micros as f64 / CONFIDENCE_SCALE / predictions as f64
        };

        GateStatsSnapshot {
            predictions,
            triggers: self.triggers.load(Ordering::Relaxed),
            skips: self.skips.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            average_confidence,
        }
    }

    pub fn summary(&self) -> String {
        let s = self.snapshot();
        format!(
            "Adaptive Gate:\n\
             - Predictions: {} (avg confidence {:.1}%)\n\
             - Early triggers: {}\n\
             - Suppressed ticks: {}\n\
             - Interval fallbacks: {} ({} service unavailable)",
            s.predictions,
            s.average_confidence * 100.0,
            s.triggers,
            s.skips,
            s.fallbacks,
            s.unavailable
        )
    }
}

/// Point-in-time copy of [`GateStats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateStatsSnapshot {
    pub predictions: u64,
    pub triggers: u64,
    pub skips: u64,
    pub fallbacks: u64,
    pub unavailable: u64,
    pub average_confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_confidence() {
        let stats = GateStats::new();
        assert_eq!(stats.snapshot().average_confidence, 0.0);

        stats.record_prediction(0.9);
        stats.record_prediction(0.7);
        let s = stats.snapshot();
        assert_eq!(s.predictions, 2);
        assert!((s.average_confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_fallback_counts() {
        let stats = GateStats::new();
        stats.record_fallback(true);
        stats.record_fallback(false);
        stats.record_trigger();
        stats.record_skip();

        let s = stats.snapshot();
        assert_eq!(s.fallbacks, 2);
        assert_eq!(s.unavailable, 1);
        assert_eq!(s.triggers, 1);
        assert_eq!(s.skips, 1);
        assert!(stats.summary().contains("Early triggers: 1"));
    }
}
