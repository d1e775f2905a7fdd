//! Attention-span tracking on top of a foreground probe.

use crate::collector::types::{ActivitySample, Backend, UNKNOWN_APPLICATION};
use crate::collector::ForegroundProbe;
use std::time::Duration;

/// The capability set the sampling loop needs from the desktop.
///
/// Queries never fail: a broken probe yields the sentinel application and
/// zero idle time so the sampling loop keeps running.
pub trait ActivitySource: Send {
    /// Identifier of the focused application, or [`UNKNOWN_APPLICATION`].
    fn current_application(&self) -> String;

    /// Time since the last user input, or zero if unknown.
    fn idle_duration(&self) -> Duration;

    /// Continuous time the current application has held focus.
    fn attention_span(&self) -> Duration;

    /// Account for one sampling tick of length `tick`.
    fn advance(&mut self, tick: Duration);

    /// Capture the current values as a sample.
    fn sample(&self) -> ActivitySample {
        ActivitySample::new(
            self.current_application(),
            self.idle_duration(),
            self.attention_span(),
        )
    }
}

/// Turns a [`ForegroundProbe`] into an [`ActivitySource`].
///
/// Attention span resets to zero whenever the application reported on a
/// tick differs from the previous tick's, and otherwise grows by the tick
/// length.
#[derive(Debug)]
pub struct ActivityTracker<P> {
    probe: P,
    last_application: Option<String>,
    attention_span: Duration,
}

impl<P: ForegroundProbe> ActivityTracker<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe,
            last_application: None,
            attention_span: Duration::ZERO,
        }
    }

    pub fn backend(&self) -> Backend {
        self.probe.backend()
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }
}

impl<P: ForegroundProbe> ActivitySource for ActivityTracker<P> {
    fn current_application(&self) -> String {
        match self.probe.query_application() {
            Ok(app) => app,
            Err(e) => {
                tracing::debug!("Foreground application query failed: {}", e);
                UNKNOWN_APPLICATION.to_string()
            }
        }
    }

    fn idle_duration(&self) -> Duration {
        match self.probe.query_idle() {
            Ok(idle) => idle,
            Err(e) => {
                tracing::debug!("Idle time query failed: {}", e);
                Duration::ZERO
            }
        }
    }

    fn attention_span(&self) -> Duration {
        self.attention_span
    }

    fn advance(&mut self, tick: Duration) {
        let application = self.current_application();
        match &self.last_application {
            Some(previous) if *previous == application => {
                self.attention_span = self.attention_span.saturating_add(tick);
            }
            _ => {
                if let Some(previous) = &self.last_application {
                    tracing::debug!("Focus moved from {} to {}", previous, application);
                }
                self.attention_span = Duration::ZERO;
                self.last_application = Some(application);
            }
        }
    }
}

impl<S: ActivitySource + ?Sized> ActivitySource for Box<S> {
    fn current_application(&self) -> String {
        (**self).current_application()
    }

    fn idle_duration(&self) -> Duration {
        (**self).idle_duration()
    }

    fn attention_span(&self) -> Duration {
        (**self).attention_span()
    }

    fn advance(&mut self, tick: Duration) {
        (**self).advance(tick)
    }

    fn sample(&self) -> ActivitySample {
        (**self).sample()
    }
}
