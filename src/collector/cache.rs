//! Short-lived memoization in front of a foreground probe.
//!
//! Application identity and idle time are cached independently, each with
//! its own expiry. The lock for a query is held while the underlying probe
//! runs, so readers racing within one window trigger exactly one probe call
//! and all observe the same value. Failures are cached like successes for
//! the same reason.

use crate::collector::types::Backend;
use crate::collector::{CollectorError, ForegroundProbe};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Default expiry for the foreground application.
pub const DEFAULT_APP_TTL: Duration = Duration::from_millis(500);

/// Default expiry for idle time, which changes faster and is cheaper to ask.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct Cached<T> {
    value: Result<T, CollectorError>,
    captured_at: Instant,
}

type Slot<T> = Mutex<Option<Cached<T>>>;

/// A [`ForegroundProbe`] decorator that caches both queries.
#[derive(Debug)]
pub struct SampleCache<P> {
    inner: P,
    app_ttl: Duration,
    idle_ttl: Duration,
    application: Slot<String>,
    idle: Slot<Duration>,
}

impl<P: ForegroundProbe> SampleCache<P> {
    /// Wrap `inner` with the default expiries.
    pub fn new(inner: P) -> Self {
        Self::with_ttls(inner, DEFAULT_APP_TTL, DEFAULT_IDLE_TTL)
    }

    /// Wrap `inner` with explicit expiries. A zero TTL disables caching for
    /// that query.
    pub fn with_ttls(inner: P, app_ttl: Duration, idle_ttl: Duration) -> Self {
        Self {
            inner,
            app_ttl,
            idle_ttl,
            application: Mutex::new(None),
            idle: Mutex::new(None),
        }
    }

    /// Drop both cached values.
    pub fn invalidate(&self) {
        *self.application.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *self.idle.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Borrow the wrapped probe.
    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: ForegroundProbe> ForegroundProbe for SampleCache<P> {
    fn backend(&self) -> Backend {
        self.inner.backend()
    }

    fn query_application(&self) -> Result<String, CollectorError> {
        cached_query(&self.application, self.app_ttl, || {
            self.inner.query_application()
        })
    }

    fn query_idle(&self) -> Result<Duration, CollectorError> {
        cached_query(&self.idle, self.idle_ttl, || self.inner.query_idle())
    }
}

fn cached_query<T, F>(slot: &Slot<T>, ttl: Duration, query: F) -> Result<T, CollectorError>
where
    T: Clone,
    F: FnOnce() -> Result<T, CollectorError>,
{
    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(cached) = guard.as_ref() {
        if cached.captured_at.elapsed() < ttl {
            return cached.value.clone();
        }
    }

    let value = query();
    *guard = Some(Cached {
        value: value.clone(),
        captured_at: Instant::now(),
    });
    value
}
