//! The snapshot state machine.
//!
//! ```text
//!            trigger (Interval | Gate | Remote)
//!   Idle ───────────────────────────────────────▶ Pending
//!    ▲                                              │
//!    │   label ─▶ Labeled (row persisted)           │
//!    └───────────  deadline ─▶ TimedOut ◀───────────┘
//!                  shutdown ─▶ Discarded ─▶ Closed
//! ```
//!
//! All state lives behind one mutex shared by the sampling loop, the
//! response listener and the deadline task. While Idle the interval clock
//! runs; while Pending only the deadline timer runs. The deadline task is
//! aborted when a label wins the race, and `expire` re-checks the sequence
//! number under the lock in case the abort arrives too late.
//!
//! Events are published while the lock is held, so subscribers see
//! transitions in the order they happened: a `Labeled` is never overtaken
//! by the `Requested` of the next snapshot.

use crate::collector::types::ActivitySample;
use crate::core::sink::LabelSink;
use crate::core::snapshot::{LabelEvent, LabeledRecord, Snapshot, SnapshotState, TriggerSource};
use crate::transparency::SharedTransparencyLog;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::Instant;

const EVENT_CAPACITY: usize = 64;

/// Timing parameters for the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Time spent Idle before the plain interval requests a snapshot
    pub interval: Duration,
    /// How long a Pending snapshot waits for a label
    pub response_deadline: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            response_deadline: Duration::from_secs(60),
        }
    }
}

/// Observable transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    Requested(Snapshot),
    Labeled(Snapshot),
    TimedOut(Snapshot),
    Discarded(Snapshot),
}

impl CoordinatorEvent {
    pub fn snapshot(&self) -> &Snapshot {
        match self {
            CoordinatorEvent::Requested(s)
            | CoordinatorEvent::Labeled(s)
            | CoordinatorEvent::TimedOut(s)
            | CoordinatorEvent::Discarded(s) => s,
        }
    }
}

#[derive(Debug)]
enum Phase {
    Idle { interval_anchor: Instant },
    Pending { snapshot: Snapshot, deadline: AbortHandle },
    Closed,
}

#[derive(Debug)]
struct State {
    phase: Phase,
    next_sequence: u64,
}

struct Inner {
    config: CoordinatorConfig,
    state: Mutex<State>,
    sink: Arc<dyn LabelSink>,
    events: broadcast::Sender<CoordinatorEvent>,
    log: SharedTransparencyLog,
}

/// Owns the current snapshot and enforces single-flight.
///
/// Cheap to clone; all clones share one state. Methods that create a
/// snapshot spawn its deadline timer and must run inside a tokio runtime.
#[derive(Clone)]
pub struct SnapshotCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SnapshotCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCoordinator")
            .field("config", &self.inner.config)
            .field("state", &*self.lock())
            .finish()
    }
}

impl SnapshotCoordinator {
    /// Start Idle with the interval clock anchored at now.
    pub fn new(
        config: CoordinatorConfig,
        sink: Arc<dyn LabelSink>,
        log: SharedTransparencyLog,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    phase: Phase::Idle {
                        interval_anchor: Instant::now(),
                    },
                    next_sequence: 1,
                }),
                sink,
                events,
                log,
            }),
        }
    }

    pub fn config(&self) -> CoordinatorConfig {
        self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.lock().phase, Phase::Idle { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.lock().phase, Phase::Closed)
    }

    /// The Pending snapshot, if any.
    pub fn pending(&self) -> Option<Snapshot> {
        match &self.lock().phase {
            Phase::Pending { snapshot, .. } => Some(snapshot.clone()),
            _ => None,
        }
    }

    /// Whether the plain interval has run out at `now`. Always false unless
    /// Idle.
    pub fn interval_elapsed(&self, now: Instant) -> bool {
        match self.lock().phase {
            Phase::Idle { interval_anchor } => {
                now.saturating_duration_since(interval_anchor) >= self.inner.config.interval
            }
            _ => false,
        }
    }

    /// Time left on the interval clock, if Idle.
    pub fn interval_remaining(&self, now: Instant) -> Option<Duration> {
        match self.lock().phase {
            Phase::Idle { interval_anchor } => Some(
                self.inner
                    .config
                    .interval
                    .saturating_sub(now.saturating_duration_since(interval_anchor)),
            ),
            _ => None,
        }
    }

    /// Request a label for `sample`.
    ///
    /// Returns the new Pending snapshot, or `None` when one is already
    /// Pending or the coordinator is closed.
    pub fn trigger(&self, source: TriggerSource, sample: ActivitySample) -> Option<Snapshot> {
        let snapshot = {
            let mut state = self.lock();
            if !matches!(state.phase, Phase::Idle { .. }) {
                tracing::debug!("Ignoring {:?} trigger, coordinator not idle", source);
                return None;
            }

            let sequence = state.next_sequence;
            state.next_sequence += 1;

            let snapshot = Snapshot::pending(sequence, sample, source);
            let deadline = self.spawn_deadline(sequence);
            state.phase = Phase::Pending {
                snapshot: snapshot.clone(),
                deadline,
            };
            self.publish(CoordinatorEvent::Requested(snapshot.clone()));
            snapshot
        };

        tracing::info!(
            "Snapshot #{} requested ({:?}): app={} idle={}ms attention={}ms",
            snapshot.sequence,
            source,
            snapshot.sample.application,
            snapshot.sample.idle_ms,
            snapshot.sample.attention_span_ms
        );
        self.inner.log.record_snapshot_requested();
        Some(snapshot)
    }

    /// Resolve the Pending snapshot with the user's answer.
    ///
    /// Returns the Labeled snapshot, or `None` when nothing was Pending. The
    /// row is written after the state transition and the `Labeled` event; a
    /// write failure is reported but does not revert either.
    ///
    /// Writing the row calls the sink on the current thread. `CsvSink`
    /// appends one short line to a local file, which callers on async
    /// tasks accept; a slower sink should hand the write off itself.
    pub fn on_label(&self, label: LabelEvent) -> Option<Snapshot> {
        let labeled = {
            let mut state = self.lock();
            let snapshot = match Self::take_pending(&mut state) {
                Some((snapshot, deadline)) => {
                    deadline.abort();
                    snapshot
                }
                None => {
                    tracing::debug!("Ignoring label, no snapshot pending");
                    return None;
                }
            };
            state.phase = Phase::Idle {
                interval_anchor: Instant::now(),
            };
            let labeled = snapshot.resolve(SnapshotState::Labeled);
            self.publish(CoordinatorEvent::Labeled(labeled.clone()));
            labeled
        };

        self.inner.log.record_label(label.productive);
        let record = LabeledRecord::new(&labeled.sample, &label);
        match self.inner.sink.persist(&record) {
            Ok(()) => {
                self.inner.log.record_row_written();
                tracing::info!(
                    "Snapshot #{} labeled {}",
                    labeled.sequence,
                    if label.productive { "productive" } else { "not productive" }
                );
            }
            Err(e) => {
                self.inner.log.record_persist_failure();
                tracing::warn!("Snapshot #{} labeled but not saved: {}", labeled.sequence, e);
            }
        }
        Some(labeled)
    }

    /// Time out the snapshot with `sequence` if it is still Pending.
    pub fn expire(&self, sequence: u64) -> Option<Snapshot> {
        let timed_out = {
            let mut state = self.lock();
            match &state.phase {
                Phase::Pending { snapshot, .. } if snapshot.sequence == sequence => {}
                _ => return None,
            }
            let (snapshot, _) = Self::take_pending(&mut state)?;
            state.phase = Phase::Idle {
                interval_anchor: Instant::now(),
            };
            let timed_out = snapshot.resolve(SnapshotState::TimedOut);
            self.publish(CoordinatorEvent::TimedOut(timed_out.clone()));
            timed_out
        };

        tracing::info!("Snapshot #{} timed out without a response", timed_out.sequence);
        self.inner.log.record_timeout();
        Some(timed_out)
    }

    /// Discard any Pending snapshot and refuse further triggers.
    pub fn shutdown(&self) -> Option<Snapshot> {
        let discarded = {
            let mut state = self.lock();
            let pending = Self::take_pending(&mut state);
            state.phase = Phase::Closed;
            let (snapshot, deadline) = pending?;
            deadline.abort();
            let discarded = snapshot.resolve(SnapshotState::Discarded);
            self.publish(CoordinatorEvent::Discarded(discarded.clone()));
            discarded
        };

        tracing::info!("Snapshot #{} discarded at shutdown", discarded.sequence);
        self.inner.log.record_discarded();
        Some(discarded)
    }

    fn spawn_deadline(&self, sequence: u64) -> AbortHandle {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let deadline = self.inner.config.response_deadline;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(inner) = weak.upgrade() {
                SnapshotCoordinator { inner }.expire(sequence);
            }
        })
        .abort_handle()
    }

    /// Move out of Pending, leaving Closed as a placeholder the caller
    /// overwrites.
    fn take_pending(state: &mut State) -> Option<(Snapshot, AbortHandle)> {
        if !matches!(state.phase, Phase::Pending { .. }) {
            return None;
        }
        match std::mem::replace(&mut state.phase, Phase::Closed) {
            Phase::Pending { snapshot, deadline } => Some((snapshot, deadline)),
            _ => None,
        }
    }

    fn publish(&self, event: CoordinatorEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
