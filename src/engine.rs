//! The sampling loop and the wiring around it.
//!
//! [`Harvester`] owns one tick of behaviour: sample the desktop, let the
//! adaptive gate have its say, and fall back to the plain interval. The
//! response listener runs beside it and resolves labels directly on the
//! coordinator, so an answer never waits for the next tick. [`Engine`]
//! builds every component from a [`Config`] and tears them down in order;
//! [`run`] does both in one call.

use crate::collector::command::command_budget;
use crate::collector::{probe_for, ActivitySample, ActivitySource, ActivityTracker, Backend, SampleCache};
use crate::config::Config;
use crate::core::{
    CoordinatorConfig, CoordinatorEvent, CsvSink, LabelEvent, Snapshot, SnapshotCoordinator,
    TriggerSource,
};
use crate::gate::{AdaptiveGate, DecisionService, GateVerdict, TcpDecisionClient};
use crate::protocol::{send_token, ProtocolError, ResponseListener, Token, TokenHandler};
use crate::supervisor::{
    ProcessState, ProcessSupervisor, ServiceHandle, ServiceKind, ServiceSpec, SupervisorConfig,
};
use crate::transparency::{
    create_shared_log_with_persistence, SharedTransparencyLog, TransparencyStats,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A snapshot was requested
    Triggered { sequence: u64, source: TriggerSource },
    /// The gate was confident the user is productive; interval not checked
    Suppressed,
    /// Idle, interval not yet elapsed
    Waiting,
    /// A snapshot is already pending
    Busy,
}

type SharedSource = Arc<Mutex<Box<dyn ActivitySource>>>;

/// The sampling engine.
pub struct Harvester {
    tick: Duration,
    sample_timeout: Duration,
    source: SharedSource,
    coordinator: SnapshotCoordinator,
    gate: Option<Arc<AdaptiveGate>>,
}

impl Harvester {
    pub fn new(
        source: Box<dyn ActivitySource>,
        coordinator: SnapshotCoordinator,
        tick: Duration,
    ) -> Self {
        Self {
            tick,
            sample_timeout: tick,
            source: Arc::new(Mutex::new(source)),
            coordinator,
            gate: None,
        }
    }

    /// Consult `gate` every tick. Desktop queries are bounded to
    /// [`sample_budget`] so that sampling and the gate together fit a tick.
    pub fn with_gate(mut self, gate: AdaptiveGate) -> Self {
        self.sample_timeout = self
            .sample_timeout
            .min(sample_budget(self.tick, Some(gate.timeout())));
        self.gate = Some(Arc::new(gate));
        self
    }

    /// Bound on one desktop query. Defaults to the tick length, less the
    /// gate's timeout when there is a gate.
    pub fn with_sample_timeout(mut self, timeout: Duration) -> Self {
        self.sample_timeout = timeout;
        self
    }

    pub fn coordinator(&self) -> &SnapshotCoordinator {
        &self.coordinator
    }

    pub fn gate(&self) -> Option<&AdaptiveGate> {
        self.gate.as_deref()
    }

    /// A [`TokenHandler`] that resolves labels on this harvester's
    /// coordinator and forwards `SNAP` to `snap_requests`.
    pub fn response_handler(&self, snap_requests: mpsc::Sender<()>) -> ResponseHandler {
        ResponseHandler {
            coordinator: self.coordinator.clone(),
            snap_requests,
        }
    }

    /// Run one tick.
    pub async fn tick(&self) -> TickOutcome {
        let sample = self.capture(Some(self.tick)).await;

        if !self.coordinator.is_idle() {
            return TickOutcome::Busy;
        }

        if let Some(gate) = &self.gate {
            match gate.evaluate(&sample).await {
                GateVerdict::TriggerNow => return self.trigger(TriggerSource::Gate, sample),
                GateVerdict::Suppress => return TickOutcome::Suppressed,
                GateVerdict::Defer(_) => {}
            }
        }

        if self.coordinator.interval_elapsed(Instant::now()) {
            return self.trigger(TriggerSource::Interval, sample);
        }
        TickOutcome::Waiting
    }

    /// Handle a `SNAP` from a cooperating process.
    pub async fn request_snapshot(&self) -> Option<Snapshot> {
        if !self.coordinator.is_idle() {
            tracing::debug!("Ignoring SNAP, snapshot already pending");
            return None;
        }
        let sample = self.capture(None).await;
        self.coordinator.trigger(TriggerSource::Remote, sample)
    }

    fn trigger(&self, source: TriggerSource, sample: ActivitySample) -> TickOutcome {
        match self.coordinator.trigger(source, sample) {
            Some(snapshot) => TickOutcome::Triggered {
                sequence: snapshot.sequence,
                source,
            },
            None => TickOutcome::Busy,
        }
    }

    /// Sample the desktop off the async threads, advancing attention span
    /// by `advance` first. A slow or panicking source yields the unknown
    /// sample, and so does a source still busy with an earlier query.
    async fn capture(&self, advance: Option<Duration>) -> ActivitySample {
        let source = Arc::clone(&self.source);
        let query = tokio::task::spawn_blocking(move || {
            let mut source = match source.try_lock() {
                Ok(source) => source,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return None,
            };
            if let Some(tick) = advance {
                source.advance(tick);
            }
            Some(source.sample())
        });

        match tokio::time::timeout(self.sample_timeout, query).await {
            Ok(Ok(Some(sample))) => sample,
            Ok(Ok(None)) => {
                tracing::debug!("Previous activity query still running, skipping sample");
                ActivitySample::unknown()
            }
            Ok(Err(e)) => {
                tracing::warn!("Activity sampling failed: {}", e);
                ActivitySample::unknown()
            }
            Err(_) => {
                tracing::warn!("Activity sampling exceeded {:?}", self.sample_timeout);
                ActivitySample::unknown()
            }
        }
    }

    /// Tick until `cancel` fires, serving the response channel alongside.
    ///
    /// When `notify_addr` is set, `SNAP` is sent there for every requested
    /// snapshot.
    pub async fn run(
        &self,
        listener: ResponseListener,
        notify_addr: Option<SocketAddr>,
        cancel: CancellationToken,
    ) {
        let (snap_tx, mut snap_rx) = mpsc::channel(1);
        let listener_task = tokio::spawn(listener.run(self.response_handler(snap_tx), cancel.clone()));
        let notifier_task = notify_addr.map(|addr| {
            tokio::spawn(forward_requests(
                self.coordinator.subscribe(),
                addr,
                cancel.clone(),
            ))
        });

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            "Sampling every {:?}, prompting every {:?}{}",
            self.tick,
            self.coordinator.config().interval,
            if self.gate.is_some() { " (adaptive)" } else { "" }
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Sampling loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let outcome = self.tick().await;
                    tracing::debug!("Tick: {:?}", outcome);
                }
                Some(()) = snap_rx.recv() => {
                    self.request_snapshot().await;
                }
            }
        }

        if let Err(e) = listener_task.await {
            tracing::warn!("Response listener task failed: {}", e);
        }
        if let Some(task) = notifier_task {
            if let Err(e) = task.await {
                tracing::warn!("Notifier task failed: {}", e);
            }
        }
    }
}

/// Resolves labels immediately and hands `SNAP` to the sampling loop,
/// which owns the activity source.
///
/// Labels resolve on the listener task, including the row write of
/// [`SnapshotCoordinator::on_label`].
#[derive(Debug, Clone)]
pub struct ResponseHandler {
    coordinator: SnapshotCoordinator,
    snap_requests: mpsc::Sender<()>,
}

impl TokenHandler for ResponseHandler {
    fn on_token(&self, token: Token, _from: SocketAddr) {
        match token.label() {
            Some(productive) => {
                self.coordinator.on_label(LabelEvent::new(productive));
            }
            None => {
                // A full queue already holds a SNAP; single-flight drops the rest anyway.
                let _ = self.snap_requests.try_send(());
            }
        }
    }
}

async fn forward_requests(
    mut events: broadcast::Receiver<CoordinatorEvent>,
    addr: SocketAddr,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(CoordinatorEvent::Requested(snapshot)) => {
                if let Err(e) = send_token(addr, Token::Snap).await {
                    tracing::warn!("Could not notify {} of snapshot #{}: {}", addr, snapshot.sequence, e);
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("Notifier skipped {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Knobs for [`run`] that are not part of the persisted configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Launch the inference and trainer processes when ML is enabled
    pub start_services: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            start_services: true,
        }
    }
}

/// Time one desktop query may take within a tick of length `tick`,
/// leaving room for a gate that may wait up to `gate_timeout`.
pub fn sample_budget(tick: Duration, gate_timeout: Option<Duration>) -> Duration {
    match gate_timeout {
        Some(timeout) => tick.saturating_sub(timeout).max(tick / 2),
        None => tick,
    }
}

/// A fully wired harvester, ready to run.
pub struct Engine {
    harvester: Harvester,
    listener: ResponseListener,
    notify_addr: Option<SocketAddr>,
    log: SharedTransparencyLog,
    services: Option<(ProcessSupervisor, Duration)>,
}

impl Engine {
    /// Build every component from `config` and bind the response channel.
    pub async fn build(config: &Config, options: RunOptions) -> Result<Self, EngineError> {
        config.validate().map_err(|e| EngineError::Config(e.to_string()))?;
        if let Err(e) = config.ensure_directories() {
            tracing::warn!("Could not create data directories: {}", e);
        }

        let log = create_shared_log_with_persistence(config.stats_path());

        let budget = sample_budget(
            config.tick,
            config.ml_enabled.then(|| config.decision_timeout()),
        );
        let backend = Backend::detect();
        tracing::info!("Activity backend: {} (sample budget {:?})", backend, budget);
        let probe = SampleCache::with_ttls(
            probe_for(backend, command_budget(budget)),
            config.app_cache_ttl(),
            config.idle_cache_ttl(),
        );
        let source: Box<dyn ActivitySource> = Box::new(ActivityTracker::new(probe));

        let coordinator = SnapshotCoordinator::new(
            CoordinatorConfig {
                interval: config.interval(),
                response_deadline: config.response_deadline,
            },
            Arc::new(CsvSink::new(&config.log_path)),
            log.clone(),
        );

        let listener = ResponseListener::bind(config.listen_addr).await?;

        let mut harvester =
            Harvester::new(source, coordinator, config.tick).with_sample_timeout(budget);
        let mut services = None;

        if config.ml_enabled {
            let mut client =
                TcpDecisionClient::new(config.inference_addr, config.decision_timeout());

            if options.start_services {
                let supervisor = build_supervisor(config);
                if let Some(state) = supervisor.subscribe(ServiceKind::Inference) {
                    client = client.with_availability(state);
                }
                services = Some((supervisor, config.services.health_interval));
            }

            let service: Arc<dyn DecisionService> = Arc::new(client);
            harvester = harvester.with_gate(AdaptiveGate::new(
                service,
                config.confidence_threshold,
                config.decision_timeout(),
            ));
        }

        Ok(Self {
            harvester,
            listener,
            notify_addr: config.notify_addr,
            log,
            services,
        })
    }

    pub fn coordinator(&self) -> &SnapshotCoordinator {
        self.harvester.coordinator()
    }

    /// Where the response channel is listening.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Follow a supervised service. `None` without ML or services.
    pub fn service_state(&self, kind: ServiceKind) -> Option<watch::Receiver<ProcessState>> {
        self.services
            .as_ref()
            .and_then(|(supervisor, _)| supervisor.subscribe(kind))
    }

    /// Run until `cancel` fires.
    ///
    /// Shutdown order: the sampling loop stops, the trainer and then the
    /// inference service are stopped, and only then is any pending snapshot
    /// discarded and the session statistics saved.
    pub async fn run(self, cancel: CancellationToken) -> TransparencyStats {
        let Engine {
            harvester,
            listener,
            notify_addr,
            log,
            services,
        } = self;

        let services = services.map(|(supervisor, health_interval)| {
            tokio::spawn(supervise(supervisor, health_interval, cancel.clone()))
        });

        harvester.run(listener, notify_addr, cancel).await;

        if let Some(task) = services {
            if let Err(e) = task.await {
                tracing::warn!("Service supervision task failed: {}", e);
            }
        }

        harvester.coordinator().shutdown();

        if let Some(gate) = harvester.gate() {
            tracing::info!("{}", gate.stats().summary());
        }
        tracing::info!("{}", log.summary());
        if let Err(e) = log.save() {
            tracing::warn!("Could not save session statistics: {}", e);
        }

        log.stats()
    }
}

/// Run the harvester until `cancel` fires. See [`Engine::run`].
pub async fn run(
    config: Config,
    options: RunOptions,
    cancel: CancellationToken,
) -> Result<TransparencyStats, EngineError> {
    let engine = Engine::build(&config, options).await?;
    Ok(engine.run(cancel).await)
}

fn build_supervisor(config: &Config) -> ProcessSupervisor {
    let services = &config.services;
    let supervisor_config = SupervisorConfig {
        grace_period: services.grace_period,
        stop_timeout: services.stop_timeout,
        ..SupervisorConfig::default()
    };

    let mut trainer = ServiceSpec::trainer(
        &services.python,
        &services.script_dir,
        &config.log_path,
        &services.model_dir,
    );
    trainer.endpoint = services.trainer_endpoint;

    ProcessSupervisor::new(supervisor_config)
        .with_service(
            ServiceKind::Inference,
            ServiceSpec::inference(
                &services.python,
                &services.script_dir,
                config.inference_addr,
                &services.model_dir,
            ),
        )
        .with_service(ServiceKind::Trainer, trainer)
}

/// Start both services, watch them until `cancel`, then stop the trainer
/// before the inference service.
async fn supervise(
    supervisor: ProcessSupervisor,
    health_interval: Duration,
    cancel: CancellationToken,
) {
    let mut handles: Vec<ServiceHandle> = Vec::new();
    for kind in [ServiceKind::Inference, ServiceKind::Trainer] {
        if cancel.is_cancelled() {
            break;
        }
        match supervisor.start(kind).await {
            Ok(handle) => handles.push(handle),
            Err(e) => tracing::warn!("{}", e),
        }
    }

    supervisor
        .monitor(&mut handles, health_interval, &cancel)
        .await;

    handles.sort_by_key(|h| match h.kind() {
        ServiceKind::Trainer => 0,
        ServiceKind::Inference => 1,
    });
    for handle in handles.iter_mut() {
        supervisor.stop(handle).await;
    }
}

/// Startup failures of the engine.
#[derive(Debug)]
pub enum EngineError {
    Config(String),
    Protocol(ProtocolError),
}

impl From<ProtocolError> for EngineError {
    fn from(e: ProtocolError) -> Self {
        EngineError::Protocol(e)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Config(e) => write!(f, "Configuration error: {e}"),
            EngineError::Protocol(e) => write!(f, "Response channel error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
