//! End-to-end behaviour of the sampling engine.

use nudge_harvester::collector::{ActivityTracker, ForegroundProbe, SampleCache};
use nudge_harvester::collector::{Backend, CollectorError};
use nudge_harvester::config::Config;
use nudge_harvester::core::{
    CoordinatorConfig, CoordinatorEvent, LabelSink, LabeledRecord, SinkError, SnapshotCoordinator,
    SnapshotState, TriggerSource,
};
use nudge_harvester::engine::{self, Engine, Harvester, RunOptions, TickOutcome};
use nudge_harvester::gate::{
    AdaptiveGate, DecisionError, DecisionService, Prediction, PredictionFuture, TcpDecisionClient,
};
use nudge_harvester::protocol::{send_token, ResponseListener, Token, TokenHandler};
use nudge_harvester::supervisor::{ProcessState, ServiceKind};
use nudge_harvester::transparency::create_shared_log;
use nudge_harvester::{stable_hash, core::FeatureVector};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

const SECOND: Duration = Duration::from_secs(1);
const FIVE_MINUTES: Duration = Duration::from_secs(300);

/// A user parked in one application without touching the input devices.
struct IdleUser {
    application: &'static str,
}

impl ForegroundProbe for IdleUser {
    fn backend(&self) -> Backend {
        Backend::Unsupported
    }

    fn query_application(&self) -> Result<String, CollectorError> {
        Ok(self.application.to_string())
    }

    fn query_idle(&self) -> Result<Duration, CollectorError> {
        Ok(Duration::from_secs(600))
    }
}

#[derive(Default)]
struct RecordingSink {
    rows: Mutex<Vec<LabeledRecord>>,
}

impl RecordingSink {
    fn rows(&self) -> Vec<LabeledRecord> {
        self.rows.lock().unwrap().clone()
    }
}

impl LabelSink for RecordingSink {
    fn persist(&self, record: &LabeledRecord) -> Result<(), SinkError> {
        self.rows.lock().unwrap().push(*record);
        Ok(())
    }
}

/// Low confidence until switched to a confident "not productive".
#[derive(Default)]
struct SwitchableService {
    confident_unproductive: AtomicBool,
}

impl DecisionService for SwitchableService {
    fn predict<'a>(&'a self, _features: &'a FeatureVector) -> PredictionFuture<'a> {
        let prediction = if self.confident_unproductive.load(Ordering::SeqCst) {
            Prediction::new(false, 0.99)
        } else {
            Prediction::new(false, 0.5)
        };
        Box::pin(async move { Ok(prediction) })
    }
}

/// Confidently productive until turned down to a coin flip.
struct ProductiveService {
    confident: AtomicBool,
}

impl DecisionService for ProductiveService {
    fn predict<'a>(&'a self, _features: &'a FeatureVector) -> PredictionFuture<'a> {
        let confidence = if self.confident.load(Ordering::SeqCst) {
            0.99
        } else {
            0.5
        };
        let prediction = Prediction::new(true, confidence);
        Box::pin(async move { Ok(prediction) })
    }
}

struct UnreachableService;

impl DecisionService for UnreachableService {
    fn predict<'a>(&'a self, _features: &'a FeatureVector) -> PredictionFuture<'a> {
        Box::pin(async { Err(DecisionError::Connect("connection refused".to_string())) })
    }
}

fn coordinator(sink: Arc<RecordingSink>, interval: Duration, deadline: Duration) -> SnapshotCoordinator {
    SnapshotCoordinator::new(
        CoordinatorConfig {
            interval,
            response_deadline: deadline,
        },
        sink,
        create_shared_log(),
    )
}

fn harvester(coordinator: SnapshotCoordinator, application: &'static str) -> Harvester {
    let tracker = ActivityTracker::new(SampleCache::new(IdleUser { application }));
    Harvester::new(Box::new(tracker), coordinator, SECOND)
}

fn peer() -> SocketAddr {
    "127.0.0.1:50000".parse().unwrap()
}

/// Advance one second per tick until something triggers, returning the
/// second it happened at.
async fn tick_until_triggered(harvester: &Harvester, start: u64, limit: u64) -> Option<(u64, TickOutcome)> {
    for second in start..=limit {
        tokio::time::advance(SECOND).await;
        let outcome = harvester.tick().await;
        if matches!(outcome, TickOutcome::Triggered { .. }) {
            return Some((second, outcome));
        }
    }
    None
}

#[tokio::test(start_paused = true)]
async fn test_interval_prompt_labeled_yes() {
    let sink = Arc::new(RecordingSink::default());
    let harvester = harvester(coordinator(sink.clone(), FIVE_MINUTES, 60 * SECOND), "chrome");
    let (snap_tx, _snap_rx) = mpsc::channel(1);
    let responses = harvester.response_handler(snap_tx);

    let (second, outcome) = tick_until_triggered(&harvester, 1, 400).await.unwrap();
    assert_eq!(second, 300);
    assert!(matches!(
        outcome,
        TickOutcome::Triggered {
            source: TriggerSource::Interval,
            ..
        }
    ));

    tokio::time::advance(3 * SECOND).await;
    responses.on_token(Token::Yes, peer());

    let rows = sink.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].productive, 1);
    assert_eq!(rows[0].features.foreground_app, stable_hash("chrome"));
    assert_eq!(rows[0].features.idle_time, 600_000);
    assert!(harvester.coordinator().is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_confident_gate_fires_early_and_resets_interval() {
    let sink = Arc::new(RecordingSink::default());
    let service = Arc::new(SwitchableService::default());
    let gate = AdaptiveGate::new(service.clone(), 0.98, Duration::from_millis(250));
    let harvester = harvester(coordinator(sink.clone(), FIVE_MINUTES, 60 * SECOND), "youtube")
        .with_gate(gate);
    let (snap_tx, _snap_rx) = mpsc::channel(1);
    let responses = harvester.response_handler(snap_tx);

    // Low confidence leaves the interval in charge.
    assert!(tick_until_triggered(&harvester, 1, 119).await.is_none());

    service.confident_unproductive.store(true, Ordering::SeqCst);
    tokio::time::advance(SECOND).await;
    assert!(matches!(
        harvester.tick().await,
        TickOutcome::Triggered {
            source: TriggerSource::Gate,
            ..
        }
    ));
    service.confident_unproductive.store(false, Ordering::SeqCst);

    tokio::time::advance(SECOND).await;
    responses.on_token(Token::No, peer());
    let rows = sink.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].productive, 0);

    // The interval now runs from the answer at 121s: nothing at 300s,
    // the next prompt at 421s.
    let (second, outcome) = tick_until_triggered(&harvester, 122, 600).await.unwrap();
    assert_eq!(second, 421);
    assert!(matches!(
        outcome,
        TickOutcome::Triggered {
            source: TriggerSource::Interval,
            ..
        }
    ));

    let stats = harvester.gate().unwrap().stats().snapshot();
    assert_eq!(stats.triggers, 1);
}

#[tokio::test(start_paused = true)]
async fn test_suppressed_interval_fires_once_confidence_drops() {
    let sink = Arc::new(RecordingSink::default());
    let service = Arc::new(ProductiveService {
        confident: AtomicBool::new(true),
    });
    let gate = AdaptiveGate::new(service.clone(), 0.98, Duration::from_millis(250));
    let harvester = harvester(coordinator(sink.clone(), FIVE_MINUTES, 60 * SECOND), "code")
        .with_gate(gate);

    // Well past the five minute mark, the confident gate keeps holding back.
    for second in 1..=330 {
        tokio::time::advance(SECOND).await;
        assert_eq!(
            harvester.tick().await,
            TickOutcome::Suppressed,
            "not suppressed at {second}s"
        );
    }
    assert!(harvester.coordinator().is_idle());

    // Suppressing never restarted the clock, so the overdue interval fires
    // on the very next tick.
    service.confident.store(false, Ordering::SeqCst);
    tokio::time::advance(SECOND).await;
    assert!(matches!(
        harvester.tick().await,
        TickOutcome::Triggered {
            source: TriggerSource::Interval,
            ..
        }
    ));

    let stats = harvester.gate().unwrap().stats().snapshot();
    assert_eq!(stats.skips, 330);
    assert_eq!(stats.triggers, 0);
    assert!(sink.rows().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_prompt_times_out_without_row() {
    let sink = Arc::new(RecordingSink::default());
    let coordinator = coordinator(sink.clone(), FIVE_MINUTES, 60 * SECOND);
    let mut events = coordinator.subscribe();
    let harvester = harvester(coordinator, "code");
    let (snap_tx, _snap_rx) = mpsc::channel(1);
    let responses = harvester.response_handler(snap_tx);

    let (second, _) = tick_until_triggered(&harvester, 1, 400).await.unwrap();
    assert_eq!(second, 300);
    let requested = match events.recv().await.unwrap() {
        CoordinatorEvent::Requested(s) => s,
        other => panic!("unexpected event {other:?}"),
    };

    let timed_out = match events.recv().await.unwrap() {
        CoordinatorEvent::TimedOut(s) => s,
        other => panic!("unexpected event {other:?}"),
    };
    assert_eq!(timed_out.sequence, requested.sequence);
    assert_eq!(timed_out.state, SnapshotState::TimedOut);
    assert!(sink.rows().is_empty());

    // A late answer has no effect.
    responses.on_token(Token::Yes, peer());
    assert!(sink.rows().is_empty());
    assert!(harvester.coordinator().is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_label_ignored() {
    let sink = Arc::new(RecordingSink::default());
    let harvester = harvester(coordinator(sink.clone(), FIVE_MINUTES, 60 * SECOND), "code");
    let (snap_tx, _snap_rx) = mpsc::channel(1);
    let responses = harvester.response_handler(snap_tx);

    harvester.request_snapshot().await.unwrap();
    responses.on_token(Token::Yes, peer());
    responses.on_token(Token::Yes, peer());
    responses.on_token(Token::No, peer());

    assert_eq!(sink.rows().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_service_matches_ml_disabled() {
    let plain_sink = Arc::new(RecordingSink::default());
    let plain = harvester(coordinator(plain_sink.clone(), FIVE_MINUTES, 3600 * SECOND), "code");

    // A supervised inference service that never became ready: the client
    // must not even try the network.
    let (_state_tx, state_rx) = watch::channel(ProcessState::Degraded);
    let degraded_client = TcpDecisionClient::new("127.0.0.1:9".parse().unwrap(), SECOND)
        .with_availability(state_rx);
    let gated_degraded = harvester(
        coordinator(Arc::new(RecordingSink::default()), FIVE_MINUTES, 3600 * SECOND),
        "code",
    )
    .with_gate(AdaptiveGate::new(
        Arc::new(degraded_client),
        0.98,
        Duration::from_millis(250),
    ));

    let gated_unreachable = harvester(
        coordinator(Arc::new(RecordingSink::default()), FIVE_MINUTES, 3600 * SECOND),
        "code",
    )
    .with_gate(AdaptiveGate::new(
        Arc::new(UnreachableService),
        0.98,
        Duration::from_millis(250),
    ));

    let harvesters = [&plain, &gated_degraded, &gated_unreachable];
    let (snap_tx, _snap_rx) = mpsc::channel(1);
    let handlers: Vec<_> = harvesters
        .iter()
        .map(|h| h.response_handler(snap_tx.clone()))
        .collect();

    for second in 1..=1000u64 {
        tokio::time::advance(SECOND).await;
        let mut outcomes = Vec::new();
        for h in harvesters {
            outcomes.push(h.tick().await);
        }
        assert!(
            outcomes.windows(2).all(|w| w[0] == w[1]),
            "diverged at {second}s: {outcomes:?}"
        );
        // Answer every tenth second so prompts resolve on a shared schedule.
        if second % 10 == 0 {
            for handler in &handlers {
                handler.on_token(Token::No, peer());
            }
        }
    }

    assert_eq!(plain_sink.rows().len(), 3);
    for h in [&gated_degraded, &gated_unreachable] {
        let stats = h.gate().unwrap().stats().snapshot();
        assert_eq!(stats.predictions, 0);
        assert_eq!(stats.fallbacks, stats.unavailable);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_create_one_snapshot() {
    let sink = Arc::new(RecordingSink::default());
    let coordinator = coordinator(sink, FIVE_MINUTES, 60 * SECOND);
    let barrier = Arc::new(tokio::sync::Barrier::new(16));

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let coordinator = coordinator.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                let source = match i % 3 {
                    0 => TriggerSource::Interval,
                    1 => TriggerSource::Gate,
                    _ => TriggerSource::Remote,
                };
                barrier.wait().await;
                coordinator
                    .trigger(source, nudge_harvester::ActivitySample::unknown())
                    .is_some()
            })
        })
        .collect();

    let mut created = 0;
    for task in tasks {
        if task.await.unwrap() {
            created += 1;
        }
    }
    assert_eq!(created, 1);
    assert!(coordinator.pending().is_some());
}

#[test]
fn test_hash_is_pinned() {
    // Rows written by earlier runs must keep matching.
    assert_eq!(stable_hash("chrome"), 270_057_011);
    assert_eq!(stable_hash("chrome"), stable_hash(&String::from("chrome")));
}

#[tokio::test]
async fn test_udp_round_trip() {
    let sink = Arc::new(RecordingSink::default());
    let coordinator = coordinator(sink.clone(), Duration::from_millis(200), 5 * SECOND);
    let tracker = ActivityTracker::new(IdleUser { application: "code" });
    let harvester = Arc::new(Harvester::new(
        Box::new(tracker),
        coordinator,
        Duration::from_millis(50),
    ));

    let listener = ResponseListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let listen_addr = listener.local_addr();
    let notified = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let notify_addr = notified.local_addr().unwrap();

    let cancel = CancellationToken::new();
    let task = {
        let harvester = harvester.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { harvester.run(listener, Some(notify_addr), cancel).await })
    };

    // The prompt process hears SNAP once the interval elapses.
    let mut buf = [0u8; 16];
    let (len, _) = tokio::time::timeout(5 * SECOND, notified.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(Token::parse(&buf[..len]), Some(Token::Snap));

    send_token(listen_addr, Token::Yes).await.unwrap();

    tokio::time::timeout(5 * SECOND, async {
        while sink.rows().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(sink.rows()[0].productive, 1);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_remote_snap_over_udp() {
    let sink = Arc::new(RecordingSink::default());
    let coordinator = coordinator(sink, 3600 * SECOND, 5 * SECOND);
    let mut events = coordinator.subscribe();
    let harvester = Arc::new(harvester(coordinator, "terminal"));

    let listener = ResponseListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let listen_addr = listener.local_addr();
    let cancel = CancellationToken::new();
    let task = {
        let harvester = harvester.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { harvester.run(listener, None, cancel).await })
    };

    // Garbage first; it must be dropped silently.
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(b"MAYBE", listen_addr).await.unwrap();
    send_token(listen_addr, Token::Snap).await.unwrap();

    let event = tokio::time::timeout(5 * SECOND, events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        CoordinatorEvent::Requested(snapshot) => {
            assert_eq!(snapshot.source, TriggerSource::Remote);
            assert_eq!(snapshot.sample.application, "terminal");
        }
        other => panic!("unexpected event {other:?}"),
    }

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_run_saves_session_stats() {
    let dir = std::env::temp_dir().join(format!("nudge-run-{}", uuid::Uuid::new_v4()));
    let config = Config {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        log_path: dir.join("HARVEST.CSV"),
        data_path: dir.clone(),
        ..Config::default()
    };
    let stats_path = config.stats_path();

    let cancel = CancellationToken::new();
    let stopper = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        })
    };

    let stats = engine::run(config, RunOptions::default(), cancel).await.unwrap();
    stopper.await.unwrap();

    assert_eq!(stats.snapshots_requested, 0);
    assert!(stats.summary().contains("Snapshots requested: 0 (0 resolved)"));
    assert!(stats_path.exists());

    let _ = std::fs::remove_dir_all(&dir);
}

/// Wait for `kind` to come up and then go down, and note when it did.
#[cfg(unix)]
fn record_stop(
    kind: ServiceKind,
    mut state: watch::Receiver<ProcessState>,
    stopped: Arc<Mutex<Vec<ServiceKind>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if state.wait_for(|s| *s != ProcessState::Stopped).await.is_err() {
            return;
        }
        if state.wait_for(|s| *s == ProcessState::Stopped).await.is_ok() {
            stopped.lock().unwrap().push(kind);
        }
    })
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_stops_services_before_discarding() {
    let dir = std::env::temp_dir().join(format!("nudge-shutdown-{}", uuid::Uuid::new_v4()));
    let scripts = dir.join("scripts");
    std::fs::create_dir_all(&scripts).unwrap();
    // The inference stand-in takes a moment to exit on SIGTERM, so a wrong
    // stop order would show up as inference stopping first.
    std::fs::write(
        scripts.join("model_inference.py"),
        "trap 'sleep 0.3; exit 0' TERM\nsleep 30 &\nwait\n",
    )
    .unwrap();
    std::fs::write(scripts.join("background_trainer.py"), "exec sleep 30\n").unwrap();

    // Nobody listens here, so the inference service ends up Degraded and the
    // gate never reaches the network.
    let inference_addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let mut config = Config {
        ml_enabled: true,
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        inference_addr,
        log_path: dir.join("HARVEST.CSV"),
        data_path: dir.clone(),
        ..Config::default()
    };
    config.services.script_dir = scripts;
    config.services.python = "sh".into();
    config.services.model_dir = dir.join("model");
    config.services.grace_period = Duration::from_millis(300);
    config.services.health_interval = SECOND;
    config.services.stop_timeout = 2 * SECOND;

    let engine = Engine::build(&config, RunOptions::default()).await.unwrap();
    let inference = engine.service_state(ServiceKind::Inference).unwrap();
    let mut trainer = engine.service_state(ServiceKind::Trainer).unwrap();
    let coordinator = engine.coordinator().clone();
    let mut events = coordinator.subscribe();

    let stopped = Arc::new(Mutex::new(Vec::new()));
    let recorders = [
        record_stop(ServiceKind::Inference, inference.clone(), stopped.clone()),
        record_stop(ServiceKind::Trainer, trainer.clone(), stopped.clone()),
    ];

    let cancel = CancellationToken::new();
    let run = tokio::spawn(engine.run(cancel.clone()));

    // Inference is started first, so a Ready trainer means both are up.
    tokio::time::timeout(10 * SECOND, trainer.wait_for(|s| *s == ProcessState::Ready))
        .await
        .unwrap()
        .map(|_| ())
        .unwrap();
    assert_eq!(*inference.borrow(), ProcessState::Degraded);

    let pending = coordinator
        .trigger(TriggerSource::Remote, nudge_harvester::ActivitySample::unknown())
        .unwrap();
    cancel.cancel();

    let discarded = loop {
        let event = tokio::time::timeout(10 * SECOND, events.recv())
            .await
            .unwrap()
            .unwrap();
        if let CoordinatorEvent::Discarded(snapshot) = event {
            break snapshot;
        }
    };
    assert_eq!(discarded.sequence, pending.sequence);
    assert_eq!(*trainer.borrow(), ProcessState::Stopped);
    assert_eq!(*inference.borrow(), ProcessState::Stopped);

    let stats = run.await.unwrap();
    assert_eq!(stats.discarded, 1);
    for recorder in recorders {
        recorder.await.unwrap();
    }
    assert_eq!(
        *stopped.lock().unwrap(),
        vec![ServiceKind::Trainer, ServiceKind::Inference]
    );

    let _ = std::fs::remove_dir_all(&dir);
}
