//! Supervision of the auxiliary services.
//!
//! The inference server and the background trainer are separate processes.
//! Each one moves through [`ProcessState`]s that are published on a watch
//! channel, so the decision client can stop calling a service the moment it
//! goes away. Nothing in here is fatal to the caller: a service that fails
//! to spawn is simply `Stopped`, one that never answers is `Degraded`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Which auxiliary service a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Inference,
    Trainer,
}

impl ServiceKind {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceKind::Inference => "inference",
            ServiceKind::Trainer => "trainer",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawned, readiness not yet confirmed
    Starting,
    /// Alive and answering on its endpoint
    Ready,
    /// Alive but not answering
    Degraded,
    /// Not running
    Stopped,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessState::Starting => "starting",
            ProcessState::Ready => "ready",
            ProcessState::Degraded => "degraded",
            ProcessState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// How to launch a service and where it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Local endpoint probed for readiness. Without one, a process that
    /// survives the settle window counts as ready.
    pub endpoint: Option<SocketAddr>,
    pub working_dir: Option<PathBuf>,
}

impl ServiceSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            endpoint: None,
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// `<python> <script_dir>/model_inference.py --host <ip> --port <port> --model-dir <dir>`
    pub fn inference(
        python: impl Into<PathBuf>,
        script_dir: &Path,
        endpoint: SocketAddr,
        model_dir: &Path,
    ) -> Self {
        Self::new(python)
            .arg(script_dir.join("model_inference.py").to_string_lossy())
            .args([
                "--host".to_string(),
                endpoint.ip().to_string(),
                "--port".to_string(),
                endpoint.port().to_string(),
                "--model-dir".to_string(),
                model_dir.to_string_lossy().to_string(),
            ])
            .endpoint(endpoint)
            .current_dir(script_dir)
    }

    /// `<python> <script_dir>/background_trainer.py --csv <log> --model-dir <dir>`
    pub fn trainer(
        python: impl Into<PathBuf>,
        script_dir: &Path,
        log_path: &Path,
        model_dir: &Path,
    ) -> Self {
        Self::new(python)
            .arg(script_dir.join("background_trainer.py").to_string_lossy())
            .args([
                "--csv".to_string(),
                log_path.to_string_lossy().to_string(),
                "--model-dir".to_string(),
                model_dir.to_string_lossy().to_string(),
            ])
            .current_dir(script_dir)
    }
}

/// Supervisor timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// How long `start` waits for readiness
    pub grace_period: Duration,
    /// Pause between readiness probes
    pub probe_interval: Duration,
    /// Minimum lifetime before an endpoint-less service counts as ready
    pub settle: Duration,
    /// How long `stop` waits after SIGTERM before force-killing
    pub stop_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            probe_interval: Duration::from_millis(200),
            settle: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// A supervised service instance. Owned by whoever called `start`.
#[derive(Debug)]
pub struct ServiceHandle {
    kind: ServiceKind,
    child: Option<Child>,
    pid: Option<u32>,
    /// Process group the service leads. Outlives `child` so that workers
    /// left behind by a crashed service can still be stopped.
    pgid: Option<u32>,
    endpoint: Option<SocketAddr>,
    state: Arc<watch::Sender<ProcessState>>,
}

impl ServiceHandle {
    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    fn set_state(&self, state: ProcessState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            match state {
                ProcessState::Ready | ProcessState::Starting => {
                    tracing::info!("{} service {} -> {}", self.kind, previous, state)
                }
                ProcessState::Degraded | ProcessState::Stopped => {
                    tracing::warn!("{} service {} -> {}", self.kind, previous, state)
                }
            }
        }
    }
}

/// Starts, probes and stops the auxiliary services.
#[derive(Debug)]
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    specs: HashMap<ServiceKind, ServiceSpec>,
    channels: HashMap<ServiceKind, Arc<watch::Sender<ProcessState>>>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            specs: HashMap::new(),
            channels: HashMap::new(),
        }
    }

    /// Register how to launch `kind`, replacing any earlier spec.
    pub fn register(&mut self, kind: ServiceKind, spec: ServiceSpec) {
        self.specs.insert(kind, spec);
        self.channels
            .entry(kind)
            .or_insert_with(|| Arc::new(watch::channel(ProcessState::Stopped).0));
    }

    pub fn with_service(mut self, kind: ServiceKind, spec: ServiceSpec) -> Self {
        self.register(kind, spec);
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Follow the state of `kind`. Valid before and across `start` calls.
    pub fn subscribe(&self, kind: ServiceKind) -> Option<watch::Receiver<ProcessState>> {
        self.channels.get(&kind).map(|tx| tx.subscribe())
    }

    /// Launch `kind` and wait up to the grace period for it to become ready.
    ///
    /// Only an unregistered kind is an error. Spawn failures and slow
    /// services are reflected in the handle's state.
    pub async fn start(&self, kind: ServiceKind) -> Result<ServiceHandle, SupervisorError> {
        let spec = self
            .specs
            .get(&kind)
            .ok_or(SupervisorError::NotConfigured(kind))?;
        let state = self
            .channels
            .get(&kind)
            .cloned()
            .ok_or(SupervisorError::NotConfigured(kind))?;

        let mut handle = ServiceHandle {
            kind,
            child: None,
            pid: None,
            pgid: None,
            endpoint: spec.endpoint,
            state,
        };
        handle.set_state(ProcessState::Starting);

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(
                    "Could not start {} service ({}): {}",
                    kind,
                    spec.program.display(),
                    e
                );
                handle.set_state(ProcessState::Stopped);
                return Ok(handle);
            }
        };

        handle.pid = child.id();
        #[cfg(unix)]
        {
            handle.pgid = handle.pid;
        }
        handle.child = Some(child);
        tracing::info!("Started {} service (pid {:?})", kind, handle.pid);

        let state = self.await_ready(&mut handle).await;
        handle.set_state(state);
        if state == ProcessState::Degraded {
            tracing::warn!(
                "{} service not ready after {:?}, continuing without it",
                kind,
                self.config.grace_period
            );
        }
        Ok(handle)
    }

    async fn await_ready(&self, handle: &mut ServiceHandle) -> ProcessState {
        let started = Instant::now();
        let deadline = started + self.config.grace_period;

        loop {
            if reap(handle) {
                return ProcessState::Stopped;
            }

            match handle.endpoint {
                Some(endpoint) => {
                    if probe(endpoint, self.config.probe_interval).await {
                        return ProcessState::Ready;
                    }
                }
                None => {
                    if started.elapsed() >= self.config.settle {
                        return ProcessState::Ready;
                    }
                }
            }

            if Instant::now() >= deadline {
                return ProcessState::Degraded;
            }
            tokio::time::sleep(self.config.probe_interval).await;
        }
    }

    /// Reap a dead child, re-probe a live one, and publish the result.
    /// Returns whether the service is ready.
    pub async fn health_check(&self, handle: &mut ServiceHandle) -> bool {
        let state = if handle.child.is_none() || reap(handle) {
            ProcessState::Stopped
        } else {
            match handle.endpoint {
                Some(endpoint) if probe(endpoint, self.config.probe_interval).await => {
                    ProcessState::Ready
                }
                Some(_) => ProcessState::Degraded,
                None => ProcessState::Ready,
            }
        };
        handle.set_state(state);
        state == ProcessState::Ready
    }

    /// Health-check `handles` every `interval` until `cancel` fires.
    pub async fn monitor(
        &self,
        handles: &mut [ServiceHandle],
        interval: Duration,
        cancel: &CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately and `start` just probed.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for handle in handles.iter_mut() {
                        self.health_check(handle).await;
                    }
                }
            }
        }
    }

    /// Terminate the service and every process it spawned.
    ///
    /// Sends SIGTERM to the service's process group and to every descendant
    /// still parented to it, waits up to the stop timeout, then kills
    /// whatever is left. Works after the service itself has already exited.
    /// Calling it again is a no-op.
    pub async fn stop(&self, handle: &mut ServiceHandle) {
        let child = handle.child.take();
        let pgid = handle.pgid.take();
        if child.is_none() && pgid.is_none() {
            handle.set_state(ProcessState::Stopped);
            return;
        }

        let tree = match child.as_ref().and_then(Child::id) {
            Some(pid) => collect_tree(pid).await,
            None => Vec::new(),
        };
        tracing::info!(
            "Stopping {} service ({} process(es), group {:?})",
            handle.kind,
            tree.len().max(1),
            pgid
        );

        if let Some(pgid) = pgid {
            signal_group(pgid, false);
        }
        signal_tree(tree.clone(), false).await;

        let deadline = Instant::now() + self.config.stop_timeout;
        if let Some(mut child) = child {
            match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!("{} service exited: {}", handle.kind, status),
                Ok(Err(e)) => tracing::warn!("Waiting for {} service failed: {}", handle.kind, e),
                Err(_) => {
                    tracing::warn!(
                        "{} service ignored SIGTERM for {:?}, killing",
                        handle.kind,
                        self.config.stop_timeout
                    );
                    if let Err(e) = child.kill().await {
                        tracing::warn!("Could not kill {} service: {}", handle.kind, e);
                    }
                }
            }
        }

        if let Some(pgid) = pgid {
            while group_alive(pgid) && Instant::now() < deadline {
                tokio::time::sleep(self.config.probe_interval).await;
            }
            signal_group(pgid, true);
        }
        // Descendants outlive their parent when they ignore SIGTERM.
        signal_tree(tree, true).await;
        handle.set_state(ProcessState::Stopped);
    }
}

/// Collect the pid of `root` and all of its descendants, leaves first.
pub fn process_tree(system: &System, root: u32) -> Vec<u32> {
    let root = Pid::from_u32(root);
    if system.process(root).is_none() {
        return Vec::new();
    }

    let mut tree = vec![root];
    let mut i = 0;
    while i < tree.len() {
        let parent = tree[i];
        for (pid, process) in system.processes() {
            if process.parent() == Some(parent) && !tree.contains(pid) {
                tree.push(*pid);
            }
        }
        i += 1;
    }

    tree.into_iter().rev().map(|pid| pid.as_u32()).collect()
}

async fn collect_tree(root: u32) -> Vec<u32> {
    tokio::task::spawn_blocking(move || {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All);
        process_tree(&system, root)
    })
    .await
    .unwrap_or_else(|e| {
        tracing::warn!("Process tree scan failed: {}", e);
        vec![root]
    })
}

/// SIGTERM (or kill, when `force` or on platforms without signals) every
/// pid that still exists.
async fn signal_tree(pids: Vec<u32>, force: bool) {
    if pids.is_empty() {
        return;
    }
    let result = tokio::task::spawn_blocking(move || {
        let pids: Vec<Pid> = pids.into_iter().map(Pid::from_u32).collect();
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&pids));
        for pid in &pids {
            if let Some(process) = system.process(*pid) {
                if force || process.kill_with(Signal::Term).is_none() {
                    process.kill();
                }
            }
        }
    })
    .await;
    if let Err(e) = result {
        tracing::warn!("Signalling process tree failed: {}", e);
    }
}

/// Signal every member of process group `pgid`: SIGTERM, or SIGKILL when
/// `force`. A group that no longer exists is not an error.
#[cfg(unix)]
fn signal_group(pgid: u32, force: bool) {
    let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
    let result = unsafe { libc::kill(-(pgid as i32), signal) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!("Signalling process group {} failed: {}", pgid, err);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _force: bool) {}

/// Whether any process remains in group `pgid`.
#[cfg(unix)]
fn group_alive(pgid: u32) -> bool {
    let result = unsafe { libc::kill(-(pgid as i32), 0) };
    result == 0 || std::io::Error::last_os_error().kind() == std::io::ErrorKind::PermissionDenied
}

#[cfg(not(unix))]
fn group_alive(_pgid: u32) -> bool {
    false
}

/// Drop the child if it has exited. Returns true when it is gone.
fn reap(handle: &mut ServiceHandle) -> bool {
    let Some(child) = handle.child.as_mut() else {
        return true;
    };
    match child.try_wait() {
        Ok(Some(status)) => {
            tracing::warn!("{} service exited: {}", handle.kind, status);
            handle.child = None;
            true
        }
        Ok(None) => false,
        Err(e) => {
            tracing::warn!("Could not poll {} service: {}", handle.kind, e);
            false
        }
    }
}

async fn probe(endpoint: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await,
        Ok(Ok(_))
    )
}

/// Supervisor errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    NotConfigured(ServiceKind),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::NotConfigured(kind) => {
                write!(f, "No launch configuration for the {kind} service")
            }
        }
    }
}

impl std::error::Error for SupervisorError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inference_spec() {
        let spec = ServiceSpec::inference(
            "python3",
            Path::new("/opt/nudge"),
            "127.0.0.1:45002".parse().unwrap(),
            Path::new("/opt/nudge/model"),
        );
        assert_eq!(spec.program, PathBuf::from("python3"));
        assert_eq!(
            spec.args,
            vec![
                "/opt/nudge/model_inference.py",
                "--host",
                "127.0.0.1",
                "--port",
                "45002",
                "--model-dir",
                "/opt/nudge/model"
            ]
        );
        assert_eq!(spec.endpoint, Some("127.0.0.1:45002".parse().unwrap()));
    }

    #[test]
    fn test_trainer_spec_has_no_endpoint() {
        let spec = ServiceSpec::trainer(
            "python3",
            Path::new("/opt/nudge"),
            Path::new("/tmp/HARVEST.CSV"),
            Path::new("/opt/nudge/model"),
        );
        assert!(spec.endpoint.is_none());
        assert_eq!(spec.args[1..3], ["--csv", "/tmp/HARVEST.CSV"]);
    }

    #[tokio::test]
    async fn test_unregistered_kind() {
        let supervisor = ProcessSupervisor::new(SupervisorConfig::default());
        assert!(supervisor.subscribe(ServiceKind::Trainer).is_none());
        assert_eq!(
            supervisor.start(ServiceKind::Trainer).await.unwrap_err(),
            SupervisorError::NotConfigured(ServiceKind::Trainer)
        );
    }

    #[test]
    fn test_process_tree_of_missing_pid() {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All);
        assert!(process_tree(&system, u32::MAX).is_empty());
    }
}
