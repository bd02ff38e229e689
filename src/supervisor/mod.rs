//! Process supervisor for process-backed servers.
//!
//! Each managed server moves through `starting → running → {error, stopped}`
//! and back to `starting` on restart while the supervisor is active. An
//! explicit `stop()` is terminal. Network servers are only registered so
//! availability queries can answer for them; they are never spawned.
//!
//! Restart policy:
//! - the first `failure_threshold` consecutive crashes restart immediately
//! - after that, restarts back off exponentially up to `backoff_max`
//! - the counter resets once a launch has stayed running for one health interval

pub mod process;
pub mod readiness;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ServerDescriptor, SupervisorConfig, TransportKind};
use crate::error::GatewayError;
use crate::events::{EventSink, GatewayEvent};
use crate::router::Availability;
use crate::supervisor::process::{StderrBuffer, StdioChannel, STDERR_LINES};
use crate::supervisor::readiness::{Readiness, ReadinessProbe};

/// Extra time `stop()` gives a watcher beyond the shutdown grace before
/// abandoning it.
const STOP_MARGIN: Duration = Duration::from_secs(1);

/// Lifecycle state of a managed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Error,
    Stopped,
}

/// Point-in-time view of one server, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub server_id: String,
    pub transport: TransportKind,
    pub state: ProcessStatus,
    pub pid: Option<u32>,
    /// Seconds since the current launch became running.
    pub uptime_secs: Option<u64>,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub last_exit_code: Option<i32>,
    pub last_signal: Option<i32>,
}

struct ManagedProcess {
    descriptor: ServerDescriptor,
    probe: Arc<ReadinessProbe>,
    status: ProcessStatus,
    pid: Option<u32>,
    running_since: Option<Instant>,
    last_exit_code: Option<i32>,
    last_signal: Option<i32>,
    last_error: Option<String>,
    restart_count: u32,
    consecutive_failures: u32,
    next_restart_at: Option<Instant>,
    last_checked: Option<Instant>,
    /// Bumped on every launch; exit reports from older launches are ignored.
    generation: u64,
    stop_requested: bool,
    /// Cancels the current launch's pumps and triggers graceful terminate.
    cancel: CancellationToken,
    watcher: Option<JoinHandle<()>>,
    channel: Option<StdioChannel>,
    stderr: Arc<Mutex<StderrBuffer>>,
}

impl ManagedProcess {
    fn new(descriptor: ServerDescriptor, probe: ReadinessProbe) -> Self {
        Self {
            descriptor,
            probe: Arc::new(probe),
            status: ProcessStatus::Stopped,
            pid: None,
            running_since: None,
            last_exit_code: None,
            last_signal: None,
            last_error: None,
            restart_count: 0,
            consecutive_failures: 0,
            next_restart_at: None,
            last_checked: None,
            generation: 0,
            stop_requested: false,
            cancel: CancellationToken::new(),
            watcher: None,
            channel: None,
            stderr: Arc::new(Mutex::new(StderrBuffer::new(STDERR_LINES))),
        }
    }

    fn id(&self) -> &str {
        &self.descriptor.id
    }

    fn snapshot(&self) -> ServerStatus {
        ServerStatus {
            server_id: self.descriptor.id.clone(),
            transport: TransportKind::Process,
            state: self.status,
            pid: self.pid,
            uptime_secs: self
                .running_since
                .filter(|_| self.status == ProcessStatus::Running)
                .map(|t| t.elapsed().as_secs()),
            restart_count: self.restart_count,
            last_error: self.last_error.clone(),
            last_exit_code: self.last_exit_code,
            last_signal: self.last_signal,
        }
    }
}

/// Launches, watches, and restarts process-backed servers.
pub struct Supervisor {
    config: SupervisorConfig,
    events: EventSink,
    processes: RwLock<HashMap<String, Arc<Mutex<ManagedProcess>>>>,
    external: RwLock<HashSet<String>>,
    active: AtomicBool,
    lifecycle: CancellationToken,
    health_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, events: EventSink) -> Self {
        Self {
            config,
            events,
            processes: RwLock::new(HashMap::new()),
            external: RwLock::new(HashSet::new()),
            active: AtomicBool::new(false),
            lifecycle: CancellationToken::new(),
            health_loop: Mutex::new(None),
        }
    }

    /// Launch every enabled process-backed descriptor concurrently and
    /// register network ones.
    ///
    /// Returns one result per enabled descriptor; a failed launch does not
    /// stop the others, and failed servers are retried by the health loop.
    pub async fn start(self: &Arc<Self>, descriptors: &[ServerDescriptor]) -> Vec<(String, crate::Result<()>)> {
        let mut results = Vec::new();

        if self.lifecycle.is_cancelled() {
            for descriptor in descriptors.iter().filter(|d| d.enabled) {
                results.push((
                    descriptor.id.clone(),
                    Err(GatewayError::Unavailable(
                        descriptor.id.clone(),
                        "supervisor has been stopped".to_string(),
                    )),
                ));
            }
            return results;
        }
        self.active.store(true, Ordering::SeqCst);

        let mut launches = Vec::new();
        for descriptor in descriptors.iter().filter(|d| d.enabled) {
            let id = descriptor.id.clone();
            match descriptor.transport {
                TransportKind::Network => {
                    self.external.write().await.insert(id.clone());
                    tracing::debug!(server = %id, "registered external server");
                    results.push((id, Ok(())));
                }
                TransportKind::Process => {
                    let probe = match ReadinessProbe::from_patterns(&id, descriptor.ready_patterns.as_deref()) {
                        Ok(probe) => probe,
                        Err(e) => {
                            results.push((id, Err(e)));
                            continue;
                        }
                    };
                    self.processes
                        .write()
                        .await
                        .entry(id.clone())
                        .or_insert_with(|| Arc::new(Mutex::new(ManagedProcess::new(descriptor.clone(), probe))));
                    launches.push(id);
                }
            }
        }

        let outcomes = join_all(launches.iter().map(|id| self.launch(id, false))).await;
        results.extend(launches.into_iter().zip(outcomes));

        self.ensure_health_loop().await;
        results
    }

    /// Terminate every managed process and clear all records.
    ///
    /// Each process gets SIGTERM and `shutdown_grace` to exit before it is
    /// killed. Always completes; failures are logged. The supervisor cannot
    /// be started again afterwards.
    pub async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);

        let records: Vec<Arc<Mutex<ManagedProcess>>> =
            self.processes.write().await.drain().map(|(_, r)| r).collect();
        self.external.write().await.clear();

        let mut watchers = Vec::new();
        for record in &records {
            let mut r = record.lock().await;
            r.stop_requested = true;
            r.next_restart_at = None;
            r.cancel.cancel();
            if let Some(watcher) = r.watcher.take() {
                watchers.push((r.id().to_string(), watcher));
            }
        }
        self.lifecycle.cancel();

        let limit = self.config.shutdown_grace() + STOP_MARGIN;
        join_all(watchers.into_iter().map(|(id, mut watcher)| async move {
            if tokio::time::timeout(limit, &mut watcher).await.is_err() {
                // Dropping the child inside the aborted task kills it
                tracing::warn!(server = %id, "process watcher did not finish in time, aborting");
                watcher.abort();
            }
        }))
        .await;

        if let Some(handle) = self.health_loop.lock().await.take() {
            handle.abort();
        }
        tracing::info!(servers = records.len(), "supervisor stopped");
    }

    /// True for registered network servers and for running process servers.
    pub async fn is_available(&self, server_id: &str) -> bool {
        if self.external.read().await.contains(server_id) {
            return true;
        }
        let record = self.processes.read().await.get(server_id).cloned();
        match record {
            Some(record) => record.lock().await.status == ProcessStatus::Running,
            None => false,
        }
    }

    /// The stdio channel of a running process server.
    pub async fn stdio_channel(&self, server_id: &str) -> Option<StdioChannel> {
        let record = self.processes.read().await.get(server_id).cloned()?;
        let r = record.lock().await;
        if r.status != ProcessStatus::Running {
            return None;
        }
        r.channel.clone()
    }

    /// Status of every known server, sorted by id.
    pub async fn status(&self) -> Vec<ServerStatus> {
        let records: Vec<Arc<Mutex<ManagedProcess>>> =
            self.processes.read().await.values().cloned().collect();
        let mut statuses = Vec::with_capacity(records.len());
        for record in records {
            statuses.push(record.lock().await.snapshot());
        }
        for id in self.external.read().await.iter() {
            statuses.push(ServerStatus {
                server_id: id.clone(),
                transport: TransportKind::Network,
                state: ProcessStatus::Running,
                pid: None,
                uptime_secs: None,
                restart_count: 0,
                last_error: None,
                last_exit_code: None,
                last_signal: None,
            });
        }
        statuses.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        statuses
    }

    /// Most recent stderr lines of a process server.
    pub async fn recent_stderr(&self, server_id: &str) -> Vec<String> {
        let Some(record) = self.processes.read().await.get(server_id).cloned() else {
            return Vec::new();
        };
        let buffer = Arc::clone(&record.lock().await.stderr);
        let lines = buffer.lock().await.lines().iter().cloned().collect();
        lines
    }

    /// Launch (or relaunch) one managed server and wait until it is running.
    ///
    /// Running means a readiness line was seen or the grace period passed
    /// with the process still alive. No-op if already starting or running.
    async fn launch(self: &Arc<Self>, server_id: &str, restart: bool) -> crate::Result<()> {
        let record = self.processes.read().await.get(server_id).cloned().ok_or_else(|| {
            GatewayError::Unavailable(server_id.to_string(), "not a managed process".to_string())
        })?;

        let (mut readiness, generation, grace) = {
            let mut r = record.lock().await;
            if r.stop_requested || !self.active.load(Ordering::SeqCst) {
                return Err(GatewayError::Unavailable(
                    server_id.to_string(),
                    "supervisor stopped".to_string(),
                ));
            }
            if matches!(r.status, ProcessStatus::Starting | ProcessStatus::Running) {
                return Ok(());
            }

            r.generation += 1;
            let generation = r.generation;
            r.status = ProcessStatus::Starting;
            r.next_restart_at = None;
            r.cancel = self.lifecycle.child_token();
            if restart {
                r.restart_count += 1;
            }
            tracing::info!(server = %server_id, restart, "launching process");

            let spawned = match process::spawn_child(
                &r.descriptor,
                Arc::clone(&r.probe),
                Arc::clone(&r.stderr),
                r.cancel.clone(),
            ) {
                Ok(spawned) => spawned,
                Err(e) => {
                    self.launch_failed(&mut r, &e);
                    return Err(e);
                }
            };

            r.pid = spawned.pid;
            r.channel = Some(spawned.channel);
            r.watcher = Some(tokio::spawn(watch_exit(
                Arc::downgrade(self),
                Arc::clone(&record),
                generation,
                spawned.child,
                spawned.readiness_tx,
                r.cancel.clone(),
                self.config.shutdown_grace(),
            )));

            (spawned.readiness, generation, r.descriptor.health.ready_grace())
        };

        let observed = match tokio::time::timeout(
            grace,
            readiness.wait_for(|state| *state != Readiness::Pending),
        )
        .await
        {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => Readiness::Exited,
            // Grace period elapsed without a readiness line
            Err(_) => Readiness::Pending,
        };

        let mut r = record.lock().await;
        if r.generation != generation || r.status != ProcessStatus::Starting || observed == Readiness::Exited {
            let reason = r
                .last_error
                .clone()
                .filter(|_| r.generation == generation && r.status != ProcessStatus::Starting)
                .unwrap_or_else(|| "process exited during startup".to_string());
            return Err(GatewayError::Spawn(server_id.to_string(), reason));
        }

        r.status = ProcessStatus::Running;
        r.running_since = Some(Instant::now());
        r.last_error = None;
        tracing::info!(
            server = %server_id,
            pid = ?r.pid,
            via = if observed == Readiness::Ready { "readiness" } else { "grace" },
            "process running"
        );
        self.events.emit(GatewayEvent::ServerStarted {
            server_id: server_id.to_string(),
            pid: r.pid,
        });
        Ok(())
    }

    fn launch_failed(&self, r: &mut ManagedProcess, error: &GatewayError) {
        r.status = ProcessStatus::Error;
        r.pid = None;
        r.channel = None;
        r.last_error = Some(error.to_string());
        r.consecutive_failures += 1;
        r.next_restart_at = Some(Instant::now() + self.restart_delay(r));
        tracing::error!(server = %r.id(), error = %error, "process launch failed");
        self.events.emit(GatewayEvent::ServerError {
            server_id: r.id().to_string(),
            error: error.to_string(),
        });
    }

    /// Handle the exit of launch `generation`, reported by its watcher.
    async fn on_exit(
        self: &Arc<Self>,
        record: &Arc<Mutex<ManagedProcess>>,
        generation: u64,
        code: Option<i32>,
        signal: Option<i32>,
    ) {
        let mut r = record.lock().await;
        if r.generation != generation {
            tracing::trace!(server = %r.id(), generation, "ignoring exit of a previous launch");
            return;
        }
        if self.exited(&mut r, code, signal) {
            let server_id = r.id().to_string();
            drop(r);
            self.spawn_relaunch(server_id);
        }
    }

    /// Record an exit and decide what happens next. Returns whether the
    /// server should be relaunched right away.
    fn exited(&self, r: &mut ManagedProcess, code: Option<i32>, signal: Option<i32>) -> bool {
        let was_starting = r.status == ProcessStatus::Starting;
        r.pid = None;
        r.channel = None;
        r.running_since = None;
        r.last_exit_code = code;
        r.last_signal = signal;
        r.cancel.cancel();

        self.events.emit(GatewayEvent::ServerExit {
            server_id: r.id().to_string(),
            code,
            signal,
        });

        if r.stop_requested || !self.active.load(Ordering::SeqCst) {
            r.status = ProcessStatus::Stopped;
            r.next_restart_at = None;
            tracing::info!(server = %r.id(), code = ?code, signal = ?signal, "process stopped");
            return false;
        }

        r.consecutive_failures += 1;
        let delay = self.restart_delay(r);
        r.next_restart_at = Some(Instant::now() + delay);
        let summary = describe_exit(code, signal);

        if was_starting {
            r.status = ProcessStatus::Error;
            let message = format!("exited during startup ({summary})");
            tracing::warn!(server = %r.id(), reason = %message, "process failed to start");
            self.events.emit(GatewayEvent::ServerError {
                server_id: r.id().to_string(),
                error: message.clone(),
            });
            r.last_error = Some(message);
            // Startup failures wait for the health loop
            return false;
        }

        r.status = ProcessStatus::Stopped;
        r.last_error = Some(format!("exited unexpectedly ({summary})"));
        tracing::warn!(
            server = %r.id(),
            code = ?code,
            signal = ?signal,
            failures = r.consecutive_failures,
            restart_in_ms = delay.as_millis() as u64,
            "process exited unexpectedly"
        );
        delay.is_zero()
    }

    /// Delay before the next restart given the current failure streak.
    fn restart_delay(&self, r: &ManagedProcess) -> Duration {
        let threshold = r.descriptor.health.failure_threshold;
        if r.consecutive_failures <= threshold {
            return Duration::ZERO;
        }
        let exponent = (r.consecutive_failures - threshold - 1).min(16);
        self.config
            .backoff_initial()
            .saturating_mul(1u32 << exponent)
            .min(self.config.backoff_max())
    }

    fn spawn_relaunch(self: &Arc<Self>, server_id: String) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = supervisor.launch(&server_id, true).await {
                tracing::warn!(server = %server_id, error = %e, "restart failed");
            }
        });
    }

    async fn ensure_health_loop(self: &Arc<Self>) {
        let mut slot = self.health_loop.lock().await;
        if slot.is_some() {
            return;
        }
        let period = {
            let processes = self.processes.read().await;
            let mut period = self.config.health_interval();
            for record in processes.values() {
                if let Some(interval) = record.lock().await.descriptor.health.interval() {
                    period = period.min(interval);
                }
            }
            period.max(Duration::from_millis(1))
        };
        *slot = Some(tokio::spawn(health_loop(
            Arc::downgrade(self),
            period,
            self.lifecycle.clone(),
        )));
    }

    /// One pass of the health loop.
    async fn check_health(self: &Arc<Self>, period: Duration) {
        let records: Vec<Arc<Mutex<ManagedProcess>>> =
            self.processes.read().await.values().cloned().collect();
        let now = Instant::now();

        for record in records {
            let mut r = record.lock().await;
            if r.stop_requested {
                continue;
            }

            let interval = r
                .descriptor
                .health
                .interval()
                .unwrap_or_else(|| self.config.health_interval());
            if let Some(last) = r.last_checked {
                if now.duration_since(last) + period / 2 < interval {
                    continue;
                }
            }
            r.last_checked = Some(now);

            match r.status {
                ProcessStatus::Running => {
                    if r.pid.is_some_and(|pid| !process::pid_alive(pid)) {
                        tracing::warn!(server = %r.id(), pid = ?r.pid, "process died without exit notification");
                        // Retire the current watcher's report
                        r.generation += 1;
                        if self.exited(&mut r, None, None) {
                            self.spawn_relaunch(r.id().to_string());
                        }
                        continue;
                    }
                    if r.consecutive_failures > 0
                        && r.running_since.is_some_and(|t| now.duration_since(t) >= interval)
                    {
                        tracing::debug!(server = %r.id(), "process stable, resetting failure count");
                        r.consecutive_failures = 0;
                    }
                }
                ProcessStatus::Error | ProcessStatus::Stopped => {
                    if r.next_restart_at.is_some_and(|t| t <= now) {
                        self.spawn_relaunch(r.id().to_string());
                    }
                }
                ProcessStatus::Starting => {}
            }
        }
    }
}

impl Availability for Supervisor {
    fn is_available<'a>(&'a self, server_id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(Supervisor::is_available(self, server_id))
    }
}

/// Wait for one launch's process to exit (or be told to stop) and report it.
async fn watch_exit(
    supervisor: Weak<Supervisor>,
    record: Arc<Mutex<ManagedProcess>>,
    generation: u64,
    mut child: Child,
    readiness: Arc<watch::Sender<Readiness>>,
    cancel: CancellationToken,
    grace: Duration,
) {
    let server_id = record.lock().await.id().to_string();

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };
    let status = match waited {
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => {
            tracing::warn!(server = %server_id, error = %e, "failed to wait for process");
            None
        }
        None => process::terminate(&mut child, &server_id, grace).await,
    };
    readiness.send_replace(Readiness::Exited);

    let Some(supervisor) = supervisor.upgrade() else {
        return;
    };
    let (code, signal) = process::exit_parts(status);
    supervisor.on_exit(&record, generation, code, signal).await;
}

async fn health_loop(supervisor: Weak<Supervisor>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }
        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };
        supervisor.check_health(period).await;
    }
    tracing::debug!("health loop stopped");
}

fn describe_exit(code: Option<i32>, signal: Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "unknown status".to_string(),
    }
}
