//! Service lifecycle supervision and request coordination.
//!
//! One [`CompilerService`] owns at most one backend process for its endpoint
//! and drives it through `Idle → Starting → Ready → Stopping → Idle`.
//! Callers that arrive before readiness are queued as waiters and released
//! in FIFO order exactly once per startup attempt; requests dispatched while
//! Ready are counted so the idle timer never stops a busy backend.
//!
//! Every state transition happens under one mutex with no await points, so
//! a single mutator at a time touches `state`, the waiter queue, and the
//! generation bookkeeping. Request bodies transfer outside the lock.
//!
//! Asynchronous completions (readiness, crash notifications, timer wakeups)
//! are tagged with the generation they belong to and ignored once that
//! generation is no longer current, so a late signal from a stopped process
//! can never disturb its successor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, sleep, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use ccwr_core::config::{ServiceConfig, StatusQuery};
use ccwr_core::error::ServiceError;
use ccwr_core::events::{EventBroadcaster, ServiceEvent};
use ccwr_core::ports::{
    ExitInfo, KillHandle, LaunchSpec, LaunchedProcess, OutputLine, ProcessLauncher, RuntimeLocator,
};

use crate::gateway::Gateway;
use crate::readiness::{self, StartupSignal, await_startup};

/// Fixed delay between startup confirmation probes. Each wait is further
/// capped at one third of the remaining startup budget.
const CONFIRM_PROBE_DELAY: Duration = Duration::from_millis(100);

/// Default reason reported for an explicit stop.
const DEFAULT_STOP_REASON: &str = "user initiated exit";

type Waiter = oneshot::Sender<Result<(), ServiceError>>;

/// Supervisor for one logical backend endpoint.
///
/// Obtained from [`crate::ServiceRegistry::get_or_create`], which guarantees
/// one instance per endpoint. Cheap to share via [`Arc`].
pub struct CompilerService {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for CompilerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerService")
            .field("endpoint", &self.shared.endpoint)
            .finish_non_exhaustive()
    }
}

struct Shared {
    endpoint: Url,
    launch_args: Option<Vec<String>>,
    startup_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    launcher: Arc<dyn ProcessLauncher>,
    locator: Arc<dyn RuntimeLocator>,
    gateway: Gateway,
    events: EventBroadcaster,
    state: Mutex<Inner>,
}

struct Inner {
    state: State,
    /// Generation of the current attempt; bumped on every start and every
    /// teardown so stale completions can be recognized.
    epoch: u64,
}

enum State {
    Idle,
    Starting(Starting),
    Ready(Arc<Generation>),
    Stopping,
}

struct Starting {
    waiters: Vec<Waiter>,
    /// Present once the process has actually been launched.
    kill: Option<KillHandle>,
}

/// Per-process bookkeeping shared with dispatched requests and timers.
struct Generation {
    epoch: u64,
    kill: KillHandle,
    /// Cancelled when the backend crashes; fails in-flight requests.
    crashed: CancellationToken,
    pending: AtomicUsize,
    last_activity: Mutex<Instant>,
}

/// Everything a teardown extracts from the active state.
#[derive(Default)]
struct TornDown {
    waiters: Vec<Waiter>,
    kill: Option<KillHandle>,
    crashed: Option<CancellationToken>,
}

/// Drain and reset the active attempt. The lock must be held and the epoch
/// already verified by the caller.
fn teardown(inner: &mut Inner) -> TornDown {
    let previous = std::mem::replace(&mut inner.state, State::Stopping);
    inner.epoch += 1;
    let torn = match previous {
        State::Starting(starting) => TornDown {
            waiters: starting.waiters,
            kill: starting.kill,
            crashed: None,
        },
        State::Ready(generation) => TornDown {
            waiters: Vec::new(),
            kill: Some(generation.kill.clone()),
            crashed: Some(generation.crashed.clone()),
        },
        State::Idle | State::Stopping => TornDown::default(),
    };
    inner.state = State::Idle;
    torn
}

/// Scope guard counting one in-flight request.
///
/// The decrement and the activity touch happen exactly once regardless of
/// how the exchange ends.
struct FlightGuard {
    generation: Arc<Generation>,
}

impl FlightGuard {
    fn begin(generation: Arc<Generation>) -> Self {
        generation.pending.fetch_add(1, Ordering::SeqCst);
        Self { generation }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.generation.pending.fetch_sub(1, Ordering::SeqCst);
        *self.generation.last_activity.lock().unwrap() = Instant::now();
    }
}

impl CompilerService {
    /// Build a supervisor from its configuration and ports.
    ///
    /// Fails only on an invalid endpoint URL; nothing is launched until the
    /// first [`ensure_started`](Self::ensure_started) or request.
    pub fn new(
        config: &ServiceConfig,
        launcher: Arc<dyn ProcessLauncher>,
        locator: Arc<dyn RuntimeLocator>,
    ) -> Result<Self, ServiceError> {
        let endpoint = config.endpoint()?;
        let port = endpoint.port_or_known_default().unwrap_or(80);
        let launch_args = config.launch_args(port);

        if let Some(args) = &launch_args {
            debug!(endpoint = %endpoint, args = ?args, "service created");
        } else {
            debug!(endpoint = %endpoint, "service created for externally managed backend");
        }

        Ok(Self {
            shared: Arc::new(Shared {
                endpoint,
                launch_args,
                startup_timeout: config.startup_timeout(),
                idle_timeout: config.idle_timeout(),
                launcher,
                locator,
                gateway: Gateway::new(),
                events: EventBroadcaster::new(),
                state: Mutex::new(Inner {
                    state: State::Idle,
                    epoch: 0,
                }),
            }),
        })
    }

    /// Normalized base URL of the supervised endpoint.
    pub fn endpoint(&self) -> &Url {
        &self.shared.endpoint
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.shared.events.subscribe()
    }

    /// Whether the backend is confirmed ready.
    pub fn is_ready(&self) -> bool {
        matches!(self.shared.state.lock().unwrap().state, State::Ready(_))
    }

    /// Whether a startup attempt is in progress.
    pub fn is_starting(&self) -> bool {
        matches!(self.shared.state.lock().unwrap().state, State::Starting(_))
    }

    /// Number of requests currently in flight against the backend.
    pub fn pending_requests(&self) -> usize {
        match &self.shared.state.lock().unwrap().state {
            State::Ready(generation) => generation.pending.load(Ordering::SeqCst),
            _ => 0,
        }
    }

    /// Start the backend if it is not already started or starting.
    ///
    /// Suspends until readiness is confirmed or the attempt fails. Calling
    /// this while Ready is an immediate-success no-op; calling it while
    /// Starting attaches the caller to the existing attempt instead of
    /// launching a second process.
    pub async fn ensure_started(&self) -> Result<(), ServiceError> {
        let receiver = {
            let mut inner = self.shared.state.lock().unwrap();
            match &mut inner.state {
                State::Ready(_) => {
                    debug!(endpoint = %self.shared.endpoint, "service already started");
                    return Ok(());
                }
                State::Starting(starting) => {
                    let (tx, rx) = oneshot::channel();
                    starting.waiters.push(tx);
                    rx
                }
                State::Idle | State::Stopping => {
                    if self.shared.launch_args.is_none() {
                        return Err(ServiceError::NothingToStart);
                    }
                    inner.epoch += 1;
                    let epoch = inner.epoch;
                    let (tx, rx) = oneshot::channel();
                    inner.state = State::Starting(Starting {
                        waiters: vec![tx],
                        kill: None,
                    });
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        startup_attempt(shared, epoch).await;
                    });
                    rx
                }
            }
        };

        match receiver.await {
            Ok(result) => result,
            // The startup task always acknowledges its waiters; a dropped
            // sender means the attempt terminated abnormally.
            Err(_) => Err(ServiceError::LaunchFailure(
                "startup attempt terminated without acknowledging its waiters".to_string(),
            )),
        }
    }

    /// Perform one exchange against the backend, starting it first if needed.
    ///
    /// Requests issued while Starting wait for the queue release; requests
    /// issued while Ready dispatch immediately. A crash while the exchange
    /// is in flight resolves it with [`ServiceError::BackendCrashed`].
    pub async fn request(&self, path: &str, body: Option<&Value>) -> Result<Value, ServiceError> {
        if self.shared.launch_args.is_none() {
            // Externally managed backend: no process to supervise.
            return self
                .shared
                .gateway
                .exchange(&self.shared.endpoint, path, body)
                .await;
        }

        self.ensure_started().await?;

        let generation = {
            let inner = self.shared.state.lock().unwrap();
            match &inner.state {
                State::Ready(generation) => Arc::clone(generation),
                // A crash or stop raced the queue release.
                _ => {
                    return Err(ServiceError::BackendCrashed {
                        reason: "backend stopped before the request was dispatched".to_string(),
                    });
                }
            }
        };

        let _flight = FlightGuard::begin(Arc::clone(&generation));
        tokio::select! {
            result = self.shared.gateway.exchange(&self.shared.endpoint, path, body) => result,
            () = generation.crashed.cancelled() => Err(ServiceError::BackendCrashed {
                reason: "backend process crashed".to_string(),
            }),
        }
    }

    /// Query the backend's status endpoint.
    pub async fn status(&self, query: Option<&StatusQuery>) -> Result<Value, ServiceError> {
        let path = match query {
            Some(query) => format!("status{}", query.to_suffix()),
            None => "status".to_string(),
        };
        self.request(&path, None).await
    }

    /// Submit a compilation payload.
    pub async fn compile(&self, payload: &Value) -> Result<Value, ServiceError> {
        self.request("compile", Some(payload)).await
    }

    /// Fetch the backend's externs listing.
    pub async fn externs(&self) -> Result<Value, ServiceError> {
        self.request("externs", None).await
    }

    /// Stop the backend process.
    ///
    /// Waiters still queued on startup are failed with
    /// [`ServiceError::UserInitiatedStop`]; exchanges already dispatched are
    /// left to finish, but their completion cannot re-arm the idle timer.
    /// Stopping an idle service is a no-op.
    pub fn stop(&self, reason: Option<&str>) {
        let reason = reason.unwrap_or(DEFAULT_STOP_REASON).to_string();
        let torn = {
            let mut inner = self.shared.state.lock().unwrap();
            if matches!(inner.state, State::Idle | State::Stopping) {
                debug!(endpoint = %self.shared.endpoint, "service not started");
                return;
            }
            teardown(&mut inner)
        };

        info!(endpoint = %self.shared.endpoint, %reason, "stopping service");
        for waiter in torn.waiters {
            let _ = waiter.send(Err(ServiceError::UserInitiatedStop {
                reason: reason.clone(),
            }));
        }
        if let Some(kill) = torn.kill {
            kill.kill();
        }
        self.shared
            .events
            .broadcast(ServiceEvent::Stopped { reason });
    }
}

/// Run one startup attempt for `epoch`, from runtime discovery to readiness.
///
/// Each async step re-checks that the attempt is still current, so an
/// explicit stop during startup aborts cleanly and kills a process that was
/// launched after the stop raced it.
async fn startup_attempt(shared: Arc<Shared>, epoch: u64) {
    info!(endpoint = %shared.endpoint, "starting backend service");

    let java = match shared.locator.locate().await {
        Ok(path) => path,
        Err(e) => return fail_startup(&shared, epoch, e),
    };
    if is_stale(&shared, epoch) {
        debug!(endpoint = %shared.endpoint, "startup aborted before launch");
        return;
    }

    let spec = LaunchSpec {
        command: java,
        args: shared.launch_args.clone().unwrap_or_default(),
    };
    let process = match shared.launcher.launch(&spec).await {
        Ok(process) => process,
        Err(e) => return fail_startup(&shared, epoch, e),
    };
    let LaunchedProcess {
        pid,
        mut lines,
        mut exit,
        kill,
    } = process;

    // Register the handle; a stop that raced the launch wins.
    {
        let mut inner = shared.state.lock().unwrap();
        if inner.epoch != epoch {
            drop(inner);
            debug!(endpoint = %shared.endpoint, "startup aborted, killing freshly launched process");
            kill.kill();
            return;
        }
        if let State::Starting(starting) = &mut inner.state {
            starting.kill = Some(kill.clone());
        }
    }
    shared.events.broadcast(ServiceEvent::Online { pid });

    let deadline = shared.startup_timeout.map(|t| Instant::now() + t);
    let signal = match deadline {
        Some(deadline) => match timeout_at(deadline, await_startup(&mut lines, &mut exit)).await {
            Ok(signal) => signal,
            Err(_) => {
                kill.kill();
                return fail_startup(
                    &shared,
                    epoch,
                    ServiceError::StartupTimeout {
                        timeout: shared.startup_timeout.unwrap_or_default(),
                    },
                );
            }
        },
        None => await_startup(&mut lines, &mut exit).await,
    };

    if let StartupSignal::Crashed(reason) = signal {
        kill.kill();
        return fail_startup(&shared, epoch, ServiceError::BackendCrashed { reason });
    }

    // The marker alone is not trusted when a startup budget is configured:
    // a started server may still refuse connections briefly, so confirm by
    // polling the status endpoint until the backend actually answers.
    if let Some(deadline) = deadline {
        if let Err(e) = confirm_reachable(&shared, deadline, &mut exit).await {
            kill.kill();
            return fail_startup(&shared, epoch, e);
        }
    }

    promote_ready(&shared, epoch, kill, lines, exit);
}

fn is_stale(shared: &Shared, epoch: u64) -> bool {
    shared.state.lock().unwrap().epoch != epoch
}

/// Fail the current attempt: drain waiters with the error, kill any launched
/// process, and return to Idle. Stale calls are ignored.
fn fail_startup(shared: &Arc<Shared>, epoch: u64, error: ServiceError) {
    let torn = {
        let mut inner = shared.state.lock().unwrap();
        if inner.epoch != epoch {
            return;
        }
        teardown(&mut inner)
    };

    warn!(endpoint = %shared.endpoint, %error, "startup failed");
    for waiter in torn.waiters {
        let _ = waiter.send(Err(error.clone()));
    }
    if let Some(kill) = torn.kill {
        kill.kill();
    }
    shared.events.broadcast(ServiceEvent::Error {
        message: error.to_string(),
    });
}

/// Transition `Starting → Ready`: acknowledge every queued waiter in FIFO
/// order, then hand the output streams to the crash monitor and arm the
/// idle timer.
///
/// The drain happens inside the state critical section, so every waiter is
/// released before any of them (or a newly arriving caller) can read the
/// Ready state and dispatch.
fn promote_ready(
    shared: &Arc<Shared>,
    epoch: u64,
    kill: KillHandle,
    lines: mpsc::Receiver<OutputLine>,
    exit: watch::Receiver<Option<ExitInfo>>,
) {
    let generation = Arc::new(Generation {
        epoch,
        kill: kill.clone(),
        crashed: CancellationToken::new(),
        pending: AtomicUsize::new(0),
        last_activity: Mutex::new(Instant::now()),
    });

    {
        let mut inner = shared.state.lock().unwrap();
        if inner.epoch != epoch {
            drop(inner);
            debug!(endpoint = %shared.endpoint, "startup aborted after readiness, killing process");
            kill.kill();
            return;
        }
        match std::mem::replace(&mut inner.state, State::Ready(Arc::clone(&generation))) {
            State::Starting(starting) => {
                for waiter in starting.waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            other => {
                // Epoch matched but the state does not: restore and bail.
                warn!(endpoint = %shared.endpoint, "unexpected state during ready promotion");
                inner.state = other;
                drop(inner);
                kill.kill();
                return;
            }
        }
    }

    info!(endpoint = %shared.endpoint, "backend service ready");
    shared.events.broadcast(ServiceEvent::Ready {
        base_url: shared.endpoint.to_string(),
    });

    spawn_crash_monitor(Arc::clone(shared), Arc::clone(&generation), lines, exit);
    if let Some(idle_timeout) = shared.idle_timeout {
        spawn_idle_timer(Arc::clone(shared), generation, idle_timeout);
    }
}

/// Poll the status endpoint until it answers, the budget runs out, or the
/// process exits.
async fn confirm_reachable(
    shared: &Arc<Shared>,
    deadline: Instant,
    exit: &mut watch::Receiver<Option<ExitInfo>>,
) -> Result<(), ServiceError> {
    loop {
        let probing = shared.gateway.probe(&shared.endpoint);
        tokio::select! {
            reachable = probing => {
                if reachable {
                    return Ok(());
                }
            }
            changed = exit.changed() => {
                return Err(ServiceError::BackendCrashed {
                    reason: readiness::exit_reason(changed.is_ok(), exit),
                });
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ServiceError::StartupTimeout {
                timeout: shared.startup_timeout.unwrap_or_default(),
            });
        }
        let delay = CONFIRM_PROBE_DELAY.min((deadline - now) / 3);
        tokio::select! {
            () = sleep(delay) => {}
            changed = exit.changed() => {
                return Err(ServiceError::BackendCrashed {
                    reason: readiness::exit_reason(changed.is_ok(), exit),
                });
            }
        }
    }
}

/// Watch a ready backend for fatal log lines or an unexpected exit.
///
/// On crash: waiters cannot exist (the queue drained at promotion), but all
/// in-flight requests are failed through the generation's crash token and
/// the supervisor returns to Idle. A restart only happens on the next
/// explicit `ensure_started`, never automatically.
fn spawn_crash_monitor(
    shared: Arc<Shared>,
    generation: Arc<Generation>,
    mut lines: mpsc::Receiver<OutputLine>,
    mut exit: watch::Receiver<Option<ExitInfo>>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = exit.changed() => {
                    let reason = readiness::exit_reason(changed.is_ok(), &exit);
                    handle_crash(&shared, &generation, reason);
                    return;
                }
                line = lines.recv() => match line {
                    Some(line) => {
                        debug!(stream = ?line.stream, "{}", line.text);
                        if line.text.contains(readiness::FATAL_MARKER) {
                            handle_crash(
                                &shared,
                                &generation,
                                format!("unexpected backend exception: {}", line.text),
                            );
                            return;
                        }
                    }
                    None => {
                        let changed = exit.changed().await;
                        let reason = readiness::exit_reason(changed.is_ok(), &exit);
                        handle_crash(&shared, &generation, reason);
                        return;
                    }
                }
            }
        }
    });
}

fn handle_crash(shared: &Arc<Shared>, generation: &Arc<Generation>, reason: String) {
    let torn = {
        let mut inner = shared.state.lock().unwrap();
        if inner.epoch != generation.epoch {
            // The process was stopped deliberately; this exit is expected.
            debug!(endpoint = %shared.endpoint, "ignoring exit of stopped process");
            return;
        }
        teardown(&mut inner)
    };

    warn!(endpoint = %shared.endpoint, %reason, "backend crashed");
    if let Some(crashed) = torn.crashed {
        crashed.cancel();
    }
    for waiter in torn.waiters {
        let _ = waiter.send(Err(ServiceError::BackendCrashed {
            reason: reason.clone(),
        }));
    }
    if let Some(kill) = torn.kill {
        kill.kill();
    }
    shared.events.broadcast(ServiceEvent::Error {
        message: format!("backend crashed: {reason}"),
    });
}

/// Reschedule-until-idle loop.
///
/// Wakes after the remaining delay and re-derives the elapsed idle time;
/// a nonzero pending count means an exchange is in flight and counts as
/// activity, so the elapsed time is treated as zero for that check.
fn spawn_idle_timer(shared: Arc<Shared>, generation: Arc<Generation>, idle_timeout: Duration) {
    tokio::spawn(async move {
        let mut delay = idle_timeout;
        loop {
            sleep(delay).await;

            let stopped = {
                let mut inner = shared.state.lock().unwrap();
                if inner.epoch != generation.epoch {
                    return;
                }
                let idle = if generation.pending.load(Ordering::SeqCst) > 0 {
                    Duration::ZERO
                } else {
                    generation.last_activity.lock().unwrap().elapsed()
                };
                if idle >= idle_timeout {
                    let torn = teardown(&mut inner);
                    if let Some(kill) = torn.kill {
                        kill.kill();
                    }
                    true
                } else {
                    delay = idle_timeout - idle;
                    false
                }
            };

            if stopped {
                info!(
                    endpoint = %shared.endpoint,
                    timeout_ms = idle_timeout.as_millis() as u64,
                    "backend stopped after idle timeout"
                );
                shared.events.broadcast(ServiceEvent::Stopped {
                    reason: "idle timeout".to_string(),
                });
                return;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct RefusingLauncher;

    #[async_trait]
    impl ProcessLauncher for RefusingLauncher {
        async fn launch(&self, _spec: &LaunchSpec) -> Result<LaunchedProcess, ServiceError> {
            Err(ServiceError::LaunchFailure("refused".to_string()))
        }
    }

    fn service(config: &ServiceConfig) -> CompilerService {
        CompilerService::new(
            config,
            Arc::new(RefusingLauncher),
            Arc::new(ccwr_core::ports::FixedRuntimeLocator::new("/usr/bin/java")),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn ensure_started_without_launch_args_fails() {
        let svc = service(&ServiceConfig::remote("http://localhost:8081"));
        let err = svc.ensure_started().await.unwrap_err();
        assert!(matches!(err, ServiceError::NothingToStart));
    }

    #[tokio::test]
    async fn launch_failure_reaches_the_caller_and_resets_state() {
        let svc = service(&ServiceConfig::new("/opt/cc/runner.jar"));
        let err = svc.ensure_started().await.unwrap_err();
        assert!(matches!(err, ServiceError::LaunchFailure(_)));
        assert!(!svc.is_ready());
        assert!(!svc.is_starting());
    }

    #[tokio::test]
    async fn stop_on_idle_service_is_a_noop() {
        let svc = service(&ServiceConfig::new("/opt/cc/runner.jar"));
        svc.stop(None);
        assert!(!svc.is_ready());
    }

    #[test]
    fn teardown_drains_starting_state() {
        let (tx, mut rx) = oneshot::channel();
        let mut inner = Inner {
            state: State::Starting(Starting {
                waiters: vec![tx],
                kill: None,
            }),
            epoch: 3,
        };

        let torn = teardown(&mut inner);
        assert_eq!(torn.waiters.len(), 1);
        assert!(torn.kill.is_none());
        assert_eq!(inner.epoch, 4);
        assert!(matches!(inner.state, State::Idle));

        drop(torn);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn flight_guard_balances_pending_count() {
        let generation = Arc::new(Generation {
            epoch: 1,
            kill: KillHandle::new(),
            crashed: CancellationToken::new(),
            pending: AtomicUsize::new(0),
            last_activity: Mutex::new(Instant::now()),
        });

        {
            let _a = FlightGuard::begin(Arc::clone(&generation));
            let _b = FlightGuard::begin(Arc::clone(&generation));
            assert_eq!(generation.pending.load(Ordering::SeqCst), 2);
        }
        assert_eq!(generation.pending.load(Ordering::SeqCst), 0);
    }
}
