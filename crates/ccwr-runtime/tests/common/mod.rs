//! Shared test harness: a scripted process launcher and an axum stub
//! standing in for the web-runner backend.

#![allow(dead_code)] // not every test binary uses every helper

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::RawQuery;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};

use ccwr_core::error::ServiceError;
use ccwr_core::ports::{
    ExitInfo, KillHandle, LaunchSpec, LaunchedProcess, OutputLine, OutputStream, ProcessLauncher,
};
use ccwr_runtime::{READY_MARKER, ServiceConfig};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Control handles for one scripted backend process.
pub struct ProcessScript {
    lines: mpsc::Sender<OutputLine>,
    exit: watch::Sender<Option<ExitInfo>>,
    kill: KillHandle,
}

impl ProcessScript {
    pub async fn emit_line(&self, text: &str) {
        self.lines
            .send(OutputLine {
                stream: OutputStream::Stdout,
                text: text.to_string(),
            })
            .await
            .expect("script line receiver dropped");
    }

    /// Print the readiness marker, as the runner jar does once its HTTP
    /// server is up.
    pub async fn emit_ready(&self) {
        self.emit_line(&format!("2024-05-01 12:00:00 INFO {READY_MARKER} @523ms"))
            .await;
    }

    /// Print a fatal JVM exception line.
    pub async fn emit_fatal(&self, detail: &str) {
        self.emit_line(&format!("Exception in thread \"main\" {detail}"))
            .await;
    }

    /// Terminate the scripted process with an exit code.
    pub fn exit_with(&self, code: i32) {
        let _ = self.exit.send(Some(ExitInfo {
            code: Some(code),
            signal: None,
        }));
    }

    /// Whether the supervisor asked this process to die.
    pub fn is_killed(&self) -> bool {
        self.kill.is_killed()
    }
}

/// [`ProcessLauncher`] double handing out pre-armed scripted processes.
pub struct ScriptedLauncher {
    spawns: AtomicUsize,
    pending: Mutex<VecDeque<LaunchedProcess>>,
}

impl ScriptedLauncher {
    /// Build a launcher with `count` scripted processes, plus the control
    /// handles to drive them in launch order.
    pub fn with_processes(count: usize) -> (Arc<Self>, Vec<ProcessScript>) {
        let mut pending = VecDeque::with_capacity(count);
        let mut scripts = Vec::with_capacity(count);
        for i in 0..count {
            let (line_tx, line_rx) = mpsc::channel(64);
            let (exit_tx, exit_rx) = watch::channel(None);
            let kill = KillHandle::new();
            pending.push_back(LaunchedProcess {
                pid: Some(40_000 + i as u32),
                lines: line_rx,
                exit: exit_rx,
                kill: kill.clone(),
            });
            scripts.push(ProcessScript {
                lines: line_tx,
                exit: exit_tx,
                kill,
            });
        }
        (
            Arc::new(Self {
                spawns: AtomicUsize::new(0),
                pending: Mutex::new(pending),
            }),
            scripts,
        )
    }

    /// How many processes have been launched through this double.
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessLauncher for ScriptedLauncher {
    async fn launch(&self, _spec: &LaunchSpec) -> Result<LaunchedProcess, ServiceError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        self.pending
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ServiceError::LaunchFailure("no scripted process available".to_string()))
    }
}

/// What the stub backend's compile endpoint should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileBehavior {
    /// Answer 200 with the payload echoed back.
    Echo,
    /// Answer 500.
    Fail500,
    /// Accept the request and never answer.
    Hang,
}

/// A running stub backend bound to an ephemeral port.
pub struct StubBackend {
    pub port: u16,
}

impl StubBackend {
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Service configuration pointing a locally supervised backend at this
    /// stub.
    pub fn local_config(&self) -> ServiceConfig {
        ServiceConfig::new("/opt/cc/cc-web-runner-standalone-1.0.5.jar").with_url(self.base_url())
    }
}

/// Bind and serve a stub web-runner on an ephemeral port.
pub async fn spawn_stub_backend(compile: CompileBehavior) -> StubBackend {
    let router = Router::new()
        .route(
            "/status",
            get(|RawQuery(query): RawQuery| async move {
                Json(json!({
                    "name": "closure-compiler",
                    "status": "ok",
                    "query": query,
                }))
            }),
        )
        .route(
            "/externs",
            get(|| async { Json(json!(["es3.js", "es5.js", "browser/w3c_dom1.js"])) }),
        )
        .route("/compile", compile_route(compile))
        .route("/notjson", get(|| async { "this is not json" }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind stub backend");
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("stub backend failed");
    });

    StubBackend { port }
}

fn compile_route(behavior: CompileBehavior) -> axum::routing::MethodRouter {
    match behavior {
        CompileBehavior::Echo => post(|Json(body): Json<Value>| async move {
            Json(json!({
                "compiledCode": "console.log(33);",
                "echo": body,
            }))
        }),
        CompileBehavior::Fail500 => post(|Json(_body): Json<Value>| async move {
            (StatusCode::INTERNAL_SERVER_ERROR, "compiler backend error")
        }),
        CompileBehavior::Hang => post(|Json(_body): Json<Value>| async move {
            std::future::pending::<()>().await;
            Json(json!({}))
        }),
    }
}

/// Spin (yield only, no timers) until `cond` holds. Safe under paused time.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..5_000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached after 5000 yields");
}

/// Poll `cond` with short sleeps, up to `timeout`. For real-time tests.
pub async fn eventually(mut cond: impl FnMut() -> bool, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within {timeout:?}");
}
