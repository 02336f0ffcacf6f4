//! Backend process launcher built on `tokio::process`.
//!
//! Spawns the runtime executable with piped stdio, decodes both pipes into
//! a merged line stream, and parks a steward task on the child that reports
//! termination and services kill requests. The backend jar (like other JVM
//! tooling) can emit non-UTF8 bytes, so lines are read byte-wise and decoded
//! lossily rather than trusting `BufReader::lines()`.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use ccwr_core::error::ServiceError;
use ccwr_core::ports::{
    ExitInfo, KillHandle, LaunchSpec, LaunchedProcess, OutputLine, OutputStream, ProcessLauncher,
};

use crate::shutdown::shutdown_child;

/// Buffered lines per process before readers apply backpressure.
const LINE_CHANNEL_CAPACITY: usize = 64;

/// [`ProcessLauncher`] implementation spawning real OS processes.
#[derive(Debug, Clone, Default)]
pub struct JavaLauncher;

impl JavaLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessLauncher for JavaLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess, ServiceError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            ServiceError::LaunchFailure(format!(
                "failed to spawn {}: {e}",
                spec.command.display()
            ))
        })?;

        let pid = child.id();
        debug!(command = %spec.command.display(), args = ?spec.args, pid = ?pid, "backend process spawned");

        let (line_tx, line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, OutputStream::Stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, OutputStream::Stderr, line_tx);
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = KillHandle::new();

        let steward_kill = kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status.ok(),
                () = steward_kill.killed() => None,
            };
            let status = match status {
                Some(status) => Some(status),
                None => {
                    // Kill requested before the child exited on its own.
                    debug!(pid = ?pid, "kill requested, shutting down backend process");
                    match shutdown_child(&mut child).await {
                        Ok(status) => Some(status),
                        Err(e) => {
                            warn!(pid = ?pid, error = %e, "failed to shut down backend process");
                            None
                        }
                    }
                }
            };

            let info = status.map_or(
                ExitInfo {
                    code: None,
                    signal: None,
                },
                exit_info,
            );
            debug!(pid = ?pid, %info, "backend process terminated");
            let _ = exit_tx.send(Some(info));
        });

        Ok(LaunchedProcess {
            pid,
            lines: line_rx,
            exit: exit_rx,
            kill,
        })
    }
}

fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitInfo {
        code: status.code(),
        signal,
    }
}

fn spawn_line_reader(
    stream: impl AsyncRead + Unpin + Send + 'static,
    origin: OutputStream,
    tx: mpsc::Sender<OutputLine>,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf: Vec<u8> = Vec::with_capacity(1024);

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                    }

                    let line = OutputLine {
                        stream: origin,
                        text: String::from_utf8_lossy(&buf).to_string(),
                    };
                    if tx.send(line).await.is_err() {
                        break; // receiver gone, stop decoding
                    }
                }
                Err(e) => {
                    debug!(?origin, error = %e, "output reader exiting due to read error");
                    break;
                }
            }
        }

        debug!(?origin, "output reader task exiting");
    });
}
