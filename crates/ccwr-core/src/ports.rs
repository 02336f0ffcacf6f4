//! Port traits and process-handle types.
//!
//! The supervisor state machine is written against these seams so the OS
//! adapters (Java discovery, process spawning) can be replaced by test
//! doubles. Implementations live in `ccwr-runtime`.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;

/// Which pipe a decoded output line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One decoded line of backend output.
#[derive(Debug, Clone)]
pub struct OutputLine {
    /// Source pipe.
    pub stream: OutputStream,
    /// Line content, newline stripped, lossily decoded.
    pub text: String,
}

/// How a backend process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, when killed (Unix).
    pub signal: Option<i32>,
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Idempotent kill request for a launched process.
///
/// Killing an already-dead or already-killed process is a no-op; the handle
/// is safe to trigger from multiple transition paths concurrently.
#[derive(Debug, Clone)]
pub struct KillHandle {
    token: CancellationToken,
}

impl KillHandle {
    /// Create a fresh handle.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Request termination of the process.
    pub fn kill(&self) {
        self.token.cancel();
    }

    /// Whether a kill has been requested.
    pub fn is_killed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once a kill has been requested. Used by the process steward.
    pub async fn killed(&self) {
        self.token.cancelled().await;
    }
}

impl Default for KillHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// What to launch: an executable plus its argument vector.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Resolved runtime executable.
    pub command: PathBuf,
    /// Arguments, already constructed from the service configuration.
    pub args: Vec<String>,
}

/// A launched backend process as seen by the supervisor.
///
/// The supervisor owns this handle exclusively; no other component may kill
/// or restart the underlying process.
#[derive(Debug)]
pub struct LaunchedProcess {
    /// OS process id, when the platform reports one.
    pub pid: Option<u32>,
    /// Merged stdout/stderr lines.
    pub lines: mpsc::Receiver<OutputLine>,
    /// Becomes `Some` once the process has terminated.
    pub exit: watch::Receiver<Option<ExitInfo>>,
    /// Idempotent kill request.
    pub kill: KillHandle,
}

/// Launches backend processes.
///
/// Fails with [`ServiceError::LaunchFailure`] before any output is produced
/// when the command cannot be executed.
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess, ServiceError>;
}

/// Locates the runtime executable required to launch the backend.
///
/// Fails with [`ServiceError::PrerequisiteMissing`] when no acceptable
/// runtime can be found.
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait RuntimeLocator: Send + Sync {
    async fn locate(&self) -> Result<PathBuf, ServiceError>;
}

/// A locator that always answers with a fixed, caller-supplied path.
///
/// Useful when the embedder already knows its Java installation.
#[derive(Debug, Clone)]
pub struct FixedRuntimeLocator {
    path: PathBuf,
}

impl FixedRuntimeLocator {
    /// Locator answering with `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RuntimeLocator for FixedRuntimeLocator {
    async fn locate(&self) -> Result<PathBuf, ServiceError> {
        Ok(self.path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_info_display() {
        let exited = ExitInfo {
            code: Some(1),
            signal: None,
        };
        assert_eq!(exited.to_string(), "exit code 1");

        let killed = ExitInfo {
            code: None,
            signal: Some(9),
        };
        assert_eq!(killed.to_string(), "signal 9");
    }

    #[test]
    fn kill_handle_is_idempotent() {
        let handle = KillHandle::new();
        assert!(!handle.is_killed());
        handle.kill();
        handle.kill();
        assert!(handle.is_killed());
    }

    #[tokio::test]
    async fn fixed_locator_returns_configured_path() {
        let locator = FixedRuntimeLocator::new("/usr/bin/java");
        let path = locator.locate().await.unwrap();
        assert_eq!(path, PathBuf::from("/usr/bin/java"));
    }
}
