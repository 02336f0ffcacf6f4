//! Readiness detection over the backend's output stream.
//!
//! The runner jar logs a marker line once its HTTP server is up and a
//! distinctive line when the JVM dies on an uncaught exception. Startup
//! classification watches for both, plus the process exit notification,
//! and settles exactly once per process lifetime.

use tokio::sync::{mpsc, watch};
use tracing::debug;

use ccwr_core::ports::{ExitInfo, OutputLine};

/// Log marker printed once the embedded HTTP server accepts connections.
pub const READY_MARKER: &str = "Server:main: Started";

/// Log marker printed when the JVM dies on an uncaught exception.
pub const FATAL_MARKER: &str = "Exception in thread \"main\"";

/// Outcome of a startup attempt, as read from the process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupSignal {
    /// The ready marker was seen.
    Ready,
    /// The process died or logged a fatal exception before becoming ready.
    Crashed(String),
}

/// Watch the output stream until the backend is ready or has crashed.
///
/// Lines that match neither marker are logged and otherwise ignored. The
/// caller bounds this wait with the startup timeout; the streams themselves
/// stay usable afterwards (the ready path keeps consuming them for crash
/// monitoring).
pub async fn await_startup(
    lines: &mut mpsc::Receiver<OutputLine>,
    exit: &mut watch::Receiver<Option<ExitInfo>>,
) -> StartupSignal {
    loop {
        tokio::select! {
            changed = exit.changed() => {
                return StartupSignal::Crashed(exit_reason(changed.is_ok(), exit));
            }
            line = lines.recv() => match line {
                Some(line) => {
                    debug!(stream = ?line.stream, "{}", line.text);
                    if line.text.contains(READY_MARKER) {
                        return StartupSignal::Ready;
                    }
                    if line.text.contains(FATAL_MARKER) {
                        return StartupSignal::Crashed(format!(
                            "unexpected backend exception: {}",
                            line.text
                        ));
                    }
                }
                None => {
                    // Output closed without a marker; the exit notification
                    // carries the authoritative cause.
                    let changed = exit.changed().await;
                    return StartupSignal::Crashed(exit_reason(changed.is_ok(), exit));
                }
            }
        }
    }
}

/// Describe a process exit observed through the watch channel.
pub fn exit_reason(notified: bool, exit: &watch::Receiver<Option<ExitInfo>>) -> String {
    match (notified, *exit.borrow()) {
        (true, Some(info)) => format!("backend exited unexpectedly ({info})"),
        _ => "backend process handle was lost".to_string(),
    }
}
