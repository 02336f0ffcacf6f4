//! Graceful shutdown for `tokio::process::Child` with SIGTERM → SIGKILL escalation.

use std::io;
use std::process::ExitStatus;

use tokio::process::Child;

#[cfg(unix)]
use std::time::Duration;
#[cfg(unix)]
use tokio::time::timeout;

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Grace period between SIGTERM and SIGKILL.
#[cfg(unix)]
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Shut down a child process, preferring a graceful exit.
///
/// On Unix: SIGTERM, wait up to five seconds, then SIGKILL. On other
/// platforms the process is terminated immediately. The child is always
/// reaped before returning.
pub async fn shutdown_child(child: &mut Child) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        shutdown_unix(child).await
    }

    #[cfg(not(unix))]
    {
        child.kill().await?;
        child.wait().await
    }
}

#[cfg(unix)]
async fn shutdown_unix(child: &mut Child) -> io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped; wait returns the cached status.
        return child.wait().await;
    };

    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        if e == nix::errno::Errno::ESRCH {
            return child.wait().await;
        }
        return Err(io::Error::other(e));
    }

    if let Ok(result) = timeout(TERM_GRACE, child.wait()).await {
        return result;
    }

    // Grace period elapsed; escalate.
    child.kill().await?;
    child.wait().await
}
