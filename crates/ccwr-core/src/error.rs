//! Error taxonomy for the supervisor and its request path.
//!
//! Process-level failures (prerequisite, launch, crash, startup timeout)
//! terminate the current startup attempt and return the supervisor to Idle;
//! per-request failures affect only the single exchange that produced them.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the supervisor, the request gateway, and the registry.
///
/// The enum is `Clone` because a single startup failure is delivered to every
/// waiter queued on that attempt.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    // === Startup ===
    /// No usable Java runtime could be located.
    #[error("no usable Java runtime found: {0}")]
    PrerequisiteMissing(String),

    /// The backend process could not be spawned.
    #[error("failed to launch backend process: {0}")]
    LaunchFailure(String),

    /// The backend exited or raised a fatal exception.
    #[error("backend crashed: {reason}")]
    BackendCrashed {
        /// What was observed: an exit status or a fatal log line.
        reason: String,
    },

    /// Readiness was not confirmed within the configured startup budget.
    ///
    /// Distinct from [`ServiceError::BackendCrashed`] so callers can tell
    /// "never came up" from "came up and died".
    #[error("backend not ready within {}ms", .timeout.as_millis())]
    StartupTimeout {
        /// The configured startup budget.
        timeout: Duration,
    },

    /// The service was stopped explicitly while the caller was outstanding.
    #[error("service stopped: {reason}")]
    UserInitiatedStop {
        /// Reason passed to `stop`.
        reason: String,
    },

    /// The service has no launch arguments configured.
    ///
    /// URL-only services proxy to an externally managed backend and cannot
    /// be started locally.
    #[error("nothing to start: service has no launch arguments configured")]
    NothingToStart,

    // === Per-request ===
    /// Socket or connection failure before an HTTP status was received.
    #[error("request transport failed: {0}")]
    TransportFailure(String),

    /// The backend answered with a non-200 status.
    #[error("backend returned HTTP {status} {message}")]
    HttpStatusFailure {
        /// HTTP status code.
        status: u16,
        /// Canonical status message.
        message: String,
    },

    /// The backend answered 200 but the body was not valid JSON.
    #[error("backend response was not valid JSON: {0}")]
    DecodeFailure(String),

    // === Configuration ===
    /// The configured endpoint URL could not be parsed or normalized.
    #[error("invalid endpoint URL {url}: {reason}")]
    InvalidEndpoint {
        /// The offending URL as configured.
        url: String,
        /// Parser diagnostic.
        reason: String,
    },
}

impl ServiceError {
    /// Whether this failure terminates a startup attempt (as opposed to a
    /// single request exchange).
    pub fn is_process_level(&self) -> bool {
        matches!(
            self,
            Self::PrerequisiteMissing(_)
                | Self::LaunchFailure(_)
                | Self::BackendCrashed { .. }
                | Self::StartupTimeout { .. }
                | Self::UserInitiatedStop { .. }
        )
    }
}

/// Result type alias for supervisor operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_timeout_reports_millis() {
        let err = ServiceError::StartupTimeout {
            timeout: Duration::from_millis(5000),
        };
        assert_eq!(err.to_string(), "backend not ready within 5000ms");
    }

    #[test]
    fn process_level_classification() {
        assert!(
            ServiceError::BackendCrashed {
                reason: "exit code 1".into()
            }
            .is_process_level()
        );
        assert!(
            !ServiceError::HttpStatusFailure {
                status: 500,
                message: "Internal Server Error".into()
            }
            .is_process_level()
        );
        assert!(!ServiceError::DecodeFailure("trailing garbage".into()).is_process_level());
    }
}
