//! Process supervision runtime for the Closure Compiler web-runner.
//!
//! This crate wraps the runner jar in a client-side supervisor: it locates
//! a Java runtime, launches the backend with the right arguments, detects
//! readiness from the log stream (confirmed by an active probe when a
//! startup budget is configured), proxies status/compile/externs requests
//! once ready, queues callers that arrive earlier, stops the process on
//! idle timeout or explicit stop, and recovers from unexpected process
//! death.
//!
//! Entry point: build a [`ServiceRegistry`], then
//! [`get_or_create`](ServiceRegistry::get_or_create) the
//! [`CompilerService`] for an endpoint and call its operations.

#![deny(unsafe_code)]

mod gateway;
mod java;
mod launcher;
mod readiness;
mod registry;
mod shutdown;
mod supervisor;

pub use gateway::Gateway;
pub use java::{JAVA_PATH_ENV, JavaLocator};
pub use launcher::JavaLauncher;
pub use readiness::{FATAL_MARKER, READY_MARKER, StartupSignal};
pub use registry::ServiceRegistry;
pub use supervisor::CompilerService;

// Re-export the shared domain surface so embedders need only one crate.
pub use ccwr_core::{
    EventBroadcaster, ServiceConfig, ServiceError, ServiceEvent, ServiceResult, StatusQuery,
};
