//! Domain types and port definitions for the `ccwr` supervisor.
//!
//! This crate carries the pieces shared by every adapter: the service
//! configuration, the error taxonomy, lifecycle events, and the port traits
//! the state machine is written against. The working implementation lives
//! in `ccwr-runtime`.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod events;
pub mod ports;

pub use config::{DEFAULT_IDLE_TIMEOUT, DEFAULT_URL, ServiceConfig, StatusQuery};
pub use error::{ServiceError, ServiceResult};
pub use events::{EventBroadcaster, ServiceEvent};
pub use ports::{
    ExitInfo, FixedRuntimeLocator, KillHandle, LaunchSpec, LaunchedProcess, OutputLine,
    OutputStream, ProcessLauncher, RuntimeLocator,
};
