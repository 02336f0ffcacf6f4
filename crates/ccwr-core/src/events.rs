//! Service lifecycle events for event-driven bindings.
//!
//! The callback-style request API and these events are layered on the same
//! state machine; subscribers get notified of lifecycle transitions without
//! participating in the request path.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Broadcast channel capacity for lifecycle events.
const CHANNEL_CAPACITY: usize = 64;

/// A lifecycle transition observable from outside the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServiceEvent {
    /// The runtime was resolved and the backend process launched.
    Online {
        /// OS process id, when the platform reports one.
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },

    /// Readiness was confirmed; the backend accepts requests.
    #[serde(rename_all = "camelCase")]
    Ready {
        /// Normalized base URL of the backend.
        base_url: String,
    },

    /// A fatal startup failure or crash.
    Error {
        /// Human-readable failure description.
        message: String,
    },

    /// The backend process was stopped.
    Stopped {
        /// Why the process was stopped (explicit stop, idle timeout).
        reason: String,
    },
}

/// Broadcaster for lifecycle events.
///
/// One broadcaster per supervisor; constructed with it, never global.
pub struct EventBroadcaster {
    sender: broadcast::Sender<ServiceEvent>,
}

impl EventBroadcaster {
    /// Create a new broadcaster.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Broadcast an event to all subscribers.
    pub fn broadcast(&self, event: ServiceEvent) {
        if self.sender.receiver_count() > 0 {
            debug!(?event, "broadcasting lifecycle event");
            let _ = self.sender.send(event);
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
