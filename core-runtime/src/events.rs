//! # Driver Event Bus
//!
//! Broadcast channel through which a driver reports what it is doing, for
//! hosts that want to observe connection health or request outcomes without
//! attaching a callback to every request.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    emit     ┌───────────┐    subscribe    ┌────────────┐
//! │  event loop  ├────────────>│ EventBus  ├────────────────>│ Subscriber │
//! └──────────────┘             │ (broadcast│                 └────────────┘
//! ┌──────────────┐    emit     │  channel) │    subscribe    ┌────────────┐
//! │ caller paths ├────────────>│           ├────────────────>│ Subscriber │
//! └──────────────┘             └───────────┘                 └────────────┘
//! ```
//!
//! Emission never blocks. Events emitted while nobody is subscribed are
//! dropped, and subscribers that fall behind receive `RecvError::Lagged`.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{DriverEvent, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(16);
//! let mut events = bus.subscribe();
//!
//! bus.emit(DriverEvent::Connected);
//! assert_eq!(events.recv().await.unwrap(), DriverEvent::Connected);
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::RecvError;
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 64;

// ============================================================================
// Event Types
// ============================================================================

/// Final outcome of a request, as reported on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", content = "error")]
pub enum RequestOutcome {
    Success,
    Failed(String),
}

/// Something a driver did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum DriverEvent {
    /// The server connection became ready.
    Connected,
    /// The server connection failed or terminated.
    ConnectionLost { reason: String },
    /// The driver was closed.
    Closed,
    /// A sample was uploaded into the server cache.
    SampleUploaded { name: String },
    /// A request started playing, either from the server cache or as a
    /// direct stream.
    PlaybackStarted { id: u32, direct: bool },
    /// A tracked request delivered its final result.
    RequestFinished { id: u32, outcome: RequestOutcome },
}

impl DriverEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &'static str {
        match self {
            DriverEvent::Connected => "Connected to sound server",
            DriverEvent::ConnectionLost { .. } => "Lost connection to sound server",
            DriverEvent::Closed => "Driver closed",
            DriverEvent::SampleUploaded { .. } => "Sample uploaded to server cache",
            DriverEvent::PlaybackStarted { direct: true, .. } => "Direct stream started",
            DriverEvent::PlaybackStarted { direct: false, .. } => "Cached sample started",
            DriverEvent::RequestFinished { .. } => "Request finished",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            DriverEvent::ConnectionLost { .. }
                | DriverEvent::RequestFinished {
                    outcome: RequestOutcome::Failed(_),
                    ..
                }
        )
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central broadcast channel for [`DriverEvent`]s.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DriverEvent>,
}

impl EventBus {
    /// Creates a new event bus buffering up to `capacity` events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received it; `0` when nobody
    /// is listening.
    pub fn emit(&self, event: DriverEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Each call creates an independent receiver for all future events.
    pub fn subscribe(&self) -> Receiver<DriverEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
