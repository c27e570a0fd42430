//! Event system for the call core
//!
//! Everything the presentation layer may want to react to beyond the plain
//! status value is broadcast as a [`CallEvent`]. Slow subscribers lag and
//! lose the oldest events; the controller never waits on them.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::{CallError, ErrorCategory};
use crate::machine::CallState;
use crate::media::TrackKind;
use crate::signaling::{Role, RoomId};
use crate::types::EndReason;

/// Events emitted by the session controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallEvent {
    /// The state machine moved
    StateChanged {
        /// Previous state
        previous: CallState,
        /// New state
        current: CallState,
    },

    /// `FindPartner` was sent
    SearchStarted,

    /// A pairing started (PartnerFound, or an Offer for a fresh room)
    PartnerFound {
        /// Room of the pairing
        room_id: RoomId,
        /// Our role in it
        role: Role,
    },

    /// The peer connection reached `connected`
    CallConnected {
        /// Room of the call
        room_id: RoomId,
    },

    /// A remote track was handed to the renderer
    RemoteMediaReady {
        /// Room of the call
        room_id: RoomId,
        /// Audio or video
        kind: TrackKind,
    },

    /// A pairing ended and its resources were released
    CallEnded {
        /// Room of the pairing
        room_id: RoomId,
        /// Why it ended
        reason: EndReason,
        /// Seconds spent in `Active`, zero if never connected
        duration_secs: u64,
    },

    /// A new `FindPartner` will be sent after `delay_ms`
    RematchScheduled {
        /// Delay in milliseconds
        delay_ms: u64,
    },

    /// The auto-search flag changed
    AutoSearchChanged {
        /// New value
        enabled: bool,
    },

    /// The signaling channel went up or down
    TransportChanged {
        /// Whether the channel is usable
        connected: bool,
    },

    /// A user-visible failure
    Error {
        /// Error category
        category: ErrorCategory,
        /// Message suitable for display
        message: String,
    },
}

impl CallEvent {
    /// Build the error event for `error`
    pub fn from_error(error: &CallError) -> Self {
        Self::Error {
            category: error.category(),
            message: error.to_string(),
        }
    }
}

/// Event stream type
pub type EventStream = BroadcastStream<CallEvent>;

/// Simple event iterator that doesn't require StreamExt
pub struct EventIterator {
    stream: EventStream,
}

impl EventIterator {
    /// Create a new event iterator from a stream
    pub fn new(stream: EventStream) -> Self {
        Self { stream }
    }

    /// Next event; lagged gaps are skipped, `None` once the controller is gone
    pub async fn next(&mut self) -> Option<CallEvent> {
        use tokio_stream::StreamExt;
        while let Some(item) = self.stream.next().await {
            match item {
                Ok(event) => return Some(event),
                Err(lagged) => tracing::warn!("event subscriber lagged: {}", lagged),
            }
        }
        None
    }
}

/// Event emitter for the call core
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<CallEvent>,
}

impl EventEmitter {
    /// Create a new event emitter with the specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event
    pub fn emit(&self, event: CallEvent) {
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> EventStream {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Subscribe to events with a simple iterator
    pub fn subscribe_simple(&self) -> EventIterator {
        EventIterator::new(self.subscribe())
    }

    /// Get the number of active receivers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
