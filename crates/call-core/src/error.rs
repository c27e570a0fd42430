//! Error types for the call core
//!
//! Errors are grouped the way the call lifecycle treats them:
//!
//! - **Capability** - media or peer engine unavailable; fatal to the attempt,
//!   reported to the user, never retried automatically
//! - **Negotiation** - the engine rejected a description; the session is torn
//!   down and auto-search may retry
//! - **Transport** - the signaling channel is gone; searching is suspended
//!   until it comes back
//! - **StaleEvent** - a message or callback for a session that no longer
//!   exists; dropped silently
//! - **CandidateApply** - a single bad ICE candidate; logged, the call goes on

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for call core operations
pub type CallResult<T> = Result<T, CallError>;

/// Errors that can occur in the call core
#[derive(Debug, Error)]
pub enum CallError {
    /// Media capture or peer engine unavailable
    #[error("Capability unavailable: {message}")]
    Capability {
        /// What went wrong
        message: String,
    },

    /// Session description exchange rejected by the peer engine
    #[error("Negotiation failed: {message}")]
    Negotiation {
        /// What went wrong
        message: String,
    },

    /// Signaling channel unavailable or disconnected
    #[error("Signaling transport error: {message}")]
    Transport {
        /// What went wrong
        message: String,
    },

    /// Event referencing a room that is no longer the active session
    #[error("Stale event for room {room_id}")]
    StaleEvent {
        /// Room the event was addressed to
        room_id: String,
    },

    /// Remote ICE candidate could not be applied
    #[error("Failed to apply ICE candidate: {message}")]
    CandidateApply {
        /// What went wrong
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration {
        /// What went wrong
        message: String,
    },

    /// Operation not valid in the current call state
    #[error("Invalid state: {message}")]
    InvalidState {
        /// What went wrong
        message: String,
    },

    /// Wire encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (configuration files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The session controller task has stopped
    #[error("Session controller has shut down")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {message}")]
    Internal {
        /// What went wrong
        message: String,
    },
}

/// Error categories for event classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Media or engine capability problem
    Capability,
    /// SDP negotiation problem
    Negotiation,
    /// Signaling transport problem
    Transport,
    /// Event for a retired session
    Stale,
    /// ICE candidate problem
    Candidate,
    /// Configuration problem
    Configuration,
    /// Everything else
    Internal,
}

impl CallError {
    /// Create a capability error
    pub fn capability(message: impl Into<String>) -> Self {
        Self::Capability {
            message: message.into(),
        }
    }

    /// Create a negotiation error
    pub fn negotiation(message: impl Into<String>) -> Self {
        Self::Negotiation {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a stale event error
    pub fn stale(room_id: impl Into<String>) -> Self {
        Self::StaleEvent {
            room_id: room_id.into(),
        }
    }

    /// Create a candidate apply error
    pub fn candidate(message: impl Into<String>) -> Self {
        Self::CandidateApply {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify the error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Capability { .. } => ErrorCategory::Capability,
            Self::Negotiation { .. } => ErrorCategory::Negotiation,
            Self::Transport { .. } => ErrorCategory::Transport,
            Self::StaleEvent { .. } => ErrorCategory::Stale,
            Self::CandidateApply { .. } => ErrorCategory::Candidate,
            Self::Configuration { .. } | Self::Io(_) => ErrorCategory::Configuration,
            Self::InvalidState { .. }
            | Self::Serialization(_)
            | Self::Shutdown
            | Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Whether the error should be shown to the user.
    ///
    /// Only capability and negotiation failures surface as text; every other
    /// kind is handled inside the controller.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::Capability { .. } | Self::Negotiation { .. })
    }

    /// Whether a failed pairing caused by this error may be retried by auto-search
    pub fn allows_rematch(&self) -> bool {
        !matches!(
            self,
            Self::Capability { .. } | Self::Transport { .. } | Self::Configuration { .. } | Self::Shutdown
        )
    }
}
