//! Shared types for the call core
//!
//! - **CallStatus** - what the presentation layer observes
//! - **EndReason** - why a pairing ended, and whether it may be retried
//! - **SessionEpoch** - identity of one pairing, used to discard stale results
//! - **SessionStats / SessionSnapshot** - counters and a point-in-time view

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::machine::CallState;
use crate::peer::PeerConnectionState;
use crate::signaling::{Role, RoomId};

/// Status exposed to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallStatus {
    /// Nothing going on
    Idle,
    /// Waiting for the pairing server
    Searching,
    /// Paired, negotiating the peer connection
    Negotiating,
    /// Media is flowing
    Active,
    /// The last attempt failed with a user-visible error
    Error,
}

impl CallStatus {
    /// Status shown for a state machine state; `Closing` has none
    pub fn from_state(state: CallState) -> Option<Self> {
        match state {
            CallState::Idle => Some(Self::Idle),
            CallState::Searching => Some(Self::Searching),
            CallState::Negotiating => Some(Self::Negotiating),
            CallState::Active => Some(Self::Active),
            CallState::Closing => None,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Searching => "searching",
            Self::Negotiating => "negotiating",
            Self::Active => "active",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Why a pairing ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// The user hung up
    LocalHangup,
    /// The user asked for the next partner
    LocalNext,
    /// The partner hung up
    RemoteHangup,
    /// The peer connection reported a terminal state
    ConnectionLost(PeerConnectionState),
    /// Description exchange failed
    NegotiationFailed,
    /// Media or engine unavailable
    CapabilityFailed,
    /// Negotiation did not reach `Active` in time
    Timeout,
    /// The signaling channel went away
    TransportLost,
    /// The controller is shutting down
    Shutdown,
}

impl EndReason {
    /// Whether auto-search may look for a new partner afterwards
    pub fn allows_rematch(&self) -> bool {
        !matches!(self, Self::CapabilityFailed | Self::TransportLost | Self::Shutdown)
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalHangup => f.write_str("local hangup"),
            Self::LocalNext => f.write_str("next partner requested"),
            Self::RemoteHangup => f.write_str("remote hangup"),
            Self::ConnectionLost(state) => write!(f, "peer connection {}", state),
            Self::NegotiationFailed => f.write_str("negotiation failed"),
            Self::CapabilityFailed => f.write_str("capability unavailable"),
            Self::Timeout => f.write_str("negotiation timed out"),
            Self::TransportLost => f.write_str("signaling transport lost"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Identity of one pairing.
///
/// Every asynchronous result and every peer callback carries the epoch it
/// was started under; a mismatch with the live session means the result is
/// stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionEpoch(pub u64);

impl fmt::Display for SessionEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Counters kept for the lifetime of a controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// `FindPartner` requests sent
    pub searches: u64,
    /// Pairings started (PartnerFound or lazily started on an Offer)
    pub pairings: u64,
    /// Pairings that reached `Active`
    pub connected_calls: u64,
    /// Pairings ended by a negotiation error
    pub negotiation_failures: u64,
    /// Pairings abandoned by the negotiation timeout
    pub timeouts: u64,
    /// Pairings ended by the partner
    pub remote_hangups: u64,
    /// Pairings ended by the user (hangup or next)
    pub local_hangups: u64,
    /// Signaling transport losses
    pub transport_losses: u64,
    /// Messages or callbacks dropped because their session was gone
    pub stale_events: u64,
}

/// Point-in-time view of a controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// State machine state
    pub state: CallState,
    /// Room of the live session
    pub room_id: Option<RoomId>,
    /// Role in the live session
    pub role: Option<Role>,
    /// Epoch of the live session
    pub epoch: Option<SessionEpoch>,
    /// Whether a peer link exists
    pub has_peer_link: bool,
    /// Whether the remote description has been applied
    pub remote_description_set: bool,
    /// Remote candidates waiting for the remote description
    pub pending_candidates: usize,
    /// Whether a local capture source is held
    pub holds_local_media: bool,
    /// Auto-search flag
    pub auto_search: bool,
    /// Whether a rematch timer is armed
    pub rematch_pending: bool,
    /// Whether the signaling channel is up
    pub transport_connected: bool,
    /// When the live session reached `Active`
    pub connected_at: Option<DateTime<Utc>>,
    /// Lifetime counters
    pub stats: SessionStats,
}
