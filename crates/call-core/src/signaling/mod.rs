//! Signaling contract
//!
//! The call core never talks to a socket directly. It publishes
//! [`SignalingMessage`]s through a [`SignalingPort`] and consumes the
//! messages the port delivers on its subscription channel. The pairing
//! server, message framing and reconnection all live behind the port.
//!
//! ```text
//!   SessionController ──publish──▶ SignalingPort ──▶ pairing server / peer
//!          ▲                            │
//!          └──────── subscribe ◀────────┘
//! ```
//!
//! Messages for one room are expected in send order. Nothing is assumed
//! across rooms or across the transport's own connect/disconnect notices.

pub mod memory;
pub mod wire;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::CallResult;

/// Opaque room identifier issued by the pairing server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Wrap a server-issued identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Which side of a pairing sends the offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Builds and sends the Offer
    Initiator,
    /// Waits for the Offer and answers it
    Responder,
}

/// Transport-layer connectivity candidate, in the browser JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// The `candidate:` attribute line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the m-line the candidate belongs to
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate without m-line association
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    /// Attach the media id and m-line index
    pub fn with_mid(mut self, sdp_mid: impl Into<String>, sdp_mline_index: u16) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self.sdp_mline_index = Some(sdp_mline_index);
        self
    }
}

/// Every message the core sends or receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Ask the pairing server for a partner
    FindPartner,

    /// Pairing established
    PartnerFound {
        /// Room shared with the partner
        #[serde(rename = "roomId")]
        room_id: RoomId,
        /// Our side of the pairing
        role: Role,
    },

    /// Initiator's session description
    Offer {
        /// Room the description belongs to
        #[serde(rename = "roomId")]
        room_id: RoomId,
        /// SDP text
        sdp: String,
    },

    /// Responder's session description
    Answer {
        /// Room the description belongs to
        #[serde(rename = "roomId")]
        room_id: RoomId,
        /// SDP text
        sdp: String,
    },

    /// Connectivity candidate for the partner
    IceCandidate {
        /// Room the candidate belongs to
        #[serde(rename = "roomId")]
        room_id: RoomId,
        /// The candidate
        candidate: IceCandidate,
    },

    /// Voluntary termination
    Hangup {
        /// Room being left
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },

    /// The signaling channel came (back) up; local notification only
    #[serde(skip)]
    TransportConnected,

    /// The signaling channel went away; local notification only
    #[serde(skip)]
    TransportDisconnected,
}

impl SignalingMessage {
    /// Room the message is addressed to, if any
    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            Self::PartnerFound { room_id, .. }
            | Self::Offer { room_id, .. }
            | Self::Answer { room_id, .. }
            | Self::IceCandidate { room_id, .. }
            | Self::Hangup { room_id } => Some(room_id),
            Self::FindPartner | Self::TransportConnected | Self::TransportDisconnected => None,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FindPartner => "find_partner",
            Self::PartnerFound { .. } => "partner_found",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::Hangup { .. } => "hangup",
            Self::TransportConnected => "transport_connected",
            Self::TransportDisconnected => "transport_disconnected",
        }
    }

    /// Whether the message only exists on this side of the transport
    pub fn is_local_only(&self) -> bool {
        matches!(self, Self::TransportConnected | Self::TransportDisconnected)
    }
}

/// Inbound side of a signaling subscription
pub type SignalingStream = mpsc::Receiver<SignalingMessage>;

/// Publish/subscribe interface to the signaling channel
///
/// Implementations own delivery, framing and reconnection. Connectivity
/// changes are reported in-band as [`SignalingMessage::TransportConnected`]
/// and [`SignalingMessage::TransportDisconnected`].
#[async_trait]
pub trait SignalingPort: Send + Sync {
    /// Send a message to the pairing server or, via it, to the partner
    async fn publish(&self, message: SignalingMessage) -> CallResult<()>;

    /// Take the inbound message stream.
    ///
    /// Called once by the session controller at construction.
    fn subscribe(&self) -> CallResult<SignalingStream>;

    /// Whether the channel is currently usable
    fn is_connected(&self) -> bool;
}
