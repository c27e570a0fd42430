//! Peer connection contract
//!
//! The media transport engine (ICE, DTLS, SRTP, codecs) is opaque to the
//! core. A [`PeerEngine`] creates [`PeerConnection`]s; each connection
//! reports what happens to it through a channel of [`PeerEvent`]s instead of
//! reassignable callbacks. [`link::PeerLink`] wraps one connection for the
//! state machine.

pub mod link;
#[cfg(feature = "webrtc-engine")]
pub mod webrtc_engine;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::PeerConfig;
use crate::error::CallResult;
use crate::media::{LocalTrack, RemoteTrack};
use crate::signaling::IceCandidate;

pub use link::{PeerLink, TaggedPeerEvent};

/// Connection state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerConnectionState {
    /// Created, nothing attempted yet
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Connectivity lost
    Disconnected,
    /// Connectivity could not be established
    Failed,
    /// Closed locally or by the engine
    Closed,
}

impl PeerConnectionState {
    /// Whether the state ends the call
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SdpType {
    /// Session offer
    Offer,
    /// Session answer
    Answer,
}

/// A typed SDP payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpType,
    /// Raw SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Wrap an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Wrap an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Something the engine observed on a connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Aggregate connection state changed
    ConnectionStateChanged(PeerConnectionState),
    /// A local candidate was gathered and should go to the partner
    LocalCandidate(IceCandidate),
    /// The partner's media arrived
    RemoteTrack(RemoteTrack),
}

/// Where an engine reports connection events
pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// Factory for peer connections
#[async_trait]
pub trait PeerEngine: Send + Sync {
    /// Allocate a connection.
    ///
    /// Fails only when the engine itself is unusable.
    async fn create(&self, config: &PeerConfig, events: PeerEventSender) -> CallResult<Arc<dyn PeerConnection>>;
}

/// One underlying peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach local capture tracks; must happen before the first description
    async fn add_local_tracks(&self, tracks: &[LocalTrack]) -> CallResult<()>;

    /// Produce an offer
    async fn create_offer(&self) -> CallResult<SessionDescription>;

    /// Produce an answer to the applied remote offer
    async fn create_answer(&self) -> CallResult<SessionDescription>;

    /// Apply our own description
    async fn set_local_description(&self, description: SessionDescription) -> CallResult<()>;

    /// Apply the partner's description
    async fn set_remote_description(&self, description: SessionDescription) -> CallResult<()>;

    /// Add a partner candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> CallResult<()>;

    /// Release everything; may be called more than once
    async fn close(&self) -> CallResult<()>;
}
