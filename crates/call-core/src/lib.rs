//! # pairtalk call core
//!
//! Call lifecycle for anonymous one-on-one audio/video pairing. The crate
//! coordinates:
//! - **matchmaking**: `FindPartner`, pairing signals, auto-rematch with a fixed
//!   delay
//! - **negotiation**: SDP offer/answer and ICE candidate exchange over an
//!   injected signaling channel
//! - **monitoring**: peer connection state, negotiation timeout
//! - **teardown**: one cleanup routine for every way a call can end
//!
//! The pairing server, the signaling transport, media capture/rendering and
//! the peer connection engine are external collaborators behind the
//! [`SignalingPort`], [`MediaCapability`] and [`PeerEngine`] traits.
//!
//! ## Architecture
//!
//! ```text
//!  presentation ──commands──▶ SessionController ──▶ NegotiationStateMachine
//!        ▲                        │   ▲                 │        │
//!        └── status / events ─────┘   │                 ▼        ▼
//!                                     │          MatchmakingController
//!   SignalingPort ──messages──────────┤                 PeerLink ──▶ PeerEngine
//!   PeerLink ──tagged events──────────┘
//! ```
//!
//! Every input is processed on the controller task, one at a time. Work that
//! suspends runs as a spawned step stamped with the session epoch, and its
//! result is discarded if the session it was started for is gone.
//!
//! ## Features
//!
//! - `webrtc-engine`: a [`PeerEngine`] implementation on top of the `webrtc`
//!   crate ([`peer::webrtc_engine::WebRtcEngine`])

#![warn(missing_docs)]

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod logging;
pub mod machine;
pub mod matchmaking;
pub mod media;
pub mod peer;
pub mod signaling;
pub mod types;

// Re-export main types
pub use config::{CallConfig, IceServerConfig, PeerConfig};
pub use controller::SessionController;
pub use error::{CallError, CallResult, ErrorCategory};
pub use events::{CallEvent, EventEmitter, EventIterator, EventStream};
pub use logging::{setup_logging, LoggingConfig};
pub use machine::{CallState, NegotiationStateMachine};
pub use matchmaking::MatchmakingController;
pub use media::{LocalMedia, LocalTrack, MediaCapability, MediaMode, MediaOptions, RemoteTrack, TrackKind};
pub use peer::{PeerConnection, PeerConnectionState, PeerEngine, PeerEvent, PeerLink, SessionDescription};
pub use signaling::{IceCandidate, Role, RoomId, SignalingMessage, SignalingPort};
pub use types::{CallStatus, EndReason, SessionEpoch, SessionSnapshot, SessionStats};

#[cfg(feature = "webrtc-engine")]
pub use peer::webrtc_engine::WebRtcEngine;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
