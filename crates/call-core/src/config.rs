//! Call core configuration
//!
//! [`CallConfig`] gathers everything the session controller needs that is
//! not an injected capability: media options, ICE servers, matchmaking
//! timing and channel sizes. It can be built in code with the `with_*`
//! methods or loaded from JSON.
//!
//! ```rust
//! use pairtalk_call_core::config::CallConfig;
//! use pairtalk_call_core::media::MediaOptions;
//! use std::time::Duration;
//!
//! let config = CallConfig::new()
//!     .with_media(MediaOptions::audio_only())
//!     .with_auto_search(true)
//!     .with_rematch_delay(Duration::from_millis(750));
//!
//! assert!(config.auto_search);
//! assert_eq!(config.rematch_delay(), Duration::from_millis(750));
//! assert_eq!(config.negotiation_timeout(), Duration::from_secs(10));
//! assert!(config.validate().is_ok());
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CallError, CallResult};
use crate::media::MediaOptions;

/// Pause between a finished pairing and the next `FindPartner`
pub const DEFAULT_REMATCH_DELAY_MS: u64 = 500;
/// How long a pairing may stay in negotiation before it is abandoned
pub const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 10_000;
/// Public STUN server used when none is configured
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// A STUN or TURN server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs (`stun:` / `turn:` / `turns:`)
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// TURN credential
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

impl IceServerConfig {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }

    /// TURN server with credentials
    pub fn turn(url: impl Into<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: username.into(),
            credential: credential.into(),
        }
    }
}

/// Configuration handed to the peer engine when a link is created
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerConfig {
    /// STUN/TURN servers
    pub ice_servers: Vec<IceServerConfig>,
}

/// Session controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Capture and render options
    pub media: MediaOptions,
    /// STUN/TURN servers for the peer engine
    pub ice_servers: Vec<IceServerConfig>,
    /// Search again automatically after a call ends
    pub auto_search: bool,
    /// Delay before an automatic `FindPartner`, in milliseconds
    pub rematch_delay_ms: u64,
    /// Negotiation timeout, in milliseconds
    pub negotiation_timeout_ms: u64,
    /// Keep the local source alive between auto-search cycles
    pub reuse_local_media: bool,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
    /// Capacity of the controller mailbox
    pub command_capacity: usize,
    /// Number of closed room ids remembered for stale-message filtering
    pub retired_room_history: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            media: MediaOptions::default(),
            ice_servers: vec![IceServerConfig::stun(DEFAULT_STUN_URL)],
            auto_search: false,
            rematch_delay_ms: DEFAULT_REMATCH_DELAY_MS,
            negotiation_timeout_ms: DEFAULT_NEGOTIATION_TIMEOUT_MS,
            reuse_local_media: true,
            event_capacity: 256,
            command_capacity: 64,
            retired_room_history: 32,
        }
    }
}

impl CallConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> CallResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> CallResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Set media options
    pub fn with_media(mut self, media: MediaOptions) -> Self {
        self.media = media;
        self
    }

    /// Replace the ICE server list
    pub fn with_ice_servers(mut self, servers: Vec<IceServerConfig>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// Enable or disable auto-search
    pub fn with_auto_search(mut self, enabled: bool) -> Self {
        self.auto_search = enabled;
        self
    }

    /// Set the rematch delay
    pub fn with_rematch_delay(mut self, delay: Duration) -> Self {
        self.rematch_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the negotiation timeout
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Keep or drop the local source between cycles
    pub fn with_reuse_local_media(mut self, reuse: bool) -> Self {
        self.reuse_local_media = reuse;
        self
    }

    /// Rematch delay as a `Duration`
    pub fn rematch_delay(&self) -> Duration {
        Duration::from_millis(self.rematch_delay_ms)
    }

    /// Negotiation timeout as a `Duration`
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Peer engine configuration derived from this config
    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            ice_servers: self.ice_servers.clone(),
        }
    }

    /// Check the configuration for values the controller cannot run with
    pub fn validate(&self) -> CallResult<()> {
        if self.rematch_delay_ms == 0 {
            return Err(CallError::configuration("rematch_delay_ms must be greater than zero"));
        }
        if self.negotiation_timeout_ms == 0 {
            return Err(CallError::configuration("negotiation_timeout_ms must be greater than zero"));
        }
        if self.event_capacity == 0 || self.command_capacity == 0 {
            return Err(CallError::configuration("channel capacities must be greater than zero"));
        }
        for server in &self.ice_servers {
            if server.urls.is_empty() || server.urls.iter().any(|u| u.trim().is_empty()) {
                return Err(CallError::configuration("ICE server entries need at least one non-empty URL"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaMode;

    #[test]
    fn defaults_match_reference_timing() {
        let config = CallConfig::default();
        assert_eq!(config.rematch_delay(), Duration::from_millis(500));
        assert_eq!(config.negotiation_timeout(), Duration::from_secs(10));
        assert!(!config.auto_search);
        assert_eq!(config.ice_servers.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = CallConfig::from_json_str(
            r#"{"auto_search": true, "media": {"mode": "audio", "visualize": true}}"#,
        )
        .unwrap();
        assert!(config.auto_search);
        assert_eq!(config.media.mode, MediaMode::Audio);
        assert!(config.media.visualize);
        assert_eq!(config.rematch_delay_ms, DEFAULT_REMATCH_DELAY_MS);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = CallConfig::new()
            .with_negotiation_timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(err, CallError::Configuration { .. }));
    }

    #[test]
    fn empty_ice_url_is_rejected() {
        let config = CallConfig::new().with_ice_servers(vec![IceServerConfig {
            urls: vec![" ".to_string()],
            username: String::new(),
            credential: String::new(),
        }]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn turn_credentials_round_trip_through_json() {
        let config = CallConfig::new().with_ice_servers(vec![IceServerConfig::turn(
            "turn:relay.example.net:3478",
            "user",
            "secret",
        )]);
        let json = serde_json::to_string(&config).unwrap();
        let parsed = CallConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed.ice_servers, config.ice_servers);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = CallConfig::from_file("/definitely/not/here/pairtalk.json").unwrap_err();
        assert!(matches!(err, CallError::Io(_)));
    }
}
