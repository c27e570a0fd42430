//! Media capability contract
//!
//! Capture and rendering live outside the core. The core only needs to
//! acquire a local source before negotiation, give it back when a call ends
//! for good, and hand remote tracks to whoever renders them.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CallResult;

/// Which media a call carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MediaMode {
    /// Microphone only
    Audio,
    /// Microphone and camera
    #[default]
    AudioVideo,
}

impl MediaMode {
    /// Track kinds a local source in this mode carries
    pub fn track_kinds(&self) -> &'static [TrackKind] {
        match self {
            Self::Audio => &[TrackKind::Audio],
            Self::AudioVideo => &[TrackKind::Audio, TrackKind::Video],
        }
    }

    /// Whether a camera is requested
    pub fn has_video(&self) -> bool {
        matches!(self, Self::AudioVideo)
    }
}

/// Capture/render options shared by every call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MediaOptions {
    /// Audio only or audio plus video
    #[serde(default)]
    pub mode: MediaMode,
    /// Whether the presentation layer draws an audio visualization
    #[serde(default)]
    pub visualize: bool,
}

impl MediaOptions {
    /// Audio-only options
    pub fn audio_only() -> Self {
        Self {
            mode: MediaMode::Audio,
            visualize: false,
        }
    }

    /// Audio and video options
    pub fn audio_video() -> Self {
        Self {
            mode: MediaMode::AudioVideo,
            visualize: false,
        }
    }

    /// Turn visualization on or off
    pub fn with_visualize(mut self, visualize: bool) -> Self {
        self.visualize = visualize;
        self
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// One captured track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    /// Track identifier
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
    /// Device label, when the capture layer knows it
    pub label: Option<String>,
}

/// A live local capture source.
///
/// Deliberately not `Clone`: there is one owner, and giving it back through
/// [`MediaCapability::release_local`] consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct LocalMedia {
    /// Source identifier
    pub id: Uuid,
    /// Mode the source was acquired in
    pub mode: MediaMode,
    /// Captured tracks
    pub tracks: Vec<LocalTrack>,
    /// When capture started
    pub acquired_at: DateTime<Utc>,
}

impl LocalMedia {
    /// Describe a freshly acquired source with one track per kind of `mode`
    pub fn new(mode: MediaMode) -> Self {
        let id = Uuid::new_v4();
        let tracks = mode
            .track_kinds()
            .iter()
            .map(|kind| LocalTrack {
                id: format!("{}-{}", kind, Uuid::new_v4()),
                kind: *kind,
                label: None,
            })
            .collect();
        Self {
            id,
            mode,
            tracks,
            acquired_at: Utc::now(),
        }
    }

    /// Whether the source carries a track of `kind`
    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// A track received from the partner
#[derive(Clone)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
    /// Remote stream the track belongs to
    pub stream_id: Option<String>,
    /// Engine-specific handle for the renderer
    pub handle: Option<Arc<dyn Any + Send + Sync>>,
}

impl RemoteTrack {
    /// Track descriptor without an engine handle
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            stream_id: None,
            handle: None,
        }
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}

/// Local capture / remote delivery capability
#[async_trait]
pub trait MediaCapability: Send + Sync {
    /// Acquire microphone (and camera) according to `options`.
    ///
    /// Permission denial or a missing device is a
    /// [`CallError::Capability`](crate::error::CallError::Capability).
    async fn acquire_local(&self, options: &MediaOptions) -> CallResult<LocalMedia>;

    /// Stop capture and release the devices
    async fn release_local(&self, media: LocalMedia);

    /// Whether a source may be kept alive between calls
    fn supports_reuse(&self) -> bool {
        true
    }

    /// Hand a remote track to the renderer
    async fn attach_remote(&self, track: RemoteTrack) -> CallResult<()>;

    /// Drop every remote track of the ended call
    async fn detach_remote(&self) {}
}
