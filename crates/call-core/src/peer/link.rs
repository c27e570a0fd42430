//! PeerLink: the state machine's handle on one peer connection
//!
//! The link owns the engine connection for exactly one session epoch. It
//! forwards engine events tagged with that epoch, normalizes engine errors
//! into the call taxonomy, keeps bad remote candidates from aborting the
//! call, and makes `close` idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::error::{CallError, CallResult};
use crate::media::LocalTrack;
use crate::peer::{PeerConnection, PeerConnectionState, PeerEngine, PeerEvent, SdpType, SessionDescription};
use crate::signaling::IceCandidate;
use crate::types::SessionEpoch;

/// A peer event stamped with the session it belongs to
#[derive(Debug, Clone)]
pub struct TaggedPeerEvent {
    /// Session the link was created for
    pub epoch: SessionEpoch,
    /// What happened
    pub event: PeerEvent,
}

/// Exclusive handle on a peer connection for one session
pub struct PeerLink {
    epoch: SessionEpoch,
    connection: Arc<dyn PeerConnection>,
    closed: AtomicBool,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl PeerLink {
    /// Create a connection through `engine` and start forwarding its events.
    ///
    /// Engine failure here means the capability is missing, so every error is
    /// reported as [`CallError::Capability`].
    pub async fn create(
        engine: &dyn PeerEngine,
        config: &PeerConfig,
        epoch: SessionEpoch,
        sink: mpsc::UnboundedSender<TaggedPeerEvent>,
    ) -> CallResult<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = engine.create(config, events_tx).await.map_err(|e| match e {
            CallError::Capability { .. } => e,
            other => CallError::capability(format!("peer engine unavailable: {}", other)),
        })?;

        let forwarder = tokio::spawn(forward_events(epoch, events_rx, sink));
        debug!(%epoch, "peer link created");

        Ok(Self {
            epoch,
            connection,
            closed: AtomicBool::new(false),
            forwarder: Mutex::new(Some(forwarder)),
        })
    }

    /// Session this link belongs to
    pub fn epoch(&self) -> SessionEpoch {
        self.epoch
    }

    /// Whether `close` has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Attach local capture tracks
    pub async fn add_local_tracks(&self, tracks: &[LocalTrack]) -> CallResult<()> {
        self.ensure_open()?;
        self.connection.add_local_tracks(tracks).await.map_err(|e| match e {
            CallError::Capability { .. } => e,
            other => CallError::capability(format!("could not attach local media: {}", other)),
        })
    }

    /// Create an offer and apply it locally; returns the SDP to send
    pub async fn create_local_offer(&self) -> CallResult<String> {
        self.ensure_open()?;
        let offer = self.connection.create_offer().await.map_err(as_negotiation)?;
        let sdp = offer.sdp.clone();
        self.set_local_description(offer).await?;
        Ok(sdp)
    }

    /// Create an answer and apply it locally; returns the SDP to send
    pub async fn create_local_answer(&self) -> CallResult<String> {
        self.ensure_open()?;
        let answer = self.connection.create_answer().await.map_err(as_negotiation)?;
        let sdp = answer.sdp.clone();
        self.set_local_description(answer).await?;
        Ok(sdp)
    }

    /// Apply our own description
    pub async fn set_local_description(&self, description: SessionDescription) -> CallResult<()> {
        self.ensure_open()?;
        self.connection
            .set_local_description(description)
            .await
            .map_err(as_negotiation)
    }

    /// Apply the partner's description
    pub async fn set_remote_description(&self, kind: SdpType, sdp: String) -> CallResult<()> {
        self.ensure_open()?;
        self.connection
            .set_remote_description(SessionDescription { kind, sdp })
            .await
            .map_err(as_negotiation)
    }

    /// Apply a partner candidate.
    ///
    /// Never fails the call: a malformed or redundant candidate is logged and
    /// `false` is returned.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> bool {
        if self.is_closed() {
            debug!(epoch = %self.epoch, "candidate ignored on closed link");
            return false;
        }
        match self.connection.add_ice_candidate(candidate).await {
            Ok(()) => true,
            Err(e) => {
                let e = match e {
                    CallError::CandidateApply { .. } => e,
                    other => CallError::candidate(other.to_string()),
                };
                warn!(epoch = %self.epoch, "{}", e);
                false
            }
        }
    }

    /// Release the connection. Safe to call repeatedly.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
        if let Err(e) = self.connection.close().await {
            warn!(epoch = %self.epoch, "error closing peer connection: {}", e);
        }
        info!(epoch = %self.epoch, "peer link closed");
    }

    fn ensure_open(&self) -> CallResult<()> {
        if self.is_closed() {
            Err(CallError::negotiation("peer link is closed"))
        } else {
            Ok(())
        }
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
        // Dropped without close (an aborted setup step); close in the background.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let connection = self.connection.clone();
            let epoch = self.epoch;
            runtime.spawn(async move {
                if let Err(e) = connection.close().await {
                    warn!(%epoch, "error closing dropped peer connection: {}", e);
                }
            });
        }
    }
}

fn as_negotiation(e: CallError) -> CallError {
    match e {
        CallError::Negotiation { .. } => e,
        other => CallError::negotiation(other.to_string()),
    }
}

/// Relay engine events into the state machine, once per actual change
async fn forward_events(
    epoch: SessionEpoch,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    sink: mpsc::UnboundedSender<TaggedPeerEvent>,
) {
    let mut last_state: Option<PeerConnectionState> = None;
    while let Some(event) = events.recv().await {
        if let PeerEvent::ConnectionStateChanged(state) = &event {
            if last_state == Some(*state) {
                continue;
            }
            last_state = Some(*state);
        }
        if sink.send(TaggedPeerEvent { epoch, event }).is_err() {
            break;
        }
    }
    debug!(%epoch, "peer event forwarder finished");
}
