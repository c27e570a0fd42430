//! Negotiation state machine
//!
//! Owns the call lifecycle `Idle → Searching → Negotiating → Active →
//! Closing → Idle` and every input that can move it: signaling messages, peer
//! connection events, user commands, timer fires and the results of the
//! asynchronous negotiation steps it spawned.
//!
//! The machine runs on a single task. Nothing here blocks on the peer engine
//! or the media capability: each suspending operation (acquire media, create
//! the link, create or apply a description) is spawned as a step tagged with
//! the session epoch, and its result comes back as a [`StepResult`]. A result
//! whose epoch no longer matches the live session is stale; whatever it
//! carries is released instead of applied.
//!
//! Every terminal path goes through [`NegotiationStateMachine::cleanup`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{CallConfig, PeerConfig};
use crate::error::{CallError, CallResult, ErrorCategory};
use crate::events::{CallEvent, EventEmitter};
use crate::matchmaking::{MatchmakingController, TimerFired, TimerKind};
use crate::media::{LocalMedia, MediaCapability, RemoteTrack};
use crate::peer::{PeerConnectionState, PeerEngine, PeerEvent, PeerLink, SdpType, TaggedPeerEvent};
use crate::signaling::{IceCandidate, Role, RoomId, SignalingMessage, SignalingPort};
use crate::types::{CallStatus, EndReason, SessionEpoch, SessionSnapshot, SessionStats};

/// State of the call lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// No session, not searching
    Idle,
    /// `FindPartner` sent, waiting for a pairing
    Searching,
    /// Paired, peer connection being negotiated
    Negotiating,
    /// Peer connection up
    Active,
    /// Tearing a session down; never observed outside a transition
    Closing,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Searching => "searching",
            Self::Negotiating => "negotiating",
            Self::Active => "active",
            Self::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Where a session is inside `Negotiating`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationPhase {
    /// Acquiring media and creating the peer link
    Preparing,
    /// Initiator building its offer
    CreatingOffer,
    /// Initiator waiting for the answer
    AwaitingAnswer,
    /// Responder with a link, waiting for the offer
    AwaitingOffer,
    /// Applying the partner's description
    ApplyingRemote,
    /// Responder building its answer
    CreatingAnswer,
    /// Descriptions exchanged, waiting for the engine to connect
    AwaitingConnection,
}

/// One pairing
pub struct CallSession {
    /// Room issued by the pairing server
    pub room_id: RoomId,
    /// Our role, fixed for the session
    pub role: Role,
    /// Identity used to discard stale results
    pub epoch: SessionEpoch,
    /// Negotiation progress
    pub phase: NegotiationPhase,
    /// Exclusively owned peer link, once created
    pub peer_link: Option<Arc<PeerLink>>,
    /// Whether the partner's description has been applied
    pub remote_description_set: bool,
    /// Whether our own description has been published
    pub local_description_sent: bool,
    /// Partner candidates received before the remote description
    pub pending_candidates: VecDeque<IceCandidate>,
    /// Our candidates gathered before our description went out
    pub outbound_candidates: Vec<IceCandidate>,
    /// Offer received before the responder's link existed
    pub pending_offer: Option<String>,
    /// When the pairing started
    pub started_at: DateTime<Utc>,
    /// When the session reached `Active`
    pub connected_at: Option<DateTime<Utc>>,
    /// Engine reported `Connected` before the remote description was applied
    pub connected_pending: bool,
    step: Option<StepHandle>,
}

/// A running negotiation step.
///
/// Steps that can hand back a resource (media source, peer link) are never
/// aborted; they run to completion and a stale result is released instead.
struct StepHandle {
    handle: JoinHandle<()>,
    abortable: bool,
}

impl CallSession {
    fn new(room_id: RoomId, role: Role, epoch: SessionEpoch) -> Self {
        Self {
            room_id,
            role,
            epoch,
            phase: NegotiationPhase::Preparing,
            peer_link: None,
            remote_description_set: false,
            local_description_sent: false,
            pending_candidates: VecDeque::new(),
            outbound_candidates: Vec::new(),
            pending_offer: None,
            started_at: Utc::now(),
            connected_at: None,
            connected_pending: false,
            step: None,
        }
    }

    /// Whether a negotiation step is running for this session
    pub fn step_in_flight(&self) -> bool {
        self.step.as_ref().map_or(false, |step| !step.handle.is_finished())
    }
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("room_id", &self.room_id)
            .field("role", &self.role)
            .field("epoch", &self.epoch)
            .field("phase", &self.phase)
            .field("has_peer_link", &self.peer_link.is_some())
            .field("remote_description_set", &self.remote_description_set)
            .field("pending_candidates", &self.pending_candidates.len())
            .field("connected_pending", &self.connected_pending)
            .finish()
    }
}

/// What a finished negotiation step produced
pub enum StepOutcome {
    /// Local capture source acquired
    MediaAcquired(LocalMedia),
    /// Peer link created with local tracks attached
    LinkReady(Arc<PeerLink>),
    /// Offer created and applied locally
    OfferReady(String),
    /// Partner description applied
    RemoteApplied(SdpType),
    /// Answer created and applied locally
    AnswerReady(String),
}

/// A step result stamped with the session that started it
pub struct StepResult {
    /// Session the step ran for
    pub epoch: SessionEpoch,
    /// What the step produced
    pub result: CallResult<StepOutcome>,
}

/// Receivers for the inputs the machine generates itself
pub struct MachineInputs {
    /// Negotiation step results
    pub steps: mpsc::UnboundedReceiver<StepResult>,
    /// Epoch-tagged peer events
    pub peer_events: mpsc::UnboundedReceiver<TaggedPeerEvent>,
    /// Timer fires
    pub timers: mpsc::UnboundedReceiver<TimerFired>,
}

/// The call lifecycle state machine
pub struct NegotiationStateMachine {
    config: CallConfig,
    peer_config: PeerConfig,
    signaling: Arc<dyn SignalingPort>,
    media: Arc<dyn MediaCapability>,
    engine: Arc<dyn PeerEngine>,
    matchmaking: MatchmakingController,
    events: EventEmitter,
    status: watch::Sender<CallStatus>,
    state: CallState,
    session: Option<CallSession>,
    local_media: Option<LocalMedia>,
    retired_rooms: VecDeque<RoomId>,
    next_epoch: u64,
    transport_connected: bool,
    stats: SessionStats,
    steps_tx: mpsc::UnboundedSender<StepResult>,
    peer_tx: mpsc::UnboundedSender<TaggedPeerEvent>,
}

impl NegotiationStateMachine {
    /// Build an idle machine and the receivers its own inputs arrive on
    pub fn new(
        config: CallConfig,
        signaling: Arc<dyn SignalingPort>,
        media: Arc<dyn MediaCapability>,
        engine: Arc<dyn PeerEngine>,
        events: EventEmitter,
        status: watch::Sender<CallStatus>,
    ) -> (Self, MachineInputs) {
        let (steps_tx, steps) = mpsc::unbounded_channel();
        let (peer_tx, peer_events) = mpsc::unbounded_channel();
        let (timers_tx, timers) = mpsc::unbounded_channel();

        let matchmaking = MatchmakingController::new(&config, signaling.clone(), timers_tx);
        let transport_connected = signaling.is_connected();
        let peer_config = config.peer_config();

        let machine = Self {
            config,
            peer_config,
            signaling,
            media,
            engine,
            matchmaking,
            events,
            status,
            state: CallState::Idle,
            session: None,
            local_media: None,
            retired_rooms: VecDeque::new(),
            next_epoch: 0,
            transport_connected,
            stats: SessionStats::default(),
            steps_tx,
            peer_tx,
        };
        let inputs = MachineInputs {
            steps,
            peer_events,
            timers,
        };
        (machine, inputs)
    }

    /// Current state
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Live session, if any
    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    /// Whether a local capture source is held
    pub fn holds_local_media(&self) -> bool {
        self.local_media.is_some()
    }

    /// Whether the signaling channel is believed to be up
    pub fn transport_connected(&self) -> bool {
        self.transport_connected
    }

    /// Lifetime counters
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Point-in-time view
    pub fn snapshot(&self) -> SessionSnapshot {
        let session = self.session.as_ref();
        SessionSnapshot {
            state: self.state,
            room_id: session.map(|s| s.room_id.clone()),
            role: session.map(|s| s.role),
            epoch: session.map(|s| s.epoch),
            has_peer_link: session.map_or(false, |s| s.peer_link.is_some()),
            remote_description_set: session.map_or(false, |s| s.remote_description_set),
            pending_candidates: session.map_or(0, |s| s.pending_candidates.len()),
            holds_local_media: self.local_media.is_some(),
            auto_search: self.matchmaking.auto_search(),
            rematch_pending: self.matchmaking.rematch_pending(),
            transport_connected: self.transport_connected,
            connected_at: session.and_then(|s| s.connected_at),
            stats: self.stats.clone(),
        }
    }

    // ---- user commands ----

    /// Start searching from `Idle`.
    ///
    /// Already searching is fine; asking while paired is an
    /// [`CallError::InvalidState`]. Needs a connected transport.
    pub async fn search(&mut self) -> CallResult<()> {
        if !self.transport_connected {
            return Err(CallError::transport("signaling channel is not connected"));
        }
        match self.state {
            CallState::Idle => self.start_search().await,
            CallState::Searching => Ok(()),
            state => Err(CallError::invalid_state(format!("cannot search while {}", state))),
        }
    }

    /// Leave the current partner and look for another one after the rematch
    /// delay, whether or not auto-search is on. Without a session this is
    /// `search`.
    pub async fn next(&mut self) -> CallResult<()> {
        if self.session.is_some() {
            self.send_hangup().await;
            self.cleanup(EndReason::LocalNext).await;
            return Ok(());
        }
        match self.state {
            CallState::Searching => Ok(()),
            _ => self.search().await,
        }
    }

    /// Hang up the live session, or stop searching, or cancel a pending
    /// rematch; whichever applies.
    pub async fn hangup(&mut self) -> CallResult<()> {
        if self.session.is_some() {
            self.send_hangup().await;
        } else {
            self.matchmaking.cancel_rematch();
        }
        self.cleanup(EndReason::LocalHangup).await;
        Ok(())
    }

    /// Set the auto-search flag; returns the previous value.
    ///
    /// Turning it off cancels a pending rematch and, when idle, releases the
    /// local source. Turning it on does not start a search by itself.
    pub async fn set_auto_search(&mut self, enabled: bool) -> bool {
        let previous = self.matchmaking.set_auto_search(enabled);
        if previous != enabled {
            info!(enabled, "auto-search changed");
            self.events.emit(CallEvent::AutoSearchChanged { enabled });
        }
        if !enabled && self.state == CallState::Idle {
            self.release_local_media().await;
        }
        previous
    }

    /// Flip the auto-search flag; returns the new value
    pub async fn toggle_auto_search(&mut self) -> bool {
        let enabled = !self.matchmaking.auto_search();
        self.set_auto_search(enabled).await;
        enabled
    }

    /// Tear everything down for good
    pub async fn shutdown(&mut self) {
        self.send_hangup().await;
        self.cleanup(EndReason::Shutdown).await;
        self.matchmaking.cancel_all();
        self.release_local_media().await;
        info!(stats = ?self.stats, "negotiation state machine shut down");
    }

    // ---- signaling ----

    /// Apply one inbound signaling message
    pub async fn handle_signaling(&mut self, message: SignalingMessage) {
        if let Some(room_id) = message.room_id() {
            if self.is_retired(room_id) {
                self.discard_stale(room_id, message.kind());
                return;
            }
        }

        match message {
            SignalingMessage::PartnerFound { room_id, role } => self.on_partner_found(room_id, role).await,
            SignalingMessage::Offer { room_id, sdp } => self.on_offer(room_id, sdp),
            SignalingMessage::Answer { room_id, sdp } => self.on_answer(room_id, sdp),
            SignalingMessage::IceCandidate { room_id, candidate } => {
                self.on_remote_candidate(room_id, candidate).await
            }
            SignalingMessage::Hangup { room_id } => self.on_remote_hangup(room_id).await,
            SignalingMessage::TransportConnected => self.on_transport_connected(),
            SignalingMessage::TransportDisconnected => self.on_transport_disconnected().await,
            SignalingMessage::FindPartner => debug!("ignoring inbound FindPartner"),
        }
    }

    async fn on_partner_found(&mut self, room_id: RoomId, role: Role) {
        if self.is_live(&room_id) {
            debug!(%room_id, "duplicate PartnerFound ignored");
            return;
        }
        if self.state == CallState::Searching && self.session.is_none() {
            self.start_session(room_id, role, None);
            return;
        }

        info!(%room_id, state = %self.state, "declining pairing we did not ask for");
        self.publish_best_effort(SignalingMessage::Hangup {
            room_id: room_id.clone(),
        })
        .await;
        self.retire_room(room_id);
    }

    fn on_offer(&mut self, room_id: RoomId, sdp: String) {
        let Some(session) = self.session.as_mut() else {
            if matches!(self.state, CallState::Idle | CallState::Searching) {
                info!(%room_id, "offer for a fresh room, starting as responder");
                self.start_session(room_id, Role::Responder, Some(sdp));
            } else {
                self.discard_stale(&room_id, "offer");
            }
            return;
        };
        if session.room_id != room_id {
            self.discard_stale(&room_id, "offer");
            return;
        }
        if session.role != Role::Responder {
            warn!(%room_id, "initiator received an offer, ignoring it");
            return;
        }

        match (session.phase, session.peer_link.clone()) {
            (NegotiationPhase::AwaitingOffer, Some(link)) => {
                self.set_phase(NegotiationPhase::ApplyingRemote);
                self.spawn_apply_remote_step(link, SdpType::Offer, sdp);
            }
            (NegotiationPhase::Preparing, _) if session.pending_offer.is_none() => {
                debug!(%room_id, "offer held until the peer link is ready");
                session.pending_offer = Some(sdp);
            }
            (phase, _) => debug!(%room_id, ?phase, "duplicate offer ignored"),
        }
    }

    fn on_answer(&mut self, room_id: RoomId, sdp: String) {
        let Some(session) = self.session.as_ref().filter(|s| s.room_id == room_id) else {
            self.discard_stale(&room_id, "answer");
            return;
        };

        match (session.role, session.phase, session.peer_link.clone()) {
            (Role::Initiator, NegotiationPhase::AwaitingAnswer, Some(link)) => {
                self.set_phase(NegotiationPhase::ApplyingRemote);
                self.spawn_apply_remote_step(link, SdpType::Answer, sdp);
            }
            (role, phase, _) => debug!(%room_id, ?role, ?phase, "unexpected answer ignored"),
        }
    }

    async fn on_remote_candidate(&mut self, room_id: RoomId, candidate: IceCandidate) {
        let Some(session) = self.session.as_mut().filter(|s| s.room_id == room_id) else {
            self.discard_stale(&room_id, "ice_candidate");
            return;
        };

        let ready = if session.remote_description_set {
            session.peer_link.clone()
        } else {
            None
        };
        match ready {
            Some(link) => {
                link.add_remote_candidate(candidate).await;
            }
            None => {
                session.pending_candidates.push_back(candidate);
                debug!(%room_id, queued = session.pending_candidates.len(), "candidate queued");
            }
        }
    }

    async fn on_remote_hangup(&mut self, room_id: RoomId) {
        if !self.is_live(&room_id) {
            self.discard_stale(&room_id, "hangup");
            return;
        }
        info!(%room_id, "partner hung up");
        self.cleanup(EndReason::RemoteHangup).await;
    }

    fn on_transport_connected(&mut self) {
        if !self.transport_connected {
            info!("signaling transport connected");
            self.transport_connected = true;
            self.events.emit(CallEvent::TransportChanged { connected: true });
        }
        if self.matchmaking.auto_search()
            && self.state == CallState::Idle
            && !self.matchmaking.rematch_pending()
        {
            self.schedule_rematch();
        }
    }

    async fn on_transport_disconnected(&mut self) {
        if self.transport_connected {
            warn!("signaling transport lost");
            self.transport_connected = false;
            self.stats.transport_losses += 1;
            self.events.emit(CallEvent::TransportChanged { connected: false });
        }
        self.cleanup(EndReason::TransportLost).await;
    }

    // ---- peer events ----

    /// Apply one event reported by a peer link
    pub async fn handle_peer_event(&mut self, tagged: TaggedPeerEvent) {
        if self.current_epoch() != Some(tagged.epoch) {
            self.stats.stale_events += 1;
            debug!(epoch = %tagged.epoch, event = ?tagged.event, "peer event for a retired session dropped");
            return;
        }

        match tagged.event {
            PeerEvent::ConnectionStateChanged(state) => self.on_connection_state(state).await,
            PeerEvent::LocalCandidate(candidate) => self.on_local_candidate(candidate).await,
            PeerEvent::RemoteTrack(track) => self.on_remote_track(track).await,
        }
    }

    async fn on_connection_state(&mut self, state: PeerConnectionState) {
        if state.is_terminal() {
            info!(%state, "peer connection ended");
            self.cleanup(EndReason::ConnectionLost(state)).await;
            return;
        }
        if state != PeerConnectionState::Connected {
            debug!(%state, "peer connection progress");
            return;
        }
        if self.state != CallState::Negotiating {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.remote_description_set {
            // The engine does not repeat the state; promote once the description lands
            debug!(room_id = %session.room_id, "connected before the remote description was applied");
            session.connected_pending = true;
            return;
        }
        self.mark_connected();
    }

    fn mark_connected(&mut self) {
        if self.state != CallState::Negotiating {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.connected_pending = false;
        session.connected_at = Some(Utc::now());
        let room_id = session.room_id.clone();
        self.matchmaking.disarm_negotiation_timeout();
        self.stats.connected_calls += 1;
        self.set_state(CallState::Active);
        info!(%room_id, "call connected");
        self.events.emit(CallEvent::CallConnected { room_id });
    }

    async fn on_local_candidate(&mut self, candidate: IceCandidate) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.local_description_sent {
            session.outbound_candidates.push(candidate);
            return;
        }
        let room_id = session.room_id.clone();
        self.publish_best_effort(SignalingMessage::IceCandidate { room_id, candidate })
            .await;
    }

    async fn on_remote_track(&mut self, track: RemoteTrack) {
        let Some(room_id) = self.session.as_ref().map(|s| s.room_id.clone()) else {
            return;
        };
        let kind = track.kind;
        match self.media.attach_remote(track).await {
            Ok(()) => {
                debug!(%room_id, %kind, "remote media attached");
                self.events.emit(CallEvent::RemoteMediaReady { room_id, kind });
            }
            Err(e) => warn!(%room_id, %kind, "could not attach remote media: {}", e),
        }
    }

    // ---- steps and timers ----

    /// Apply the result of a negotiation step
    pub async fn handle_step(&mut self, step: StepResult) {
        let StepResult { epoch, result } = step;
        if self.current_epoch() != Some(epoch) {
            self.stats.stale_events += 1;
            debug!(%epoch, "discarding stale step result");
            release_orphan(self.media.as_ref(), result).await;
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.step = None;
        }

        match result {
            Ok(StepOutcome::MediaAcquired(media)) => {
                if self.local_media.is_some() {
                    self.media.release_local(media).await;
                } else {
                    debug!(media_id = %media.id, "local media acquired");
                    self.local_media = Some(media);
                }
                self.spawn_link_step();
            }
            Ok(StepOutcome::LinkReady(link)) => self.on_link_ready(link),
            Ok(StepOutcome::OfferReady(sdp)) => self.on_local_description(SdpType::Offer, sdp).await,
            Ok(StepOutcome::RemoteApplied(kind)) => self.on_remote_applied(kind).await,
            Ok(StepOutcome::AnswerReady(sdp)) => self.on_local_description(SdpType::Answer, sdp).await,
            Err(e) => self.fail_session(e).await,
        }
    }

    /// Apply a timer fire
    pub async fn handle_timer(&mut self, fired: TimerFired) {
        if !self.matchmaking.accept_timer(&fired) {
            return;
        }
        match fired.kind {
            TimerKind::Rematch => self.on_rematch().await,
            TimerKind::NegotiationTimeout => {
                let current = self.current_epoch();
                if current.is_some() && fired.epoch == current && self.state == CallState::Negotiating {
                    warn!(epoch = ?current, "negotiation timed out");
                    self.stats.timeouts += 1;
                    self.cleanup(EndReason::Timeout).await;
                }
            }
        }
    }

    async fn on_rematch(&mut self) {
        if self.state != CallState::Idle || !self.transport_connected {
            debug!(state = %self.state, transport = self.transport_connected, "rematch skipped");
            if self.state == CallState::Idle {
                self.release_local_media().await;
            }
            return;
        }
        if let Err(e) = self.start_search().await {
            warn!("automatic search failed: {}", e);
            self.release_local_media().await;
        }
    }

    fn on_link_ready(&mut self, link: Arc<PeerLink>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.peer_link = Some(link.clone());
        let role = session.role;
        let pending_offer = session.pending_offer.take();
        debug!(room_id = %session.room_id, ?role, "peer link ready");

        match (role, pending_offer) {
            (Role::Initiator, _) => {
                self.set_phase(NegotiationPhase::CreatingOffer);
                self.spawn_step(async move { link.create_local_offer().await.map(StepOutcome::OfferReady) }.boxed());
            }
            (Role::Responder, Some(sdp)) => {
                self.set_phase(NegotiationPhase::ApplyingRemote);
                self.spawn_apply_remote_step(link, SdpType::Offer, sdp);
            }
            (Role::Responder, None) => self.set_phase(NegotiationPhase::AwaitingOffer),
        }
    }

    async fn on_local_description(&mut self, kind: SdpType, sdp: String) {
        let Some(room_id) = self.session.as_ref().map(|s| s.room_id.clone()) else {
            return;
        };
        let message = match kind {
            SdpType::Offer => SignalingMessage::Offer {
                room_id: room_id.clone(),
                sdp,
            },
            SdpType::Answer => SignalingMessage::Answer {
                room_id: room_id.clone(),
                sdp,
            },
        };
        if let Err(e) = self.signaling.publish(message).await {
            self.fail_session(e).await;
            return;
        }
        info!(%room_id, ?kind, "local description sent");

        let buffered = match self.session.as_mut() {
            Some(session) => {
                session.local_description_sent = true;
                std::mem::take(&mut session.outbound_candidates)
            }
            None => return,
        };
        self.set_phase(match kind {
            SdpType::Offer => NegotiationPhase::AwaitingAnswer,
            SdpType::Answer => NegotiationPhase::AwaitingConnection,
        });
        for candidate in buffered {
            self.publish_best_effort(SignalingMessage::IceCandidate {
                room_id: room_id.clone(),
                candidate,
            })
            .await;
        }
    }

    async fn on_remote_applied(&mut self, kind: SdpType) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.remote_description_set = true;
        let queued: Vec<IceCandidate> = session.pending_candidates.drain(..).collect();
        let Some(link) = session.peer_link.clone() else {
            return;
        };
        debug!(room_id = %session.room_id, ?kind, queued = queued.len(), "remote description applied");

        for candidate in queued {
            link.add_remote_candidate(candidate).await;
        }

        match kind {
            SdpType::Offer => {
                self.set_phase(NegotiationPhase::CreatingAnswer);
                self.spawn_step(async move { link.create_local_answer().await.map(StepOutcome::AnswerReady) }.boxed());
            }
            SdpType::Answer => self.set_phase(NegotiationPhase::AwaitingConnection),
        }

        if self.session.as_ref().map_or(false, |s| s.connected_pending) {
            self.mark_connected();
        }
    }

    async fn fail_session(&mut self, error: CallError) {
        match error.category() {
            ErrorCategory::Capability => {
                error!("call attempt failed: {}", error);
                self.events.emit(CallEvent::from_error(&error));
                self.cleanup(EndReason::CapabilityFailed).await;
                self.status.send_replace(CallStatus::Error);
            }
            ErrorCategory::Transport => {
                warn!("signaling failed during negotiation: {}", error);
                if !self.signaling.is_connected() && self.transport_connected {
                    self.transport_connected = false;
                    self.stats.transport_losses += 1;
                    self.events.emit(CallEvent::TransportChanged { connected: false });
                }
                self.cleanup(EndReason::TransportLost).await;
            }
            _ => {
                warn!("negotiation failed: {}", error);
                self.stats.negotiation_failures += 1;
                let visible = error.is_user_visible();
                if visible {
                    self.events.emit(CallEvent::from_error(&error));
                }
                self.cleanup(EndReason::NegotiationFailed).await;
                if visible {
                    self.status.send_replace(CallStatus::Error);
                }
            }
        }
    }

    // ---- cleanup ----

    /// End the live session, if any, and settle into `Idle`.
    ///
    /// Safe to call at any time and any number of times. Schedules at most one
    /// rematch, and only when a session actually ended.
    pub async fn cleanup(&mut self, reason: EndReason) {
        let had_session = match self.session.take() {
            Some(session) => {
                self.close_session(session, reason).await;
                true
            }
            None => false,
        };
        self.matchmaking.disarm_negotiation_timeout();

        let rematch = had_session
            && reason.allows_rematch()
            && self.transport_connected
            && (self.matchmaking.auto_search() || reason == EndReason::LocalNext);
        if matches!(reason, EndReason::TransportLost | EndReason::Shutdown) {
            self.matchmaking.cancel_rematch();
        }

        let keep_media = (rematch || self.matchmaking.rematch_pending())
            && self.config.reuse_local_media
            && self.media.supports_reuse();
        if !keep_media {
            self.release_local_media().await;
        }

        self.set_state(CallState::Idle);
        if rematch {
            self.schedule_rematch();
        }
    }

    async fn close_session(&mut self, mut session: CallSession, reason: EndReason) {
        self.set_state(CallState::Closing);

        if let Some(step) = session.step.take() {
            if step.abortable {
                step.handle.abort();
            } else if !step.handle.is_finished() {
                debug!(room_id = %session.room_id, "letting setup step finish so its result can be released");
            }
        }
        if let Some(link) = session.peer_link.take() {
            link.close().await;
        }
        session.pending_candidates.clear();
        session.outbound_candidates.clear();
        session.pending_offer = None;
        self.retire_room(session.room_id.clone());
        self.media.detach_remote().await;

        match reason {
            EndReason::RemoteHangup => self.stats.remote_hangups += 1,
            EndReason::LocalHangup | EndReason::LocalNext => self.stats.local_hangups += 1,
            _ => {}
        }

        let duration_secs = session
            .connected_at
            .map(|at| (Utc::now() - at).num_seconds().max(0) as u64)
            .unwrap_or(0);
        info!(room_id = %session.room_id, epoch = %session.epoch, %reason, duration_secs, "call ended");
        self.events.emit(CallEvent::CallEnded {
            room_id: session.room_id,
            reason,
            duration_secs,
        });
    }

    // ---- helpers ----

    async fn start_search(&mut self) -> CallResult<()> {
        self.matchmaking.find_partner().await?;
        self.stats.searches += 1;
        self.set_state(CallState::Searching);
        self.events.emit(CallEvent::SearchStarted);
        Ok(())
    }

    fn start_session(&mut self, room_id: RoomId, role: Role, pending_offer: Option<String>) {
        self.next_epoch += 1;
        let epoch = SessionEpoch(self.next_epoch);
        self.matchmaking.cancel_rematch();

        let mut session = CallSession::new(room_id.clone(), role, epoch);
        session.pending_offer = pending_offer;
        self.session = Some(session);
        self.stats.pairings += 1;

        info!(%room_id, ?role, %epoch, "pairing started");
        self.set_state(CallState::Negotiating);
        self.events.emit(CallEvent::PartnerFound { room_id, role });
        self.matchmaking.arm_negotiation_timeout(epoch);

        if self.local_media.is_some() {
            self.spawn_link_step();
        } else {
            let media = self.media.clone();
            let options = self.config.media.clone();
            self.spawn_setup_step(
                async move {
                    media
                        .acquire_local(&options)
                        .await
                        .map(StepOutcome::MediaAcquired)
                        .map_err(|e| match e {
                            CallError::Capability { .. } => e,
                            other => CallError::capability(format!("local media unavailable: {}", other)),
                        })
                }
                .boxed(),
            );
        }
    }

    fn spawn_link_step(&mut self) {
        let Some(epoch) = self.current_epoch() else {
            return;
        };
        let tracks = self
            .local_media
            .as_ref()
            .map(|m| m.tracks.clone())
            .unwrap_or_default();
        let engine = self.engine.clone();
        let config = self.peer_config.clone();
        let sink = self.peer_tx.clone();

        self.spawn_setup_step(
            async move {
                let link = PeerLink::create(engine.as_ref(), &config, epoch, sink).await?;
                link.add_local_tracks(&tracks).await?;
                Ok(StepOutcome::LinkReady(Arc::new(link)))
            }
            .boxed(),
        );
    }

    fn spawn_apply_remote_step(&mut self, link: Arc<PeerLink>, kind: SdpType, sdp: String) {
        self.spawn_step(
            async move {
                link.set_remote_description(kind, sdp)
                    .await
                    .map(|()| StepOutcome::RemoteApplied(kind))
            }
            .boxed(),
        );
    }

    /// Spawn a description step; cleanup may abort it
    fn spawn_step(&mut self, step: BoxFuture<'static, CallResult<StepOutcome>>) {
        self.spawn_tracked(step, true);
    }

    /// Spawn a step that allocates media or a peer link; it always runs to
    /// completion so whatever it produced reaches an owner
    fn spawn_setup_step(&mut self, step: BoxFuture<'static, CallResult<StepOutcome>>) {
        self.spawn_tracked(step, false);
    }

    fn spawn_tracked(&mut self, step: BoxFuture<'static, CallResult<StepOutcome>>, abortable: bool) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let epoch = session.epoch;
        let tx = self.steps_tx.clone();
        let media = self.media.clone();
        let handle = tokio::spawn(async move {
            let result = step.await;
            // Controller gone (shutdown): nobody else will release it
            if let Err(mpsc::error::SendError(orphan)) = tx.send(StepResult { epoch, result }) {
                debug!(%epoch, "step finished after the controller stopped");
                release_orphan(media.as_ref(), orphan.result).await;
            }
        });
        session.step = Some(StepHandle { handle, abortable });
    }

    fn schedule_rematch(&mut self) {
        if self.matchmaking.schedule_rematch() {
            let delay_ms = self.matchmaking.rematch_delay().as_millis() as u64;
            info!(delay_ms, "rematch scheduled");
            self.events.emit(CallEvent::RematchScheduled { delay_ms });
        }
    }

    async fn send_hangup(&mut self) {
        let Some(room_id) = self.session.as_ref().map(|s| s.room_id.clone()) else {
            return;
        };
        self.publish_best_effort(SignalingMessage::Hangup { room_id }).await;
    }

    async fn publish_best_effort(&self, message: SignalingMessage) {
        if !self.transport_connected {
            debug!(kind = message.kind(), "transport down, not publishing");
            return;
        }
        let kind = message.kind();
        if let Err(e) = self.signaling.publish(message).await {
            warn!(kind, "publish failed: {}", e);
        }
    }

    async fn release_local_media(&mut self) {
        if let Some(media) = self.local_media.take() {
            debug!(media_id = %media.id, "releasing local media");
            self.media.release_local(media).await;
        }
    }

    fn set_state(&mut self, next: CallState) {
        let previous = self.state;
        if previous == next {
            return;
        }
        self.state = next;
        debug!(%previous, current = %next, "state changed");
        self.events.emit(CallEvent::StateChanged {
            previous,
            current: next,
        });
        if let Some(status) = CallStatus::from_state(next) {
            self.status.send_replace(status);
        }
    }

    fn set_phase(&mut self, phase: NegotiationPhase) {
        if let Some(session) = self.session.as_mut() {
            debug!(room_id = %session.room_id, from = ?session.phase, to = ?phase, "negotiation phase");
            session.phase = phase;
        }
    }

    fn current_epoch(&self) -> Option<SessionEpoch> {
        self.session.as_ref().map(|s| s.epoch)
    }

    fn is_live(&self, room_id: &RoomId) -> bool {
        self.session.as_ref().map_or(false, |s| &s.room_id == room_id)
    }

    fn is_retired(&self, room_id: &RoomId) -> bool {
        self.retired_rooms.contains(room_id)
    }

    fn retire_room(&mut self, room_id: RoomId) {
        let capacity = self.config.retired_room_history;
        if capacity == 0 || self.retired_rooms.contains(&room_id) {
            return;
        }
        while self.retired_rooms.len() >= capacity {
            self.retired_rooms.pop_front();
        }
        self.retired_rooms.push_back(room_id);
    }

    fn discard_stale(&mut self, room_id: &RoomId, kind: &str) {
        self.stats.stale_events += 1;
        let stale = CallError::stale(room_id.as_str());
        debug!(kind, "{}", stale);
    }
}

/// Give back what a step produced for a session that no longer exists
async fn release_orphan(media: &dyn MediaCapability, result: CallResult<StepOutcome>) {
    match result {
        Ok(StepOutcome::MediaAcquired(local)) => media.release_local(local).await,
        Ok(StepOutcome::LinkReady(link)) => link.close().await,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaOptions;
    use crate::peer::{PeerConnection, PeerEventSender, SessionDescription};
    use crate::signaling::memory::{MemorySignalingPort, MemorySignalingRemote};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingMedia {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    #[async_trait]
    impl MediaCapability for CountingMedia {
        async fn acquire_local(&self, options: &MediaOptions) -> CallResult<LocalMedia> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(LocalMedia::new(options.mode))
        }
        async fn release_local(&self, _media: LocalMedia) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
        async fn attach_remote(&self, _track: RemoteTrack) -> CallResult<()> {
            Ok(())
        }
    }

    struct QuietConnection;

    #[async_trait]
    impl PeerConnection for QuietConnection {
        async fn add_local_tracks(&self, _tracks: &[crate::media::LocalTrack]) -> CallResult<()> {
            Ok(())
        }
        async fn create_offer(&self) -> CallResult<SessionDescription> {
            Ok(SessionDescription::offer("offer"))
        }
        async fn create_answer(&self) -> CallResult<SessionDescription> {
            Ok(SessionDescription::answer("answer"))
        }
        async fn set_local_description(&self, _d: SessionDescription) -> CallResult<()> {
            Ok(())
        }
        async fn set_remote_description(&self, _d: SessionDescription) -> CallResult<()> {
            Ok(())
        }
        async fn add_ice_candidate(&self, _c: IceCandidate) -> CallResult<()> {
            Ok(())
        }
        async fn close(&self) -> CallResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct QuietEngine {
        events: Mutex<Vec<PeerEventSender>>,
    }

    #[async_trait]
    impl PeerEngine for QuietEngine {
        async fn create(&self, _config: &PeerConfig, events: PeerEventSender) -> CallResult<Arc<dyn PeerConnection>> {
            self.events.lock().push(events);
            Ok(Arc::new(QuietConnection))
        }
    }

    struct Harness {
        machine: NegotiationStateMachine,
        inputs: MachineInputs,
        remote: MemorySignalingRemote,
        media: Arc<CountingMedia>,
        status: watch::Receiver<CallStatus>,
    }

    impl Harness {
        fn new(config: CallConfig) -> Self {
            let (port, remote) = MemorySignalingPort::pair(16);
            let media = Arc::new(CountingMedia::default());
            let (status_tx, status) = watch::channel(CallStatus::Idle);
            let (machine, inputs) = NegotiationStateMachine::new(
                config,
                Arc::new(port),
                media.clone(),
                Arc::new(QuietEngine::default()),
                EventEmitter::new(64),
                status_tx,
            );
            Self {
                machine,
                inputs,
                remote,
                media,
                status,
            }
        }

        /// Feed finished steps back until the session stops making progress
        async fn pump_steps(&mut self) {
            for _ in 0..8 {
                tokio::task::yield_now().await;
                while let Ok(step) = self.inputs.steps.try_recv() {
                    self.machine.handle_step(step).await;
                }
            }
        }
    }

    fn room(id: &str) -> RoomId {
        RoomId::new(id)
    }

    #[tokio::test]
    async fn search_then_pairing_creates_one_session() {
        let mut h = Harness::new(CallConfig::default());
        h.machine.search().await.unwrap();
        assert_eq!(h.machine.state(), CallState::Searching);
        assert_eq!(*h.status.borrow(), CallStatus::Searching);

        h.machine
            .handle_signaling(SignalingMessage::PartnerFound {
                room_id: room("a"),
                role: Role::Initiator,
            })
            .await;
        h.pump_steps().await;

        let snapshot = h.machine.snapshot();
        assert_eq!(snapshot.state, CallState::Negotiating);
        assert!(snapshot.has_peer_link);
        assert!(snapshot.holds_local_media);
        assert_eq!(h.media.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(h.machine.session().map(|s| s.phase), Some(NegotiationPhase::AwaitingAnswer));
    }

    #[tokio::test]
    async fn cleanup_twice_matches_cleanup_once() {
        let mut h = Harness::new(CallConfig::default());
        h.machine.search().await.unwrap();
        h.machine
            .handle_signaling(SignalingMessage::PartnerFound {
                room_id: room("a"),
                role: Role::Initiator,
            })
            .await;
        h.pump_steps().await;

        h.machine.cleanup(EndReason::RemoteHangup).await;
        let once = h.machine.snapshot();
        h.machine.cleanup(EndReason::RemoteHangup).await;
        let twice = h.machine.snapshot();

        assert_eq!(once, twice);
        assert_eq!(twice.state, CallState::Idle);
        assert!(!twice.has_peer_link);
        assert_eq!(h.media.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn messages_for_a_retired_room_are_counted_and_dropped() {
        let mut h = Harness::new(CallConfig::default());
        h.machine.search().await.unwrap();
        h.machine
            .handle_signaling(SignalingMessage::PartnerFound {
                room_id: room("old"),
                role: Role::Responder,
            })
            .await;
        h.pump_steps().await;
        h.machine
            .handle_signaling(SignalingMessage::Hangup { room_id: room("old") })
            .await;
        assert_eq!(h.machine.state(), CallState::Idle);

        h.machine
            .handle_signaling(SignalingMessage::Offer {
                room_id: room("old"),
                sdp: "late offer".into(),
            })
            .await;
        assert_eq!(h.machine.state(), CallState::Idle);
        assert!(h.machine.session().is_none());
        assert_eq!(h.machine.stats().stale_events, 1);
    }

    #[tokio::test]
    async fn unsolicited_pairing_is_declined() {
        let mut h = Harness::new(CallConfig::default());
        h.machine
            .handle_signaling(SignalingMessage::PartnerFound {
                room_id: room("surprise"),
                role: Role::Initiator,
            })
            .await;

        assert_eq!(h.machine.state(), CallState::Idle);
        assert_eq!(
            h.remote.drain_published().await,
            vec![SignalingMessage::Hangup {
                room_id: room("surprise")
            }]
        );
    }

    #[tokio::test]
    async fn retired_room_history_is_bounded() {
        let mut h = Harness::new(CallConfig {
            retired_room_history: 2,
            ..CallConfig::default()
        });
        for id in ["r1", "r2", "r3"] {
            h.machine.retire_room(room(id));
        }
        assert!(!h.machine.is_retired(&room("r1")));
        assert!(h.machine.is_retired(&room("r2")));
        assert!(h.machine.is_retired(&room("r3")));
    }

    #[tokio::test]
    async fn search_requires_transport_and_idle() {
        let mut h = Harness::new(CallConfig::default());
        h.remote.disconnect().await.unwrap();
        h.machine
            .handle_signaling(SignalingMessage::TransportDisconnected)
            .await;
        assert!(matches!(h.machine.search().await, Err(CallError::Transport { .. })));

        h.remote.reconnect().await.unwrap();
        h.machine.handle_signaling(SignalingMessage::TransportConnected).await;
        h.machine
            .handle_signaling(SignalingMessage::Offer {
                room_id: room("b"),
                sdp: "offer".into(),
            })
            .await;
        assert!(matches!(h.machine.search().await, Err(CallError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn connected_before_answer_is_applied_promotes_afterwards() {
        let mut h = Harness::new(CallConfig::default());
        h.machine.search().await.unwrap();
        h.machine
            .handle_signaling(SignalingMessage::PartnerFound {
                room_id: room("a"),
                role: Role::Initiator,
            })
            .await;
        h.pump_steps().await;
        h.machine
            .handle_signaling(SignalingMessage::Answer {
                room_id: room("a"),
                sdp: "answer".into(),
            })
            .await;

        // Engine event handled ahead of the apply-answer result
        h.machine
            .handle_peer_event(TaggedPeerEvent {
                epoch: SessionEpoch(1),
                event: PeerEvent::ConnectionStateChanged(PeerConnectionState::Connected),
            })
            .await;
        assert_eq!(h.machine.state(), CallState::Negotiating);
        assert!(h.machine.session().unwrap().connected_pending);

        h.pump_steps().await;
        assert_eq!(h.machine.state(), CallState::Active);
        assert_eq!(*h.status.borrow(), CallStatus::Active);
        assert_eq!(h.machine.stats().connected_calls, 1);
        assert!(!h.machine.matchmaking.negotiation_timeout_armed());
    }

    #[tokio::test]
    async fn stale_media_result_is_released() {
        let mut h = Harness::new(CallConfig::default());
        h.machine.search().await.unwrap();
        h.machine
            .handle_signaling(SignalingMessage::PartnerFound {
                room_id: room("a"),
                role: Role::Initiator,
            })
            .await;
        h.machine.cleanup(EndReason::LocalHangup).await;

        h.machine
            .handle_step(StepResult {
                epoch: SessionEpoch(1),
                result: Ok(StepOutcome::MediaAcquired(LocalMedia::new(crate::media::MediaMode::Audio))),
            })
            .await;
        assert!(!h.machine.holds_local_media());
        assert_eq!(h.media.released.load(Ordering::SeqCst), 1);
    }
}
