//! Shared fakes and harness for the call-core integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use pairtalk_call_core::peer::PeerEventSender;
use pairtalk_call_core::signaling::memory::{MemorySignalingPort, MemorySignalingRemote};
use pairtalk_call_core::{
    CallConfig, CallError, CallEvent, CallResult, EventIterator, IceCandidate, LocalMedia, LocalTrack,
    MediaCapability, MediaOptions, PeerConfig, PeerConnection, PeerConnectionState, PeerEngine, PeerEvent,
    RemoteTrack, Role, RoomId, SessionController, SessionDescription, SignalingMessage, TrackKind,
};

/// Media capability that counts acquisitions and releases
#[derive(Default)]
pub struct FakeMedia {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub fail_acquire: AtomicBool,
    pub no_reuse: AtomicBool,
    /// Time an acquisition takes after the source is already open
    pub acquire_delay_ms: AtomicU64,
    pub attached: Mutex<Vec<TrackKind>>,
    pub detached: AtomicUsize,
}

impl FakeMedia {
    /// Sources acquired and not yet released
    pub fn live_sources(&self) -> usize {
        self.acquired.load(Ordering::SeqCst) - self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaCapability for FakeMedia {
    async fn acquire_local(&self, options: &MediaOptions) -> CallResult<LocalMedia> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(CallError::capability("microphone permission denied"));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let delay = self.acquire_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(LocalMedia::new(options.mode))
    }

    async fn release_local(&self, _media: LocalMedia) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn supports_reuse(&self) -> bool {
        !self.no_reuse.load(Ordering::SeqCst)
    }

    async fn attach_remote(&self, track: RemoteTrack) -> CallResult<()> {
        self.attached.lock().push(track.kind);
        Ok(())
    }

    async fn detach_remote(&self) {
        self.detached.fetch_add(1, Ordering::SeqCst);
    }
}

/// One scripted peer connection
pub struct FakeConnection {
    pub index: usize,
    pub log: Mutex<Vec<String>>,
    pub applied_candidates: Mutex<Vec<String>>,
    pub closes: AtomicUsize,
    events: PeerEventSender,
    gates: Arc<Mutex<HashMap<&'static str, Arc<Notify>>>>,
    fail_remote: bool,
    connect_on_remote: bool,
}

impl FakeConnection {
    fn record(&self, entry: impl Into<String>) {
        self.log.lock().push(entry.into());
    }

    async fn gate(&self, op: &'static str) {
        let gate = self.gates.lock().get(op).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    /// Report a connection state as the engine would
    pub fn fire(&self, state: PeerConnectionState) {
        let _ = self.events.send(PeerEvent::ConnectionStateChanged(state));
    }

    /// Report a gathered local candidate
    pub fn gather(&self, candidate: &str) {
        let _ = self.events.send(PeerEvent::LocalCandidate(IceCandidate::new(candidate)));
    }

    /// Report an incoming remote track
    pub fn remote_track(&self, kind: TrackKind) {
        let _ = self
            .events
            .send(PeerEvent::RemoteTrack(RemoteTrack::new(format!("remote-{}", kind), kind)));
    }

    pub fn is_closed(&self) -> bool {
        self.closes.load(Ordering::SeqCst) > 0
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.applied_candidates.lock().clone()
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn add_local_tracks(&self, tracks: &[LocalTrack]) -> CallResult<()> {
        for track in tracks {
            self.record(format!("track:{}", track.kind));
        }
        Ok(())
    }

    async fn create_offer(&self) -> CallResult<SessionDescription> {
        self.gate("create_offer").await;
        self.record("create_offer");
        Ok(SessionDescription::offer(format!("offer-{}", self.index)))
    }

    async fn create_answer(&self) -> CallResult<SessionDescription> {
        self.gate("create_answer").await;
        self.record("create_answer");
        Ok(SessionDescription::answer(format!("answer-{}", self.index)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> CallResult<()> {
        self.record(format!("local:{}", description.sdp));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> CallResult<()> {
        if self.fail_remote {
            return Err(CallError::internal("remote description rejected"));
        }
        self.record(format!("remote:{}", description.sdp));
        if self.connect_on_remote {
            // Engine reports connectivity before the apply call returns
            self.fire(PeerConnectionState::Connected);
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> CallResult<()> {
        if candidate.candidate.starts_with("bad") {
            return Err(CallError::internal("malformed candidate"));
        }
        self.record(format!("candidate:{}", candidate.candidate));
        self.applied_candidates.lock().push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) -> CallResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Engine that hands out [`FakeConnection`]s and remembers them
#[derive(Default)]
pub struct FakeEngine {
    pub connections: Mutex<Vec<Arc<FakeConnection>>>,
    pub unavailable: AtomicBool,
    pub fail_remote: AtomicBool,
    pub connect_on_remote: AtomicBool,
    gates: Arc<Mutex<HashMap<&'static str, Arc<Notify>>>>,
}

impl FakeEngine {
    /// Connection created `index`-th, if any
    pub fn connection(&self, index: usize) -> Option<Arc<FakeConnection>> {
        self.connections.lock().get(index).cloned()
    }

    /// Most recent connection
    pub fn last(&self) -> Arc<FakeConnection> {
        self.connections
            .lock()
            .last()
            .cloned()
            .expect("no peer connection created yet")
    }

    pub fn created(&self) -> usize {
        self.connections.lock().len()
    }

    /// Make `op` ("create", "create_offer" / "create_answer") wait for
    /// [`FakeEngine::release`]
    pub fn hold(&self, op: &'static str) {
        self.gates.lock().insert(op, Arc::new(Notify::new()));
    }

    /// Let a held `op` complete
    pub fn release(&self, op: &'static str) {
        if let Some(gate) = self.gates.lock().remove(op) {
            gate.notify_waiters();
            gate.notify_one();
        }
    }
}

#[async_trait]
impl PeerEngine for FakeEngine {
    async fn create(&self, _config: &PeerConfig, events: PeerEventSender) -> CallResult<Arc<dyn PeerConnection>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CallError::capability("peer engine not loaded"));
        }
        let gate = self.gates.lock().get("create").cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut connections = self.connections.lock();
        let connection = Arc::new(FakeConnection {
            index: connections.len() + 1,
            log: Mutex::new(Vec::new()),
            applied_candidates: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            events,
            gates: self.gates.clone(),
            fail_remote: self.fail_remote.load(Ordering::SeqCst),
            connect_on_remote: self.connect_on_remote.load(Ordering::SeqCst),
        });
        connections.push(connection.clone());
        Ok(connection)
    }
}

/// A running controller wired to fakes
pub struct Harness {
    pub controller: SessionController,
    pub remote: MemorySignalingRemote,
    pub media: Arc<FakeMedia>,
    pub engine: Arc<FakeEngine>,
    pub events: EventIterator,
}

impl Harness {
    pub fn new(config: CallConfig) -> Self {
        Self::with_fakes(config, FakeMedia::default(), FakeEngine::default())
    }

    pub fn with_fakes(config: CallConfig, media: FakeMedia, engine: FakeEngine) -> Self {
        let (port, remote) = MemorySignalingPort::pair(64);
        let media = Arc::new(media);
        let engine = Arc::new(engine);
        let controller = SessionController::new(config, Arc::new(port), media.clone(), engine.clone())
            .expect("controller starts");
        let events = controller.subscribe_simple();
        Self {
            controller,
            remote,
            media,
            engine,
            events,
        }
    }

    /// Deliver a server/partner message and let the controller process it
    pub async fn deliver(&self, message: SignalingMessage) {
        self.remote.deliver(message).await.expect("controller is listening");
        settle().await;
    }

    pub async fn partner_found(&self, room: &str, role: Role) {
        self.deliver(SignalingMessage::PartnerFound {
            room_id: RoomId::new(room),
            role,
        })
        .await;
    }

    pub async fn offer(&self, room: &str, sdp: &str) {
        self.deliver(SignalingMessage::Offer {
            room_id: RoomId::new(room),
            sdp: sdp.to_string(),
        })
        .await;
    }

    pub async fn answer(&self, room: &str, sdp: &str) {
        self.deliver(SignalingMessage::Answer {
            room_id: RoomId::new(room),
            sdp: sdp.to_string(),
        })
        .await;
    }

    pub async fn candidate(&self, room: &str, candidate: &str) {
        self.deliver(SignalingMessage::IceCandidate {
            room_id: RoomId::new(room),
            candidate: IceCandidate::new(candidate),
        })
        .await;
    }

    pub async fn remote_hangup(&self, room: &str) {
        self.deliver(SignalingMessage::Hangup {
            room_id: RoomId::new(room),
        })
        .await;
    }

    /// Everything published since the last call
    pub async fn published(&self) -> Vec<SignalingMessage> {
        settle().await;
        self.remote.drain_published().await
    }

    /// Drive an initiator pairing for `room` all the way to `Active`
    pub async fn connect_as_initiator(&self, room: &str) -> Arc<FakeConnection> {
        self.controller.search().await.expect("search");
        self.partner_found(room, Role::Initiator).await;
        let connection = self.engine.last();
        self.answer(room, "remote-answer").await;
        connection.fire(PeerConnectionState::Connected);
        settle().await;
        connection
    }

    /// Events received so far, without waiting for more
    pub async fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::ZERO, self.events.next()).await {
            out.push(event);
        }
        out
    }
}

/// Let every ready task run until the controller is quiet
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Advance paused time and let timer-driven work run
pub async fn advance(duration: Duration) {
    tokio::time::advance(duration).await;
    settle().await;
}

pub fn room(id: &str) -> RoomId {
    RoomId::new(id)
}

pub fn count_find_partner(messages: &[SignalingMessage]) -> usize {
    messages
        .iter()
        .filter(|m| matches!(m, SignalingMessage::FindPartner))
        .count()
}
