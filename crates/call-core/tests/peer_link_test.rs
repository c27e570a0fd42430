//! PeerLink against the scripted engine, with log capture

mod common;

use common::FakeEngine;
use pairtalk_call_core::peer::{SdpType, TaggedPeerEvent};
use pairtalk_call_core::types::SessionEpoch;
use pairtalk_call_core::{CallError, IceCandidate, PeerConfig, PeerConnectionState, PeerEvent, PeerLink};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};
use tracing_test::traced_test;

async fn link(engine: &FakeEngine, epoch: u64) -> (PeerLink, mpsc::UnboundedReceiver<TaggedPeerEvent>) {
    let (sink, events) = mpsc::unbounded_channel();
    let link = assert_ok!(PeerLink::create(engine, &PeerConfig::default(), SessionEpoch(epoch), sink).await);
    (link, events)
}

#[tokio::test]
#[traced_test]
async fn malformed_remote_candidate_is_logged_and_skipped() {
    let engine = FakeEngine::default();
    let (link, _events) = link(&engine, 7).await;
    assert_ok!(link.set_remote_description(SdpType::Offer, "remote-offer".into()).await);

    assert!(!link.add_remote_candidate(IceCandidate::new("bad-candidate")).await);
    assert!(link.add_remote_candidate(IceCandidate::new("host-1")).await);

    assert!(logs_contain("malformed candidate"));
    assert_eq!(engine.last().candidates(), vec!["host-1"]);
}

#[tokio::test]
#[traced_test]
async fn engine_events_carry_the_link_epoch() {
    let engine = FakeEngine::default();
    let (_link, mut events) = link(&engine, 3).await;
    let connection = engine.last();

    connection.fire(PeerConnectionState::Connecting);
    connection.fire(PeerConnectionState::Connecting);
    connection.gather("srflx-1");
    connection.fire(PeerConnectionState::Connected);

    let mut seen = Vec::new();
    for _ in 0..3 {
        let tagged = events.recv().await.unwrap();
        assert_eq!(tagged.epoch, SessionEpoch(3));
        seen.push(tagged.event);
    }
    assert!(matches!(seen[0], PeerEvent::ConnectionStateChanged(PeerConnectionState::Connecting)));
    assert!(matches!(&seen[1], PeerEvent::LocalCandidate(c) if c.candidate == "srflx-1"));
    assert!(matches!(seen[2], PeerEvent::ConnectionStateChanged(PeerConnectionState::Connected)));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
#[traced_test]
async fn closed_link_refuses_negotiation() {
    let engine = FakeEngine::default();
    let (link, _events) = link(&engine, 1).await;

    link.close().await;
    link.close().await;

    assert!(link.is_closed());
    assert_eq!(engine.last().closes.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(logs_contain("peer link closed"));

    let err = assert_err!(link.create_local_offer().await);
    assert!(matches!(err, CallError::Negotiation { .. }));
    assert!(!link.add_remote_candidate(IceCandidate::new("host-2")).await);
}

#[tokio::test]
async fn engine_failure_is_reported_as_capability() {
    let engine = FakeEngine::default();
    engine.unavailable.store(true, std::sync::atomic::Ordering::SeqCst);
    let (sink, _events) = mpsc::unbounded_channel();

    let result = PeerLink::create(&engine, &PeerConfig::default(), SessionEpoch(1), sink).await;

    assert!(matches!(result, Err(CallError::Capability { .. })));
}
