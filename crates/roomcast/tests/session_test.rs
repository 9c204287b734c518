//! Negotiation state machine driven through the registry

mod harness;

use harness::{settle, wait_until, within, Call, SessionFixture};
use roomcast::config::IceDelivery;
use roomcast::peer::NegotiationPhase;
use roomcast::signaling::protocol::{IceCandidate, SdpType, SessionDescription};
use roomcast::transport::{TransportEvent, TransportState};
use roomcast::{Error, NegotiationState, Role, SessionEvent, SignalMessage};
use std::time::Duration;

fn expect_signal(event: SessionEvent, peer: &str) -> SignalMessage {
    match event {
        SessionEvent::Signal { peer_id, message } => {
            assert_eq!(peer_id, peer);
            message
        }
        other => panic!("expected a signal for {}, got {:?}", peer, other),
    }
}

#[tokio::test]
async fn test_caller_sends_exactly_one_offer() {
    let mut fixture = SessionFixture::trickle("A");
    let (session, created) = fixture.registry.get_or_create("B", Role::Caller);
    assert!(created);

    session.initiate_offer();
    session.initiate_offer();

    match expect_signal(fixture.next_event().await, "B") {
        SignalMessage::Offer(description) => assert_eq!(description.sdp, "offer-for-B"),
        other => panic!("expected an offer, got {:?}", other),
    }

    settle().await;
    fixture.assert_no_event();
    let transport = fixture.transports.transport("B", 0).await;
    assert_eq!(
        transport.calls(),
        vec![Call::CreateOffer, Call::SetLocal(SdpType::Offer)]
    );
    assert_eq!(
        session.state(),
        NegotiationState::Negotiating(NegotiationPhase::OfferSent)
    );
}

#[tokio::test]
async fn test_callee_ignores_offer_request() {
    let mut fixture = SessionFixture::trickle("A");
    let (session, _) = fixture.registry.get_or_create("X", Role::Callee);

    session.initiate_offer();
    settle().await;

    fixture.assert_no_event();
    let transport = fixture.transports.transport("X", 0).await;
    assert!(transport.calls().is_empty());
    assert_eq!(session.state(), NegotiationState::Created);
}

#[tokio::test]
async fn test_early_candidates_are_applied_in_order_once() {
    let mut fixture = SessionFixture::trickle("A");
    let (session, _) = fixture.registry.get_or_create("B", Role::Caller);
    session.initiate_offer();
    expect_signal(fixture.next_event().await, "B");

    for line in ["cand-1", "cand-2", "cand-3"] {
        session.on_remote_candidate(IceCandidate::new(line));
    }
    settle().await;

    let transport = fixture.transports.transport("B", 0).await;
    assert!(transport.candidates().is_empty());

    session.on_remote_answer(SessionDescription::answer("remote-answer"));
    wait_until(|| transport.candidates().len() == 3).await;

    session.on_remote_candidate(IceCandidate::new("cand-4"));
    wait_until(|| transport.candidates().len() == 4).await;
    settle().await;

    assert_eq!(
        transport.candidates(),
        vec!["cand-1", "cand-2", "cand-3", "cand-4"]
    );

    // Remote description is applied before any candidate
    let calls = transport.calls();
    let remote_at = calls
        .iter()
        .position(|c| *c == Call::SetRemote(SdpType::Answer))
        .unwrap();
    let first_candidate_at = calls
        .iter()
        .position(|c| matches!(c, Call::AddCandidate(_)))
        .unwrap();
    assert!(remote_at < first_candidate_at);
}

#[tokio::test]
async fn test_candidates_before_offer_are_flushed_for_callee() {
    let mut fixture = SessionFixture::trickle("A");
    let (session, _) = fixture.registry.get_or_create("X", Role::Callee);

    session.on_remote_candidate(IceCandidate::new("early-1"));
    session.on_remote_candidate(IceCandidate::new("early-2"));
    session.on_remote_offer(SessionDescription::offer("remote-offer"));

    match expect_signal(fixture.next_event().await, "X") {
        SignalMessage::Answer(description) => assert_eq!(description.sdp, "answer-for-X"),
        other => panic!("expected an answer, got {:?}", other),
    }

    let transport = fixture.transports.transport("X", 0).await;
    assert_eq!(
        transport.calls(),
        vec![
            Call::SetRemote(SdpType::Offer),
            Call::AddCandidate("early-1".to_string()),
            Call::AddCandidate("early-2".to_string()),
            Call::CreateAnswer,
            Call::SetLocal(SdpType::Answer),
        ]
    );
}

#[tokio::test]
async fn test_unexpected_answer_is_reported_not_fatal() {
    let mut fixture = SessionFixture::trickle("A");
    let (session, _) = fixture.registry.get_or_create("X", Role::Callee);

    session.on_remote_answer(SessionDescription::answer("stray"));

    match fixture.next_event().await {
        SessionEvent::Error { peer_id, error } => {
            assert_eq!(peer_id, "X");
            assert!(matches!(error, Error::UnexpectedAnswer(_)));
        }
        other => panic!("expected an error event, got {:?}", other),
    }

    assert!(!session.is_closed());
    assert!(fixture.registry.contains("X"));
    let transport = fixture.transports.transport("X", 0).await;
    assert!(transport.calls().is_empty());

    // The session still answers a proper offer afterwards
    session.on_remote_offer(SessionDescription::offer("remote-offer"));
    assert!(matches!(
        expect_signal(fixture.next_event().await, "X"),
        SignalMessage::Answer(_)
    ));
}

#[tokio::test]
async fn test_duplicate_answer_is_ignored() {
    let mut fixture = SessionFixture::trickle("A");
    let (session, _) = fixture.registry.get_or_create("B", Role::Caller);
    session.initiate_offer();
    expect_signal(fixture.next_event().await, "B");

    session.on_remote_answer(SessionDescription::answer("first"));
    session.on_remote_answer(SessionDescription::answer("second"));
    settle().await;

    let transport = fixture.transports.transport("B", 0).await;
    assert_eq!(transport.count(&Call::SetRemote(SdpType::Answer)), 1);
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_failed_negotiation_step_closes_session() {
    let mut fixture = SessionFixture::trickle("A");
    fixture.transports.reject_remote_descriptions();
    let (session, _) = fixture.registry.get_or_create("X", Role::Callee);

    session.on_remote_offer(SessionDescription::offer("remote-offer"));

    match fixture.next_event().await {
        SessionEvent::Closed {
            peer_id, reason, ..
        } => {
            assert_eq!(peer_id, "X");
            assert!(reason.contains("remote description rejected"));
        }
        other => panic!("expected the session to close, got {:?}", other),
    }
    assert!(session.is_closed());
    assert!(fixture.transports.transport("X", 0).await.is_closed());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let mut fixture = SessionFixture::trickle("A");
    let (session, _) = fixture.registry.get_or_create("B", Role::Caller);
    let transport = fixture.transports.transport("B", 0).await;

    session.close();
    session.close();
    within(session.closed()).await;
    session.close();

    match fixture.next_event().await {
        SessionEvent::Closed { reason, .. } => assert_eq!(reason, "closed"),
        other => panic!("expected a closed event, got {:?}", other),
    }
    settle().await;
    fixture.assert_no_event();
    assert_eq!(transport.count(&Call::Close), 1);
}

#[tokio::test]
async fn test_connected_only_after_transport_reports_it() {
    let mut fixture = SessionFixture::trickle("A");
    let (session, _) = fixture.registry.get_or_create("X", Role::Callee);
    session.on_remote_offer(SessionDescription::offer("remote-offer"));
    expect_signal(fixture.next_event().await, "X");
    assert_eq!(
        session.state(),
        NegotiationState::Negotiating(NegotiationPhase::AnswerSent)
    );

    let transport = fixture.transports.transport("X", 0).await;
    transport.set_state(TransportState::Connected);

    match fixture.next_event().await {
        SessionEvent::Connected { peer_id, generation } => {
            assert_eq!(peer_id, "X");
            assert_eq!(generation, session.generation());
        }
        other => panic!("expected a connected event, got {:?}", other),
    }
    assert_eq!(session.state(), NegotiationState::Connected);
}

#[tokio::test]
async fn test_trickle_forwards_local_candidates() {
    let mut fixture = SessionFixture::trickle("A");
    let (session, _) = fixture.registry.get_or_create("B", Role::Caller);
    session.initiate_offer();
    expect_signal(fixture.next_event().await, "B");

    let transport = fixture.transports.transport("B", 0).await;
    transport.discover_candidate("local-1");
    transport.emit(TransportEvent::GatheringComplete);

    match expect_signal(fixture.next_event().await, "B") {
        SignalMessage::IceCandidate(candidate) => assert_eq!(candidate.candidate, "local-1"),
        other => panic!("expected a candidate, got {:?}", other),
    }
    settle().await;
    fixture.assert_no_event();
}

#[tokio::test]
async fn test_bundled_waits_for_gathering() {
    let mut fixture = SessionFixture::new("A", IceDelivery::Bundled, Duration::from_secs(30));
    let (session, _) = fixture.registry.get_or_create("B", Role::Caller);
    session.initiate_offer();

    let transport = fixture.transports.transport("B", 0).await;
    wait_until(|| transport.count(&Call::SetLocal(SdpType::Offer)) == 1).await;

    transport.discover_candidate("local-1");
    transport.discover_candidate("local-2");
    settle().await;
    fixture.assert_no_event();
    assert_eq!(
        session.state(),
        NegotiationState::Negotiating(NegotiationPhase::CreatingOffer)
    );

    transport.emit(TransportEvent::GatheringComplete);
    match expect_signal(fixture.next_event().await, "B") {
        SignalMessage::Offer(description) => {
            assert_eq!(description.sdp, "offer-for-B +gathered")
        }
        other => panic!("expected the gathered offer, got {:?}", other),
    }

    settle().await;
    fixture.assert_no_event();
    assert_eq!(
        session.state(),
        NegotiationState::Negotiating(NegotiationPhase::OfferSent)
    );
}

#[tokio::test]
async fn test_offer_collision_lower_id_keeps_its_offer() {
    let mut fixture = SessionFixture::trickle("A");
    let (session, _) = fixture.registry.get_or_create("B", Role::Caller);
    session.initiate_offer();
    expect_signal(fixture.next_event().await, "B");

    session.on_remote_offer(SessionDescription::offer("competing-offer"));
    session.on_remote_answer(SessionDescription::answer("remote-answer"));

    let transport = fixture.transports.transport("B", 0).await;
    wait_until(|| transport.count(&Call::SetRemote(SdpType::Answer)) == 1).await;
    settle().await;

    fixture.assert_no_event();
    assert_eq!(transport.count(&Call::SetRemote(SdpType::Offer)), 0);
    assert_eq!(transport.count(&Call::CreateAnswer), 0);
    assert_eq!(session.role(), Role::Caller);
    assert_eq!(fixture.transports.transports_for("B").len(), 1);
}

#[tokio::test]
async fn test_offer_collision_higher_id_yields() {
    let mut fixture = SessionFixture::trickle("C");
    let (session, _) = fixture.registry.get_or_create("B", Role::Caller);
    session.initiate_offer();
    expect_signal(fixture.next_event().await, "B");

    session.on_remote_offer(SessionDescription::offer("competing-offer"));

    match expect_signal(fixture.next_event().await, "B") {
        SignalMessage::Answer(description) => assert_eq!(description.sdp, "answer-for-B"),
        other => panic!("expected an answer, got {:?}", other),
    }

    let first = fixture.transports.transport("B", 0).await;
    let second = fixture.transports.transport("B", 1).await;
    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert_eq!(
        second.calls(),
        vec![
            Call::SetRemote(SdpType::Offer),
            Call::CreateAnswer,
            Call::SetLocal(SdpType::Answer),
        ]
    );
    assert_eq!(session.role(), Role::Callee);
    assert!(!session.is_closed());

    // Events from the abandoned transport no longer count
    first.set_state(TransportState::Failed);
    settle().await;
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_caller_receiving_offer_first_becomes_callee() {
    let mut fixture = SessionFixture::trickle("C");
    let (session, _) = fixture.registry.get_or_create("B", Role::Caller);

    session.on_remote_offer(SessionDescription::offer("remote-offer"));
    assert!(matches!(
        expect_signal(fixture.next_event().await, "B"),
        SignalMessage::Answer(_)
    ));
    assert_eq!(session.role(), Role::Callee);

    // A late offer request no longer applies
    session.initiate_offer();
    settle().await;
    fixture.assert_no_event();
    let transport = fixture.transports.transport("B", 0).await;
    assert_eq!(transport.count(&Call::CreateOffer), 0);
}

#[tokio::test]
async fn test_negotiation_timeout_closes_session() {
    let mut fixture = SessionFixture::new("A", IceDelivery::Trickle, Duration::from_millis(200));
    let (session, _) = fixture.registry.get_or_create("B", Role::Caller);
    session.initiate_offer();
    expect_signal(fixture.next_event().await, "B");

    match fixture.next_event().await {
        SessionEvent::Closed { reason, .. } => assert!(reason.contains("not connected")),
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert!(session.is_closed());
    assert!(fixture.transports.transport("B", 0).await.is_closed());
}

#[tokio::test]
async fn test_negotiation_timeout_interrupts_stalled_offer() {
    let mut fixture = SessionFixture::new("A", IceDelivery::Trickle, Duration::from_millis(200));
    fixture.transports.stall_offers();
    let (session, _) = fixture.registry.get_or_create("B", Role::Caller);
    session.initiate_offer();

    match fixture.next_event().await {
        SessionEvent::Closed { reason, .. } => assert!(reason.contains("not connected")),
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert!(session.is_closed());
    let transport = fixture.transports.transport("B", 0).await;
    assert_eq!(transport.calls(), vec![Call::CreateOffer, Call::Close]);
}

#[tokio::test]
async fn test_close_interrupts_stalled_offer() {
    let fixture = SessionFixture::trickle("A");
    fixture.transports.stall_offers();
    let (session, _) = fixture.registry.get_or_create("B", Role::Caller);
    session.initiate_offer();

    let transport = fixture.transports.transport("B", 0).await;
    wait_until(|| transport.count(&Call::CreateOffer) == 1).await;
    assert_eq!(
        session.state(),
        NegotiationState::Negotiating(NegotiationPhase::CreatingOffer)
    );

    session.close();
    within(session.closed()).await;
    assert!(transport.is_closed());
}

#[tokio::test]
async fn test_commands_during_a_step_are_applied_in_order() {
    let mut fixture = SessionFixture::trickle("A");
    let (session, _) = fixture.registry.get_or_create("X", Role::Callee);
    session.on_remote_candidate(IceCandidate::new("cand-1"));
    session.on_remote_offer(SessionDescription::offer("remote-offer"));
    session.on_remote_candidate(IceCandidate::new("cand-2"));
    session.on_remote_candidate(IceCandidate::new("cand-3"));

    expect_signal(fixture.next_event().await, "X");
    let transport = fixture.transports.transport("X", 0).await;
    wait_until(|| transport.candidates().len() == 3).await;
    assert_eq!(transport.candidates(), vec!["cand-1", "cand-2", "cand-3"]);
}

#[tokio::test]
async fn test_connected_session_outlives_negotiation_timeout() {
    let mut fixture = SessionFixture::new("A", IceDelivery::Trickle, Duration::from_millis(200));
    let (session, _) = fixture.registry.get_or_create("X", Role::Callee);
    session.on_remote_offer(SessionDescription::offer("remote-offer"));
    expect_signal(fixture.next_event().await, "X");

    fixture
        .transports
        .transport("X", 0)
        .await
        .set_state(TransportState::Connected);
    assert!(matches!(
        fixture.next_event().await,
        SessionEvent::Connected { .. }
    ));

    tokio::time::sleep(Duration::from_millis(400)).await;
    fixture.assert_no_event();
    assert_eq!(session.state(), NegotiationState::Connected);
}

#[tokio::test]
async fn test_registry_clear_releases_every_transport() {
    let fixture = SessionFixture::trickle("A");
    for peer in ["B", "C", "D"] {
        fixture.registry.get_or_create(peer, Role::Caller).0.initiate_offer();
    }
    for peer in ["B", "C", "D"] {
        fixture.transports.transport(peer, 0).await;
    }

    within(fixture.registry.clear()).await;

    assert!(fixture.registry.is_empty());
    for peer in ["B", "C", "D"] {
        assert!(fixture.transports.transport(peer, 0).await.is_closed());
    }
}
