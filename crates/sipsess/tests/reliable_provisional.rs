//! Reliable provisional responses and PRACK on the answering side

mod common;

use pretty_assertions::assert_eq;

use common::*;
use rvoip_sipsess::{AcceptParams, Conflict, Method, NegotiationState, Rel100Mode, SessionError};

fn invite_100rel(call_id: &str, offer: Option<&str>) -> rvoip_sipsess::SipRequest {
    invite(call_id, offer).with_header("Supported", "100rel, timer")
}

#[test_log::test]
fn test_required_without_peer_support() {
    let transport = MockTransport::new();
    let socket = socket(&transport);
    let handler = RecordingHandler::new();

    let result = socket.accept(
        AcceptParams::new(invite("no-100rel", Some(OFFER)), 183, "Session Progress", "bob", handler)
            .with_rel100(Rel100Mode::Required)
            .with_content(SDP, ANSWER),
    );

    match result {
        Err(SessionError::ExtensionRequired { extension }) => assert_eq!(extension, "100rel"),
        other => panic!("expected ExtensionRequired, got {:?}", other.map(|_| ())),
    }
    assert!(transport.statuses().is_empty());
    assert_eq!(socket.session_count(), 0);
}

#[test_log::test]
fn test_supported_falls_back_to_unreliable() {
    let transport = MockTransport::new();
    let socket = socket(&transport);
    let handler = RecordingHandler::new();

    let session = socket
        .accept(
            AcceptParams::new(invite("plain", Some(OFFER)), 183, "Session Progress", "bob", handler)
                .with_rel100(Rel100Mode::Supported)
                .with_content(SDP, ANSWER),
        )
        .unwrap();

    let progress = transport.last_reply();
    assert!(progress.rseq().is_none());
    assert_eq!(session.awaiting_prack(), 0);
    // early media preview does not settle the offer
    assert_eq!(session.negotiation_state(), NegotiationState::RemoteOffer);
}

#[test_log::test]
fn test_reliable_answer_blocks_final_until_prack() {
    let transport = MockTransport::new();
    let socket = socket(&transport);
    let handler = RecordingHandler::new();

    let session = socket
        .accept(
            AcceptParams::new(invite_100rel("rel", Some(OFFER)), 183, "Session Progress", "bob", handler.clone())
                .with_rel100(Rel100Mode::Supported)
                .with_content(SDP, ANSWER),
        )
        .unwrap();

    let progress = transport.last_reply();
    assert!(progress.has_token("Require", "100rel"));
    assert_eq!(progress.rseq(), Some(1));
    assert_eq!(progress.body, ANSWER.as_bytes());
    assert_eq!(session.awaiting_prack(), 1);
    assert_eq!(session.negotiation_state(), NegotiationState::Idle);

    let err = session.answer(200, "OK", None, &[]).unwrap_err();
    assert_eq!(err.conflict(), Some(Conflict::AwaitingPrack));
    assert!(err.is_transient());

    let err = session.progress(180, "Ringing", Rel100Mode::Supported, None, &[]).unwrap_err();
    assert_eq!(err.conflict(), Some(Conflict::AwaitingPrack));

    // unreliable progress is still allowed
    session.progress(180, "Ringing", Rel100Mode::Disabled, None, &[]).unwrap();
    assert_eq!(transport.last_reply().status, 180);

    socket.handle_request(from_peer(&session, Method::Prack, 101));
    assert_eq!(transport.last_reply().status, 400);

    socket.handle_request(from_peer(&session, Method::Prack, 102).with_header("RAck", "2 100 INVITE"));
    assert_eq!(transport.last_reply().status, 481);

    socket.handle_request(from_peer(&session, Method::Prack, 103).with_header("RAck", "1 99 INVITE"));
    assert_eq!(transport.last_reply().status, 481);
    assert_eq!(session.awaiting_prack(), 1);

    socket.handle_request(from_peer(&session, Method::Prack, 104).with_header("RAck", "1 100 INVITE"));
    assert_eq!(transport.last_reply().status, 200);
    assert_eq!(session.awaiting_prack(), 0);
    assert_eq!(handler.events(), vec![Event::Prack]);

    session.answer(200, "OK", None, &[]).unwrap();
    assert_eq!(transport.last_reply().status, 200);
    assert_eq!(transport.last_reply().cseq.method, Method::Invite);
}

#[test_log::test]
fn test_second_reliable_response_gets_next_rseq() {
    let transport = MockTransport::new();
    let socket = socket(&transport);
    let handler = RecordingHandler::new();

    let session = socket
        .accept(
            AcceptParams::new(invite_100rel("rseq", Some(OFFER)), 183, "Session Progress", "bob", handler)
                .with_rel100(Rel100Mode::Supported)
                .with_content(SDP, ANSWER),
        )
        .unwrap();
    socket.handle_request(from_peer(&session, Method::Prack, 101).with_header("RAck", "1 100 INVITE"));

    session.progress(180, "Ringing", Rel100Mode::Supported, None, &[]).unwrap();
    let ringing = transport.last_reply();
    assert_eq!(ringing.status, 180);
    assert_eq!(ringing.rseq(), Some(2));
    assert_eq!(session.awaiting_prack(), 1);
}

#[test_log::test]
fn test_offer_in_reliable_provisional_answered_in_prack() {
    let transport = MockTransport::new();
    let socket = socket(&transport);
    let handler = RecordingHandler::new();

    let session = socket
        .accept(
            AcceptParams::new(invite_100rel("early-offer", None), 183, "Session Progress", "bob", handler.clone())
                .with_rel100(Rel100Mode::Supported)
                .with_content(SDP, OFFER),
        )
        .unwrap();
    assert_eq!(transport.last_reply().body, OFFER.as_bytes());
    assert_eq!(session.negotiation_state(), NegotiationState::LocalOffer);

    let prack = from_peer(&session, Method::Prack, 101)
        .with_header("RAck", "1 100 INVITE")
        .with_body(SDP, ANSWER);
    socket.handle_request(prack);

    assert_eq!(transport.last_reply().status, 200);
    assert_eq!(session.negotiation_state(), NegotiationState::Idle);
    assert_eq!(handler.events(), vec![Event::Answer, Event::Prack]);

    // the offer was answered, so the 2xx does not offer again
    session.answer(200, "OK", None, &[]).unwrap();
    assert_eq!(session.negotiation_state(), NegotiationState::Idle);
}

#[test_log::test]
fn test_offer_in_prack_is_answered_in_its_response() {
    let transport = MockTransport::new();
    let socket = socket(&transport);
    let handler = RecordingHandler::new();

    let session = socket
        .accept(
            AcceptParams::new(invite_100rel("prack-offer", Some(OFFER)), 183, "Session Progress", "bob", handler.clone())
                .with_rel100(Rel100Mode::Supported)
                .with_content(SDP, ANSWER),
        )
        .unwrap();

    let prack = from_peer(&session, Method::Prack, 101)
        .with_header("RAck", "1 100 INVITE")
        .with_body(SDP, OFFER);
    socket.handle_request(prack);

    let response = transport.last_reply();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, ANSWER.as_bytes());
    assert_eq!(session.negotiation_state(), NegotiationState::Idle);
    assert_eq!(handler.events(), vec![Event::Offer, Event::Prack]);
}
