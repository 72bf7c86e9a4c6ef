//! Timer-driven behaviour: 2xx and reliable 1xx retransmission, and
//! expiry of responses and requests nobody answers.

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;

use common::*;
use rvoip_sipsess::{AcceptParams, Method, Rel100Mode, SessionSocket, TerminationCause};

/// Let paused time run forward in small steps, dispatching timers as they
/// fire so re-armed timers start from the right instant
async fn advance(socket: &SessionSocket, total: Duration) {
    let step = Duration::from_millis(50);
    let mut elapsed = Duration::ZERO;
    while elapsed < total {
        tokio::time::sleep(step).await;
        tokio::task::yield_now().await;
        socket.process_timers();
        elapsed += step;
    }
}

#[tokio::test(start_paused = true)]
async fn test_2xx_retransmitted_until_ack() {
    let transport = MockTransport::new();
    let socket = socket(&transport);
    let handler = RecordingHandler::new();

    let session = socket
        .accept(
            AcceptParams::new(invite("retx", Some(OFFER)), 200, "OK", "bob", handler.clone())
                .with_content(SDP, ANSWER),
        )
        .unwrap();
    assert_eq!(transport.replies_with(200).len(), 1);

    // resent at 0.5 s, 1.5 s and 3.5 s
    advance(&socket, Duration::from_secs(5)).await;
    let copies = transport.replies_with(200);
    assert_eq!(copies.len(), 4);
    assert!(copies.iter().all(|r| r == &copies[0]));

    socket.handle_request(from_peer(&session, Method::Ack, 100));
    advance(&socket, Duration::from_secs(10)).await;

    assert_eq!(transport.replies_with(200).len(), 4);
    assert!(session.is_established());
    assert!(handler.closes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_2xx_without_ack_times_out() {
    let transport = MockTransport::new();
    let socket = socket(&transport);
    let handler = RecordingHandler::new();

    let session = socket
        .accept(
            AcceptParams::new(invite("no-ack", Some(OFFER)), 200, "OK", "bob", handler.clone())
                .with_content(SDP, ANSWER),
        )
        .unwrap();

    advance(&socket, Duration::from_secs(33)).await;

    // interval doubles up to T2 (4 s): ten resends within 64*T1
    assert_eq!(transport.replies_with(200).len(), 11);
    assert_eq!(transport.sent(Method::Bye).len(), 1);
    assert!(session.is_terminated());
    assert_eq!(handler.closes(), vec![TerminationCause::Timeout]);

    answer_bye(&socket, &transport, 200);
    assert_eq!(socket.session_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reliable_provisional_without_prack_times_out() {
    let transport = MockTransport::new();
    let socket = socket(&transport);
    let handler = RecordingHandler::new();

    let session = socket
        .accept(
            AcceptParams::new(
                invite("no-prack", Some(OFFER)).with_header("Supported", "100rel"),
                183,
                "Session Progress",
                "bob",
                handler.clone(),
            )
            .with_rel100(Rel100Mode::Required)
            .with_content(SDP, ANSWER),
        )
        .unwrap();
    assert_eq!(session.awaiting_prack(), 1);

    advance(&socket, Duration::from_secs(10)).await;
    // resent at 0.5 s, 1.5 s, 3.5 s and 7.5 s
    assert_eq!(transport.replies_with(183).len(), 5);

    advance(&socket, Duration::from_secs(23)).await;
    assert_eq!(transport.replies_with(183).len(), 7);
    assert_eq!(transport.last_reply().status, 504);
    assert!(session.is_terminated());
    assert_eq!(handler.closes(), vec![TerminationCause::Timeout]);
}

#[tokio::test(start_paused = true)]
async fn test_prack_stops_provisional_retransmission() {
    let transport = MockTransport::new();
    let socket = socket(&transport);
    let handler = RecordingHandler::new();

    let session = socket
        .accept(
            AcceptParams::new(
                invite("pracked", Some(OFFER)).with_header("Supported", "100rel"),
                183,
                "Session Progress",
                "bob",
                handler.clone(),
            )
            .with_rel100(Rel100Mode::Supported)
            .with_content(SDP, ANSWER),
        )
        .unwrap();

    advance(&socket, Duration::from_secs(1)).await;
    assert_eq!(transport.replies_with(183).len(), 2);

    socket.handle_request(from_peer(&session, Method::Prack, 101).with_header("RAck", "1 100 INVITE"));
    advance(&socket, Duration::from_secs(40)).await;

    assert_eq!(transport.replies_with(183).len(), 2);
    assert!(!session.is_terminated());
    assert_eq!(handler.events(), vec![Event::Prack]);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_reinvite_expires() {
    let transport = MockTransport::new();
    let socket = socket(&transport);
    let handler = RecordingHandler::new();

    let session = socket
        .accept(
            AcceptParams::new(invite("stuck", Some(OFFER)), 200, "OK", "bob", handler.clone())
                .with_content(SDP, ANSWER),
        )
        .unwrap();
    socket.handle_request(from_peer(&session, Method::Ack, 100));

    session.reinvite(Some(OFFER.into())).unwrap();
    advance(&socket, Duration::from_secs(31)).await;
    assert!(!session.is_terminated());

    advance(&socket, Duration::from_secs(2)).await;
    assert!(session.is_terminated());
    assert_eq!(transport.sent(Method::Bye).len(), 1);
    assert_eq!(handler.closes(), vec![TerminationCause::Timeout]);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_bye_releases_session() {
    let transport = MockTransport::new();
    let socket = socket(&transport);
    let handler = RecordingHandler::new();

    let session = socket
        .accept(
            AcceptParams::new(invite("bye-lost", Some(OFFER)), 200, "OK", "bob", handler.clone())
                .with_content(SDP, ANSWER),
        )
        .unwrap();
    socket.handle_request(from_peer(&session, Method::Ack, 100));

    session.bye().unwrap();
    advance(&socket, Duration::from_secs(31)).await;
    assert_eq!(socket.session_count(), 1);

    advance(&socket, Duration::from_secs(2)).await;
    assert_eq!(socket.session_count(), 0);
    assert_eq!(session.pending_requests(), 0);
    assert_eq!(transport.sent(Method::Bye).len(), 1);
    assert!(handler.closes().is_empty());
}
