//! Shared test fixtures: a recording transport and handler, and builders
//! for the peer's side of the conversation.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use rvoip_sipsess::{
    Body, Header, Method, NameAddr, Reply, Session, SessionConfig, SessionError, SessionHandler,
    SessionResult, SessionSocket, SipMessage, SipRequest, SipResponse, SipTransport, TerminationCause,
    TransactionKey, TransactionOutcome,
};

pub const OFFER: &str = "v=0\r\no=alice 1 1 IN IP4 10.0.0.1\r\n";
pub const ANSWER: &str = "v=0\r\no=bob 1 1 IN IP4 10.0.0.2\r\n";
pub const SDP: &str = "application/sdp";

/// Transport that records everything the session layer sends
#[derive(Default)]
pub struct MockTransport {
    next_server: AtomicU32,
    next_client: AtomicU32,
    pub replies: Mutex<Vec<(TransactionKey, SipResponse)>>,
    pub requests: Mutex<Vec<(TransactionKey, SipRequest)>>,
    pub acks: Mutex<Vec<SipRequest>>,
    pub cancels: Mutex<Vec<TransactionKey>>,
    pub fail: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> SessionResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SessionError::transport("link down"));
        }
        Ok(())
    }

    /// Status codes of all responses sent, in order
    pub fn statuses(&self) -> Vec<u16> {
        self.replies.lock().iter().map(|(_, r)| r.status).collect()
    }

    pub fn last_reply(&self) -> SipResponse {
        self.replies.lock().last().map(|(_, r)| r.clone()).expect("no reply sent")
    }

    pub fn replies_with(&self, status: u16) -> Vec<SipResponse> {
        self.replies
            .lock()
            .iter()
            .filter(|(_, r)| r.status == status)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn sent(&self, method: Method) -> Vec<(TransactionKey, SipRequest)> {
        self.requests
            .lock()
            .iter()
            .filter(|(_, r)| r.method == method)
            .cloned()
            .collect()
    }

    pub fn last_sent(&self, method: Method) -> (TransactionKey, SipRequest) {
        self.sent(method).pop().expect("request not sent")
    }

    pub fn ack_count(&self) -> usize {
        self.acks.lock().len()
    }
}

impl SipTransport for MockTransport {
    fn start_server_transaction(&self, _request: &SipRequest) -> SessionResult<TransactionKey> {
        let n = self.next_server.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TransactionKey::new(format!("s{}", n)))
    }

    fn send_reply(&self, transaction: &TransactionKey, response: SipResponse) -> SessionResult<()> {
        self.check()?;
        self.replies.lock().push((transaction.clone(), response));
        Ok(())
    }

    fn send_request(&self, request: SipRequest) -> SessionResult<TransactionKey> {
        self.check()?;
        let n = self.next_client.fetch_add(1, Ordering::SeqCst) + 1;
        let key = TransactionKey::new(format!("c{}", n));
        self.requests.lock().push((key.clone(), request));
        Ok(key)
    }

    fn send_ack(&self, ack: SipRequest) -> SessionResult<()> {
        self.check()?;
        self.acks.lock().push(ack);
        Ok(())
    }

    fn cancel(&self, transaction: &TransactionKey) -> SessionResult<()> {
        self.cancels.lock().push(transaction.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Offer,
    Answer,
    Progress(u16),
    Establish,
    Info,
    Refer,
    Close(TerminationCause),
    Cancel,
    Redirect(String),
    Prack,
}

/// Handler that records callbacks and answers offers with a fixed body
pub struct RecordingHandler {
    pub events: Mutex<Vec<Event>>,
    pub answer: Option<Body>,
    pub refuse_offers: bool,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            answer: Some(Body::from(ANSWER)),
            refuse_offers: false,
        })
    }

    pub fn refusing() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            answer: None,
            refuse_offers: true,
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    pub fn closes(&self) -> Vec<TerminationCause> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Close(cause) => Some(cause.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl SessionHandler for RecordingHandler {
    fn on_offer(&self, _session: &Session, _msg: &SipMessage) -> SessionResult<Option<Body>> {
        self.push(Event::Offer);
        if self.refuse_offers {
            return Err(SessionError::invalid_argument("unsupported media"));
        }
        Ok(self.answer.clone())
    }

    fn on_answer(&self, _session: &Session, _msg: &SipMessage) {
        self.push(Event::Answer);
    }

    fn on_progress(&self, _session: &Session, response: &SipResponse) {
        self.push(Event::Progress(response.status));
    }

    fn on_establish(&self, _session: &Session, _msg: &SipMessage) {
        self.push(Event::Establish);
    }

    fn on_info(&self, _session: &Session, _request: &SipRequest) -> Reply {
        self.push(Event::Info);
        Reply::ok()
    }

    fn on_refer(&self, _session: &Session, _request: &SipRequest) -> Reply {
        self.push(Event::Refer);
        Reply::accepted()
    }

    fn on_close(&self, _session: &Session, cause: &TerminationCause, _msg: Option<&SipMessage>) {
        self.push(Event::Close(cause.clone()));
    }

    fn on_cancel(&self, _session: &Session, _request: &SipRequest) {
        self.push(Event::Cancel);
    }

    fn on_redirect(&self, _session: &Session, _response: &SipResponse, contact: &str) {
        self.push(Event::Redirect(contact.to_string()));
    }

    fn on_prack(&self, _session: &Session, _request: &SipRequest) {
        self.push(Event::Prack);
    }
}

pub fn socket(transport: &Arc<MockTransport>) -> SessionSocket {
    socket_with(transport, SessionConfig::default())
}

pub fn socket_with(transport: &Arc<MockTransport>, config: SessionConfig) -> SessionSocket {
    SessionSocket::new(transport.clone(), config).expect("valid config")
}

/// Initial INVITE from alice to bob
pub fn invite(call_id: &str, offer: Option<&str>) -> SipRequest {
    let request = SipRequest::new(
        Method::Invite,
        "sip:bob@example.com",
        call_id,
        100,
        NameAddr::new("sip:alice@example.com").with_tag("alice-tag"),
        NameAddr::new("sip:bob@example.com"),
    )
    .with_via("SIP/2.0/UDP 10.0.0.1;branch=z9hG4bK1")
    .with_contact("<sip:alice@10.0.0.1>");
    match offer {
        Some(body) => request.with_body(SDP, body.to_string()),
        None => request,
    }
}

/// Request from alice within the dialog of a session bob accepted
pub fn from_peer(session: &Session, method: Method, cseq: u32) -> SipRequest {
    SipRequest::new(
        method,
        "sip:bob@10.0.0.2",
        session.call_id(),
        cseq,
        NameAddr::new("sip:alice@example.com").with_tag("alice-tag"),
        NameAddr::new("sip:bob@example.com").with_tag(session.local_tag()),
    )
    .with_contact("<sip:alice@10.0.0.1>")
}

/// Request from bob within the dialog of a session alice connected
pub fn from_callee(session: &Session, method: Method, cseq: u32) -> SipRequest {
    SipRequest::new(
        method,
        "sip:alice@10.0.0.1",
        session.call_id(),
        cseq,
        NameAddr::new("sip:bob@example.com").with_tag("bob-tag"),
        NameAddr::new("sip:alice@example.com").with_tag(session.local_tag()),
    )
    .with_contact("<sip:bob@10.0.0.2>")
}

/// Response from the callee to a request we sent
pub fn respond(request: &SipRequest, status: u16) -> SipResponse {
    SipResponse::for_request(request, status, "")
        .with_to_tag("bob-tag")
        .with_contact("<sip:bob@10.0.0.2>")
}

/// Final response from the peer to the last BYE sent
pub fn answer_bye(socket: &SessionSocket, transport: &MockTransport, status: u16) -> bool {
    let (key, bye) = transport.last_sent(Method::Bye);
    socket.handle_response(&key, TransactionOutcome::Response(SipResponse::for_request(&bye, status, "")))
}

pub fn header(name: &str, value: &str) -> Header {
    Header::new(name, value)
}
