//! Application callbacks
//!
//! A session reports everything that happens to it through one
//! [`SessionHandler`]. All methods have defaults, so an application only
//! implements the events it cares about. Handlers are called from the
//! socket's event processing, never while session state is locked, so they
//! may call back into the session (e.g. `answer` from `on_offer`).
//!
//! Once a session terminates its handler is released; no method is called
//! on it again.

use std::fmt;

use crate::errors::SessionResult;
use crate::message::{Body, Header, SipMessage, SipRequest, SipResponse, reason_phrase};
use crate::session::Session;
use crate::socket::SessionSocket;

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationCause {
    /// INVITE was cancelled by the peer
    ConnectionReset,
    /// Peer sent BYE
    PeerBye,
    /// Our INVITE or re-INVITE failed with this status
    Rejected(u16),
    /// No ACK, PRACK or response within the transaction lifetime
    Timeout,
    /// Transaction layer failure
    Transport(String),
    /// A challenge could not be answered
    Authentication(String),
    /// Redirection could not be followed
    Redirected(u16),
    /// Peer violated the offer/answer or dialog rules
    Protocol(String),
    /// Ended locally (close, bye, reject)
    Local,
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationCause::ConnectionReset => write!(f, "connection reset"),
            TerminationCause::PeerBye => write!(f, "peer hung up"),
            TerminationCause::Rejected(status) => write!(f, "rejected with {}", status),
            TerminationCause::Timeout => write!(f, "timed out"),
            TerminationCause::Transport(e) => write!(f, "transport failure: {}", e),
            TerminationCause::Authentication(e) => write!(f, "authentication failed: {}", e),
            TerminationCause::Redirected(status) => write!(f, "unfollowable redirect {}", status),
            TerminationCause::Protocol(e) => write!(f, "protocol error: {}", e),
            TerminationCause::Local => write!(f, "closed locally"),
        }
    }
}

/// Response the application chooses for an INFO or REFER
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<Header>,
    pub content: Option<(String, Body)>,
}

impl Reply {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: Vec::new(),
            content: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200, reason_phrase(200))
    }

    pub fn accepted() -> Self {
        Self::new(202, "Accepted")
    }

    pub fn not_implemented() -> Self {
        Self::new(501, reason_phrase(501))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    pub fn with_body(mut self, content_type: impl Into<String>, body: impl Into<Body>) -> Self {
        self.content = Some((content_type.into(), body.into()));
        self
    }
}

/// Per-session event sink
#[allow(unused_variables)]
pub trait SessionHandler: Send + Sync {
    /// The peer made an offer; return the answer body
    ///
    /// `Ok(None)` answers with the session's current content. An error
    /// rejects the offer with 488.
    fn on_offer(&self, session: &Session, msg: &SipMessage) -> SessionResult<Option<Body>> {
        Ok(None)
    }

    /// The peer answered our offer
    fn on_answer(&self, session: &Session, msg: &SipMessage) {}

    /// Provisional response to our INVITE
    fn on_progress(&self, session: &Session, response: &SipResponse) {}

    /// Session established (2xx received, or ACK for our 2xx received)
    fn on_establish(&self, session: &Session, msg: &SipMessage) {}

    /// INFO received within the dialog
    fn on_info(&self, session: &Session, request: &SipRequest) -> Reply {
        Reply::not_implemented()
    }

    /// REFER received within the dialog
    fn on_refer(&self, session: &Session, request: &SipRequest) -> Reply {
        Reply::not_implemented()
    }

    /// Session terminated by the peer or by an error
    fn on_close(&self, session: &Session, cause: &TerminationCause, msg: Option<&SipMessage>) {}

    /// Incoming INVITE was cancelled before we answered it
    fn on_cancel(&self, session: &Session, request: &SipRequest) {}

    /// Our INVITE was redirected to `contact`
    fn on_redirect(&self, session: &Session, response: &SipResponse, contact: &str) {}

    /// PRACK for one of our reliable provisional responses was accepted
    fn on_prack(&self, session: &Session, request: &SipRequest) {}
}

/// Socket-level hook for new incoming INVITEs
///
/// The application decides whether to [`SessionSocket::accept`] the call or
/// answer it some other way (e.g. reject it outright).
pub trait ConnectHandler: Send + Sync {
    fn on_connect(&self, socket: &SessionSocket, request: &SipRequest);
}

impl<F> ConnectHandler for F
where
    F: Fn(&SessionSocket, &SipRequest) + Send + Sync,
{
    fn on_connect(&self, socket: &SessionSocket, request: &SipRequest) {
        self(socket, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_builders() {
        let reply = Reply::ok().with_header("Event", "refer").with_body("message/sipfrag", "SIP/2.0 200 OK");
        assert_eq!(reply.status, 200);
        assert_eq!(reply.reason, "OK");
        assert_eq!(reply.headers[0], Header::new("Event", "refer"));
        assert_eq!(reply.content.as_ref().map(|(t, _)| t.as_str()), Some("message/sipfrag"));
        assert_eq!(Reply::not_implemented().status, 501);
    }

    #[test]
    fn test_cause_display() {
        assert_eq!(TerminationCause::Rejected(486).to_string(), "rejected with 486");
        assert_eq!(TerminationCause::ConnectionReset.to_string(), "connection reset");
    }
}
