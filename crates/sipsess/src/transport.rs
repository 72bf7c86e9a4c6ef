//! Transaction layer seam
//!
//! The session layer sits on top of a SIP transaction engine it does not
//! own. [`SipTransport`] is everything it needs from that engine: server
//! transactions to reply on, client transactions to send requests on, and a
//! stateless path for end-to-end ACKs. Results come back into the socket as
//! [`InboundEvent`]s, either by calling the socket directly or through an
//! [`InboundSource`] driven by [`crate::SessionSocket::run`].

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::SessionResult;
use crate::message::{SipRequest, SipResponse};

/// Opaque identifier of a transaction in the engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionKey(pub String);

impl TransactionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// How a client transaction ended, or a provisional step along the way
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// A response was received (1xx may precede the final one)
    Response(SipResponse),
    /// Timer B/F fired without a final response
    Timeout,
    /// The engine could not deliver the request
    Failed(String),
}

impl TransactionOutcome {
    /// Whether this outcome ends the transaction
    pub fn is_final(&self) -> bool {
        match self {
            TransactionOutcome::Response(r) => !r.is_provisional(),
            _ => true,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TransactionOutcome::Response(r) => Some(r.status),
            _ => None,
        }
    }

    pub fn response(&self) -> Option<&SipResponse> {
        match self {
            TransactionOutcome::Response(r) => Some(r),
            _ => None,
        }
    }
}

/// Transaction engine used by a session socket
///
/// Calls must not re-enter the socket synchronously; completions are
/// reported later through the socket's inbound handlers.
pub trait SipTransport: Send + Sync {
    /// Create a server transaction for an incoming request
    fn start_server_transaction(&self, request: &SipRequest) -> SessionResult<TransactionKey>;

    /// Send a response on a server transaction
    fn send_reply(&self, transaction: &TransactionKey, response: SipResponse) -> SessionResult<()>;

    /// Send a request on a new client transaction
    fn send_request(&self, request: SipRequest) -> SessionResult<TransactionKey>;

    /// Send an ACK for a 2xx outside any transaction
    fn send_ack(&self, ack: SipRequest) -> SessionResult<()>;

    /// CANCEL a pending INVITE client transaction
    fn cancel(&self, transaction: &TransactionKey) -> SessionResult<()>;
}

/// Something the transaction layer delivers to the session socket
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// New request, in or out of dialog
    Request(SipRequest),
    /// Progress or completion of one of our client transactions
    Response {
        transaction: TransactionKey,
        outcome: TransactionOutcome,
    },
    /// Response that matched no transaction (retransmitted 2xx)
    StrayResponse(SipResponse),
    /// CANCEL for a pending INVITE server transaction
    Cancel {
        transaction: TransactionKey,
        request: SipRequest,
    },
}

/// Async source of inbound events for [`crate::SessionSocket::run`]
#[async_trait]
pub trait InboundSource: Send {
    /// Next event, or `None` when the source is closed
    async fn next_event(&mut self) -> Option<InboundEvent>;
}

#[async_trait]
impl InboundSource for mpsc::Receiver<InboundEvent> {
    async fn next_event(&mut self) -> Option<InboundEvent> {
        self.recv().await
    }
}

#[async_trait]
impl InboundSource for mpsc::UnboundedReceiver<InboundEvent> {
    async fn next_event(&mut self) -> Option<InboundEvent> {
        self.recv().await
    }
}
