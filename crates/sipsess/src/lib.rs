//! # RVoIP sipsess - SIP session layer
//!
//! INVITE-initiated sessions on top of a SIP transaction layer: accepting
//! and placing calls, the offer/answer model, reliable provisional
//! responses (RFC 3262), UPDATE (RFC 3311), session modification with
//! glare handling, and teardown by BYE or CANCEL.
//!
//! ## Architecture
//!
//! - [`SessionSocket`] owns the sessions of one stack. It is fed requests,
//!   transaction outcomes and CANCELs by the transaction layer (directly or
//!   through [`SessionSocket::run`]) and routes them to sessions.
//! - [`Session`] is one dialog's state machine. It sends through the
//!   [`SipTransport`] it was created with and reports to its
//!   [`SessionHandler`].
//! - Retransmission of 2xx and reliable 1xx responses, request expiry and
//!   glare back-off run on tokio timers dispatched by the socket.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvoip_sipsess::{AcceptParams, SessionConfig, SessionHandler, SessionSocket, SipRequest, SipTransport};
//!
//! struct Callee;
//! impl SessionHandler for Callee {}
//!
//! fn on_invite(transport: Arc<dyn SipTransport>, invite: SipRequest) -> rvoip_sipsess::SessionResult<()> {
//!     let socket = SessionSocket::new(transport, SessionConfig::default())?;
//!     let session = socket.accept(AcceptParams::new(invite, 180, "Ringing", "bob", Arc::new(Callee)))?;
//!     session.answer(200, "OK", Some("v=0\r\n".into()), &[])?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod dialog;
pub mod errors;
pub mod handler;
pub mod loop_state;
pub mod message;
pub mod negotiation;
pub mod rel100;
pub mod session;
pub mod socket;
pub mod transport;

mod registry;
mod timer;

pub use auth::{AuthHandler, Credentials};
pub use config::SessionConfig;
pub use dialog::Dialog;
pub use errors::{Conflict, SessionError, SessionResult};
pub use handler::{ConnectHandler, Reply, SessionHandler, TerminationCause};
pub use loop_state::RequestKind;
pub use message::{Body, CSeq, Header, Method, NameAddr, RAck, SipMessage, SipRequest, SipResponse};
pub use negotiation::NegotiationState;
pub use registry::AckKey;
pub use rel100::Rel100Mode;
pub use session::{AcceptParams, ConnectParams, ResponseCallback, Session, WeakSession};
pub use socket::SessionSocket;
pub use transport::{InboundEvent, InboundSource, SipTransport, TransactionKey, TransactionOutcome};
