//! SIP session object
//!
//! A [`Session`] is the state machine for one dialog created by an INVITE,
//! either received ([`SessionSocket::accept`]) or sent
//! ([`SessionSocket::connect`]). It tracks offer/answer state, 100rel
//! reliability, the responses it is retransmitting and the requests it has
//! in flight, and reports to the application through its
//! [`SessionHandler`].
//!
//! `Session` is a cheap handle; clones refer to the same session. State is
//! behind a mutex that is never held while application code runs.
//!
//! ## Termination
//!
//! Every way a session can end goes through one path that marks it inert,
//! drops its timers and pending requests, unregisters it and releases the
//! handler. [`Session::terminate`] additionally reports the cause through
//! `on_close`; because the handler is taken on the first call, `on_close`
//! fires at most once however many times termination is requested.
//!
//! A BYE still waiting for its final response is kept: the session stays
//! registered with that one request, inert, until the BYE completes.
//!
//! [`SessionSocket::accept`]: crate::SessionSocket::accept
//! [`SessionSocket::connect`]: crate::SessionSocket::connect

mod accept;
mod ack;
mod connect;
mod listen;
mod reply;
mod request;

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::auth::Authenticator;
use crate::dialog::Dialog;
use crate::errors::{SessionError, SessionResult};
use crate::handler::{SessionHandler, TerminationCause};
use crate::loop_state::{RequestKind, RequestSlot};
use crate::message::{Body, Header, SipMessage, SipRequest};
use crate::negotiation::NegotiationState;
use crate::rel100::{Rel100Mode, Reliability};
use crate::socket::SocketInner;
use crate::transport::TransactionKey;

pub use accept::AcceptParams;
pub use connect::ConnectParams;
pub use request::ResponseCallback;

pub(crate) use reply::ReplyRecord;
pub(crate) use request::PendingRequest;

type StateGuard<'a> = MutexGuard<'a, SessionState>;

/// Mutable state of a session
pub(crate) struct SessionState {
    pub dialog: Dialog,
    /// We sent the initial INVITE
    pub owner: bool,
    pub established: bool,
    pub peerterm: bool,
    pub terminated: bool,
    /// Terminated from the application's view, still finishing a CANCEL or
    /// deferred BYE on the wire
    pub closing: bool,
    pub cause: Option<TerminationCause>,

    pub neg: NegotiationState,
    /// An offer/answer exchange completed for the current INVITE
    pub exchange_done: bool,
    pub rel100: Rel100Mode,
    pub rel: Reliability,

    pub contact: String,
    pub content_type: String,
    pub content: Option<Body>,
    pub close_headers: Vec<Header>,

    /// INVITE (initial or re-INVITE) waiting for our final response
    pub invite: Option<SipRequest>,
    pub server_tx: Option<TransactionKey>,
    pub replies: Vec<ReplyRecord>,

    pub requests: Vec<PendingRequest>,
    pub slot: RequestSlot,
    pub auth: Option<Authenticator>,
    pub bye_deferred: bool,

    pub handler: Option<Arc<dyn SessionHandler>>,
}

impl SessionState {
    pub fn new(
        dialog: Dialog,
        owner: bool,
        contact: String,
        content_type: String,
        rel100: Rel100Mode,
        handler: Arc<dyn SessionHandler>,
    ) -> Self {
        Self {
            dialog,
            owner,
            established: false,
            peerterm: false,
            terminated: false,
            closing: false,
            cause: None,
            neg: NegotiationState::Idle,
            exchange_done: false,
            rel100,
            rel: Reliability::default(),
            contact,
            content_type,
            content: None,
            close_headers: Vec::new(),
            invite: None,
            server_tx: None,
            replies: Vec::new(),
            requests: Vec::new(),
            slot: RequestSlot::new(),
            auth: None,
            bye_deferred: false,
            handler: Some(handler),
        }
    }

    /// Body paired with the session content type
    pub fn typed(&self, body: Option<Body>) -> Option<(String, Body)> {
        body.map(|b| (self.content_type.clone(), b))
    }
}

pub(crate) struct SessionInner {
    socket: Weak<SocketInner>,
    state: Mutex<SessionState>,
}

/// Handle to a SIP session
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Non-owning session reference held by timers and the transaction table
#[derive(Clone)]
pub struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.0.upgrade().map(|inner| Session { inner })
    }
}

impl fmt::Debug for WeakSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakSession")
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.lock();
        f.debug_struct("Session")
            .field("call_id", &st.dialog.call_id())
            .field("owner", &st.owner)
            .field("established", &st.established)
            .field("terminated", &st.terminated)
            .field("negotiation", &st.neg)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(socket: &Arc<SocketInner>, state: SessionState) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                socket: Arc::downgrade(socket),
                state: Mutex::new(state),
            }),
        }
    }

    pub(crate) fn lock(&self) -> StateGuard<'_> {
        self.inner.state.lock()
    }

    pub(crate) fn socket(&self) -> SessionResult<Arc<SocketInner>> {
        self.inner
            .socket
            .upgrade()
            .ok_or_else(|| SessionError::no_session("session socket is gone"))
    }

    pub(crate) fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.inner))
    }

    pub(crate) fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn matches_request(&self, request: &SipRequest) -> bool {
        self.lock().dialog.matches_request(request)
    }

    /// Live session state, or `NoSession` once terminated
    pub(crate) fn lock_live(&self) -> SessionResult<StateGuard<'_>> {
        let st = self.lock();
        if st.terminated {
            return Err(SessionError::no_session(format!(
                "session {} is terminated",
                st.dialog.call_id()
            )));
        }
        Ok(st)
    }

    pub fn call_id(&self) -> String {
        self.lock().dialog.call_id().to_string()
    }

    pub fn local_tag(&self) -> String {
        self.lock().dialog.local_tag().to_string()
    }

    pub fn remote_tag(&self) -> Option<String> {
        self.lock().dialog.remote_tag().map(str::to_string)
    }

    /// Whether this side sent the initial INVITE
    pub fn is_owner(&self) -> bool {
        self.lock().owner
    }

    pub fn is_established(&self) -> bool {
        self.lock().established
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminated
    }

    /// Whether the peer ended the session (BYE or CANCEL)
    pub fn peer_terminated(&self) -> bool {
        self.lock().peerterm
    }

    pub fn termination_cause(&self) -> Option<TerminationCause> {
        self.lock().cause.clone()
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.lock().neg
    }

    /// Reliable provisional responses still waiting for PRACK
    pub fn awaiting_prack(&self) -> u32 {
        self.lock().rel.awaiting_prack()
    }

    /// Session-modifying request currently in flight
    pub fn outstanding_request(&self) -> Option<RequestKind> {
        self.lock().slot.outstanding()
    }

    /// Number of session-initiated requests awaiting a final response
    pub fn pending_requests(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn dialog(&self) -> Dialog {
        self.lock().dialog.clone()
    }

    pub fn content(&self) -> Option<Body> {
        self.lock().content.clone()
    }

    /// Replace the content offered or answered with by future messages
    pub fn set_content(&self, content: impl Into<Body>) {
        self.lock().content = Some(content.into());
    }

    /// Terminate the session and report `cause` to the handler
    ///
    /// Safe to call at any time and any number of times; only the first
    /// call has an effect.
    pub fn terminate(&self, cause: TerminationCause, msg: Option<&SipMessage>) {
        if let Some(handler) = self.shutdown(cause.clone()) {
            handler.on_close(self, &cause, msg);
        }
    }

    /// Tear the session down without calling the handler
    ///
    /// Returns the released handler on the first call.
    pub(crate) fn shutdown(&self, cause: TerminationCause) -> Option<Arc<dyn SessionHandler>> {
        let socket = self.inner.socket.upgrade();

        let mut st = self.lock();
        if st.terminated && !st.closing {
            return None;
        }
        let cause = st.cause.get_or_insert(cause).clone();

        let mut requests = std::mem::take(&mut st.requests);
        let bye = requests
            .iter()
            .position(|p| p.kind == RequestKind::Bye && p.transaction.is_some())
            .map(|idx| requests.swap_remove(idx));
        let lingering = bye.is_some();
        st.requests.extend(bye);

        st.terminated = true;
        st.closing = lingering;
        st.bye_deferred = false;

        let handler = st.handler.take();
        let replies = std::mem::take(&mut st.replies);
        let server_tx = st.server_tx.take();
        st.invite = None;
        st.slot = RequestSlot::new();
        let call_id = st.dialog.call_id().to_string();
        drop(st);

        if let Some(socket) = socket {
            for key in requests.iter().filter_map(|p| p.transaction.as_ref()) {
                socket.registry.unbind_transaction(key);
            }
            if let Some(key) = server_tx {
                socket.registry.unbind_transaction(&key);
            }
            if !lingering {
                socket.registry.remove(&call_id, self);
            }
        }

        debug!(
            %call_id,
            replies = replies.len(),
            requests = requests.len(),
            "released session resources"
        );
        drop(replies);
        drop(requests);

        if lingering {
            info!(%call_id, %cause, "session terminated, waiting for BYE response");
        } else {
            info!(%call_id, %cause, "session terminated");
        }
        handler
    }

    /// Answer for a peer's offer: the handler's, else the current content
    pub(crate) fn answer_for(
        &self,
        handler: Option<&Arc<dyn SessionHandler>>,
        msg: &SipMessage,
    ) -> SessionResult<Option<Body>> {
        let answer = match handler {
            Some(handler) => handler.on_offer(self, msg)?,
            None => None,
        };
        Ok(answer.or_else(|| self.lock().content.clone()))
    }
}
