//! Answering side: accepting an incoming INVITE and answering it

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Session, SessionState};
use crate::auth::{AuthHandler, Authenticator};
use crate::dialog::Dialog;
use crate::errors::{Conflict, SessionError, SessionResult};
use crate::handler::{SessionHandler, TerminationCause};
use crate::message::{Body, Header, Method, SipMessage, SipRequest, reason_phrase};
use crate::rel100::{Rel100Mode, Reliability};
use crate::socket::SessionSocket;

/// Parameters for [`SessionSocket::accept`]
pub struct AcceptParams {
    pub request: SipRequest,
    /// First response: a provisional (101-199) or a 2xx
    pub status: u16,
    pub reason: String,
    /// User part of our Contact
    pub local_user: String,
    pub content_type: String,
    /// Local content; answer to the INVITE's offer or our own offer
    pub content: Option<Body>,
    /// Overrides the socket's default 100rel policy
    pub rel100: Option<Rel100Mode>,
    pub auth: Option<Arc<dyn AuthHandler>>,
    pub headers: Vec<Header>,
    pub handler: Arc<dyn SessionHandler>,
}

impl AcceptParams {
    pub fn new(
        request: SipRequest,
        status: u16,
        reason: impl Into<String>,
        local_user: impl Into<String>,
        handler: Arc<dyn SessionHandler>,
    ) -> Self {
        Self {
            request,
            status,
            reason: reason.into(),
            local_user: local_user.into(),
            content_type: "application/sdp".to_string(),
            content: None,
            rel100: None,
            auth: None,
            headers: Vec::new(),
            handler,
        }
    }

    pub fn with_rel100(mut self, mode: Rel100Mode) -> Self {
        self.rel100 = Some(mode);
        self
    }

    pub fn with_content(mut self, content_type: impl Into<String>, content: impl Into<Body>) -> Self {
        self.content_type = content_type.into();
        self.content = Some(content.into());
        self
    }

    /// Credentials for challenges to requests we send in this dialog
    pub fn with_auth(mut self, auth: Arc<dyn AuthHandler>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }
}

impl SessionSocket {
    /// Create a session for an incoming INVITE and send the first response
    ///
    /// With a provisional `status` the INVITE stays pending until
    /// [`Session::answer`] or [`Session::reject`]; with a 2xx the session is
    /// answered immediately and establishes when the ACK arrives.
    pub fn accept(&self, params: AcceptParams) -> SessionResult<Session> {
        let AcceptParams {
            request,
            status,
            reason,
            local_user,
            content_type,
            content,
            rel100,
            auth,
            headers,
            handler,
        } = params;

        if !(101..=299).contains(&status) {
            return Err(SessionError::invalid_argument(format!(
                "cannot accept with status {}",
                status
            )));
        }
        if local_user.is_empty() || content_type.is_empty() {
            return Err(SessionError::invalid_argument("local user and content type are required"));
        }
        if request.method != Method::Invite {
            return Err(SessionError::invalid_argument(format!("cannot accept {}", request.method)));
        }

        let inner = &self.inner;
        let rel100 = rel100.unwrap_or(inner.config.rel100);
        let rel = Reliability::for_request(&request);
        rel.check_mode(rel100)?;

        if inner.registry.find_initial(&request).is_some() {
            return Err(SessionError::invalid_argument(format!(
                "INVITE {} already accepted",
                request.call_id
            )));
        }

        let dialog = Dialog::accept(&request)?;
        let contact = inner.config.contact_for(&local_user);
        let mut state = SessionState::new(dialog, false, contact, content_type, rel100, handler);
        state.rel = rel;
        state.auth = auth.map(Authenticator::new);
        state.content = content.filter(|b| !b.is_empty());
        if request.has_body() {
            state.neg.receive_offer()?;
        }

        let transaction = inner.transport.start_server_transaction(&request)?;
        let session = Session::new(inner, state);
        inner.registry.insert(&request.call_id, session.clone());
        inner.registry.bind_transaction(transaction.clone(), session.downgrade());

        let result = {
            let mut st = session.lock();
            st.invite = Some(request.clone());
            st.server_tx = Some(transaction);
            if status < 200 {
                let content = st.content.clone();
                session.reply_1xx(inner, &mut st, status, &reason, rel100, content, &headers)
            } else {
                session.reply_2xx(inner, &mut st, status, &reason, None, &headers)
            }
        };
        if let Err(e) = result {
            warn!(call_id = %request.call_id, error = %e, "failed to accept INVITE");
            session.shutdown(TerminationCause::Local);
            return Err(e);
        }

        info!(call_id = %request.call_id, status, offer = request.has_body(), "accepted INVITE");
        Ok(session)
    }
}

impl Session {
    /// Send a provisional response to the pending INVITE
    ///
    /// `rel100` decides reliability for this response. Content on a
    /// reliable response is the answer to the INVITE's offer, or our offer
    /// when the INVITE had none.
    pub fn progress(
        &self,
        status: u16,
        reason: &str,
        rel100: Rel100Mode,
        content: Option<Body>,
        headers: &[Header],
    ) -> SessionResult<()> {
        if !(101..=199).contains(&status) {
            return Err(SessionError::invalid_argument(format!("{} is not a provisional status", status)));
        }
        let socket = self.socket()?;
        let mut st = self.lock_live()?;
        self.reply_1xx(&socket, &mut st, status, reason, rel100, content, headers)
    }

    /// Answer the pending INVITE with a 2xx
    ///
    /// Without `content` the session's current content is used. Fails
    /// while a reliable provisional response awaits its PRACK.
    pub fn answer(&self, status: u16, reason: &str, content: Option<Body>, headers: &[Header]) -> SessionResult<()> {
        if !(200..=299).contains(&status) {
            return Err(SessionError::invalid_argument(format!("{} is not a success status", status)));
        }
        let socket = self.socket()?;
        let mut st = self.lock_live()?;
        self.reply_2xx(&socket, &mut st, status, reason, content, headers)
    }

    /// Reject the pending INVITE
    ///
    /// Rejecting the initial INVITE terminates the session without calling
    /// `on_close`; rejecting a re-INVITE leaves it established.
    pub fn reject(&self, status: u16, reason: &str, headers: &[Header]) -> SessionResult<()> {
        if status < 300 {
            return Err(SessionError::invalid_argument(format!("{} is not a failure status", status)));
        }
        let socket = self.socket()?;
        let mut st = self.lock_live()?;
        if st.invite.is_none() {
            return Err(SessionError::protocol_conflict(Conflict::AlreadyAnswered));
        }
        let initial = self.reply_failure(&socket, &mut st, status, reason, headers)?;
        drop(st);
        if initial {
            self.shutdown(TerminationCause::Local);
        }
        Ok(())
    }

    /// CANCEL for the INVITE we have not answered yet
    pub(crate) fn handle_cancel(&self, cancel: &SipRequest) {
        let Ok(socket) = self.socket() else { return };
        let mut st = self.lock();
        if st.terminated || st.invite.is_none() {
            debug!(call_id = %cancel.call_id, "CANCEL after final response, ignored");
            return;
        }
        let initial = !st.dialog.is_confirmed();
        if let Err(e) = self.reply_failure(&socket, &mut st, 487, reason_phrase(487), &[]) {
            warn!(call_id = %cancel.call_id, error = %e, "failed to answer cancelled INVITE");
        }
        if !initial {
            // a cancelled re-INVITE leaves the session as it was
            return;
        }
        st.peerterm = true;
        drop(st);

        info!(call_id = %cancel.call_id, "INVITE cancelled by peer");
        if let Some(handler) = self.shutdown(TerminationCause::ConnectionReset) {
            let msg = SipMessage::from(cancel.clone());
            handler.on_cancel(self, cancel);
            handler.on_close(self, &TerminationCause::ConnectionReset, Some(&msg));
        }
    }
}
