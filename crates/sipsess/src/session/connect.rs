//! Calling side: sending the initial INVITE and following its responses
//!
//! Provisional responses update the early dialog and are PRACKed when sent
//! reliably. A 2xx is ACKed and establishes the session; 3xx responses are
//! followed through `on_redirect`; 401/407 are answered once per challenge.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::request::PendingRequest;
use super::{Session, SessionState, StateGuard};
use crate::auth::{AuthHandler, Authenticator};
use crate::dialog::{Dialog, contact_uri};
use crate::errors::{SessionError, SessionResult};
use crate::handler::{SessionHandler, TerminationCause};
use crate::loop_state::RequestKind;
use crate::message::{Body, Header, Method, SipMessage, SipResponse};
use crate::negotiation::NegotiationState;
use crate::rel100::{REL100_TAG, Rel100Mode};
use crate::socket::{SessionSocket, SocketInner};
use crate::transport::TransactionOutcome;

/// Parameters for [`SessionSocket::connect`]
pub struct ConnectParams {
    pub to_uri: String,
    pub from_uri: String,
    /// Request-URI; defaults to `to_uri`
    pub request_uri: Option<String>,
    /// User part of our Contact
    pub local_user: String,
    pub content_type: String,
    /// Our offer, if any
    pub content: Option<Body>,
    /// Overrides the socket's default 100rel policy
    pub rel100: Option<Rel100Mode>,
    pub auth: Option<Arc<dyn AuthHandler>>,
    pub headers: Vec<Header>,
    pub handler: Arc<dyn SessionHandler>,
}

impl ConnectParams {
    pub fn new(
        to_uri: impl Into<String>,
        from_uri: impl Into<String>,
        local_user: impl Into<String>,
        handler: Arc<dyn SessionHandler>,
    ) -> Self {
        Self {
            to_uri: to_uri.into(),
            from_uri: from_uri.into(),
            request_uri: None,
            local_user: local_user.into(),
            content_type: "application/sdp".to_string(),
            content: None,
            rel100: None,
            auth: None,
            headers: Vec::new(),
            handler,
        }
    }

    pub fn with_request_uri(mut self, uri: impl Into<String>) -> Self {
        self.request_uri = Some(uri.into());
        self
    }

    pub fn with_content(mut self, content_type: impl Into<String>, content: impl Into<Body>) -> Self {
        self.content_type = content_type.into();
        self.content = Some(content.into());
        self
    }

    pub fn with_rel100(mut self, mode: Rel100Mode) -> Self {
        self.rel100 = Some(mode);
        self
    }

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
    /// Start an outgoing session by sending an INVITE
    ///
    /// The content, if any, is sent as our offer. Without content the peer
    /// is expected to offer in its 2xx and our answer goes in the ACK.
    pub fn connect(&self, params: ConnectParams) -> SessionResult<Session> {
        let ConnectParams {
            to_uri,
            from_uri,
            request_uri,
            local_user,
            content_type,
            content,
            rel100,
            auth,
            mut headers,
            handler,
        } = params;

        if to_uri.is_empty() || from_uri.is_empty() || local_user.is_empty() || content_type.is_empty() {
            return Err(SessionError::invalid_argument(
                "to, from, local user and content type are required",
            ));
        }

        let inner = &self.inner;
        let rel100 = rel100.unwrap_or(inner.config.rel100);
        let request_uri = request_uri.unwrap_or_else(|| to_uri.clone());
        let dialog = Dialog::connect(from_uri, to_uri, request_uri);
        let call_id = dialog.call_id().to_string();
        let contact = inner.config.contact_for(&local_user);

        let mut state = SessionState::new(dialog, true, contact, content_type, rel100, handler);
        state.auth = auth.map(Authenticator::new);
        state.content = content.filter(|b| !b.is_empty());

        match rel100 {
            Rel100Mode::Disabled => {}
            Rel100Mode::Supported => headers.push(Header::new("Supported", REL100_TAG)),
            Rel100Mode::Required => headers.push(Header::new("Require", REL100_TAG)),
        }
        headers.push(Header::new("Allow", inner.config.allow_header()));
        if let Some(user_agent) = &inner.config.user_agent {
            headers.push(Header::new("User-Agent", user_agent.clone()));
        }

        let session = Session::new(inner, state);
        inner.registry.insert(&call_id, session.clone());

        let result = {
            let mut st = session.lock();
            let body = st.typed(st.content.clone());
            let offer = body.is_some();
            let invite = session.build_request(&mut st, RequestKind::Invite, body, &headers);
            session.start_request(inner, &mut st, RequestKind::Invite, invite, offer, None)
        };
        if let Err(e) = result {
            warn!(%call_id, error = %e, "failed to send INVITE");
            session.shutdown(TerminationCause::Local);
            return Err(e);
        }

        info!(%call_id, "INVITE sent");
        Ok(session)
    }
}

impl Session {
    /// Provisional response to our INVITE
    pub(super) fn on_invite_provisional(
        &self,
        socket: &SocketInner,
        mut st: StateGuard<'_>,
        invite_cseq: u32,
        response: &SipResponse,
    ) {
        if response.status <= 100 {
            return;
        }
        let call_id = st.dialog.call_id().to_string();
        st.dialog.update_from_response(response);

        let reliable = response.has_token("Require", REL100_TAG);
        let mut answered = false;
        let mut remote_offer = false;

        if reliable {
            let Some(rseq) = response.rseq() else {
                warn!(%call_id, status = response.status, "reliable provisional response without RSeq");
                return;
            };
            if !st.rel.accept_remote_rseq(rseq) {
                debug!(%call_id, rseq, "retransmitted reliable provisional response");
                return;
            }
            if response.has_body() {
                match st.neg {
                    NegotiationState::LocalOffer => {
                        st.neg.receive_answer().ok();
                        st.exchange_done = true;
                        answered = true;
                    }
                    NegotiationState::Idle if !st.exchange_done => {
                        st.neg.receive_offer().ok();
                        remote_offer = true;
                    }
                    _ => {}
                }
            }
        }

        let handler = st.handler.clone();
        drop(st);

        let msg = SipMessage::from(response.clone());
        if answered {
            if let Some(handler) = &handler {
                handler.on_answer(self, &msg);
            }
        }

        if let Some(rseq) = response.rseq().filter(|_| reliable) {
            let answer = if remote_offer {
                match self.answer_for(handler.as_ref(), &msg) {
                    Ok(answer) => answer,
                    Err(e) => {
                        warn!(%call_id, error = %e, "offer in provisional response refused");
                        None
                    }
                }
            } else {
                None
            };
            let mut st = self.lock();
            if st.terminated {
                return;
            }
            if remote_offer {
                if answer.is_some() {
                    st.neg.send_answer().ok();
                    st.exchange_done = true;
                } else {
                    st.neg.decline_offer();
                }
            }
            let rack = format!("{} {} {}", rseq, invite_cseq, Method::Invite);
            let body = st.typed(answer);
            let prack = self.build_request(&mut st, RequestKind::Prack, body, &[Header::new("RAck", rack)]);
            if let Err(e) = self.start_request(socket, &mut st, RequestKind::Prack, prack, false, None) {
                warn!(%call_id, rseq, error = %e, "failed to send PRACK");
            }
        }

        debug!(%call_id, status = response.status, reliable, "INVITE progress");
        if let Some(handler) = handler {
            handler.on_progress(self, response);
        }
    }

    /// Final response (or failure) for our INVITE
    pub(super) fn on_invite_final(
        &self,
        socket: &SocketInner,
        mut st: StateGuard<'_>,
        mut pending: PendingRequest,
        outcome: TransactionOutcome,
    ) {
        let call_id = st.dialog.call_id().to_string();

        if st.closing {
            if let Some(response) = outcome.response().filter(|r| r.is_success()) {
                debug!(%call_id, "2xx after CANCEL, hanging up");
                st.dialog.update_from_response(response);
                if let Err(e) = self.send_ack(socket, &mut st, pending.request.cseq.seq, None) {
                    warn!(%call_id, error = %e, "failed to ACK");
                }
                if let Err(e) = self.send_bye(socket, &mut st) {
                    warn!(%call_id, error = %e, "failed to send BYE");
                }
            }
            drop(st);
            self.shutdown(TerminationCause::Local);
            return;
        }

        let response = match &outcome {
            TransactionOutcome::Response(response) => response.clone(),
            TransactionOutcome::Timeout => {
                drop(st);
                self.terminate(TerminationCause::Timeout, None);
                return;
            }
            TransactionOutcome::Failed(e) => {
                let cause = TerminationCause::Transport(e.clone());
                drop(st);
                self.terminate(cause, None);
                return;
            }
        };

        match response.status {
            200..=299 => self.on_invite_success(socket, st, pending, response),
            300..=399 => {
                let contact = response.contact.clone().filter(|_| {
                    !pending.loop_state.request_loops(response.status)
                });
                let Some(contact) = contact else {
                    drop(st);
                    let msg = SipMessage::from(response.clone());
                    self.terminate(TerminationCause::Redirected(response.status), Some(&msg));
                    return;
                };
                let handler = st.handler.clone();
                drop(st);
                if let Some(handler) = &handler {
                    handler.on_redirect(self, &response, &contact);
                }

                let mut st = self.lock();
                if st.terminated {
                    return;
                }
                let target = contact_uri(&contact);
                info!(%call_id, %target, status = response.status, "following redirect");
                st.dialog.retarget(target.clone());
                pending.request.uri = target;
                pending.request.to.tag = None;
                pending.request.route.clear();
                st.rel = Default::default();
                match self.resend(socket, &mut st, &mut pending) {
                    Ok(()) => st.requests.push(pending),
                    Err(e) => {
                        drop(st);
                        let msg = SipMessage::from(response.clone());
                        self.terminate(TerminationCause::Transport(e.to_string()), Some(&msg));
                    }
                }
            }
            401 | 407 => {
                let outcome = TransactionOutcome::Response(response.clone());
                match self.retry_challenge(socket, &mut st, &mut pending, &outcome) {
                    Ok(()) => st.requests.push(pending),
                    Err(e) => {
                        drop(st);
                        let msg = SipMessage::from(response);
                        self.terminate(TerminationCause::Authentication(e.to_string()), Some(&msg));
                    }
                }
            }
            status => {
                drop(st);
                info!(%call_id, status, "INVITE rejected");
                let msg = SipMessage::from(response);
                self.terminate(TerminationCause::Rejected(status), Some(&msg));
            }
        }
    }

    fn on_invite_success(
        &self,
        socket: &SocketInner,
        mut st: StateGuard<'_>,
        pending: PendingRequest,
        response: SipResponse,
    ) {
        let call_id = st.dialog.call_id().to_string();
        let cseq = pending.request.cseq.seq;
        st.dialog.update_from_response(&response);

        let mut answered = false;
        let mut remote_offer = false;
        match st.neg {
            NegotiationState::LocalOffer if response.has_body() => {
                st.neg.receive_answer().ok();
                st.exchange_done = true;
                answered = true;
            }
            NegotiationState::LocalOffer => {
                warn!(%call_id, "2xx carries no answer to our offer");
                if let Err(e) = self.send_ack(socket, &mut st, cseq, None) {
                    warn!(%call_id, error = %e, "failed to ACK");
                }
                if let Err(e) = self.send_bye(socket, &mut st) {
                    warn!(%call_id, error = %e, "failed to send BYE");
                }
                drop(st);
                let msg = SipMessage::from(response);
                self.terminate(TerminationCause::Protocol("2xx without answer".into()), Some(&msg));
                return;
            }
            NegotiationState::Idle if response.has_body() && !st.exchange_done => {
                st.neg.receive_offer().ok();
                remote_offer = true;
            }
            _ => {}
        }
        let handler = st.handler.clone();
        drop(st);

        let msg = SipMessage::from(response);
        let answer = if remote_offer {
            match self.answer_for(handler.as_ref(), &msg) {
                Ok(answer) => answer,
                Err(e) => {
                    warn!(%call_id, error = %e, "offer in 2xx refused");
                    None
                }
            }
        } else {
            None
        };

        let mut st = self.lock();
        if st.terminated {
            return;
        }
        if remote_offer {
            if answer.is_some() {
                st.neg.send_answer().ok();
                st.exchange_done = true;
            } else {
                st.neg.decline_offer();
            }
        }
        let body = st.typed(answer);
        if let Err(e) = self.send_ack(socket, &mut st, cseq, body) {
            warn!(%call_id, error = %e, "failed to ACK 2xx");
        }
        st.established = true;
        drop(st);

        info!(%call_id, "session established");
        if let Some(handler) = handler {
            if answered {
                handler.on_answer(self, &msg);
            }
            handler.on_establish(self, &msg);
        }
    }
}
