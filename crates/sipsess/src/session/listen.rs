//! Requests received within an existing dialog

use tracing::{debug, info, warn};

use super::{Session, SessionState};
use crate::handler::{Reply, TerminationCause};
use crate::loop_state::RequestKind;
use crate::message::{Method, SipMessage, SipRequest, reason_phrase};
use crate::negotiation::NegotiationState;
use crate::socket::SocketInner;

/// Seconds a peer is told to wait before retrying a re-INVITE we cannot
/// take yet (RFC 3261 §14.2)
const RETRY_AFTER_MAX: u32 = 10;

impl Session {
    /// Dispatch an in-dialog request to its handler
    pub(crate) fn handle_request(&self, socket: &SocketInner, request: &SipRequest) {
        {
            let mut st = self.lock();
            if st.terminated {
                let closing = st.closing;
                drop(st);
                match request.method {
                    Method::Ack => {}
                    Method::Bye => {
                        socket.reply_status(request, 200, reason_phrase(200));
                        if closing {
                            self.shutdown(TerminationCause::PeerBye);
                        }
                    }
                    _ => socket.reply_status(request, 481, reason_phrase(481)),
                }
                return;
            }
            if !st.dialog.check_remote_cseq(request) {
                warn!(call_id = %request.call_id, cseq = request.cseq.seq, "out-of-order request");
                drop(st);
                socket.reply_status(request, 500, reason_phrase(500));
                return;
            }
        }

        match request.method {
            Method::Invite => self.handle_reinvite(socket, request),
            Method::Update => self.handle_update(socket, request),
            Method::Ack => self.handle_ack(socket, request),
            Method::Prack => self.handle_prack(socket, request),
            Method::Bye => self.handle_bye(socket, request),
            Method::Info | Method::Refer => self.handle_app_request(socket, request),
            method => {
                debug!(call_id = %request.call_id, %method, "method not allowed in dialog");
                let response = socket
                    .response(request, 405, reason_phrase(405))
                    .with_header("Allow", socket.config.allow_header());
                if let Err(e) = socket.reply(request, response) {
                    warn!(call_id = %request.call_id, error = %e, "failed to reply 405");
                }
            }
        }
    }

    /// 500 with Retry-After, or 491, when a request collides with ours
    fn refuse_overlap(&self, socket: &SocketInner, st: &SessionState, request: &SipRequest) -> bool {
        let ours_pending = st.neg == NegotiationState::LocalOffer
            || matches!(st.slot.outstanding(), Some(RequestKind::Reinvite | RequestKind::Update));
        if (request.method == Method::Invite && st.invite.is_some()) || st.neg == NegotiationState::RemoteOffer {
            let retry_after = rand::random::<u32>() % (RETRY_AFTER_MAX + 1);
            debug!(call_id = %request.call_id, method = %request.method, "request overlaps one we are answering");
            let response = socket
                .response(request, 500, reason_phrase(500))
                .with_header("Retry-After", retry_after.to_string());
            if let Err(e) = socket.reply(request, response) {
                warn!(call_id = %request.call_id, error = %e, "failed to reply 500");
            }
            return true;
        }
        if ours_pending && (request.method == Method::Invite || request.has_body()) {
            info!(call_id = %request.call_id, method = %request.method, "glare, replying 491");
            socket.reply_status(request, 491, reason_phrase(491));
            return true;
        }
        false
    }

    fn handle_reinvite(&self, socket: &SocketInner, request: &SipRequest) {
        let mut st = self.lock();
        if self.refuse_overlap(socket, &st, request) {
            return;
        }

        let transaction = match socket.transport.start_server_transaction(request) {
            Ok(key) => key,
            Err(e) => {
                warn!(call_id = %request.call_id, error = %e, "no transaction for re-INVITE");
                return;
            }
        };
        socket.registry.bind_transaction(transaction.clone(), self.downgrade());
        st.dialog.refresh_target(request.contact.as_deref());
        st.invite = Some(request.clone());
        st.server_tx = Some(transaction);
        st.exchange_done = false;

        if !request.has_body() {
            // we offer in the 2xx, the peer answers in the ACK
            if let Err(e) = self.reply_2xx(socket, &mut st, 200, reason_phrase(200), None, &[]) {
                warn!(call_id = %request.call_id, error = %e, "failed to answer re-INVITE");
                self.reject_reinvite(socket, &mut st, 500);
            }
            return;
        }

        if let Err(e) = st.neg.receive_offer() {
            debug!(call_id = %request.call_id, error = %e, "re-INVITE offer refused");
            self.reject_reinvite(socket, &mut st, 491);
            return;
        }
        let handler = st.handler.clone();
        drop(st);

        let msg = SipMessage::from(request.clone());
        let answer = self.answer_for(handler.as_ref(), &msg);

        let mut st = self.lock();
        if st.terminated || st.invite.is_none() {
            return;
        }
        match answer {
            Ok(Some(answer)) => {
                if let Err(e) = self.reply_2xx(socket, &mut st, 200, reason_phrase(200), Some(answer), &[]) {
                    warn!(call_id = %request.call_id, error = %e, "failed to answer re-INVITE");
                    self.reject_reinvite(socket, &mut st, 500);
                }
            }
            Ok(None) => self.reject_reinvite(socket, &mut st, 488),
            Err(e) => {
                debug!(call_id = %request.call_id, error = %e, "re-INVITE offer rejected");
                self.reject_reinvite(socket, &mut st, 488);
            }
        }
    }

    fn handle_update(&self, socket: &SocketInner, request: &SipRequest) {
        let mut st = self.lock();
        if request.has_body() && self.refuse_overlap(socket, &st, request) {
            return;
        }
        st.dialog.refresh_target(request.contact.as_deref());
        let contact = st.contact.clone();
        let content_type = st.content_type.clone();

        if !request.has_body() {
            drop(st);
            let response = socket.response(request, 200, reason_phrase(200)).with_contact(contact);
            if let Err(e) = socket.reply(request, response) {
                warn!(call_id = %request.call_id, error = %e, "failed to answer UPDATE");
            }
            return;
        }

        if let Err(e) = st.neg.receive_offer() {
            debug!(call_id = %request.call_id, error = %e, "UPDATE offer refused");
            drop(st);
            socket.reply_status(request, 491, reason_phrase(491));
            return;
        }
        let handler = st.handler.clone();
        drop(st);

        let msg = SipMessage::from(request.clone());
        match self.answer_for(handler.as_ref(), &msg) {
            Ok(Some(answer)) => {
                let response = socket
                    .response(request, 200, reason_phrase(200))
                    .with_contact(contact)
                    .with_body(content_type, answer.clone());
                match socket.reply(request, response) {
                    Ok(()) => {
                        let mut st = self.lock();
                        st.neg.send_answer().ok();
                        st.content = Some(answer);
                        debug!(call_id = %request.call_id, "UPDATE answered");
                    }
                    Err(e) => {
                        warn!(call_id = %request.call_id, error = %e, "failed to answer UPDATE");
                        self.lock().neg.decline_offer();
                    }
                }
            }
            result => {
                if let Err(e) = result {
                    debug!(call_id = %request.call_id, error = %e, "UPDATE offer rejected");
                }
                self.lock().neg.decline_offer();
                socket.reply_status(request, 488, reason_phrase(488));
            }
        }
    }

    fn handle_bye(&self, socket: &SocketInner, request: &SipRequest) {
        let mut st = self.lock();
        if st.invite.is_some() {
            if let Err(e) = self.reply_failure(socket, &mut st, 487, reason_phrase(487), &[]) {
                debug!(call_id = %request.call_id, error = %e, "could not terminate pending INVITE");
            }
        }
        st.peerterm = true;
        drop(st);

        socket.reply_status(request, 200, reason_phrase(200));
        info!(call_id = %request.call_id, "peer hung up");
        let msg = SipMessage::from(request.clone());
        self.terminate(TerminationCause::PeerBye, Some(&msg));
    }

    /// INFO and REFER go to the application, which picks the response
    fn handle_app_request(&self, socket: &SocketInner, request: &SipRequest) {
        let handler = self.lock().handler.clone();
        let reply = match &handler {
            Some(handler) if request.method == Method::Info => handler.on_info(self, request),
            Some(handler) => handler.on_refer(self, request),
            None => Reply::new(481, reason_phrase(481)),
        };

        let mut response = socket.response(request, reply.status, &reply.reason);
        response.headers.extend(reply.headers);
        if let Some((content_type, body)) = reply.content {
            response = response.with_body(content_type, body);
        }
        debug!(call_id = %request.call_id, method = %request.method, status = response.status, "replied to request");
        if let Err(e) = socket.reply(request, response) {
            warn!(call_id = %request.call_id, error = %e, "failed to reply");
        }
    }
}
