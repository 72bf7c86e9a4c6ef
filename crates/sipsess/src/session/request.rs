//! Session-initiated requests
//!
//! re-INVITE, UPDATE, INFO, PRACK, BYE and the initial INVITE of a UAC
//! session are tracked as [`PendingRequest`]s until their final response.
//! re-INVITE, UPDATE and BYE must not overlap (RFC 3261 §14.1): they hold the session's
//! [`RequestSlot`](crate::loop_state::RequestSlot) while in flight. A 491
//! releases the slot and schedules one retry after the glare back-off.

use tracing::{debug, info, warn};

use super::{Session, SessionState, StateGuard};
use crate::errors::{Conflict, SessionError, SessionResult};
use crate::handler::TerminationCause;
use crate::loop_state::{LoopState, RequestKind, RequestSlot};
use crate::message::{Body, CSeq, Header, SipMessage, SipRequest};
use crate::negotiation::NegotiationState;
use crate::socket::SocketInner;
use crate::timer::{TimerHandle, TimerId, TimerTarget};
use crate::transport::{TransactionKey, TransactionOutcome};

/// Completion callback for a session-initiated request
pub type ResponseCallback = Box<dyn FnOnce(&Session, &TransactionOutcome) + Send>;

/// A request waiting for its final response
pub(crate) struct PendingRequest {
    pub kind: RequestKind,
    /// `None` while waiting out a glare back-off
    pub transaction: Option<TransactionKey>,
    pub request: SipRequest,
    pub loop_state: LoopState,
    /// The request carries our offer
    pub offer: bool,
    pub callback: Option<ResponseCallback>,
    pub timer: Option<TimerHandle>,
    /// Response that triggered the current back-off
    pub deferred: Option<TransactionOutcome>,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("kind", &self.kind)
            .field("transaction", &self.transaction)
            .field("cseq", &self.request.cseq)
            .field("offer", &self.offer)
            .finish()
    }
}

impl Session {
    /// Build a request within the dialog
    pub(super) fn build_request(
        &self,
        st: &mut SessionState,
        kind: RequestKind,
        body: Option<(String, Body)>,
        headers: &[Header],
    ) -> SipRequest {
        let mut request = st.dialog.request(kind.method()).with_contact(st.contact.clone());
        request.headers.extend_from_slice(headers);
        if let Some((content_type, body)) = body {
            request = request.with_body(content_type, body);
        }
        request
    }

    /// Send `request` and track it until its final response
    ///
    /// Takes the request slot for exclusive kinds and moves negotiation to
    /// local-offer when `offer` is set; both are rolled back on failure.
    pub(super) fn start_request(
        &self,
        socket: &SocketInner,
        st: &mut SessionState,
        kind: RequestKind,
        request: SipRequest,
        offer: bool,
        callback: Option<ResponseCallback>,
    ) -> SessionResult<()> {
        if kind.is_exclusive() {
            st.slot.try_acquire(kind)?;
        }
        if offer {
            if let Err(e) = st.neg.send_offer() {
                st.slot.release(kind);
                return Err(e);
            }
        }

        let mut pending = PendingRequest {
            kind,
            transaction: None,
            request,
            loop_state: LoopState::new(),
            offer,
            callback,
            timer: None,
            deferred: None,
        };
        if let Err(e) = self.transmit(socket, st, &mut pending) {
            st.slot.release(kind);
            if offer {
                st.neg.withdraw_offer();
            }
            return Err(e);
        }

        debug!(
            call_id = %st.dialog.call_id(),
            request = %kind,
            cseq = pending.request.cseq.seq,
            negotiation = %st.neg,
            "request sent"
        );
        st.requests.push(pending);
        Ok(())
    }

    /// Put `pending` on the wire on a new client transaction
    fn transmit(
        &self,
        socket: &SocketInner,
        st: &mut SessionState,
        pending: &mut PendingRequest,
    ) -> SessionResult<()> {
        if let Some(auth) = st.auth.as_mut() {
            auth.authorize(&mut pending.request);
        }
        let key = socket.transport.send_request(pending.request.clone())?;
        socket.registry.bind_transaction(key.clone(), self.downgrade());
        pending.transaction = Some(key);
        pending.timer = Some(
            socket
                .timers
                .schedule(socket.config.transaction_timeout(), TimerTarget::Request(self.downgrade())),
        );
        Ok(())
    }

    /// Send `pending` again with a fresh CSeq (challenge, redirect, glare)
    pub(super) fn resend(
        &self,
        socket: &SocketInner,
        st: &mut SessionState,
        pending: &mut PendingRequest,
    ) -> SessionResult<()> {
        let method = pending.request.method;
        pending.request.cseq = CSeq::new(st.dialog.next_cseq(), method);
        pending.deferred = None;
        self.transmit(socket, st, pending)?;
        debug!(
            call_id = %st.dialog.call_id(),
            request = %pending.kind,
            cseq = pending.request.cseq.seq,
            "request re-sent"
        );
        Ok(())
    }

    /// Answer a 401/407 and re-send the request once
    pub(super) fn retry_challenge(
        &self,
        socket: &SocketInner,
        st: &mut SessionState,
        pending: &mut PendingRequest,
        outcome: &TransactionOutcome,
    ) -> SessionResult<()> {
        let Some(response) = outcome.response() else {
            return Err(SessionError::invalid_argument("no challenge to answer"));
        };
        if pending.loop_state.request_loops(response.status) {
            return Err(SessionError::authentication("challenge loop"));
        }
        let auth = st
            .auth
            .as_mut()
            .ok_or_else(|| SessionError::authentication("no credentials for challenge"))?;
        auth.on_challenge(response)?;
        self.resend(socket, st, pending)
    }

    /// BYE within the dialog, tracked until its final response
    ///
    /// Callers shut the session down right after. The session stays
    /// registered while the BYE is outstanding so a challenge to it is
    /// answered.
    pub(super) fn send_bye(&self, socket: &SocketInner, st: &mut SessionState) -> SessionResult<()> {
        // teardown overrides a modification still in flight
        st.slot = RequestSlot::new();
        let headers = st.close_headers.clone();
        let bye = self.build_request(st, RequestKind::Bye, None, &headers);
        self.start_request(socket, st, RequestKind::Bye, bye, false, None)?;
        info!(call_id = %st.dialog.call_id(), "sent BYE");
        Ok(())
    }

    /// Send a re-INVITE; `content` becomes our offer
    ///
    /// Without content the peer is expected to offer in its 2xx and our
    /// answer goes in the ACK.
    pub fn reinvite(&self, content: Option<Body>) -> SessionResult<()> {
        let socket = self.socket()?;
        let mut st = self.lock_live()?;
        if !st.established {
            return Err(SessionError::protocol_conflict(Conflict::NotEstablished));
        }
        if st.invite.is_some() {
            return Err(SessionError::protocol_conflict(Conflict::RequestPending(RequestKind::Reinvite)));
        }
        self.send_modification(&socket, &mut st, RequestKind::Reinvite, content)
    }

    /// Send an UPDATE (RFC 3311), usable in early and confirmed dialogs
    pub fn update(&self, content: Option<Body>) -> SessionResult<()> {
        let socket = self.socket()?;
        let mut st = self.lock_live()?;
        if st.dialog.remote_tag().is_none() {
            return Err(SessionError::protocol_conflict(Conflict::NotEstablished));
        }
        self.send_modification(&socket, &mut st, RequestKind::Update, content)
    }

    /// Offer new content: re-INVITE once established, UPDATE while early
    pub fn modify(&self, content: impl Into<Body>) -> SessionResult<()> {
        let content = Some(content.into());
        if self.is_established() {
            self.reinvite(content)
        } else {
            self.update(content)
        }
    }

    fn send_modification(
        &self,
        socket: &SocketInner,
        st: &mut SessionState,
        kind: RequestKind,
        content: Option<Body>,
    ) -> SessionResult<()> {
        let content = content.filter(|b| !b.is_empty());
        let offer = content.is_some();
        if offer && st.neg != NegotiationState::Idle {
            return Err(SessionError::protocol_conflict(Conflict::OfferOutstanding));
        }
        if let Some(current) = st.slot.outstanding() {
            return Err(SessionError::protocol_conflict(Conflict::RequestPending(current)));
        }

        let body = st.typed(content.clone());
        let request = self.build_request(st, kind, body, &[]);
        self.start_request(socket, st, kind, request, offer, None)?;
        if let Some(content) = content {
            st.content = Some(content);
        }
        Ok(())
    }

    /// Send INFO; `callback` receives the final outcome
    pub fn info<F>(&self, content_type: &str, body: impl Into<Body>, callback: F) -> SessionResult<()>
    where
        F: FnOnce(&Session, &TransactionOutcome) + Send + 'static,
    {
        if content_type.is_empty() {
            return Err(SessionError::invalid_argument("INFO requires a content type"));
        }
        let socket = self.socket()?;
        let mut st = self.lock_live()?;
        if st.dialog.remote_tag().is_none() {
            return Err(SessionError::protocol_conflict(Conflict::NotEstablished));
        }
        let request =
            self.build_request(&mut st, RequestKind::Info, Some((content_type.to_string(), body.into())), &[]);
        self.start_request(&socket, &mut st, RequestKind::Info, request, false, Some(Box::new(callback)))
    }

    /// Extra headers for the BYE sent when the session is closed
    pub fn set_close_headers(&self, headers: Vec<Header>) {
        self.lock().close_headers = headers;
    }

    /// Send BYE and terminate
    ///
    /// The session is inert from here on, but stays registered until the
    /// BYE gets its final response. Fails while a re-INVITE or UPDATE is in
    /// flight; [`Session::close`] defers the BYE instead.
    pub fn bye(&self) -> SessionResult<()> {
        let socket = self.socket()?;
        let mut st = self.lock_live()?;
        if !st.dialog.is_confirmed() {
            return Err(SessionError::protocol_conflict(Conflict::NotEstablished));
        }
        if let Some(current) = st.slot.outstanding() {
            return Err(SessionError::protocol_conflict(Conflict::RequestPending(current)));
        }
        self.send_bye(&socket, &mut st)?;
        drop(st);
        self.shutdown(TerminationCause::Local);
        Ok(())
    }

    /// Hang up without reporting back through `on_close`
    ///
    /// Rejects an unanswered incoming INVITE with 486, CANCELs our pending
    /// INVITE, or sends BYE (after any in-flight re-INVITE/UPDATE completes).
    pub fn close(&self) {
        let Ok(socket) = self.socket() else { return };
        let mut st = self.lock();
        if st.terminated {
            return;
        }
        st.handler = None;
        let call_id = st.dialog.call_id().to_string();

        if !st.owner && !st.dialog.is_confirmed() && st.invite.is_some() {
            if let Err(e) = self.reply_failure(&socket, &mut st, 486, "Busy Here", &[]) {
                warn!(%call_id, error = %e, "failed to reject INVITE on close");
            }
            drop(st);
            self.shutdown(TerminationCause::Local);
            return;
        }

        let pending_invite = st
            .requests
            .iter()
            .find(|p| p.kind == RequestKind::Invite)
            .and_then(|p| p.transaction.clone());
        if let Some(key) = pending_invite {
            if let Err(e) = socket.transport.cancel(&key) {
                warn!(%call_id, error = %e, "failed to CANCEL INVITE");
            }
            info!(%call_id, "INVITE cancelled, waiting for final response");
            st.terminated = true;
            st.closing = true;
            return;
        }

        if st.dialog.is_confirmed() {
            if matches!(st.slot.outstanding(), Some(RequestKind::Reinvite | RequestKind::Update)) {
                info!(%call_id, "BYE deferred until pending request completes");
                st.bye_deferred = true;
                st.terminated = true;
                st.closing = true;
                return;
            }
            if let Err(e) = self.send_bye(&socket, &mut st) {
                warn!(%call_id, error = %e, "failed to send BYE on close");
            }
        }
        drop(st);
        self.shutdown(TerminationCause::Local);
    }

    /// Progress or completion of one of our client transactions
    pub(crate) fn handle_outcome(&self, key: &TransactionKey, outcome: TransactionOutcome) {
        let Ok(socket) = self.socket() else { return };
        let mut st = self.lock();
        let Some(idx) = st.requests.iter().position(|p| p.transaction.as_ref() == Some(key)) else {
            debug!(transaction = %key, "response for unknown request");
            return;
        };

        if !outcome.is_final() {
            let kind = st.requests[idx].kind;
            if let (RequestKind::Invite, Some(response)) = (kind, outcome.response()) {
                if !st.closing {
                    let cseq = st.requests[idx].request.cseq.seq;
                    self.on_invite_provisional(&socket, st, cseq, response);
                }
            }
            return;
        }

        let pending = st.requests.remove(idx);
        socket.registry.unbind_transaction(key);
        match pending.kind {
            RequestKind::Invite => self.on_invite_final(&socket, st, pending, outcome),
            _ => self.on_request_final(&socket, st, pending, outcome),
        }
    }

    fn on_request_final(
        &self,
        socket: &SocketInner,
        mut st: StateGuard<'_>,
        mut pending: PendingRequest,
        outcome: TransactionOutcome,
    ) {
        let call_id = st.dialog.call_id().to_string();
        let status = outcome.status();

        if matches!(status, Some(401 | 407)) && (!st.closing || pending.kind == RequestKind::Bye) {
            match self.retry_challenge(socket, &mut st, &mut pending, &outcome) {
                Ok(()) => {
                    st.requests.push(pending);
                    return;
                }
                Err(e) => debug!(%call_id, error = %e, "challenge not answered"),
            }
        }

        if status == Some(491)
            && matches!(pending.kind, RequestKind::Reinvite | RequestKind::Update)
            && !st.closing
            && !pending.loop_state.request_loops(491)
        {
            st.slot.release(pending.kind);
            if pending.offer {
                st.neg.withdraw_offer();
            }
            let delay = socket.config.glare_delay(st.owner);
            info!(%call_id, request = %pending.kind, ?delay, "request pending at peer, retrying later");
            pending.transaction = None;
            pending.timer = Some(socket.timers.schedule(delay, TimerTarget::Glare(self.downgrade())));
            pending.deferred = Some(outcome);
            st.requests.push(pending);
            return;
        }

        st.slot.release(pending.kind);
        self.complete_request(socket, st, pending, outcome);
    }

    /// Report the final outcome of a request that no longer holds the slot
    fn complete_request(
        &self,
        socket: &SocketInner,
        mut st: StateGuard<'_>,
        pending: PendingRequest,
        outcome: TransactionOutcome,
    ) {
        let call_id = st.dialog.call_id().to_string();
        let kind = pending.kind;

        let mut answered = false;
        let mut remote_offer = false;
        let mut end = None;

        match outcome.response() {
            Some(response) if response.is_success() => {
                if matches!(kind, RequestKind::Reinvite | RequestKind::Update) {
                    st.dialog.refresh_target(response.contact.as_deref());
                }
                if pending.offer {
                    if response.has_body() {
                        st.neg.receive_answer().ok();
                        st.exchange_done = true;
                        answered = true;
                    } else {
                        warn!(%call_id, request = %kind, "2xx carries no answer to our offer");
                        st.neg.withdraw_offer();
                    }
                } else if kind == RequestKind::Reinvite && response.has_body() && st.neg.is_idle() {
                    st.neg.receive_offer().ok();
                    remote_offer = true;
                }
            }
            _ => {
                if pending.offer {
                    st.neg.withdraw_offer();
                }
                if matches!(kind, RequestKind::Reinvite | RequestKind::Update) {
                    end = match &outcome {
                        TransactionOutcome::Response(r) if matches!(r.status, 408 | 481) => {
                            Some(TerminationCause::Rejected(r.status))
                        }
                        TransactionOutcome::Timeout => Some(TerminationCause::Timeout),
                        _ => None,
                    };
                }
            }
        }

        let live = !st.terminated;
        let handler = st.handler.clone();
        let finish_close = st.bye_deferred && st.slot.is_idle();
        drop(st);

        debug!(%call_id, request = %kind, status = ?outcome.status(), "request completed");

        let msg = outcome.response().map(|r| SipMessage::from(r.clone()));

        if kind == RequestKind::Reinvite && outcome.response().is_some_and(|r| r.is_success()) {
            let ack_body = match (&msg, remote_offer) {
                (Some(msg), true) => self.answer_for(handler.as_ref(), msg).unwrap_or_else(|e| {
                    warn!(%call_id, error = %e, "offer in 2xx refused");
                    None
                }),
                _ => None,
            };
            let mut st = self.lock();
            if remote_offer {
                if ack_body.is_some() {
                    st.neg.send_answer().ok();
                    st.exchange_done = true;
                } else {
                    st.neg.decline_offer();
                }
            }
            let body = st.typed(ack_body);
            if let Err(e) = self.send_ack(socket, &mut st, pending.request.cseq.seq, body) {
                warn!(%call_id, error = %e, "failed to ACK re-INVITE");
            }
        }

        if live {
            if let (true, Some(handler), Some(msg)) = (answered, &handler, &msg) {
                handler.on_answer(self, msg);
            }
            if let Some(callback) = pending.callback {
                callback(self, &outcome);
            }
        }

        if let Some(cause) = end {
            if cause != TerminationCause::Rejected(481) {
                let mut st = self.lock();
                if let Err(e) = self.send_bye(socket, &mut st) {
                    debug!(%call_id, error = %e, "failed to send BYE");
                }
            }
            self.terminate(cause, msg.as_ref());
        } else if finish_close {
            let mut st = self.lock();
            if let Err(e) = self.send_bye(socket, &mut st) {
                warn!(%call_id, error = %e, "failed to send deferred BYE");
            }
            drop(st);
            self.shutdown(TerminationCause::Local);
        } else if kind == RequestKind::Bye {
            self.shutdown(TerminationCause::Local);
        }
    }

    /// Request expiry without a final response from the transaction layer
    pub(crate) fn on_request_timer(&self, id: TimerId) {
        let key = {
            let st = self.lock();
            st.requests
                .iter()
                .find(|p| p.transaction.is_some() && p.timer.as_ref().is_some_and(|t| t.id() == id))
                .and_then(|p| p.transaction.clone())
        };
        if let Some(key) = key {
            warn!(transaction = %key, "request expired");
            self.handle_outcome(&key, TransactionOutcome::Timeout);
        }
    }

    /// End of a glare back-off: send the request again or give up
    pub(crate) fn on_glare_timer(&self, id: TimerId) {
        let Ok(socket) = self.socket() else { return };
        let mut st = self.lock();
        let Some(idx) = st.requests.iter().position(|p| {
            p.transaction.is_none() && p.timer.as_ref().is_some_and(|t| t.id() == id)
        }) else {
            return;
        };
        let mut pending = st.requests.remove(idx);
        let kind = pending.kind;

        if st.terminated {
            return;
        }

        let acquired = st.slot.try_acquire(kind).is_ok();
        let offered = acquired && (!pending.offer || st.neg.send_offer().is_ok());
        if !offered {
            if acquired {
                st.slot.release(kind);
            }
            debug!(call_id = %st.dialog.call_id(), request = %kind, "glare retry abandoned");
            let outcome = pending.deferred.take().unwrap_or(TransactionOutcome::Timeout);
            self.complete_request(&socket, st, pending, outcome);
            return;
        }

        match self.resend(&socket, &mut st, &mut pending) {
            Ok(()) => st.requests.push(pending),
            Err(e) => {
                warn!(call_id = %st.dialog.call_id(), error = %e, "glare retry failed");
                st.slot.release(kind);
                if pending.offer {
                    st.neg.withdraw_offer();
                }
                self.complete_request(&socket, st, pending, TransactionOutcome::Failed(e.to_string()));
            }
        }
    }
}
