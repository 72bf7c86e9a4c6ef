//! Responses to the INVITE a session is answering
//!
//! Builds 1xx and 2xx responses with the 100rel and offer/answer rules
//! applied, keeps reliable 1xx and 2xx responses retransmitting until their
//! PRACK or ACK arrives, and gives up after the transaction lifetime.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Session, SessionState, StateGuard};
use crate::errors::{Conflict, SessionError, SessionResult};
use crate::handler::TerminationCause;
use crate::message::{Body, Header, SipMessage, SipRequest, SipResponse, reason_phrase};
use crate::negotiation::NegotiationState;
use crate::rel100::{REL100_TAG, Rel100Mode};
use crate::socket::SocketInner;
use crate::timer::{TimerHandle, TimerId, TimerTarget};
use crate::transport::TransactionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyKind {
    /// Reliable provisional response waiting for PRACK
    Reliable { rseq: u32 },
    /// 2xx waiting for ACK; `offered` when it carried our offer
    Final { offered: bool },
}

/// A response being retransmitted
#[derive(Debug)]
pub(crate) struct ReplyRecord {
    pub kind: ReplyKind,
    pub cseq: u32,
    pub transaction: TransactionKey,
    pub response: SipResponse,
    interval: Duration,
    armed: Duration,
    elapsed: Duration,
    timer: TimerHandle,
}

impl Session {
    fn arm_reply_timer(&self, socket: &SocketInner, delay: Duration) -> TimerHandle {
        socket.timers.schedule(delay, TimerTarget::Reply(self.downgrade()))
    }

    /// Response to `invite` with our tag, Contact and capabilities
    pub(super) fn build_reply(
        &self,
        socket: &SocketInner,
        st: &SessionState,
        invite: &SipRequest,
        status: u16,
        reason: &str,
    ) -> SipResponse {
        let mut response =
            SipResponse::for_request(invite, status, reason).with_to_tag(st.dialog.local_tag());
        if status > 100 && status < 300 {
            response = response
                .with_contact(st.contact.clone())
                .with_header("Allow", socket.config.allow_header());
            if st.rel100 != Rel100Mode::Disabled {
                response = response.with_header("Supported", REL100_TAG);
            }
        }
        socket.decorate(response)
    }

    /// Send a provisional response to the pending INVITE
    pub(super) fn reply_1xx(
        &self,
        socket: &SocketInner,
        st: &mut SessionState,
        status: u16,
        reason: &str,
        mode: Rel100Mode,
        content: Option<Body>,
        headers: &[Header],
    ) -> SessionResult<()> {
        let invite = st
            .invite
            .clone()
            .ok_or(SessionError::protocol_conflict(Conflict::AlreadyAnswered))?;
        let transaction = st
            .server_tx
            .clone()
            .ok_or(SessionError::protocol_conflict(Conflict::AlreadyAnswered))?;

        let reliable = st.rel.is_reliable(mode, status)?;
        let content = content.filter(|b| !b.is_empty());

        let mut offer = false;
        let mut answer = false;
        if reliable && content.is_some() {
            match st.neg {
                NegotiationState::RemoteOffer => answer = true,
                NegotiationState::Idle => offer = !st.exchange_done && !invite.has_body(),
                NegotiationState::LocalOffer => {
                    return Err(SessionError::protocol_conflict(Conflict::OfferOutstanding));
                }
            }
        }

        let mut response = self.build_reply(socket, st, &invite, status, reason);
        if reliable {
            response = response
                .with_header("Require", REL100_TAG)
                .with_header("RSeq", st.rel.peek_rseq().to_string());
        }
        response.headers.extend_from_slice(headers);
        if let Some(body) = &content {
            response = response.with_body(st.content_type.clone(), body.clone());
        }

        socket.transport.send_reply(&transaction, response.clone())?;

        if let Some(body) = content {
            st.content = Some(body);
        }
        if answer {
            st.neg.send_answer()?;
            st.exchange_done = true;
        }
        if offer {
            st.neg.send_offer()?;
        }

        if reliable {
            let rseq = st.rel.next_rseq();
            let t1 = socket.config.t1();
            st.replies.push(ReplyRecord {
                kind: ReplyKind::Reliable { rseq },
                cseq: invite.cseq.seq,
                transaction,
                response,
                interval: t1,
                armed: t1,
                elapsed: Duration::ZERO,
                timer: self.arm_reply_timer(socket, t1),
            });
            info!(call_id = %invite.call_id, status, rseq, negotiation = %st.neg, "sent reliable provisional response");
        } else {
            debug!(call_id = %invite.call_id, status, "sent provisional response");
        }
        Ok(())
    }

    /// Send the 2xx to the pending INVITE
    pub(super) fn reply_2xx(
        &self,
        socket: &SocketInner,
        st: &mut SessionState,
        status: u16,
        reason: &str,
        content: Option<Body>,
        headers: &[Header],
    ) -> SessionResult<()> {
        let invite = st
            .invite
            .clone()
            .ok_or(SessionError::protocol_conflict(Conflict::AlreadyAnswered))?;
        let transaction = st
            .server_tx
            .clone()
            .ok_or(SessionError::protocol_conflict(Conflict::AlreadyAnswered))?;

        st.rel.guard_final()?;

        let content = content.or_else(|| st.content.clone()).filter(|b| !b.is_empty());
        let (offer, answer) = match st.neg {
            NegotiationState::RemoteOffer if content.is_none() => {
                return Err(SessionError::invalid_argument("answer requires content"));
            }
            NegotiationState::RemoteOffer => (false, true),
            NegotiationState::Idle => {
                (content.is_some() && !st.exchange_done && !invite.has_body(), false)
            }
            // Our offer from a reliable 1xx is still unanswered
            NegotiationState::LocalOffer => (false, false),
        };

        let mut response = self.build_reply(socket, st, &invite, status, reason);
        response.headers.extend_from_slice(headers);
        if st.neg != NegotiationState::LocalOffer {
            if let Some(body) = &content {
                response = response.with_body(st.content_type.clone(), body.clone());
            }
        }

        socket.transport.send_reply(&transaction, response.clone())?;

        if let Some(body) = content {
            st.content = Some(body);
        }
        if answer {
            st.neg.send_answer()?;
            st.exchange_done = true;
        }
        if offer {
            st.neg.send_offer()?;
        }

        st.invite = None;
        st.server_tx = None;
        socket.registry.unbind_transaction(&transaction);
        st.dialog.confirm();

        let t1 = socket.config.t1();
        st.replies.push(ReplyRecord {
            kind: ReplyKind::Final { offered: offer },
            cseq: invite.cseq.seq,
            transaction,
            response,
            interval: t1,
            armed: t1,
            elapsed: Duration::ZERO,
            timer: self.arm_reply_timer(socket, t1),
        });

        info!(call_id = %invite.call_id, status, offered = offer, negotiation = %st.neg, "sent final response");
        Ok(())
    }

    /// Send a non-2xx final response to the pending INVITE
    ///
    /// Returns whether it was the dialog-creating INVITE.
    pub(super) fn reply_failure(
        &self,
        socket: &SocketInner,
        st: &mut SessionState,
        status: u16,
        reason: &str,
        headers: &[Header],
    ) -> SessionResult<bool> {
        let invite = st
            .invite
            .clone()
            .ok_or(SessionError::protocol_conflict(Conflict::AlreadyAnswered))?;
        let transaction = st
            .server_tx
            .clone()
            .ok_or(SessionError::protocol_conflict(Conflict::AlreadyAnswered))?;

        let mut response = self.build_reply(socket, st, &invite, status, reason);
        response.headers.extend_from_slice(headers);
        socket.transport.send_reply(&transaction, response)?;

        st.invite = None;
        st.server_tx = None;
        socket.registry.unbind_transaction(&transaction);
        st.neg.decline_offer();
        st.replies.retain(|r| !matches!(r.kind, ReplyKind::Reliable { .. }));

        debug!(call_id = %invite.call_id, status, "rejected INVITE");
        Ok(!st.dialog.is_confirmed())
    }

    /// Reject a re-INVITE after the fact (offer refused or unanswerable)
    pub(super) fn reject_reinvite(&self, socket: &SocketInner, st: &mut SessionState, status: u16) {
        if let Err(e) = self.reply_failure(socket, st, status, reason_phrase(status), &[]) {
            warn!(call_id = %st.dialog.call_id(), error = %e, "failed to reject re-INVITE");
        }
    }

    /// ACK for one of our 2xx responses
    pub(super) fn handle_ack(&self, socket: &SocketInner, ack: &SipRequest) {
        let mut st = self.lock();
        let Some(idx) = st
            .replies
            .iter()
            .position(|r| matches!(r.kind, ReplyKind::Final { .. }) && r.cseq == ack.cseq.seq)
        else {
            debug!(call_id = %ack.call_id, cseq = ack.cseq.seq, "ACK matches no pending 2xx");
            return;
        };
        let record = st.replies.remove(idx);

        let mut answered = false;
        if record.kind == (ReplyKind::Final { offered: true }) {
            if !ack.has_body() {
                warn!(call_id = %ack.call_id, "ACK carries no answer to our offer");
                if let Err(e) = self.send_bye(socket, &mut st) {
                    warn!(call_id = %ack.call_id, error = %e, "failed to send BYE");
                }
                drop(st);
                let msg = SipMessage::from(ack.clone());
                self.terminate(TerminationCause::Protocol("ACK without answer".into()), Some(&msg));
                return;
            }
            st.neg.receive_answer().ok();
            st.exchange_done = true;
            answered = true;
        }

        let first = !st.established;
        st.established = true;
        let handler = st.handler.clone();
        drop(st);

        debug!(call_id = %ack.call_id, first, "2xx acknowledged");
        let Some(handler) = handler else { return };
        let msg = SipMessage::from(ack.clone());
        if answered {
            handler.on_answer(self, &msg);
        }
        if first {
            info!(call_id = %ack.call_id, "session established");
            handler.on_establish(self, &msg);
        }
    }

    /// PRACK for one of our reliable provisional responses
    pub(super) fn handle_prack(&self, socket: &SocketInner, prack: &SipRequest) {
        let mut st = self.lock();

        let Some(rack) = prack.rack() else {
            drop(st);
            socket.reply_status(prack, 400, "Bad RAck");
            return;
        };
        let Some(invite_cseq) = st.invite.as_ref().map(|i| i.cseq.seq) else {
            drop(st);
            socket.reply_status(prack, 481, reason_phrase(481));
            return;
        };
        if let Err(e) = st.rel.acknowledge(&rack, invite_cseq) {
            debug!(call_id = %prack.call_id, %rack, error = %e, "PRACK rejected");
            drop(st);
            socket.reply_status(prack, 481, reason_phrase(481));
            return;
        }
        st.replies
            .retain(|r| !matches!(r.kind, ReplyKind::Reliable { rseq } if rseq == rack.rseq));

        #[derive(PartialEq)]
        enum Carried {
            Nothing,
            Answer,
            Offer,
        }
        let carried = if !prack.has_body() {
            Carried::Nothing
        } else {
            match st.neg {
                NegotiationState::LocalOffer => {
                    st.neg.receive_answer().ok();
                    st.exchange_done = true;
                    Carried::Answer
                }
                NegotiationState::Idle => {
                    st.neg.receive_offer().ok();
                    Carried::Offer
                }
                NegotiationState::RemoteOffer => {
                    drop(st);
                    socket.reply_status(prack, 491, reason_phrase(491));
                    return;
                }
            }
        };
        let handler = st.handler.clone();
        drop(st);

        let msg = SipMessage::from(prack.clone());
        let mut response = socket.response(prack, 200, reason_phrase(200));
        match carried {
            Carried::Nothing => {}
            Carried::Answer => {
                if let Some(handler) = &handler {
                    handler.on_answer(self, &msg);
                }
            }
            Carried::Offer => match self.answer_for(handler.as_ref(), &msg) {
                Ok(Some(body)) => {
                    let mut st = self.lock();
                    st.neg.send_answer().ok();
                    st.exchange_done = true;
                    response = response.with_body(st.content_type.clone(), body);
                }
                result => {
                    if let Err(e) = result {
                        debug!(call_id = %prack.call_id, error = %e, "offer in PRACK refused");
                    }
                    self.lock().neg.decline_offer();
                    socket.reply_status(prack, 488, reason_phrase(488));
                    return;
                }
            },
        }

        if let Err(e) = socket.reply(prack, response) {
            warn!(call_id = %prack.call_id, error = %e, "failed to answer PRACK");
        }
        debug!(call_id = %prack.call_id, rseq = rack.rseq, "PRACK accepted");
        if let Some(handler) = handler {
            handler.on_prack(self, prack);
        }
    }

    /// Retransmission or expiry of a reliable 1xx or a 2xx
    pub(crate) fn on_reply_timer(&self, id: TimerId) {
        let Ok(socket) = self.socket() else { return };
        let mut st = self.lock();
        if st.terminated {
            return;
        }
        let Some(idx) = st.replies.iter().position(|r| r.timer.id() == id) else {
            return;
        };

        let timeout = socket.config.transaction_timeout();
        let record = &mut st.replies[idx];
        record.elapsed += record.armed;

        if record.elapsed >= timeout {
            let record = st.replies.remove(idx);
            self.expire_reply(&socket, st, record);
            return;
        }

        record.interval = match record.kind {
            ReplyKind::Final { .. } => (record.interval * 2).min(socket.config.t2()),
            ReplyKind::Reliable { .. } => record.interval * 2,
        };
        let delay = record.interval.min(timeout - record.elapsed);
        record.armed = delay;

        if let Err(e) = socket.transport.send_reply(&record.transaction, record.response.clone()) {
            warn!(status = record.response.status, error = %e, "response retransmission failed");
        }
        let timer = self.arm_reply_timer(&socket, delay);
        st.replies[idx].timer = timer;
    }

    fn expire_reply(&self, socket: &SocketInner, mut st: StateGuard<'_>, record: ReplyRecord) {
        let call_id = st.dialog.call_id().to_string();
        match record.kind {
            ReplyKind::Final { .. } => {
                warn!(%call_id, "no ACK for 2xx, ending session");
                if let Err(e) = self.send_bye(socket, &mut st) {
                    warn!(%call_id, error = %e, "failed to send BYE");
                }
            }
            ReplyKind::Reliable { rseq } => {
                warn!(%call_id, rseq, "no PRACK for reliable provisional response");
                st.rel.expire(rseq);
                if let Err(e) = self.reply_failure(socket, &mut st, 504, "Server Time-out", &[]) {
                    debug!(%call_id, error = %e, "could not reject INVITE");
                }
            }
        }
        drop(st);
        self.terminate(TerminationCause::Timeout, None);
    }
}
