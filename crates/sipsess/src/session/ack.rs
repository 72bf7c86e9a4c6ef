//! ACKs for 2xx responses to our INVITEs
//!
//! ACKs are end-to-end and not retransmitted by the transaction layer. Each
//! one is kept in the socket registry for the transaction lifetime so a
//! retransmitted 2xx can be answered with the identical ACK, even after the
//! session that sent it has gone.

use tokio::time::Instant;
use tracing::{debug, trace};

use super::{Session, SessionState};
use crate::errors::{SessionError, SessionResult};
use crate::message::{Body, Method, SipResponse};
use crate::registry::{AckKey, AckRecord};
use crate::socket::{SessionSocket, SocketInner};
use crate::timer::TimerTarget;

impl Session {
    /// Send (and remember) the ACK for the INVITE sent with `cseq`
    pub(super) fn send_ack(
        &self,
        socket: &SocketInner,
        st: &mut SessionState,
        cseq: u32,
        body: Option<(String, Body)>,
    ) -> SessionResult<()> {
        let mut ack = st.dialog.ack(cseq).with_contact(st.contact.clone());
        if let Some((content_type, body)) = body {
            ack = ack.with_body(content_type, body);
        }
        if let Some(auth) = st.auth.as_mut() {
            auth.authorize(&mut ack);
        }

        socket.transport.send_ack(ack.clone())?;

        let key = AckKey::new(st.dialog.call_id(), cseq);
        let lifetime = socket.config.transaction_timeout();
        let timer = socket.timers.schedule(lifetime, TimerTarget::Ack(key.clone()));
        let expires = Instant::now() + lifetime;
        socket.registry.store_ack(key, AckRecord { ack, timer, expires });
        debug!(call_id = %st.dialog.call_id(), cseq, "ACK sent");
        Ok(())
    }

    /// Send the ACK for the INVITE with `cseq` again
    ///
    /// Re-sends the stored ACK when there is one, else builds a fresh one.
    pub fn ack(&self, cseq: u32) -> SessionResult<()> {
        let socket = self.socket()?;
        let mut st = self.lock_live()?;
        let key = AckKey::new(st.dialog.call_id(), cseq);
        match socket.registry.ack_for(&key) {
            Some(ack) => socket.transport.send_ack(ack),
            None => self.send_ack(&socket, &mut st, cseq, None),
        }
    }
}

impl SessionSocket {
    /// Answer a retransmitted 2xx to one of our INVITEs with the stored ACK
    pub fn ack_again(&self, response: &SipResponse) -> SessionResult<()> {
        if !response.is_success() || response.cseq.method != Method::Invite {
            return Err(SessionError::invalid_argument("only a 2xx to INVITE is acknowledged"));
        }
        let key = AckKey::new(response.call_id.clone(), response.cseq.seq);
        let ack = self.inner.registry.ack_for(&key).ok_or_else(|| {
            SessionError::no_session(format!("no ACK stored for {} {}", key.call_id, key.cseq))
        })?;
        trace!(call_id = %key.call_id, cseq = key.cseq, "re-sending ACK");
        self.inner.transport.send_ack(ack)
    }
}
