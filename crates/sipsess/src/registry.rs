//! Session registry of a socket
//!
//! Three concurrent tables:
//!
//! - sessions by Call-ID (several sessions may share a Call-ID when a
//!   request forks, so the value is a list filtered by dialog tags)
//! - transactions to the session waiting on them: our client requests and
//!   the INVITE server transactions a CANCEL may hit
//! - ACKs we sent, by Call-ID and CSeq, so a retransmitted 2xx can be
//!   answered after the session that sent the ACK is gone. Each one carries
//!   a deadline; expired records are swept whenever another ACK is stored,
//!   so the table stays bounded even when timers never fire.
//!
//! Table guards are never held while a session is locked from here; lookups
//! clone the handles out first.

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::message::SipRequest;
use crate::session::{Session, WeakSession};
use crate::timer::{TimerHandle, TimerId};
use crate::transport::TransactionKey;

/// Identity of an ACK we sent
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckKey {
    pub call_id: String,
    pub cseq: u32,
}

impl AckKey {
    pub fn new(call_id: impl Into<String>, cseq: u32) -> Self {
        Self { call_id: call_id.into(), cseq }
    }
}

/// Stored ACK plus the timer that expires it
#[derive(Debug)]
pub(crate) struct AckRecord {
    pub ack: SipRequest,
    pub timer: TimerHandle,
    pub expires: Instant,
}

#[derive(Default)]
pub(crate) struct Registry {
    sessions: DashMap<String, Vec<Session>>,
    transactions: DashMap<TransactionKey, WeakSession>,
    acks: DashMap<AckKey, AckRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, call_id: &str, session: Session) {
        debug!(%call_id, "session registered");
        self.sessions.entry(call_id.to_string()).or_default().push(session);
    }

    pub fn remove(&self, call_id: &str, session: &Session) {
        let now_empty = match self.sessions.get_mut(call_id) {
            Some(mut list) => {
                list.retain(|s| !s.ptr_eq(session));
                list.is_empty()
            }
            None => return,
        };
        if now_empty {
            self.sessions.remove_if(call_id, |_, list| list.is_empty());
        }
        debug!(%call_id, "session unregistered");
    }

    /// Sessions sharing a Call-ID
    pub fn by_call_id(&self, call_id: &str) -> Vec<Session> {
        self.sessions.get(call_id).map(|list| list.clone()).unwrap_or_default()
    }

    /// Session whose dialog the in-dialog request belongs to
    pub fn find(&self, request: &SipRequest) -> Option<Session> {
        self.by_call_id(&request.call_id)
            .into_iter()
            .find(|s| s.matches_request(request))
    }

    /// Session created from this initial INVITE (retransmission check)
    pub fn find_initial(&self, request: &SipRequest) -> Option<Session> {
        self.by_call_id(&request.call_id)
            .into_iter()
            .find(|s| !s.is_owner() && s.remote_tag().as_deref() == request.from.tag.as_deref())
    }

    pub fn all(&self) -> Vec<Session> {
        self.sessions.iter().flat_map(|entry| entry.value().clone()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn bind_transaction(&self, key: TransactionKey, session: WeakSession) {
        trace!(transaction = %key, "transaction bound");
        self.transactions.insert(key, session);
    }

    pub fn unbind_transaction(&self, key: &TransactionKey) {
        self.transactions.remove(key);
    }

    pub fn session_for(&self, key: &TransactionKey) -> Option<Session> {
        let weak = self.transactions.get(key).map(|entry| entry.value().clone())?;
        weak.upgrade()
    }

    pub fn store_ack(&self, key: AckKey, record: AckRecord) {
        let now = Instant::now();
        let before = self.acks.len();
        self.acks.retain(|_, stored| stored.expires > now);
        let swept = before.saturating_sub(self.acks.len());
        if swept > 0 {
            trace!(swept, "expired ACKs swept");
        }
        trace!(call_id = %key.call_id, cseq = key.cseq, "ACK stored");
        self.acks.insert(key, record);
    }

    pub fn ack_for(&self, key: &AckKey) -> Option<SipRequest> {
        let now = Instant::now();
        self.acks
            .get(key)
            .filter(|entry| entry.expires > now)
            .map(|entry| entry.ack.clone())
    }

    pub fn ack_count(&self) -> usize {
        self.acks.len()
    }

    /// Drop a stored ACK if `timer` is still the one guarding it
    pub fn expire_ack(&self, key: &AckKey, timer: TimerId) {
        if self.acks.remove_if(key, |_, record| record.timer.id() == timer).is_some() {
            trace!(call_id = %key.call_id, cseq = key.cseq, "ACK expired");
        }
    }

    pub fn clear(&self) {
        self.sessions.clear();
        self.transactions.clear();
        self.acks.clear();
    }
}
