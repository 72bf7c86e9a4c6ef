//! Reliable provisional responses (RFC 3262)
//!
//! Decides whether a 1xx goes out reliably, allocates RSeq numbers, tracks
//! the PRACK we are waiting for and validates RAck values. While a reliable
//! provisional response is unacknowledged, neither another reliable 1xx nor
//! the final 2xx may be sent.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::errors::{Conflict, SessionError, SessionResult};
use crate::message::{Method, RAck, SipRequest};

/// Option tag of the reliability extension
pub const REL100_TAG: &str = "100rel";

/// Local policy for sending provisional responses reliably
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rel100Mode {
    /// Never send reliably
    #[default]
    Disabled,
    /// Send reliably when the peer supports it
    Supported,
    /// Always send reliably; calls from peers without support fail
    Required,
}

/// Whether a request indicates 100rel support
pub fn peer_supports_100rel(request: &SipRequest) -> bool {
    request.has_token("Supported", REL100_TAG) || request.has_token("Require", REL100_TAG)
}

/// Per-session reliability bookkeeping
#[derive(Debug, Clone, Default)]
pub struct Reliability {
    peer_supported: bool,
    last_rseq: u32,
    unacked: Option<u32>,
    awaiting: u32,
    remote_rseq: Option<u32>,
}

impl Reliability {
    /// Reliability state for the INVITE being answered
    pub fn for_request(request: &SipRequest) -> Self {
        Self {
            peer_supported: peer_supports_100rel(request),
            ..Self::default()
        }
    }

    pub fn peer_supported(&self) -> bool {
        self.peer_supported
    }

    /// Decide whether a provisional response with `status` is sent reliably
    ///
    /// 100 Trying is hop-by-hop and never reliable.
    pub fn is_reliable(&self, mode: Rel100Mode, status: u16) -> SessionResult<bool> {
        if status <= 100 {
            return Ok(false);
        }

        let reliable = match mode {
            Rel100Mode::Disabled => false,
            Rel100Mode::Supported => self.peer_supported,
            Rel100Mode::Required if self.peer_supported => true,
            Rel100Mode::Required => return Err(SessionError::extension_required(REL100_TAG)),
        };

        if reliable && self.awaiting > 0 {
            return Err(SessionError::protocol_conflict(Conflict::AwaitingPrack));
        }
        Ok(reliable)
    }

    /// Check a mode against the peer before anything is sent
    pub fn check_mode(&self, mode: Rel100Mode) -> SessionResult<()> {
        if mode == Rel100Mode::Required && !self.peer_supported {
            return Err(SessionError::extension_required(REL100_TAG));
        }
        Ok(())
    }

    /// Allocate the RSeq for a reliable provisional response
    pub fn next_rseq(&mut self) -> u32 {
        self.last_rseq += 1;
        self.unacked = Some(self.last_rseq);
        self.awaiting += 1;
        trace!(rseq = self.last_rseq, awaiting = self.awaiting, "allocated RSeq");
        self.last_rseq
    }

    /// RSeq that the next reliable response would carry
    pub fn peek_rseq(&self) -> u32 {
        self.last_rseq + 1
    }

    /// Number of reliable provisional responses awaiting PRACK
    pub fn awaiting_prack(&self) -> u32 {
        self.awaiting
    }

    /// Fail if a final response may not be sent yet
    pub fn guard_final(&self) -> SessionResult<()> {
        if self.awaiting > 0 {
            Err(SessionError::protocol_conflict(Conflict::AwaitingPrack))
        } else {
            Ok(())
        }
    }

    /// Validate a PRACK's RAck against the INVITE with `invite_cseq`
    ///
    /// Only the most recent unacknowledged RSeq is accepted.
    pub fn acknowledge(&mut self, rack: &RAck, invite_cseq: u32) -> SessionResult<u32> {
        if rack.method != Method::Invite || rack.cseq != invite_cseq {
            debug!(%rack, invite_cseq, "RAck refers to another transaction");
            return Err(SessionError::protocol_conflict(Conflict::RackMismatch));
        }
        match self.unacked {
            Some(rseq) if rseq == rack.rseq => {
                self.unacked = None;
                self.awaiting = self.awaiting.saturating_sub(1);
                debug!(rseq, "PRACK accepted");
                Ok(rseq)
            }
            expected => {
                debug!(%rack, ?expected, "PRACK does not match outstanding RSeq");
                Err(SessionError::protocol_conflict(Conflict::RackMismatch))
            }
        }
    }

    /// Give up on the outstanding reliable response
    pub fn expire(&mut self, rseq: u32) {
        if self.unacked == Some(rseq) {
            self.unacked = None;
            self.awaiting = self.awaiting.saturating_sub(1);
        }
    }

    /// Record a reliable 1xx received as UAC; returns false for retransmissions
    pub fn accept_remote_rseq(&mut self, rseq: u32) -> bool {
        match self.remote_rseq {
            Some(last) if rseq <= last => false,
            _ => {
                self.remote_rseq = Some(rseq);
                true
            }
        }
    }
}
