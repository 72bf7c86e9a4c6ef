//! Request race and retry-loop guards
//!
//! RFC 3261 §14.1 forbids a UA from starting a new INVITE (or offer-bearing
//! UPDATE) while another one is in progress on the same dialog. A
//! [`RequestSlot`] makes that rule explicit: the slot is either idle or held
//! by exactly one request kind, and acquiring it is a compare-and-set.
//!
//! [`LoopState`] is the retry counter used when a request is re-sent after a
//! challenge, redirect or 491, so that a misbehaving peer cannot keep us
//! retrying forever.

use std::fmt;

use crate::errors::{Conflict, SessionError, SessionResult};
use crate::message::Method;

/// Session-initiated request kinds tracked by the pending-request tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Initial INVITE of a UAC session
    Invite,
    /// re-INVITE within an established dialog
    Reinvite,
    /// UPDATE (RFC 3311)
    Update,
    /// BYE
    Bye,
    /// PRACK (RFC 3262)
    Prack,
    /// INFO (RFC 6086)
    Info,
}

impl RequestKind {
    /// SIP method carried by requests of this kind
    pub fn method(&self) -> Method {
        match self {
            RequestKind::Invite | RequestKind::Reinvite => Method::Invite,
            RequestKind::Update => Method::Update,
            RequestKind::Bye => Method::Bye,
            RequestKind::Prack => Method::Prack,
            RequestKind::Info => Method::Info,
        }
    }

    /// Whether this kind occupies the session's modification slot
    pub fn is_exclusive(&self) -> bool {
        matches!(self, RequestKind::Reinvite | RequestKind::Update | RequestKind::Bye)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Invite => write!(f, "INVITE"),
            RequestKind::Reinvite => write!(f, "re-INVITE"),
            RequestKind::Update => write!(f, "UPDATE"),
            RequestKind::Bye => write!(f, "BYE"),
            RequestKind::Prack => write!(f, "PRACK"),
            RequestKind::Info => write!(f, "INFO"),
        }
    }
}

/// Idle/outstanding slot for session-modifying requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestSlot {
    outstanding: Option<RequestKind>,
}

impl RequestSlot {
    /// Create an idle slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot for `kind`, failing if any request already holds it
    pub fn try_acquire(&mut self, kind: RequestKind) -> SessionResult<()> {
        match self.outstanding {
            None => {
                self.outstanding = Some(kind);
                Ok(())
            }
            Some(current) => Err(SessionError::protocol_conflict(Conflict::RequestPending(current))),
        }
    }

    /// Release the slot if `kind` holds it; returns whether it was released
    pub fn release(&mut self, kind: RequestKind) -> bool {
        if self.outstanding == Some(kind) {
            self.outstanding = None;
            true
        } else {
            false
        }
    }

    /// Request kind currently holding the slot
    pub fn outstanding(&self) -> Option<RequestKind> {
        self.outstanding
    }

    /// Whether no request holds the slot
    pub fn is_idle(&self) -> bool {
        self.outstanding.is_none()
    }
}

/// Consecutive-failure counter for request retries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopState {
    failures: u32,
    last_status: u16,
}

impl LoopState {
    /// Failures after which a retry is considered a loop
    pub const MAX_FAILURES: u32 = 16;

    /// Create a fresh loop state
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all recorded failures
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record a final response and report whether retrying would loop
    ///
    /// Success clears the counter. 3xx, 401, 407 and 491 may repeat up to
    /// [`Self::MAX_FAILURES`] times; any other failure loops as soon as the
    /// same status is seen twice in a row.
    pub fn request_loops(&mut self, status: u16) -> bool {
        if status < 200 {
            return false;
        }

        let mut looping = false;
        if status < 300 {
            self.failures = 0;
        } else if status < 400 {
            self.failures += 1;
            looping = self.failures >= Self::MAX_FAILURES;
        } else {
            if !matches!(status, 401 | 407 | 491) && self.last_status == status {
                looping = true;
            }
            self.failures += 1;
            if self.failures >= Self::MAX_FAILURES {
                looping = true;
            }
        }

        self.last_status = status;
        looping
    }

    /// Number of consecutive failures seen
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_compare_and_set() {
        let mut slot = RequestSlot::new();
        assert!(slot.is_idle());

        slot.try_acquire(RequestKind::Reinvite).unwrap();
        assert_eq!(slot.outstanding(), Some(RequestKind::Reinvite));

        let err = slot.try_acquire(RequestKind::Bye).unwrap_err();
        assert_eq!(err.conflict(), Some(Conflict::RequestPending(RequestKind::Reinvite)));

        // Releasing with the wrong kind leaves the holder in place
        assert!(!slot.release(RequestKind::Bye));
        assert!(slot.release(RequestKind::Reinvite));
        assert!(slot.is_idle());
        slot.try_acquire(RequestKind::Bye).unwrap();
    }

    #[test]
    fn test_repeated_failure_loops() {
        let mut ls = LoopState::new();
        assert!(!ls.request_loops(500));
        assert!(ls.request_loops(500));
    }

    #[test]
    fn test_challenges_allowed_until_limit() {
        let mut ls = LoopState::new();
        for _ in 0..LoopState::MAX_FAILURES - 1 {
            assert!(!ls.request_loops(401));
        }
        assert!(ls.request_loops(401));

        ls.reset();
        assert_eq!(ls.failures(), 0);
        assert!(!ls.request_loops(491));
    }

    #[test]
    fn test_success_clears_failures() {
        let mut ls = LoopState::new();
        ls.request_loops(302);
        ls.request_loops(302);
        assert_eq!(ls.failures(), 2);
        assert!(!ls.request_loops(200));
        assert_eq!(ls.failures(), 0);
    }
}
