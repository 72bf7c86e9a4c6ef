//! Offer/answer negotiation state (RFC 3264)
//!
//! The session layer never looks inside a body; it only tracks whose turn it
//! is. A body is an offer when the state is [`NegotiationState::Idle`], and
//! the answer to the outstanding offer otherwise.
//!
//! ```text
//!            send offer               receive answer
//!   Idle ─────────────────▶ LocalOffer ──────────────▶ Idle
//!   Idle ─────────────────▶ RemoteOffer ─────────────▶ Idle
//!          receive offer                send answer
//! ```
//!
//! There is no edge between the two outstanding states, which is how glare
//! (both sides offering at once) is detected.

use std::fmt;

use crate::errors::{Conflict, SessionError, SessionResult};

/// Whose offer, if any, is waiting for an answer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NegotiationState {
    /// No offer outstanding
    #[default]
    Idle,
    /// We sent an offer and wait for the answer
    LocalOffer,
    /// The peer sent an offer and waits for our answer
    RemoteOffer,
}

impl NegotiationState {
    /// Record an outgoing offer
    pub fn send_offer(&mut self) -> SessionResult<()> {
        match self {
            NegotiationState::Idle => {
                *self = NegotiationState::LocalOffer;
                Ok(())
            }
            _ => Err(SessionError::protocol_conflict(Conflict::OfferOutstanding)),
        }
    }

    /// Record an incoming offer; fails on glare
    pub fn receive_offer(&mut self) -> SessionResult<()> {
        match self {
            NegotiationState::Idle => {
                *self = NegotiationState::RemoteOffer;
                Ok(())
            }
            _ => Err(SessionError::protocol_conflict(Conflict::OfferOutstanding)),
        }
    }

    /// Record our answer to the peer's offer
    pub fn send_answer(&mut self) -> SessionResult<()> {
        match self {
            NegotiationState::RemoteOffer => {
                *self = NegotiationState::Idle;
                Ok(())
            }
            _ => Err(SessionError::protocol_conflict(Conflict::NotAnswerable)),
        }
    }

    /// Record the peer's answer to our offer
    pub fn receive_answer(&mut self) -> SessionResult<()> {
        match self {
            NegotiationState::LocalOffer => {
                *self = NegotiationState::Idle;
                Ok(())
            }
            _ => Err(SessionError::protocol_conflict(Conflict::NotAnswerable)),
        }
    }

    /// Drop our outstanding offer (the carrying request failed)
    pub fn withdraw_offer(&mut self) {
        if *self == NegotiationState::LocalOffer {
            *self = NegotiationState::Idle;
        }
    }

    /// Drop the peer's outstanding offer (we rejected the carrying request)
    pub fn decline_offer(&mut self) {
        if *self == NegotiationState::RemoteOffer {
            *self = NegotiationState::Idle;
        }
    }

    pub fn is_idle(&self) -> bool {
        *self == NegotiationState::Idle
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Idle => write!(f, "idle"),
            NegotiationState::LocalOffer => write!(f, "local-offer"),
            NegotiationState::RemoteOffer => write!(f, "remote-offer"),
        }
    }
}
