//! Error types for sipsess
//!
//! Every session operation reports failure through [`SessionResult`]. The
//! variants follow the failure classes a caller has to tell apart:
//!
//! - **InvalidArgument**: malformed status code or missing field, rejected
//!   before any state is touched
//! - **NoSession**: the session is terminated or was never registered
//! - **ProtocolConflict**: the operation is valid but not *now* (offer
//!   outstanding, PRACK awaited, request pending); session state is unchanged
//! - **Transport**: the transaction layer refused to send
//! - **Authentication**: a challenge could not be answered
//! - **ExtensionRequired**: 100rel was required but the peer lacks support

use std::fmt;

use thiserror::Error;

use crate::loop_state::RequestKind;

/// Result type used throughout sipsess
pub type SessionResult<T> = Result<T, SessionError>;

/// Reason a protocol-conflict error was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    /// An offer is already outstanding in either direction
    OfferOutstanding,
    /// A reliable provisional response has not been PRACKed yet
    AwaitingPrack,
    /// A competing request of the given kind is in flight
    RequestPending(RequestKind),
    /// The RAck of a PRACK does not match the outstanding reliable response
    RackMismatch,
    /// There is no offer to answer
    NotAnswerable,
    /// The INVITE has already received its final response
    AlreadyAnswered,
    /// The dialog is not established yet
    NotEstablished,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::OfferOutstanding => write!(f, "offer already outstanding"),
            Conflict::AwaitingPrack => write!(f, "awaiting PRACK for reliable provisional response"),
            Conflict::RequestPending(kind) => write!(f, "{} request pending", kind),
            Conflict::RackMismatch => write!(f, "RAck does not match outstanding RSeq"),
            Conflict::NotAnswerable => write!(f, "no offer to answer"),
            Conflict::AlreadyAnswered => write!(f, "INVITE already answered"),
            Conflict::NotEstablished => write!(f, "session not established"),
        }
    }
}

/// Session layer error
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// Argument rejected before any mutation
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Human-readable error message
        message: String,
    },

    /// Session is terminated or unknown
    #[error("No session: {message}")]
    NoSession {
        /// Human-readable error message
        message: String,
    },

    /// Operation conflicts with the current protocol state
    #[error("Protocol conflict: {0}")]
    ProtocolConflict(Conflict),

    /// Transport or transaction layer failure
    #[error("Transport error: {message}")]
    Transport {
        /// Human-readable error message
        message: String,
    },

    /// Authentication challenge could not be answered
    #[error("Authentication failed: {message}")]
    Authentication {
        /// Human-readable error message
        message: String,
    },

    /// Peer does not support an extension this side requires
    #[error("Peer does not support required extension: {extension}")]
    ExtensionRequired {
        /// Option tag of the missing extension (e.g. `100rel`)
        extension: String,
    },

    /// Configuration is invalid
    #[error("Configuration error: {message}")]
    Config {
        /// Human-readable error message
        message: String,
    },
}

impl SessionError {
    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// Create a no-session error
    pub fn no_session(message: impl Into<String>) -> Self {
        Self::NoSession { message: message.into() }
    }

    /// Create a protocol conflict error
    pub fn protocol_conflict(conflict: Conflict) -> Self {
        Self::ProtocolConflict(conflict)
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Create an authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication { message: message.into() }
    }

    /// Create an extension-required error
    pub fn extension_required(extension: impl Into<String>) -> Self {
        Self::ExtensionRequired { extension: extension.into() }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Whether retrying the same operation later may succeed
    ///
    /// Protocol conflicts clear once the competing exchange completes, with
    /// the exception of a mismatched RAck or an INVITE that is already
    /// answered.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionError::ProtocolConflict(c)
                if !matches!(c, Conflict::RackMismatch | Conflict::AlreadyAnswered)
        )
    }

    /// The conflict reason, if this is a protocol conflict
    pub fn conflict(&self) -> Option<Conflict> {
        match self {
            SessionError::ProtocolConflict(c) => Some(*c),
            _ => None,
        }
    }
}
