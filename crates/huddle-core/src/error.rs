//! Error taxonomy for the hub.
//!
//! Only [`HubError::Transport`] ends a session. Everything else drops the
//! offending envelope and keeps the session open.

use huddle_protocol::ProtocolError;
use huddle_transport::TransportError;
use thiserror::Error;

use crate::store::PersistError;

/// Membership rule violations. Always treated as no-ops.
#[derive(Debug, Error)]
pub enum MembershipError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// Invalid display name.
    #[error("Invalid username: {0}")]
    InvalidUsername(&'static str),

    /// The session is not a member of the channel.
    #[error("Not a member of channel: {0}")]
    NotMember(String),

    /// Channel limit reached; new channels cannot be created.
    #[error("Maximum channels reached")]
    MaxChannelsReached,
}

/// Any error surfaced by the hub while handling an envelope.
#[derive(Debug, Error)]
pub enum HubError {
    /// Session transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Storage failed.
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// Malformed or unexpected envelope.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Membership rule violated.
    #[error(transparent)]
    Membership(#[from] MembershipError),

    /// The chat queue is gone; the hub is shutting down.
    #[error("Chat queue closed")]
    QueueClosed,
}

impl HubError {
    /// Whether the session that caused this error must be torn down.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            HubError::Transport(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::Transport(_) => "transport",
            HubError::Persist(_) => "persist",
            HubError::Protocol(_) => "protocol",
            HubError::Membership(_) => "membership",
            HubError::QueueClosed => "queue_closed",
        }
    }
}
