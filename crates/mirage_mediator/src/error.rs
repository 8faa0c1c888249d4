use mirage_cache::{CacheError, DigestError};
use thiserror::Error;

use crate::{mediator::Role, message::Direction};

/// Reasons a message cannot be mediated.
///
/// Replication faults never show up here; the mediator logs and drops them.
#[derive(Debug, Error)]
pub enum MediatorError {
    #[error("error in calculating the hash value of the request: {0}")]
    Digest(#[from] DigestError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A requester saw a response or a collector saw a request.
    #[error("{direction} messages cannot be handled in a {role} cache mediator")]
    RoleMismatch { role: Role, direction: Direction },

    #[error("no fingerprint could be computed for message {message_id}")]
    NoFingerprint { message_id: String },

    #[error("on-cache-hit sequence '{0}' is not defined")]
    UnknownSequence(String),

    #[error("on-cache-hit sequence '{name}' failed: {reason}")]
    Sequence { name: String, reason: String },

    #[error("invalid cache mediator configuration: {0}")]
    Config(String),
}

impl MediatorError {
    /// Lifecycle or role misuse, as opposed to a bad request or configuration.
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            Self::RoleMismatch { .. } | Self::Cache(CacheError::InvalidState(_))
        )
    }
}
