use thiserror::Error;

/// Errors raised by cache entries, stores and replication.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A lifecycle operation was attempted in a state that forbids it.
    #[error("invalid cache state: {0}")]
    InvalidState(&'static str),

    /// Best-effort propagation to cluster peers failed.
    #[error("replication of scope '{scope}' failed: {reason}")]
    Replication { scope: String, reason: String },

    #[error("replication batch codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
