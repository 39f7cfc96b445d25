/// Error types for the shardmesh distributed object store.
///
/// Every failure surfaced to a caller falls into one of a small set of
/// semantic categories so that routing layers can decide whether to retry,
/// fall back to a replica, or report the condition to the client as-is.
use thiserror::Error;

/// Errors produced across the storage, routing, and coordination layers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Metadata or a stored key is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Upload of a `(user, name)` pair that already has metadata.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Shard placement failed because no peer is eligible.
    #[error("no capacity: {0}")]
    NoCapacity(String),

    /// Transport or deadline failure on a required hop.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A leader-only operation was invoked on a follower.
    #[error("not leader: {0}")]
    NotLeader(String),

    /// Bug-class or unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// File system and socket level failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Local key-value store failures.
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    /// Encoding or decoding of wire frames and persisted records.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
