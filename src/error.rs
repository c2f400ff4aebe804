//! Crate-wide error taxonomy.
//!
//! Storage and validation failures are surfaced synchronously to the caller
//! of a lifecycle operation. Sync and reconciliation failures are absorbed
//! by the engine loops and only become visible through the status snapshot.

use thiserror::Error;

/// Errors surfaced by the local store and the lifecycle operations.
#[derive(Debug, Error)]
pub enum PosError {
    /// The local database could not be opened or its lock is poisoned.
    /// Fatal to every dependent operation until resolved.
    #[error("local store unavailable: {0}")]
    StorageUnavailable(String),

    /// A query or transaction against an open local store failed.
    #[error("local store error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Credentials rejected by the remote backend; sync halts until re-login.
    #[error("authentication expired")]
    AuthenticationExpired,

    /// Network-level failure talking to the remote backend. The current
    /// drain cycle halts in place and retries on the next trigger.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// The remote backend rejected the payload structurally.
    #[error("remote rejected request: {0}")]
    RemoteRejected(String),

    /// A lifecycle operation was rejected before touching the queue
    /// (zero-quantity split, move to an occupied table, bad transition).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The referenced record does not exist locally.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl PosError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        PosError::InvalidOperation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        PosError::NotFound(msg.into())
    }
}
