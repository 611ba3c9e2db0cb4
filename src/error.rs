//! Engine-level error type.
//!
//! [`SyncError`] is `Clone` because a single outcome is shared by every
//! caller awaiting a coalesced read or write.

use crate::remote::RemoteError;
use crate::storage::traits::StorageError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("remote store error: {0}")]
    Remote(#[from] RemoteError),

    /// Connectivity is down; the write was handed to the offline queue
    #[error("offline, write for '{key}' queued for replay")]
    Offline { key: String },

    /// The breaker for this key refused the attempt
    #[error("circuit breaker open for '{key}'")]
    CircuitOpen { key: String },

    #[error("no signed-in user")]
    NotSignedIn,

    #[error("local storage error: {0}")]
    Storage(String),

    #[error("offline queue full ({pending} pending, max {max})")]
    QueueFull { pending: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("engine has been torn down")]
    TornDown,
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::QueueFull { pending, max } => SyncError::QueueFull { pending, max },
            other => SyncError::Storage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}
