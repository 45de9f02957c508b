//! Unified error handling for the sync runtime.

use crate::local::StoreError;
use crate::remote::RemoteError;
use stash_engine::MutationId;

/// Errors surfaced by the sync runtime.
///
/// `Clone` because one flush result is shared by every caller waiting on it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    /// Network trouble; the batch stays queued and is retried with backoff.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Permanent validation failure reported by the server for one mutation.
    #[error("Server rejected mutation {mutation_id}: {reason}")]
    ServerRejectedMutation {
        mutation_id: MutationId,
        reason: String,
    },

    /// A remote delete won over a pending local change.
    #[error("Conflict on {key}: {detail}")]
    ConflictDetected { key: String, detail: String },

    /// The server refused the whole batch for a non-transient reason.
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Engine error: {0}")]
    Engine(#[from] stash_engine::Error),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Returns true if the failed call should be retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Transient(msg) => SyncError::TransientNetwork(msg),
            RemoteError::Fatal(msg) => SyncError::Remote(msg),
        }
    }
}

/// Result type alias for the sync runtime.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_map_to_taxonomy() {
        let err: SyncError = RemoteError::Transient("connection reset".into()).into();
        assert!(err.is_transient());

        let err: SyncError = RemoteError::Fatal("unauthorized".into()).into();
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "Remote error: unauthorized");
    }

    #[test]
    fn error_display() {
        let err = SyncError::ServerRejectedMutation {
            mutation_id: "m-1".into(),
            reason: "end before start".into(),
        };
        assert_eq!(
            err.to_string(),
            "Server rejected mutation m-1: end before start"
        );

        let err: SyncError = StoreError::Unavailable("disk full".into()).into();
        assert!(matches!(err, SyncError::Storage(_)));
        assert!(!err.is_transient());
    }
}
