//! Error types for the sync server.

use crate::registry::ConnectionId;
use crate::store::StoreError;
use taskboard_sync_protocol::{
    EntityId, EntityState, NotificationId, ProtocolError, ValidationError,
};
use thiserror::Error;

/// Result type for server operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed or forbidden patch. Never retried automatically.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The caller's expected version is stale.
    #[error("version conflict: entity {} is at version {}", .current.id, .current.version)]
    VersionConflict {
        /// Current authoritative state, for the caller to rebase on.
        current: Box<EntityState>,
    },

    /// Write-through to the entity store failed or timed out.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Delivery to a connection failed; only that connection is affected.
    #[error("connection {0} lost")]
    ConnectionLost(ConnectionId),

    /// No such entity.
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    /// The entity has been soft-deleted.
    #[error("entity deleted: {0}")]
    EntityDeleted(EntityId),

    /// No such notification for this user.
    #[error("notification not found: {0}")]
    NotificationNotFound(NotificationId),

    /// The actor's role does not allow this mutation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Frame could not be decoded or arrived out of sequence.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker task failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub(crate) fn conflict(current: EntityState) -> Self {
        Self::VersionConflict {
            current: Box::new(current),
        }
    }

    /// Returns true if retrying the same request may succeed.
    ///
    /// Only store unavailability qualifies: the ledger was not advanced, so
    /// the same expected version is still valid.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::StoreUnavailable(_))
    }

    /// Returns true if the request was refused without touching any state.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SyncError::Validation(_)
                | SyncError::EntityNotFound(_)
                | SyncError::EntityDeleted(_)
                | SyncError::NotificationNotFound(_)
                | SyncError::Forbidden(_)
        )
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => SyncError::EntityNotFound(id),
            StoreError::Unavailable(message) => SyncError::StoreUnavailable(message),
            StoreError::Conflict { .. } => SyncError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(SyncError::StoreUnavailable("down".into()).is_retryable());
        assert!(!SyncError::Forbidden("members cannot delete lanes".into()).is_retryable());
        assert!(SyncError::Validation(ValidationError::EmptyPatch).is_rejection());
        assert!(!SyncError::ConnectionLost(ConnectionId::from_raw(3)).is_rejection());
    }

    #[test]
    fn store_errors_map() {
        let id = EntityId::new();
        assert!(matches!(
            SyncError::from(StoreError::NotFound(id)),
            SyncError::EntityNotFound(found) if found == id
        ));
        assert!(SyncError::from(StoreError::Unavailable("timeout".into())).is_retryable());
    }
}
