//! Error types for the reconciliation client.

use taskboard_sync_protocol::{EntityId, NotificationId, ProtocolError, ValidationError};
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the reconciliation client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The transport has no live connection.
    #[error("not connected to server")]
    NotConnected,

    /// Sending a frame failed.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The local edit is malformed; nothing was sent.
    #[error("invalid edit: {0}")]
    Validation(#[from] ValidationError),

    /// The entity is not in the local cache.
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),

    /// The entity has been deleted.
    #[error("entity {0} is deleted")]
    EntityDeleted(EntityId),

    /// The notification is not in the local inbox.
    #[error("unknown notification {0}")]
    UnknownNotification(NotificationId),
}

impl ClientError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport { retryable, .. } => *retryable,
            ClientError::NotConnected => true,
            _ => false,
        }
    }
}
