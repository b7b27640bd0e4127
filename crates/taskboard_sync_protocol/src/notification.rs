//! User notifications.

use crate::ids::{NotificationId, UserId};
use serde::{Deserialize, Serialize};

/// A message addressed to one user, e.g. "you were assigned a task".
///
/// Only `is_read` ever changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Server-assigned id, used by clients for de-duplication.
    pub id: NotificationId,
    /// Recipient.
    pub user_id: UserId,
    /// Human-readable text.
    pub content: String,
    /// Whether the recipient has read it.
    pub is_read: bool,
    /// Creation time, Unix milliseconds.
    pub created_at: u64,
}

impl Notification {
    /// Creates an unread notification stamped with `created_at`.
    pub fn new(user_id: UserId, content: impl Into<String>, created_at: u64) -> Self {
        Self {
            id: NotificationId::new(),
            user_id,
            content: content.into(),
            is_read: false,
            created_at,
        }
    }
}
