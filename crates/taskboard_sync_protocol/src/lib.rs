//! # Taskboard Sync Protocol
//!
//! Wire protocol types and JSON codec for Taskboard real-time sync.
//!
//! This crate provides:
//! - Identifiers (`EntityId`, `NotificationId`, `UserId`) and the caller `Actor`
//! - `Topic` broadcast scopes (per entity, `task-list`, `kanban-board`)
//! - `EntityState` and the typed task/lane field sets
//! - `Patch` validation and application
//! - `ClientMessage` / `ServerMessage` frames and their JSON encoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod entity;
mod error;
mod ids;
mod messages;
mod notification;
mod topic;

pub use entity::{
    EntityFields, EntityKind, EntityState, FieldChanges, LaneChanges, LaneFields, Patch, Priority,
    TaskChanges, TaskFields, TaskStatus, MAX_DESCRIPTION_LEN, MAX_LANE_TITLE_LEN,
    MAX_TASK_TITLE_LEN,
};
pub use error::{ProtocolError, ProtocolResult, ValidationError};
pub use ids::{Actor, EntityId, NotificationId, Role, UserId, Version};
pub use messages::{ClientMessage, ServerMessage};
pub use notification::Notification;
pub use topic::Topic;

/// Returns the current wall-clock time as Unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
