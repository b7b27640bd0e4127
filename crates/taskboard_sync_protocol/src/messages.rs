//! Protocol messages for real-time sync.
//!
//! Frames are JSON objects discriminated by a `type` field. One frame is
//! one line on the wire, so [`ClientMessage::encode`] and
//! [`ServerMessage::encode`] never emit newlines.

use crate::entity::{EntityKind, EntityState, Patch};
use crate::error::ProtocolResult;
use crate::ids::{EntityId, NotificationId, Role, UserId, Version};
use crate::notification::Notification;
use crate::topic::Topic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A frame sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First frame on a connection: the externally authenticated identity.
    Hello {
        /// User id.
        user_id: UserId,
        /// User role.
        role: Role,
    },
    /// Proposes a patch to an entity at a known version.
    Propose {
        /// Client correlation id, echoed in the response.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        /// Target entity.
        entity_id: EntityId,
        /// Version the patch was made against.
        expected_version: Version,
        /// Fields to change.
        patch: Patch,
    },
    /// Creates a new task or lane.
    Create {
        /// Client correlation id, echoed in the response.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        /// Kind of entity to create.
        kind: EntityKind,
        /// Initial fields.
        patch: Patch,
    },
    /// Soft-deletes an entity at a known version.
    Delete {
        /// Client correlation id, echoed in the response.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        /// Target entity.
        entity_id: EntityId,
        /// Version the delete was made against.
        expected_version: Version,
    },
    /// Starts receiving updates for a topic.
    Subscribe {
        /// Topic to join.
        topic: Topic,
    },
    /// Stops receiving updates for a topic.
    Unsubscribe {
        /// Topic to leave.
        topic: Topic,
    },
    /// Catches up after a reconnect. Also subscribes to every listed topic.
    Resync {
        /// Highest revision seen per topic.
        last_seen: BTreeMap<Topic, Version>,
    },
    /// Liveness signal.
    Heartbeat,
    /// Marks all of the caller's notifications as read.
    MarkAllRead,
    /// Dismisses one of the caller's notifications.
    Dismiss {
        /// Notification to dismiss.
        notification_id: NotificationId,
    },
}

impl ClientMessage {
    /// Returns the wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Hello { .. } => "hello",
            ClientMessage::Propose { .. } => "propose",
            ClientMessage::Create { .. } => "create",
            ClientMessage::Delete { .. } => "delete",
            ClientMessage::Subscribe { .. } => "subscribe",
            ClientMessage::Unsubscribe { .. } => "unsubscribe",
            ClientMessage::Resync { .. } => "resync",
            ClientMessage::Heartbeat => "heartbeat",
            ClientMessage::MarkAllRead => "mark_all_read",
            ClientMessage::Dismiss { .. } => "dismiss",
        }
    }

    /// Encodes to a single-line JSON frame.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a JSON frame.
    pub fn decode(frame: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(frame)?)
    }
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The mutation was committed.
    Accepted {
        /// Echo of the request id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        /// New authoritative state.
        state: EntityState,
        /// New version.
        version: Version,
    },
    /// The expected version was stale; carries the current state to rebase on.
    Conflict {
        /// Echo of the request id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        /// Current authoritative state.
        state: EntityState,
        /// Current version.
        version: Version,
    },
    /// The request was refused without touching any state. Not retryable.
    Rejected {
        /// Echo of the request id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        /// Target entity, when there is one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_id: Option<EntityId>,
        /// Why.
        reason: String,
    },
    /// The store could not be reached. Retrying with the same version is valid.
    Unavailable {
        /// Echo of the request id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        /// Target entity, when there is one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_id: Option<EntityId>,
        /// Why.
        reason: String,
    },
    /// Authoritative state pushed to a topic subscriber.
    Update {
        /// Topic this update was delivered on.
        topic: Topic,
        /// Entity that changed.
        entity_id: EntityId,
        /// Current state.
        state: EntityState,
        /// Entity version.
        version: Version,
        /// Topic revision; equals `version` on entity topics.
        revision: Version,
        /// User behind the change.
        #[serde(default)]
        actor: Option<UserId>,
    },
    /// A notification for the connected user.
    Notification {
        /// The notification.
        notification: Notification,
    },
    /// The entity behind this topic no longer exists; drop any local copy.
    Gone {
        /// Topic that was asked about.
        topic: Topic,
    },
    /// All catch-up updates for a resync have been sent.
    ResyncComplete {
        /// Revision of each resynced aggregate topic as of its catch-up.
        /// Every change up to it has been delivered, so it is the safe
        /// `last_seen` for the next resync.
        #[serde(default)]
        watermarks: BTreeMap<Topic, Version>,
    },
    /// Reply to a heartbeat.
    HeartbeatAck,
    /// The previous frame could not be processed.
    Error {
        /// What went wrong.
        message: String,
    },
}

impl ServerMessage {
    /// Returns the wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Accepted { .. } => "accepted",
            ServerMessage::Conflict { .. } => "conflict",
            ServerMessage::Rejected { .. } => "rejected",
            ServerMessage::Unavailable { .. } => "unavailable",
            ServerMessage::Update { .. } => "update",
            ServerMessage::Notification { .. } => "notification",
            ServerMessage::Gone { .. } => "gone",
            ServerMessage::ResyncComplete { .. } => "resync_complete",
            ServerMessage::HeartbeatAck => "heartbeat_ack",
            ServerMessage::Error { .. } => "error",
        }
    }

    /// Encodes to a single-line JSON frame.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a JSON frame.
    pub fn decode(frame: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(frame)?)
    }
}
