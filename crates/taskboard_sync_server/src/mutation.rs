//! Mutation Service.
//!
//! The single entry point for changing tasks and lanes. A request is
//! validated first, then version-checked and committed through the
//! [`VersionLedger`]. Accepted mutations are published to subscribers
//! from inside the ledger's commit, and assignment changes notify the new
//! assignee.
//!
//! Conflicts are never merged: the caller gets the current state back and
//! decides what to do with it.

use crate::error::{SyncError, SyncResult};
use crate::fanout::Broadcaster;
use crate::ledger::VersionLedger;
use crate::notifications::{NotificationDispatcher, NotificationEvent};
use crate::store::EntityStore;
use std::sync::Arc;
use taskboard_sync_protocol::{
    Actor, EntityFields, EntityId, EntityKind, EntityState, FieldChanges, Patch, ServerMessage,
    Topic, UserId, Version,
};
use tracing::{debug, info};

/// Result of a mutation request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Committed at `version`.
    Accepted {
        /// New authoritative state.
        state: EntityState,
        /// New version.
        version: Version,
    },
    /// The expected version was stale.
    Conflict {
        /// Current authoritative state.
        state: EntityState,
        /// Current version.
        version: Version,
    },
    /// Refused without touching the ledger.
    Rejected {
        /// Target entity, if any.
        entity_id: Option<EntityId>,
        /// Why.
        reason: String,
    },
}

impl Outcome {
    fn accepted(state: EntityState) -> Self {
        Outcome::Accepted {
            version: state.version,
            state,
        }
    }

    fn conflict(state: EntityState) -> Self {
        Outcome::Conflict {
            version: state.version,
            state,
        }
    }

    fn rejected(entity_id: Option<EntityId>, reason: impl Into<String>) -> Self {
        Outcome::Rejected {
            entity_id,
            reason: reason.into(),
        }
    }

    /// Returns true for `Accepted`.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted { .. })
    }

    /// Converts to the response frame for a request.
    pub fn into_message(self, request_id: Option<u64>) -> ServerMessage {
        match self {
            Outcome::Accepted { state, version } => ServerMessage::Accepted {
                request_id,
                state,
                version,
            },
            Outcome::Conflict { state, version } => ServerMessage::Conflict {
                request_id,
                state,
                version,
            },
            Outcome::Rejected { entity_id, reason } => ServerMessage::Rejected {
                request_id,
                entity_id,
                reason,
            },
        }
    }
}

/// Aggregate topics a create or delete of `kind` publishes to.
pub fn structural_topics(kind: EntityKind) -> Vec<Topic> {
    match kind {
        EntityKind::Task => vec![Topic::TaskList, Topic::KanbanBoard],
        EntityKind::Lane => vec![Topic::KanbanBoard],
    }
}

/// Aggregate topics an update publishes to, by which views it changes.
pub fn update_topics(changes: &FieldChanges) -> Vec<Topic> {
    let mut topics = Vec::with_capacity(2);
    if changes.touches_list() {
        topics.push(Topic::TaskList);
    }
    if changes.touches_board() {
        topics.push(Topic::KanbanBoard);
    }
    topics
}

/// Validates and applies mutations.
pub struct MutationService<S> {
    ledger: Arc<VersionLedger<S>>,
    broadcaster: Broadcaster,
    notifications: Arc<NotificationDispatcher>,
}

impl<S: EntityStore> MutationService<S> {
    /// Creates a mutation service.
    pub fn new(
        ledger: Arc<VersionLedger<S>>,
        broadcaster: Broadcaster,
        notifications: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            ledger,
            broadcaster,
            notifications,
        }
    }

    /// Proposes a patch to an entity at `expected_version`.
    ///
    /// Returns `Err` only for failures the caller may retry unchanged
    /// (store unavailable) or internal faults; every decision about the
    /// request itself is an [`Outcome`].
    pub async fn propose(
        &self,
        entity_id: EntityId,
        expected_version: Version,
        patch: &Patch,
        actor: &Actor,
    ) -> SyncResult<Outcome> {
        let snapshot = match self.ledger.get(entity_id).await {
            Ok(state) => state,
            Err(err) => return settle(Some(entity_id), err),
        };

        let changes = match patch.validate(snapshot.kind()) {
            Ok(changes) => changes,
            Err(err) => return settle(Some(entity_id), err.into()),
        };
        if snapshot.deleted {
            return settle(Some(entity_id), SyncError::EntityDeleted(entity_id));
        }
        if snapshot.version != expected_version {
            debug!(%entity_id, expected_version, current = snapshot.version, "conflict");
            return Ok(Outcome::conflict(snapshot));
        }
        let fields = match snapshot.fields.apply(&changes) {
            Ok(fields) => fields,
            Err(err) => return settle(Some(entity_id), err.into()),
        };

        let previous_assignee = snapshot.fields.assignee().cloned();
        let topics = update_topics(&changes);
        let committed = self
            .ledger
            .compare_and_set(
                entity_id,
                expected_version,
                fields,
                &actor.user_id,
                &topics,
                |event| {
                    self.broadcaster.publish(event);
                },
            )
            .await;

        match committed {
            Ok(state) => {
                info!(%entity_id, version = state.version, actor = %actor.user_id, "accepted");
                self.notify_assignment(previous_assignee.as_ref(), &state, actor);
                Ok(Outcome::accepted(state))
            }
            Err(err) => settle(Some(entity_id), err),
        }
    }

    /// Creates a task or lane. `created_by` is taken from the actor.
    pub async fn create(&self, kind: EntityKind, patch: &Patch, actor: &Actor) -> SyncResult<Outcome> {
        let fields = match EntityFields::create(kind, patch, &actor.user_id) {
            Ok(fields) => fields,
            Err(err) => return settle(None, err.into()),
        };

        let topics = structural_topics(kind);
        let state = self
            .ledger
            .create(fields, &actor.user_id, &topics, |event| {
                self.broadcaster.publish(event);
            })
            .await?;

        info!(entity_id = %state.id, ?kind, actor = %actor.user_id, "created");
        self.notify_assignment(None, &state, actor);
        Ok(Outcome::accepted(state))
    }

    /// Soft-deletes an entity at `expected_version`.
    ///
    /// Lanes may only be deleted by admins and managers.
    pub async fn delete(
        &self,
        entity_id: EntityId,
        expected_version: Version,
        actor: &Actor,
    ) -> SyncResult<Outcome> {
        let snapshot = match self.ledger.get(entity_id).await {
            Ok(state) => state,
            Err(err) => return settle(Some(entity_id), err),
        };

        let kind = snapshot.kind();
        if kind == EntityKind::Lane && !actor.role.can_delete_lanes() {
            return settle(
                Some(entity_id),
                SyncError::Forbidden("only admins and managers may delete lanes".into()),
            );
        }
        if snapshot.deleted {
            return settle(Some(entity_id), SyncError::EntityDeleted(entity_id));
        }
        if snapshot.version != expected_version {
            return Ok(Outcome::conflict(snapshot));
        }

        let topics = structural_topics(kind);
        let committed = self
            .ledger
            .delete(entity_id, expected_version, &actor.user_id, &topics, |event| {
                self.broadcaster.publish(event);
            })
            .await;

        match committed {
            Ok(state) => {
                info!(%entity_id, version = state.version, actor = %actor.user_id, "deleted");
                Ok(Outcome::accepted(state))
            }
            Err(err) => settle(Some(entity_id), err),
        }
    }

    fn notify_assignment(&self, previous: Option<&UserId>, state: &EntityState, actor: &Actor) {
        let Some(assignee) = state.fields.assignee() else {
            return;
        };
        if Some(assignee) == previous || *assignee == actor.user_id {
            return;
        }
        let content = format!(
            "{} assigned you to \"{}\"",
            actor.user_id,
            state.fields.title()
        );
        self.notifications
            .dispatch(NotificationEvent::new(assignee.clone(), content));
    }
}

// Turns request-level failures into outcomes; everything else propagates.
fn settle(entity_id: Option<EntityId>, err: SyncError) -> SyncResult<Outcome> {
    match err {
        SyncError::VersionConflict { current } => Ok(Outcome::conflict(*current)),
        err if err.is_rejection() => {
            debug!(?entity_id, reason = %err, "rejected");
            Ok(Outcome::rejected(entity_id, err.to_string()))
        }
        err => Err(err),
    }
}
