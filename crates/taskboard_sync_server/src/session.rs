//! Per-connection request handling.
//!
//! A [`Session`] turns decoded client frames into registry, ledger,
//! mutation, and notification calls. Every response goes through the
//! connection's outbound queue, so responses and broadcasts reach the
//! client in the order they were produced.

use crate::error::{SyncError, SyncResult};
use crate::ledger::VersionLedger;
use crate::mutation::{MutationService, Outcome};
use crate::notifications::NotificationDispatcher;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::store::EntityStore;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use taskboard_sync_protocol::{
    Actor, ClientMessage, EntityId, EntityState, ProtocolError, ServerMessage, Topic, Version,
};
use tracing::{debug, info};

/// Handles the frames of one authenticated connection.
pub struct Session<S> {
    id: ConnectionId,
    actor: Actor,
    registry: Arc<ConnectionRegistry>,
    ledger: Arc<VersionLedger<S>>,
    mutations: Arc<MutationService<S>>,
    notifications: Arc<NotificationDispatcher>,
}

impl<S: EntityStore> Session<S> {
    pub(crate) fn new(
        id: ConnectionId,
        actor: Actor,
        registry: Arc<ConnectionRegistry>,
        ledger: Arc<VersionLedger<S>>,
        mutations: Arc<MutationService<S>>,
        notifications: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            id,
            actor,
            registry,
            ledger,
            mutations,
            notifications,
        }
    }

    /// Returns the connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the authenticated actor.
    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    /// Handles one client frame.
    ///
    /// Request outcomes (accepted, conflict, rejected, unavailable) are
    /// sent to the client, not returned. An `Err` means the frame could
    /// not be handled at all; `ConnectionLost` means the session is over.
    pub async fn handle(&self, message: ClientMessage) -> SyncResult<()> {
        debug!(conn = %self.id, kind = message.kind(), "frame");
        match message {
            ClientMessage::Hello { .. } => Err(ProtocolError::UnexpectedMessage {
                expected: "request",
                got: "hello",
            }
            .into()),
            ClientMessage::Propose {
                request_id,
                entity_id,
                expected_version,
                patch,
            } => {
                let mutations = self.mutations.clone();
                let actor = self.actor.clone();
                let result = run(async move {
                    mutations
                        .propose(entity_id, expected_version, &patch, &actor)
                        .await
                })
                .await;
                self.respond(request_id, Some(entity_id), result)
            }
            ClientMessage::Create {
                request_id,
                kind,
                patch,
            } => {
                let mutations = self.mutations.clone();
                let actor = self.actor.clone();
                let result =
                    run(async move { mutations.create(kind, &patch, &actor).await }).await;
                self.respond(request_id, None, result)
            }
            ClientMessage::Delete {
                request_id,
                entity_id,
                expected_version,
            } => {
                let mutations = self.mutations.clone();
                let actor = self.actor.clone();
                let result = run(async move {
                    mutations.delete(entity_id, expected_version, &actor).await
                })
                .await;
                self.respond(request_id, Some(entity_id), result)
            }
            ClientMessage::Subscribe { topic } => self.registry.subscribe(self.id, topic),
            ClientMessage::Unsubscribe { topic } => self.registry.unsubscribe(self.id, topic),
            ClientMessage::Resync { last_seen } => self.resync(last_seen).await,
            ClientMessage::Heartbeat => {
                self.registry.heartbeat(self.id)?;
                self.reply(ServerMessage::HeartbeatAck)
            }
            ClientMessage::MarkAllRead => {
                let changed = self.notifications.mark_all_read(&self.actor.user_id);
                debug!(conn = %self.id, changed, "marked notifications read");
                Ok(())
            }
            ClientMessage::Dismiss { notification_id } => {
                match self
                    .notifications
                    .dismiss(&self.actor.user_id, notification_id)
                {
                    Ok(_) => Ok(()),
                    Err(err) => self.reply(ServerMessage::Rejected {
                        request_id: None,
                        entity_id: None,
                        reason: err.to_string(),
                    }),
                }
            }
        }
    }

    /// Subscribes to every topic in `last_seen` and sends the current state
    /// of whatever changed since, one update per entity.
    ///
    /// Each catch-up update is enqueued under its entity lock, so it can
    /// never overtake a live update for the same entity. Live updates on an
    /// aggregate topic can still overtake catch-up updates of other members,
    /// so `resync_complete` carries the revision each aggregate catch-up
    /// covers.
    async fn resync(&self, last_seen: BTreeMap<Topic, Version>) -> SyncResult<()> {
        let mut sent = 0;
        let mut watermarks = BTreeMap::new();
        for (topic, seen) in last_seen {
            self.registry.subscribe(self.id, topic)?;
            match topic {
                Topic::Entity(id) => {
                    let caught_up = self
                        .ledger
                        .visit(id, |state| {
                            (state.version > seen)
                                .then(|| self.reply(update(topic, state, state.version)))
                        })
                        .await;
                    match caught_up {
                        Ok(Some(delivered)) => {
                            delivered?;
                            sent += 1;
                        }
                        Ok(None) => {}
                        Err(SyncError::EntityNotFound(_)) => {
                            self.registry.unsubscribe(self.id, topic)?;
                            self.reply(ServerMessage::Gone { topic })?;
                        }
                        Err(err) => return Err(err),
                    }
                }
                aggregate => {
                    // Read after subscribing: every later change is delivered live.
                    let watermark = self.ledger.revision(aggregate);
                    // Revisions restart with the process; a client ahead of
                    // us gets everything we know about.
                    let since = if seen > watermark { 0 } else { seen };
                    for (id, _) in self.ledger.changes_since(aggregate, since) {
                        sent += self.catch_up_member(aggregate, id, since).await?;
                    }
                    watermarks.insert(aggregate, watermark);
                }
            }
        }

        info!(conn = %self.id, sent, "resync complete");
        self.reply(ServerMessage::ResyncComplete { watermarks })
    }

    async fn catch_up_member(&self, topic: Topic, id: EntityId, since: Version) -> SyncResult<usize> {
        let caught_up = self
            .ledger
            .visit(id, |state| {
                let revision = self.ledger.member_revision(topic, id)?;
                (revision > since).then(|| self.reply(update(topic, state, revision)))
            })
            .await;
        match caught_up {
            Ok(Some(delivered)) => delivered.map(|()| 1),
            Ok(None) | Err(SyncError::EntityNotFound(_)) => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn respond(
        &self,
        request_id: Option<u64>,
        entity_id: Option<EntityId>,
        result: SyncResult<Outcome>,
    ) -> SyncResult<()> {
        let message = match result {
            Ok(outcome) => outcome.into_message(request_id),
            Err(err) if err.is_retryable() => ServerMessage::Unavailable {
                request_id,
                entity_id,
                reason: err.to_string(),
            },
            Err(err) => return Err(err),
        };
        self.reply(message)
    }

    /// Tells the client its last frame could not be processed.
    pub fn send_error(&self, message: impl Into<String>) -> SyncResult<()> {
        self.reply(ServerMessage::Error {
            message: message.into(),
        })
    }

    fn reply(&self, message: ServerMessage) -> SyncResult<()> {
        self.registry.deliver(self.id, message)
    }
}

// Runs a mutation on its own task so that dropping the session (for
// example on disconnect) cannot cancel a commit halfway.
async fn run(
    mutation: impl Future<Output = SyncResult<Outcome>> + Send + 'static,
) -> SyncResult<Outcome> {
    tokio::spawn(mutation)
        .await
        .map_err(|err| SyncError::Internal(format!("mutation task failed: {err}")))?
}

fn update(topic: Topic, state: &EntityState, revision: Version) -> ServerMessage {
    ServerMessage::Update {
        topic,
        entity_id: state.id,
        state: state.clone(),
        version: state.version,
        revision,
        actor: state.last_actor.clone(),
    }
}
