//! Reconciliation client.
//!
//! Keeps a local cache of authoritative entity states plus at most one
//! pending optimistic edit per entity, and reconciles the two as server
//! frames arrive. The local view of an entity is the authoritative state
//! with the pending edit's fields on top.
//!
//! # Reconciliation rules
//!
//! - An update from this user at `base_version + 1` carrying exactly the
//!   proposed fields confirms the pending edit
//! - Any other update discards the pending edit, including one from this
//!   user's other connections; the caller gets a
//!   [`ClientEvent::ConflictNotice`] and the authoritative state wins
//! - `conflict` discards the pending edit the same way; `rejected` rolls it back
//! - `unavailable` keeps the edit pending for [`ReconciliationClient::retry_pending`]
//! - Edits made while a proposal is in flight are merged and proposed once it
//!   resolves, on top of the confirmed state
//! - While a resync is running, aggregate `last_seen` only moves to the
//!   watermark in `resync_complete`, since live updates can overtake
//!   catch-up updates of other entities

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::transport::SyncTransport;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use taskboard_sync_protocol::{
    ClientMessage, EntityFields, EntityId, EntityKind, EntityState, Notification, NotificationId,
    Patch, ServerMessage, Topic, UserId, Version,
};
use tracing::{debug, warn};

/// A local edit the server has not confirmed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOptimisticEdit {
    /// Edited entity.
    pub entity_id: EntityId,
    /// Authoritative version the outstanding proposal was made against.
    pub base_version: Version,
    /// Fields shown locally: the base state with every local edit applied.
    pub proposed_fields: EntityFields,
    /// Patch of the outstanding proposal.
    pub in_flight: Patch,
    /// Fields the outstanding proposal commits if accepted.
    pub in_flight_fields: EntityFields,
    /// Edits made after the proposal was sent, merged.
    pub queued: Option<Patch>,
    /// Request id of the outstanding proposal.
    pub request_id: u64,
}

impl PendingOptimisticEdit {
    /// Every local change this edit carries.
    pub fn discarded(&self) -> Patch {
        let mut patch = self.in_flight.clone();
        if let Some(queued) = &self.queued {
            patch.merge(queued);
        }
        patch
    }
}

/// Something the UI should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The local view of an entity changed.
    Applied {
        /// Entity.
        entity_id: EntityId,
        /// Authoritative version the view is based on.
        version: Version,
        /// True for a local edit, false for server state.
        optimistic: bool,
    },
    /// A local change was committed by the server.
    Confirmed {
        /// Entity.
        entity_id: EntityId,
        /// Committed version.
        version: Version,
    },
    /// Someone else changed the entity first; local changes were discarded.
    ConflictNotice {
        /// Entity.
        entity_id: EntityId,
        /// The local changes that were dropped.
        discarded: Patch,
        /// The state that won.
        current: EntityState,
    },
    /// The server refused a request; any optimistic change was undone.
    RolledBack {
        /// Entity, if the request targeted one.
        entity_id: Option<EntityId>,
        /// Why.
        reason: String,
    },
    /// The server could not commit right now; the request is kept for retry.
    Retryable {
        /// Entity, if the request targeted one.
        entity_id: Option<EntityId>,
        /// Why.
        reason: String,
    },
    /// The entity was deleted or no longer exists.
    Removed {
        /// Entity.
        entity_id: EntityId,
    },
    /// A notification not seen before.
    NotificationReceived(Notification),
    /// A resync finished; the cache has converged.
    Resynced,
    /// The server could not process a frame.
    ServerError {
        /// What went wrong.
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Edit(EntityId),
    Create,
    Delete(EntityId),
}

impl Target {
    fn entity_id(self) -> Option<EntityId> {
        match self {
            Target::Edit(id) | Target::Delete(id) => Some(id),
            Target::Create => None,
        }
    }
}

#[derive(Debug)]
struct Outstanding {
    target: Target,
    message: ClientMessage,
    in_flight: bool,
    unavailable: u32,
}

#[derive(Debug, Default)]
struct ClientState {
    entities: HashMap<EntityId, EntityState>,
    pending: HashMap<EntityId, PendingOptimisticEdit>,
    requests: BTreeMap<u64, Outstanding>,
    subscriptions: BTreeSet<Topic>,
    last_seen: BTreeMap<Topic, Version>,
    // Aggregate topics whose last resync has not completed.
    resyncing: BTreeSet<Topic>,
    inbox: Vec<Notification>,
    next_request_id: u64,
}

impl ClientState {
    fn next_request_id(&mut self) -> u64 {
        self.next_request_id += 1;
        self.next_request_id
    }

    // Caches `entity` unless a newer version is already cached.
    fn absorb(&mut self, entity: &EntityState) -> bool {
        if self
            .entities
            .get(&entity.id)
            .is_some_and(|cached| cached.version >= entity.version)
        {
            return false;
        }
        self.entities.insert(entity.id, entity.clone());
        true
    }

    fn take_pending(&mut self, id: EntityId) -> Option<PendingOptimisticEdit> {
        let pending = self.pending.remove(&id)?;
        self.requests.remove(&pending.request_id);
        Some(pending)
    }

    fn resync_request(&mut self) -> ClientMessage {
        self.resyncing = self
            .subscriptions
            .iter()
            .copied()
            .filter(Topic::is_aggregate)
            .collect();
        let last_seen = self
            .subscriptions
            .iter()
            .map(|topic| {
                let seen = self.last_seen.get(topic).copied().unwrap_or(0);
                // Responses can carry newer versions than any update seen.
                let cached = topic
                    .entity_id()
                    .and_then(|id| self.entities.get(&id))
                    .map_or(0, |state| state.version);
                (*topic, seen.max(cached))
            })
            .collect();
        ClientMessage::Resync { last_seen }
    }
}

/// Client-side counterpart of the sync server.
///
/// Methods take `&self`; state lives behind a lock so a UI thread and a
/// network reader can share one client.
pub struct ReconciliationClient<T> {
    config: ClientConfig,
    transport: Arc<T>,
    state: Mutex<ClientState>,
}

impl<T: SyncTransport> ReconciliationClient<T> {
    /// Creates a client.
    pub fn new(config: ClientConfig, transport: Arc<T>) -> Self {
        Self {
            config,
            transport,
            state: Mutex::new(ClientState::default()),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Seeds the cache with a state loaded out of band. Ignored if a newer
    /// version is already cached.
    pub fn load(&self, entity: EntityState) -> bool {
        self.state.lock().absorb(&entity)
    }

    /// The local view of an entity, pending edit included.
    pub fn get(&self, id: EntityId) -> Option<EntityState> {
        let state = self.state.lock();
        let mut entity = state.entities.get(&id)?.clone();
        if let Some(pending) = state.pending.get(&id) {
            entity.fields = pending.proposed_fields.clone();
        }
        Some(entity)
    }

    /// The last authoritative state received for an entity.
    pub fn authoritative(&self, id: EntityId) -> Option<EntityState> {
        self.state.lock().entities.get(&id).cloned()
    }

    /// Local view of every live entity of `kind`, by id.
    pub fn entities(&self, kind: EntityKind) -> Vec<EntityState> {
        let state = self.state.lock();
        let mut entities: Vec<EntityState> = state
            .entities
            .values()
            .filter(|e| !e.deleted && e.kind() == kind)
            .map(|e| {
                let mut view = e.clone();
                if let Some(pending) = state.pending.get(&e.id) {
                    view.fields = pending.proposed_fields.clone();
                }
                view
            })
            .collect();
        entities.sort_by_key(|e| e.id);
        entities
    }

    /// The pending edit of an entity, if any.
    pub fn pending(&self, id: EntityId) -> Option<PendingOptimisticEdit> {
        self.state.lock().pending.get(&id).cloned()
    }

    /// Number of entities with a pending edit.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Highest revision observed on a topic.
    pub fn last_seen(&self, topic: Topic) -> Option<Version> {
        self.state.lock().last_seen.get(&topic).copied()
    }

    /// Starts following a topic.
    pub fn subscribe(&self, topic: Topic) -> ClientResult<()> {
        self.state.lock().subscriptions.insert(topic);
        self.transport.send(&ClientMessage::Subscribe { topic })
    }

    /// Stops following a topic.
    pub fn unsubscribe(&self, topic: Topic) -> ClientResult<()> {
        {
            let mut state = self.state.lock();
            state.subscriptions.remove(&topic);
            state.last_seen.remove(&topic);
        }
        self.transport.send(&ClientMessage::Unsubscribe { topic })
    }

    /// Applies a local edit immediately and proposes it.
    ///
    /// If a proposal for this entity is already in flight, the edit is
    /// merged into the queued patch and sent once that proposal resolves.
    /// While offline the edit stays pending and goes out on reconnect.
    pub fn edit(&self, id: EntityId, patch: Patch) -> ClientResult<ClientEvent> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let base = state.entities.get(&id).ok_or(ClientError::UnknownEntity(id))?;
        if base.deleted {
            return Err(ClientError::EntityDeleted(id));
        }
        let changes = patch.validate(base.kind())?;

        if let Some(pending) = state.pending.get_mut(&id) {
            pending.proposed_fields = pending.proposed_fields.apply(&changes)?;
            pending.queued.get_or_insert_with(Patch::new).merge(&patch);
            debug!(%id, "edit queued behind in-flight proposal");
            return Ok(ClientEvent::Applied {
                entity_id: id,
                version: pending.base_version,
                optimistic: true,
            });
        }

        let base_version = base.version;
        let proposed_fields = base.fields.apply(&changes)?;
        let request_id = state.next_request_id();
        state.pending.insert(
            id,
            PendingOptimisticEdit {
                entity_id: id,
                base_version,
                in_flight_fields: proposed_fields.clone(),
                proposed_fields,
                in_flight: patch.clone(),
                queued: None,
                request_id,
            },
        );
        let message = ClientMessage::Propose {
            request_id: Some(request_id),
            entity_id: id,
            expected_version: base_version,
            patch,
        };
        self.submit(state, request_id, Target::Edit(id), message);

        Ok(ClientEvent::Applied {
            entity_id: id,
            version: base_version,
            optimistic: true,
        })
    }

    /// Requests creation of a task or lane. The entity appears once the
    /// server accepts it. Returns the request id.
    pub fn create(&self, kind: EntityKind, patch: Patch) -> ClientResult<u64> {
        EntityFields::create(kind, &patch, &self.config.user_id)?;

        let mut state = self.state.lock();
        let request_id = state.next_request_id();
        let message = ClientMessage::Create {
            request_id: Some(request_id),
            kind,
            patch,
        };
        self.submit(&mut state, request_id, Target::Create, message);
        Ok(request_id)
    }

    /// Requests deletion of an entity at its authoritative version.
    /// Returns the request id.
    pub fn delete(&self, id: EntityId) -> ClientResult<u64> {
        let mut state = self.state.lock();
        let entity = state.entities.get(&id).ok_or(ClientError::UnknownEntity(id))?;
        if entity.deleted {
            return Err(ClientError::EntityDeleted(id));
        }
        let expected_version = entity.version;

        let request_id = state.next_request_id();
        let message = ClientMessage::Delete {
            request_id: Some(request_id),
            entity_id: id,
            expected_version,
        };
        self.submit(&mut state, request_id, Target::Delete(id), message);
        Ok(request_id)
    }

    /// Merges one server frame into local state.
    pub fn handle_message(&self, message: ServerMessage) -> Vec<ClientEvent> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut events = Vec::new();

        match message {
            ServerMessage::Accepted {
                request_id, state: entity, ..
            } => self.on_accepted(state, request_id, entity, &mut events),
            ServerMessage::Conflict {
                request_id, state: entity, ..
            } => self.on_conflict(state, request_id, entity, &mut events),
            ServerMessage::Rejected {
                request_id,
                entity_id,
                reason,
            } => {
                let target = request_id.and_then(|r| state.requests.remove(&r)).map(|o| o.target);
                if let Some(Target::Edit(id)) = target {
                    state.pending.remove(&id);
                }
                events.push(ClientEvent::RolledBack {
                    entity_id: target.and_then(Target::entity_id).or(entity_id),
                    reason,
                });
            }
            ServerMessage::Unavailable {
                request_id,
                entity_id,
                reason,
            } => self.on_unavailable(state, request_id, entity_id, reason, &mut events),
            ServerMessage::Update {
                topic,
                state: entity,
                revision,
                actor,
                ..
            } => self.on_update(state, topic, entity, revision, actor, &mut events),
            ServerMessage::Notification { notification } => {
                if !state.inbox.iter().any(|n| n.id == notification.id) {
                    state.inbox.push(notification.clone());
                    events.push(ClientEvent::NotificationReceived(notification));
                }
            }
            ServerMessage::Gone { topic } => {
                state.subscriptions.remove(&topic);
                state.last_seen.remove(&topic);
                if let Some(id) = topic.entity_id() {
                    state.take_pending(id);
                    state.entities.remove(&id);
                    events.push(ClientEvent::Removed { entity_id: id });
                }
            }
            ServerMessage::ResyncComplete { watermarks } => {
                for (topic, watermark) in watermarks {
                    if state.subscriptions.contains(&topic) {
                        state.last_seen.insert(topic, watermark);
                    }
                }
                state.resyncing.clear();
                events.push(ClientEvent::Resynced);
            }
            ServerMessage::HeartbeatAck => {}
            ServerMessage::Error { message } => {
                warn!(%message, "server error");
                events.push(ClientEvent::ServerError { message });
            }
        }
        events
    }

    /// The `resync` frame for every followed topic.
    ///
    /// Until `resync_complete` arrives, updates on aggregate topics no
    /// longer advance their `last_seen`.
    pub fn resync_request(&self) -> ClientMessage {
        self.state.lock().resync_request()
    }

    /// Marks the connection as lost.
    ///
    /// Nothing is in flight any more. Creates whose outcome is unknown are
    /// dropped rather than re-sent, since a retry could create a duplicate;
    /// if the create did commit, the resync brings the entity in.
    pub fn on_disconnect(&self) -> Vec<ClientEvent> {
        let mut state = self.state.lock();
        let mut events = Vec::new();
        state.requests.retain(|_, outstanding| {
            if outstanding.in_flight && outstanding.target == Target::Create {
                events.push(ClientEvent::RolledBack {
                    entity_id: None,
                    reason: "connection lost before the create was acknowledged".into(),
                });
                return false;
            }
            outstanding.in_flight = false;
            true
        });
        events
    }

    /// Sends the `hello` frame that opens a connection.
    pub fn open(&self) -> ClientResult<()> {
        self.transport.send(&self.config.hello())
    }

    /// Frames to send after reconnecting: `hello`, the `resync`, then every
    /// outstanding request in the order it was made.
    pub fn reconnect_messages(&self) -> Vec<ClientMessage> {
        let mut state = self.state.lock();
        let mut messages = vec![self.config.hello(), state.resync_request()];
        messages.extend(state.requests.values().map(|o| o.message.clone()));
        messages
    }

    /// Sends [`reconnect_messages`](Self::reconnect_messages) over the
    /// transport.
    pub fn reconnect(&self) -> ClientResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.transport.send(&self.config.hello())?;
        self.transport.send(&state.resync_request())?;
        for outstanding in state.requests.values_mut() {
            self.transport.send(&outstanding.message)?;
            outstanding.in_flight = true;
        }
        debug!(requests = state.requests.len(), "reconnected");
        Ok(())
    }

    /// Re-sends every request that is not in flight (never sent, or
    /// answered with `unavailable`). Returns how many were sent.
    pub fn retry_pending(&self) -> ClientResult<usize> {
        let mut state = self.state.lock();
        let mut sent = 0;
        for outstanding in state.requests.values_mut().filter(|o| !o.in_flight) {
            self.transport.send(&outstanding.message)?;
            outstanding.in_flight = true;
            sent += 1;
        }
        Ok(sent)
    }

    /// How long to wait before the next [`retry_pending`](Self::retry_pending),
    /// or `None` if nothing is waiting.
    pub fn next_retry_delay(&self) -> Option<Duration> {
        let state = self.state.lock();
        state
            .requests
            .values()
            .filter(|o| !o.in_flight)
            .map(|o| o.unavailable)
            .max()
            .map(|attempt| self.config.retry.delay_for_attempt(attempt))
    }

    /// Sends a heartbeat.
    pub fn heartbeat(&self) -> ClientResult<()> {
        self.transport.send(&ClientMessage::Heartbeat)
    }

    /// Sends a heartbeat every `heartbeat_interval` until a send fails.
    pub async fn keep_alive(&self) -> ClientError {
        // `interval` rejects a zero period.
        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = self.heartbeat() {
                debug!(error = %err, "heartbeats stopped");
                return err;
            }
        }
    }

    /// The notification inbox, oldest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.state.lock().inbox.clone()
    }

    /// Number of unread notifications.
    pub fn unread_count(&self) -> usize {
        self.state.lock().inbox.iter().filter(|n| !n.is_read).count()
    }

    /// Marks every notification read, locally and on the server. Returns
    /// how many changed locally.
    pub fn mark_all_read(&self) -> ClientResult<usize> {
        let changed = {
            let mut state = self.state.lock();
            let mut changed = 0;
            for notification in state.inbox.iter_mut().filter(|n| !n.is_read) {
                notification.is_read = true;
                changed += 1;
            }
            changed
        };
        self.transport.send(&ClientMessage::MarkAllRead)?;
        Ok(changed)
    }

    /// Removes a notification, locally and on the server.
    pub fn dismiss(&self, id: NotificationId) -> ClientResult<()> {
        {
            let mut state = self.state.lock();
            let index = state
                .inbox
                .iter()
                .position(|n| n.id == id)
                .ok_or(ClientError::UnknownNotification(id))?;
            state.inbox.remove(index);
        }
        self.transport.send(&ClientMessage::Dismiss {
            notification_id: id,
        })
    }

    fn user_id(&self) -> &UserId {
        &self.config.user_id
    }

    // Sends a request and tracks it until the server answers.
    fn submit(&self, state: &mut ClientState, request_id: u64, target: Target, message: ClientMessage) {
        let in_flight = match self.transport.send(&message) {
            Ok(()) => true,
            Err(err) => {
                debug!(request_id, error = %err, "request kept for later");
                false
            }
        };
        state.requests.insert(
            request_id,
            Outstanding {
                target,
                message,
                in_flight,
                unavailable: 0,
            },
        );
    }

    fn on_accepted(
        &self,
        state: &mut ClientState,
        request_id: Option<u64>,
        entity: EntityState,
        events: &mut Vec<ClientEvent>,
    ) {
        let target = request_id.and_then(|r| state.requests.remove(&r)).map(|o| o.target);
        let changed = state.absorb(&entity);

        match target {
            Some(Target::Edit(id)) => {
                if state
                    .pending
                    .get(&id)
                    .is_some_and(|p| Some(p.request_id) == request_id)
                {
                    self.confirm(state, &entity, events);
                }
            }
            Some(Target::Create) => events.push(ClientEvent::Confirmed {
                entity_id: entity.id,
                version: entity.version,
            }),
            Some(Target::Delete(id)) => {
                state.take_pending(id);
                events.push(ClientEvent::Removed { entity_id: id });
            }
            // Already settled by the broadcast of the same commit.
            None if changed => events.push(ClientEvent::Applied {
                entity_id: entity.id,
                version: entity.version,
                optimistic: false,
            }),
            None => {}
        }
    }

    fn on_conflict(
        &self,
        state: &mut ClientState,
        request_id: Option<u64>,
        entity: EntityState,
        events: &mut Vec<ClientEvent>,
    ) {
        let target = request_id.and_then(|r| state.requests.remove(&r)).map(|o| o.target);
        let current = state
            .entities
            .get(&entity.id)
            .filter(|cached| cached.version > entity.version)
            .cloned()
            .unwrap_or_else(|| entity.clone());
        state.absorb(&entity);

        match target {
            Some(Target::Edit(id)) => {
                if let Some(pending) = state.pending.remove(&id) {
                    state.requests.remove(&pending.request_id);
                    events.push(ClientEvent::ConflictNotice {
                        entity_id: id,
                        discarded: pending.discarded(),
                        current,
                    });
                }
            }
            Some(Target::Delete(id)) => events.push(ClientEvent::ConflictNotice {
                entity_id: id,
                discarded: Patch::new(),
                current,
            }),
            Some(Target::Create) | None => {}
        }
    }

    fn on_unavailable(
        &self,
        state: &mut ClientState,
        request_id: Option<u64>,
        entity_id: Option<EntityId>,
        reason: String,
        events: &mut Vec<ClientEvent>,
    ) {
        let max_attempts = self.config.retry.max_attempts;
        let outstanding = match request_id {
            Some(r) => state.requests.get_mut(&r),
            None => None,
        };
        let Some(outstanding) = outstanding else {
            events.push(ClientEvent::Retryable { entity_id, reason });
            return;
        };
        outstanding.in_flight = false;
        outstanding.unavailable += 1;
        let target = outstanding.target;

        if outstanding.unavailable >= max_attempts {
            if let Some(r) = request_id {
                state.requests.remove(&r);
            }
            if let Target::Edit(id) = target {
                state.pending.remove(&id);
            }
            events.push(ClientEvent::RolledBack {
                entity_id: target.entity_id(),
                reason: format!("gave up after {max_attempts} attempts: {reason}"),
            });
        } else {
            events.push(ClientEvent::Retryable {
                entity_id: target.entity_id(),
                reason,
            });
        }
    }

    fn on_update(
        &self,
        state: &mut ClientState,
        topic: Topic,
        entity: EntityState,
        revision: Version,
        actor: Option<UserId>,
        events: &mut Vec<ClientEvent>,
    ) {
        if !state.resyncing.contains(&topic) {
            let seen = state.last_seen.entry(topic).or_insert(0);
            *seen = (*seen).max(revision);
        }

        // Duplicate (another topic, or resync) or stale.
        if !state.absorb(&entity) {
            return;
        }
        let id = entity.id;

        if let Some(pending) = state.pending.get(&id) {
            // Same user is not enough: another device of theirs may have won.
            let own = actor.as_ref() == Some(self.user_id())
                && entity.version == pending.base_version + 1
                && !entity.deleted
                && entity.fields == pending.in_flight_fields;
            if own {
                self.confirm(state, &entity, events);
                return;
            }
            if let Some(pending) = state.take_pending(id) {
                debug!(%id, version = entity.version, "pending edit lost to a concurrent change");
                events.push(ClientEvent::ConflictNotice {
                    entity_id: id,
                    discarded: pending.discarded(),
                    current: entity.clone(),
                });
            }
        }

        if entity.deleted {
            events.push(ClientEvent::Removed { entity_id: id });
        } else {
            events.push(ClientEvent::Applied {
                entity_id: id,
                version: entity.version,
                optimistic: false,
            });
        }
    }

    // Clears the pending edit of `entity` and proposes anything queued
    // behind it on top of the confirmed state.
    fn confirm(&self, state: &mut ClientState, entity: &EntityState, events: &mut Vec<ClientEvent>) {
        let Some(pending) = state.take_pending(entity.id) else {
            return;
        };
        events.push(ClientEvent::Confirmed {
            entity_id: entity.id,
            version: entity.version,
        });

        let Some(queued) = pending.queued else {
            return;
        };
        let proposed = queued
            .validate(entity.kind())
            .and_then(|changes| entity.fields.apply(&changes));
        let proposed_fields = match proposed {
            Ok(fields) if !entity.deleted => fields,
            Ok(_) => {
                events.push(ClientEvent::RolledBack {
                    entity_id: Some(entity.id),
                    reason: "entity deleted".into(),
                });
                return;
            }
            Err(err) => {
                events.push(ClientEvent::RolledBack {
                    entity_id: Some(entity.id),
                    reason: err.to_string(),
                });
                return;
            }
        };

        let request_id = state.next_request_id();
        state.pending.insert(
            entity.id,
            PendingOptimisticEdit {
                entity_id: entity.id,
                base_version: entity.version,
                in_flight_fields: proposed_fields.clone(),
                proposed_fields,
                in_flight: queued.clone(),
                queued: None,
                request_id,
            },
        );
        let message = ClientMessage::Propose {
            request_id: Some(request_id),
            entity_id: entity.id,
            expected_version: entity.version,
            patch: queued,
        };
        self.submit(state, request_id, Target::Edit(entity.id), message);
    }
}
