//! Version Ledger.
//!
//! The in-memory authoritative cache of every entity's payload and version,
//! and the only place where versions advance. Each entity has its own async
//! lock, held for the whole check / write-through / publish sequence, so
//! unrelated entities never wait on each other.
//!
//! Aggregate topics (`task-list`, `kanban-board`) keep a revision counter
//! and, per member entity, the revision of its last change. Resync uses
//! that index to send one current state per changed entity instead of
//! replaying a log.

use crate::error::{SyncError, SyncResult};
use crate::store::{EntityStore, StoreError, StoreResult};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use taskboard_sync_protocol::{
    now_millis, EntityFields, EntityId, EntityState, Topic, UserId, Version,
};
use tokio::sync::Mutex as SlotLock;
use tracing::{debug, warn};

type Slot = Arc<SlotLock<Option<EntityState>>>;

/// An accepted mutation, ready for fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationEvent {
    /// Entity that changed.
    pub entity_id: EntityId,
    /// New authoritative state.
    pub state: EntityState,
    /// New version.
    pub version: Version,
    /// User behind the mutation.
    pub actor: UserId,
    /// Every topic to publish on with its revision. The entity topic comes first.
    pub topics: Vec<(Topic, Version)>,
}

#[derive(Debug, Default)]
struct AggregateIndex {
    revision: Version,
    members: HashMap<EntityId, Version>,
}

enum Write {
    Replace(EntityFields),
    Delete,
}

/// Authoritative entity cache over an [`EntityStore`].
pub struct VersionLedger<S> {
    store: Arc<S>,
    store_timeout: Duration,
    tombstone_retention: Duration,
    slots: RwLock<HashMap<EntityId, Slot>>,
    // Held while publishing so aggregate revisions reach every queue in order.
    aggregates: Mutex<HashMap<Topic, AggregateIndex>>,
}

impl<S: EntityStore> VersionLedger<S> {
    /// Creates an empty ledger over `store`.
    pub fn new(store: Arc<S>, store_timeout: Duration, tombstone_retention: Duration) -> Self {
        Self {
            store,
            store_timeout,
            tombstone_retention,
            slots: RwLock::new(HashMap::new()),
            aggregates: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the current state of an entity, loading it from the store
    /// if it is not cached.
    pub async fn get(&self, id: EntityId) -> SyncResult<EntityState> {
        self.visit(id, EntityState::clone).await
    }

    /// Runs `f` on the current state while holding the entity lock.
    ///
    /// No mutation of this entity can commit (and so no update for it can
    /// be enqueued) while `f` runs.
    pub async fn visit<R>(&self, id: EntityId, f: impl FnOnce(&EntityState) -> R) -> SyncResult<R> {
        let slot = self.slot(id);
        let mut cached = slot.lock().await;
        let result = self.load(id, &mut cached).await.map(|state| f(state));
        drop(cached);
        if let Err(SyncError::EntityNotFound(_)) = &result {
            self.forget(id, slot);
        }
        result
    }

    /// Creates an entity at version 1 and publishes it via `on_commit`.
    pub async fn create(
        &self,
        fields: EntityFields,
        actor: &UserId,
        aggregates: &[Topic],
        on_commit: impl FnOnce(&MutationEvent),
    ) -> SyncResult<EntityState> {
        let now = now_millis();
        let id = self.call(self.store.create(fields.clone(), actor, now)).await?;
        let state = EntityState {
            id,
            fields,
            version: 1,
            updated_at: now,
            deleted: false,
            last_actor: Some(actor.clone()),
        };

        let slot = self.slot(id);
        let mut cached = slot.lock().await;
        Ok(self.commit(&mut cached, state, actor, aggregates, on_commit))
    }

    /// Replaces the payload if the entity is still at `expected_version`.
    ///
    /// Writes through to the store before the new version becomes visible.
    /// On success `on_commit` runs under the entity lock, so events for one
    /// entity are emitted in version order.
    ///
    /// # Errors
    ///
    /// - `VersionConflict` with the current state if the version is stale
    /// - `EntityDeleted` if the entity is a tombstone
    /// - `StoreUnavailable` if the write-through failed or timed out; the
    ///   ledger is not advanced
    pub async fn compare_and_set(
        &self,
        id: EntityId,
        expected_version: Version,
        fields: EntityFields,
        actor: &UserId,
        aggregates: &[Topic],
        on_commit: impl FnOnce(&MutationEvent),
    ) -> SyncResult<EntityState> {
        self.write(
            id,
            expected_version,
            Write::Replace(fields),
            actor,
            aggregates,
            on_commit,
        )
        .await
    }

    /// Soft-deletes the entity if it is still at `expected_version`.
    ///
    /// The tombstone keeps its last payload, gets a new version, and stays
    /// cached until [`purge_tombstones`](Self::purge_tombstones) drops it.
    pub async fn delete(
        &self,
        id: EntityId,
        expected_version: Version,
        actor: &UserId,
        aggregates: &[Topic],
        on_commit: impl FnOnce(&MutationEvent),
    ) -> SyncResult<EntityState> {
        self.write(id, expected_version, Write::Delete, actor, aggregates, on_commit)
            .await
    }

    /// Current revision of an aggregate topic (0 if nothing was published).
    pub fn revision(&self, topic: Topic) -> Version {
        self.aggregates
            .lock()
            .get(&topic)
            .map_or(0, |index| index.revision)
    }

    /// Entities whose last change on `topic` is newer than `since`, with
    /// that revision, oldest first.
    pub fn changes_since(&self, topic: Topic, since: Version) -> Vec<(EntityId, Version)> {
        let aggregates = self.aggregates.lock();
        let Some(index) = aggregates.get(&topic) else {
            return Vec::new();
        };
        let mut changed: Vec<_> = index
            .members
            .iter()
            .filter(|(_, revision)| **revision > since)
            .map(|(id, revision)| (*id, *revision))
            .collect();
        changed.sort_by_key(|(_, revision)| *revision);
        changed
    }

    /// Revision of the last change to `id` on an aggregate topic.
    pub fn member_revision(&self, topic: Topic, id: EntityId) -> Option<Version> {
        self.aggregates
            .lock()
            .get(&topic)
            .and_then(|index| index.members.get(&id).copied())
    }

    /// Drops tombstones older than the retention window. Returns how many
    /// were dropped. Entities currently locked are left for the next pass.
    pub fn purge_tombstones(&self, now: u64) -> usize {
        let expired: Vec<EntityId> = {
            let mut slots = self.slots.write();
            let expired: Vec<EntityId> = slots
                .iter()
                .filter(|(_, slot)| Arc::strong_count(slot) == 1)
                .filter_map(|(id, slot)| {
                    let cached = slot.try_lock().ok()?;
                    let state = cached.as_ref()?;
                    self.is_expired(state, now).then_some(*id)
                })
                .collect();
            for id in &expired {
                slots.remove(id);
            }
            expired
        };

        if !expired.is_empty() {
            let mut aggregates = self.aggregates.lock();
            for index in aggregates.values_mut() {
                for id in &expired {
                    index.members.remove(id);
                }
            }
            debug!(count = expired.len(), "purged tombstones");
        }
        expired.len()
    }

    /// Number of cached entities, tombstones included.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    async fn write(
        &self,
        id: EntityId,
        expected_version: Version,
        write: Write,
        actor: &UserId,
        aggregates: &[Topic],
        on_commit: impl FnOnce(&MutationEvent),
    ) -> SyncResult<EntityState> {
        let slot = self.slot(id);
        let mut cached = slot.lock().await;

        let current = self.load(id, &mut cached).await?;
        if current.deleted {
            return Err(SyncError::EntityDeleted(id));
        }
        if current.version != expected_version {
            debug!(%id, expected_version, current = current.version, "stale expected version");
            return Err(SyncError::conflict(current.clone()));
        }

        let now = now_millis();
        let mut next = current.clone();
        let written = match write {
            Write::Replace(fields) => {
                let result = self
                    .call(self.store.write_if_version(
                        id,
                        expected_version,
                        fields.clone(),
                        actor,
                        now,
                    ))
                    .await;
                next.fields = fields;
                result
            }
            Write::Delete => {
                next.deleted = true;
                self.call(self.store.soft_delete(id, expected_version, actor, now))
                    .await
            }
        };

        match written {
            Ok(version) => {
                next.version = version;
                next.updated_at = now;
                next.last_actor = Some(actor.clone());
                Ok(self.commit(&mut cached, next, actor, aggregates, on_commit))
            }
            Err(StoreError::Conflict { current, .. }) => {
                // Someone wrote to the store behind the ledger's back.
                warn!(%id, expected_version, stored = current, "store ahead of ledger, reloading");
                *cached = None;
                let fresh = self.load(id, &mut cached).await?;
                Err(SyncError::conflict(fresh.clone()))
            }
            Err(err) => {
                warn!(%id, error = %err, "write-through failed");
                Err(err.into())
            }
        }
    }

    fn commit(
        &self,
        cached: &mut Option<EntityState>,
        state: EntityState,
        actor: &UserId,
        aggregates: &[Topic],
        on_commit: impl FnOnce(&MutationEvent),
    ) -> EntityState {
        let id = state.id;
        let mut topics = Vec::with_capacity(aggregates.len() + 1);
        topics.push((Topic::Entity(id), state.version));

        let mut index = self.aggregates.lock();
        for topic in aggregates.iter().filter(|t| t.is_aggregate()) {
            let entry = index.entry(*topic).or_default();
            entry.revision += 1;
            entry.members.insert(id, entry.revision);
            topics.push((*topic, entry.revision));
        }

        *cached = Some(state.clone());
        let event = MutationEvent {
            entity_id: id,
            version: state.version,
            state,
            actor: actor.clone(),
            topics,
        };
        on_commit(&event);
        drop(index);

        debug!(%id, version = event.version, "committed");
        event.state
    }

    async fn load<'a>(
        &self,
        id: EntityId,
        cached: &'a mut Option<EntityState>,
    ) -> SyncResult<&'a mut EntityState> {
        if cached.is_none() {
            let state = self.call(self.store.read(id)).await?;
            if self.is_expired(&state, now_millis()) {
                return Err(SyncError::EntityNotFound(id));
            }
            *cached = Some(state);
        }
        cached.as_mut().ok_or(SyncError::EntityNotFound(id))
    }

    async fn call<T>(&self, op: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        match tokio::time::timeout(self.store_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "store call timed out after {:?}",
                self.store_timeout
            ))),
        }
    }

    fn is_expired(&self, state: &EntityState, now: u64) -> bool {
        state.deleted
            && u128::from(now.saturating_sub(state.updated_at))
                >= self.tombstone_retention.as_millis()
    }

    fn slot(&self, id: EntityId) -> Slot {
        if let Some(slot) = self.slots.read().get(&id) {
            return slot.clone();
        }
        self.slots.write().entry(id).or_default().clone()
    }

    // Only forgets the slot if nobody else is holding it.
    fn forget(&self, id: EntityId, slot: Slot) {
        let mut slots = self.slots.write();
        drop(slot);
        if slots.get(&id).is_some_and(|s| Arc::strong_count(s) == 1) {
            slots.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEntityStore;
    use taskboard_sync_protocol::{EntityKind, Patch};

    fn ledger() -> (Arc<MemoryEntityStore>, VersionLedger<MemoryEntityStore>) {
        let store = Arc::new(MemoryEntityStore::new());
        let ledger = VersionLedger::new(
            store.clone(),
            Duration::from_millis(200),
            Duration::from_secs(60),
        );
        (store, ledger)
    }

    fn task(title: &str) -> EntityFields {
        EntityFields::create(
            EntityKind::Task,
            &Patch::new().set("title", title),
            &UserId::new("alice"),
        )
        .unwrap()
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }

    const BOTH: [Topic; 2] = [Topic::TaskList, Topic::KanbanBoard];

    #[tokio::test]
    async fn create_and_get() {
        let (store, ledger) = ledger();
        let state = ledger.create(task("A"), &alice(), &BOTH, |_| {}).await.unwrap();

        assert_eq!(state.version, 1);
        assert_eq!(ledger.get(state.id).await.unwrap(), state);
        assert_eq!(store.get(&state.id).unwrap().version, 1);
        assert_eq!(ledger.revision(Topic::TaskList), 1);
    }

    #[tokio::test]
    async fn compare_and_set_advances_version() {
        let (_, ledger) = ledger();
        let state = ledger.create(task("A"), &alice(), &[], |_| {}).await.unwrap();

        let mut events = Vec::new();
        let next = ledger
            .compare_and_set(state.id, 1, task("B"), &alice(), &[Topic::TaskList], |e| {
                events.push(e.clone())
            })
            .await
            .unwrap();

        assert_eq!(next.version, 2);
        assert_eq!(next.fields.title(), "B");
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].topics,
            vec![(Topic::Entity(state.id), 2), (Topic::TaskList, 1)]
        );
    }

    #[tokio::test]
    async fn stale_version_conflicts_with_current_state() {
        let (_, ledger) = ledger();
        let state = ledger.create(task("A"), &alice(), &[], |_| {}).await.unwrap();
        ledger
            .compare_and_set(state.id, 1, task("B"), &alice(), &[], |_| {})
            .await
            .unwrap();

        let err = ledger
            .compare_and_set(state.id, 1, task("C"), &alice(), &[], |_| {})
            .await
            .unwrap_err();
        match err {
            SyncError::VersionConflict { current } => {
                assert_eq!(current.version, 2);
                assert_eq!(current.fields.title(), "B");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_writers_single_winner() {
        let (_, ledger) = ledger();
        let ledger = Arc::new(ledger);
        let state = ledger.create(task("A"), &alice(), &[], |_| {}).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .compare_and_set(state.id, 1, task(&format!("T{i}")), &alice(), &[], |_| {})
                    .await
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(SyncError::VersionConflict { current }) => assert_eq!(current.version, 2),
                Err(other) => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(ledger.get(state.id).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn store_outage_does_not_advance() {
        let (store, ledger) = ledger();
        let state = ledger.create(task("A"), &alice(), &[], |_| {}).await.unwrap();

        store.set_available(false);
        let mut published = false;
        let err = ledger
            .compare_and_set(state.id, 1, task("B"), &alice(), &[], |_| published = true)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!published);

        store.set_available(true);
        let next = ledger
            .compare_and_set(state.id, 1, task("B"), &alice(), &[], |_| {})
            .await
            .unwrap();
        assert_eq!(next.version, 2);
    }

    #[tokio::test]
    async fn slow_store_times_out() {
        let (store, ledger) = ledger();
        let state = ledger.create(task("A"), &alice(), &[], |_| {}).await.unwrap();

        store.set_latency(Duration::from_secs(2));
        let err = ledger
            .compare_and_set(state.id, 1, task("B"), &alice(), &[], |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn read_through_and_external_writer() {
        let (store, ledger) = ledger();
        let id = store.create(task("A"), &alice(), 1).await.unwrap();

        assert_eq!(ledger.get(id).await.unwrap().version, 1);

        // Another process bumps the stored version behind the cache.
        let mut external = store.get(&id).unwrap();
        external.version = 5;
        store.insert(external);

        let err = ledger
            .compare_and_set(id, 1, task("B"), &alice(), &[], |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::VersionConflict { ref current } if current.version == 5));
    }

    #[tokio::test]
    async fn unknown_entity() {
        let (_, ledger) = ledger();
        let id = EntityId::new();
        assert!(matches!(
            ledger.get(id).await,
            Err(SyncError::EntityNotFound(found)) if found == id
        ));
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn delete_leaves_tombstone_until_purge() {
        let store = Arc::new(MemoryEntityStore::new());
        let ledger = VersionLedger::new(store, Duration::from_secs(1), Duration::ZERO);
        let state = ledger.create(task("A"), &alice(), &BOTH, |_| {}).await.unwrap();

        let tombstone = ledger.delete(state.id, 1, &alice(), &BOTH, |_| {}).await.unwrap();
        assert!(tombstone.deleted);
        assert_eq!(tombstone.version, 2);
        assert!(matches!(
            ledger.compare_and_set(state.id, 2, task("B"), &alice(), &[], |_| {}).await,
            Err(SyncError::EntityDeleted(_))
        ));

        assert_eq!(ledger.purge_tombstones(now_millis() + 1), 1);
        assert!(ledger.changes_since(Topic::TaskList, 0).is_empty());
        // The store still holds the tombstone, but it is past retention.
        assert!(matches!(
            ledger.get(state.id).await,
            Err(SyncError::EntityNotFound(_))
        ));
    }

    #[tokio::test]
    async fn changes_since_reports_latest_revision_once() {
        let (_, ledger) = ledger();
        let a = ledger.create(task("A"), &alice(), &BOTH, |_| {}).await.unwrap();
        let b = ledger.create(task("B"), &alice(), &BOTH, |_| {}).await.unwrap();
        ledger
            .compare_and_set(a.id, 1, task("A2"), &alice(), &[Topic::TaskList], |_| {})
            .await
            .unwrap();

        assert_eq!(ledger.revision(Topic::TaskList), 3);
        assert_eq!(ledger.changes_since(Topic::TaskList, 1), vec![(b.id, 2), (a.id, 3)]);
        assert_eq!(ledger.changes_since(Topic::KanbanBoard, 1), vec![(b.id, 2)]);
        assert_eq!(ledger.member_revision(Topic::TaskList, a.id), Some(3));
    }
}
