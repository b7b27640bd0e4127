//! Entity store adapter.
//!
//! The durable store is an external collaborator. The sync core only
//! needs create, read, and version-guarded write/soft-delete; the store
//! itself is responsible for durability and for making a single write
//! crash-atomic.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use taskboard_sync_protocol::{EntityFields, EntityId, EntityState, UserId, Version};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by an entity store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The stored version differs from the expected one.
    #[error("store version conflict on {id}: expected {expected}, found {current}")]
    Conflict {
        /// Entity id.
        id: EntityId,
        /// Version the caller expected.
        expected: Version,
        /// Version actually stored.
        current: Version,
    },

    /// No such entity.
    #[error("entity {0} not found in store")]
    NotFound(EntityId),

    /// The store could not be reached.
    #[error("{0}")]
    Unavailable(String),
}

/// Durable create/read/update/delete with optimistic versioning.
///
/// # Invariants
///
/// - `create` stores the entity at version 1
/// - `write_if_version` and `soft_delete` succeed only when the stored
///   version equals `expected_version`, and then return `expected_version + 1`
/// - A soft-deleted entity remains readable with `deleted == true`
pub trait EntityStore: Send + Sync + 'static {
    /// Persists a new entity and returns its id.
    fn create(
        &self,
        fields: EntityFields,
        actor: &UserId,
        now: u64,
    ) -> impl Future<Output = StoreResult<EntityId>> + Send;

    /// Reads the current state of an entity.
    fn read(&self, id: EntityId) -> impl Future<Output = StoreResult<EntityState>> + Send;

    /// Replaces the payload if the stored version matches.
    fn write_if_version(
        &self,
        id: EntityId,
        expected_version: Version,
        fields: EntityFields,
        actor: &UserId,
        now: u64,
    ) -> impl Future<Output = StoreResult<Version>> + Send;

    /// Marks the entity deleted if the stored version matches.
    fn soft_delete(
        &self,
        id: EntityId,
        expected_version: Version,
        actor: &UserId,
        now: u64,
    ) -> impl Future<Output = StoreResult<Version>> + Send;
}

/// An in-memory entity store.
///
/// Used by the CLI when no external store is configured, and by tests,
/// which can simulate outages and slow writes.
#[derive(Debug)]
pub struct MemoryEntityStore {
    entities: RwLock<HashMap<EntityId, EntityState>>,
    available: AtomicBool,
    latency_millis: AtomicU64,
    writes: AtomicU64,
}

impl MemoryEntityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            latency_millis: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Makes every call fail with `Unavailable` while `false`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_millis
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Returns the stored state of an entity, bypassing availability checks.
    pub fn get(&self, id: &EntityId) -> Option<EntityState> {
        self.entities.read().get(id).cloned()
    }

    /// Inserts a state directly, as if written by another process.
    pub fn insert(&self, state: EntityState) {
        self.entities.write().insert(state.id, state);
    }

    /// Number of successful writes (create, write, delete).
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of stored entities, tombstones included.
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    async fn gate(&self) -> StoreResult<()> {
        let latency = self.latency_millis.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }

    fn update(
        &self,
        id: EntityId,
        expected_version: Version,
        now: u64,
        actor: &UserId,
        change: impl FnOnce(&mut EntityState),
    ) -> StoreResult<Version> {
        let mut entities = self.entities.write();
        let state = entities.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if state.version != expected_version {
            return Err(StoreError::Conflict {
                id,
                expected: expected_version,
                current: state.version,
            });
        }
        change(state);
        state.version += 1;
        state.updated_at = now;
        state.last_actor = Some(actor.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(state.version)
    }
}

impl Default for MemoryEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore for MemoryEntityStore {
    async fn create(&self, fields: EntityFields, actor: &UserId, now: u64) -> StoreResult<EntityId> {
        self.gate().await?;
        let id = EntityId::new();
        let state = EntityState {
            id,
            fields,
            version: 1,
            updated_at: now,
            deleted: false,
            last_actor: Some(actor.clone()),
        };
        self.entities.write().insert(id, state);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn read(&self, id: EntityId) -> StoreResult<EntityState> {
        self.gate().await?;
        self.get(&id).ok_or(StoreError::NotFound(id))
    }

    async fn write_if_version(
        &self,
        id: EntityId,
        expected_version: Version,
        fields: EntityFields,
        actor: &UserId,
        now: u64,
    ) -> StoreResult<Version> {
        self.gate().await?;
        self.update(id, expected_version, now, actor, |state| state.fields = fields)
    }

    async fn soft_delete(
        &self,
        id: EntityId,
        expected_version: Version,
        actor: &UserId,
        now: u64,
    ) -> StoreResult<Version> {
        self.gate().await?;
        self.update(id, expected_version, now, actor, |state| state.deleted = true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskboard_sync_protocol::{EntityKind, Patch};

    fn lane(title: &str) -> EntityFields {
        EntityFields::create(
            EntityKind::Lane,
            &Patch::new().set("title", title),
            &UserId::new("alice"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_read_write() {
        let store = MemoryEntityStore::new();
        let alice = UserId::new("alice");

        let id = store.create(lane("Todo"), &alice, 10).await.unwrap();
        let state = store.read(id).await.unwrap();
        assert_eq!(state.version, 1);

        let v = store.write_if_version(id, 1, lane("Doing"), &alice, 20).await.unwrap();
        assert_eq!(v, 2);
        assert_eq!(store.get(&id).unwrap().fields.title(), "Doing");
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn stale_write_conflicts() {
        let store = MemoryEntityStore::new();
        let alice = UserId::new("alice");
        let id = store.create(lane("Todo"), &alice, 10).await.unwrap();
        store.write_if_version(id, 1, lane("A"), &alice, 11).await.unwrap();

        let err = store
            .write_if_version(id, 1, lane("B"), &alice, 12)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::Conflict {
                id,
                expected: 1,
                current: 2
            }
        );
    }

    #[tokio::test]
    async fn soft_delete_keeps_tombstone() {
        let store = MemoryEntityStore::new();
        let alice = UserId::new("alice");
        let id = store.create(lane("Todo"), &alice, 10).await.unwrap();

        assert_eq!(store.soft_delete(id, 1, &alice, 11).await.unwrap(), 2);
        let state = store.read(id).await.unwrap();
        assert!(state.deleted);
        assert_eq!(state.version, 2);
    }

    #[tokio::test]
    async fn offline_store() {
        let store = MemoryEntityStore::new();
        store.set_available(false);
        let err = store.read(EntityId::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.is_empty());
    }
}
