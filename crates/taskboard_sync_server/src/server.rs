//! Sync server.

use crate::config::ServerConfig;
use crate::error::SyncResult;
use crate::fanout::Broadcaster;
use crate::ledger::VersionLedger;
use crate::mutation::MutationService;
use crate::notifications::NotificationDispatcher;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::session::Session;
use crate::store::EntityStore;
use std::sync::Arc;
use std::time::Instant;
use taskboard_sync_protocol::{now_millis, Actor, ServerMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// What one maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Connections torn down for missing heartbeats.
    pub reaped: usize,
    /// Tombstones dropped from the ledger.
    pub tombstones: usize,
    /// Notifications past the retention horizon.
    pub notifications: usize,
}

/// The real-time sync server.
///
/// Wires the ledger, mutation service, registry, fan-out, and notification
/// dispatcher together over one entity store.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use taskboard_sync_server::{MemoryEntityStore, ServerConfig, SyncServer};
///
/// let store = Arc::new(MemoryEntityStore::new());
/// let server = SyncServer::new(ServerConfig::default(), store);
///
/// // Sessions are opened with `connect` once a socket has said hello.
/// assert!(server.registry().is_empty());
/// ```
pub struct SyncServer<S> {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    ledger: Arc<VersionLedger<S>>,
    mutations: Arc<MutationService<S>>,
    notifications: Arc<NotificationDispatcher>,
}

impl<S: EntityStore> SyncServer<S> {
    /// Creates a server over `store`.
    pub fn new(config: ServerConfig, store: Arc<S>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.outbound_queue_capacity));
        let ledger = Arc::new(VersionLedger::new(
            store,
            config.store_timeout,
            config.tombstone_retention,
        ));
        let notifications = Arc::new(NotificationDispatcher::new(
            registry.clone(),
            config.notification_retention,
        ));
        let mutations = Arc::new(MutationService::new(
            ledger.clone(),
            Broadcaster::new(registry.clone()),
            notifications.clone(),
        ));

        Self {
            config,
            registry,
            ledger,
            mutations,
            notifications,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Returns the version ledger.
    pub fn ledger(&self) -> &Arc<VersionLedger<S>> {
        &self.ledger
    }

    /// Returns the mutation service.
    pub fn mutations(&self) -> &Arc<MutationService<S>> {
        &self.mutations
    }

    /// Returns the notification dispatcher.
    pub fn notifications(&self) -> &Arc<NotificationDispatcher> {
        &self.notifications
    }

    /// Opens a session for an already-authenticated actor.
    ///
    /// The actor's unread notifications are queued on the new connection
    /// before this returns. The caller owns the receiver and must drain it.
    pub fn connect(&self, actor: Actor) -> SyncResult<(Session<S>, mpsc::Receiver<ServerMessage>)> {
        let (id, outbound) = self.registry.register(actor.clone());
        let limit = (self.config.outbound_queue_capacity / 2).max(1);
        self.notifications
            .deliver_pending(id, &actor.user_id, limit)?;

        let session = Session::new(
            id,
            actor,
            self.registry.clone(),
            self.ledger.clone(),
            self.mutations.clone(),
            self.notifications.clone(),
        );
        Ok((session, outbound))
    }

    /// Tears down a connection. Shared state is not touched.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.registry.unregister(id)
    }

    /// Tears down every connection whose last heartbeat is too old.
    pub fn reap_once(&self, now: Instant) -> usize {
        let stale = self
            .registry
            .stale_connections(now, self.config.heartbeat_timeout);
        let mut reaped = 0;
        for id in stale {
            if self.registry.unregister(id) {
                info!(%id, "reaped connection without heartbeat");
                reaped += 1;
            }
        }
        reaped
    }

    /// Runs one maintenance pass: heartbeat reaping, tombstone purge, and
    /// notification expiry.
    pub fn maintain(&self, now: Instant, now_ms: u64) -> MaintenanceReport {
        let report = MaintenanceReport {
            reaped: self.reap_once(now),
            tombstones: self.ledger.purge_tombstones(now_ms),
            notifications: self.notifications.purge_expired(now_ms),
        };
        if report != MaintenanceReport::default() {
            debug!(?report, "maintenance");
        }
        report
    }

    /// Spawns the periodic maintenance task.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(server.config.reap_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                server.maintain(Instant::now(), now_millis());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEntityStore;
    use std::time::Duration;
    use taskboard_sync_protocol::{Role, UserId};

    fn server() -> SyncServer<MemoryEntityStore> {
        let config = ServerConfig::default().with_heartbeat_timeout(Duration::from_secs(30));
        SyncServer::new(config, Arc::new(MemoryEntityStore::new()))
    }

    #[tokio::test]
    async fn connect_delivers_unread_notifications() {
        let server = server();
        server
            .notifications()
            .create(UserId::new("ursula"), "Assigned to you");

        let (session, mut rx) = server.connect(Actor::new("ursula", Role::Member)).unwrap();
        assert!(server.registry().is_connected(session.id()));
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::Notification { .. }
        ));
    }

    #[tokio::test]
    async fn reaper_drops_silent_connections() {
        let server = server();
        let (session, _rx) = server.connect(Actor::new("alice", Role::Member)).unwrap();

        assert_eq!(server.reap_once(Instant::now()), 0);
        let report = server.maintain(Instant::now() + Duration::from_secs(31), now_millis());
        assert_eq!(report.reaped, 1);
        assert!(!server.registry().is_connected(session.id()));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let server = server();
        let (session, _rx) = server.connect(Actor::new("alice", Role::Member)).unwrap();
        assert!(server.disconnect(session.id()));
        assert!(!server.disconnect(session.id()));
    }
}
