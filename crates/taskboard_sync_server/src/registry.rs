//! Connection Registry.
//!
//! Tracks live sessions: who is behind each connection, which topics it
//! follows, the highest revision delivered per topic, and its outbound
//! queue. Every connection gets its own bounded queue, so a slow consumer
//! only ever hurts itself.
//!
//! Lock order is `connections` then `topics`; a connection's own state
//! lock is always taken last.

use crate::error::{SyncError, SyncResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskboard_sync_protocol::{Actor, ServerMessage, Topic, UserId, Version};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Identifier of a live connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wraps a raw id.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug)]
struct ConnectionState {
    topics: HashSet<Topic>,
    last_seen: HashMap<Topic, Version>,
    last_heartbeat: Instant,
}

#[derive(Debug)]
struct Connection {
    actor: Actor,
    outbound: mpsc::Sender<ServerMessage>,
    state: Mutex<ConnectionState>,
}

/// Registry of live connections and their topic subscriptions.
#[derive(Debug)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    queue_capacity: usize,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    topics: RwLock<HashMap<Topic, HashSet<ConnectionId>>>,
}

impl ConnectionRegistry {
    /// Creates a registry whose connections get `queue_capacity` slots each.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            connections: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a new connection for an authenticated actor.
    ///
    /// Returns the connection id and the receiving end of its outbound
    /// queue; whoever owns the socket drains it.
    pub fn register(&self, actor: Actor) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        info!(%id, user = %actor.user_id, "connection registered");
        let connection = Connection {
            actor,
            outbound: tx,
            state: Mutex::new(ConnectionState {
                topics: HashSet::new(),
                last_seen: HashMap::new(),
                last_heartbeat: Instant::now(),
            }),
        };
        self.connections.write().insert(id, Arc::new(connection));
        (id, rx)
    }

    /// Removes a connection and all of its subscriptions.
    ///
    /// Dropping the entry closes its outbound queue. Returns false if the
    /// connection was already gone.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let mut connections = self.connections.write();
        let Some(connection) = connections.remove(&id) else {
            return false;
        };

        let mut topics = self.topics.write();
        for topic in connection.state.lock().topics.drain() {
            if let Some(subscribers) = topics.get_mut(&topic) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    topics.remove(&topic);
                }
            }
        }
        info!(%id, user = %connection.actor.user_id, "connection unregistered");
        true
    }

    /// Subscribes a connection to a topic. Idempotent.
    pub fn subscribe(&self, id: ConnectionId, topic: Topic) -> SyncResult<()> {
        let connections = self.connections.read();
        let connection = connections.get(&id).ok_or(SyncError::ConnectionLost(id))?;

        self.topics.write().entry(topic).or_default().insert(id);
        connection.state.lock().topics.insert(topic);
        debug!(%id, %topic, "subscribed");
        Ok(())
    }

    /// Unsubscribes a connection from a topic. Idempotent.
    pub fn unsubscribe(&self, id: ConnectionId, topic: Topic) -> SyncResult<()> {
        let connections = self.connections.read();
        let connection = connections.get(&id).ok_or(SyncError::ConnectionLost(id))?;

        let mut topics = self.topics.write();
        if let Some(subscribers) = topics.get_mut(&topic) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                topics.remove(&topic);
            }
        }
        let mut state = connection.state.lock();
        state.topics.remove(&topic);
        state.last_seen.remove(&topic);
        debug!(%id, %topic, "unsubscribed");
        Ok(())
    }

    /// Every connection subscribed to `topic`, in id order.
    pub fn all_subscribers(&self, topic: Topic) -> Vec<ConnectionId> {
        let mut subscribers: Vec<_> = self
            .topics
            .read()
            .get(&topic)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        subscribers.sort();
        subscribers
    }

    /// Topics a connection is subscribed to.
    pub fn topics(&self, id: ConnectionId) -> Vec<Topic> {
        let connections = self.connections.read();
        let mut topics: Vec<_> = connections
            .get(&id)
            .map(|c| c.state.lock().topics.iter().copied().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Every live connection of a user.
    pub fn connections_for_user(&self, user_id: &UserId) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .connections
            .read()
            .iter()
            .filter(|(_, c)| &c.actor.user_id == user_id)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// The actor behind a connection.
    pub fn actor(&self, id: ConnectionId) -> Option<Actor> {
        self.connections.read().get(&id).map(|c| c.actor.clone())
    }

    /// Highest revision delivered to a connection on a topic.
    pub fn last_seen(&self, id: ConnectionId, topic: Topic) -> Option<Version> {
        self.connections
            .read()
            .get(&id)
            .and_then(|c| c.state.lock().last_seen.get(&topic).copied())
    }

    /// Records a heartbeat from a connection.
    pub fn heartbeat(&self, id: ConnectionId) -> SyncResult<()> {
        let connections = self.connections.read();
        let connection = connections.get(&id).ok_or(SyncError::ConnectionLost(id))?;
        connection.state.lock().last_heartbeat = Instant::now();
        Ok(())
    }

    /// Connections whose last heartbeat is older than `timeout` at `now`.
    pub fn stale_connections(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.connections
            .read()
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.state.lock().last_heartbeat) > timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Enqueues a message on a connection's outbound queue without waiting.
    ///
    /// A full or closed queue means the connection cannot keep up: it is
    /// unregistered and `ConnectionLost` is returned. No other connection
    /// is affected.
    pub fn deliver(&self, id: ConnectionId, message: ServerMessage) -> SyncResult<()> {
        let connection = self
            .connections
            .read()
            .get(&id)
            .cloned()
            .ok_or(SyncError::ConnectionLost(id))?;

        let seen = match &message {
            ServerMessage::Update {
                topic, revision, ..
            } => Some((*topic, *revision)),
            _ => None,
        };

        match connection.outbound.try_send(message) {
            Ok(()) => {
                if let Some((topic, revision)) = seen {
                    let mut state = connection.state.lock();
                    let last = state.last_seen.entry(topic).or_insert(0);
                    *last = (*last).max(revision);
                }
                Ok(())
            }
            Err(TrySendError::Full(message)) => {
                warn!(%id, kind = message.kind(), "outbound queue full, dropping connection");
                self.unregister(id);
                Err(SyncError::ConnectionLost(id))
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%id, "outbound queue closed");
                self.unregister(id);
                Err(SyncError::ConnectionLost(id))
            }
        }
    }

    /// Returns true if the connection is registered.
    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.connections.read().contains_key(&id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Returns true if there are no live connections.
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskboard_sync_protocol::{EntityId, Role};

    fn alice() -> Actor {
        Actor::new("alice", Role::Member)
    }

    #[test]
    fn subscribe_and_list() {
        let registry = ConnectionRegistry::new(8);
        let (a, _rx_a) = registry.register(alice());
        let (b, _rx_b) = registry.register(Actor::new("bob", Role::Admin));
        let task = Topic::Entity(EntityId::new());

        registry.subscribe(a, task).unwrap();
        registry.subscribe(b, task).unwrap();
        registry.subscribe(b, Topic::TaskList).unwrap();

        assert_eq!(registry.all_subscribers(task), vec![a, b]);
        assert_eq!(registry.all_subscribers(Topic::TaskList), vec![b]);

        registry.unsubscribe(b, task).unwrap();
        assert_eq!(registry.all_subscribers(task), vec![a]);
        assert!(registry.all_subscribers(Topic::KanbanBoard).is_empty());
    }

    #[test]
    fn unregister_clears_subscriptions() {
        let registry = ConnectionRegistry::new(8);
        let (a, _rx) = registry.register(alice());
        registry.subscribe(a, Topic::KanbanBoard).unwrap();

        assert!(registry.unregister(a));
        assert!(!registry.unregister(a));
        assert!(registry.all_subscribers(Topic::KanbanBoard).is_empty());
        assert!(matches!(
            registry.subscribe(a, Topic::TaskList),
            Err(SyncError::ConnectionLost(_))
        ));
    }

    #[test]
    fn full_queue_drops_only_that_connection() {
        let registry = ConnectionRegistry::new(1);
        let (slow, _rx_slow) = registry.register(alice());
        let (fast, mut rx_fast) = registry.register(Actor::new("bob", Role::Member));

        registry.deliver(slow, ServerMessage::HeartbeatAck).unwrap();
        let err = registry.deliver(slow, ServerMessage::HeartbeatAck).unwrap_err();
        assert!(matches!(err, SyncError::ConnectionLost(id) if id == slow));
        assert!(!registry.is_connected(slow));

        registry.deliver(fast, ServerMessage::HeartbeatAck).unwrap();
        assert_eq!(rx_fast.try_recv().unwrap(), ServerMessage::HeartbeatAck);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn closed_queue_is_connection_lost() {
        let registry = ConnectionRegistry::new(4);
        let (id, rx) = registry.register(alice());
        drop(rx);
        assert!(registry.deliver(id, ServerMessage::HeartbeatAck).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_connections_by_heartbeat() {
        let registry = ConnectionRegistry::new(4);
        let (id, _rx) = registry.register(alice());
        let later = Instant::now() + Duration::from_secs(60);

        assert_eq!(registry.stale_connections(later, Duration::from_secs(30)), vec![id]);
        assert!(registry
            .stale_connections(Instant::now(), Duration::from_secs(30))
            .is_empty());
        registry.heartbeat(id).unwrap();
    }

    #[test]
    fn connections_for_user() {
        let registry = ConnectionRegistry::new(4);
        let (a1, _r1) = registry.register(alice());
        let (_b, _r2) = registry.register(Actor::new("bob", Role::Member));
        let (a2, _r3) = registry.register(alice());

        assert_eq!(registry.connections_for_user(&UserId::new("alice")), vec![a1, a2]);
        assert_eq!(registry.actor(a1).unwrap().role, Role::Member);
    }
}
