//! Broadcast fan-out.
//!
//! Turns an accepted [`MutationEvent`] into one `update` per subscribed
//! connection and topic. Delivery never blocks: each connection has its
//! own bounded queue, and a connection that cannot take the message is
//! dropped without affecting anyone else.

use crate::ledger::MutationEvent;
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use taskboard_sync_protocol::ServerMessage;
use tracing::{debug, warn};

/// Outcome of publishing one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Messages enqueued.
    pub delivered: usize,
    /// Connections dropped because their queue was full or closed.
    pub dropped: usize,
}

/// Publishes accepted mutations to topic subscribers.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    /// Creates a broadcaster over a registry.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Enqueues an `update` for every subscriber of every topic in `event`.
    ///
    /// Must be called in commit order for each entity; the ledger does this
    /// by publishing under the entity lock.
    pub fn publish(&self, event: &MutationEvent) -> FanoutReport {
        let mut report = FanoutReport::default();

        for (topic, revision) in &event.topics {
            for connection in self.registry.all_subscribers(*topic) {
                let update = ServerMessage::Update {
                    topic: *topic,
                    entity_id: event.entity_id,
                    state: event.state.clone(),
                    version: event.version,
                    revision: *revision,
                    actor: Some(event.actor.clone()),
                };
                match self.registry.deliver(connection, update) {
                    Ok(()) => report.delivered += 1,
                    Err(err) => {
                        warn!(%connection, %topic, error = %err, "dropping update");
                        report.dropped += 1;
                    }
                }
            }
        }

        debug!(
            entity = %event.entity_id,
            version = event.version,
            delivered = report.delivered,
            dropped = report.dropped,
            "published"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskboard_sync_protocol::{
        Actor, EntityFields, EntityId, EntityKind, EntityState, Patch, Role, Topic, UserId,
    };

    fn event(id: EntityId, version: u64, topics: Vec<(Topic, u64)>) -> MutationEvent {
        let fields = EntityFields::create(
            EntityKind::Task,
            &Patch::new().set("title", "Fan out"),
            &UserId::new("alice"),
        )
        .unwrap();
        MutationEvent {
            entity_id: id,
            state: EntityState {
                id,
                fields,
                version,
                updated_at: 0,
                deleted: false,
                last_actor: Some(UserId::new("alice")),
            },
            version,
            actor: UserId::new("alice"),
            topics,
        }
    }

    #[test]
    fn publishes_per_topic() {
        let registry = Arc::new(ConnectionRegistry::new(16));
        let broadcaster = Broadcaster::new(registry.clone());
        let id = EntityId::new();

        let (detail, mut rx_detail) = registry.register(Actor::new("alice", Role::Member));
        let (board, mut rx_board) = registry.register(Actor::new("bob", Role::Member));
        let (_idle, mut rx_idle) = registry.register(Actor::new("carol", Role::Member));
        registry.subscribe(detail, Topic::Entity(id)).unwrap();
        registry.subscribe(board, Topic::KanbanBoard).unwrap();

        let report = broadcaster.publish(&event(
            id,
            4,
            vec![(Topic::Entity(id), 4), (Topic::KanbanBoard, 17)],
        ));
        assert_eq!(report, FanoutReport { delivered: 2, dropped: 0 });

        match rx_board.try_recv().unwrap() {
            ServerMessage::Update {
                topic,
                version,
                revision,
                ..
            } => {
                assert_eq!(topic, Topic::KanbanBoard);
                assert_eq!(version, 4);
                assert_eq!(revision, 17);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            rx_detail.try_recv().unwrap(),
            ServerMessage::Update { revision: 4, .. }
        ));
        assert!(rx_idle.try_recv().is_err());
        assert_eq!(registry.last_seen(board, Topic::KanbanBoard), Some(17));
    }

    #[test]
    fn slow_subscriber_does_not_block_others() {
        let registry = Arc::new(ConnectionRegistry::new(1));
        let broadcaster = Broadcaster::new(registry.clone());
        let id = EntityId::new();
        let topic = Topic::Entity(id);

        let (slow, _rx_slow) = registry.register(Actor::new("alice", Role::Member));
        let (fast, mut rx_fast) = registry.register(Actor::new("bob", Role::Member));
        registry.subscribe(slow, topic).unwrap();
        registry.subscribe(fast, topic).unwrap();

        broadcaster.publish(&event(id, 2, vec![(topic, 2)]));
        assert!(rx_fast.try_recv().is_ok());

        let report = broadcaster.publish(&event(id, 3, vec![(topic, 3)]));
        assert_eq!(report, FanoutReport { delivered: 1, dropped: 1 });
        assert!(!registry.is_connected(slow));
        assert!(matches!(
            rx_fast.try_recv().unwrap(),
            ServerMessage::Update { version: 3, .. }
        ));
    }
}
