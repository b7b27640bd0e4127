//! Notification Dispatcher.
//!
//! Keeps a per-user queue of notifications. A notification is stored
//! before it is pushed, so a user with no live connection gets it on the
//! next connect if it is still unread. Delivery is at-least-once; clients
//! de-duplicate by id.

use crate::error::{SyncError, SyncResult};
use crate::registry::{ConnectionId, ConnectionRegistry};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use taskboard_sync_protocol::{now_millis, Notification, NotificationId, ServerMessage, UserId};
use tracing::{debug, info};

/// A request to notify a user, produced by an accepted mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    /// Recipient.
    pub user_id: UserId,
    /// Text to show.
    pub content: String,
}

impl NotificationEvent {
    /// Creates a notification event.
    pub fn new(user_id: UserId, content: impl Into<String>) -> Self {
        Self {
            user_id,
            content: content.into(),
        }
    }
}

/// Per-user notification queues with live push.
#[derive(Debug)]
pub struct NotificationDispatcher {
    registry: Arc<ConnectionRegistry>,
    retention: Duration,
    queues: RwLock<HashMap<UserId, Vec<Notification>>>,
}

impl NotificationDispatcher {
    /// Creates a dispatcher that keeps notifications for `retention`.
    pub fn new(registry: Arc<ConnectionRegistry>, retention: Duration) -> Self {
        Self {
            registry,
            retention,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a notification, stores it, and pushes it to every live
    /// connection of the recipient.
    pub fn create(&self, user_id: UserId, content: impl Into<String>) -> Notification {
        let notification = Notification::new(user_id, content, now_millis());
        self.queues
            .write()
            .entry(notification.user_id.clone())
            .or_default()
            .push(notification.clone());

        let connections = self.registry.connections_for_user(&notification.user_id);
        let mut pushed = 0;
        for connection in connections {
            let message = ServerMessage::Notification {
                notification: notification.clone(),
            };
            if self.registry.deliver(connection, message).is_ok() {
                pushed += 1;
            }
        }
        info!(
            user = %notification.user_id,
            id = %notification.id,
            pushed,
            "notification created"
        );
        notification
    }

    /// Handles a notification event from the mutation path.
    pub fn dispatch(&self, event: NotificationEvent) -> Notification {
        self.create(event.user_id, event.content)
    }

    /// Sends a user's unread notifications to a new connection, at most the
    /// newest `limit` of them. Returns how many were sent.
    pub fn deliver_pending(
        &self,
        connection: ConnectionId,
        user_id: &UserId,
        limit: usize,
    ) -> SyncResult<usize> {
        let unread: Vec<Notification> = self
            .list(user_id)
            .into_iter()
            .filter(|n| !n.is_read)
            .collect();
        let skipped = unread.len().saturating_sub(limit);
        let pending = &unread[skipped..];
        for notification in pending {
            self.registry.deliver(
                connection,
                ServerMessage::Notification {
                    notification: notification.clone(),
                },
            )?;
        }
        debug!(%connection, user = %user_id, sent = pending.len(), skipped, "delivered pending notifications");
        Ok(pending.len())
    }

    /// Marks all of a user's notifications read. Returns how many changed.
    pub fn mark_all_read(&self, user_id: &UserId) -> usize {
        let mut queues = self.queues.write();
        let Some(queue) = queues.get_mut(user_id) else {
            return 0;
        };
        let mut changed = 0;
        for notification in queue.iter_mut().filter(|n| !n.is_read) {
            notification.is_read = true;
            changed += 1;
        }
        changed
    }

    /// Removes one of a user's notifications.
    ///
    /// # Errors
    ///
    /// `NotificationNotFound` if the user has no notification with that id.
    pub fn dismiss(&self, user_id: &UserId, id: NotificationId) -> SyncResult<Notification> {
        let mut queues = self.queues.write();
        let queue = queues
            .get_mut(user_id)
            .ok_or(SyncError::NotificationNotFound(id))?;
        let index = queue
            .iter()
            .position(|n| n.id == id)
            .ok_or(SyncError::NotificationNotFound(id))?;
        let removed = queue.remove(index);
        if queue.is_empty() {
            queues.remove(user_id);
        }
        Ok(removed)
    }

    /// A user's retained notifications, oldest first.
    pub fn list(&self, user_id: &UserId) -> Vec<Notification> {
        self.queues.read().get(user_id).cloned().unwrap_or_default()
    }

    /// Number of unread notifications for a user.
    pub fn unread_count(&self, user_id: &UserId) -> usize {
        self.queues
            .read()
            .get(user_id)
            .map_or(0, |queue| queue.iter().filter(|n| !n.is_read).count())
    }

    /// Drops notifications older than the retention horizon. Returns how
    /// many were dropped.
    pub fn purge_expired(&self, now: u64) -> usize {
        let horizon = u64::try_from(self.retention.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now.saturating_sub(horizon);

        let mut purged = 0;
        let mut queues = self.queues.write();
        queues.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|n| n.created_at >= cutoff);
            purged += before - queue.len();
            !queue.is_empty()
        });
        if purged > 0 {
            debug!(purged, "purged expired notifications");
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskboard_sync_protocol::{Actor, Role};

    fn dispatcher() -> (Arc<ConnectionRegistry>, NotificationDispatcher) {
        let registry = Arc::new(ConnectionRegistry::new(16));
        let dispatcher = NotificationDispatcher::new(registry.clone(), Duration::from_secs(3600));
        (registry, dispatcher)
    }

    #[test]
    fn pushes_to_every_live_connection() {
        let (registry, dispatcher) = dispatcher();
        let (_a, mut rx_a) = registry.register(Actor::new("ursula", Role::Member));
        let (_b, mut rx_b) = registry.register(Actor::new("ursula", Role::Member));
        let (_c, mut rx_c) = registry.register(Actor::new("victor", Role::Member));

        let created = dispatcher.create(UserId::new("ursula"), "You were assigned a task");

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.try_recv().unwrap() {
                ServerMessage::Notification { notification } => assert_eq!(notification, created),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn queued_until_connect() {
        let (registry, dispatcher) = dispatcher();
        let ursula = UserId::new("ursula");
        let created = dispatcher.dispatch(NotificationEvent::new(ursula.clone(), "Assigned"));

        let (id, mut rx) = registry.register(Actor::new("ursula", Role::Member));
        assert_eq!(dispatcher.deliver_pending(id, &ursula, 8).unwrap(), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::Notification {
                notification: created
            }
        );
    }

    #[test]
    fn pending_delivery_skips_read_and_caps() {
        let (registry, dispatcher) = dispatcher();
        let ursula = UserId::new("ursula");
        dispatcher.create(ursula.clone(), "seen");
        dispatcher.mark_all_read(&ursula);
        dispatcher.create(ursula.clone(), "a");
        dispatcher.create(ursula.clone(), "b");
        dispatcher.create(ursula.clone(), "c");

        let (id, mut rx) = registry.register(Actor::new("ursula", Role::Member));
        assert_eq!(dispatcher.deliver_pending(id, &ursula, 2).unwrap(), 2);
        let contents: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|message| match message {
                ServerMessage::Notification { notification } => notification.content,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(contents, vec!["b", "c"]);
    }

    #[test]
    fn mark_all_read_keeps_content_and_ids() {
        let (_, dispatcher) = dispatcher();
        let ursula = UserId::new("ursula");
        let first = dispatcher.create(ursula.clone(), "one");
        let second = dispatcher.create(ursula.clone(), "two");

        assert_eq!(dispatcher.unread_count(&ursula), 2);
        assert_eq!(dispatcher.mark_all_read(&ursula), 2);
        assert_eq!(dispatcher.mark_all_read(&ursula), 0);

        let listed = dispatcher.list(&ursula);
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|n| n.is_read));
        assert_eq!((listed[0].id, listed[0].content.as_str()), (first.id, "one"));
        assert_eq!((listed[1].id, listed[1].content.as_str()), (second.id, "two"));
    }

    #[test]
    fn dismiss_is_scoped_to_owner() {
        let (_, dispatcher) = dispatcher();
        let ursula = UserId::new("ursula");
        let created = dispatcher.create(ursula.clone(), "one");

        assert!(matches!(
            dispatcher.dismiss(&UserId::new("victor"), created.id),
            Err(SyncError::NotificationNotFound(_))
        ));
        assert_eq!(dispatcher.dismiss(&ursula, created.id).unwrap().id, created.id);
        assert!(dispatcher.list(&ursula).is_empty());
    }

    #[test]
    fn purge_expired() {
        let (_, dispatcher) = dispatcher();
        let ursula = UserId::new("ursula");
        dispatcher.create(ursula.clone(), "old");

        assert_eq!(dispatcher.purge_expired(now_millis()), 0);
        assert_eq!(dispatcher.purge_expired(now_millis() + 2 * 3_600_000), 1);
        assert!(dispatcher.list(&ursula).is_empty());
    }
}
