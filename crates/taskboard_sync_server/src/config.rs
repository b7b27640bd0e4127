//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Capacity of each connection's outbound queue. A connection whose
    /// queue is full is dropped and must resync.
    pub outbound_queue_capacity: usize,
    /// A connection without a heartbeat for this long is torn down.
    pub heartbeat_timeout: Duration,
    /// How often the maintenance task runs.
    pub reap_interval: Duration,
    /// Upper bound on a single entity store call.
    pub store_timeout: Duration,
    /// How long tombstones stay in the ledger after a delete.
    pub tombstone_retention: Duration,
    /// How long notifications are retained before being purged.
    pub notification_retention: Duration,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            outbound_queue_capacity: 256,
            heartbeat_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(5),
            store_timeout: Duration::from_secs(5),
            tombstone_retention: Duration::from_secs(24 * 60 * 60),
            notification_retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }

    /// Sets the outbound queue capacity per connection.
    pub fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity.max(1);
        self
    }

    /// Sets the heartbeat timeout.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Sets the maintenance interval.
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Sets the store call timeout.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Sets the tombstone retention window.
    pub fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }

    /// Sets the notification retention horizon.
    pub fn with_notification_retention(mut self, retention: Duration) -> Self {
        self.notification_retention = retention;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 7878)))
    }
}
