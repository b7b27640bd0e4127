//! Serve command implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use taskboard_sync_server::{serve, MemoryEntityStore, ServerConfig, SyncServer};
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Flags of the `serve` command.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub bind: SocketAddr,
    pub queue_capacity: usize,
    pub heartbeat_timeout: u64,
    pub reap_interval: u64,
    pub store_timeout_ms: u64,
    pub tombstone_hours: u64,
    pub notification_days: u64,
}

impl ServeOptions {
    fn config(&self) -> ServerConfig {
        ServerConfig::new(self.bind)
            .with_outbound_queue_capacity(self.queue_capacity)
            .with_heartbeat_timeout(Duration::from_secs(self.heartbeat_timeout))
            .with_reap_interval(Duration::from_secs(self.reap_interval.max(1)))
            .with_store_timeout(Duration::from_millis(self.store_timeout_ms))
            .with_tombstone_retention(Duration::from_secs(
                self.tombstone_hours.saturating_mul(HOUR),
            ))
            .with_notification_retention(Duration::from_secs(
                self.notification_days.saturating_mul(24 * HOUR),
            ))
    }
}

const HOUR: u64 = 60 * 60;

/// Runs the sync server until Ctrl-C.
///
/// Entities live in the in-memory store, so everything is lost on exit.
pub fn run(options: ServeOptions) -> Result<(), Box<dyn std::error::Error>> {
    let config = options.config();
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async move {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let server = Arc::new(SyncServer::new(config, Arc::new(MemoryEntityStore::new())));
        let maintenance = server.spawn_maintenance();

        info!(
            queue_capacity = server.config().outbound_queue_capacity,
            heartbeat_timeout = ?server.config().heartbeat_timeout,
            "starting sync server"
        );
        serve(server.clone(), listener, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

        maintenance.abort();
        info!(connections = server.registry().len(), "stopped");
        Ok::<_, Box<dyn std::error::Error>>(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ServeOptions {
        ServeOptions {
            bind: "127.0.0.1:0".parse().unwrap(),
            queue_capacity: 8,
            heartbeat_timeout: 30,
            reap_interval: 0,
            store_timeout_ms: 250,
            tombstone_hours: 24,
            notification_days: 30,
        }
    }

    #[test]
    fn flags_map_to_config() {
        let config = options().config();
        assert_eq!(config.outbound_queue_capacity, 8);
        assert_eq!(config.reap_interval, Duration::from_secs(1));
        assert_eq!(config.store_timeout, Duration::from_millis(250));
        assert_eq!(config.tombstone_retention, Duration::from_secs(24 * HOUR));
        assert_eq!(
            config.notification_retention,
            Duration::from_secs(30 * 24 * HOUR)
        );
    }

    #[test]
    fn huge_retention_saturates() {
        let config = ServeOptions {
            tombstone_hours: u64::MAX,
            notification_days: u64::MAX / 2,
            ..options()
        }
        .config();
        assert_eq!(config.tombstone_retention, Duration::from_secs(u64::MAX));
        assert_eq!(config.notification_retention, Duration::from_secs(u64::MAX));
    }
}
