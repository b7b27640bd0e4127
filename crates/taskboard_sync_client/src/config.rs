//! Configuration for the reconciliation client.

use std::time::Duration;
use taskboard_sync_protocol::{ClientMessage, Role, UserId};

/// Configuration for a reconciliation client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The signed-in user.
    pub user_id: UserId,
    /// The user's role.
    pub role: Role,
    /// How often to send heartbeats.
    pub heartbeat_interval: Duration,
    /// Retry behavior for requests the server could not commit.
    pub retry: RetryConfig,
}

impl ClientConfig {
    /// Creates a client configuration.
    pub fn new(user_id: impl Into<UserId>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            heartbeat_interval: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// The `hello` frame that opens a connection.
    pub fn hello(&self) -> ClientMessage {
        ClientMessage::Hello {
            user_id: self.user_id.clone(),
            role: self.role,
        }
    }
}

/// Configuration for retrying requests after `unavailable`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per request, the first send included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retry number `attempt` (0 is the first send).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_builder() {
        let config = ClientConfig::new("alice", Role::Manager)
            .with_heartbeat_interval(Duration::from_secs(3))
            .with_retry(RetryConfig::no_retry());

        assert_eq!(config.user_id, UserId::new("alice"));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(
            config.hello(),
            ClientMessage::Hello {
                user_id: UserId::new("alice"),
                role: Role::Manager
            }
        );
    }

    #[test]
    fn backoff_is_capped() {
        let retry = RetryConfig::new(10)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));

        assert_eq!(retry.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(8), Duration::from_millis(500));
    }
}
