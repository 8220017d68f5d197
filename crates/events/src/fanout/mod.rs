//! Fan-out of published records to live subscriber connections.
//!
//! ## Design
//!
//! - One bounded outbound queue and one delivery task per connection
//! - Publishing snapshots the `active` connections and enqueues; it never awaits
//! - Per-connection FIFO; overflow drops the oldest queued message (newest wins)
//! - Outbound rate per connection is capped by a pacer
//! - Delivery failures close only the affected connection
//!
//! ## Connection lifecycle
//!
//! ```text
//! connecting --handshake ok--> active --error / unsubscribe / budget--> closing --> closed
//! ```

mod connection;
mod manager;
mod queue;
mod transport;

use std::time::Duration;

use thiserror::Error;

use attackmap_core::{ConnectionId, CoreError};

pub use connection::{ConnectionInfo, ConnectionState};
pub use manager::{FanoutManager, SubscriptionHandle};
pub use transport::{ChannelTransport, SubscriberTransport, TransportError};

/// Fan-out tuning.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Maximum number of connections admitted at once.
    pub max_connections: usize,
    /// Outbound messages per second per connection.
    pub max_messages_per_sec: u32,
    /// Outbound queue bound per connection (oldest dropped on overflow).
    pub queue_capacity: usize,
    /// Time allowed for the transport handshake.
    pub handshake_timeout: Duration,
    /// Time allowed for a single delivery attempt.
    pub delivery_timeout: Duration,
    /// Extra attempts after a failed delivery before the connection is closed.
    pub retry_budget: u32,
    /// Pause between delivery retries.
    pub retry_backoff: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_messages_per_sec: 1,
            queue_capacity: 64,
            handshake_timeout: Duration::from_secs(5),
            delivery_timeout: Duration::from_secs(5),
            retry_budget: 2,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl FanoutConfig {
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_rate(mut self, per_sec: u32) -> Self {
        self.max_messages_per_sec = per_sec;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Upper bound on how long a `closing` connection can take to reach `closed`.
    pub fn close_window(&self) -> Duration {
        let attempts = self.retry_budget.saturating_add(1);
        self.delivery_timeout
            .saturating_add(self.retry_backoff)
            .saturating_mul(attempts)
    }
}

/// Fan-out operation error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FanoutError {
    #[error("subscriber limit reached ({max} connections)")]
    CapacityExceeded { max: usize },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

impl From<FanoutError> for CoreError {
    fn from(err: FanoutError) -> Self {
        match err {
            FanoutError::CapacityExceeded { .. } => CoreError::capacity(err.to_string()),
            FanoutError::Handshake(msg) => CoreError::transient(msg),
            FanoutError::UnknownConnection(_) => CoreError::not_found(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_window_covers_every_attempt() {
        let config = FanoutConfig {
            delivery_timeout: Duration::from_millis(400),
            retry_budget: 2,
            retry_backoff: Duration::from_millis(100),
            ..FanoutConfig::default()
        };
        assert_eq!(config.close_window(), Duration::from_millis(1500));
    }

    #[test]
    fn close_window_saturates_on_extreme_settings() {
        let config = FanoutConfig {
            delivery_timeout: Duration::MAX,
            retry_budget: u32::MAX,
            ..FanoutConfig::default()
        };
        assert_eq!(config.close_window(), Duration::MAX);

        let config = FanoutConfig {
            retry_budget: u32::MAX,
            ..FanoutConfig::default()
        };
        assert!(config.close_window() >= config.delivery_timeout);
    }
}
