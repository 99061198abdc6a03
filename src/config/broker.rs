//! Broker, event source and tail configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::source::interval::DEFAULT_INTERVAL;

/// Broker lifecycle and delivery configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Arm the synthetic `onInterval` timer.
    pub pubsub_interval: bool,
    /// Period of the interval timer in milliseconds.
    pub interval_ms: u64,
    /// How long `close` waits for queued subscriber work before aborting it.
    pub shutdown_timeout_ms: u64,
    /// Capacity of the failure broadcast channel.
    pub failure_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            pubsub_interval: false,
            interval_ms: DEFAULT_INTERVAL.as_millis() as u64,
            shutdown_timeout_ms: 5000,
            failure_capacity: 256,
        }
    }
}

impl BrokerConfig {
    /// Enable the interval timer.
    pub fn with_interval(mut self, period: Duration) -> Self {
        self.pubsub_interval = true;
        self.interval_ms = period.as_millis() as u64;
        self
    }

    /// Interval timer period.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Subscriber drain timeout used by `close`.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Event source type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// In-process memory hub (no external server).
    Memory,
    /// Redis pub/sub.
    #[default]
    Redis,
}

/// Event source configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Source type discriminator.
    #[serde(rename = "type")]
    pub source_type: SourceType,
    /// Redis-specific configuration.
    pub redis: RedisConfig,
}

/// Redis-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Flags for `CONFIG SET notify-keyspace-events` (e.g. `KEA`).
    /// Left untouched when unset.
    pub notify_keyspace_events: Option<String>,
    /// Connection attempts before giving up at startup.
    pub connect_attempts: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            notify_keyspace_events: None,
            connect_attempts: 30,
        }
    }
}

/// Configuration for the `keyspace-tail` binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    /// Patterns to subscribe to.
    pub patterns: Vec<String>,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            patterns: vec!["*".to_string()],
        }
    }
}
