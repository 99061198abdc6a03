//! Event sources feeding the dispatcher.
//!
//! This module contains:
//! - `EventSource` trait: pattern subscription and publish against an
//!   underlying pub/sub connection
//! - `RawEvent`: the single inbound shape every origin is normalized to
//! - Implementations: in-process memory hub, Redis, and the synthetic
//!   interval timer

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::{SourceConfig, SourceType};

pub mod interval;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use interval::{IntervalSource, INTERVAL_CHANNEL};
pub use memory::{MemoryEventSource, MemoryHub};
#[cfg(feature = "redis")]
pub use self::redis::RedisEventSource;

/// Result type for source operations.
pub type Result<T> = std::result::Result<T, SourceError>;

/// Errors raised by an event source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Source is closed")]
    Closed,

    #[error("Source type '{0}' is not available in this build")]
    Unsupported(String),
}

#[cfg(feature = "redis")]
impl From<::redis::RedisError> for SourceError {
    fn from(e: ::redis::RedisError) -> Self {
        SourceError::Connection(e.to_string())
    }
}

/// An inbound event before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Concrete channel the event was published on.
    pub channel: String,
    /// Pattern that matched, when the source delivers per-pattern copies.
    pub pattern: Option<String>,
    /// Encoded wire payload.
    pub payload: String,
}

impl RawEvent {
    /// Event delivered because `pattern` matched `channel`.
    pub fn from_pattern(
        pattern: impl Into<String>,
        channel: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            pattern: Some(pattern.into()),
            payload: payload.into(),
        }
    }

    /// Event synthesized locally, matched against every registered pattern.
    pub fn local(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            pattern: None,
            payload: payload.into(),
        }
    }
}

/// Notification from a source that is not an event.
#[derive(Debug, Clone)]
pub enum SourceSignal {
    /// An inbound event.
    Event(RawEvent),
    /// The underlying connection dropped or failed to re-establish.
    ConnectionLost(String),
    /// The underlying connection was re-established.
    Reconnected,
}

/// Channel the dispatcher reads inbound signals from.
pub type InboundSink = mpsc::UnboundedSender<SourceSignal>;

/// Underlying pattern pub/sub connection.
///
/// The broker serializes `psubscribe`/`punsubscribe` calls and issues at most
/// one `psubscribe` per distinct pattern, so implementations need not
/// reference-count.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Begin forwarding inbound messages to `sink`.
    async fn start(&self, sink: InboundSink) -> Result<()>;

    /// Start receiving messages on channels matching `pattern`.
    async fn psubscribe(&self, pattern: &str) -> Result<()>;

    /// Stop receiving messages for `pattern`.
    async fn punsubscribe(&self, pattern: &str) -> Result<()>;

    /// Publish an encoded payload on `channel`.
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Release the underlying connection(s). No signals are sent afterwards.
    async fn close(&self) -> Result<()>;
}

/// Initialize an event source based on configuration.
pub async fn init_event_source(config: &SourceConfig) -> Result<Arc<dyn EventSource>> {
    match config.source_type {
        SourceType::Memory => {
            info!(source_type = "memory", "Event source initialized");
            Ok(Arc::new(MemoryEventSource::new(&MemoryHub::new())))
        }
        SourceType::Redis => {
            #[cfg(feature = "redis")]
            {
                let source = RedisEventSource::connect(&config.redis).await?;
                info!(source_type = "redis", url = %config.redis.url, "Event source initialized");
                Ok(Arc::new(source))
            }

            #[cfg(not(feature = "redis"))]
            {
                Err(SourceError::Unsupported("redis".to_string()))
            }
        }
    }
}
