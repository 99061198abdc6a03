//! In-memory event source for standalone mode.
//!
//! Uses a tokio broadcast channel as the "server": every source attached to
//! the same `MemoryHub` sees every publish, and forwards one copy per
//! matching pattern, mirroring how Redis delivers `pmessage`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{EventSource, InboundSink, RawEvent, Result, SourceError, SourceSignal};
use crate::pattern;

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct HubMessage {
    channel: String,
    payload: String,
}

/// Shared in-process pub/sub "server".
#[derive(Clone)]
pub struct MemoryHub {
    sender: broadcast::Sender<Arc<HubMessage>>,
}

impl MemoryHub {
    /// Create a new hub.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Number of sources currently receiving from this hub.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish directly on the hub, bypassing any broker.
    ///
    /// Stands in for an external writer, e.g. the server emitting a keyspace
    /// notification.
    pub fn inject(&self, channel: impl Into<String>, payload: impl Into<String>) -> usize {
        let message = Arc::new(HubMessage {
            channel: channel.into(),
            payload: payload.into(),
        });
        self.sender.send(message).unwrap_or(0)
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Event source attached to a `MemoryHub`.
pub struct MemoryEventSource {
    hub: MemoryHub,
    patterns: Arc<RwLock<HashSet<String>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MemoryEventSource {
    /// Create a source attached to `hub`.
    pub fn new(hub: &MemoryHub) -> Self {
        Self {
            hub: hub.clone(),
            patterns: Arc::new(RwLock::new(HashSet::new())),
            reader: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Patterns currently subscribed at the source level.
    pub async fn active_patterns(&self) -> Vec<String> {
        let mut patterns: Vec<_> = self.patterns.read().await.iter().cloned().collect();
        patterns.sort();
        patterns
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SourceError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn start(&self, sink: InboundSink) -> Result<()> {
        self.ensure_open()?;

        let mut reader = self.reader.lock().await;
        if reader.is_some() {
            return Ok(());
        }

        let mut receiver = self.hub.sender.subscribe();
        let patterns = Arc::clone(&self.patterns);

        *reader = Some(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        let matching: Vec<String> = patterns
                            .read()
                            .await
                            .iter()
                            .filter(|p| pattern::matches(p, &message.channel))
                            .cloned()
                            .collect();

                        for p in matching {
                            let event =
                                RawEvent::from_pattern(p, &message.channel, &message.payload);
                            if sink.send(SourceSignal::Event(event)).is_err() {
                                debug!("Dispatcher gone, stopping memory reader");
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        error!(skipped = n, "Memory source lagged, skipped messages");
                        let _ = sink.send(SourceSignal::ConnectionLost(format!(
                            "lagged, {} messages skipped",
                            n
                        )));
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Memory hub closed, stopping reader");
                        break;
                    }
                }
            }
        }));

        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<()> {
        self.ensure_open()?;
        self.patterns.write().await.insert(pattern.to_string());
        debug!(pattern = %pattern, "Memory source psubscribed");
        Ok(())
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<()> {
        self.ensure_open()?;
        self.patterns.write().await.remove(pattern);
        debug!(pattern = %pattern, "Memory source punsubscribed");
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        self.ensure_open()?;
        let receivers = self.hub.inject(channel, payload);
        debug!(channel = %channel, receivers = receivers, "Published to memory hub");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        self.patterns.write().await.clear();
        info!("Memory source closed");
        Ok(())
    }
}
