//! Test utilities and mock implementations.
//!
//! Handlers that count, forward or fail, and an event source wrapper that
//! records the pattern subscribe calls it receives.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, RwLock};

use crate::broker::{BrokerError, DecodedEvent, EventHandler, Result as BrokerResult};
use crate::source::{EventSource, InboundSink, MemoryEventSource, MemoryHub, Result};

/// Handler that forwards every event to an mpsc channel.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<Arc<DecodedEvent>>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Arc<DecodedEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventHandler for ChannelHandler {
    fn handle(&self, event: Arc<DecodedEvent>) -> BoxFuture<'static, BrokerResult<()>> {
        let tx = self.tx.clone();
        Box::pin(async move {
            let _ = tx.send(event);
            Ok(())
        })
    }
}

/// Handler that counts invocations.
#[derive(Default)]
pub struct CountingHandler {
    count: Arc<AtomicUsize>,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.count)
    }
}

impl EventHandler for CountingHandler {
    fn handle(&self, _event: Arc<DecodedEvent>) -> BoxFuture<'static, BrokerResult<()>> {
        let count = Arc::clone(&self.count);
        Box::pin(async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Handler that always fails.
pub struct FailingHandler;

impl EventHandler for FailingHandler {
    fn handle(&self, _event: Arc<DecodedEvent>) -> BoxFuture<'static, BrokerResult<()>> {
        Box::pin(async { Err(BrokerError::Subscriber("intentional failure".to_string())) })
    }
}

/// Handler that panics inside its future.
pub struct PanickingHandler;

impl EventHandler for PanickingHandler {
    fn handle(&self, _event: Arc<DecodedEvent>) -> BoxFuture<'static, BrokerResult<()>> {
        Box::pin(async { panic!("subscriber exploded") })
    }
}

/// Receive the next event or panic after a second.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Arc<DecodedEvent>>) -> Arc<DecodedEvent> {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("handler channel closed")
}

/// Memory source that records `psubscribe`/`punsubscribe` calls.
pub struct RecordingSource {
    inner: MemoryEventSource,
    calls: RwLock<Vec<String>>,
}

impl RecordingSource {
    pub fn new(hub: &MemoryHub) -> Self {
        Self {
            inner: MemoryEventSource::new(hub),
            calls: RwLock::new(Vec::new()),
        }
    }

    /// Calls in order, as `psubscribe:<pattern>` / `punsubscribe:<pattern>`.
    pub async fn calls(&self) -> Vec<String> {
        self.calls.read().await.clone()
    }
}

#[async_trait]
impl EventSource for RecordingSource {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn start(&self, sink: InboundSink) -> Result<()> {
        self.inner.start(sink).await
    }

    async fn psubscribe(&self, pattern: &str) -> Result<()> {
        self.calls.write().await.push(format!("psubscribe:{}", pattern));
        self.inner.psubscribe(pattern).await
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<()> {
        self.calls.write().await.push(format!("punsubscribe:{}", pattern));
        self.inner.punsubscribe(pattern).await
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        self.inner.publish(channel, payload).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
