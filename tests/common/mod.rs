//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use keyspace_broker::config::BrokerConfig;
use keyspace_broker::source::{MemoryEventSource, MemoryHub};
use keyspace_broker::{Broker, DecodedEvent, SubscriptionHandle, Transforms};
use tokio::sync::mpsc;

pub type EventRx = mpsc::UnboundedReceiver<Arc<DecodedEvent>>;

/// Build a broker over a fresh memory hub.
///
/// The hub stays with the caller so tests can inject raw notifications.
pub async fn memory_broker(config: BrokerConfig, transforms: Transforms) -> (Broker, MemoryHub) {
    let hub = MemoryHub::new();
    let source = Arc::new(MemoryEventSource::new(&hub));
    let broker = Broker::new(source, config, transforms)
        .await
        .expect("Failed to build broker");
    (broker, hub)
}

/// Subscribe with a handler that forwards each event to a channel.
pub async fn subscribe_channel(broker: &Broker, pattern: &str) -> (SubscriptionHandle, EventRx) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = broker
        .subscribe_fn(pattern, move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                Ok(())
            }
        })
        .await
        .expect("Failed to subscribe");
    (handle, rx)
}

/// Receive the next event, failing the test after `timeout`.
pub async fn recv_within(rx: &mut EventRx, timeout: Duration) -> Arc<DecodedEvent> {
    tokio::time::timeout(timeout, rx.recv())
        .await
        .expect("Timed out waiting for event")
        .expect("Subscriber channel closed")
}

/// Receive the next event within a second.
pub async fn recv(rx: &mut EventRx) -> Arc<DecodedEvent> {
    recv_within(rx, Duration::from_secs(1)).await
}

/// Assert nothing arrives within `window`.
pub async fn assert_quiet(rx: &mut EventRx, window: Duration) {
    if let Ok(Some(event)) = tokio::time::timeout(window, rx.recv()).await {
        panic!("Unexpected event on {}: {:?}", event.channel, event.data);
    }
}
