//! Pattern-matched publish/subscribe broker.
//!
//! This module contains:
//! - `Broker`: publish/subscribe/unsubscribe/close facade over an
//!   `EventSource`
//! - `EventHandler` trait: subscriber callbacks
//! - `DecodedEvent`: the `{data, contextValue}` shape delivered to subscribers
//! - Failure reporting for connection, transform and subscriber errors
//!
//! ## Lifecycle
//! ```text
//! Created --(source started, timer armed)--> Ready --close()--> Closing --> Closed
//! ```

mod dispatch;
mod registry;

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, watch, Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

pub use registry::SubscriptionId;

use crate::config::{BrokerConfig, Config, ConfigError};
use crate::source::{init_event_source, EventSource, IntervalSource, SourceError, SourceSignal};
use crate::transform::{TransformError, Transforms};
use registry::{Registry, Subscription};

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker is closed")]
    Closed,

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Transform failed: {0}")]
    Transform(#[from] TransformError),

    #[error("Subscriber failed: {0}")]
    Subscriber(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<SourceError> for BrokerError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Closed => BrokerError::Closed,
            SourceError::Publish(msg) => BrokerError::Publish(msg),
            SourceError::Subscribe(msg) => BrokerError::Subscribe(msg),
            SourceError::Connection(msg) => BrokerError::Connection(msg),
            SourceError::Unsupported(msg) => {
                BrokerError::Connection(format!("unsupported source: {}", msg))
            }
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Transform(e.into())
    }
}

/// Broker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Created,
    Ready,
    Closing,
    Closed,
}

/// Event delivered to subscribers.
///
/// Serializes to exactly `{"data": ..., "contextValue": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedEvent {
    /// Concrete channel the event arrived on.
    #[serde(skip)]
    pub channel: String,
    /// Pattern that matched, if the source reported one.
    #[serde(skip)]
    pub pattern: Option<String>,
    /// Payload after decoding.
    pub data: Value,
    /// Enrichment result, empty by default.
    #[serde(rename = "contextValue")]
    pub context_value: Map<String, Value>,
}

impl DecodedEvent {
    /// The two-key JSON form consumers depend on.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "data": self.data,
            "contextValue": self.context_value,
        })
    }
}

/// Handler for events delivered to a subscription.
pub trait EventHandler: Send + Sync {
    /// Process one event. Errors are reported, never propagated.
    fn handle(&self, event: Arc<DecodedEvent>) -> BoxFuture<'static, Result<()>>;
}

/// Adapter turning an async closure into an `EventHandler`.
pub struct FnHandler<F>(pub F);

impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<DecodedEvent>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, event: Arc<DecodedEvent>) -> BoxFuture<'static, Result<()>> {
        Box::pin((self.0)(event))
    }
}

/// Lazily consumed sequence of events for one subscription.
pub type EventStream = UnboundedReceiverStream<Arc<DecodedEvent>>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    pattern: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// Category of a reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The underlying connection dropped or could not be restored.
    Connection,
    /// `decode` or `enrich` failed; the event was dropped.
    Transform,
    /// A subscriber callback returned an error or panicked.
    Subscriber,
}

/// A failure observed while the broker was running.
#[derive(Debug, Clone)]
pub struct Failure {
    pub kind: FailureKind,
    pub channel: Option<String>,
    pub subscription: Option<SubscriptionId>,
    pub message: String,
}

/// State shared between the facade, dispatcher and subscriber workers.
pub(crate) struct BrokerShared {
    registry: RwLock<Registry>,
    transforms: Transforms,
    failures: broadcast::Sender<Failure>,
    state: watch::Sender<BrokerState>,
}

impl BrokerShared {
    fn state(&self) -> BrokerState {
        *self.state.borrow()
    }

    fn report(&self, failure: Failure) {
        dispatch::log_failure(&failure);
        // No receivers is fine; the failure has been logged.
        let _ = self.failures.send(failure);
    }
}

struct BrokerInner {
    shared: Arc<BrokerShared>,
    source: Arc<dyn EventSource>,
    config: BrokerConfig,
    timer: Option<IntervalSource>,
    /// Serializes registry mutations with their source-level calls.
    writer: Mutex<()>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    closed: OnceCell<()>,
}

impl Drop for BrokerInner {
    fn drop(&mut self) {
        // Dropped without close(): stop routing so source readers wind down.
        let dispatcher = self
            .dispatcher
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
    }
}

/// Pattern-matched publish/subscribe broker.
///
/// Cheap to clone; clones share the same connection and subscriptions.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Build a broker from application configuration.
    pub async fn connect(config: &Config, transforms: Transforms) -> Result<Self> {
        let source = init_event_source(&config.source).await?;
        Self::new(source, config.broker.clone(), transforms).await
    }

    /// Build a broker over an existing event source.
    ///
    /// Starts the source reader and, when configured, arms the interval
    /// timer. Returns once the broker is `Ready`.
    pub async fn new(
        source: Arc<dyn EventSource>,
        config: BrokerConfig,
        transforms: Transforms,
    ) -> Result<Self> {
        let (failures, _) = broadcast::channel(config.failure_capacity.max(1));
        let (state, _) = watch::channel(BrokerState::Created);

        let shared = Arc::new(BrokerShared {
            registry: RwLock::new(Registry::new()),
            transforms,
            failures,
            state,
        });

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SourceSignal>();
        let dispatcher = tokio::spawn(dispatch::run_dispatcher(Arc::clone(&shared), inbound_rx));

        if let Err(e) = source.start(inbound_tx.clone()).await {
            dispatcher.abort();
            error!(source = source.name(), error = %e, "Failed to start event source");
            return Err(e.into());
        }

        let timer = if config.pubsub_interval {
            let timer = IntervalSource::new(config.interval());
            timer.start(inbound_tx).await;
            Some(timer)
        } else {
            None
        };

        shared.state.send_replace(BrokerState::Ready);
        info!(
            source = source.name(),
            interval = config.pubsub_interval,
            "Broker ready"
        );

        Ok(Self {
            inner: Arc::new(BrokerInner {
                shared,
                source,
                config,
                timer,
                writer: Mutex::new(()),
                dispatcher: StdMutex::new(Some(dispatcher)),
                workers: StdMutex::new(Vec::new()),
                closed: OnceCell::new(),
            }),
        })
    }

    /// Whether both handles refer to the same broker.
    pub fn ptr_eq(&self, other: &Broker) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BrokerState {
        self.inner.shared.state()
    }

    /// Whether the interval timer is armed.
    pub async fn interval_armed(&self) -> bool {
        match &self.inner.timer {
            Some(timer) => timer.is_armed().await,
            None => false,
        }
    }

    /// Receive connection, transform and subscriber failures.
    pub fn failures(&self) -> broadcast::Receiver<Failure> {
        self.inner.shared.failures.subscribe()
    }

    /// Number of distinct patterns with at least one subscription.
    pub async fn pattern_count(&self) -> usize {
        self.inner.shared.registry.read().await.pattern_count()
    }

    /// Number of subscriptions on `pattern`.
    pub async fn subscriber_count(&self, pattern: &str) -> usize {
        self.inner.shared.registry.read().await.subscriber_count(pattern)
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            BrokerState::Ready => Ok(()),
            _ => Err(BrokerError::Closed),
        }
    }

    /// Encode `payload` and publish it on `topic`.
    ///
    /// Returns once the underlying write completes; subscriber processing is
    /// never awaited.
    #[tracing::instrument(name = "broker.publish", skip_all, fields(topic = %topic))]
    pub async fn publish<T: Serialize>(&self, topic: &str, payload: T) -> Result<()> {
        self.ensure_ready()?;

        let value = serde_json::to_value(payload)?;
        let wire = self.inner.shared.transforms.encode(value)?;
        self.inner.source.publish(topic, wire).await?;

        debug!(topic = %topic, "Published");
        Ok(())
    }

    /// Register `handler` for every channel matching `pattern`.
    pub async fn subscribe<H>(&self, pattern: &str, handler: H) -> Result<SubscriptionHandle>
    where
        H: EventHandler + 'static,
    {
        let (queue, rx) = mpsc::unbounded_channel();
        let id = SubscriptionId::new();

        let worker = tokio::spawn(dispatch::run_subscriber(
            Arc::clone(&self.inner.shared),
            id,
            pattern.to_string(),
            Arc::new(handler),
            rx,
        ));

        // Track the worker before releasing the writer so a concurrent
        // close always sees it.
        let _writer = self.inner.writer.lock().await;
        match self.register_locked(pattern, Subscription { id, queue }).await {
            Ok(handle) => {
                let mut workers = self
                    .inner
                    .workers
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                workers.retain(|w| !w.is_finished());
                workers.push(worker);
                Ok(handle)
            }
            Err(e) => {
                worker.abort();
                Err(e)
            }
        }
    }

    /// Register an async closure for every channel matching `pattern`.
    pub async fn subscribe_fn<F, Fut>(&self, pattern: &str, f: F) -> Result<SubscriptionHandle>
    where
        F: Fn(Arc<DecodedEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(pattern, FnHandler(f)).await
    }

    /// Subscribe to `pattern` and consume events as a stream.
    ///
    /// The stream ends after the subscription is removed or the broker closes.
    pub async fn subscribe_stream(
        &self,
        pattern: &str,
    ) -> Result<(SubscriptionHandle, EventStream)> {
        let (queue, rx) = mpsc::unbounded_channel();
        let id = SubscriptionId::new();
        let handle = self.register(pattern, Subscription { id, queue }).await?;
        Ok((handle, UnboundedReceiverStream::new(rx)))
    }

    async fn register(&self, pattern: &str, subscription: Subscription) -> Result<SubscriptionHandle> {
        let _writer = self.inner.writer.lock().await;
        self.register_locked(pattern, subscription).await
    }

    /// Insert a subscription; the caller holds `writer`.
    async fn register_locked(
        &self,
        pattern: &str,
        subscription: Subscription,
    ) -> Result<SubscriptionHandle> {
        self.ensure_ready()?;

        let id = subscription.id;
        let first = self
            .inner
            .shared
            .registry
            .write()
            .await
            .insert(pattern, subscription);

        if first {
            if let Err(e) = self.inner.source.psubscribe(pattern).await {
                self.inner.shared.registry.write().await.remove(id);
                warn!(pattern = %pattern, error = %e, "Pattern subscribe failed");
                return Err(e.into());
            }
            debug!(pattern = %pattern, "Pattern subscribed at source");
        }

        info!(pattern = %pattern, subscription = %id, "Subscribed");
        Ok(SubscriptionHandle {
            id,
            pattern: pattern.to_string(),
        })
    }

    /// Remove a subscription. Other subscriptions on its pattern keep
    /// receiving; the last one out unsubscribes the pattern at the source.
    ///
    /// Events already queued for the subscription are still delivered.
    /// Unknown handles are ignored.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        let _writer = self.inner.writer.lock().await;
        self.ensure_ready()?;

        let removed = self.inner.shared.registry.write().await.remove(handle.id);
        let Some(removed) = removed else {
            debug!(subscription = %handle.id, "Unsubscribe for unknown subscription");
            return Ok(());
        };

        if removed.last {
            self.inner.source.punsubscribe(&removed.pattern).await?;
            debug!(pattern = %removed.pattern, "Pattern unsubscribed at source");
        }

        info!(pattern = %removed.pattern, subscription = %handle.id, "Unsubscribed");
        Ok(())
    }

    /// Tear the broker down.
    ///
    /// Cancels the timer, unsubscribes every pattern, closes the source and
    /// waits for already-queued subscriber work to finish. Resolves only
    /// after teardown completes; repeated or concurrent calls wait for the
    /// same teardown.
    pub async fn close(&self) -> Result<()> {
        self.inner.closed.get_or_init(|| self.teardown()).await;
        Ok(())
    }

    /// Alias for [`Broker::close`].
    pub async fn quit(&self) -> Result<()> {
        self.close().await
    }

    async fn teardown(&self) {
        let inner = &self.inner;

        {
            let _writer = inner.writer.lock().await;
            inner.shared.state.send_replace(BrokerState::Closing);
        }
        info!("Broker closing");

        if let Some(timer) = &inner.timer {
            timer.cancel().await;
        }

        let dispatcher = inner
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
            let _ = dispatcher.await;
        }

        let patterns = inner.shared.registry.write().await.drain();
        for pattern in &patterns {
            if let Err(e) = inner.source.punsubscribe(pattern).await {
                warn!(pattern = %pattern, error = %e, "Pattern unsubscribe failed during close");
            }
        }

        if let Err(e) = inner.source.close().await {
            warn!(error = %e, "Event source close failed");
        }

        let workers = std::mem::take(
            &mut *inner
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let timeout = inner.config.shutdown_timeout();
        // No deadline when the timeout is too large to represent.
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        for mut worker in workers {
            let drained = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, &mut worker).await.is_ok(),
                None => {
                    let _ = (&mut worker).await;
                    true
                }
            };
            if !drained {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Subscriber worker did not drain, aborting"
                );
                worker.abort();
            }
        }

        inner.shared.state.send_replace(BrokerState::Closed);
        info!(patterns = patterns.len(), "Broker closed");
    }
}

#[cfg(test)]
mod tests;
