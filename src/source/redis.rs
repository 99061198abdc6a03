//! Redis pub/sub event source.
//!
//! Uses two connections:
//! - a dedicated pub/sub connection for `PSUBSCRIBE`/`PUNSUBSCRIBE`, read
//!   by a background task that forwards every `pmessage`
//! - a `ConnectionManager` for `PUBLISH` and `CONFIG SET`
//!
//! When the pub/sub connection drops the reader reconnects with exponential
//! backoff and re-issues every active pattern.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use redis::{AsyncCommands, Client, Msg};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{EventSource, InboundSink, RawEvent, Result, SourceError, SourceSignal};
use crate::config::RedisConfig;
use crate::utils::bootstrap::connect_with_retry;

/// Subscription-side state guarded by one lock so a reconnect and a
/// concurrent `psubscribe` cannot miss each other.
#[derive(Default)]
struct SubscriberState {
    sink: Option<PubSubSink>,
    patterns: HashSet<String>,
}

/// Redis implementation of `EventSource`.
pub struct RedisEventSource {
    client: Client,
    url: String,
    publisher: ConnectionManager,
    state: Arc<Mutex<SubscriberState>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl RedisEventSource {
    /// Connect the publishing side and optionally enable keyspace notifications.
    ///
    /// The pub/sub connection is opened by `start`.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;

        let publisher = connect_with_retry("redis", &config.url, config.connect_attempts, || {
            ConnectionManager::new(client.clone())
        })
        .await?;

        if let Some(ref flags) = config.notify_keyspace_events {
            let mut conn = publisher.clone();
            let _: () = redis::cmd("CONFIG")
                .arg("SET")
                .arg("notify-keyspace-events")
                .arg(flags)
                .query_async(&mut conn)
                .await?;
            info!(flags = %flags, "Enabled keyspace notifications");
        }

        info!(url = %config.url, "Connected to Redis for pub/sub");

        Ok(Self {
            client,
            url: config.url.clone(),
            publisher,
            state: Arc::new(Mutex::new(SubscriberState::default())),
            reader: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SourceError::Closed);
        }
        Ok(())
    }

    /// Open a pub/sub connection and subscribe every known pattern on it.
    async fn open_subscriber(
        client: &Client,
        state: &Mutex<SubscriberState>,
    ) -> Result<PubSubStream> {
        let (mut sink, stream) = client.get_async_pubsub().await?.split();

        let mut guard = state.lock().await;
        for pattern in guard.patterns.iter() {
            sink.psubscribe(pattern)
                .await
                .map_err(|e| SourceError::Subscribe(e.to_string()))?;
        }
        guard.sink = Some(sink);

        Ok(stream)
    }

    /// Read messages, reconnecting with backoff whenever the stream ends.
    async fn read_loop(
        client: Client,
        url: String,
        state: Arc<Mutex<SubscriberState>>,
        closed: Arc<AtomicBool>,
        mut stream: PubSubStream,
        sink: InboundSink,
    ) {
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();

        loop {
            while let Some(msg) = stream.next().await {
                if let Some(event) = to_raw_event(&msg) {
                    if sink.send(SourceSignal::Event(event)).is_err() {
                        debug!("Dispatcher gone, stopping Redis reader");
                        return;
                    }
                }
            }

            if closed.load(Ordering::SeqCst) {
                return;
            }

            error!(url = %url, "Redis pub/sub connection lost, reconnecting");
            state.lock().await.sink = None;
            if sink
                .send(SourceSignal::ConnectionLost(format!(
                    "pub/sub connection to {} lost",
                    url
                )))
                .is_err()
            {
                return;
            }

            let mut backoff_iter = backoff_builder.build();
            stream = loop {
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                match Self::open_subscriber(&client, &state).await {
                    Ok(stream) => break stream,
                    Err(e) => {
                        let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                        error!(
                            error = %e,
                            backoff_ms = %delay.as_millis(),
                            "Failed to re-establish Redis pub/sub, retrying after backoff"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            };

            info!(url = %url, "Redis pub/sub connection re-established");
            let _ = sink.send(SourceSignal::Reconnected);
        }
    }
}

fn to_raw_event(msg: &Msg) -> Option<RawEvent> {
    let channel = msg.get_channel_name().to_string();
    let payload: String = match msg.get_payload() {
        Ok(p) => p,
        Err(e) => {
            warn!(channel = %channel, error = %e, "Dropping non-UTF-8 Redis payload");
            return None;
        }
    };
    let pattern = if msg.from_pattern() {
        msg.get_pattern::<String>().ok()
    } else {
        None
    };

    Some(RawEvent {
        channel,
        pattern,
        payload,
    })
}

#[async_trait]
impl EventSource for RedisEventSource {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn start(&self, sink: InboundSink) -> Result<()> {
        self.ensure_open()?;

        let mut reader = self.reader.lock().await;
        if reader.is_some() {
            return Ok(());
        }

        let stream = Self::open_subscriber(&self.client, &self.state).await?;

        *reader = Some(tokio::spawn(Self::read_loop(
            self.client.clone(),
            self.url.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.closed),
            stream,
            sink,
        )));

        info!(url = %self.url, "Redis pub/sub reader started");
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<()> {
        self.ensure_open()?;

        let mut state = self.state.lock().await;
        if let Some(sink) = state.sink.as_mut() {
            sink.psubscribe(pattern)
                .await
                .map_err(|e| SourceError::Subscribe(e.to_string()))?;
        }
        // Without a live sink the reader subscribes it on reconnect.
        state.patterns.insert(pattern.to_string());

        debug!(pattern = %pattern, "Redis PSUBSCRIBE");
        Ok(())
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<()> {
        self.ensure_open()?;

        let mut state = self.state.lock().await;
        state.patterns.remove(pattern);
        if let Some(sink) = state.sink.as_mut() {
            sink.punsubscribe(pattern)
                .await
                .map_err(|e| SourceError::Subscribe(e.to_string()))?;
        }

        debug!(pattern = %pattern, "Redis PUNSUBSCRIBE");
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        self.ensure_open()?;

        let mut conn = self.publisher.clone();
        let receivers: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| SourceError::Publish(e.to_string()))?;

        debug!(channel = %channel, receivers = receivers, "Published to Redis");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }

        let mut state = self.state.lock().await;
        state.patterns.clear();
        // Dropping the sink closes the pub/sub connection.
        state.sink = None;

        info!(url = %self.url, "Redis source closed");
        Ok(())
    }
}
