//! Synthetic interval events.
//!
//! When enabled, the broker arms one `IntervalSource` which emits an
//! `onInterval` event carrying `{"timestamp": <ms since epoch>}` every
//! period. Events go straight to the dispatcher; they never touch the
//! underlying connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::{InboundSink, RawEvent, SourceSignal};

/// Channel name for synthetic interval events.
pub const INTERVAL_CHANNEL: &str = "onInterval";

/// Default period between interval events.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);

/// Shortest period a timer will run with.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Recurring timer feeding synthetic events into the dispatcher.
pub struct IntervalSource {
    period: Duration,
    cancelled: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IntervalSource {
    /// Create an unarmed timer with the given period, raised to
    /// `MIN_INTERVAL` if shorter.
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(MIN_INTERVAL),
            cancelled: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Period between events.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whether the timer is currently armed.
    pub async fn is_armed(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Arm the timer. The first event fires one full period from now.
    ///
    /// Arming an already armed (or cancelled) timer does nothing.
    pub async fn start(&self, sink: InboundSink) {
        let mut task = self.task.lock().await;
        if task.is_some() || self.cancelled.load(Ordering::SeqCst) {
            return;
        }

        let period = self.period;
        let cancelled = Arc::clone(&self.cancelled);

        *task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                // A tick can race cancel(); never emit once cancelled.
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
                let event = RawEvent::local(INTERVAL_CHANNEL, timestamp_payload());
                if sink.send(SourceSignal::Event(event)).is_err() {
                    break;
                }
                debug!("Interval event emitted");
            }
        }));

        info!(period_ms = period.as_millis() as u64, "Interval timer armed");
    }

    /// Cancel the timer. No event is emitted after this returns.
    pub async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            info!("Interval timer cancelled");
        }
    }
}

impl Drop for IntervalSource {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

fn timestamp_payload() -> String {
    json!({ "timestamp": chrono::Utc::now().timestamp_millis() }).to_string()
}
