//! Inbound dispatch and subscriber workers.
//!
//! The dispatcher drains source signals in arrival order. For each event it
//! decodes and enriches the payload once, then enqueues the shared result on
//! every matching subscription's queue without waiting for subscriber work.
//! Each subscription has its own worker, so deliveries to one subscriber stay
//! in arrival order while siblings proceed independently.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::registry::SubscriptionId;
use super::{BrokerShared, BrokerState, DecodedEvent, EventHandler, Failure, FailureKind};
use crate::source::{RawEvent, SourceSignal};
use crate::transform::{panic_message, parse_wire};

/// Run the dispatcher until every signal sender is gone.
pub(crate) async fn run_dispatcher(
    shared: Arc<BrokerShared>,
    mut inbound: mpsc::UnboundedReceiver<SourceSignal>,
) {
    while let Some(signal) = inbound.recv().await {
        match signal {
            SourceSignal::Event(event) => {
                if shared.state() != BrokerState::Ready {
                    debug!(channel = %event.channel, "Broker not ready, dropping inbound event");
                    continue;
                }
                dispatch(&shared, event).await;
            }
            SourceSignal::ConnectionLost(message) => {
                shared.report(Failure {
                    kind: FailureKind::Connection,
                    channel: None,
                    subscription: None,
                    message,
                });
            }
            SourceSignal::Reconnected => {
                info!("Event source reconnected");
            }
        }
    }
    debug!("Dispatcher stopped");
}

/// Route one raw event to every matching subscription.
///
/// Returns the number of subscriptions it was enqueued for.
pub(crate) async fn dispatch(shared: &BrokerShared, event: RawEvent) -> usize {
    let targets = shared.registry.read().await.route(&event);
    if targets.is_empty() {
        debug!(channel = %event.channel, "No subscribers for channel");
        return 0;
    }

    let wire = parse_wire(&event.payload);
    let decoded = shared
        .transforms
        .decode(&wire)
        .and_then(|data| Ok((data, shared.transforms.enrich(&wire)?)));

    let (data, context_value) = match decoded {
        Ok(parts) => parts,
        Err(e) => {
            shared.report(Failure {
                kind: FailureKind::Transform,
                channel: Some(event.channel),
                subscription: None,
                message: e.to_string(),
            });
            return 0;
        }
    };

    let delivered = Arc::new(DecodedEvent {
        channel: event.channel,
        pattern: event.pattern,
        data,
        context_value,
    });

    let mut enqueued = 0;
    for queue in targets {
        // A closed queue belongs to a subscription removed mid-dispatch.
        if queue.send(Arc::clone(&delivered)).is_ok() {
            enqueued += 1;
        }
    }

    debug!(
        channel = %delivered.channel,
        subscribers = enqueued,
        "Dispatched event"
    );
    enqueued
}

/// Invoke `handler` for each queued event, in order, isolating failures.
pub(crate) async fn run_subscriber(
    shared: Arc<BrokerShared>,
    id: SubscriptionId,
    pattern: String,
    handler: Arc<dyn EventHandler>,
    mut queue: mpsc::UnboundedReceiver<Arc<DecodedEvent>>,
) {
    while let Some(event) = queue.recv().await {
        let channel = event.channel.clone();

        let outcome = match catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
            Ok(fut) => AssertUnwindSafe(fut)
                .catch_unwind()
                .await
                .map_err(|panic| panic_message(panic.as_ref())),
            Err(panic) => Err(panic_message(panic.as_ref())),
        };

        let message = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("subscriber panicked: {}", panic),
        };

        shared.report(Failure {
            kind: FailureKind::Subscriber,
            channel: Some(channel),
            subscription: Some(id),
            message,
        });
    }

    debug!(subscription = %id, pattern = %pattern, "Subscriber worker finished");
}

/// Log a failure at the level matching its kind.
pub(crate) fn log_failure(failure: &Failure) {
    let channel = failure.channel.as_deref().unwrap_or("-");
    match failure.kind {
        FailureKind::Connection => {
            tracing::error!(error = %failure.message, "Event source connection failure");
        }
        FailureKind::Transform => {
            warn!(channel = %channel, error = %failure.message, "Transform failed, event dropped");
        }
        FailureKind::Subscriber => {
            warn!(
                channel = %channel,
                subscription = ?failure.subscription,
                error = %failure.message,
                "Subscriber failed"
            );
        }
    }
}
