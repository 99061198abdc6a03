use super::*;
use crate::source::{MemoryEventSource, MemoryHub, INTERVAL_CHANNEL};
use crate::test_utils::{
    next_event, ChannelHandler, CountingHandler, FailingHandler, PanickingHandler,
    RecordingSource,
};
use crate::transform::as_integer;
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;

async fn memory_broker(config: BrokerConfig, transforms: Transforms) -> (Broker, MemoryHub) {
    let hub = MemoryHub::new();
    let source = Arc::new(MemoryEventSource::new(&hub));
    let broker = Broker::new(source, config, transforms).await.unwrap();
    (broker, hub)
}

async fn recording_broker() -> (Broker, Arc<RecordingSource>) {
    let source = Arc::new(RecordingSource::new(&MemoryHub::new()));
    let broker = Broker::new(source.clone(), BrokerConfig::default(), Transforms::new())
        .await
        .unwrap();
    (broker, source)
}

fn plus_one(v: Value) -> std::result::Result<Value, TransformError> {
    as_integer(&v)
        .map(|n| json!(n + 1))
        .ok_or_else(|| TransformError::Decode(format!("not a number: {}", v)))
}

#[tokio::test]
async fn test_publish_subscribe_identity() {
    let (broker, _hub) = memory_broker(BrokerConfig::default(), Transforms::new()).await;
    assert_eq!(broker.state(), BrokerState::Ready);

    let (handler, mut rx) = ChannelHandler::new();
    broker.subscribe("onAddMessage", handler).await.unwrap();
    broker.publish("onAddMessage", json!({"x": 1})).await.unwrap();

    let event = next_event(&mut rx).await;
    assert_eq!(event.to_json(), json!({"data": {"x": 1}, "contextValue": {}}));
    assert_eq!(
        serde_json::to_value(&*event).unwrap(),
        json!({"data": {"x": 1}, "contextValue": {}})
    );
    assert_eq!(event.channel, "onAddMessage");

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_format_and_stringify() {
    let transforms = Transforms::new()
        .with_format(plus_one)
        .with_stringify(plus_one);
    let (broker, _hub) = memory_broker(BrokerConfig::default(), transforms).await;

    let (handler, mut rx) = ChannelHandler::new();
    broker.subscribe("onAddMessage", handler).await.unwrap();
    broker.publish("onAddMessage", 1).await.unwrap();

    let event = next_event(&mut rx).await;
    assert_eq!(event.to_json(), json!({"data": 3, "contextValue": {}}));

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_on_message_context() {
    let transforms = Transforms::new().with_on_message(|_| {
        let mut ctx = Map::new();
        ctx.insert("name".to_string(), json!("x"));
        Ok(ctx)
    });
    let (broker, _hub) = memory_broker(BrokerConfig::default(), transforms).await;

    let (handler, mut rx) = ChannelHandler::new();
    broker.subscribe("onAddMessage", handler).await.unwrap();
    broker
        .publish("onAddMessage", json!({"times": 10}))
        .await
        .unwrap();

    let event = next_event(&mut rx).await;
    assert_eq!(
        event.to_json(),
        json!({"data": {"times": 10}, "contextValue": {"name": "x"}})
    );

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_non_matching_channel_not_delivered() {
    let (broker, _hub) = memory_broker(BrokerConfig::default(), Transforms::new()).await;

    let (handler, mut rx) = ChannelHandler::new();
    broker.subscribe("X*", handler).await.unwrap();

    broker.publish("Y", json!("skip")).await.unwrap();
    broker.publish("Xylophone", json!("keep")).await.unwrap();

    let event = next_event(&mut rx).await;
    assert_eq!(event.channel, "Xylophone");
    assert_eq!(event.data, json!("keep"));

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_fan_out_isolates_failing_sibling() {
    let (broker, _hub) = memory_broker(BrokerConfig::default(), Transforms::new()).await;
    let mut failures = broker.failures();

    broker.subscribe("orders", FailingHandler).await.unwrap();
    let (handler, mut rx) = ChannelHandler::new();
    broker.subscribe("orders", handler).await.unwrap();

    broker.publish("orders", json!({"id": 1})).await.unwrap();

    assert_eq!(next_event(&mut rx).await.data, json!({"id": 1}));

    let failure = tokio::time::timeout(Duration::from_secs(1), failures.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failure.kind, FailureKind::Subscriber);
    assert_eq!(failure.channel.as_deref(), Some("orders"));

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_panicking_subscriber_keeps_receiving() {
    let (broker, _hub) = memory_broker(BrokerConfig::default(), Transforms::new()).await;
    let mut failures = broker.failures();

    broker.subscribe("jobs", PanickingHandler).await.unwrap();
    let (handler, mut rx) = ChannelHandler::new();
    broker.subscribe("jobs", handler).await.unwrap();

    broker.publish("jobs", 1).await.unwrap();
    broker.publish("jobs", 2).await.unwrap();

    assert_eq!(next_event(&mut rx).await.data, json!(1));
    assert_eq!(next_event(&mut rx).await.data, json!(2));

    // One panic reported per event: the worker survives the first
    for _ in 0..2 {
        let failure = tokio::time::timeout(Duration::from_secs(1), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.kind, FailureKind::Subscriber);
        assert!(failure.message.contains("subscriber exploded"));
    }

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_transform_failure_drops_single_event() {
    let transforms = Transforms::new().with_decode(plus_one);
    let (broker, _hub) = memory_broker(BrokerConfig::default(), transforms).await;
    let mut failures = broker.failures();

    let (handler, mut rx) = ChannelHandler::new();
    broker.subscribe("counter", handler).await.unwrap();

    broker.publish("counter", json!({"bad": true})).await.unwrap();
    broker.publish("counter", 41).await.unwrap();

    assert_eq!(next_event(&mut rx).await.data, json!(42));

    let failure = failures.recv().await.unwrap();
    assert_eq!(failure.kind, FailureKind::Transform);
    assert!(failure.subscription.is_none());

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_pattern_reference_counting() {
    let (broker, source) = recording_broker().await;

    let a = broker.subscribe("on*", CountingHandler::new()).await.unwrap();
    let b = broker.subscribe("on*", CountingHandler::new()).await.unwrap();
    assert_eq!(source.calls().await, vec!["psubscribe:on*"]);
    assert_eq!(broker.subscriber_count("on*").await, 2);

    broker.unsubscribe(&a).await.unwrap();
    assert_eq!(source.calls().await, vec!["psubscribe:on*"]);

    broker.unsubscribe(&b).await.unwrap();
    assert_eq!(
        source.calls().await,
        vec!["psubscribe:on*", "punsubscribe:on*"]
    );
    assert_eq!(broker.pattern_count().await, 0);

    // Unknown handle is a no-op
    broker.unsubscribe(&b).await.unwrap();

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_keeps_sibling() {
    let (broker, _hub) = memory_broker(BrokerConfig::default(), Transforms::new()).await;

    let removed = CountingHandler::new();
    let removed_count = removed.count();
    let handle = broker.subscribe("feed", removed).await.unwrap();
    let (handler, mut rx) = ChannelHandler::new();
    broker.subscribe("feed", handler).await.unwrap();

    broker.unsubscribe(&handle).await.unwrap();
    broker.publish("feed", json!("after")).await.unwrap();

    assert_eq!(next_event(&mut rx).await.data, json!("after"));
    assert_eq!(removed_count.load(Ordering::SeqCst), 0);

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_overlapping_patterns_deliver_once_each() {
    let (broker, _hub) = memory_broker(BrokerConfig::default(), Transforms::new()).await;

    let (wide, mut wide_rx) = ChannelHandler::new();
    let (narrow, mut narrow_rx) = ChannelHandler::new();
    broker.subscribe("on*", wide).await.unwrap();
    broker.subscribe("onAdd", narrow).await.unwrap();

    broker.publish("onAdd", 1).await.unwrap();
    broker.publish("onAdd", 2).await.unwrap();

    assert_eq!(next_event(&mut wide_rx).await.data, json!(1));
    assert_eq!(next_event(&mut wide_rx).await.data, json!(2));
    assert_eq!(next_event(&mut narrow_rx).await.data, json!(1));
    assert_eq!(next_event(&mut narrow_rx).await.data, json!(2));

    broker.close().await.unwrap();
    assert!(wide_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_per_channel_order_preserved() {
    let (broker, _hub) = memory_broker(BrokerConfig::default(), Transforms::new()).await;

    let (handler, mut rx) = ChannelHandler::new();
    broker
        .subscribe_fn("seq", move |event| {
            let forward = handler.handle(event);
            async move {
                // Uneven delays must not reorder deliveries
                tokio::task::yield_now().await;
                forward.await
            }
        })
        .await
        .unwrap();

    for i in 0..50 {
        broker.publish("seq", i).await.unwrap();
    }
    for i in 0..50 {
        assert_eq!(next_event(&mut rx).await.data, json!(i));
    }

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_subscribe_stream() {
    let (broker, hub) = memory_broker(BrokerConfig::default(), Transforms::new()).await;

    let (_handle, mut stream) = broker.subscribe_stream("__keyspace@0__:*").await.unwrap();
    hub.inject("__keyspace@0__:user:1", "set");

    let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.channel, "__keyspace@0__:user:1");
    assert_eq!(event.data, json!("set"));

    broker.close().await.unwrap();
    assert!(stream.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_interval_single_delivery_per_subscriber() {
    let config = BrokerConfig::default().with_interval(Duration::from_millis(100));
    let (broker, _hub) = memory_broker(config, Transforms::new()).await;
    assert!(broker.interval_armed().await);

    let (first, mut first_rx) = ChannelHandler::new();
    let (second, mut second_rx) = ChannelHandler::new();
    broker.subscribe(INTERVAL_CHANNEL, first).await.unwrap();
    broker.subscribe("on*", second).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    for rx in [&mut first_rx, &mut second_rx] {
        let event = next_event(rx).await;
        assert_eq!(event.channel, INTERVAL_CHANNEL);
        assert!(event.data["timestamp"].is_i64());
        assert!(event.context_value.is_empty());
        assert!(rx.try_recv().is_err());
    }

    broker.close().await.unwrap();
    assert!(!broker.interval_armed().await);
}

#[tokio::test(start_paused = true)]
async fn test_zero_interval_still_fires() {
    let config = BrokerConfig {
        pubsub_interval: true,
        interval_ms: 0,
        ..Default::default()
    };
    let (broker, _hub) = memory_broker(config, Transforms::new()).await;

    let (handler, mut rx) = ChannelHandler::new();
    broker.subscribe(INTERVAL_CHANNEL, handler).await.unwrap();

    let event = next_event(&mut rx).await;
    assert_eq!(event.channel, INTERVAL_CHANNEL);
    assert!(broker.interval_armed().await);

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_interval_disabled_by_default() {
    let (broker, _hub) = memory_broker(BrokerConfig::default(), Transforms::new()).await;
    assert!(!broker.interval_armed().await);
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_close_drains_queued_work() {
    let (broker, _hub) = memory_broker(BrokerConfig::default(), Transforms::new()).await;

    let counter = CountingHandler::new();
    let count = counter.count();
    broker
        .subscribe_fn("slow", move |event| {
            let done = counter.handle(event);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                done.await
            }
        })
        .await
        .unwrap();

    let (probe, mut probe_rx) = ChannelHandler::new();
    broker.subscribe("slow", probe).await.unwrap();

    for i in 0..3 {
        broker.publish("slow", i).await.unwrap();
    }
    // All three are enqueued once the probe has seen them
    for _ in 0..3 {
        next_event(&mut probe_rx).await;
    }

    broker.close().await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert_eq!(broker.state(), BrokerState::Closed);
}

#[tokio::test]
async fn test_operations_after_close_fail_fast() {
    let (broker, hub) = memory_broker(BrokerConfig::default(), Transforms::new()).await;
    let (handler, mut rx) = ChannelHandler::new();
    let handle = broker.subscribe("late", handler).await.unwrap();

    broker.close().await.unwrap();
    // Idempotent
    broker.quit().await.unwrap();

    assert!(matches!(
        broker.publish("late", 1).await,
        Err(BrokerError::Closed)
    ));
    assert!(matches!(
        broker.subscribe("late", CountingHandler::new()).await,
        Err(BrokerError::Closed)
    ));
    assert!(matches!(
        broker.unsubscribe(&handle).await,
        Err(BrokerError::Closed)
    ));

    // Stray message on the underlying connection
    hub.inject("late", "1");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_concurrent_close_waits_for_teardown() {
    let (broker, _hub) = memory_broker(BrokerConfig::default(), Transforms::new()).await;
    broker.subscribe("a", CountingHandler::new()).await.unwrap();

    let other = broker.clone();
    let (first, second) = tokio::join!(broker.close(), other.close());
    first.unwrap();
    second.unwrap();

    assert_eq!(broker.state(), BrokerState::Closed);
    assert_eq!(broker.pattern_count().await, 0);
}

#[tokio::test]
async fn test_close_with_unbounded_shutdown_timeout() {
    let config = BrokerConfig {
        shutdown_timeout_ms: u64::MAX,
        ..Default::default()
    };
    let (broker, _hub) = memory_broker(config, Transforms::new()).await;
    let (handler, mut rx) = ChannelHandler::new();
    broker.subscribe("a", handler).await.unwrap();
    broker.publish("a", 1).await.unwrap();
    next_event(&mut rx).await;

    tokio::time::timeout(Duration::from_secs(1), broker.close())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(broker.state(), BrokerState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_subscribe_unsubscribe_keeps_refcount() {
    let (broker, source) = recording_broker().await;

    let mut tasks = Vec::new();
    for i in 0..32 {
        let broker = broker.clone();
        tasks.push(tokio::spawn(async move {
            let handle = broker.subscribe("race", CountingHandler::new()).await.unwrap();
            if i % 8 == 0 {
                // Kept alive
                return Some(handle);
            }
            broker.unsubscribe(&handle).await.unwrap();
            None
        }));
    }

    let mut kept = Vec::new();
    for task in tasks {
        if let Some(handle) = task.await.unwrap() {
            kept.push(handle);
        }
    }
    assert_eq!(kept.len(), 4);

    let calls = source.calls().await;
    assert!(!calls.is_empty());
    for (i, call) in calls.iter().enumerate() {
        let expected = if i % 2 == 0 { "psubscribe:race" } else { "punsubscribe:race" };
        assert_eq!(call, expected, "call {} out of order: {:?}", i, calls);
    }
    // Ends subscribed because live handles remain
    assert_eq!(calls.len() % 2, 1);
    assert_eq!(broker.pattern_count().await, 1);
    assert_eq!(broker.subscriber_count("race").await, kept.len());

    for handle in &kept {
        broker.unsubscribe(handle).await.unwrap();
    }
    assert_eq!(broker.pattern_count().await, 0);
    assert_eq!(source.calls().await.last().unwrap(), "punsubscribe:race");

    broker.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_tracks_workers_of_racing_subscribes() {
    let (broker, _hub) = memory_broker(BrokerConfig::default(), Transforms::new()).await;

    let mut tasks = Vec::new();
    for i in 0..32 {
        let broker = broker.clone();
        tasks.push(tokio::spawn(async move {
            broker
                .subscribe(&format!("p{}", i % 4), CountingHandler::new())
                .await
                .is_ok()
        }));
    }
    broker.close().await.unwrap();
    for task in tasks {
        task.await.unwrap();
    }

    // Every successful subscribe registered its worker before close collected them
    let workers = broker
        .inner
        .workers
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    assert!(workers.is_empty());
    assert_eq!(broker.state(), BrokerState::Closed);
}

#[tokio::test]
async fn test_close_unsubscribes_all_patterns() {
    let (broker, source) = recording_broker().await;
    broker.subscribe("a", CountingHandler::new()).await.unwrap();
    broker.subscribe("b*", CountingHandler::new()).await.unwrap();

    broker.close().await.unwrap();

    let calls = source.calls().await;
    assert!(calls.contains(&"punsubscribe:a".to_string()));
    assert!(calls.contains(&"punsubscribe:b*".to_string()));
}

#[tokio::test]
async fn test_connection_lost_is_reported() {
    let (broker, hub) = memory_broker(BrokerConfig::default(), Transforms::new()).await;
    let mut failures = broker.failures();
    broker.subscribe("*", CountingHandler::new()).await.unwrap();

    // Overrun the hub so the reader lags and reports a gap
    for i in 0..2048 {
        hub.inject("flood", i.to_string());
    }

    let failure = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let f = failures.recv().await.unwrap();
            if f.kind == FailureKind::Connection {
                return f;
            }
        }
    })
    .await
    .unwrap();
    assert!(failure.message.contains("lagged"));

    broker.close().await.unwrap();
}
