mod common;

use std::time::Duration;

use serde_json::json;

use common::{subscribe_all, types_of};
use hive_core::event::{
    AgentEvent, EventBus, EventFilter, EventScope, EventType, MemorySink,
};

#[tokio::test]
async fn events_arrive_in_publish_order() {
    let bus = EventBus::default();
    let mut subscription = subscribe_all(&bus);

    for i in 0..20 {
        bus.publish(
            AgentEvent::new(EventType::Custom)
                .with_stream("order")
                .with_data("i", json!(i)),
        );
    }

    for i in 0..20 {
        let event = subscription
            .next_timeout(Duration::from_secs(2))
            .await
            .expect("event");
        assert_eq!(event.field("i"), Some(&json!(i)));
    }
}

#[tokio::test]
async fn filters_and_combine_across_fields() {
    let bus = EventBus::default();
    let mut subscription = bus.subscribe(
        EventFilter::any()
            .with_types(vec![EventType::NodeLoopStarted])
            .with_execution("e1"),
    );

    bus.publish(
        AgentEvent::new(EventType::NodeLoopStarted)
            .with_stream("s")
            .with_execution("e2"),
    );
    bus.publish(
        AgentEvent::new(EventType::JudgeVerdict)
            .with_stream("s")
            .with_execution("e1"),
    );
    bus.publish(
        AgentEvent::new(EventType::NodeLoopStarted)
            .with_stream("s")
            .with_execution("e1")
            .with_data("marker", json!(true)),
    );

    let event = subscription
        .next_timeout(Duration::from_secs(2))
        .await
        .expect("matching event");
    assert_eq!(event.field("marker"), Some(&json!(true)));
}

#[tokio::test]
async fn overflow_drops_oldest_and_counts() {
    let bus = EventBus::new(1_000);
    // Subscribe but do not drain while publishing.
    let mut subscription = subscribe_all(&bus);

    for i in 0..1_001 {
        bus.publish(
            AgentEvent::new(EventType::Custom)
                .with_stream("burst")
                .with_data("i", json!(i)),
        );
    }
    // Let the listener task forward everything into the hub.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let first = subscription
        .next_timeout(Duration::from_secs(2))
        .await
        .expect("first surviving event");
    // The oldest event (i = 0) was dropped; the most recent 1,000 remain
    // in order.
    assert_eq!(first.field("i"), Some(&json!(1)));

    let mut last = first;
    while let Some(event) = subscription.try_recv() {
        last = event;
    }
    assert_eq!(last.field("i"), Some(&json!(1_000)));
    assert_eq!(subscription.dropped(), 1);
    assert_eq!(bus.metrics().dropped, 1);
}

#[tokio::test]
async fn child_bus_stamps_scope_without_overwriting() {
    let bus = EventBus::default();
    let scoped = bus
        .child(EventScope {
            graph_id: Some("g1".to_string()),
            stream_id: Some("manual".to_string()),
            execution_id: Some("e1".to_string()),
            node_id: None,
        })
        .child_for_node("plan");
    let mut subscription = subscribe_all(&bus);

    scoped.publish(AgentEvent::new(EventType::NodeLoopStarted));
    scoped.publish(AgentEvent::new(EventType::Custom).with_node("other"));

    let stamped = subscription
        .next_timeout(Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(stamped.graph_id.as_deref(), Some("g1"));
    assert_eq!(stamped.stream_id, "manual");
    assert_eq!(stamped.execution_id.as_deref(), Some("e1"));
    assert_eq!(stamped.node_id.as_deref(), Some("plan"));

    let explicit = subscription
        .next_timeout(Duration::from_secs(2))
        .await
        .unwrap();
    // Explicitly-set fields win over the scope.
    assert_eq!(explicit.node_id.as_deref(), Some("other"));
}

#[tokio::test]
async fn close_is_idempotent() {
    let bus = EventBus::default();
    let mut subscription = subscribe_all(&bus);
    subscription.close();
    subscription.close();
    assert!(subscription.is_closed());
    assert!(subscription.recv().await.is_none());
}

#[tokio::test]
async fn sinks_see_every_event_in_order() {
    let bus = EventBus::default();
    let sink = MemorySink::new();
    bus.add_sink(sink.clone());

    bus.publish(AgentEvent::new(EventType::Custom).with_stream("s").with_data("n", json!(1)));
    bus.publish(AgentEvent::new(EventType::Custom).with_stream("s").with_data("n", json!(2)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let entries = sink.snapshot();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].field("n"), Some(&json!(1)));
    assert_eq!(entries[1].field("n"), Some(&json!(2)));
}

#[tokio::test]
async fn shutdown_ends_open_subscriptions() {
    let bus = EventBus::default();
    let mut subscription = subscribe_all(&bus);
    bus.publish(AgentEvent::new(EventType::Custom).with_stream("s"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.shutdown().await;

    // The buffered event still arrives, then the stream ends.
    assert!(subscription.recv().await.is_some());
    assert!(subscription.recv().await.is_none());

    // Publishing after shutdown is a quiet no-op.
    bus.publish(AgentEvent::new(EventType::Custom).with_stream("s"));
}

#[tokio::test]
async fn concurrent_publishers_interleave_without_loss() {
    let bus = EventBus::default();
    let mut subscription = subscribe_all(&bus);

    let mut handles = Vec::new();
    for publisher in 0..4 {
        let bus = bus.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..25 {
                bus.publish(
                    AgentEvent::new(EventType::Custom)
                        .with_stream(format!("p{publisher}"))
                        .with_data("i", json!(i)),
                );
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut events = Vec::new();
    for _ in 0..100 {
        events.push(
            subscription
                .next_timeout(Duration::from_secs(2))
                .await
                .expect("event"),
        );
    }
    assert_eq!(events.len(), 100);
    // Per-publisher order is preserved.
    for publisher in 0..4 {
        let stream = format!("p{publisher}");
        let indices: Vec<i64> = events
            .iter()
            .filter(|event| event.stream_id == stream)
            .map(|event| event.field("i").unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(indices, (0..25).collect::<Vec<i64>>());
    }
    assert_eq!(types_of(&events).len(), 100);
}
