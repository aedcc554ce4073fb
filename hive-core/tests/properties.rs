use proptest::prelude::*;

use hive_core::event::{AgentEvent, EventBus, EventType};
use hive_core::state::{IsolationPolicy, SharedState, StateSnapshot};

fn arb_value() -> impl Strategy<Value = serde_json::Value> {
    let leaf = prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::from),
        any::<i64>().prop_map(serde_json::Value::from),
        "[a-zA-Z0-9 ]{0,24}".prop_map(serde_json::Value::from),
    ];
    leaf.prop_recursive(3, 32, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::Array),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..4).prop_map(|map| {
                serde_json::Value::Object(map.into_iter().collect())
            }),
        ]
    })
}

fn arb_snapshot() -> impl Strategy<Value = StateSnapshot> {
    prop::collection::hash_map("[a-z_]{1,12}", arb_value(), 0..8)
        .prop_map(|map| map.into_iter().collect())
}

fn arb_event_type() -> impl Strategy<Value = EventType> {
    prop_oneof![
        Just(EventType::ExecutionStarted),
        Just(EventType::ExecutionCompleted),
        Just(EventType::LlmTextDelta),
        Just(EventType::ToolCallCompleted),
        Just(EventType::JudgeVerdict),
        Just(EventType::StateChanged),
        Just(EventType::EdgeTraversed),
        Just(EventType::Custom),
    ]
}

fn arb_event() -> impl Strategy<Value = AgentEvent> {
    (
        arb_event_type(),
        "[a-z0-9-]{1,16}",
        prop::option::of("[a-z0-9-]{1,16}"),
        prop::option::of("[a-z0-9-]{1,16}"),
        prop::collection::hash_map("[a-z_]{1,10}", arb_value(), 0..5),
    )
        .prop_map(|(event_type, stream, node, execution, data)| {
            let mut event = AgentEvent::new(event_type).with_stream(stream);
            if let Some(node) = node {
                event = event.with_node(node);
            }
            if let Some(execution) = execution {
                event = event.with_execution(execution);
            }
            for (key, value) in data {
                event = event.with_data(key, value);
            }
            event
        })
}

proptest! {
    #[test]
    fn event_encode_decode_round_trips(event in arb_event()) {
        let encoded = event.encode().unwrap();
        let decoded = AgentEvent::decode(&encoded).unwrap();
        prop_assert_eq!(event, decoded);
    }

    #[test]
    fn state_restore_of_snapshot_is_identity(snapshot in arb_snapshot()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let state = SharedState::new(IsolationPolicy::Shared, EventBus::default());
            state.restore(snapshot.clone());
            assert_eq!(state.snapshot(), snapshot);

            // Mutations after a snapshot do not leak back into it.
            let copy = state.snapshot();
            state.set("exec", "scratch", serde_json::json!("dirty"));
            state.restore(copy.clone());
            assert_eq!(state.snapshot(), copy);
        });
    }
}
