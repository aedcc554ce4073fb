mod common;

use std::sync::Arc;

use serde_json::{json, Value};

use common::{
    collect_until, linear_graph, linear_script, outputs_judge, subscribe_all, types_of,
};
use hive_core::event::{EventBus, EventType};
use hive_core::graph::{
    EdgeCondition, EdgeSpec, ExecutionStatus, GraphExecutor, GraphSpec, NodeSpec, OutputKey,
};
use hive_core::judge::JudgeProtocol;
use hive_core::llm::{LlmClient, ScriptedClient, ScriptedTurn};
use hive_core::node::ExecutionControls;
use hive_core::state::{IsolationPolicy, SharedState};
use hive_core::tools::ToolRegistry;

fn executor_for(
    graph: GraphSpec,
    llm: Arc<dyn LlmClient>,
    isolation: IsolationPolicy,
) -> (Arc<GraphExecutor>, EventBus, SharedState) {
    let bus = EventBus::default();
    let state = SharedState::new(isolation, bus.clone());
    let executor = Arc::new(GraphExecutor::new(
        Arc::new(graph),
        bus.child(hive_core::event::EventScope {
            graph_id: Some("test-graph".to_string()),
            stream_id: Some("manual".to_string()),
            execution_id: Some("exec-1".to_string()),
            node_id: None,
        }),
        state.clone(),
        llm,
        Arc::new(ToolRegistry::new()),
        outputs_judge(),
        ExecutionControls::unmanaged(),
        "exec-1",
    ));
    (executor, bus, state)
}

#[tokio::test]
async fn linear_graph_emits_the_expected_sequence() {
    let (executor, bus, state) = executor_for(
        linear_graph(),
        linear_script(),
        IsolationPolicy::Shared,
    );
    let mut subscription = subscribe_all(&bus);

    let report = executor.execute(json!({"q": "hi"}), None, None).await;
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(
        report.edge_trace,
        vec![
            ("a".to_string(), "b".to_string()),
            ("b".to_string(), "c".to_string()),
        ]
    );
    assert_eq!(report.outputs.get("c_out"), Some(&json!("C")));
    assert_eq!(state.get("exec-1", "b_out"), Some(json!("B")));

    let events = collect_until(&mut subscription, |event| {
        event.event_type == EventType::ExecutionCompleted
    })
    .await;
    let types = types_of(&events);
    assert_eq!(types.first(), Some(&EventType::ExecutionStarted));
    assert_eq!(types.last(), Some(&EventType::ExecutionCompleted));

    // execution_started strictly precedes all node events; the terminal
    // event follows all of them.
    let traversals: Vec<(&str, &str)> = events
        .iter()
        .filter(|event| event.event_type == EventType::EdgeTraversed)
        .map(|event| {
            (
                event.field_str("source").unwrap(),
                event.field_str("target").unwrap(),
            )
        })
        .collect();
    assert_eq!(traversals, vec![("a", "b"), ("b", "c")]);

    // Every event of the execution carries its execution id.
    assert!(events
        .iter()
        .all(|event| event.execution_id.as_deref() == Some("exec-1")));
}

#[tokio::test]
async fn failed_node_takes_the_on_failure_edge() {
    let graph = GraphSpec::new("g", "risky")
        .add_node(NodeSpec::event_loop("risky").with_max_iterations(1))
        .add_node(NodeSpec::event_loop("cleanup").with_outputs(vec![OutputKey::required("done")]))
        .add_edge(EdgeSpec::on_success("risky", "cleanup"))
        .add_edge(EdgeSpec::on_failure("risky", "cleanup"));
    // risky: one text turn, judge never accepts, budget 1 -> failed.
    let llm = Arc::new(ScriptedClient::new(vec![
        ScriptedTurn::text("hmm"),
        ScriptedTurn::tool_call("set_output", json!({"key": "done", "value": true})),
    ]));
    let (executor, bus, _state) = executor_for(graph, llm, IsolationPolicy::Shared);
    let mut subscription = subscribe_all(&bus);

    let report = executor.execute(Value::Null, None, None).await;
    assert_eq!(report.status, ExecutionStatus::Completed);

    let events = collect_until(&mut subscription, |event| {
        event.event_type == EventType::ExecutionCompleted
    })
    .await;
    let edge = events
        .iter()
        .find(|event| event.event_type == EventType::EdgeTraversed)
        .unwrap();
    assert_eq!(edge.field_str("edge_condition"), Some("on_failure"));
}

#[tokio::test]
async fn failure_without_on_failure_edge_fails_the_execution() {
    let graph = GraphSpec::new("g", "only")
        .add_node(NodeSpec::event_loop("only").with_max_iterations(1));
    let llm = Arc::new(ScriptedClient::new(vec![ScriptedTurn::text("nope")]));
    let (executor, bus, _state) = executor_for(graph, llm, IsolationPolicy::Shared);
    let mut subscription = subscribe_all(&bus);

    let report = executor.execute(Value::Null, None, None).await;
    assert_eq!(report.status, ExecutionStatus::Failed);

    let failed = common::wait_for(&mut subscription, EventType::ExecutionFailed).await;
    assert!(failed.field_str("error").is_some());
}

#[tokio::test]
async fn self_loop_respects_the_visit_cap() {
    // Entry node with max_node_visits = 1 and a self-loop: runs once,
    // then the self-loop edge is refused by the cap; with nowhere viable
    // to go, the execution fails with the cap.
    let graph = GraphSpec::new("g", "loop")
        .add_node(
            NodeSpec::event_loop("loop")
                .with_max_visits(1)
                .with_outputs(vec![OutputKey::required("out")]),
        )
        .add_node(NodeSpec::event_loop("sink"))
        .add_edge(EdgeSpec::always("loop", "loop"))
        .add_edge(EdgeSpec::on_failure("loop", "sink"));
    let llm = Arc::new(ScriptedClient::new(vec![ScriptedTurn::tool_call(
        "set_output",
        json!({"key": "out", "value": 1}),
    )]));
    let (executor, _bus, _state) = executor_for(graph, llm, IsolationPolicy::Shared);

    let report = executor.execute(Value::Null, None, None).await;
    assert_eq!(report.status, ExecutionStatus::Failed);
    assert_eq!(report.error.as_deref(), Some("visit cap exceeded"));
    assert_eq!(executor.visit_counts().get("loop"), Some(&1));
}

#[tokio::test]
async fn bounded_retry_cycle_fails_with_visit_cap() {
    // a -> b -> a cycling via on_success; a's cap of 1 stops the second
    // entry with "visit cap exceeded".
    let graph = GraphSpec::new("g", "a")
        .add_node(
            NodeSpec::event_loop("a")
                .with_max_visits(1)
                .with_outputs(vec![OutputKey::required("a_out")]),
        )
        .add_node(NodeSpec::event_loop("b").with_outputs(vec![OutputKey::required("b_out")]))
        .add_edge(EdgeSpec::on_success("a", "b"))
        .add_edge(EdgeSpec::on_success("b", "a"))
        .add_edge(EdgeSpec::on_failure("b", "a"));
    let llm = Arc::new(ScriptedClient::new(vec![
        ScriptedTurn::tool_call("set_output", json!({"key": "a_out", "value": 1})),
        ScriptedTurn::tool_call("set_output", json!({"key": "b_out", "value": 2})),
    ]));
    let (executor, bus, _state) = executor_for(graph, llm, IsolationPolicy::Shared);
    let mut subscription = subscribe_all(&bus);

    let report = executor.execute(Value::Null, None, None).await;
    assert_eq!(report.status, ExecutionStatus::Failed);
    assert_eq!(report.error.as_deref(), Some("visit cap exceeded"));

    let failed = common::wait_for(&mut subscription, EventType::ExecutionFailed).await;
    assert_eq!(failed.field_str("error"), Some("visit cap exceeded"));
}

#[tokio::test]
async fn conditional_edges_route_on_state() {
    let graph = GraphSpec::new("g", "probe")
        .add_node(NodeSpec::event_loop("probe").with_outputs(vec![OutputKey::required("score")]))
        .add_node(NodeSpec::event_loop("high").with_outputs(vec![OutputKey::required("h")]))
        .add_node(NodeSpec::event_loop("low").with_outputs(vec![OutputKey::required("l")]))
        .add_edge(
            EdgeSpec::new(
                "probe",
                "high",
                EdgeCondition::Conditional(Arc::new(|state| {
                    state
                        .get("score")
                        .and_then(Value::as_i64)
                        .map(|score| score > 5)
                        .unwrap_or(false)
                })),
            )
            .with_priority(1),
        )
        .add_edge(EdgeSpec::on_success("probe", "low").with_priority(2));
    let llm = Arc::new(ScriptedClient::new(vec![
        ScriptedTurn::tool_call("set_output", json!({"key": "score", "value": 9})),
        ScriptedTurn::tool_call("set_output", json!({"key": "h", "value": true})),
    ]));
    let (executor, _bus, _state) = executor_for(graph, llm, IsolationPolicy::Shared);

    let report = executor.execute(Value::Null, None, None).await;
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(
        report.edge_trace,
        vec![("probe".to_string(), "high".to_string())]
    );
}

#[tokio::test]
async fn router_edge_follows_the_model_choice() {
    let graph = GraphSpec::new("g", "dispatch")
        .add_node(NodeSpec::event_loop("dispatch").with_outputs(vec![OutputKey::required("req")]))
        .add_node(NodeSpec::event_loop("billing").with_outputs(vec![OutputKey::required("b")]))
        .add_node(NodeSpec::event_loop("support").with_outputs(vec![OutputKey::required("s")]))
        .add_edge(EdgeSpec::new("dispatch", "billing", EdgeCondition::Router))
        .add_edge(EdgeSpec::new("dispatch", "support", EdgeCondition::Router));
    let llm = Arc::new(ScriptedClient::new(vec![
        ScriptedTurn::tool_call("set_output", json!({"key": "req", "value": "refund"})),
        // Router call answers with a target id.
        ScriptedTurn::text("support"),
        ScriptedTurn::tool_call("set_output", json!({"key": "s", "value": true})),
    ]));
    let (executor, _bus, _state) = executor_for(graph, llm, IsolationPolicy::Shared);

    let report = executor.execute(Value::Null, None, None).await;
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(
        report.edge_trace,
        vec![("dispatch".to_string(), "support".to_string())]
    );
}

fn fan_out_graph() -> GraphSpec {
    GraphSpec::new("g", "split")
        .add_node(NodeSpec::event_loop("split").with_outputs(vec![OutputKey::required("seed")]))
        .add_node(NodeSpec::event_loop("left").with_outputs(vec![OutputKey::required("k")]))
        .add_node(NodeSpec::event_loop("right").with_outputs(vec![OutputKey::required("k")]))
        .add_node(NodeSpec::event_loop("join").with_outputs(vec![OutputKey::required("merged")]))
        .add_edge(EdgeSpec::always("split", "left"))
        .add_edge(EdgeSpec::always("split", "right"))
        .add_edge(EdgeSpec::on_success("left", "join"))
        .add_edge(EdgeSpec::on_success("right", "join"))
}

fn fan_out_script() -> Arc<ScriptedClient> {
    Arc::new(ScriptedClient::new(vec![
        ScriptedTurn::tool_call("set_output", json!({"key": "seed", "value": 1})),
        // Branch order over the shared scripted queue is nondeterministic,
        // but both branches write the same key.
        ScriptedTurn::tool_call("set_output", json!({"key": "k", "value": "first"})),
        ScriptedTurn::tool_call("set_output", json!({"key": "k", "value": "second"})),
        ScriptedTurn::tool_call("set_output", json!({"key": "merged", "value": true})),
    ]))
}

#[tokio::test]
async fn parallel_writes_conflict_under_shared_isolation() {
    let (executor, bus, _state) =
        executor_for(fan_out_graph(), fan_out_script(), IsolationPolicy::Shared);
    let mut subscription = subscribe_all(&bus);

    let report = executor.execute(Value::Null, None, None).await;
    assert_eq!(report.status, ExecutionStatus::Failed);

    let conflict = common::wait_for(&mut subscription, EventType::StateConflict).await;
    assert_eq!(conflict.field_str("key"), Some("k"));
    let failed = common::wait_for(&mut subscription, EventType::ExecutionFailed).await;
    assert!(failed.field_str("error").unwrap().contains("k"));
}

#[tokio::test]
async fn parallel_writes_serialize_under_synchronized_isolation() {
    let (executor, _bus, state) = executor_for(
        fan_out_graph(),
        fan_out_script(),
        IsolationPolicy::Synchronized,
    );

    let report = executor.execute(Value::Null, None, None).await;
    assert_eq!(report.status, ExecutionStatus::Completed);
    // Last staged writer wins; either branch value is acceptable, but the
    // key exists and the join ran.
    assert!(state.get("exec-1", "k").is_some());
    assert_eq!(report.outputs.get("merged"), Some(&json!(true)));
    assert_eq!(executor.visit_counts().get("join"), Some(&1));
}

#[tokio::test]
async fn node_level_retry_reenters_with_a_fresh_conversation() {
    let graph = GraphSpec::new("g", "wobbly").add_node(
        NodeSpec::event_loop("wobbly")
            .with_max_iterations(1)
            .with_max_retries(1)
            .with_outputs(vec![OutputKey::required("out")]),
    );
    let llm = Arc::new(ScriptedClient::new(vec![
        // First attempt: text only, judge cannot accept, budget 1 -> fail.
        ScriptedTurn::text("let me think"),
        // Second attempt (fresh conversation): sets the output.
        ScriptedTurn::tool_call("set_output", json!({"key": "out", "value": 42})),
    ]));
    let (executor, _bus, _state) = executor_for(graph, llm, IsolationPolicy::Shared);

    let report = executor.execute(Value::Null, None, None).await;
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.outputs.get("out"), Some(&json!(42)));
}

#[tokio::test]
async fn function_nodes_run_synchronously_with_loop_events() {
    let graph = GraphSpec::new("g", "calc")
        .add_node(NodeSpec::function(
            "calc",
            Arc::new(|view| {
                let base = view
                    .get("base")
                    .and_then(|value| value.as_i64())
                    .unwrap_or(0);
                let mut outputs = rustc_hash::FxHashMap::default();
                outputs.insert("doubled".to_string(), json!(base * 2));
                Ok(outputs)
            }),
        ))
        .add_node(NodeSpec::event_loop("after").with_outputs(vec![OutputKey::required("done")]))
        .add_edge(EdgeSpec::on_success("calc", "after"));
    let llm = Arc::new(ScriptedClient::new(vec![ScriptedTurn::tool_call(
        "set_output",
        json!({"key": "done", "value": true}),
    )]));
    let (executor, bus, state) = executor_for(graph, llm, IsolationPolicy::Shared);
    state.set("exec-1", "base", json!(21));
    let mut subscription = subscribe_all(&bus);

    let report = executor.execute(Value::Null, None, None).await;
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(state.get("exec-1", "doubled"), Some(json!(42)));

    let events = collect_until(&mut subscription, |event| {
        event.event_type == EventType::ExecutionCompleted
    })
    .await;
    let calc_events: Vec<EventType> = events
        .iter()
        .filter(|event| event.node_id.as_deref() == Some("calc"))
        .map(|event| event.event_type)
        .collect();
    assert!(calc_events.contains(&EventType::NodeLoopStarted));
    assert!(calc_events.contains(&EventType::NodeLoopCompleted));
    let completed = events
        .iter()
        .find(|event| {
            event.node_id.as_deref() == Some("calc")
                && event.event_type == EventType::NodeLoopCompleted
        })
        .unwrap();
    assert_eq!(completed.field("iterations"), Some(&json!(1)));
}

#[tokio::test]
async fn back_edges_are_tagged_on_traversal() {
    let graph = GraphSpec::new("g", "work")
        .add_node(
            NodeSpec::event_loop("work")
                .with_max_visits(2)
                .with_outputs(vec![OutputKey::required("w")]),
        )
        .add_node(NodeSpec::event_loop("check").with_max_iterations(1))
        .add_edge(EdgeSpec::on_success("work", "check"))
        .add_edge(EdgeSpec::on_failure("check", "work"))
        .add_edge(EdgeSpec::on_success("check", "work"));
    let llm = Arc::new(ScriptedClient::new(vec![
        ScriptedTurn::tool_call("set_output", json!({"key": "w", "value": 1})),
        // check: text only, budget 1 -> fails -> back edge to work.
        ScriptedTurn::text("not yet"),
        ScriptedTurn::tool_call("set_output", json!({"key": "w", "value": 2})),
        ScriptedTurn::text("not yet"),
    ]));
    let (executor, bus, _state) = executor_for(graph, llm, IsolationPolicy::Shared);
    let mut subscription = subscribe_all(&bus);

    let report = executor.execute(Value::Null, None, None).await;
    // Second pass: work is at its cap, check fails again, the back edge
    // is refused (cap), no other edge matches -> execution fails.
    assert_eq!(report.status, ExecutionStatus::Failed);

    let events = subscription.drain();
    let back_flags: Vec<bool> = events
        .iter()
        .filter(|event| event.event_type == EventType::EdgeTraversed)
        .map(|event| event.field("back_edge").unwrap().as_bool().unwrap())
        .collect();
    assert_eq!(back_flags, vec![false, true, false]);
}
