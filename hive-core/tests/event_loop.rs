mod common;

use std::sync::Arc;

use serde_json::json;

use common::{
    collect_until, node_ctx, outputs_judge, registry_with, set_output_client, subscribe_all,
    types_of, FlakyTool,
};
use hive_core::conversation::SharedConversation;
use hive_core::event::EventType;
use hive_core::graph::{NodeSpec, OutputKey};
use hive_core::judge::JudgeProtocol;
use hive_core::llm::{ScriptedClient, ScriptedTurn};
use hive_core::node::{EventLoopNode, NodeStatus};
use hive_core::tools::ToolRegistry;

fn conversation() -> SharedConversation {
    let conversation = SharedConversation::new();
    conversation.push(hive_core::conversation::Turn::user("go"));
    conversation
}

#[tokio::test]
async fn set_output_then_accept_completes_the_node() {
    let spec = NodeSpec::event_loop("writer").with_outputs(vec![OutputKey::required("report")]);
    let llm = set_output_client("report", json!("done"));
    let (ctx, bus, state) = node_ctx(llm, Arc::new(ToolRegistry::new()), outputs_judge());
    let mut subscription = subscribe_all(&bus);

    let result = EventLoopNode::run(&spec, &ctx, &conversation()).await;
    assert_eq!(result.status, NodeStatus::Success);
    assert_eq!(result.outputs.get("report"), Some(&json!("done")));
    assert_eq!(result.iterations, 1);
    assert_eq!(state.get("test-exec", "report"), Some(json!("done")));

    let events = collect_until(&mut subscription, |event| {
        event.event_type == EventType::NodeLoopCompleted
    })
    .await;
    let types = types_of(&events);
    assert_eq!(
        types,
        vec![
            EventType::NodeLoopStarted,
            EventType::NodeLoopIteration,
            EventType::ToolCallStarted,
            EventType::StateChanged,
            EventType::OutputKeySet,
            EventType::ToolCallCompleted,
            EventType::JudgeVerdict,
            EventType::NodeLoopCompleted,
        ]
    );
    // Node-scoped events carry the node's id via the scoped bus (the
    // state-change notification is published by the state store itself).
    assert!(events
        .iter()
        .filter(|event| event.event_type != EventType::StateChanged)
        .all(|event| event.node_id.as_deref() == Some("writer")));
}

#[tokio::test]
async fn tool_errors_flow_back_as_results_until_success() {
    // Scenario: the only tool fails twice, succeeds on the third call,
    // then the model records its output.
    let spec = NodeSpec::event_loop("fetcher")
        .with_outputs(vec![OutputKey::required("data")])
        .with_tools(vec!["fetch".to_string()]);
    let llm = Arc::new(ScriptedClient::new(vec![
        ScriptedTurn::tool_call("fetch", json!({"page": 1})),
        ScriptedTurn::tool_call("fetch", json!({"page": 2})),
        ScriptedTurn::tool_call("fetch", json!({"page": 3})),
        ScriptedTurn::tool_call("set_output", json!({"key": "data", "value": "fetched"})),
    ]));
    let tool = Arc::new(FlakyTool::new("fetch", 2));
    let (ctx, bus, _state) = node_ctx(llm, registry_with(tool.clone()), outputs_judge());
    let mut subscription = subscribe_all(&bus);

    let result = EventLoopNode::run(&spec, &ctx, &conversation()).await;
    assert_eq!(result.status, NodeStatus::Success);
    assert_eq!(tool.calls(), 3);

    let events = collect_until(&mut subscription, |event| {
        event.event_type == EventType::NodeLoopCompleted
    })
    .await;
    let completions: Vec<bool> = events
        .iter()
        .filter(|event| {
            event.event_type == EventType::ToolCallCompleted
                && event.field_str("tool_name") == Some("fetch")
        })
        .map(|event| event.field("is_error").unwrap().as_bool().unwrap())
        .collect();
    assert_eq!(completions, vec![true, true, false]);
    // The judge accepted on the iteration after the successful call.
    let verdict = events
        .iter()
        .find(|event| event.event_type == EventType::JudgeVerdict)
        .unwrap();
    assert_eq!(verdict.field_str("action"), Some("accept"));
}

#[tokio::test]
async fn identical_replies_three_times_stall_the_node() {
    let spec = NodeSpec::event_loop("thinker");
    let llm = Arc::new(ScriptedClient::new(vec![
        ScriptedTurn::text("I am thinking."),
        ScriptedTurn::text("I am thinking."),
        ScriptedTurn::text("I am thinking."),
    ]));
    // Judge keeps retrying so only the stall detector can end the node.
    let judge = Arc::new(JudgeProtocol::rules_only(vec![]));
    let (ctx, bus, _state) = node_ctx(llm, Arc::new(ToolRegistry::new()), judge);
    let mut subscription = subscribe_all(&bus);

    let result = EventLoopNode::run(&spec, &ctx, &conversation()).await;
    assert_eq!(result.status, NodeStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("node stalled"));

    let events = collect_until(&mut subscription, |event| {
        event.event_type == EventType::NodeStalled
    })
    .await;
    assert_eq!(events.last().unwrap().event_type, EventType::NodeStalled);
}

#[tokio::test]
async fn doom_loop_nudges_then_fails_on_recurrence() {
    let spec = NodeSpec::event_loop("looper").with_tools(vec!["fetch".to_string()]);
    let same_call = || ScriptedTurn::tool_call("fetch", json!({"page": 1}));
    let llm = Arc::new(ScriptedClient::new(vec![
        same_call(),
        same_call(),
        same_call(), // third repeat: doom loop detected, nudge injected
        same_call(), // recurrence after nudge: fail
    ]));
    let (ctx, bus, _state) = node_ctx(
        llm,
        registry_with(Arc::new(FlakyTool::new("fetch", 0))),
        outputs_judge(),
    );
    let mut subscription = subscribe_all(&bus);

    let result = EventLoopNode::run(&spec, &ctx, &conversation()).await;
    assert_eq!(result.status, NodeStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("tool doom loop"));

    let events = subscription.drain();
    let doom_events = events
        .iter()
        .filter(|event| event.event_type == EventType::NodeToolDoomLoop)
        .count();
    assert_eq!(doom_events, 2);
}

#[tokio::test]
async fn accept_with_missing_keys_synthesizes_retry_feedback() {
    let spec = NodeSpec::event_loop("strict").with_outputs(vec![
        OutputKey::required("a"),
        OutputKey::required("b"),
    ]);
    // The judge LLM accepts eagerly even though only `a` was set; the
    // engine downgrades that to a retry until `b` exists.
    let judge_llm = Arc::new(ScriptedClient::new(vec![
        ScriptedTurn::text(r#"{"action": "accept", "confidence": 0.95}"#),
        ScriptedTurn::text(r#"{"action": "accept", "confidence": 0.95}"#),
    ]));
    let llm = Arc::new(ScriptedClient::new(vec![
        ScriptedTurn::tool_call("set_output", json!({"key": "a", "value": 1})),
        ScriptedTurn::text("all done"),
        ScriptedTurn::tool_call("set_output", json!({"key": "b", "value": 2})),
    ]));
    let judge = Arc::new(JudgeProtocol::new(
        vec![hive_core::judge::EvaluationRule::accept_when_declared_outputs_set(100)],
        Some(judge_llm),
    ));
    let (ctx, bus, _state) = node_ctx(llm, Arc::new(ToolRegistry::new()), judge);
    let mut subscription = subscribe_all(&bus);

    let result = EventLoopNode::run(&spec, &ctx, &conversation()).await;
    assert_eq!(result.status, NodeStatus::Success);

    let events = collect_until(&mut subscription, |event| {
        event.event_type == EventType::NodeLoopCompleted
    })
    .await;
    let feedback = events
        .iter()
        .filter(|event| event.event_type == EventType::JudgeVerdict)
        .find(|event| {
            event
                .field_str("feedback")
                .map(|feedback| feedback.contains("missing keys: b"))
                .unwrap_or(false)
        });
    assert!(feedback.is_some(), "expected a missing-keys verdict");
}

#[tokio::test]
async fn escalate_tool_exits_with_escalated_status() {
    let spec = NodeSpec::event_loop("blocked");
    let llm = Arc::new(ScriptedClient::new(vec![ScriptedTurn::tool_call(
        "escalate_to_coder",
        json!({"reason": "missing credentials", "context": "no API key in scope"}),
    )]));
    let (ctx, bus, _state) = node_ctx(llm, Arc::new(ToolRegistry::new()), outputs_judge());
    let mut subscription = subscribe_all(&bus);

    let result = EventLoopNode::run(&spec, &ctx, &conversation()).await;
    assert_eq!(result.status, NodeStatus::Escalated);
    assert_eq!(result.error.as_deref(), Some("missing credentials"));

    let events = collect_until(&mut subscription, |event| {
        event.event_type == EventType::EscalationRequested
    })
    .await;
    let escalation = events.last().unwrap();
    assert_eq!(escalation.field_str("reason"), Some("missing credentials"));
}

#[tokio::test]
async fn client_facing_node_blocks_until_injection() {
    let spec = NodeSpec::event_loop("greeter")
        .with_outputs(vec![OutputKey::required("name")])
        .client_facing();
    let llm = Arc::new(ScriptedClient::new(vec![
        ScriptedTurn::text("What is your name?"),
        ScriptedTurn::tool_call("set_output", json!({"key": "name", "value": "Alice"})),
    ]));
    let (ctx, bus, _state) = node_ctx(llm, Arc::new(ToolRegistry::new()), outputs_judge());
    let mut subscription = subscribe_all(&bus);
    let injections = ctx.controls.injections.clone();

    let task = tokio::spawn({
        let spec = spec.clone();
        let ctx = ctx.clone();
        async move { EventLoopNode::run(&spec, &ctx, &conversation()).await }
    });

    let request = common::wait_for(&mut subscription, EventType::ClientInputRequested).await;
    assert_eq!(request.field_str("prompt"), Some("What is your name?"));
    assert_eq!(injections.blocked_nodes(), vec!["greeter".to_string()]);

    assert!(injections.inject("greeter", "Alice"));
    let result = task.await.unwrap();
    assert_eq!(result.status, NodeStatus::Success);
    assert_eq!(result.outputs.get("name"), Some(&json!("Alice")));

    // Client-facing nodes stream client deltas, not engine deltas.
    let events = subscription.drain();
    assert!(events
        .iter()
        .all(|event| event.event_type != EventType::LlmTextDelta));
}

#[tokio::test]
async fn iteration_budget_exhaustion_fails_the_node() {
    let spec = NodeSpec::event_loop("bounded")
        .with_max_iterations(2)
        .with_outputs(vec![OutputKey::required("never")]);
    let llm = Arc::new(ScriptedClient::new(vec![]).with_fallback("still working"));
    let judge = Arc::new(JudgeProtocol::rules_only(vec![]));
    let (ctx, _bus, _state) = node_ctx(llm, Arc::new(ToolRegistry::new()), judge);

    let result = EventLoopNode::run(&spec, &ctx, &conversation()).await;
    assert_eq!(result.status, NodeStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("iteration budget exhausted"));
    assert_eq!(result.iterations, 2);
}

#[tokio::test]
async fn transient_llm_errors_retry_with_events_then_succeed() {
    let spec = NodeSpec::event_loop("flaky").with_outputs(vec![OutputKey::required("out")]);
    let llm = Arc::new(ScriptedClient::new(vec![
        ScriptedTurn::transient_error("overloaded"),
        ScriptedTurn::transient_error("overloaded again"),
        ScriptedTurn::tool_call("set_output", json!({"key": "out", "value": true})),
    ]));
    let (ctx, bus, _state) = node_ctx(llm, Arc::new(ToolRegistry::new()), outputs_judge());
    let mut subscription = subscribe_all(&bus);

    let result = EventLoopNode::run(&spec, &ctx, &conversation()).await;
    assert_eq!(result.status, NodeStatus::Success);

    let events = collect_until(&mut subscription, |event| {
        event.event_type == EventType::NodeLoopCompleted
    })
    .await;
    let retries: Vec<i64> = events
        .iter()
        .filter(|event| event.event_type == EventType::NodeRetry)
        .map(|event| event.field("retry_count").unwrap().as_i64().unwrap())
        .collect();
    assert_eq!(retries, vec![1, 2]);
}

#[tokio::test]
async fn retry_budget_exhaustion_fails_the_node() {
    let spec = NodeSpec::event_loop("doomed");
    let llm = Arc::new(ScriptedClient::new(vec![
        ScriptedTurn::transient_error("down"),
        ScriptedTurn::transient_error("down"),
        ScriptedTurn::transient_error("down"),
        ScriptedTurn::transient_error("down"),
    ]));
    let (ctx, _bus, _state) = node_ctx(llm, Arc::new(ToolRegistry::new()), outputs_judge());

    let result = EventLoopNode::run(&spec, &ctx, &conversation()).await;
    assert_eq!(result.status, NodeStatus::Failed);
    assert!(result.error.unwrap().contains("down"));
}

#[tokio::test]
async fn text_deltas_accumulate_into_snapshots() {
    let spec = NodeSpec::event_loop("streamer").with_outputs(vec![OutputKey::required("out")]);
    let llm = Arc::new(ScriptedClient::new(vec![
        ScriptedTurn::text("hello streaming world"),
        ScriptedTurn::tool_call("set_output", json!({"key": "out", "value": 1})),
    ]));
    let judge = Arc::new(JudgeProtocol::rules_only(vec![
        hive_core::judge::EvaluationRule::accept_when_declared_outputs_set(100),
    ]));
    let (ctx, bus, _state) = node_ctx(llm, Arc::new(ToolRegistry::new()), judge);
    let mut subscription = subscribe_all(&bus);

    let result = EventLoopNode::run(&spec, &ctx, &conversation()).await;
    assert_eq!(result.status, NodeStatus::Success);

    let events = collect_until(&mut subscription, |event| {
        event.event_type == EventType::NodeLoopCompleted
    })
    .await;
    let deltas: Vec<&hive_core::event::AgentEvent> = events
        .iter()
        .filter(|event| event.event_type == EventType::LlmTextDelta)
        .collect();
    assert!(deltas.len() > 1);
    let rebuilt: String = deltas
        .iter()
        .map(|event| event.field_str("content").unwrap())
        .collect();
    assert_eq!(rebuilt, "hello streaming world");
    assert_eq!(
        deltas.last().unwrap().field_str("snapshot"),
        Some("hello streaming world")
    );
}
