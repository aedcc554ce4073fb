//! Shared fixtures for the integration suite.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use hive_core::event::{AgentEvent, EventBus, EventFilter, EventSubscription, EventType};
use hive_core::graph::{EdgeSpec, GraphSpec, NodeSpec, OutputKey};
use hive_core::judge::{EvaluationRule, JudgeProtocol};
use hive_core::llm::{LlmClient, ScriptedClient, ScriptedTurn};
use hive_core::node::{ExecutionControls, NodeContext};
use hive_core::state::{IsolationPolicy, SharedState};
use hive_core::tools::{Tool, ToolError, ToolRegistry};

/// A tool that fails its first `fail_first` invocations, then echoes.
pub struct FlakyTool {
    pub name: String,
    pub fail_first: usize,
    calls: AtomicUsize,
}

impl FlakyTool {
    pub fn new(name: &str, fail_first: usize) -> Self {
        Self {
            name: name.to_string(),
            fail_first,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Tool for FlakyTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, input: Value) -> Result<Value, ToolError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        if call < self.fail_first {
            return Err(ToolError::failed(&self.name, "transient tool failure"));
        }
        Ok(json!({"echo": input, "call": call}))
    }
}

/// Registry with one flaky tool registered.
pub fn registry_with(tool: Arc<dyn Tool>) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(tool);
    Arc::new(registry)
}

/// The judge used by most tests: accept as soon as the node's declared
/// outputs are set, no LLM stage.
pub fn outputs_judge() -> Arc<JudgeProtocol> {
    Arc::new(JudgeProtocol::rules_only(vec![
        EvaluationRule::accept_when_declared_outputs_set(100),
    ]))
}

/// Node context over a fresh bus and shared state.
pub fn node_ctx(
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    judge: Arc<JudgeProtocol>,
) -> (NodeContext, EventBus, SharedState) {
    let bus = EventBus::default();
    let state = SharedState::new(IsolationPolicy::Shared, bus.clone());
    let ctx = NodeContext {
        bus: bus.clone(),
        state: state.view("test-exec"),
        llm,
        tools,
        judge,
        controls: ExecutionControls::unmanaged(),
        identity_prompt: None,
        execution_path: Vec::new(),
    };
    (ctx, bus, state)
}

/// Scripted model that sets one output key and stops.
pub fn set_output_client(key: &str, value: Value) -> Arc<ScriptedClient> {
    Arc::new(ScriptedClient::new(vec![ScriptedTurn::tool_call(
        "set_output",
        json!({"key": key, "value": value}),
    )]))
}

/// Collect events until `predicate` matches one, with a timeout. Returns
/// everything seen including the match.
pub async fn collect_until(
    subscription: &mut EventSubscription,
    predicate: impl Fn(&AgentEvent) -> bool,
) -> Vec<AgentEvent> {
    let mut seen = Vec::new();
    loop {
        match subscription.next_timeout(Duration::from_secs(5)).await {
            Some(event) => {
                let done = predicate(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
            None => panic!(
                "timed out waiting for event; saw: {:?}",
                seen.iter().map(|e| e.event_type).collect::<Vec<_>>()
            ),
        }
    }
}

/// Wait for the first event of the given type.
pub async fn wait_for(subscription: &mut EventSubscription, event_type: EventType) -> AgentEvent {
    collect_until(subscription, |event| event.event_type == event_type)
        .await
        .pop()
        .unwrap()
}

/// Types of the given events, in order.
pub fn types_of(events: &[AgentEvent]) -> Vec<EventType> {
    events.iter().map(|event| event.event_type).collect()
}

/// Subscription over all events.
pub fn subscribe_all(bus: &EventBus) -> EventSubscription {
    bus.subscribe(EventFilter::any())
}

/// A linear three-node graph; every node writes one required output via
/// `set_output`.
pub fn linear_graph() -> GraphSpec {
    GraphSpec::new("linear", "a")
        .add_node(
            NodeSpec::event_loop("a").with_outputs(vec![OutputKey::required("a_out")]),
        )
        .add_node(
            NodeSpec::event_loop("b").with_outputs(vec![OutputKey::required("b_out")]),
        )
        .add_node(
            NodeSpec::event_loop("c").with_outputs(vec![OutputKey::required("c_out")]),
        )
        .add_edge(EdgeSpec::on_success("a", "b"))
        .add_edge(EdgeSpec::on_success("b", "c"))
}

/// One scripted `set_output` turn per linear-graph node.
pub fn linear_script() -> Arc<ScriptedClient> {
    Arc::new(ScriptedClient::new(vec![
        ScriptedTurn::tool_call("set_output", json!({"key": "a_out", "value": "A"})),
        ScriptedTurn::tool_call("set_output", json!({"key": "b_out", "value": "B"})),
        ScriptedTurn::tool_call("set_output", json!({"key": "c_out", "value": "C"})),
    ]))
}
