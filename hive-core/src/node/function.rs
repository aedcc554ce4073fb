//! Function-node handler.
//!
//! Function nodes run a synchronous host closure instead of an LLM loop.
//! They still publish the loop lifecycle events with `iterations = 1` so
//! subscribers see a uniform shape regardless of node type.

use serde_json::json;

use crate::event::{AgentEvent, EventType};
use crate::graph::{NodeSpec, NodeType};

use super::{NodeContext, NodeResult};

pub async fn run_function_node(spec: &NodeSpec, ctx: &NodeContext) -> NodeResult {
    let NodeType::Function(handler) = &spec.node_type else {
        return NodeResult::failed("not a function node", 0);
    };
    let bus = ctx.bus.child_for_node(&spec.id);

    if !ctx.controls.wait_if_paused().await {
        return NodeResult::cancelled(0);
    }

    bus.publish(AgentEvent::new(EventType::NodeLoopStarted).with_data("max_iterations", json!(1)));

    match handler(&ctx.state) {
        Ok(outputs) => {
            for (key, value) in &outputs {
                ctx.state.set(key, value.clone());
                bus.publish(
                    AgentEvent::new(EventType::OutputKeySet)
                        .with_data("key", json!(key))
                        .with_data("value", value.clone()),
                );
            }
            bus.publish(
                AgentEvent::new(EventType::NodeLoopCompleted)
                    .with_data("iterations", json!(1))
                    .with_data("status", json!("success")),
            );
            NodeResult::success(outputs, 1)
        }
        Err(error) => {
            bus.publish(
                AgentEvent::new(EventType::NodeLoopCompleted)
                    .with_data("iterations", json!(1))
                    .with_data("status", json!("failed"))
                    .with_data("error", json!(error)),
            );
            NodeResult::failed(error, 1)
        }
    }
}
