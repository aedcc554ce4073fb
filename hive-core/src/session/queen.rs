//! The always-on conversational executor.
//!
//! Every session owns exactly one queen: an event-loop node with an
//! unbounded iteration budget and a client-facing flag, so it streams
//! `client_output_delta` and suspends on `client_input_requested` the
//! same way a worker node would. Chat messages are delivered through the
//! same injection path; a message arriving while the queen is mid-turn is
//! appended to her conversation and picked up on the next iteration.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::conversation::{SharedConversation, Turn};
use crate::event::{EventBus, EventScope};
use crate::graph::NodeSpec;
use crate::judge::JudgeProtocol;
use crate::llm::LlmClient;
use crate::node::{EventLoopNode, ExecutionControls, NodeContext};
use crate::state::SharedState;
use crate::tools::ToolRegistry;

/// Node id the queen registers under for input injection.
pub const QUEEN_NODE_ID: &str = "queen";

const QUEEN_SYSTEM_PROMPT: &str = "You are the session's resident assistant. You talk directly \
     with the user, answer questions about the running agents, and relay \
     anything that needs human judgment. Keep replies short and concrete.";

pub struct Queen {
    controls: ExecutionControls,
    conversation: SharedConversation,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Queen {
    pub fn spawn(
        session_id: &str,
        bus: &EventBus,
        state: &SharedState,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        judge: Arc<JudgeProtocol>,
    ) -> Self {
        let controls = ExecutionControls::unmanaged();
        let conversation = SharedConversation::new();

        let spec = NodeSpec::event_loop(QUEEN_NODE_ID)
            .with_system_prompt(QUEEN_SYSTEM_PROMPT)
            .with_max_iterations(0)
            .client_facing();
        let ctx = NodeContext {
            bus: bus.child(EventScope {
                graph_id: None,
                stream_id: Some(QUEEN_NODE_ID.to_string()),
                execution_id: Some(format!("queen-{session_id}")),
                node_id: None,
            }),
            state: state.view(format!("queen-{session_id}")),
            llm,
            tools,
            judge,
            controls: controls.clone(),
            identity_prompt: None,
            execution_path: Vec::new(),
        };

        let task_controls = controls.clone();
        let task_conversation = conversation.clone();
        let handle = tokio::spawn(async move {
            // Idle until the first chat message; only then engage the
            // model.
            let receiver = task_controls.injections.register(QUEEN_NODE_ID);
            let first = tokio::select! {
                _ = task_controls.cancel.cancelled() => return,
                received = receiver => match received {
                    Ok(content) => content,
                    Err(_) => return,
                },
            };
            task_conversation.push(Turn::user(first));
            // Runs until cancelled: the queen blocks on injected input
            // after every text-only reply.
            let _ = EventLoopNode::run(&spec, &ctx, &task_conversation).await;
        });

        Self {
            controls,
            conversation,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Deliver a chat message. If the queen is blocked awaiting input the
    /// message completes that wait; otherwise it lands in her
    /// conversation and the next iteration picks it up.
    pub fn deliver(&self, message: impl Into<String>) {
        let message = message.into();
        if !self.controls.injections.inject(QUEEN_NODE_ID, message.clone()) {
            self.conversation.push(Turn::user(message));
        }
    }

    pub fn conversation_snapshot(&self) -> Vec<Turn> {
        self.conversation.snapshot()
    }

    pub fn is_stopped(&self) -> bool {
        self.controls.cancel.is_cancelled()
    }

    pub async fn stop(&self) {
        self.controls.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
