pub mod event_loop;
pub mod function;

pub use event_loop::EventLoopNode;
pub use function::run_function_node;

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::event::EventBus;
use crate::judge::JudgeProtocol;
use crate::llm::LlmClient;
use crate::state::StateView;
use crate::tools::ToolRegistry;

/// How a node run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    Success,
    Failed,
    Escalated,
    Cancelled,
}

/// Outcome of one node invocation.
#[derive(Clone, Debug)]
pub struct NodeResult {
    pub outputs: FxHashMap<String, Value>,
    pub status: NodeStatus,
    pub iterations: u32,
    pub error: Option<String>,
}

impl NodeResult {
    pub fn success(outputs: FxHashMap<String, Value>, iterations: u32) -> Self {
        Self {
            outputs,
            status: NodeStatus::Success,
            iterations,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, iterations: u32) -> Self {
        Self {
            outputs: FxHashMap::default(),
            status: NodeStatus::Failed,
            iterations,
            error: Some(error.into()),
        }
    }

    pub fn escalated(reason: impl Into<String>, iterations: u32) -> Self {
        Self {
            outputs: FxHashMap::default(),
            status: NodeStatus::Escalated,
            iterations,
            error: Some(reason.into()),
        }
    }

    pub fn cancelled(iterations: u32) -> Self {
        Self {
            outputs: FxHashMap::default(),
            status: NodeStatus::Cancelled,
            iterations,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == NodeStatus::Success
    }
}

/// Routes injected client input to the node blocked waiting for it.
///
/// A blocked node registers under its node id; `inject` completes the
/// waiting receiver. Registration is last-writer-wins per node id, which
/// matches one-in-flight-invocation-per-node execution.
#[derive(Clone, Default)]
pub struct InjectionRouter {
    waiting: Arc<Mutex<FxHashMap<String, oneshot::Sender<String>>>>,
}

impl InjectionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node as blocked and get the receiver its input will
    /// arrive on.
    pub fn register(&self, node_id: &str) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(node_id.to_string(), tx);
        rx
    }

    /// Deliver input to a blocked node. Returns whether anything was
    /// waiting.
    pub fn inject(&self, node_id: &str, content: impl Into<String>) -> bool {
        let sender = self.waiting.lock().remove(node_id);
        match sender {
            Some(sender) => sender.send(content.into()).is_ok(),
            None => false,
        }
    }

    /// Node ids currently blocked on input, in no particular order.
    pub fn blocked_nodes(&self) -> Vec<String> {
        self.waiting.lock().keys().cloned().collect()
    }

    pub fn unregister(&self, node_id: &str) {
        self.waiting.lock().remove(node_id);
    }
}

/// Cooperative control surface threaded through every suspension point of
/// an execution: cancellation, pause/resume, and client-input injection.
#[derive(Clone)]
pub struct ExecutionControls {
    pub cancel: CancellationToken,
    pause: watch::Receiver<bool>,
    /// Keeps the pause channel open when the controls own it themselves.
    _own_pause: Option<Arc<watch::Sender<bool>>>,
    pub injections: InjectionRouter,
}

impl ExecutionControls {
    pub fn new(
        cancel: CancellationToken,
        pause: watch::Receiver<bool>,
        injections: InjectionRouter,
    ) -> Self {
        Self {
            cancel,
            pause,
            _own_pause: None,
            injections,
        }
    }

    /// Standalone controls that never pause; used by the queen and tests.
    pub fn unmanaged() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            pause: rx,
            _own_pause: Some(Arc::new(tx)),
            injections: InjectionRouter::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    /// Block while paused. Returns `false` when cancelled instead of
    /// resumed.
    pub async fn wait_if_paused(&self) -> bool {
        let mut pause = self.pause.clone();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !*pause.borrow() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = pause.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

/// Everything a node handler needs from its execution environment.
#[derive(Clone)]
pub struct NodeContext {
    /// Scope-stamped bus: graph, stream, and execution ids are already
    /// applied; the node id is stamped per node by the executor.
    pub bus: EventBus,
    pub state: StateView,
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<ToolRegistry>,
    pub judge: Arc<JudgeProtocol>,
    pub controls: ExecutionControls,
    /// Agent-level identity prompt (layer 1).
    pub identity_prompt: Option<String>,
    /// Node ids completed so far in this execution, for the narrative
    /// layer.
    pub execution_path: Vec<String>,
}
