//! One live execution of a graph.
//!
//! An [`ExecutionStream`] owns the execution id, the scope-stamped child
//! bus, and the control surface: cancellation (terminal), pause/resume
//! (suspending between node iterations), and client-input injection. The
//! walk itself runs on a spawned task; terminal statuses are write-once.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::conversation::Turn;
use crate::event::{AgentEvent, EventBus, EventScope, EventType};
use crate::graph::{ExecutionReport, ExecutionStatus, GraphExecutor, GraphSpec, ResumePoint};
use crate::judge::JudgeProtocol;
use crate::llm::LlmClient;
use crate::node::{ExecutionControls, InjectionRouter};
use crate::state::SharedState;
use crate::tools::ToolRegistry;

pub struct ExecutionStream {
    execution_id: String,
    stream_id: String,
    graph: Arc<GraphSpec>,
    bus: EventBus,
    controls: ExecutionControls,
    pause_tx: watch::Sender<bool>,
    status: Arc<RwLock<ExecutionStatus>>,
    executor: Arc<GraphExecutor>,
    report: Arc<RwLock<Option<ExecutionReport>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionStream {
    /// Build a stream for one run of `graph` from the given entry point.
    /// `execution_id` is generated unless a resume supplies one.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: Arc<GraphSpec>,
        stream_id: impl Into<String>,
        session_bus: &EventBus,
        state: SharedState,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        judge: Arc<JudgeProtocol>,
        execution_id: Option<String>,
    ) -> Arc<Self> {
        let execution_id = execution_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let stream_id = stream_id.into();
        let bus = session_bus.child(EventScope {
            graph_id: Some(graph.id.clone()),
            stream_id: Some(stream_id.clone()),
            execution_id: Some(execution_id.clone()),
            node_id: None,
        });

        let (pause_tx, pause_rx) = watch::channel(false);
        let controls = ExecutionControls::new(
            CancellationToken::new(),
            pause_rx,
            InjectionRouter::new(),
        );
        let executor = Arc::new(GraphExecutor::new(
            Arc::clone(&graph),
            bus.clone(),
            state,
            llm,
            tools,
            judge,
            controls.clone(),
            execution_id.clone(),
        ));

        Arc::new(Self {
            execution_id,
            stream_id,
            graph,
            bus,
            controls,
            pause_tx,
            status: Arc::new(RwLock::new(ExecutionStatus::Pending)),
            executor,
            report: Arc::new(RwLock::new(None)),
            handle: Mutex::new(None),
        })
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn graph_id(&self) -> &str {
        &self.graph.id
    }

    pub fn status(&self) -> ExecutionStatus {
        *self.status.read()
    }

    /// The final report, once terminal.
    pub fn report(&self) -> Option<ExecutionReport> {
        self.report.read().clone()
    }

    /// Spawn the walk. `start_node` lets an entry point target a node
    /// other than the graph's entry. A second call is a no-op.
    pub fn start(self: &Arc<Self>, input: Value, start_node: Option<String>, resume: Option<ResumePoint>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        Self::set_status(&self.status, ExecutionStatus::Running);

        let stream = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            let report = stream.executor.execute(input, start_node, resume).await;
            Self::set_status(&stream.status, report.status);
            *stream.report.write() = Some(report);
        }));
    }

    /// Terminal states are write-once; everything else follows the walk.
    fn set_status(status: &RwLock<ExecutionStatus>, next: ExecutionStatus) {
        let mut guard = status.write();
        if !guard.is_terminal() {
            *guard = next;
        }
    }

    /// Suspend between node iterations. Emits `execution_paused`.
    pub fn pause(&self) {
        if self.status().is_terminal() {
            return;
        }
        let _ = self.pause_tx.send(true);
        Self::set_status(&self.status, ExecutionStatus::Paused);
        self.bus.publish(AgentEvent::new(EventType::ExecutionPaused));
    }

    /// Resume a paused stream. Emits `execution_resumed`.
    pub fn resume(&self) {
        if self.status() != ExecutionStatus::Paused {
            return;
        }
        let _ = self.pause_tx.send(false);
        Self::set_status(&self.status, ExecutionStatus::Running);
        self.bus
            .publish(AgentEvent::new(EventType::ExecutionResumed));
    }

    /// Cancel cooperatively. Terminal: the stream cannot be restarted.
    pub fn cancel(&self) {
        self.controls.cancel.cancel();
        Self::set_status(&self.status, ExecutionStatus::Cancelled);
    }

    /// Deliver input to a node blocked on `client_input_requested`.
    /// Returns whether a node was waiting.
    pub fn inject(&self, node_id: &str, content: impl Into<String>) -> bool {
        self.controls.injections.inject(node_id, content)
    }

    /// Node ids currently blocked awaiting client input.
    pub fn blocked_nodes(&self) -> Vec<String> {
        self.controls.injections.blocked_nodes()
    }

    /// Live checkpointing inputs: current node, visit counts, and
    /// in-flight conversations. Meaningful while paused.
    pub fn checkpoint_state(&self) -> (Option<String>, FxHashMap<String, u32>, FxHashMap<String, Vec<Turn>>) {
        (
            self.executor.current_node(),
            self.executor.visit_counts(),
            self.executor.conversation_snapshots(),
        )
    }

    /// Await the walk task, swallowing join errors during teardown.
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for ExecutionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStream")
            .field("execution_id", &self.execution_id)
            .field("stream_id", &self.stream_id)
            .field("graph_id", &self.graph.id)
            .field("status", &self.status())
            .finish()
    }
}
