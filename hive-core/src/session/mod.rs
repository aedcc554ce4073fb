//! Session lifecycle and routing.
//!
//! A session pairs an always-on queen with an optional worker (one or
//! more graphs run via [`ExecutionStream`]) and a scheduled health judge.
//! Sessions are namespaced in a concurrent map owned by
//! [`SessionManager`]; nothing session-scoped lives in process globals.

pub mod health;
pub mod queen;

pub use health::HealthJudge;
pub use queen::{Queen, QUEEN_NODE_ID};

use std::sync::Arc;

use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, FsCheckpointStore};
use crate::config::RuntimeConfig;
use crate::event::{
    AgentEvent, EventBus, EventFilter, EventSubscription, EventType, JsonlSink, TracingSink,
};
use crate::graph::{ConfigError, ExecutionStatus, GraphSpec, ResumePoint};
use crate::judge::JudgeProtocol;
use crate::llm::{GatedClient, LlmClient};
use crate::state::{IsolationPolicy, SharedState};
use crate::stream::ExecutionStream;
use crate::tools::ToolRegistry;

#[derive(Debug, Error, Diagnostic)]
pub enum SessionError {
    #[error("session already exists: {session_id}")]
    #[diagnostic(code(hive::session::exists))]
    SessionExists { session_id: String },

    #[error("session not found: {session_id}")]
    #[diagnostic(code(hive::session::not_found))]
    SessionNotFound { session_id: String },

    #[error("session {session_id} has no worker loaded")]
    #[diagnostic(code(hive::session::no_worker))]
    NoWorker { session_id: String },

    #[error("no entry point {entry_point_id} in any loaded graph")]
    #[diagnostic(code(hive::session::unknown_entry_point))]
    UnknownEntryPoint { entry_point_id: String },

    #[error("execution not found: {execution_id}")]
    #[diagnostic(code(hive::session::execution_not_found))]
    ExecutionNotFound { execution_id: String },

    #[error("graph not found: {graph_id}")]
    #[diagnostic(code(hive::session::graph_not_found))]
    GraphNotFound { graph_id: String },

    #[error("nothing to deliver chat to")]
    #[diagnostic(
        code(hive::session::no_chat_target),
        help("The session has neither a blocked worker node nor a live queen.")
    )]
    NoChatTarget,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Where a chat message went.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatOutcome {
    /// Delivered to a worker node blocked on `client_input_requested`.
    Injected { node_id: String },
    /// Delivered to the queen's conversation.
    Queen,
}

/// A worker definition: one or more validated graphs.
#[derive(Clone, Debug)]
pub struct WorkerSpec {
    pub worker_id: Option<String>,
    pub graphs: Vec<GraphSpec>,
}

struct WorkerRuntime {
    worker_id: String,
    graphs: Vec<Arc<GraphSpec>>,
    streams: RwLock<FxHashMap<String, Arc<ExecutionStream>>>,
    health: HealthJudge,
}

impl WorkerRuntime {
    fn stream(&self, execution_id: &str) -> Option<Arc<ExecutionStream>> {
        self.streams.read().get(execution_id).cloned()
    }

    fn all_streams(&self) -> Vec<Arc<ExecutionStream>> {
        self.streams.read().values().cloned().collect()
    }
}

pub struct Session {
    session_id: String,
    bus: EventBus,
    state: SharedState,
    queen: Queen,
    worker: RwLock<Option<Arc<WorkerRuntime>>>,
    judge: Arc<JudgeProtocol>,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: RuntimeConfig,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("has_worker", &self.worker.read().is_some())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn has_worker(&self) -> bool {
        self.worker.read().is_some()
    }

    pub fn worker_id(&self) -> Option<String> {
        self.worker
            .read()
            .as_ref()
            .map(|worker| worker.worker_id.clone())
    }

    fn worker(&self) -> Result<Arc<WorkerRuntime>, SessionError> {
        self.worker
            .read()
            .clone()
            .ok_or_else(|| SessionError::NoWorker {
                session_id: self.session_id.clone(),
            })
    }

    fn find_stream(&self, execution_id: &str) -> Result<Arc<ExecutionStream>, SessionError> {
        self.worker()?
            .stream(execution_id)
            .ok_or_else(|| SessionError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })
    }

    /// Fire an entry point. Returns the new execution id.
    pub fn trigger(
        &self,
        entry_point_id: &str,
        input: Value,
    ) -> Result<String, SessionError> {
        let worker = self.worker()?;
        let (graph, entry_point) = worker
            .graphs
            .iter()
            .find_map(|graph| {
                graph
                    .entry_point(entry_point_id)
                    .map(|entry_point| (Arc::clone(graph), entry_point.clone()))
            })
            .ok_or_else(|| SessionError::UnknownEntryPoint {
                entry_point_id: entry_point_id.to_string(),
            })?;

        if entry_point.trigger == crate::graph::TriggerKind::Webhook {
            self.bus.publish(
                AgentEvent::new(EventType::WebhookReceived)
                    .with_stream(entry_point.id.clone())
                    .with_data("entry_point_id", json!(entry_point.id))
                    .with_data("input", input.clone()),
            );
        }

        let stream = ExecutionStream::new(
            graph,
            entry_point.id.clone(),
            &self.bus,
            self.state.clone(),
            Arc::clone(&self.llm),
            Arc::clone(&self.tools),
            Arc::clone(&self.judge),
            None,
        );
        let execution_id = stream.execution_id().to_string();
        worker
            .streams
            .write()
            .insert(execution_id.clone(), Arc::clone(&stream));
        stream.start(input, Some(entry_point.target.clone()), None);
        Ok(execution_id)
    }

    /// Route a chat message: a blocked worker node wins, then the queen.
    pub fn chat(&self, message: &str) -> Result<ChatOutcome, SessionError> {
        if let Ok(worker) = self.worker() {
            for stream in worker.all_streams() {
                for node_id in stream.blocked_nodes() {
                    if stream.inject(&node_id, message) {
                        return Ok(ChatOutcome::Injected { node_id });
                    }
                }
            }
        }
        if self.queen.is_stopped() {
            return Err(SessionError::NoChatTarget);
        }
        self.queen.deliver(message);
        Ok(ChatOutcome::Queen)
    }

    /// Deliver input to a specific blocked node.
    pub fn inject(&self, node_id: &str, content: &str) -> Result<bool, SessionError> {
        let worker = self.worker()?;
        for stream in worker.all_streams() {
            if stream.inject(node_id, content) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Cancel an execution. Terminal.
    pub fn stop(&self, execution_id: &str) -> Result<(), SessionError> {
        self.find_stream(execution_id)?.cancel();
        Ok(())
    }

    /// Pause an execution between iterations and checkpoint it.
    pub async fn pause(&self, execution_id: &str) -> Result<Checkpoint, SessionError> {
        let stream = self.find_stream(execution_id)?;
        stream.pause();
        let checkpoint = self.build_checkpoint(&stream);
        self.checkpoints.save(checkpoint.clone()).await?;
        Ok(checkpoint)
    }

    fn build_checkpoint(&self, stream: &ExecutionStream) -> Checkpoint {
        let (current_node, visit_counts, conversations) = stream.checkpoint_state();
        let mut checkpoint = Checkpoint::new(&self.session_id, stream.execution_id())
            .with_shared_state(self.state.snapshot())
            .with_visit_counts(visit_counts);
        checkpoint.conversations = conversations;
        checkpoint.current_node = current_node;
        checkpoint
    }

    /// Resume paused executions, or restore one from a checkpoint.
    pub async fn resume(&self, checkpoint_id: Option<&str>) -> Result<(), SessionError> {
        match checkpoint_id {
            None => {
                let worker = self.worker()?;
                for stream in worker.all_streams() {
                    if stream.status() == ExecutionStatus::Paused {
                        stream.resume();
                    }
                }
                Ok(())
            }
            Some(checkpoint_id) => {
                let checkpoint = self
                    .checkpoints
                    .load(&self.session_id, checkpoint_id)
                    .await?;
                let execution_id = checkpoint.execution_id.clone();
                self.restore_checkpoint(checkpoint, Some(execution_id), true)
            }
        }
    }

    /// Re-run from a checkpoint under a fresh execution id.
    pub async fn replay(&self, checkpoint_id: &str) -> Result<String, SessionError> {
        let checkpoint = self
            .checkpoints
            .load(&self.session_id, checkpoint_id)
            .await?;
        let execution_id = Uuid::new_v4().to_string();
        self.restore_checkpoint(checkpoint, Some(execution_id.clone()), false)?;
        Ok(execution_id)
    }

    /// Restore state from a checkpoint and start a stream at its current
    /// node. `resumed` controls whether this reads as a continuation
    /// (`execution_resumed`) or a fresh run (`execution_started`).
    fn restore_checkpoint(
        &self,
        checkpoint: Checkpoint,
        execution_id: Option<String>,
        resumed: bool,
    ) -> Result<(), SessionError> {
        let worker = self.worker()?;
        // Replayed executions must find the graph that produced the
        // checkpoint; with one worker loaded, any graph containing the
        // checkpointed node is it.
        let graph = worker
            .graphs
            .iter()
            .find(|graph| {
                checkpoint
                    .current_node
                    .as_deref()
                    .map(|node| graph.node(node).is_some())
                    .unwrap_or(false)
            })
            .or_else(|| worker.graphs.first())
            .cloned()
            .ok_or_else(|| SessionError::NoWorker {
                session_id: self.session_id.clone(),
            })?;

        self.state.restore(checkpoint.shared_state.clone());
        let execution_id = execution_id.unwrap_or_else(|| checkpoint.execution_id.clone());
        self.state.adopt_keys(&execution_id);

        let stream = ExecutionStream::new(
            graph,
            "checkpoint",
            &self.bus,
            self.state.clone(),
            Arc::clone(&self.llm),
            Arc::clone(&self.tools),
            Arc::clone(&self.judge),
            Some(execution_id.clone()),
        );
        let replaced = worker
            .streams
            .write()
            .insert(execution_id.clone(), Arc::clone(&stream));
        if let Some(replaced) = replaced {
            // Resuming under the checkpoint's own id displaces the paused
            // original; its task must not linger.
            replaced.cancel();
        }

        let announce = if resumed {
            EventType::ExecutionResumed
        } else {
            EventType::ExecutionStarted
        };
        self.bus.publish(
            AgentEvent::new(announce)
                .with_execution(execution_id)
                .with_graph(stream.graph_id())
                .with_data("checkpoint_id", json!(checkpoint.checkpoint_id)),
        );

        let resume = ResumePoint {
            current_node: checkpoint.current_node.clone(),
            visit_counts: checkpoint.visit_counts.clone(),
            conversations: checkpoint.conversations.clone(),
        };
        stream.start(Value::Null, None, Some(resume));
        Ok(())
    }

    /// Checkpoint an execution without pausing it.
    pub async fn checkpoint(&self, execution_id: &str) -> Result<Checkpoint, SessionError> {
        let stream = self.find_stream(execution_id)?;
        let checkpoint = self.build_checkpoint(&stream);
        self.checkpoints.save(checkpoint.clone()).await?;
        Ok(checkpoint)
    }

    pub async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, SessionError> {
        Ok(self.checkpoints.list(&self.session_id).await?)
    }

    /// Subscribe to the session's bus.
    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        self.bus.subscribe(filter)
    }

    /// Topology plus per-execution progress for one graph.
    pub fn graph_progress(&self, graph_id: &str) -> Result<Value, SessionError> {
        let worker = self.worker()?;
        let graph = worker
            .graphs
            .iter()
            .find(|graph| graph.id == graph_id)
            .ok_or_else(|| SessionError::GraphNotFound {
                graph_id: graph_id.to_string(),
            })?;
        let back_edges = graph.back_edges();

        let nodes: Vec<Value> = graph
            .nodes
            .iter()
            .map(|node| {
                json!({
                    "id": node.id,
                    "description": node.description,
                    "client_facing": node.client_facing,
                    "max_node_visits": node.max_node_visits,
                })
            })
            .collect();
        let edges: Vec<Value> = graph
            .edges
            .iter()
            .map(|edge| {
                json!({
                    "source": edge.source,
                    "target": edge.target,
                    "condition": edge.condition.label(),
                    "priority": edge.priority,
                    "back_edge": back_edges.contains(&(edge.source.clone(), edge.target.clone())),
                })
            })
            .collect();
        let executions: Vec<Value> = worker
            .all_streams()
            .into_iter()
            .filter(|stream| stream.graph_id() == graph_id)
            .map(|stream| {
                let (current_node, visit_counts, _) = stream.checkpoint_state();
                json!({
                    "execution_id": stream.execution_id(),
                    "status": stream.status().as_str(),
                    "current_node": current_node,
                    "visit_counts": visit_counts,
                })
            })
            .collect();

        Ok(json!({
            "graph_id": graph.id,
            "entry_node": graph.entry_node,
            "nodes": nodes,
            "edges": edges,
            "executions": executions,
        }))
    }

    async fn teardown_worker(worker: &WorkerRuntime) {
        for stream in worker.all_streams() {
            stream.cancel();
        }
        for stream in worker.all_streams() {
            stream.join().await;
        }
        worker.health.stop().await;
    }

    /// Flush a checkpoint for every live execution.
    async fn flush_checkpoints(&self) {
        let Ok(worker) = self.worker() else { return };
        for stream in worker.all_streams() {
            if !stream.status().is_terminal() {
                let checkpoint = self.build_checkpoint(&stream);
                if let Err(error) = self.checkpoints.save(checkpoint).await {
                    tracing::warn!(
                        target: "hive::session",
                        session = %self.session_id,
                        %error,
                        "failed to flush checkpoint during teardown"
                    );
                }
            }
        }
    }
}

/// Owns every live session. All lookups go through the concurrent map;
/// there is deliberately no process-global session state.
pub struct SessionManager {
    sessions: RwLock<FxHashMap<String, Arc<Session>>>,
    config: RuntimeConfig,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl SessionManager {
    /// Wraps the provider in the engine's concurrency gate and wires the
    /// default filesystem checkpoint store under the hive home.
    pub fn new(config: RuntimeConfig, llm: Arc<dyn LlmClient>, tools: Arc<ToolRegistry>) -> Self {
        let gated: Arc<dyn LlmClient> = Arc::new(
            GatedClient::new(llm, config.llm_concurrency)
                .with_request_timeout(config.llm_request_timeout),
        );
        let mut store = FsCheckpointStore::new(config.checkpoints_dir());
        if let Some(ttl) = config.checkpoint_ttl {
            store = store.with_ttl(ttl);
        }
        Self {
            sessions: RwLock::new(FxHashMap::default()),
            config,
            llm: gated,
            tools,
            checkpoints: Arc::new(store),
        }
    }

    /// Swap the checkpoint store (tests use the in-memory one).
    #[must_use]
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }

    pub fn create_session(
        &self,
        session_id: Option<String>,
        isolation: Option<IsolationPolicy>,
    ) -> Result<Arc<Session>, SessionError> {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        {
            let sessions = self.sessions.read();
            if sessions.contains_key(&session_id) {
                return Err(SessionError::SessionExists { session_id });
            }
        }

        let bus = EventBus::new(self.config.event_buffer_capacity);
        bus.add_sink(TracingSink);
        if self.config.event_log_enabled {
            match JsonlSink::create(self.config.event_log_path()) {
                Ok(sink) => bus.add_sink(sink),
                Err(error) => {
                    tracing::warn!(target: "hive::session", %error, "event log sink unavailable");
                }
            }
        }

        let state = SharedState::new(
            isolation.unwrap_or(self.config.isolation),
            bus.clone(),
        );
        let judge = Arc::new(
            JudgeProtocol::new(
                vec![crate::judge::EvaluationRule::accept_when_declared_outputs_set(100)],
                Some(Arc::clone(&self.llm)),
            )
            .with_confidence_threshold(self.config.judge_confidence_threshold),
        );
        let queen = Queen::spawn(
            &session_id,
            &bus,
            &state,
            Arc::clone(&self.llm),
            Arc::clone(&self.tools),
            Arc::clone(&judge),
        );

        let session = Arc::new(Session {
            session_id: session_id.clone(),
            bus,
            state,
            queen,
            worker: RwLock::new(None),
            judge,
            llm: Arc::clone(&self.llm),
            tools: Arc::clone(&self.tools),
            checkpoints: Arc::clone(&self.checkpoints),
            config: self.config.clone(),
        });

        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session_id) {
            return Err(SessionError::SessionExists { session_id });
        }
        sessions.insert(session_id, Arc::clone(&session));
        Ok(session)
    }

    pub fn session(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Load (or replace) the session's worker. Graphs are validated
    /// before anything existing is torn down.
    pub async fn load_worker(
        &self,
        session_id: &str,
        spec: WorkerSpec,
    ) -> Result<(), SessionError> {
        let session = self.session(session_id)?;
        for graph in &spec.graphs {
            graph.validate()?;
        }

        let previous = session.worker.write().take();
        if let Some(previous) = previous {
            Session::teardown_worker(&previous).await;
        }

        let worker = Arc::new(WorkerRuntime {
            worker_id: spec
                .worker_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            graphs: spec.graphs.into_iter().map(Arc::new).collect(),
            streams: RwLock::new(FxHashMap::default()),
            health: HealthJudge::spawn(session.bus.clone(), session.config.health_interval),
        });
        *session.worker.write() = Some(worker);
        Ok(())
    }

    /// Tear down the worker and its health judge; the queen survives.
    /// No-op when no worker is loaded.
    pub async fn unload_worker(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self.session(session_id)?;
        let worker = session.worker.write().take();
        if let Some(worker) = worker {
            Session::teardown_worker(&worker).await;
        }
        Ok(())
    }

    /// Cancel everything, flush checkpoints, tear down in reverse of
    /// creation order (worker, then queen, then bus).
    pub async fn stop_session(&self, session_id: &str) -> Result<(), SessionError> {
        let session = {
            self.sessions
                .write()
                .remove(session_id)
                .ok_or_else(|| SessionError::SessionNotFound {
                    session_id: session_id.to_string(),
                })?
        };

        session.flush_checkpoints().await;
        let worker = session.worker.write().take();
        if let Some(worker) = worker {
            Session::teardown_worker(&worker).await;
        }
        session.queen.stop().await;
        session.bus.shutdown().await;
        Ok(())
    }
}
