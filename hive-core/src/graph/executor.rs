//! Walks a graph for one execution.
//!
//! The executor is cycle-oblivious: it follows edges and bounds repeats
//! with per-node visit caps. Within one execution the walk is
//! single-threaded except at declared parallel fan-out points, where each
//! branch runs as a child task against a staged state overlay and the
//! branches join at the nearest common descendant.

use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};

use crate::conversation::{SharedConversation, Turn};
use crate::event::{AgentEvent, EventBus, EventType};
use crate::judge::JudgeProtocol;
use crate::llm::{LlmChunk, LlmClient, LlmRequest};
use crate::node::{
    run_function_node, EventLoopNode, ExecutionControls, NodeContext, NodeResult, NodeStatus,
};
use crate::state::{SharedState, StateView};
use crate::tools::ToolRegistry;

use super::spec::{EdgeCondition, EdgeSpec, GraphSpec, NodeSpec, NodeType};

use futures_util::StreamExt;

/// Lifecycle of one execution. Terminal states are sticky.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

/// Final report of one execution.
#[derive(Clone, Debug)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub outputs: FxHashMap<String, Value>,
    pub error: Option<String>,
    /// `(source, target)` pairs in traversal order.
    pub edge_trace: Vec<(String, String)>,
}

/// Where to pick the walk up again after a checkpoint restore.
#[derive(Clone, Debug, Default)]
pub struct ResumePoint {
    pub current_node: Option<String>,
    pub visit_counts: FxHashMap<String, u32>,
    pub conversations: FxHashMap<String, Vec<Turn>>,
}

enum WalkEnd {
    /// No outgoing edge matched after a successful node.
    Completed,
    /// Reached the fan-out join node without executing it.
    ReachedStop(String),
    Failed(String),
    Cancelled,
}

struct WalkOutcome {
    end: WalkEnd,
    outputs: FxHashMap<String, Value>,
}

enum EdgeDecision<'a> {
    Next(&'a EdgeSpec),
    FanOut(Vec<&'a EdgeSpec>),
    Completed,
    DeadEnd(String),
}

/// One live walk of a [`GraphSpec`].
pub struct GraphExecutor {
    graph: Arc<GraphSpec>,
    /// Scope-stamped with graph, stream, and execution ids.
    bus: EventBus,
    state: SharedState,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    judge: Arc<JudgeProtocol>,
    controls: ExecutionControls,
    execution_id: String,
    visit_counts: Arc<Mutex<FxHashMap<String, u32>>>,
    /// Live conversations per node, shared with the checkpointing path.
    conversations: Arc<Mutex<FxHashMap<String, SharedConversation>>>,
    execution_path: Arc<Mutex<Vec<String>>>,
    /// Node most recently entered; what a checkpoint resumes at.
    current: Arc<Mutex<Option<String>>>,
    back_edges: rustc_hash::FxHashSet<(String, String)>,
}

impl GraphExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: Arc<GraphSpec>,
        bus: EventBus,
        state: SharedState,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        judge: Arc<JudgeProtocol>,
        controls: ExecutionControls,
        execution_id: impl Into<String>,
    ) -> Self {
        let back_edges = graph.back_edges();
        Self {
            graph,
            bus,
            state,
            llm,
            tools,
            judge,
            controls,
            execution_id: execution_id.into(),
            visit_counts: Arc::new(Mutex::new(FxHashMap::default())),
            conversations: Arc::new(Mutex::new(FxHashMap::default())),
            execution_path: Arc::new(Mutex::new(Vec::new())),
            current: Arc::new(Mutex::new(None)),
            back_edges,
        }
    }

    pub fn visit_counts(&self) -> FxHashMap<String, u32> {
        self.visit_counts.lock().clone()
    }

    /// Snapshots of the conversations currently in flight, for
    /// checkpointing while paused.
    pub fn conversation_snapshots(&self) -> FxHashMap<String, Vec<Turn>> {
        self.conversations
            .lock()
            .iter()
            .map(|(node, conversation)| (node.clone(), conversation.snapshot()))
            .collect()
    }

    pub fn current_node(&self) -> Option<String> {
        self.current.lock().clone()
    }

    /// Run the walk to completion. `start_node` overrides the graph's
    /// entry node (entry points may target any node); `resume` restores
    /// visit counts, conversations, and the starting node from a
    /// checkpoint. A fresh run emits `execution_started` first.
    pub async fn execute(
        &self,
        input: Value,
        start_node: Option<String>,
        resume: Option<ResumePoint>,
    ) -> ExecutionReport {
        let start = resume
            .as_ref()
            .and_then(|r| r.current_node.clone())
            .or(start_node)
            .unwrap_or_else(|| self.graph.entry_node.clone());
        let mut restored_conversations = FxHashMap::default();
        if let Some(resume) = resume {
            let mut counts = resume.visit_counts;
            // The checkpointed count includes the in-flight visit; the
            // walk re-enters the node and counts it again.
            if let Some(current) = &resume.current_node {
                if let Some(count) = counts.get_mut(current) {
                    *count = count.saturating_sub(1);
                }
            }
            *self.visit_counts.lock() = counts;
            restored_conversations = resume.conversations;
        } else {
            self.bus.publish(
                AgentEvent::new(EventType::ExecutionStarted).with_data("input", input.clone()),
            );
        }

        let view = self.state.view(self.execution_id.clone());
        let mut edge_trace = Vec::new();
        let outcome = self
            .walk(start, None, view, input, restored_conversations, &mut edge_trace)
            .await;

        match outcome.end {
            WalkEnd::Completed | WalkEnd::ReachedStop(_) => {
                self.bus.publish(
                    AgentEvent::new(EventType::ExecutionCompleted)
                        .with_data("output", json!(outcome.outputs)),
                );
                ExecutionReport {
                    status: ExecutionStatus::Completed,
                    outputs: outcome.outputs,
                    error: None,
                    edge_trace,
                }
            }
            WalkEnd::Failed(error) => {
                self.bus.publish(
                    AgentEvent::new(EventType::ExecutionFailed).with_data("error", json!(error)),
                );
                ExecutionReport {
                    status: ExecutionStatus::Failed,
                    outputs: outcome.outputs,
                    error: Some(error),
                    edge_trace,
                }
            }
            WalkEnd::Cancelled => ExecutionReport {
                status: ExecutionStatus::Cancelled,
                outputs: outcome.outputs,
                error: None,
                edge_trace,
            },
        }
    }

    /// Walk from `current` until a terminal condition, or until reaching
    /// `stop_at` (a fan-out join; the join node itself is not executed).
    fn walk<'a>(
        &'a self,
        mut current: String,
        stop_at: Option<String>,
        view: StateView,
        input: Value,
        mut restored_conversations: FxHashMap<String, Vec<Turn>>,
        edge_trace: &'a mut Vec<(String, String)>,
    ) -> BoxFuture<'a, WalkOutcome> {
        async move {
            let mut outputs: FxHashMap<String, Value> = FxHashMap::default();
            let mut first_node = true;

            loop {
                if self.controls.is_cancelled() {
                    return WalkOutcome {
                        end: WalkEnd::Cancelled,
                        outputs,
                    };
                }
                if stop_at.as_deref() == Some(current.as_str()) {
                    return WalkOutcome {
                        end: WalkEnd::ReachedStop(current),
                        outputs,
                    };
                }

                let Some(spec) = self.graph.node(&current) else {
                    return WalkOutcome {
                        end: WalkEnd::Failed(format!("unknown node {current:?}")),
                        outputs,
                    };
                };

                if !self.record_visit(spec) {
                    return WalkOutcome {
                        end: WalkEnd::Failed("visit cap exceeded".to_string()),
                        outputs,
                    };
                }
                *self.current.lock() = Some(current.clone());

                let restored = restored_conversations.remove(&current);
                let result = self
                    .run_node(spec, &view, first_node.then(|| input.clone()), restored)
                    .await;
                first_node = false;

                if result.status == NodeStatus::Cancelled {
                    return WalkOutcome {
                        end: WalkEnd::Cancelled,
                        outputs,
                    };
                }
                self.execution_path.lock().push(current.clone());
                if result.succeeded() {
                    for (key, value) in &result.outputs {
                        outputs.insert(key.clone(), value.clone());
                    }
                }

                match self.select_edge(spec, &result, &view).await {
                    EdgeDecision::Next(edge) => {
                        self.emit_edge(edge);
                        edge_trace.push((edge.source.clone(), edge.target.clone()));
                        current = edge.target.clone();
                    }
                    EdgeDecision::FanOut(edges) => {
                        let targets: Vec<String> =
                            edges.iter().map(|edge| edge.target.clone()).collect();
                        for edge in &edges {
                            self.emit_edge(edge);
                            edge_trace.push((edge.source.clone(), edge.target.clone()));
                        }
                        let join = self.graph.nearest_common_descendant(&targets);
                        match self
                            .run_branches(&targets, join.clone(), &view, &mut outputs)
                            .await
                        {
                            Ok(()) => {}
                            Err(end) => return WalkOutcome { end, outputs },
                        }
                        match join {
                            Some(join) => current = join,
                            None => {
                                return WalkOutcome {
                                    end: WalkEnd::Completed,
                                    outputs,
                                }
                            }
                        }
                    }
                    EdgeDecision::Completed => {
                        return WalkOutcome {
                            end: WalkEnd::Completed,
                            outputs,
                        }
                    }
                    EdgeDecision::DeadEnd(error) => {
                        return WalkOutcome {
                            end: WalkEnd::Failed(error),
                            outputs,
                        }
                    }
                }
            }
        }
        .boxed()
    }

    /// Record a visit, honoring the node's cap. Returns `false` when the
    /// cap would be exceeded.
    fn record_visit(&self, spec: &NodeSpec) -> bool {
        let mut counts = self.visit_counts.lock();
        let count = counts.entry(spec.id.clone()).or_insert(0);
        if spec.max_node_visits > 0 && *count + 1 > spec.max_node_visits {
            return false;
        }
        *count += 1;
        true
    }

    /// Would one more visit to `node_id` exceed its cap?
    fn would_exceed_cap(&self, node_id: &str) -> bool {
        let Some(spec) = self.graph.node(node_id) else {
            return true;
        };
        if spec.max_node_visits == 0 {
            return false;
        }
        let counts = self.visit_counts.lock();
        counts.get(node_id).copied().unwrap_or(0) + 1 > spec.max_node_visits
    }

    /// Run one node, re-entering from scratch (fresh conversation) on
    /// failure up to the node's retry budget.
    async fn run_node(
        &self,
        spec: &NodeSpec,
        view: &StateView,
        input: Option<Value>,
        restored: Option<Vec<Turn>>,
    ) -> NodeResult {
        let attempts = spec.max_retries + 1;
        let mut last = None;

        // Under `Synchronized` isolation, writes serialize through per-key
        // advisory locks held for the duration of the writing node. Keys
        // are taken in sorted order so two nodes locking overlapping sets
        // cannot deadlock.
        let mut key_guards = Vec::new();
        if self.state.policy() == crate::state::IsolationPolicy::Synchronized {
            let mut keys: Vec<&str> = spec
                .output_keys
                .iter()
                .map(|output| output.key.as_str())
                .collect();
            keys.sort_unstable();
            for key in keys {
                key_guards.push(self.state.lock_key(key).await);
            }
        }

        for attempt in 0..attempts {
            let conversation = match (&restored, attempt) {
                (Some(turns), 0) => SharedConversation::from_turns(turns.clone()),
                _ => {
                    let conversation = SharedConversation::new();
                    conversation.push(Turn::user(Self::kickoff_text(spec, input.as_ref())));
                    conversation
                }
            };
            self.conversations
                .lock()
                .insert(spec.id.clone(), conversation.clone());

            let ctx = NodeContext {
                bus: self.bus.clone(),
                state: view.clone(),
                llm: Arc::clone(&self.llm),
                tools: Arc::clone(&self.tools),
                judge: Arc::clone(&self.judge),
                controls: self.controls.clone(),
                identity_prompt: self.graph.identity_prompt.clone(),
                execution_path: self.execution_path.lock().clone(),
            };

            let result = match &spec.node_type {
                NodeType::EventLoop => EventLoopNode::run(spec, &ctx, &conversation).await,
                NodeType::Function(_) => run_function_node(spec, &ctx).await,
            };

            // Conversation does not survive the node boundary.
            self.conversations.lock().remove(&spec.id);

            match result.status {
                NodeStatus::Failed if attempt + 1 < attempts => {
                    tracing::info!(
                        target: "hive::executor",
                        node = %spec.id,
                        attempt = attempt + 1,
                        budget = attempts,
                        error = result.error.as_deref(),
                        "node failed; re-entering from scratch"
                    );
                    last = Some(result);
                }
                _ => return result,
            }
        }
        last.unwrap_or_else(|| NodeResult::failed("retry budget exhausted", 0))
    }

    fn kickoff_text(spec: &NodeSpec, input: Option<&Value>) -> String {
        match input {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Null) | None if !spec.description.is_empty() => spec.description.clone(),
            Some(Value::Null) | None => "Begin this phase.".to_string(),
            Some(value) => format!("Input: {value}"),
        }
    }

    /// Pick the next edge(s) per the edge rules: ascending priority,
    /// declaration order on ties, first match wins, and equal-priority
    /// `always`/`on_success` groups fan out.
    async fn select_edge<'a>(
        &'a self,
        spec: &NodeSpec,
        result: &NodeResult,
        view: &StateView,
    ) -> EdgeDecision<'a> {
        let edges = self.graph.outgoing(&spec.id);
        let routed = if edges
            .iter()
            .any(|edge| matches!(edge.condition, EdgeCondition::Router))
        {
            self.route_with_llm(&spec.id, &edges).await
        } else {
            None
        };

        let snapshot = view.shared().snapshot();
        let mut cap_refused = false;
        for (index, edge) in edges.iter().enumerate() {
            let matches = match &edge.condition {
                EdgeCondition::Always => true,
                EdgeCondition::OnSuccess => result.succeeded(),
                EdgeCondition::OnFailure => !result.succeeded(),
                EdgeCondition::Conditional(predicate) => predicate(&snapshot),
                EdgeCondition::Router => routed.as_deref() == Some(edge.target.as_str()),
            };
            if !matches {
                continue;
            }
            // A matching edge whose target is already at its visit cap
            // fails; the next edge by priority is tried.
            if self.would_exceed_cap(&edge.target) {
                cap_refused = true;
                continue;
            }

            if matches!(
                edge.condition,
                EdgeCondition::Always | EdgeCondition::OnSuccess
            ) {
                let group: Vec<&EdgeSpec> = edges[index..]
                    .iter()
                    .filter(|candidate| {
                        candidate.priority == edge.priority
                            && candidate.condition.same_kind(&edge.condition)
                            && !self.would_exceed_cap(&candidate.target)
                    })
                    .copied()
                    .collect();
                if group.len() > 1 {
                    return EdgeDecision::FanOut(group);
                }
            }
            return EdgeDecision::Next(edge);
        }

        // Every viable edge was refused by a visit cap: the graph wanted
        // to continue but could not, which is a cap failure rather than a
        // completion.
        if cap_refused {
            return EdgeDecision::DeadEnd("visit cap exceeded".to_string());
        }

        if result.succeeded() {
            EdgeDecision::Completed
        } else {
            EdgeDecision::DeadEnd(
                result
                    .error
                    .clone()
                    .unwrap_or_else(|| "node failed".to_string()),
            )
        }
    }

    /// Ask the LLM to pick among the node's router-edge targets. Errors
    /// and unknown answers skip the router edges entirely.
    async fn route_with_llm(&self, node_id: &str, edges: &[&EdgeSpec]) -> Option<String> {
        let targets: Vec<&str> = edges
            .iter()
            .filter(|edge| matches!(edge.condition, EdgeCondition::Router))
            .map(|edge| edge.target.as_str())
            .collect();
        if targets.is_empty() {
            return None;
        }

        let snapshot = self.state.snapshot();
        let request = LlmRequest {
            system: format!(
                "You route a workflow. Given the current state, reply with \
                 exactly one of these node ids and nothing else: {}",
                targets.join(", ")
            ),
            turns: vec![Turn::user(
                serde_json::to_string(&snapshot).unwrap_or_default(),
            )],
            tools: Vec::new(),
            node_id: Some(node_id.to_string()),
        };

        let mut stream = match self.llm.complete_stream(request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(target: "hive::executor", %error, "router model call failed");
                return None;
            }
        };
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LlmChunk::TextDelta(delta)) => text.push_str(&delta),
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(target: "hive::executor", %error, "router stream failed");
                    return None;
                }
            }
        }
        let answer = text.trim();
        targets
            .iter()
            .find(|target| **target == answer)
            .map(|target| target.to_string())
    }

    fn emit_edge(&self, edge: &EdgeSpec) {
        let back = self
            .back_edges
            .contains(&(edge.source.clone(), edge.target.clone()));
        self.bus.publish(
            AgentEvent::new(EventType::EdgeTraversed)
                .with_data("source", json!(edge.source))
                .with_data("target", json!(edge.target))
                .with_data("edge_condition", json!(edge.condition.label()))
                .with_data("back_edge", json!(back)),
        );
    }

    /// Run parallel branches to the join point and merge their staged
    /// writes. Key conflicts under `Shared`/`Isolated` isolation emit
    /// `state_conflict` and fail the execution.
    async fn run_branches(
        &self,
        targets: &[String],
        join: Option<String>,
        parent_view: &StateView,
        outputs: &mut FxHashMap<String, Value>,
    ) -> Result<(), WalkEnd> {
        let mut branch_futures = Vec::with_capacity(targets.len());
        let mut branch_views = Vec::with_capacity(targets.len());

        for target in targets {
            let branch_view = if parent_view.is_staged() {
                parent_view.staged_child()
            } else {
                self.state.staged_view(self.execution_id.clone())
            };
            branch_views.push(branch_view.clone());
            let target = target.clone();
            let join = join.clone();
            branch_futures.push(async move {
                let mut trace = Vec::new();
                self.walk(
                    target,
                    join,
                    branch_view,
                    Value::Null,
                    FxHashMap::default(),
                    &mut trace,
                )
                .await
            });
        }

        let branch_outcomes = futures_util::future::join_all(branch_futures).await;

        for outcome in &branch_outcomes {
            match &outcome.end {
                WalkEnd::Cancelled => return Err(WalkEnd::Cancelled),
                WalkEnd::Failed(error) => return Err(WalkEnd::Failed(error.clone())),
                WalkEnd::Completed | WalkEnd::ReachedStop(_) => {}
            }
        }

        let overlays: Vec<_> = branch_views
            .iter()
            .map(|view| view.staged_writes())
            .collect();
        if parent_view.is_staged() {
            // Nested fan-out: conflicts are detected against sibling
            // overlays, then everything folds into the parent branch.
            if let Err(conflict) = self.detect_overlay_conflicts(&overlays) {
                self.emit_conflict(&conflict.key);
                return Err(WalkEnd::Failed(conflict.to_string()));
            }
            for overlay in overlays {
                parent_view.apply_overlay(overlay);
            }
        } else if let Err(conflict) = self.state.merge_staged(&self.execution_id, overlays) {
            self.emit_conflict(&conflict.key);
            return Err(WalkEnd::Failed(conflict.to_string()));
        }

        for outcome in branch_outcomes {
            for (key, value) in outcome.outputs {
                outputs.insert(key, value);
            }
        }
        Ok(())
    }

    fn detect_overlay_conflicts(
        &self,
        overlays: &[crate::state::StateSnapshot],
    ) -> Result<(), crate::state::StateConflict> {
        use crate::state::IsolationPolicy;
        if self.state.policy() == IsolationPolicy::Synchronized {
            return Ok(());
        }
        let mut seen: FxHashMap<&String, usize> = FxHashMap::default();
        for (branch, overlay) in overlays.iter().enumerate() {
            for key in overlay.keys() {
                if let Some(&other) = seen.get(key) {
                    return Err(crate::state::StateConflict {
                        key: key.clone(),
                        branches: (other, branch),
                    });
                }
                seen.insert(key, branch);
            }
        }
        Ok(())
    }

    fn emit_conflict(&self, key: &str) {
        self.bus
            .publish(AgentEvent::new(EventType::StateConflict).with_data("key", json!(key)));
    }
}
