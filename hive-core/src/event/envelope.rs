use std::fmt;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of event types the runtime can publish.
///
/// The serialized form is the `snake_case` variant name, which is what SSE
/// clients filter on. `Custom` is the only open-ended member and carries its
/// discriminating payload inside [`AgentEvent::data`].
///
/// `StreamStarted`, `GoalProgress`, `GoalAchieved`, `ContextCompacted`
/// and `ConstraintViolation` are reserved: they round-trip but nothing
/// emits them until the emitter lands behind
/// `RuntimeConfig::enable_reserved_events`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionPaused,
    ExecutionResumed,
    NodeLoopStarted,
    NodeLoopIteration,
    NodeLoopCompleted,
    LlmTextDelta,
    LlmReasoningDelta,
    ToolCallStarted,
    ToolCallCompleted,
    ClientOutputDelta,
    ClientInputRequested,
    NodeInternalOutput,
    NodeInputBlocked,
    NodeStalled,
    NodeRetry,
    NodeToolDoomLoop,
    JudgeVerdict,
    OutputKeySet,
    EdgeTraversed,
    StateChanged,
    StateConflict,
    StreamStarted,
    GoalProgress,
    GoalAchieved,
    ContextCompacted,
    ConstraintViolation,
    WorkerEscalationTicket,
    QueenInterventionRequested,
    EscalationRequested,
    WebhookReceived,
    Custom,
}

impl EventType {
    /// The serialized `snake_case` name of this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ExecutionStarted => "execution_started",
            EventType::ExecutionCompleted => "execution_completed",
            EventType::ExecutionFailed => "execution_failed",
            EventType::ExecutionPaused => "execution_paused",
            EventType::ExecutionResumed => "execution_resumed",
            EventType::NodeLoopStarted => "node_loop_started",
            EventType::NodeLoopIteration => "node_loop_iteration",
            EventType::NodeLoopCompleted => "node_loop_completed",
            EventType::LlmTextDelta => "llm_text_delta",
            EventType::LlmReasoningDelta => "llm_reasoning_delta",
            EventType::ToolCallStarted => "tool_call_started",
            EventType::ToolCallCompleted => "tool_call_completed",
            EventType::ClientOutputDelta => "client_output_delta",
            EventType::ClientInputRequested => "client_input_requested",
            EventType::NodeInternalOutput => "node_internal_output",
            EventType::NodeInputBlocked => "node_input_blocked",
            EventType::NodeStalled => "node_stalled",
            EventType::NodeRetry => "node_retry",
            EventType::NodeToolDoomLoop => "node_tool_doom_loop",
            EventType::JudgeVerdict => "judge_verdict",
            EventType::OutputKeySet => "output_key_set",
            EventType::EdgeTraversed => "edge_traversed",
            EventType::StateChanged => "state_changed",
            EventType::StateConflict => "state_conflict",
            EventType::StreamStarted => "stream_started",
            EventType::GoalProgress => "goal_progress",
            EventType::GoalAchieved => "goal_achieved",
            EventType::ContextCompacted => "context_compacted",
            EventType::ConstraintViolation => "constraint_violation",
            EventType::WorkerEscalationTicket => "worker_escalation_ticket",
            EventType::QueenInterventionRequested => "queen_intervention_requested",
            EventType::EscalationRequested => "escalation_requested",
            EventType::WebhookReceived => "webhook_received",
            EventType::Custom => "custom",
        }
    }

    /// Parse the serialized name back into a variant.
    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }

    /// The default subscription set for SSE clients: everything a dashboard
    /// or chat frontend renders, excluding engine-internal plumbing.
    pub fn client_facing_set() -> Vec<EventType> {
        vec![
            EventType::ExecutionStarted,
            EventType::ExecutionCompleted,
            EventType::ExecutionFailed,
            EventType::ExecutionPaused,
            EventType::ExecutionResumed,
            EventType::NodeLoopStarted,
            EventType::NodeLoopCompleted,
            EventType::ClientOutputDelta,
            EventType::ClientInputRequested,
            EventType::ToolCallStarted,
            EventType::ToolCallCompleted,
            EventType::JudgeVerdict,
            EventType::EdgeTraversed,
            EventType::EscalationRequested,
            EventType::WorkerEscalationTicket,
            EventType::QueenInterventionRequested,
        ]
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope for every event the runtime publishes.
///
/// The identity tuple `(graph_id, stream_id, node_id, execution_id)`
/// uniquely locates an event; scope fields the publisher leaves unset are
/// stamped by the scoped bus that carried the publish (see
/// [`EventBus::child`](super::EventBus::child)).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub stream_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_id: Option<String>,
    #[serde(default)]
    pub data: FxHashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl AgentEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            stream_id: String::new(),
            node_id: None,
            execution_id: None,
            graph_id: None,
            data: FxHashMap::default(),
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    #[must_use]
    pub fn with_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = stream_id.into();
        self
    }

    #[must_use]
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    #[must_use]
    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    #[must_use]
    pub fn with_graph(mut self, graph_id: impl Into<String>) -> Self {
        self.graph_id = Some(graph_id.into());
        self
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attach one payload field.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Payload field accessor, `None` when absent.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Payload field as a string slice, `None` when absent or non-string.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Serialize to the single-line JSON form used by SSE frames and the
    /// JSONL debug log.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Inverse of [`encode`](Self::encode).
    pub fn decode(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.node_id, &self.execution_id) {
            (Some(node), Some(exec)) => {
                write!(f, "[{} {node}@{exec}] {}", self.stream_id, self.event_type)
            }
            (Some(node), None) => write!(f, "[{} {node}] {}", self.stream_id, self.event_type),
            _ => write!(f, "[{}] {}", self.stream_id, self.event_type),
        }
    }
}
