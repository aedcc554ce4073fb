use super::envelope::{AgentEvent, EventType};

/// Subscription filter. All populated fields must match (AND semantics);
/// an empty filter matches everything.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    pub event_types: Option<Vec<EventType>>,
    pub stream_id: Option<String>,
    pub node_id: Option<String>,
    pub execution_id: Option<String>,
    pub graph_id: Option<String>,
}

impl EventFilter {
    /// Match-all filter.
    pub fn any() -> Self {
        Self::default()
    }

    /// The default SSE subscription: client-relevant event types only.
    pub fn client_default() -> Self {
        Self {
            event_types: Some(EventType::client_facing_set()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_types(mut self, event_types: Vec<EventType>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    #[must_use]
    pub fn with_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
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

    pub fn matches(&self, event: &AgentEvent) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(stream) = &self.stream_id {
            if event.stream_id != *stream {
                return false;
            }
        }
        if let Some(node) = &self.node_id {
            if event.node_id.as_deref() != Some(node.as_str()) {
                return false;
            }
        }
        if let Some(execution) = &self.execution_id {
            if event.execution_id.as_deref() != Some(execution.as_str()) {
                return false;
            }
        }
        if let Some(graph) = &self.graph_id {
            if event.graph_id.as_deref() != Some(graph.as_str()) {
                return false;
            }
        }
        true
    }
}
