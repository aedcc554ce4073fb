//! Graph specifications: nodes, edges, entry points, and load-time
//! validation.
//!
//! A [`GraphSpec`] is immutable once loaded. Validation runs before any
//! execution starts and rejects structurally broken graphs with
//! [`ConfigError`]; everything the executor assumes (entry node exists,
//! edges reference known nodes, success cycles have an exit) is checked
//! here, never mid-walk.

use std::collections::VecDeque;
use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use crate::state::{StateSnapshot, StateView};

/// Predicate for `conditional` edges, evaluated over the current shared
/// state.
pub type EdgePredicate = Arc<dyn Fn(&StateSnapshot) -> bool + Send + Sync + 'static>;

/// Handler for `function` nodes. Runs synchronously on the executor task
/// and returns the node's output map.
pub type FunctionHandler =
    Arc<dyn Fn(&StateView) -> Result<FxHashMap<String, Value>, String> + Send + Sync + 'static>;

/// How a node executes.
#[derive(Clone)]
pub enum NodeType {
    /// The bounded multi-turn LLM + tool loop.
    EventLoop,
    /// A synchronous host function.
    Function(FunctionHandler),
}

impl std::fmt::Debug for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::EventLoop => f.write_str("EventLoop"),
            NodeType::Function(_) => f.write_str("Function"),
        }
    }
}

/// A declared output key; non-nullable keys must be set before the judge
/// can accept the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputKey {
    pub key: String,
    pub nullable: bool,
}

impl OutputKey {
    pub fn required(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            nullable: false,
        }
    }

    pub fn optional(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            nullable: true,
        }
    }
}

/// One node of a graph.
#[derive(Clone, Debug)]
pub struct NodeSpec {
    pub id: String,
    pub description: String,
    pub node_type: NodeType,
    /// Shared-state keys rendered into the prompt each iteration.
    pub input_keys: Vec<String>,
    pub output_keys: Vec<OutputKey>,
    /// Tools this node may call, by registry name.
    pub tool_names: Vec<String>,
    /// Node-level re-entry budget on failure (fresh conversation each
    /// retry). Distinct from the transient-LLM retry budget.
    pub max_retries: u32,
    /// Transient-LLM retry budget within one node run.
    pub max_llm_retries: u32,
    /// Visit cap across the whole execution; 0 = unbounded.
    pub max_node_visits: u32,
    /// Iteration budget for the inner loop; 0 = unbounded.
    pub max_iterations: u32,
    pub success_criteria: Option<String>,
    pub system_prompt: Option<String>,
    /// Client-facing nodes stream `client_output_delta` and may block on
    /// injected input.
    pub client_facing: bool,
}

impl NodeSpec {
    pub fn event_loop(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            node_type: NodeType::EventLoop,
            input_keys: Vec::new(),
            output_keys: Vec::new(),
            tool_names: Vec::new(),
            max_retries: 0,
            max_llm_retries: 3,
            max_node_visits: 0,
            max_iterations: 20,
            success_criteria: None,
            system_prompt: None,
            client_facing: false,
        }
    }

    pub fn function(id: impl Into<String>, handler: FunctionHandler) -> Self {
        Self {
            node_type: NodeType::Function(handler),
            ..Self::event_loop(id)
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_inputs(mut self, keys: Vec<String>) -> Self {
        self.input_keys = keys;
        self
    }

    #[must_use]
    pub fn with_outputs(mut self, keys: Vec<OutputKey>) -> Self {
        self.output_keys = keys;
        self
    }

    #[must_use]
    pub fn with_tools(mut self, names: Vec<String>) -> Self {
        self.tool_names = names;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_max_visits(mut self, max_node_visits: u32) -> Self {
        self.max_node_visits = max_node_visits;
        self
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn with_success_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.success_criteria = Some(criteria.into());
        self
    }

    #[must_use]
    pub fn client_facing(mut self) -> Self {
        self.client_facing = true;
        self
    }

    /// Non-nullable output key names.
    pub fn required_outputs(&self) -> Vec<&str> {
        self.output_keys
            .iter()
            .filter(|key| !key.nullable)
            .map(|key| key.key.as_str())
            .collect()
    }
}

/// When an edge fires.
#[derive(Clone)]
pub enum EdgeCondition {
    Always,
    OnSuccess,
    OnFailure,
    Conditional(EdgePredicate),
    /// Target choice deferred to an LLM over the node's router edges.
    Router,
}

impl EdgeCondition {
    pub fn label(&self) -> &'static str {
        match self {
            EdgeCondition::Always => "always",
            EdgeCondition::OnSuccess => "on_success",
            EdgeCondition::OnFailure => "on_failure",
            EdgeCondition::Conditional(_) => "conditional",
            EdgeCondition::Router => "router",
        }
    }

    /// Condition-kind equality, ignoring predicate identity.
    pub fn same_kind(&self, other: &EdgeCondition) -> bool {
        self.label() == other.label()
    }
}

impl std::fmt::Debug for EdgeCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Debug)]
pub struct EdgeSpec {
    pub source: String,
    pub target: String,
    pub condition: EdgeCondition,
    /// Evaluated ascending; ties broken by declaration order.
    pub priority: i32,
}

impl EdgeSpec {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        condition: EdgeCondition,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition,
            priority: 0,
        }
    }

    pub fn on_success(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(source, target, EdgeCondition::OnSuccess)
    }

    pub fn on_failure(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(source, target, EdgeCondition::OnFailure)
    }

    pub fn always(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(source, target, EdgeCondition::Always)
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// What fires an entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerKind {
    Manual,
    Webhook,
    Timer,
    Event,
}

/// A named trigger bound to a specific entry node.
#[derive(Clone, Debug)]
pub struct EntryPointSpec {
    pub id: String,
    pub trigger: TriggerKind,
    pub target: String,
}

impl EntryPointSpec {
    pub fn manual(id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            trigger: TriggerKind::Manual,
            target: target.into(),
        }
    }
}

#[derive(Debug, Diagnostic)]
pub enum ConfigError {
    #[diagnostic(code(hive::graph::empty))]
    EmptyGraph { graph_id: String },

    #[diagnostic(code(hive::graph::duplicate_node))]
    DuplicateNode { node_id: String },

    #[diagnostic(code(hive::graph::unknown_entry))]
    UnknownEntryNode { node_id: String },

    #[diagnostic(code(hive::graph::dangling_edge))]
    DanglingEdge { source: String, target: String },

    #[diagnostic(code(hive::graph::unknown_entry_point_target))]
    UnknownEntryPointTarget { entry_point: String, target: String },

    #[diagnostic(
        code(hive::graph::unbounded_cycle),
        help("Give a node on the cycle a visit cap, or add an edge leaving the cycle.")
    )]
    UnboundedSuccessCycle { nodes: Vec<String> },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EmptyGraph { graph_id } => {
                write!(f, "graph {graph_id} has no nodes")
            }
            ConfigError::DuplicateNode { node_id } => {
                write!(f, "duplicate node id: {node_id}")
            }
            ConfigError::UnknownEntryNode { node_id } => {
                write!(f, "entry node {node_id} is not defined in the graph")
            }
            ConfigError::DanglingEdge { source, target } => {
                write!(f, "edge references undefined node: {source} -> {target}")
            }
            ConfigError::UnknownEntryPointTarget {
                entry_point,
                target,
            } => {
                write!(
                    f,
                    "entry point {entry_point} targets undefined node {target}"
                )
            }
            ConfigError::UnboundedSuccessCycle { nodes } => {
                write!(f, "success cycle with no exit: {nodes:?}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// An immutable graph: ordered nodes, a flat edge list, one entry node,
/// and named entry points.
#[derive(Clone, Debug)]
pub struct GraphSpec {
    pub id: String,
    /// Agent-level identity prompt (layer 1 of the composed system
    /// prompt).
    pub identity_prompt: Option<String>,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
    pub entry_node: String,
    pub entry_points: Vec<EntryPointSpec>,
}

impl GraphSpec {
    pub fn new(id: impl Into<String>, entry_node: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            identity_prompt: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            entry_node: entry_node.into(),
            entry_points: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_identity(mut self, prompt: impl Into<String>) -> Self {
        self.identity_prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn add_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    #[must_use]
    pub fn add_edge(mut self, edge: EdgeSpec) -> Self {
        self.edges.push(edge);
        self
    }

    #[must_use]
    pub fn add_entry_point(mut self, entry_point: EntryPointSpec) -> Self {
        self.entry_points.push(entry_point);
        self
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn entry_point(&self, id: &str) -> Option<&EntryPointSpec> {
        self.entry_points.iter().find(|ep| ep.id == id)
    }

    /// Outgoing edges of `source`, sorted by ascending priority with ties
    /// broken by declaration order.
    pub fn outgoing(&self, source: &str) -> Vec<&EdgeSpec> {
        let mut edges: Vec<(usize, &EdgeSpec)> = self
            .edges
            .iter()
            .enumerate()
            .filter(|(_, edge)| edge.source == source)
            .collect();
        edges.sort_by_key(|(index, edge)| (edge.priority, *index));
        edges.into_iter().map(|(_, edge)| edge).collect()
    }

    /// Validate graph structure before any execution starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::EmptyGraph {
                graph_id: self.id.clone(),
            });
        }

        let mut seen: FxHashSet<&str> = FxHashSet::default();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(ConfigError::DuplicateNode {
                    node_id: node.id.clone(),
                });
            }
        }

        if self.node(&self.entry_node).is_none() {
            return Err(ConfigError::UnknownEntryNode {
                node_id: self.entry_node.clone(),
            });
        }

        for edge in &self.edges {
            if self.node(&edge.source).is_none() || self.node(&edge.target).is_none() {
                return Err(ConfigError::DanglingEdge {
                    source: edge.source.clone(),
                    target: edge.target.clone(),
                });
            }
        }

        for entry_point in &self.entry_points {
            if self.node(&entry_point.target).is_none() {
                return Err(ConfigError::UnknownEntryPointTarget {
                    entry_point: entry_point.id.clone(),
                    target: entry_point.target.clone(),
                });
            }
        }

        self.check_success_cycles()
    }

    /// Reject cycles over `always`/`on_success` edges that nothing bounds:
    /// no member has a visit cap and no edge of any condition leaves the
    /// cycle.
    fn check_success_cycles(&self) -> Result<(), ConfigError> {
        let success_edges: Vec<&EdgeSpec> = self
            .edges
            .iter()
            .filter(|edge| {
                matches!(
                    edge.condition,
                    EdgeCondition::Always | EdgeCondition::OnSuccess
                )
            })
            .collect();

        for component in strongly_connected(&self.nodes, &success_edges) {
            let is_cycle = component.len() > 1
                || success_edges
                    .iter()
                    .any(|edge| edge.source == component[0] && edge.target == component[0]);
            if !is_cycle {
                continue;
            }
            let members: FxHashSet<&str> = component.iter().map(String::as_str).collect();
            let bounded = component.iter().any(|id| {
                self.node(id)
                    .map(|node| node.max_node_visits > 0)
                    .unwrap_or(false)
            });
            let has_exit = self.edges.iter().any(|edge| {
                members.contains(edge.source.as_str()) && !members.contains(edge.target.as_str())
            });
            if !bounded && !has_exit {
                return Err(ConfigError::UnboundedSuccessCycle { nodes: component });
            }
        }
        Ok(())
    }

    /// Edges that point back into the BFS tree from the entry node.
    /// Informational only; the executor treats them like any other edge.
    pub fn back_edges(&self) -> FxHashSet<(String, String)> {
        let mut depth: FxHashMap<&str, usize> = FxHashMap::default();
        let mut queue: VecDeque<&str> = VecDeque::new();
        depth.insert(self.entry_node.as_str(), 0);
        queue.push_back(self.entry_node.as_str());
        while let Some(current) = queue.pop_front() {
            let level = depth[current];
            for edge in self.edges.iter().filter(|edge| edge.source == current) {
                if !depth.contains_key(edge.target.as_str()) {
                    depth.insert(edge.target.as_str(), level + 1);
                    queue.push_back(edge.target.as_str());
                }
            }
        }

        self.edges
            .iter()
            .filter(|edge| {
                match (depth.get(edge.source.as_str()), depth.get(edge.target.as_str())) {
                    (Some(source), Some(target)) => target <= source,
                    _ => false,
                }
            })
            .map(|edge| (edge.source.clone(), edge.target.clone()))
            .collect()
    }

    /// Nearest common descendant of `starts` by BFS level over all edges;
    /// `None` when the branches never reconverge.
    pub fn nearest_common_descendant(&self, starts: &[String]) -> Option<String> {
        let mut reachable: Vec<FxHashMap<String, usize>> = Vec::with_capacity(starts.len());
        for start in starts {
            let mut depth: FxHashMap<String, usize> = FxHashMap::default();
            let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
            queue.push_back((start.as_str(), 0));
            while let Some((current, level)) = queue.pop_front() {
                for edge in self.edges.iter().filter(|edge| edge.source == current) {
                    if !depth.contains_key(&edge.target) {
                        depth.insert(edge.target.clone(), level + 1);
                        queue.push_back((edge.target.as_str(), level + 1));
                    }
                }
            }
            // The start node itself counts as reachable at depth 0.
            depth.entry(start.clone()).or_insert(0);
            reachable.push(depth);
        }

        let first = reachable.first()?;
        let mut common: Vec<(&String, usize)> = first
            .iter()
            .filter(|(node, _)| reachable.iter().all(|depth| depth.contains_key(*node)))
            .map(|(node, _)| {
                let max_depth = reachable
                    .iter()
                    .map(|depth| depth[node.as_str()])
                    .max()
                    .unwrap_or(0);
                (node, max_depth)
            })
            .collect();
        // Branch start nodes are descendants of themselves only; a join
        // must be reachable from every branch.
        common.retain(|(node, _)| {
            reachable
                .iter()
                .zip(starts)
                .all(|(depth, start)| start == *node || depth[node.as_str()] > 0)
        });
        common.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        common.first().map(|(node, _)| (*node).clone())
    }
}

/// Tarjan's strongly connected components over the given edge subset.
fn strongly_connected(nodes: &[NodeSpec], edges: &[&EdgeSpec]) -> Vec<Vec<String>> {
    struct Tarjan<'a> {
        adjacency: FxHashMap<&'a str, Vec<&'a str>>,
        index: FxHashMap<&'a str, usize>,
        low: FxHashMap<&'a str, usize>,
        on_stack: FxHashSet<&'a str>,
        stack: Vec<&'a str>,
        next_index: usize,
        components: Vec<Vec<String>>,
    }

    impl<'a> Tarjan<'a> {
        fn visit(&mut self, node: &'a str) {
            self.index.insert(node, self.next_index);
            self.low.insert(node, self.next_index);
            self.next_index += 1;
            self.stack.push(node);
            self.on_stack.insert(node);

            let neighbors: Vec<&'a str> = self
                .adjacency
                .get(node)
                .into_iter()
                .flatten()
                .copied()
                .collect();
            for next in neighbors {
                if !self.index.contains_key(next) {
                    self.visit(next);
                    let low = self.low[next].min(self.low[node]);
                    self.low.insert(node, low);
                } else if self.on_stack.contains(next) {
                    let low = self.index[next].min(self.low[node]);
                    self.low.insert(node, low);
                }
            }

            if self.low[node] == self.index[node] {
                let mut component = Vec::new();
                while let Some(top) = self.stack.pop() {
                    self.on_stack.remove(top);
                    component.push(top.to_string());
                    if top == node {
                        break;
                    }
                }
                component.reverse();
                self.components.push(component);
            }
        }
    }

    let mut adjacency: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
    for edge in edges {
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    let mut tarjan = Tarjan {
        adjacency,
        index: FxHashMap::default(),
        low: FxHashMap::default(),
        on_stack: FxHashSet::default(),
        stack: Vec::new(),
        next_index: 0,
        components: Vec::new(),
    };
    for node in nodes {
        if !tarjan.index.contains_key(node.id.as_str()) {
            tarjan.visit(node.id.as_str());
        }
    }
    tarjan.components
}
