use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced a conversation turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    System,
    User,
    Assistant,
    ToolResult,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::System => "system",
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::ToolResult => "tool_result",
        }
    }
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a node's conversation log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: FxHashMap::default(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(TurnRole::System, content)
    }

    pub fn tool_result(content: impl Into<String>) -> Self {
        Self::new(TurnRole::ToolResult, content)
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

impl std::fmt::Display for Turn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.role, self.content)
    }
}

/// Append-only turn log for one in-flight node invocation.
///
/// Cleared when the node completes; results survive the node boundary only
/// through declared output keys in shared state. Snapshots feed the
/// checkpoint store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConversation {
    turns: Vec<Turn>,
}

impl NodeConversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The most recent assistant contents, newest first.
    pub fn recent_assistant_contents(&self, count: usize) -> Vec<&str> {
        self.turns
            .iter()
            .rev()
            .filter(|turn| turn.role == TurnRole::Assistant)
            .take(count)
            .map(|turn| turn.content.as_str())
            .collect()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.clone()
    }

    pub fn restore(&mut self, turns: Vec<Turn>) {
        self.turns = turns;
    }
}

/// Shared handle to a live [`NodeConversation`].
///
/// The event loop appends turns while the checkpointing path snapshots
/// concurrently; the lock is only ever held for single push/clone
/// operations, never across an await point.
#[derive(Clone, Debug, Default)]
pub struct SharedConversation {
    inner: Arc<Mutex<NodeConversation>>,
}

impl SharedConversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_turns(turns: Vec<Turn>) -> Self {
        let shared = Self::new();
        shared.restore(turns);
        shared
    }

    pub fn push(&self, turn: Turn) {
        self.inner.lock().push(turn);
    }

    pub fn snapshot(&self) -> Vec<Turn> {
        self.inner.lock().snapshot()
    }

    pub fn recent_assistant_contents(&self, count: usize) -> Vec<String> {
        self.inner
            .lock()
            .recent_assistant_contents(count)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn restore(&self, turns: Vec<Turn>) {
        self.inner.lock().restore(turns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn turns_append_in_order() {
        let mut conversation = NodeConversation::new();
        conversation.push(Turn::system("prompt"));
        conversation.push(Turn::user("hi"));
        conversation.push(Turn::assistant("hello"));

        assert_eq!(conversation.len(), 3);
        assert_eq!(conversation.turns()[0].role, TurnRole::System);
        assert_eq!(conversation.turns()[2].content, "hello");
    }

    #[test]
    fn recent_assistant_contents_are_newest_first() {
        let mut conversation = NodeConversation::new();
        conversation.push(Turn::assistant("one"));
        conversation.push(Turn::tool_result("ignored"));
        conversation.push(Turn::assistant("two"));
        conversation.push(Turn::assistant("three"));

        assert_eq!(
            conversation.recent_assistant_contents(2),
            vec!["three", "two"]
        );
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let mut conversation = NodeConversation::new();
        conversation.push(Turn::user("q").with_metadata("source", json!("chat")));
        let snapshot = conversation.snapshot();

        conversation.clear();
        assert!(conversation.is_empty());

        conversation.restore(snapshot.clone());
        assert_eq!(conversation.snapshot(), snapshot);
    }

    #[test]
    fn turn_serialization_round_trip() {
        let turn = Turn::tool_result("{\"ok\":true}").with_metadata("tool_name", json!("search"));
        let json = serde_json::to_string(&turn).unwrap();
        let parsed: Turn = serde_json::from_str(&json).unwrap();
        assert_eq!(turn, parsed);
    }
}
