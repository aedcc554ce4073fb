//! Per-session shared state.
//!
//! A session owns one [`SharedState`]: a string-keyed map of JSON values
//! with an isolation policy fixed at creation. Nodes read their declared
//! inputs from it and write outputs through the `set_output` synthetic
//! tool; every mutation emits a `state_changed` event after the write lock
//! is released.
//!
//! Parallel graph branches do not write directly: each branch works
//! through a [`StateView`] backed by a staged overlay, and the executor
//! merges overlays at the join point (see [`SharedState::merge_staged`]).

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{json, Value};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::event::{AgentEvent, EventBus, EventType};

/// Immutable copy of the state map at a point in time.
pub type StateSnapshot = FxHashMap<String, Value>;

/// How executions within one session see each other's writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IsolationPolicy {
    /// Each execution sees only keys it wrote itself.
    Isolated,
    /// All executions see all keys.
    #[default]
    Shared,
    /// Shared visibility, but writes serialize through per-key advisory
    /// locks held for the duration of the writing node.
    Synchronized,
}

struct StateInner {
    policy: IsolationPolicy,
    values: RwLock<StateSnapshot>,
    /// Keys written per execution; consulted for reads under `Isolated`.
    write_sets: RwLock<FxHashMap<String, FxHashSet<String>>>,
    key_locks: Mutex<FxHashMap<String, Arc<AsyncMutex<()>>>>,
    bus: EventBus,
}

/// Session-scoped key/value store. Cheap to clone; clones share storage.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<StateInner>,
}

impl SharedState {
    pub fn new(policy: IsolationPolicy, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(StateInner {
                policy,
                values: RwLock::new(StateSnapshot::default()),
                write_sets: RwLock::new(FxHashMap::default()),
                key_locks: Mutex::new(FxHashMap::default()),
                bus,
            }),
        }
    }

    pub fn policy(&self) -> IsolationPolicy {
        self.inner.policy
    }

    /// Read a key as seen by `execution_id` under the session's isolation
    /// policy. Under `Isolated`, keys outside the execution's write set
    /// read as unset.
    pub fn get(&self, execution_id: &str, key: &str) -> Option<Value> {
        if self.inner.policy == IsolationPolicy::Isolated {
            let write_sets = self.inner.write_sets.read();
            let visible = write_sets
                .get(execution_id)
                .map(|set| set.contains(key))
                .unwrap_or(false);
            if !visible {
                return None;
            }
        }
        self.inner.values.read().get(key).cloned()
    }

    /// Write a key and emit `state_changed { key, old, new }`.
    pub fn set(&self, execution_id: &str, key: &str, value: Value) {
        let old = {
            let mut values = self.inner.values.write();
            values.insert(key.to_string(), value.clone())
        };
        self.inner
            .write_sets
            .write()
            .entry(execution_id.to_string())
            .or_default()
            .insert(key.to_string());
        // Notification fires after the lock is released.
        self.emit_changed(execution_id, key, old, Some(value));
    }

    /// Delete a key and emit `state_changed` with `new = null`.
    pub fn delete(&self, execution_id: &str, key: &str) {
        let old = { self.inner.values.write().remove(key) };
        if old.is_some() {
            self.emit_changed(execution_id, key, old, None);
        }
    }

    fn emit_changed(&self, execution_id: &str, key: &str, old: Option<Value>, new: Option<Value>) {
        self.inner.bus.publish(
            AgentEvent::new(EventType::StateChanged)
                .with_execution(execution_id)
                .with_data("key", json!(key))
                .with_data("old", old.unwrap_or(Value::Null))
                .with_data("new", new.unwrap_or(Value::Null)),
        );
    }

    /// Immutable copy of the whole map, ignoring isolation.
    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.values.read().clone()
    }

    /// Replace the map wholesale (checkpoint restore). Write sets are
    /// cleared: a restored execution owns every restored key.
    pub fn restore(&self, snapshot: StateSnapshot) {
        *self.inner.values.write() = snapshot;
        self.inner.write_sets.write().clear();
    }

    /// Mark every current key as written by `execution_id`, so a restored
    /// execution can read its own checkpointed outputs under `Isolated`.
    pub fn adopt_keys(&self, execution_id: &str) {
        let keys: Vec<String> = self.inner.values.read().keys().cloned().collect();
        let mut write_sets = self.inner.write_sets.write();
        let set = write_sets.entry(execution_id.to_string()).or_default();
        for key in keys {
            set.insert(key);
        }
    }

    /// Acquire the advisory per-key lock used under `Synchronized`.
    /// The guard is held for the duration of the writing node.
    pub async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.key_locks.lock();
            Arc::clone(
                locks
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /// A direct (non-staged) view for an execution.
    pub fn view(&self, execution_id: impl Into<String>) -> StateView {
        StateView {
            state: self.clone(),
            execution_id: execution_id.into(),
            staged: None,
            outer: Vec::new(),
        }
    }

    /// A branch view whose writes are staged for merge at the join point.
    pub fn staged_view(&self, execution_id: impl Into<String>) -> StateView {
        StateView {
            state: self.clone(),
            execution_id: execution_id.into(),
            staged: Some(Arc::new(Mutex::new(StateSnapshot::default()))),
            outer: Vec::new(),
        }
    }

    /// Merge staged branch overlays at a join point.
    ///
    /// Under `Shared` and `Isolated`, two branches writing the same key is
    /// a conflict: the offending key is returned and nothing is applied.
    /// Under `Synchronized`, writes were serialized per key during the
    /// branches, so overlays apply in branch order and the last writer
    /// wins.
    pub fn merge_staged(
        &self,
        execution_id: &str,
        overlays: Vec<StateSnapshot>,
    ) -> Result<(), StateConflict> {
        if self.inner.policy != IsolationPolicy::Synchronized {
            let mut seen: FxHashMap<&String, usize> = FxHashMap::default();
            for (branch, overlay) in overlays.iter().enumerate() {
                for key in overlay.keys() {
                    if let Some(&other) = seen.get(key) {
                        return Err(StateConflict {
                            key: key.clone(),
                            branches: (other, branch),
                        });
                    }
                    seen.insert(key, branch);
                }
            }
        }
        for overlay in overlays {
            for (key, value) in overlay {
                self.set(execution_id, &key, value);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("policy", &self.inner.policy)
            .field("keys", &self.inner.values.read().len())
            .finish()
    }
}

/// Two parallel branches wrote the same key under an isolation policy
/// that cannot serialize them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateConflict {
    pub key: String,
    /// Indices of the two conflicting branches, in declaration order.
    pub branches: (usize, usize),
}

impl std::fmt::Display for StateConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "parallel branches {} and {} both wrote key {:?}",
            self.branches.0, self.branches.1, self.key
        )
    }
}

impl std::error::Error for StateConflict {}

/// One execution's (or branch's) window onto the shared state.
///
/// A direct view reads and writes through [`SharedState`]; a staged view
/// captures writes in a branch-local overlay that reads fall back through.
#[derive(Clone)]
pub struct StateView {
    state: SharedState,
    execution_id: String,
    staged: Option<Arc<Mutex<StateSnapshot>>>,
    /// Enclosing branch overlays, innermost first; reads fall back through
    /// these before reaching the shared map.
    outer: Vec<Arc<Mutex<StateSnapshot>>>,
}

impl StateView {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn shared(&self) -> &SharedState {
        &self.state
    }

    pub fn is_staged(&self) -> bool {
        self.staged.is_some()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(staged) = &self.staged {
            if let Some(value) = staged.lock().get(key) {
                return Some(value.clone());
            }
        }
        for overlay in &self.outer {
            if let Some(value) = overlay.lock().get(key) {
                return Some(value.clone());
            }
        }
        self.state.get(&self.execution_id, key)
    }

    pub fn set(&self, key: &str, value: Value) {
        match &self.staged {
            Some(staged) => {
                staged.lock().insert(key.to_string(), value);
            }
            None => self.state.set(&self.execution_id, key, value),
        }
    }

    pub fn delete(&self, key: &str) {
        match &self.staged {
            Some(staged) => {
                staged.lock().remove(key);
            }
            None => self.state.delete(&self.execution_id, key),
        }
    }

    /// The staged overlay accumulated by this branch view, empty for a
    /// direct view.
    pub fn staged_writes(&self) -> StateSnapshot {
        self.staged
            .as_ref()
            .map(|staged| staged.lock().clone())
            .unwrap_or_default()
    }

    /// Spawn a nested staged view: a fresh overlay whose reads fall back
    /// through this view's overlays before reaching the shared map.
    pub fn staged_child(&self) -> StateView {
        let mut outer = Vec::with_capacity(self.outer.len() + 1);
        if let Some(staged) = &self.staged {
            outer.push(Arc::clone(staged));
        }
        outer.extend(self.outer.iter().cloned());
        StateView {
            state: self.state.clone(),
            execution_id: self.execution_id.clone(),
            staged: Some(Arc::new(Mutex::new(StateSnapshot::default()))),
            outer,
        }
    }

    /// Apply a nested branch overlay into this view (nested join point).
    pub fn apply_overlay(&self, overlay: StateSnapshot) {
        for (key, value) in overlay {
            self.set(&key, value);
        }
    }
}

impl std::fmt::Debug for StateView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateView")
            .field("execution_id", &self.execution_id)
            .field("staged", &self.staged.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;

    fn state(policy: IsolationPolicy) -> SharedState {
        SharedState::new(policy, EventBus::default())
    }

    #[tokio::test]
    async fn shared_policy_exposes_all_keys() {
        let state = state(IsolationPolicy::Shared);
        state.set("exec-a", "k", json!(1));
        assert_eq!(state.get("exec-b", "k"), Some(json!(1)));
    }

    #[tokio::test]
    async fn isolated_policy_hides_foreign_writes() {
        let state = state(IsolationPolicy::Isolated);
        state.set("exec-a", "k", json!(1));
        assert_eq!(state.get("exec-a", "k"), Some(json!(1)));
        assert_eq!(state.get("exec-b", "k"), None);
    }

    #[tokio::test]
    async fn restore_round_trips_snapshot() {
        let state = state(IsolationPolicy::Shared);
        state.set("e", "a", json!("x"));
        state.set("e", "b", json!([1, 2]));
        let snap = state.snapshot();

        state.delete("e", "a");
        state.set("e", "c", json!(true));
        state.restore(snap.clone());

        assert_eq!(state.snapshot(), snap);
    }

    #[tokio::test]
    async fn staged_view_defers_writes_until_merge() {
        let state = state(IsolationPolicy::Shared);
        let branch = state.staged_view("e1");
        branch.set("k", json!("staged"));

        assert_eq!(state.get("e1", "k"), None);
        assert_eq!(branch.get("k"), Some(json!("staged")));

        state
            .merge_staged("e1", vec![branch.staged_writes()])
            .unwrap();
        assert_eq!(state.get("e1", "k"), Some(json!("staged")));
    }

    #[tokio::test]
    async fn merge_conflict_under_shared_policy() {
        let state = state(IsolationPolicy::Shared);
        let a = state.staged_view("e1");
        let b = state.staged_view("e1");
        a.set("k", json!(1));
        b.set("k", json!(2));

        let err = state
            .merge_staged("e1", vec![a.staged_writes(), b.staged_writes()])
            .unwrap_err();
        assert_eq!(err.key, "k");
        // Nothing applied.
        assert_eq!(state.get("e1", "k"), None);
    }

    #[tokio::test]
    async fn merge_under_synchronized_lets_last_writer_win() {
        let state = state(IsolationPolicy::Synchronized);
        let a = state.staged_view("e1");
        let b = state.staged_view("e1");
        a.set("k", json!(1));
        b.set("k", json!(2));

        state
            .merge_staged("e1", vec![a.staged_writes(), b.staged_writes()])
            .unwrap();
        assert_eq!(state.get("e1", "k"), Some(json!(2)));
    }

    #[tokio::test]
    async fn key_lock_serializes_writers() {
        let state = state(IsolationPolicy::Synchronized);
        let guard = state.lock_key("k").await;
        let contended = {
            let state = state.clone();
            tokio::spawn(async move {
                let _guard = state.lock_key("k").await;
                state.set("e2", "k", json!("second"));
            })
        };
        state.set("e1", "k", json!("first"));
        drop(guard);
        contended.await.unwrap();
        assert_eq!(state.get("e1", "k"), Some(json!("second")));
    }
}
