//! Per-node execution state tracking

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::now_secs;

/// Execution status of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Snapshot of one node's execution state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub id: String,
    pub name: String,
    pub status: NodeStatus,
    pub result: Option<Value>,
    pub started_at: Option<f64>,
    pub finished_at: Option<f64>,
    pub attempts: u32,
}

impl NodeState {
    fn new(id: &str, name: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            name: name.unwrap_or(id).to_string(),
            status: NodeStatus::Pending,
            result: None,
            started_at: None,
            finished_at: None,
            attempts: 0,
        }
    }

    /// JSON view exposed to the condition evaluator resolver
    pub fn as_value(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "status": serde_json::to_value(self.status).unwrap_or(Value::Null),
            "result": self.result,
            "attempts": self.attempts,
        })
    }
}

#[derive(Default)]
struct Inner {
    states: HashMap<String, NodeState>,
    name_index: HashMap<String, Vec<String>>,
}

/// Thread-safe node-state map with a by-name secondary index
///
/// The orchestrator exclusively writes here while a plan runs; the
/// condition evaluator and tests read snapshots.
#[derive(Default)]
pub struct StateTracker {
    inner: Mutex<Inner>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a state entry exists; registers the name index on first sight
    pub fn ensure_node(&self, node_id: &str, name: Option<&str>) -> NodeState {
        let mut inner = self.inner.lock().unwrap();
        if !inner.states.contains_key(node_id) {
            inner.states.insert(node_id.to_string(), NodeState::new(node_id, name));
            if let Some(name) = name {
                inner
                    .name_index
                    .entry(name.to_string())
                    .or_default()
                    .push(node_id.to_string());
            }
        }
        inner.states.get(node_id).cloned().unwrap()
    }

    /// Mark running; bumps the attempt counter and stamps started_at
    pub fn set_running(&self, node_id: &str) -> NodeState {
        let mut inner = self.inner.lock().unwrap();
        let state = inner
            .states
            .entry(node_id.to_string())
            .or_insert_with(|| NodeState::new(node_id, None));
        state.status = NodeStatus::Running;
        state.started_at = Some(now_secs());
        state.attempts += 1;
        state.clone()
    }

    pub fn set_completed(&self, node_id: &str, result: Value) -> NodeState {
        let mut inner = self.inner.lock().unwrap();
        let state = inner
            .states
            .entry(node_id.to_string())
            .or_insert_with(|| NodeState::new(node_id, None));
        state.status = NodeStatus::Completed;
        state.result = Some(result);
        state.finished_at = Some(now_secs());
        state.clone()
    }

    pub fn set_failed(&self, node_id: &str, error: &str) -> NodeState {
        let mut inner = self.inner.lock().unwrap();
        let state = inner
            .states
            .entry(node_id.to_string())
            .or_insert_with(|| NodeState::new(node_id, None));
        state.status = NodeStatus::Failed;
        state.result = Some(serde_json::json!({ "error": error }));
        state.finished_at = Some(now_secs());
        state.clone()
    }

    pub fn get(&self, node_id: &str) -> Option<NodeState> {
        let inner = self.inner.lock().unwrap();
        inner.states.get(node_id).cloned()
    }

    pub fn list_all(&self) -> HashMap<String, NodeState> {
        let inner = self.inner.lock().unwrap();
        inner.states.clone()
    }

    /// Most recently finished node registered under `name`
    pub fn get_state_by_task_name(&self, name: &str) -> Option<NodeState> {
        let inner = self.inner.lock().unwrap();
        let ids = inner.name_index.get(name)?;
        let mut best: Option<&NodeState> = None;
        for id in ids {
            let Some(state) = inner.states.get(id) else { continue };
            let better = match best {
                None => true,
                Some(current) => state.finished_at.unwrap_or(0.0) > current.finished_at.unwrap_or(0.0),
            };
            if better {
                best = Some(state);
            }
        }
        best.cloned()
    }
}
