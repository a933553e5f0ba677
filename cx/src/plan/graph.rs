//! Control-flow graph model
//!
//! Nodes are typed, edges are labelled successor entries on each node.
//! The graph carries exactly one entry and one exit; after compilation
//! `validate_integrity` must hold and `canonical_hash` gives the plan its
//! stable identity.

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::events::sha256_hex;

/// Structural errors raised by graph construction and validation
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    #[error("CFG must define entry and exit nodes")]
    MissingEntryExit,

    #[error("Node '{0}' not found in CFG")]
    UnknownNode(String),

    #[error("Node '{from}' targets missing node '{to}'")]
    DanglingEdge { from: String, to: String },

    #[error("Exit node is unreachable from entry node")]
    UnreachableExit,

    #[error("Cycle through node '{0}' outside a loop back-edge")]
    IllegalCycle(String),
}

/// Generate a fresh node id with the given prefix
pub fn new_node_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", prefix, &hex[..8])
}

/// Kind-specific node payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    Task {
        task_ref: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<f64>,
        #[serde(default)]
        supports_parallel: bool,
    },
    Decision {
        condition: String,
    },
    Loop {
        iterator_var: String,
        iterable_expr: String,
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
        #[serde(default)]
        continue_on_error: bool,
    },
    Retry {
        attempts: u32,
        backoff_seconds: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        child_node_id: Option<String>,
    },
    Noop,
    Call {
        target_service: String,
        #[serde(default)]
        arguments: Map<String, Value>,
        result_var: String,
    },
    Parallel,
}

fn default_max_iterations() -> u32 {
    1000
}

impl NodeKind {
    /// Canonical type string used in hashing and wire forms
    pub fn kind_str(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End => "end",
            NodeKind::Task { .. } => "task",
            NodeKind::Decision { .. } => "decision",
            NodeKind::Loop { .. } => "loop",
            NodeKind::Retry { .. } => "retry",
            NodeKind::Noop => "noop",
            NodeKind::Call { .. } => "call",
            NodeKind::Parallel => "parallel",
        }
    }
}

/// One CFG node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CfgNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    /// label -> target node id
    #[serde(default)]
    pub successors: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl CfgNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: String::new(),
            successors: BTreeMap::new(),
            metadata: Map::new(),
            kind,
        }
    }

    pub fn named(id: impl Into<String>, name: impl Into<String>, kind: NodeKind) -> Self {
        let mut node = Self::new(id, kind);
        node.name = Some(name.into());
        node
    }

    /// Marked for concurrent execution, either via metadata or kind
    pub fn parallel_marker(&self) -> Option<String> {
        if matches!(self.kind, NodeKind::Parallel) {
            return Some("__parallel_node".to_string());
        }
        if let Some(group) = self.metadata.get("parallel_group").and_then(Value::as_str) {
            return Some(group.to_string());
        }
        if self.metadata.get("parallel").and_then(Value::as_bool) == Some(true) {
            return Some("__parallel".to_string());
        }
        None
    }
}

/// The control-flow graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cfg {
    pub nodes: BTreeMap<String, CfgNode>,
    pub entry: Option<String>,
    pub exit: Option<String>,
}

impl Cfg {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node; Start/End nodes set entry/exit
    pub fn add_node(&mut self, node: CfgNode) {
        match node.kind {
            NodeKind::Start => self.entry = Some(node.id.clone()),
            NodeKind::End => self.exit = Some(node.id.clone()),
            _ => {}
        }
        self.nodes.insert(node.id.clone(), node);
    }

    /// Wire a labelled edge between two existing nodes
    pub fn add_successor(&mut self, src: &str, dst: &str, label: &str) -> Result<(), GraphError> {
        if !self.nodes.contains_key(dst) {
            return Err(GraphError::UnknownNode(dst.to_string()));
        }
        let node = self
            .nodes
            .get_mut(src)
            .ok_or_else(|| GraphError::UnknownNode(src.to_string()))?;
        node.successors.insert(label.to_string(), dst.to_string());
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&CfgNode> {
        self.nodes.get(id)
    }

    pub fn successors(&self, id: &str) -> BTreeMap<String, String> {
        self.nodes.get(id).map(|n| n.successors.clone()).unwrap_or_default()
    }

    pub fn all_successors(&self, id: &str) -> Vec<String> {
        self.nodes
            .get(id)
            .map(|n| n.successors.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Structural integrity: entry/exit present, edges resolve, exit
    /// reachable, cycles only through loop back-edges
    pub fn validate_integrity(&self) -> Result<(), GraphError> {
        let entry = self.entry.as_ref().ok_or(GraphError::MissingEntryExit)?;
        let exit = self.exit.as_ref().ok_or(GraphError::MissingEntryExit)?;
        if !self.nodes.contains_key(entry) {
            return Err(GraphError::UnknownNode(entry.clone()));
        }
        if !self.nodes.contains_key(exit) {
            return Err(GraphError::UnknownNode(exit.clone()));
        }

        for node in self.nodes.values() {
            for target in node.successors.values() {
                if !self.nodes.contains_key(target) {
                    return Err(GraphError::DanglingEdge {
                        from: node.id.clone(),
                        to: target.clone(),
                    });
                }
            }
        }

        // Reachability: BFS over successors from entry
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(entry);
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(id) {
                for target in node.successors.values() {
                    queue.push_back(target);
                }
            }
        }
        if !visited.contains(exit.as_str()) {
            return Err(GraphError::UnreachableExit);
        }

        self.check_cycles()
    }

    /// Forward edges only: `continue` edges re-entering a loop node are
    /// legitimate back-edges and are excluded from cycle detection
    fn forward_edges(&self, id: &str) -> Vec<String> {
        let Some(node) = self.nodes.get(id) else {
            return Vec::new();
        };
        node.successors
            .iter()
            .filter(|(label, target)| {
                !(label.as_str() == "continue"
                    && matches!(self.nodes.get(*target).map(|n| &n.kind), Some(NodeKind::Loop { .. })))
            })
            .map(|(_, target)| target.clone())
            .collect()
    }

    /// Cycle detection over forward edges (iterative three-color DFS)
    fn check_cycles(&self) -> Result<(), GraphError> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        let mut color: BTreeMap<String, u8> = BTreeMap::new();

        for root in self.nodes.keys() {
            if color.get(root).copied().unwrap_or(WHITE) != WHITE {
                continue;
            }
            // (node, entered) entries; entered=true means children are done
            let mut stack: Vec<(String, bool)> = vec![(root.clone(), false)];
            while let Some((id, entered)) = stack.pop() {
                if entered {
                    color.insert(id, BLACK);
                    continue;
                }
                if color.get(&id).copied().unwrap_or(WHITE) != WHITE {
                    continue;
                }
                color.insert(id.clone(), GRAY);
                stack.push((id.clone(), true));
                for target in self.forward_edges(&id) {
                    match color.get(&target).copied().unwrap_or(WHITE) {
                        GRAY => return Err(GraphError::IllegalCycle(target)),
                        WHITE => stack.push((target, false)),
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Deterministic structural hash over the canonical JSON rendering:
    /// `{entry, exit, nodes: [{id, type, name, succ: [[label, target]...]}]}`
    /// with nodes sorted by id and successors sorted by label.
    pub fn canonical_hash(&self) -> String {
        let nodes: Vec<Value> = self
            .nodes
            .values()
            .map(|node| {
                let succ: Vec<Value> = node
                    .successors
                    .iter()
                    .map(|(label, target)| serde_json::json!([label, target]))
                    .collect();
                serde_json::json!({
                    "id": node.id,
                    "type": node.kind.kind_str(),
                    "name": node.name,
                    "succ": succ,
                })
            })
            .collect();

        let data = serde_json::json!({
            "entry": self.entry,
            "exit": self.exit,
            "nodes": nodes,
        });

        sha256_hex(serde_json::to_string(&data).unwrap_or_default().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_cfg() -> Cfg {
        let mut cfg = Cfg::new();
        cfg.add_node(CfgNode::named("start", "start", NodeKind::Start));
        cfg.add_node(CfgNode::named(
            "t1",
            "task:step1",
            NodeKind::Task {
                task_ref: "t1".to_string(),
                timeout_seconds: None,
                supports_parallel: false,
            },
        ));
        cfg.add_node(CfgNode::named("end", "end", NodeKind::End));
        cfg.add_successor("start", "t1", "next").unwrap();
        cfg.add_successor("t1", "end", "next").unwrap();
        cfg
    }

    #[test]
    fn test_entry_exit_set_by_kind() {
        let cfg = linear_cfg();
        assert_eq!(cfg.entry.as_deref(), Some("start"));
        assert_eq!(cfg.exit.as_deref(), Some("end"));
    }

    #[test]
    fn test_validate_linear() {
        assert!(linear_cfg().validate_integrity().is_ok());
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let mut cfg = linear_cfg();
        let err = cfg.add_successor("t1", "ghost", "next").unwrap_err();
        assert!(matches!(err, GraphError::UnknownNode(_)));

        // Force a dangling edge in directly
        cfg.nodes
            .get_mut("t1")
            .unwrap()
            .successors
            .insert("alt".to_string(), "ghost".to_string());
        assert!(matches!(
            cfg.validate_integrity(),
            Err(GraphError::DanglingEdge { .. })
        ));
    }

    #[test]
    fn test_unreachable_exit_rejected() {
        let mut cfg = linear_cfg();
        cfg.nodes.get_mut("t1").unwrap().successors.clear();
        assert!(matches!(cfg.validate_integrity(), Err(GraphError::UnreachableExit)));
    }

    #[test]
    fn test_loop_back_edge_allowed() {
        let mut cfg = Cfg::new();
        cfg.add_node(CfgNode::named("start", "start", NodeKind::Start));
        cfg.add_node(CfgNode::named(
            "loop1",
            "loop",
            NodeKind::Loop {
                iterator_var: "x".to_string(),
                iterable_expr: "t0.result.items".to_string(),
                max_iterations: 1000,
                continue_on_error: false,
            },
        ));
        cfg.add_node(CfgNode::named(
            "body1",
            "task:upload",
            NodeKind::Task {
                task_ref: "body1".to_string(),
                timeout_seconds: None,
                supports_parallel: false,
            },
        ));
        cfg.add_node(CfgNode::new("exit1", NodeKind::Noop));
        cfg.add_node(CfgNode::named("end", "end", NodeKind::End));
        cfg.add_successor("start", "loop1", "next").unwrap();
        cfg.add_successor("loop1", "body1", "body").unwrap();
        cfg.add_successor("body1", "loop1", "continue").unwrap();
        cfg.add_successor("loop1", "exit1", "break").unwrap();
        cfg.add_successor("exit1", "end", "next").unwrap();

        assert!(cfg.validate_integrity().is_ok());
    }

    #[test]
    fn test_non_loop_cycle_rejected() {
        let mut cfg = linear_cfg();
        cfg.nodes
            .get_mut("t1")
            .unwrap()
            .successors
            .insert("back".to_string(), "start".to_string());
        assert!(matches!(cfg.validate_integrity(), Err(GraphError::IllegalCycle(_))));
    }

    #[test]
    fn test_canonical_hash_stable() {
        let cfg = linear_cfg();
        assert_eq!(cfg.canonical_hash(), cfg.canonical_hash());
        assert_eq!(cfg.canonical_hash().len(), 64);
    }

    #[test]
    fn test_canonical_hash_insensitive_to_insertion_order() {
        let a = linear_cfg();

        let mut b = Cfg::new();
        b.add_node(CfgNode::named("end", "end", NodeKind::End));
        b.add_node(CfgNode::named(
            "t1",
            "task:step1",
            NodeKind::Task {
                task_ref: "t1".to_string(),
                timeout_seconds: None,
                supports_parallel: false,
            },
        ));
        b.add_node(CfgNode::named("start", "start", NodeKind::Start));
        b.add_successor("start", "t1", "next").unwrap();
        b.add_successor("t1", "end", "next").unwrap();

        assert_eq!(a.canonical_hash(), b.canonical_hash());
    }

    #[test]
    fn test_canonical_hash_changes_with_structure() {
        let a = linear_cfg();
        let mut b = linear_cfg();
        b.nodes
            .get_mut("t1")
            .unwrap()
            .successors
            .insert("alt".to_string(), "end".to_string());
        assert_ne!(a.canonical_hash(), b.canonical_hash());
    }

    #[test]
    fn test_parallel_markers() {
        let mut node = CfgNode::new("p1", NodeKind::Noop);
        assert!(node.parallel_marker().is_none());

        node.metadata.insert("parallel_group".to_string(), "g1".into());
        assert_eq!(node.parallel_marker().as_deref(), Some("g1"));

        let mut node = CfgNode::new("p2", NodeKind::Noop);
        node.metadata.insert("parallel".to_string(), true.into());
        assert!(node.parallel_marker().is_some());

        let node = CfgNode::new("p3", NodeKind::Parallel);
        assert!(node.parallel_marker().is_some());
    }
}
