//! Plan container and execution schemas

mod action;
mod graph;

pub use action::{Action, ActionError, ActionType};
pub use graph::{new_node_id, Cfg, CfgNode, GraphError, NodeKind};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dsl::AstRoot;
use crate::events::now_iso;

/// Plan lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Created => "created",
            PlanStatus::Running => "running",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled)
    }
}

/// Generate a fresh plan id
pub fn new_plan_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("plan_{}", &hex[..8])
}

/// Compiled plan: DSL source, AST, CFG and runtime metadata
///
/// Immutable after creation apart from its status, which the orchestrator
/// owns while the plan runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default = "new_plan_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsl: Option<String>,
    #[serde(skip)]
    pub ast: Option<AstRoot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfg: Option<Cfg>,
    #[serde(default = "now_iso")]
    pub created_at: String,
    pub status: PlanStatus,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Plan {
    pub fn new(cfg: Cfg) -> Self {
        Self {
            id: new_plan_id(),
            dsl: None,
            ast: None,
            cfg: Some(cfg),
            created_at: now_iso(),
            status: PlanStatus::Created,
            metadata: Map::new(),
        }
    }

    /// Deterministic hash of the plan, derived from its CFG; used for
    /// dedup and provenance. `None` when no CFG is attached.
    pub fn canonical_hash(&self) -> Option<String> {
        self.cfg.as_ref().map(Cfg::canonical_hash)
    }

    /// Compact summary for logs and episodes
    pub fn to_summary(&self) -> Value {
        let snippet = self.dsl.as_ref().map(|dsl| {
            if dsl.len() > 512 {
                format!("{}...", &dsl[..512])
            } else {
                dsl.clone()
            }
        });
        serde_json::json!({
            "id": self.id,
            "dsl_snippet": snippet,
            "status": self.status.as_str(),
            "created_at": self.created_at,
            "metadata": Value::Object(self.metadata.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_ids_are_prefixed() {
        let plan = Plan::new(Cfg::new());
        assert!(plan.id.starts_with("plan_"));
        assert_eq!(plan.status, PlanStatus::Created);
    }

    #[test]
    fn test_status_terminality() {
        assert!(!PlanStatus::Created.is_terminal());
        assert!(!PlanStatus::Running.is_terminal());
        assert!(PlanStatus::Completed.is_terminal());
        assert!(PlanStatus::Failed.is_terminal());
        assert!(PlanStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_canonical_hash_requires_cfg() {
        let mut plan = Plan::new(Cfg::new());
        assert!(plan.canonical_hash().is_some());
        plan.cfg = None;
        assert!(plan.canonical_hash().is_none());
    }

    #[test]
    fn test_summary_truncates_dsl() {
        let mut plan = Plan::new(Cfg::new());
        plan.dsl = Some("x".repeat(600));
        let summary = plan.to_summary();
        let snippet = summary["dsl_snippet"].as_str().unwrap();
        assert!(snippet.ends_with("..."));
        assert_eq!(snippet.len(), 515);
    }
}
