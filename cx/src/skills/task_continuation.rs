//! Task continuation skill
//!
//! Watches window focus changes; when the runtime context carries a pending
//! task marker, proposes resuming it.

use async_trait::async_trait;
use serde_json::Value;

use super::{RiskLevel, Skill, SkillContext, SkillProposal};

/// Pending-task context key
pub const PENDING_TASK_KEY: &str = "pending_task";

pub struct TaskContinuationSkill;

#[async_trait]
impl Skill for TaskContinuationSkill {
    fn name(&self) -> &'static str {
        "task_continuation"
    }

    fn description(&self) -> &'static str {
        "Proposes resuming an interrupted task when focus changes"
    }

    fn subscriptions(&self) -> Vec<String> {
        vec!["perception.active_window".to_string()]
    }

    fn priority(&self) -> u8 {
        60
    }

    async fn on_event(&self, event: &Value, ctx: &SkillContext) {
        let Some(pending) = ctx.runtime_get(PENDING_TASK_KEY) else {
            return;
        };
        let Some(task) = pending.as_str().filter(|t| !t.is_empty()) else {
            return;
        };

        let title = event
            .pointer("/window/title")
            .and_then(Value::as_str)
            .unwrap_or("");

        let proposal = SkillProposal::new(self.name(), "continue_task", 0.75)
            .with_risk(RiskLevel::Low)
            .with_param("task", task.into())
            .with_param("window_title", title.into());
        ctx.propose(proposal).await;
    }
}
