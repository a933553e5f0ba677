//! Web summary skill
//!
//! Notifications and loaded pages turn into summarize/read proposals; the
//! cross-skill reasoner may fuse them into a composite workflow.

use async_trait::async_trait;
use serde_json::Value;

use super::{RiskLevel, Skill, SkillContext, SkillProposal};

pub struct WebSummarySkill;

#[async_trait]
impl Skill for WebSummarySkill {
    fn name(&self) -> &'static str {
        "web_summary"
    }

    fn description(&self) -> &'static str {
        "Proposes summarizing pages and reading notifications"
    }

    fn subscriptions(&self) -> Vec<String> {
        vec![
            "perception.notification".to_string(),
            "perception.page_loaded".to_string(),
        ]
    }

    fn cooldown(&self) -> std::time::Duration {
        std::time::Duration::from_secs(10)
    }

    async fn on_event(&self, event: &Value, ctx: &SkillContext) {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
        match event_type {
            "page_loaded" => {
                let url = event.get("url").and_then(Value::as_str).unwrap_or("");
                if url.is_empty() {
                    return;
                }
                let proposal = SkillProposal::new(self.name(), "summarize_page", 0.7)
                    .with_risk(RiskLevel::Low)
                    .with_param("url", url.into());
                ctx.propose(proposal).await;
            }
            "notification" => {
                let body = event
                    .pointer("/payload/body")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let proposal = SkillProposal::new(self.name(), "read_notification", 0.6)
                    .with_risk(RiskLevel::Low)
                    .with_param("body", body.into());
                ctx.propose(proposal).await;
            }
            _ => {}
        }
    }
}
