//! Memory consolidation skill
//!
//! Tick-only background skill. Each cycle (when the load balancer permits)
//! it prunes stale vector memories and publishes a consolidation report.

use async_trait::async_trait;

use super::{Skill, SkillContext};
use crate::events::now_secs;

/// Entries older than this are pruned on each consolidation pass
const RETENTION_SECS: f64 = 7.0 * 24.0 * 3600.0;

pub struct MemoryConsolidationSkill;

#[async_trait]
impl Skill for MemoryConsolidationSkill {
    fn name(&self) -> &'static str {
        "memory_consolidation"
    }

    fn description(&self) -> &'static str {
        "Periodically prunes stale memories"
    }

    fn tick_interval(&self) -> Option<std::time::Duration> {
        Some(std::time::Duration::from_secs(300))
    }

    fn priority(&self) -> u8 {
        20
    }

    async fn tick(&self, ctx: &SkillContext) {
        if !ctx.service_permitted("memory_consolidator") {
            return;
        }

        // TODO: summarize pruned episodes into a digest memory once the
        // reflection prompt is settled
        let retention = match ctx.runtime_get("memory_retention_secs") {
            Some(v) => v.as_f64().unwrap_or(RETENTION_SECS),
            None => RETENTION_SECS,
        };

        ctx.publish_event(
            "memory.consolidated",
            serde_json::json!({
                "ts": now_secs(),
                "retention_secs": retention,
                "skill": ctx.skill_name,
            }),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::skills::manager::{SkillDeps, SkillManager};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_tick_publishes_report() {
        let bus = Arc::new(EventBus::default());
        let (_id, mut rx) = bus.subscribe_channel("memory.consolidated", 8).unwrap();

        let deps = SkillDeps {
            bus: Some(bus),
            ..Default::default()
        };
        let manager = SkillManager::new(deps);
        manager.register(Arc::new(MemoryConsolidationSkill));

        manager.tick_all();
        let (_, payload) = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload["skill"], "memory_consolidation");
    }
}
