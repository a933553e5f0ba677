//! Cross-skill reasoner: fuse co-occurring proposals
//!
//! Buffers recent `skill.proposal` events and applies rule-based fusion:
//! complementary proposals merge into a composite intent, and the buffer
//! clears after a successful fusion so the same pair never fuses twice.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::debug;

use crate::events::{now_secs, EventBus};
use crate::skills::{FusedProposal, SkillProposal};

/// Rule-based proposal fusion over a sliding time window
pub struct CrossSkillReasoner {
    fuse_window_secs: f64,
    buffer: Mutex<Vec<(Instant, SkillProposal)>>,
    bus: Option<Arc<EventBus>>,
}

impl CrossSkillReasoner {
    pub fn new(fuse_window_secs: f64, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            fuse_window_secs,
            buffer: Mutex::new(Vec::new()),
            bus,
        }
    }

    /// Buffer a proposal and attempt fusion; returns the fused proposal
    /// when one was produced
    pub fn handle_proposal(&self, proposal: SkillProposal) -> Option<FusedProposal> {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.push((Instant::now(), proposal));
        buffer.retain(|(ts, _)| ts.elapsed().as_secs_f64() <= self.fuse_window_secs);

        let proposals: Vec<SkillProposal> = buffer.iter().map(|(_, p)| p.clone()).collect();
        let fused = attempt_fusion(&proposals)?;
        buffer.clear();
        drop(buffer);

        debug!(intent = %fused.intent, "CrossSkillReasoner: fused");
        if let Some(bus) = &self.bus {
            bus.publish(
                "skill.fused_proposal",
                serde_json::json!({
                    "source": "cognition",
                    "fused": serde_json::to_value(&fused).unwrap_or_default(),
                    "ts": now_secs(),
                }),
                false,
            );
        }
        Some(fused)
    }

    /// Number of buffered (unfused) proposals
    pub fn buffered(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    /// Drop buffer entries that have aged out of the fusion window
    pub fn sweep(&self) {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.retain(|(ts, _)| ts.elapsed().as_secs_f64() <= self.fuse_window_secs);
    }
}

/// Fusion rule set
fn attempt_fusion(proposals: &[SkillProposal]) -> Option<FusedProposal> {
    if proposals.len() < 2 {
        return None;
    }
    let intents: Vec<&str> = proposals.iter().map(|p| p.intent.as_str()).collect();

    // summarize_page + read_notification => summarize_and_notify
    if intents.contains(&"summarize_page") && intents.contains(&"read_notification") {
        return Some(FusedProposal {
            intent: "summarize_and_notify".to_string(),
            confidence: 0.9,
            components: intents.iter().map(|i| i.to_string()).collect(),
            proposals: proposals.to_vec(),
        });
    }

    // A continuation proposal upgrades the window into a workflow resume
    if intents.contains(&"continue_task") {
        return Some(FusedProposal {
            intent: "resume_workflow".to_string(),
            confidence: 0.8,
            components: vec!["continue_task".to_string()],
            proposals: proposals.to_vec(),
        });
    }

    // Several summarize-ish proposals batch together
    let summarize_count = intents.iter().filter(|i| i.starts_with("summarize")).count();
    if summarize_count >= 2 {
        return Some(FusedProposal {
            intent: "batch_summarize".to_string(),
            confidence: (0.6 + 0.15 * summarize_count as f64).min(0.9),
            components: intents.iter().map(|i| i.to_string()).collect(),
            proposals: proposals.to_vec(),
        });
    }

    None
}
