//! Skill proposal records

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::now_secs;

/// Declared risk of acting on a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// A structured suggestion from a skill
///
/// Skills publish proposals as `skill.proposal` events; nothing executes
/// until policy admits the proposal and a plan is compiled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillProposal {
    pub skill_name: String,
    pub intent: String,
    pub confidence: f64,
    #[serde(default)]
    pub params: Map<String, Value>,
    pub risk: RiskLevel,
    pub timestamp: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SkillProposal {
    pub fn new(skill_name: impl Into<String>, intent: impl Into<String>, confidence: f64) -> Self {
        Self {
            skill_name: skill_name.into(),
            intent: intent.into(),
            confidence: confidence.clamp(0.0, 1.0),
            params: Map::new(),
            risk: RiskLevel::Medium,
            timestamp: now_secs(),
            metadata: Map::new(),
        }
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// Several co-occurring proposals merged by the cross-skill reasoner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedProposal {
    pub intent: String,
    pub confidence: f64,
    pub components: Vec<String>,
    pub proposals: Vec<SkillProposal>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(SkillProposal::new("s", "i", 1.5).confidence, 1.0);
        assert_eq!(SkillProposal::new("s", "i", -0.5).confidence, 0.0);
    }

    #[test]
    fn test_builders() {
        let proposal = SkillProposal::new("web_summary", "summarize_page", 0.7)
            .with_risk(RiskLevel::Low)
            .with_param("url", "https://example.com".into());
        assert_eq!(proposal.risk, RiskLevel::Low);
        assert_eq!(proposal.params["url"], "https://example.com");
        assert!(proposal.timestamp > 0.0);
    }

    #[test]
    fn test_serde_roundtrip() {
        let proposal = SkillProposal::new("s", "continue_task", 0.8).with_risk(RiskLevel::High);
        let value = serde_json::to_value(&proposal).unwrap();
        assert_eq!(value["risk"], "high");
        let back: SkillProposal = serde_json::from_value(value).unwrap();
        assert_eq!(back.intent, "continue_task");
    }
}
