//! Decision policy: do, ask, or ignore
//!
//! The active autonomy mode is read at evaluation time from a runtime
//! source (the session context key `autonomy_mode`) with the configured
//! default as fallback, so flipping the key changes behavior immediately.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::intent::Intent;
use crate::skills::{RiskLevel, SkillProposal};

/// Global autonomy mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutonomyMode {
    /// Permissive: act automatically on sufficient confidence
    Full,
    /// Default: act on high confidence, ask on medium
    Hybrid,
    /// Global safety switch: always ask before acting
    AskFirst,
}

impl AutonomyMode {
    pub fn parse(mode: &str) -> Self {
        match mode.trim().to_ascii_lowercase().as_str() {
            "full" => AutonomyMode::Full,
            "ask_first" => AutonomyMode::AskFirst,
            _ => AutonomyMode::Hybrid,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AutonomyMode::Full => "full",
            AutonomyMode::Hybrid => "hybrid",
            AutonomyMode::AskFirst => "ask_first",
        }
    }
}

/// What to do with an intent or proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Do,
    Ask,
    Ignore,
}

/// A policy verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision: DecisionKind,
    pub reason: String,
    pub confidence: f64,
}

impl Decision {
    fn new(decision: DecisionKind, reason: &str, confidence: f64) -> Self {
        Self {
            decision,
            reason: reason.to_string(),
            confidence,
        }
    }
}

/// Source for the runtime mode override (usually the session context)
pub type ModeSource = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Confidence-threshold policy with a runtime mode override
pub struct DecisionPolicy {
    default_mode: AutonomyMode,
    mode_source: Option<ModeSource>,
    high_confidence: f64,
    medium_confidence: f64,
}

impl DecisionPolicy {
    pub fn new(default_mode: AutonomyMode, high_confidence: f64, medium_confidence: f64) -> Self {
        Self {
            default_mode,
            mode_source: None,
            high_confidence,
            medium_confidence,
        }
    }

    pub fn with_mode_source(mut self, source: ModeSource) -> Self {
        self.mode_source = Some(source);
        self
    }

    /// Active mode: runtime override wins over the configured default
    pub fn mode(&self) -> AutonomyMode {
        if let Some(source) = &self.mode_source {
            if let Some(value) = source() {
                if !value.trim().is_empty() {
                    return AutonomyMode::parse(&value);
                }
            }
        }
        self.default_mode
    }

    /// Evaluate an intent
    pub fn evaluate(&self, intent: &Intent) -> Decision {
        let mode = self.mode();
        if mode == AutonomyMode::AskFirst {
            return Decision::new(DecisionKind::Ask, "autonomy_mode_ask_first", intent.confidence);
        }

        let confidence = intent.confidence;
        let decision = if confidence >= self.high_confidence {
            Decision::new(DecisionKind::Do, "high_confidence", confidence)
        } else if confidence >= self.medium_confidence {
            if mode == AutonomyMode::Full {
                Decision::new(DecisionKind::Do, "medium_confidence_full_mode", confidence)
            } else {
                Decision::new(DecisionKind::Ask, "medium_confidence_hybrid", confidence)
            }
        } else {
            Decision::new(DecisionKind::Ignore, "low_confidence", confidence)
        };
        debug!(intent = %intent.intent, mode = mode.as_str(), verdict = ?decision.decision, "DecisionPolicy");
        decision
    }

    /// Evaluate a skill proposal, factoring in its declared risk
    pub fn decide_for_proposal(&self, proposal: &SkillProposal) -> Decision {
        let mode = self.mode();
        if mode == AutonomyMode::AskFirst {
            return Decision::new(DecisionKind::Ask, "autonomy_mode_ask_first", proposal.confidence);
        }

        let confidence = proposal.confidence;
        match proposal.risk {
            RiskLevel::Low => {
                if confidence >= self.medium_confidence.max(0.5) {
                    Decision::new(DecisionKind::Do, "low_risk_confident", confidence)
                } else if mode == AutonomyMode::Full {
                    Decision::new(DecisionKind::Do, "low_risk_full_mode", confidence)
                } else {
                    Decision::new(DecisionKind::Ask, "low_risk_hybrid_ask", confidence)
                }
            }
            RiskLevel::Medium => {
                if mode == AutonomyMode::Full && confidence >= self.high_confidence {
                    Decision::new(DecisionKind::Do, "medium_risk_full_confident", confidence)
                } else {
                    Decision::new(DecisionKind::Ask, "medium_risk_default_ask", confidence)
                }
            }
            RiskLevel::High => Decision::new(DecisionKind::Ask, "high_risk_always_ask", confidence),
        }
    }
}
