//! Policy engine: ordered allow/deny rules gated by trust level
//!
//! Rules match on subsystem and action; a rule only applies when the caller
//! trust meets its minimum. With no match the engine falls back to its mode
//! default (permissive allows, restrictive denies).

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Ordered trust levels; unknown strings rank below `low`
pub fn trust_rank(level: &str) -> i32 {
    match level.to_ascii_lowercase().as_str() {
        "none" => 0,
        "low" => 10,
        "medium" => 50,
        "high" => 90,
        "admin" => 100,
        _ => -1,
    }
}

/// `level` meets or exceeds `required`
pub fn trust_permits(level: &str, required: &str) -> bool {
    trust_rank(level) >= trust_rank(required)
}

/// Per-subject trust records with a default level
#[derive(Default)]
pub struct TrustManager {
    default_level: String,
    subjects: Mutex<HashMap<String, String>>,
}

impl TrustManager {
    pub fn new(default_level: impl Into<String>) -> Self {
        let default_level = default_level.into();
        let default_level = if trust_rank(&default_level) < 0 {
            "low".to_string()
        } else {
            default_level
        };
        Self {
            default_level,
            subjects: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_level(&self, subject: &str, level: &str) {
        let mut subjects = self.subjects.lock().unwrap();
        subjects.insert(subject.to_string(), level.to_string());
    }

    pub fn get_level(&self, subject: &str) -> String {
        let subjects = self.subjects.lock().unwrap();
        subjects.get(subject).cloned().unwrap_or_else(|| self.default_level.clone())
    }

    pub fn remove_subject(&self, subject: &str) {
        let mut subjects = self.subjects.lock().unwrap();
        subjects.remove(subject);
    }

    /// Check a subject (or a bare level name) against a required level
    pub fn permits(&self, subject_or_level: &str, required: &str) -> bool {
        let subjects = self.subjects.lock().unwrap();
        let level = subjects
            .get(subject_or_level)
            .cloned()
            .unwrap_or_else(|| subject_or_level.to_string());
        trust_permits(&level, required)
    }
}

/// Rule effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

/// One policy rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Exact subsystem or `*`
    pub subsystem: String,
    /// Exact action, `*`, or a regular expression (tried when the literal
    /// match fails)
    pub action: String,
    pub effect: Effect,
    /// Caller trust must be at least this for the rule to apply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_trust: Option<String>,
}

/// Mode applied when no rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyMode {
    Permissive,
    Restrictive,
}

impl PolicyMode {
    pub fn parse(mode: &str) -> Self {
        match mode.to_ascii_lowercase().as_str() {
            "restrictive" => PolicyMode::Restrictive,
            _ => PolicyMode::Permissive,
        }
    }
}

/// The outcome of a policy check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
}

/// Rule-matched policy engine
pub struct PolicyEngine {
    mode: PolicyMode,
    rules: RwLock<Vec<PolicyRule>>,
}

impl PolicyEngine {
    pub fn new(mode: PolicyMode, rules: Vec<PolicyRule>) -> Self {
        Self {
            mode,
            rules: RwLock::new(rules),
        }
    }

    pub fn permissive() -> Self {
        Self::new(PolicyMode::Permissive, Self::default_rules())
    }

    pub fn restrictive() -> Self {
        Self::new(PolicyMode::Restrictive, Self::default_rules())
    }

    /// Baseline rules: plugin subsystems open to all, sandbox from medium
    /// trust, hostbridge only from high trust
    pub fn default_rules() -> Vec<PolicyRule> {
        vec![
            PolicyRule {
                subsystem: "filesystem".to_string(),
                action: "*".to_string(),
                effect: Effect::Allow,
                min_trust: Some("low".to_string()),
            },
            PolicyRule {
                subsystem: "http".to_string(),
                action: "*".to_string(),
                effect: Effect::Allow,
                min_trust: Some("low".to_string()),
            },
            PolicyRule {
                subsystem: "sandbox".to_string(),
                action: "*".to_string(),
                effect: Effect::Allow,
                min_trust: Some("medium".to_string()),
            },
            PolicyRule {
                subsystem: "hostbridge".to_string(),
                action: "*".to_string(),
                effect: Effect::Allow,
                min_trust: Some("high".to_string()),
            },
        ]
    }

    pub fn load_rules(&self, rules: Vec<PolicyRule>) {
        let mut guard = self.rules.write().unwrap();
        *guard = rules;
    }

    pub fn mode(&self) -> PolicyMode {
        self.mode
    }

    fn match_rule(&self, subsystem: &str, action: &str, trust_level: &str, had_error: &mut bool) -> Option<PolicyRule> {
        let rules = self.rules.read().unwrap();
        for rule in rules.iter() {
            if rule.subsystem != "*" && rule.subsystem != subsystem {
                continue;
            }
            if rule.action != "*" && rule.action != action {
                // Literal match failed; try the action as a regex
                match Regex::new(&format!("^(?:{})$", rule.action)) {
                    Ok(re) => {
                        if !re.is_match(action) {
                            continue;
                        }
                    }
                    Err(e) => {
                        warn!(pattern = %rule.action, "Policy rule has invalid action regex: {}", e);
                        *had_error = true;
                        continue;
                    }
                }
            }
            if let Some(min_trust) = &rule.min_trust {
                if trust_rank(trust_level) < trust_rank(min_trust) {
                    continue;
                }
            }
            return Some(rule.clone());
        }
        None
    }

    /// Evaluate an action for an actor at a trust level.
    ///
    /// `resource` supplies the subsystem under `subsystem`, `plugin` or
    /// `module`; absent all three, the subsystem is `unknown`.
    pub fn allow_action(&self, actor: &str, trust_level: &str, action: &str, resource: &Value) -> PolicyDecision {
        let trust_level = if trust_level.trim().is_empty() {
            "low".to_string()
        } else {
            trust_level.to_ascii_lowercase()
        };

        let subsystem = resource
            .get("subsystem")
            .or_else(|| resource.get("plugin"))
            .or_else(|| resource.get("module"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        let mut had_error = false;
        if let Some(rule) = self.match_rule(subsystem, action, &trust_level, &mut had_error) {
            let allowed = rule.effect == Effect::Allow;
            let reason = format!(
                "matched_rule:{}",
                if allowed { "allow" } else { "deny" }
            );
            debug!(actor, subsystem, action, allowed, "Policy decision");
            return PolicyDecision { allowed, reason };
        }

        let (allowed, reason) = match (self.mode, had_error) {
            (PolicyMode::Permissive, false) => (true, "permissive_default_allow"),
            (PolicyMode::Restrictive, false) => (false, "restrictive_default_deny"),
            (PolicyMode::Permissive, true) => (true, "policy_error_permissive_allow"),
            (PolicyMode::Restrictive, true) => (false, "policy_error_restrictive_deny"),
        };
        debug!(actor, subsystem, action, allowed, reason, "Policy default");
        PolicyDecision {
            allowed,
            reason: reason.to_string(),
        }
    }
}
