//! Provider selection with policy consultation

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::plan::{Action, ActionType};
use crate::policy::PolicyEngine;
use crate::providers::{ExecContext, PluginRegistry};

/// The negotiator's verdict: which provider runs the action, and why
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationDecision {
    pub provider: String,
    pub reason: String,
}

/// Chooses a provider for an action, then checks policy
pub struct Negotiator {
    registry: Arc<PluginRegistry>,
    policy: Option<Arc<PolicyEngine>>,
}

impl Negotiator {
    pub fn new(registry: Arc<PluginRegistry>, policy: Option<Arc<PolicyEngine>>) -> Self {
        Self { registry, policy }
    }

    /// Selection priority: plugin availability, host requirement, exec
    /// preference metadata, simulated. A policy denial overrides the
    /// tentative choice with the `denied` provider.
    pub fn decide(&self, action: &Action, ctx: &ExecContext) -> NegotiationDecision {
        let (provider, reason) = match action.action_type {
            ActionType::Plugin => match action.module.as_deref() {
                None | Some("") => ("simulated".to_string(), "missing_module"),
                Some(module) => {
                    if self.registry.contains(module) {
                        (module.to_string(), "plugin_available")
                    } else {
                        ("sandbox".to_string(), "plugin_missing_fallback")
                    }
                }
            },
            ActionType::Host => ("hostbridge".to_string(), "host_required"),
            ActionType::Exec => {
                let preferred = action
                    .metadata
                    .get("preferred_provider")
                    .and_then(serde_json::Value::as_str);
                match preferred {
                    Some("hostbridge") => ("hostbridge".to_string(), "preferred_hostbridge"),
                    Some("plugin") => match action.module.as_deref() {
                        Some(module) if self.registry.contains(module) => {
                            (module.to_string(), "preferred_plugin")
                        }
                        _ => ("sandbox".to_string(), "preferred_plugin_missing"),
                    },
                    _ => ("sandbox".to_string(), "default_exec_sandbox"),
                }
            }
            ActionType::Simulated => ("simulated".to_string(), "simulated"),
        };

        if let Some(policy) = &self.policy {
            let resource = serde_json::json!({
                "module": action.module,
                "command": action.command,
            });
            let decision = policy.allow_action(
                &ctx.user_id,
                &ctx.trust_level,
                action.action_type.as_str(),
                &resource,
            );
            if !decision.allowed {
                info!(
                    provider,
                    user = %ctx.user_id,
                    reason = %decision.reason,
                    "Negotiator: policy denied candidate provider"
                );
                return NegotiationDecision {
                    provider: "denied".to_string(),
                    reason: format!("policy_denied:{}", decision.reason),
                };
            }
        }

        debug!(provider, reason, "Negotiator: decided");
        NegotiationDecision {
            provider,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyMode;
    use crate::providers::SimulatedProvider;

    fn registry_with_simulated() -> Arc<PluginRegistry> {
        let registry = Arc::new(PluginRegistry::new());
        registry.register(Arc::new(SimulatedProvider), false).unwrap();
        registry
    }

    #[test]
    fn test_exec_defaults_to_sandbox() {
        let negotiator = Negotiator::new(registry_with_simulated(), None);
        let mut action = Action::new(ActionType::Exec);
        action.command = Some("echo hi".to_string());

        let decision = negotiator.decide(&action, &ExecContext::default());
        assert_eq!(decision.provider, "sandbox");
        assert_eq!(decision.reason, "default_exec_sandbox");
    }

    #[test]
    fn test_host_routes_to_hostbridge() {
        let negotiator = Negotiator::new(registry_with_simulated(), None);
        let mut action = Action::new(ActionType::Host);
        action.module = Some("notify".to_string());

        let decision = negotiator.decide(&action, &ExecContext::default());
        assert_eq!(decision.provider, "hostbridge");
    }

    #[test]
    fn test_registered_plugin_selected() {
        let negotiator = Negotiator::new(registry_with_simulated(), None);
        let mut action = Action::new(ActionType::Plugin);
        action.module = Some("simulated".to_string());

        let decision = negotiator.decide(&action, &ExecContext::default());
        assert_eq!(decision.provider, "simulated");
        assert_eq!(decision.reason, "plugin_available");
    }

    #[test]
    fn test_missing_plugin_falls_back_to_sandbox() {
        let negotiator = Negotiator::new(registry_with_simulated(), None);
        let mut action = Action::new(ActionType::Plugin);
        action.module = Some("browser".to_string());

        let decision = negotiator.decide(&action, &ExecContext::default());
        assert_eq!(decision.provider, "sandbox");
        assert_eq!(decision.reason, "plugin_missing_fallback");
    }

    #[test]
    fn test_preferred_provider_metadata() {
        let negotiator = Negotiator::new(registry_with_simulated(), None);
        let mut action = Action::new(ActionType::Exec);
        action.command = Some("x".to_string());
        action
            .metadata
            .insert("preferred_provider".to_string(), "hostbridge".into());

        let decision = negotiator.decide(&action, &ExecContext::default());
        assert_eq!(decision.provider, "hostbridge");
        assert_eq!(decision.reason, "preferred_hostbridge");
    }

    #[test]
    fn test_policy_deny_yields_denied_provider() {
        let policy = Arc::new(PolicyEngine::new(PolicyMode::Restrictive, vec![]));
        let negotiator = Negotiator::new(registry_with_simulated(), Some(policy));
        let mut action = Action::new(ActionType::Exec);
        action.command = Some("rm file".to_string());

        let decision = negotiator.decide(&action, &ExecContext::default());
        assert_eq!(decision.provider, "denied");
        assert!(decision.reason.starts_with("policy_denied:"));
    }
}
