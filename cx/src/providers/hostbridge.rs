//! Host bridge: whitelisted native command execution
//!
//! Each host module is described by a JSON manifest declaring its allowed
//! arguments, allowed path prefixes, an `exec.cmd` template and a default
//! timeout. Templates render with whitelisted args only; unknown keys come
//! out empty rather than leaking caller data into the command line.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ExecContext, Manifest, Provider, ProviderError};
use crate::plan::{Action, ActionType};
use crate::policy::PolicyEngine;

const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Command template of a host module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostExec {
    pub cmd: String,
}

/// Manifest describing one host module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostManifest {
    pub name: String,
    #[serde(default)]
    pub allowed_args: Vec<String>,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    pub exec: HostExec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

fn path_is_allowed(path: &str, allowed: &[String]) -> bool {
    let real = std::fs::canonicalize(path)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| path.to_string());
    allowed.iter().any(|prefix| {
        let prefix_real = std::fs::canonicalize(prefix)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| prefix.clone());
        Path::new(&real).starts_with(&prefix_real)
    })
}

/// Executes whitelisted native calls described by manifests
pub struct HostBridge {
    manifests: RwLock<HashMap<String, HostManifest>>,
    policy: Option<Arc<PolicyEngine>>,
}

impl HostBridge {
    pub fn new(policy: Option<Arc<PolicyEngine>>) -> Self {
        Self {
            manifests: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Load every `*.json` manifest from a directory; unreadable files are
    /// skipped with a warning
    pub fn load_manifests(&self, dir: impl AsRef<Path>) {
        let dir = dir.as_ref();
        let Ok(entries) = std::fs::read_dir(dir) else {
            debug!(dir = %dir.display(), "HostBridge: no manifest directory");
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "json") != Some(true) {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| serde_json::from_str::<HostManifest>(&text).map_err(|e| e.to_string()))
            {
                Ok(manifest) => self.register_manifest(manifest),
                Err(e) => warn!(path = %path.display(), "HostBridge: failed loading manifest: {}", e),
            }
        }
    }

    pub fn register_manifest(&self, manifest: HostManifest) {
        debug!(module = %manifest.name, "HostBridge: registered manifest");
        let mut manifests = self.manifests.write().unwrap();
        manifests.insert(manifest.name.clone(), manifest);
    }

    pub fn modules(&self) -> Vec<String> {
        let manifests = self.manifests.read().unwrap();
        let mut names: Vec<String> = manifests.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate an action against its module manifest
    fn validate(&self, action: &Action) -> Result<HostManifest, ProviderError> {
        if action.action_type != ActionType::Host {
            return Err(ProviderError::InvalidAction("Action is not a host action".to_string()));
        }
        let module = action
            .module
            .as_deref()
            .ok_or_else(|| ProviderError::InvalidAction("Host action without module".to_string()))?;

        let manifests = self.manifests.read().unwrap();
        let manifest = manifests
            .get(module)
            .cloned()
            .ok_or_else(|| ProviderError::Refused(format!("No manifest for module {}", module)))?;
        drop(manifests);

        for key in action.args.keys() {
            if !manifest.allowed_args.is_empty() && !manifest.allowed_args.contains(key) {
                return Err(ProviderError::Refused(format!(
                    "Argument '{}' is not allowed for module {}",
                    key, module
                )));
            }
        }
        for value in action.args.values() {
            if let Value::String(s) = value {
                if (s.starts_with('/') || s.starts_with("..")) && !manifest.allowed_paths.is_empty() {
                    if !path_is_allowed(s, &manifest.allowed_paths) {
                        return Err(ProviderError::Refused(format!(
                            "Path '{}' not allowed for module {}",
                            s, module
                        )));
                    }
                }
            }
        }
        Ok(manifest)
    }

    /// Render the command template with whitelisted args only
    fn render_command(&self, manifest: &HostManifest, action: &Action) -> Result<String, ProviderError> {
        let mut safe_args = serde_json::Map::new();
        for (key, value) in &action.args {
            if manifest.allowed_args.is_empty() || manifest.allowed_args.contains(key) {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                safe_args.insert(key.clone(), Value::String(rendered));
            }
        }

        let handlebars = Handlebars::new();
        handlebars
            .render_template(&manifest.exec.cmd, &Value::Object(safe_args))
            .map_err(|e| ProviderError::Refused(format!("Failed to render command template: {}", e)))
    }
}

#[async_trait]
impl Provider for HostBridge {
    fn name(&self) -> &str {
        "hostbridge"
    }

    fn manifest(&self) -> Manifest {
        Manifest {
            name: "hostbridge".to_string(),
            version: "1.0.0".to_string(),
            description: "Whitelisted native command execution".to_string(),
            actions: Default::default(),
        }
    }

    async fn execute(&self, action: &Action, ctx: &ExecContext) -> Result<Value, ProviderError> {
        if let Some(policy) = &self.policy {
            let resource = serde_json::json!({
                "module": action.module,
                "command": action.command,
            });
            let decision = policy.allow_action(&ctx.user_id, &ctx.trust_level, "hostbridge.exec", &resource);
            if !decision.allowed {
                return Err(ProviderError::Refused(format!("policy_denied:{}", decision.reason)));
            }
        }

        let manifest = self.validate(action)?;
        let command = self.render_command(&manifest, action)?;
        let timeout = Duration::from_secs(
            action
                .timeout_seconds
                .or(manifest.timeout_seconds)
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        );

        debug!(module = ?action.module, command, "HostBridge: executing");
        let start = Instant::now();
        let output = tokio::time::timeout(
            timeout,
            Command::new("sh").arg("-c").arg(&command).kill_on_drop(true).output(),
        )
        .await;

        let duration = start.elapsed().as_secs_f64();
        match output {
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(-1) as i64;
                let result = serde_json::json!({
                    "success": output.status.success(),
                    "stdout": String::from_utf8_lossy(&output.stdout),
                    "stderr": String::from_utf8_lossy(&output.stderr),
                    "exit_code": exit_code,
                    "duration": duration,
                });
                if output.status.success() {
                    Ok(result)
                } else {
                    Err(ProviderError::CommandFailed(format!("exit {}", exit_code)))
                }
            }
            Ok(Err(e)) => Err(ProviderError::Io(e)),
            Err(_) => Err(ProviderError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_manifest() -> HostManifest {
        HostManifest {
            name: "echoer".to_string(),
            allowed_args: vec!["text".to_string()],
            allowed_paths: vec![],
            exec: HostExec {
                cmd: "echo {{text}}".to_string(),
            },
            timeout_seconds: Some(5),
        }
    }

    fn host_action(module: &str) -> Action {
        let mut action = Action::new(ActionType::Host);
        action.module = Some(module.to_string());
        action
    }

    #[tokio::test]
    async fn test_execute_renders_template() {
        let bridge = HostBridge::new(None);
        bridge.register_manifest(echo_manifest());

        let mut action = host_action("echoer");
        action.args.insert("text".to_string(), "hello".into());

        let result = bridge.execute(&action, &ExecContext::default()).await.unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["stdout"].as_str().unwrap().trim(), "hello");
    }

    #[tokio::test]
    async fn test_unknown_module_refused() {
        let bridge = HostBridge::new(None);
        let action = host_action("ghost");
        let err = bridge.execute(&action, &ExecContext::default()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Refused(_)));
    }

    #[tokio::test]
    async fn test_disallowed_arg_refused() {
        let bridge = HostBridge::new(None);
        bridge.register_manifest(echo_manifest());

        let mut action = host_action("echoer");
        action.args.insert("extra".to_string(), "oops".into());

        let err = bridge.execute(&action, &ExecContext::default()).await.unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_disallowed_path_refused() {
        let bridge = HostBridge::new(None);
        let mut manifest = echo_manifest();
        manifest.allowed_paths = vec!["/tmp".to_string()];
        bridge.register_manifest(manifest);

        let mut action = host_action("echoer");
        action.args.insert("text".to_string(), "/etc/passwd".into());

        let err = bridge.execute(&action, &ExecContext::default()).await.unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_unwhitelisted_template_key_renders_empty() {
        let bridge = HostBridge::new(None);
        let mut manifest = echo_manifest();
        manifest.exec.cmd = "echo {{text}}{{secret}}".to_string();
        bridge.register_manifest(manifest);

        let mut action = host_action("echoer");
        action.args.insert("text".to_string(), "ok".into());

        let result = bridge.execute(&action, &ExecContext::default()).await.unwrap();
        assert_eq!(result["stdout"].as_str().unwrap().trim(), "ok");
    }

    #[tokio::test]
    async fn test_manifest_loading_from_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let manifest_json = serde_json::to_string(&echo_manifest()).unwrap();
        std::fs::write(dir.path().join("echoer.json"), manifest_json).unwrap();
        std::fs::write(dir.path().join("bad.json"), "{nope").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let bridge = HostBridge::new(None);
        bridge.load_manifests(dir.path());
        assert_eq!(bridge.modules(), vec!["echoer".to_string()]);
    }
}
