//! Sandboxed command execution

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ExecContext, Manifest, ManifestAction, Provider, ProviderError};
use crate::plan::Action;
use crate::policy::PolicyEngine;

/// Substrings that fail the static command screen
const UNSAFE_COMMANDS: &[&str] = &[
    "rm -rf /",
    "rm -rf --no-preserve-root",
    "mkfs",
    ":(){",
    "dd if=/dev/zero of=/dev/",
    "> /dev/sd",
    "shutdown",
    "reboot",
];

/// Static screen for obviously destructive commands
pub fn command_is_safe(command: &str) -> bool {
    let normalized = command.to_ascii_lowercase();
    !UNSAFE_COMMANDS.iter().any(|bad| normalized.contains(bad))
}

/// Result of one sandboxed command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub duration: f64,
}

impl ExecutionResult {
    fn refusal(stderr: impl Into<String>, exit_code: i64) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
            duration: 0.0,
        }
    }
}

/// Executes shell commands inside a working directory with timeouts and
/// policy consultation
pub struct SandboxRunner {
    work_dir: PathBuf,
    default_timeout: Duration,
    policy: Option<Arc<PolicyEngine>>,
}

impl SandboxRunner {
    pub fn new(work_dir: impl Into<PathBuf>, default_timeout: Duration, policy: Option<Arc<PolicyEngine>>) -> Self {
        let work_dir = work_dir.into();
        if let Err(e) = std::fs::create_dir_all(&work_dir) {
            warn!(dir = %work_dir.display(), "SandboxRunner: failed to create work dir: {}", e);
        }
        Self {
            work_dir,
            default_timeout,
            policy,
        }
    }

    /// Run one command. Refusals come back as results with negative exit
    /// codes: -2 unsafe command, -3 policy denied, -1 timeout.
    pub async fn run(&self, command: &str, timeout: Option<Duration>, ctx: &ExecContext) -> ExecutionResult {
        if !command_is_safe(command) {
            warn!(command, "SandboxRunner: command flagged unsafe");
            return ExecutionResult::refusal("command flagged unsafe", -2);
        }

        if let Some(policy) = &self.policy {
            let resource = serde_json::json!({"subsystem": "sandbox", "command": command});
            let decision = policy.allow_action(&ctx.user_id, &ctx.trust_level, "sandbox.run", &resource);
            if !decision.allowed {
                return ExecutionResult::refusal(format!("policy_denied:{}", decision.reason), -3);
            }
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        let start = Instant::now();
        debug!(command, ?timeout, "SandboxRunner: executing");

        let output = tokio::time::timeout(
            timeout,
            Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&self.work_dir)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let duration = start.elapsed().as_secs_f64();
        match output {
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(-1) as i64;
                ExecutionResult {
                    success: output.status.success(),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    exit_code,
                    duration,
                }
            }
            Ok(Err(e)) => ExecutionResult {
                success: false,
                stdout: String::new(),
                stderr: e.to_string(),
                exit_code: -1,
                duration,
            },
            Err(_) => ExecutionResult {
                success: false,
                stdout: String::new(),
                stderr: "timeout".to_string(),
                exit_code: -1,
                duration,
            },
        }
    }
}

#[async_trait]
impl Provider for SandboxRunner {
    fn name(&self) -> &str {
        "sandbox"
    }

    fn manifest(&self) -> Manifest {
        let mut actions = std::collections::BTreeMap::new();
        actions.insert(
            "run".to_string(),
            ManifestAction {
                description: "Execute a shell command in the sandbox work dir".to_string(),
                args: serde_json::json!({
                    "cmd": {"type": "string", "required": true},
                    "timeout": {"type": "number", "required": false},
                })
                .as_object()
                .cloned()
                .unwrap_or_default(),
                effects: Some(vec!["process".to_string()]),
            },
        );
        Manifest {
            name: "sandbox".to_string(),
            version: "1.0.0".to_string(),
            description: "Sandboxed command execution".to_string(),
            actions,
        }
    }

    async fn execute(&self, action: &Action, ctx: &ExecContext) -> Result<Value, ProviderError> {
        let command = action
            .command
            .as_deref()
            .or_else(|| action.args.get("cmd").and_then(Value::as_str))
            .or_else(|| action.metadata.get("command").and_then(Value::as_str))
            .ok_or_else(|| ProviderError::InvalidAction("Sandbox command missing".to_string()))?;

        let timeout = action.timeout_seconds.map(Duration::from_secs);
        let result = self.run(command, timeout, ctx).await;

        if result.success {
            Ok(serde_json::to_value(&result).unwrap_or(Value::Null))
        } else if result.stderr == "timeout" {
            Err(ProviderError::Timeout(timeout.unwrap_or(self.default_timeout)))
        } else if result.exit_code == -2 || result.exit_code == -3 {
            Err(ProviderError::Refused(result.stderr))
        } else {
            Err(ProviderError::CommandFailed(format!(
                "exit {}: {}",
                result.exit_code,
                result.stderr.trim()
            )))
        }
    }
}
