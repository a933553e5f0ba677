//! Providers execute Actions on behalf of the worker pool
//!
//! A provider is a named capability with a manifest describing the actions
//! it supports. The bundled providers are `sandbox` (command execution),
//! `hostbridge` (whitelisted native calls) and `simulated` (no-op success);
//! plugins register under their own module names.

mod capability;
mod hostbridge;
mod registry;
mod sandbox;
mod simulated;

pub use capability::CapabilityRegistry;
pub use hostbridge::{HostBridge, HostManifest};
pub use registry::PluginRegistry;
pub use sandbox::{command_is_safe, ExecutionResult, SandboxRunner};
pub use simulated::SimulatedProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::plan::Action;

/// Provider execution failures
///
/// These are converted into structured dispatch results at the worker pool
/// boundary; they never cross loop boundaries as panics.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider refused: {0}")]
    Refused(String),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Execution context flowing alongside every action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecContext {
    pub plan_id: Option<String>,
    pub node_id: Option<String>,
    pub user_id: String,
    pub trust_level: String,
    /// Runtime variables (loop iterator injection lands here)
    #[serde(default)]
    pub vars: Map<String, Value>,
}

impl Default for ExecContext {
    fn default() -> Self {
        Self {
            plan_id: None,
            node_id: None,
            user_id: "system".to_string(),
            trust_level: "low".to_string(),
            vars: Map::new(),
        }
    }
}

/// One action a capability supports
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestAction {
    pub description: String,
    /// arg name -> {type, required?, default?}
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effects: Option<Vec<String>>,
}

/// Capability manifest consumed by the planner and negotiator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(default)]
    pub actions: std::collections::BTreeMap<String, ManifestAction>,
}

/// An executable capability
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry name (`sandbox`, `hostbridge`, a plugin module name, ...)
    fn name(&self) -> &str;

    /// Manifest describing supported actions
    fn manifest(&self) -> Manifest;

    /// Execute an action, returning a JSON result
    async fn execute(&self, action: &Action, ctx: &ExecContext) -> Result<Value, ProviderError>;
}
