//! Executable action records

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Cross-field validation failures
#[derive(Debug, Clone, Error)]
pub enum ActionError {
    #[error("exec actions require a command")]
    MissingCommand,

    #[error("{0} actions require a module name")]
    MissingModule(String),
}

/// How an action is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Exec,
    Plugin,
    Host,
    Simulated,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Exec => "exec",
            ActionType::Plugin => "plugin",
            ActionType::Host => "host",
            ActionType::Simulated => "simulated",
        }
    }
}

fn new_action_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("a{}", &hex[..8])
}

/// A unit of work handed to a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(default = "new_action_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_outputs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Action {
    pub fn new(action_type: ActionType) -> Self {
        Self {
            id: new_action_id(),
            action_type,
            command: None,
            module: None,
            args: Map::new(),
            expect_outputs: None,
            timeout_seconds: None,
            metadata: Map::new(),
        }
    }

    /// Enforce the type/field contract: exec requires a command, plugin and
    /// host require a module. The irrelevant field is cleared.
    pub fn validate(&mut self) -> Result<(), ActionError> {
        match self.action_type {
            ActionType::Exec => {
                if self.command.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return Err(ActionError::MissingCommand);
                }
                self.module = None;
            }
            ActionType::Plugin | ActionType::Host => {
                if self.module.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return Err(ActionError::MissingModule(self.action_type.as_str().to_string()));
                }
                self.command = None;
            }
            ActionType::Simulated => {}
        }
        Ok(())
    }

    /// Payload shape handed to providers
    pub fn to_exec_payload(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "type": self.action_type.as_str(),
            "command": self.command,
            "module": self.module,
            "args": Value::Object(self.args.clone()),
            "timeout": self.timeout_seconds,
            "metadata": Value::Object(self.metadata.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_requires_command() {
        let mut action = Action::new(ActionType::Exec);
        assert!(matches!(action.validate(), Err(ActionError::MissingCommand)));

        action.command = Some("echo hi".to_string());
        action.module = Some("ignored".to_string());
        action.validate().unwrap();
        assert!(action.module.is_none());
    }

    #[test]
    fn test_plugin_requires_module() {
        let mut action = Action::new(ActionType::Plugin);
        assert!(matches!(action.validate(), Err(ActionError::MissingModule(_))));

        action.module = Some("browser".to_string());
        action.command = Some("ignored".to_string());
        action.validate().unwrap();
        assert!(action.command.is_none());
    }

    #[test]
    fn test_host_requires_module() {
        let mut action = Action::new(ActionType::Host);
        assert!(action.validate().is_err());
        action.module = Some("notify".to_string());
        assert!(action.validate().is_ok());
    }

    #[test]
    fn test_simulated_needs_nothing() {
        let mut action = Action::new(ActionType::Simulated);
        assert!(action.validate().is_ok());
    }

    #[test]
    fn test_serde_lowercase_type() {
        let mut action = Action::new(ActionType::Exec);
        action.command = Some("true".to_string());
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "exec");
    }

    #[test]
    fn test_exec_payload_shape() {
        let mut action = Action::new(ActionType::Exec);
        action.command = Some("ls".to_string());
        action.timeout_seconds = Some(5);
        let payload = action.to_exec_payload();
        assert_eq!(payload["command"], "ls");
        assert_eq!(payload["timeout"], 5);
        assert!(payload["id"].as_str().unwrap().starts_with('a'));
    }
}
