//! No-op provider for dry runs and tests

use async_trait::async_trait;
use serde_json::Value;

use super::{ExecContext, Manifest, Provider, ProviderError};
use crate::plan::Action;

/// Always succeeds without side effects
pub struct SimulatedProvider;

#[async_trait]
impl Provider for SimulatedProvider {
    fn name(&self) -> &str {
        "simulated"
    }

    fn manifest(&self) -> Manifest {
        Manifest {
            name: "simulated".to_string(),
            version: "1.0.0".to_string(),
            description: "No-op provider that reports success".to_string(),
            actions: Default::default(),
        }
    }

    async fn execute(&self, action: &Action, _ctx: &ExecContext) -> Result<Value, ProviderError> {
        Ok(serde_json::json!({
            "message": "simulated",
            "action_id": action.id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ActionType;

    #[tokio::test]
    async fn test_simulated_always_succeeds() {
        let provider = SimulatedProvider;
        let action = Action::new(ActionType::Simulated);
        let result = provider.execute(&action, &ExecContext::default()).await.unwrap();
        assert_eq!(result["message"], "simulated");
    }
}
