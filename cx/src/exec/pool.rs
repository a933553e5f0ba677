//! Bounded-concurrency provider dispatch
//!
//! Every action acquires a permit before touching a provider, so no more
//! than `max_workers` provider calls are ever in flight. Provider failures
//! come back as structured results; nothing raises across the pool
//! boundary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::negotiator::Negotiator;
use crate::plan::{Action, ActionType};
use crate::providers::{ExecContext, PluginRegistry};

/// Dispatch outcome status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Ok,
    Error,
}

/// Structured dispatch outcome: `{status, result | error}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResult {
    pub status: DispatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispatchResult {
    pub fn ok(result: Value) -> Self {
        Self {
            status: DispatchStatus::Ok,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: DispatchStatus::Error,
            result: None,
            error: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == DispatchStatus::Ok
    }
}

/// A unit of work for the pool
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub action: Action,
    pub task_name: String,
    pub task_args: Map<String, Value>,
    pub context: ExecContext,
}

/// Semaphore-bounded async dispatcher to pluggable providers
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    max_workers: usize,
    registry: Arc<PluginRegistry>,
    negotiator: Option<Arc<Negotiator>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl WorkerPool {
    pub fn new(max_workers: usize, registry: Arc<PluginRegistry>, negotiator: Option<Arc<Negotiator>>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            max_workers: max_workers.max(1),
            registry,
            negotiator,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Peak number of concurrent provider calls observed
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Resolve the provider for a request: negotiator decision, then node
    /// metadata hints, then the action-type default, then `sandbox`.
    fn resolve_provider(&self, request: &ActionRequest) -> (String, Option<String>) {
        if let Some(negotiator) = &self.negotiator {
            let decision = negotiator.decide(&request.action, &request.context);
            return (decision.provider, Some(decision.reason));
        }

        let metadata = &request.action.metadata;
        for key in ["provider", "plugin", "task_provider"] {
            if let Some(hint) = metadata.get(key).and_then(Value::as_str) {
                if !hint.is_empty() {
                    return (hint.to_string(), None);
                }
            }
        }

        let by_type = match request.action.action_type {
            ActionType::Plugin => request.action.module.clone(),
            ActionType::Host => Some("hostbridge".to_string()),
            ActionType::Simulated => Some("simulated".to_string()),
            ActionType::Exec => None,
        };
        (by_type.unwrap_or_else(|| "sandbox".to_string()), None)
    }

    /// Dispatch one action through its provider
    pub async fn run(&self, request: ActionRequest) -> DispatchResult {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return DispatchResult::error("worker pool closed"),
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        let result = self.dispatch(&request).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        drop(permit);
        result
    }

    async fn dispatch(&self, request: &ActionRequest) -> DispatchResult {
        let (provider_name, reason) = self.resolve_provider(request);
        debug!(
            task = %request.task_name,
            provider = %provider_name,
            ?reason,
            "WorkerPool: dispatching"
        );

        if provider_name == "denied" {
            return DispatchResult::error(reason.unwrap_or_else(|| "action denied by policy".to_string()));
        }

        let Some(provider) = self.registry.get(&provider_name) else {
            warn!(provider = %provider_name, "WorkerPool: provider not registered");
            return DispatchResult::error(format!("plugin '{}' not registered", provider_name));
        };

        match provider.execute(&request.action, &request.context).await {
            Ok(value) => DispatchResult::ok(value),
            Err(e) => DispatchResult::error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{Manifest, Provider, ProviderError, SimulatedProvider};
    use async_trait::async_trait;
    use std::time::Duration;

    struct SlowProvider {
        delay: Duration,
    }

    #[async_trait]
    impl Provider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        fn manifest(&self) -> Manifest {
            Manifest::default()
        }

        async fn execute(&self, _action: &Action, _ctx: &ExecContext) -> Result<Value, ProviderError> {
            tokio::time::sleep(self.delay).await;
            Ok(serde_json::json!({"done": true}))
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl Provider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }

        fn manifest(&self) -> Manifest {
            Manifest::default()
        }

        async fn execute(&self, _action: &Action, _ctx: &ExecContext) -> Result<Value, ProviderError> {
            Err(ProviderError::CommandFailed("nope".to_string()))
        }
    }

    fn request_for(provider: &str) -> ActionRequest {
        let mut action = Action::new(ActionType::Simulated);
        action.metadata.insert("provider".to_string(), provider.into());
        ActionRequest {
            action,
            task_name: "t".to_string(),
            task_args: Map::new(),
            context: ExecContext::default(),
        }
    }

    fn pool_with(providers: Vec<Arc<dyn Provider>>, max_workers: usize) -> WorkerPool {
        let registry = Arc::new(PluginRegistry::new());
        for provider in providers {
            registry.register(provider, false).unwrap();
        }
        WorkerPool::new(max_workers, registry, None)
    }

    #[tokio::test]
    async fn test_successful_dispatch() {
        let pool = pool_with(vec![Arc::new(SimulatedProvider)], 4);
        let result = pool.run(request_for("simulated")).await;
        assert!(result.is_ok());
        assert_eq!(result.result.unwrap()["message"], "simulated");
    }

    #[tokio::test]
    async fn test_provider_error_becomes_structured_result() {
        let pool = pool_with(vec![Arc::new(FailingProvider)], 4);
        let result = pool.run(request_for("failing")).await;
        assert!(!result.is_ok());
        assert!(result.error.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_unregistered_provider_is_error() {
        let pool = pool_with(vec![], 4);
        let result = pool.run(request_for("ghost")).await;
        assert_eq!(result.error.unwrap(), "plugin 'ghost' not registered");
    }

    #[tokio::test]
    async fn test_denied_short_circuits() {
        let pool = pool_with(vec![Arc::new(SimulatedProvider)], 4);
        let result = pool.run(request_for("denied")).await;
        assert!(!result.is_ok());
    }

    #[tokio::test]
    async fn test_type_default_routing() {
        let registry = Arc::new(PluginRegistry::new());
        registry.register(Arc::new(SimulatedProvider), false).unwrap();
        let pool = WorkerPool::new(4, registry, None);

        let request = ActionRequest {
            action: Action::new(ActionType::Simulated),
            task_name: "t".to_string(),
            task_args: Map::new(),
            context: ExecContext::default(),
        };
        assert!(pool.run(request).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_max_workers() {
        let pool = Arc::new(pool_with(
            vec![Arc::new(SlowProvider {
                delay: Duration::from_millis(50),
            })],
            2,
        ));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.run(request_for("slow")).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert!(pool.peak_in_flight() <= 2);
        assert!(pool.peak_in_flight() >= 1);
    }

    #[tokio::test]
    async fn test_parallel_dispatches_overlap() {
        let pool = Arc::new(pool_with(
            vec![Arc::new(SlowProvider {
                delay: Duration::from_millis(50),
            })],
            8,
        ));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.run(request_for("slow")).await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(pool.peak_in_flight() >= 2);
    }
}
