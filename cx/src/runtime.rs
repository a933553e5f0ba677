//! Runtime assembly: constructs and wires every subsystem
//!
//! Build order follows the dependency chain: bus and policy first, then
//! providers and the pool, then the orchestrator/planner pair, then the
//! autonomy control plane, and finally the cognition layer that paces it
//! all. Long-running loops are driven in bounded chunks under the
//! supervisor so a hung loop is cancelled, counted and restarted.

use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use serde_json::Value;
use tracing::{info, warn};

use crate::autonomy::AutonomyEngine;
use crate::cognition::{CognitiveLoadBalancer, CognitiveLoop, CrossSkillReasoner, CycleConfig, TemporalScheduler};
use crate::config::Config;
use crate::events::EventBus;
use crate::exec::{Orchestrator, WorkerPool};
use crate::llm::{create_client, LlmClient};
use crate::memory::InMemoryVectorStore;
use crate::negotiator::Negotiator;
use crate::planner::Planner;
use crate::policy::{PolicyEngine, PolicyMode, TrustManager};
use crate::providers::{CapabilityRegistry, HostBridge, PluginRegistry, SandboxRunner, SimulatedProvider};
use crate::session::SessionManager;
use crate::skills::{
    MemoryConsolidationSkill, SkillDeps, SkillManager, SkillProposal, TaskContinuationSkill, WebSummarySkill,
};
use crate::supervisor::Supervisor;
use sessionstore::SqliteStorageAdapter;

/// Default session id used for runtime context and persistence
pub const DEFAULT_SESSION_ID: &str = "default";

/// The assembled daemon
pub struct Runtime {
    pub config: Config,
    pub bus: Arc<EventBus>,
    pub policy: Arc<PolicyEngine>,
    pub trust: Arc<TrustManager>,
    pub registry: Arc<PluginRegistry>,
    pub capabilities: Arc<CapabilityRegistry>,
    pub pool: Arc<WorkerPool>,
    pub orchestrator: Arc<Orchestrator>,
    pub planner: Arc<Planner>,
    pub session: Arc<SessionManager>,
    pub memory: Arc<InMemoryVectorStore>,
    pub load: Arc<CognitiveLoadBalancer>,
    pub reasoner: Arc<CrossSkillReasoner>,
    pub skills: Arc<SkillManager>,
    pub autonomy: Arc<AutonomyEngine>,
    pub supervisor: Arc<Supervisor>,
    pub scheduler: Arc<TemporalScheduler>,
    pub cycle: Arc<CognitiveLoop>,
}

impl Runtime {
    /// Build the full component graph (must run inside a tokio runtime)
    pub fn build(config: Config) -> Result<Arc<Self>> {
        // Handler dispatch shares the thread-worker budget
        let bus = Arc::new(EventBus::new(config.worker_pool.thread_workers.max(1)));

        let policy = Arc::new(PolicyEngine::new(
            PolicyMode::parse(&config.policy.mode),
            PolicyEngine::default_rules(),
        ));
        let trust = Arc::new(TrustManager::new("low"));

        // Providers
        let registry = Arc::new(PluginRegistry::new());
        let sandbox = Arc::new(SandboxRunner::new(
            &config.sandbox.work_dir,
            Duration::from_secs(config.sandbox.default_timeout_secs),
            Some(policy.clone()),
        ));
        let hostbridge = Arc::new(HostBridge::new(Some(policy.clone())));
        registry.register(sandbox.clone(), false)?;
        registry.register(hostbridge.clone(), false)?;
        registry.register(Arc::new(SimulatedProvider), false)?;

        let capabilities = Arc::new(CapabilityRegistry::new());
        capabilities.register_provider(sandbox.as_ref());
        capabilities.register_provider(hostbridge.as_ref());
        capabilities.register_provider(&SimulatedProvider);

        // Dispatch
        let negotiator = Arc::new(Negotiator::new(registry.clone(), Some(policy.clone())));
        let pool = Arc::new(WorkerPool::new(
            config.worker_pool.max_workers,
            registry.clone(),
            Some(negotiator),
        ));
        let orchestrator = Arc::new(
            Orchestrator::new(pool.clone(), Some(policy.clone()), Some(bus.clone())).with_timeouts(
                Duration::from_millis(config.autonomy.execution_timeout_ms),
                Duration::from_millis(config.autonomy.execution_timeout_ms * 5),
            ),
        );

        // Session store
        let adapter = Arc::new(SqliteStorageAdapter::new(&config.session.db_path));
        let session = SessionManager::start(adapter, &config.session)?;
        if session.peek(DEFAULT_SESSION_ID).is_none() {
            session.create(Some(DEFAULT_SESSION_ID.to_string()), None);
        }

        // LLM is optional: without a key the runtime still executes plans,
        // it just cannot generate them
        let llm: Option<Arc<dyn LlmClient>> = match create_client(&config.llm) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("LLM client unavailable, running without generation: {}", e);
                None
            }
        };

        let memory = Arc::new(InMemoryVectorStore::new());
        let mut planner = Planner::new(config.planner.clone())
            .with_vector_store(memory.clone())
            .with_capabilities(capabilities.clone())
            .with_bus(bus.clone());
        if let Some(llm) = &llm {
            planner = planner.with_llm(llm.clone(), config.llm.max_tokens);
        }
        let planner = Arc::new(planner);

        // Autonomy + cognition
        let autonomy = AutonomyEngine::new(
            config.autonomy.clone(),
            bus.clone(),
            planner.clone(),
            orchestrator.clone(),
            llm.clone(),
            Some((session.clone(), DEFAULT_SESSION_ID.to_string())),
        );

        let load = Arc::new(CognitiveLoadBalancer::new(config.load.clone(), Some(bus.clone())));
        let reasoner = Arc::new(CrossSkillReasoner::new(2.0, Some(bus.clone())));
        let supervisor = Supervisor::new(config.supervisor.clone(), Some(bus.clone()));

        let skills = SkillManager::new(SkillDeps {
            bus: Some(bus.clone()),
            memory: Some(memory.clone()),
            llm,
            planner: Some(planner.clone()),
            orchestrator: Some(orchestrator.clone()),
            session: Some(session.clone()),
            policy: Some(policy.clone()),
            load: Some(load.clone()),
            default_session_id: Some(DEFAULT_SESSION_ID.to_string()),
        });
        skills.register(Arc::new(TaskContinuationSkill));
        skills.register(Arc::new(WebSummarySkill));
        skills.register(Arc::new(MemoryConsolidationSkill));

        let scheduler = Arc::new(TemporalScheduler::new(
            config.scheduler.clone(),
            Some(bus.clone()),
            Some(pool.clone()),
            Some((session.clone(), DEFAULT_SESSION_ID.to_string())),
        ));

        let cycle = Arc::new(
            CognitiveLoop::new(CycleConfig::default())
                .with_bus(bus.clone())
                .with_load(load.clone())
                .with_supervisor(supervisor.clone())
                .with_skills(skills.clone())
                .with_reasoner(reasoner.clone())
                .with_autonomy(autonomy.clone()),
        );

        let runtime = Arc::new(Self {
            config,
            bus,
            policy,
            trust,
            registry,
            capabilities,
            pool,
            orchestrator,
            planner,
            session,
            memory,
            load,
            reasoner,
            skills,
            autonomy,
            supervisor,
            scheduler,
            cycle,
        });
        runtime.wire_proposal_flow();
        Ok(runtime)
    }

    /// skill.proposal -> load admission -> fusion; fused proposals flow
    /// back to the autonomy engine for decisioning
    fn wire_proposal_flow(self: &Arc<Self>) {
        let load = self.load.clone();
        let reasoner = self.reasoner.clone();
        self.bus
            .subscribe("skill.proposal", move |_topic, payload: &Value| {
                let Some(raw) = payload.get("proposal") else { return };
                let Ok(proposal) = serde_json::from_value::<SkillProposal>(raw.clone()) else {
                    warn!("Unparseable skill proposal dropped");
                    return;
                };
                if !load.allow_proposal(raw) {
                    return;
                }
                reasoner.handle_proposal(proposal);
            })
            .ok();

        let autonomy = self.autonomy.clone();
        self.bus
            .subscribe("skill.fused_proposal", move |_topic, payload: &Value| {
                let Some(fused) = payload.get("fused") else { return };
                let intent = fused.get("intent").and_then(Value::as_str).unwrap_or("").to_string();
                let confidence = fused.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
                if intent.is_empty() {
                    return;
                }
                let proposal = SkillProposal::new("fusion", intent, confidence);
                let autonomy = autonomy.clone();
                tokio::spawn(async move {
                    autonomy.process_proposal(proposal).await;
                });
            })
            .ok();
    }

    /// Start every loop; the scheduler and heartbeat run in bounded chunks
    /// under the supervisor
    pub async fn start(self: &Arc<Self>) {
        self.skills.start().await;
        self.autonomy.start();

        let scheduler = self.scheduler.clone();
        let sched_sleep = Duration::from_millis(self.config.scheduler.max_sleep_ms.max(50));
        self.supervisor.watch(
            "temporal_scheduler",
            move || {
                let scheduler = scheduler.clone();
                async move {
                    // One supervised chunk: ~30 drain passes
                    for _ in 0..30 {
                        scheduler.run_due().await;
                        tokio::time::sleep(sched_sleep).await;
                    }
                    Ok(())
                }
            },
            true,
        );

        let cycle = self.cycle.clone();
        self.supervisor.watch(
            "cognitive_loop",
            move || {
                let cycle = cycle.clone();
                async move {
                    for _ in 0..30 {
                        let interval = cycle.run_cycle().await;
                        tokio::time::sleep(Duration::from_secs_f64(interval.max(0.05))).await;
                    }
                    Ok(())
                }
            },
            true,
        );

        info!("Runtime started");
    }

    pub async fn shutdown(&self) {
        info!("Runtime shutting down");
        self.supervisor.stop_all();
        self.cycle.stop();
        self.scheduler.stop();
        self.autonomy.stop().await;
        self.skills.stop().await;
        self.session.shutdown().await;
        self.bus.shutdown(true, Duration::from_secs(2)).await;
        info!("Runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.session.db_path = dir
            .path()
            .join("sessions.db")
            .to_string_lossy()
            .to_string();
        config.sandbox.work_dir = dir.path().join("sandbox").to_string_lossy().to_string();
        config
    }

    #[tokio::test]
    async fn test_build_wires_all_components() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::build(test_config(&dir)).unwrap();

        assert_eq!(
            runtime.registry.list(),
            vec!["hostbridge".to_string(), "sandbox".to_string(), "simulated".to_string()]
        );
        assert_eq!(runtime.capabilities.list().len(), 3);
        assert!(runtime.session.peek(DEFAULT_SESSION_ID).is_some());
        assert_eq!(runtime.skills.skill_names().len(), 3);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::build(test_config(&dir)).unwrap();
        runtime.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_proposal_flow_reaches_reasoner() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::build(test_config(&dir)).unwrap();

        let proposal = SkillProposal::new("web_summary", "summarize_page", 0.8);
        runtime.bus.publish(
            "skill.proposal",
            serde_json::json!({"proposal": serde_json::to_value(&proposal).unwrap()}),
            true,
        );

        assert_eq!(runtime.reasoner.buffered(), 1);
        runtime.shutdown().await;
    }
}
