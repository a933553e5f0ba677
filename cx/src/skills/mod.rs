//! Skills: event- and tick-driven proposal producers
//!
//! A skill subscribes to topic globs and/or ticks on an interval. It never
//! executes actions directly: it publishes `skill.proposal` events through
//! its context, subject to its cooldown, and the autonomy side decides what
//! happens next.

mod consolidation;
pub(crate) mod manager;
mod proposal;
mod task_continuation;
mod web_summary;

pub use consolidation::MemoryConsolidationSkill;
pub use manager::{topic_matches, SkillDeps, SkillManager};
pub use proposal::{FusedProposal, RiskLevel, SkillProposal};
pub use task_continuation::TaskContinuationSkill;
pub use web_summary::WebSummarySkill;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cognition::CognitiveLoadBalancer;
use crate::events::{now_secs, EventBus};
use crate::exec::{CancelToken, Orchestrator, RunSummary, StateTracker};
use crate::llm::LlmClient;
use crate::memory::{MemoryHit, VectorStore};
use crate::plan::Plan;
use crate::planner::{PlanError, Planner};
use crate::policy::PolicyEngine;
use crate::session::SessionManager;

/// The skill contract
#[async_trait]
pub trait Skill: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str {
        ""
    }

    /// Topic globs this skill wants events for (`perception.*`, `*`, exact)
    fn subscriptions(&self) -> Vec<String> {
        Vec::new()
    }

    /// Interval between automatic ticks; `None` disables ticking
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    /// Conflict-resolution priority; higher wins
    fn priority(&self) -> u8 {
        50
    }

    /// Minimum spacing between visible actions
    fn cooldown(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn on_start(&self) {}

    async fn on_stop(&self) {}

    /// Called for each subscribed event
    async fn on_event(&self, _event: &Value, _ctx: &SkillContext) {}

    /// Periodic work
    async fn tick(&self, _ctx: &SkillContext) {}
}

/// Shared cooldown state owned by the manager, consulted by the context
#[derive(Clone, Default)]
pub(crate) struct ActionGate {
    last_action_at: Arc<Mutex<Option<Instant>>>,
}

impl ActionGate {
    pub(crate) fn allowed(&self, cooldown: Duration) -> bool {
        let last = self.last_action_at.lock().unwrap();
        match *last {
            Some(at) => at.elapsed() >= cooldown,
            None => true,
        }
    }

    pub(crate) fn mark(&self) {
        let mut last = self.last_action_at.lock().unwrap();
        *last = Some(Instant::now());
    }
}

/// Capabilities injected into skill callbacks
#[derive(Clone)]
pub struct SkillContext {
    pub skill_name: String,
    pub session_id: Option<String>,
    cooldown: Duration,
    gate: ActionGate,
    bus: Option<Arc<EventBus>>,
    memory: Option<Arc<dyn VectorStore>>,
    llm: Option<Arc<dyn LlmClient>>,
    planner: Option<Arc<Planner>>,
    orchestrator: Option<Arc<Orchestrator>>,
    session: Option<Arc<SessionManager>>,
    policy: Option<Arc<PolicyEngine>>,
    load: Option<Arc<CognitiveLoadBalancer>>,
}

impl SkillContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        skill_name: String,
        session_id: Option<String>,
        cooldown: Duration,
        gate: ActionGate,
        bus: Option<Arc<EventBus>>,
        memory: Option<Arc<dyn VectorStore>>,
        llm: Option<Arc<dyn LlmClient>>,
        planner: Option<Arc<Planner>>,
        orchestrator: Option<Arc<Orchestrator>>,
        session: Option<Arc<SessionManager>>,
        policy: Option<Arc<PolicyEngine>>,
        load: Option<Arc<CognitiveLoadBalancer>>,
    ) -> Self {
        Self {
            skill_name,
            session_id,
            cooldown,
            gate,
            bus,
            memory,
            llm,
            planner,
            orchestrator,
            session,
            policy,
            load,
        }
    }

    /// Whether the cooldown window has elapsed since the last visible
    /// action
    pub fn allowed_to_act(&self) -> bool {
        self.gate.allowed(self.cooldown)
    }

    pub fn mark_action(&self) {
        self.gate.mark();
    }

    /// Publish a raw event on the bus
    pub async fn publish_event(&self, topic: &str, payload: Value) {
        if let Some(bus) = &self.bus {
            bus.publish(topic, payload, false);
        } else {
            debug!(topic, "SkillContext: publish without bus (noop)");
        }
    }

    /// Publish a `skill.proposal` event if the cooldown permits; returns
    /// whether the proposal went out
    pub async fn propose(&self, proposal: SkillProposal) -> bool {
        if !self.allowed_to_act() {
            debug!(skill = %self.skill_name, intent = %proposal.intent, "Skill cooldown active, proposal suppressed");
            return false;
        }
        self.mark_action();
        self.publish_event(
            "skill.proposal",
            serde_json::json!({
                "proposal": serde_json::to_value(&proposal).unwrap_or_default(),
                "ts": now_secs(),
            }),
        )
        .await;
        true
    }

    /// Top-k memories for a text query (embedded through the LLM client)
    pub async fn query_memory(&self, query: &str, k: usize) -> Vec<MemoryHit> {
        let Some(memory) = &self.memory else { return Vec::new() };
        let Some(llm) = &self.llm else { return Vec::new() };
        match llm.embed(query).await {
            Ok(embedding) => memory.query(&embedding, k),
            Err(e) => {
                warn!(skill = %self.skill_name, "query_memory embed failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Compile DSL into a plan
    pub fn plan_with_dsl(&self, dsl: &str) -> Result<Plan, PlanError> {
        let planner = self.planner.as_ref().ok_or(PlanError::NoLlm)?;
        planner.plan_from_dsl(dsl, self.session_id.as_deref())
    }

    /// Execute a plan after a policy check; denied or missing orchestrator
    /// yields `None`
    pub async fn execute_plan(&self, plan: &mut Plan) -> Option<RunSummary> {
        if let Some(policy) = &self.policy {
            let resource = serde_json::json!({
                "subsystem": "skill",
                "skill": self.skill_name,
                "plan_id": plan.id,
            });
            let decision = policy.allow_action(&self.skill_name, "low", "execute_plan", &resource);
            if !decision.allowed {
                warn!(skill = %self.skill_name, plan_id = %plan.id, reason = %decision.reason, "Plan execution denied");
                return None;
            }
        }

        let orchestrator = self.orchestrator.as_ref()?;
        Some(
            orchestrator
                .execute_plan(plan, Arc::new(StateTracker::new()), Arc::new(CancelToken::new()))
                .await,
        )
    }

    /// Read a runtime context value from the bound session
    pub fn runtime_get(&self, key: &str) -> Option<Value> {
        let session = self.session.as_ref()?;
        let session_id = self.session_id.as_deref()?;
        session.context_get(session_id, key)
    }

    /// Write a runtime context value into the bound session
    pub fn runtime_set(&self, key: &str, value: Value) {
        let (Some(session), Some(session_id)) = (&self.session, self.session_id.as_deref()) else {
            return;
        };
        if let Err(e) = session.context_set(session_id, key, value) {
            warn!(skill = %self.skill_name, key, "runtime_set failed: {}", e);
        }
    }

    /// Background-service admission from the load balancer
    pub fn service_permitted(&self, service_name: &str) -> bool {
        match &self.load {
            Some(load) => load.allow_service(service_name),
            None => true,
        }
    }
}
