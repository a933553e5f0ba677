//! Cognitive loop: the runtime heartbeat
//!
//! Ticks at an adaptive interval and sequences the cognition layer in a
//! fixed order: supervisor health, perception, skills, fusion, prediction,
//! autonomy, reflection, consolidation, then a `cognition.cycle` event.
//! The load balancer gates each optional stage, and the interval widens
//! under load or when a supervised service has died.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::load::CognitiveLoadBalancer;
use super::reasoner::CrossSkillReasoner;
use crate::autonomy::AutonomyEngine;
use crate::events::{now_secs, EventBus};
use crate::skills::SkillManager;
use crate::supervisor::Supervisor;

/// Optional stage hook (perception tick, prediction, reflection, ...)
pub type StageHook = Arc<dyn Fn() + Send + Sync>;

/// Heartbeat cadence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    pub base_interval_secs: f64,
    pub min_interval_secs: f64,
    pub max_interval_secs: f64,
    /// Reflection runs every Nth cycle
    pub reflection_every: u64,
    /// Memory consolidation runs every Mth cycle
    pub memory_every: u64,
    /// Predictive context runs every Kth cycle
    pub predict_every: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: 1.0,
            min_interval_secs: 0.3,
            max_interval_secs: 5.0,
            reflection_every: 90,
            memory_every: 60,
            predict_every: 2,
        }
    }
}

/// The heartbeat ticker
pub struct CognitiveLoop {
    config: CycleConfig,
    bus: Option<Arc<EventBus>>,
    load: Option<Arc<CognitiveLoadBalancer>>,
    supervisor: Option<Arc<Supervisor>>,
    skills: Option<Arc<SkillManager>>,
    reasoner: Option<Arc<CrossSkillReasoner>>,
    autonomy: Option<Arc<AutonomyEngine>>,
    perception_hook: Option<StageHook>,
    predictive_hook: Option<StageHook>,
    reflection_hook: Option<StageHook>,
    consolidation_hook: Option<StageHook>,
    cycle_count: AtomicU64,
    interval: Mutex<f64>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CognitiveLoop {
    pub fn new(config: CycleConfig) -> Self {
        let interval = config.base_interval_secs;
        Self {
            config,
            bus: None,
            load: None,
            supervisor: None,
            skills: None,
            reasoner: None,
            autonomy: None,
            perception_hook: None,
            predictive_hook: None,
            reflection_hook: None,
            consolidation_hook: None,
            cycle_count: AtomicU64::new(0),
            interval: Mutex::new(interval),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_load(mut self, load: Arc<CognitiveLoadBalancer>) -> Self {
        self.load = Some(load);
        self
    }

    pub fn with_supervisor(mut self, supervisor: Arc<Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn with_skills(mut self, skills: Arc<SkillManager>) -> Self {
        self.skills = Some(skills);
        self
    }

    pub fn with_reasoner(mut self, reasoner: Arc<CrossSkillReasoner>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    pub fn with_autonomy(mut self, autonomy: Arc<AutonomyEngine>) -> Self {
        self.autonomy = Some(autonomy);
        self
    }

    pub fn with_perception_hook(mut self, hook: StageHook) -> Self {
        self.perception_hook = Some(hook);
        self
    }

    pub fn with_predictive_hook(mut self, hook: StageHook) -> Self {
        self.predictive_hook = Some(hook);
        self
    }

    pub fn with_reflection_hook(mut self, hook: StageHook) -> Self {
        self.reflection_hook = Some(hook);
        self
    }

    pub fn with_consolidation_hook(mut self, hook: StageHook) -> Self {
        self.consolidation_hook = Some(hook);
        self
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count.load(Ordering::SeqCst)
    }

    pub fn current_interval(&self) -> f64 {
        *self.interval.lock().unwrap()
    }

    fn permitted(&self, service: &str) -> bool {
        match &self.load {
            Some(load) => load.allow_service(service),
            None => true,
        }
    }

    /// One heartbeat; returns the interval to the next tick
    pub async fn run_cycle(&self) -> f64 {
        let cycle = self.cycle_count.fetch_add(1, Ordering::SeqCst) + 1;
        let mut interval = *self.interval.lock().unwrap();

        // 1. Supervisor health: a dead service slows the heartbeat
        if let Some(supervisor) = &self.supervisor {
            if supervisor.any_dead() {
                interval = (interval + 1.0).min(self.config.max_interval_secs);
            }
        }

        // 2. Perception tick
        if let Some(hook) = &self.perception_hook {
            if self.permitted("perception") {
                hook();
            }
        }

        // 3. Skill ticks
        if let Some(skills) = &self.skills {
            if self.permitted("skill_manager") {
                skills.tick_all();
            }
        }

        // 4. Cross-skill fusion window maintenance (every cycle)
        if let Some(reasoner) = &self.reasoner {
            reasoner.sweep();
        }

        // 5. Predictive context
        if cycle % self.config.predict_every.max(1) == 0 {
            if let Some(hook) = &self.predictive_hook {
                if self.permitted("predictive_context") {
                    hook();
                }
            }
        }

        // 6. Autonomy heartbeat (the engine's workers run continuously;
        //    this keeps its health in the cycle record)
        let autonomy_health = self.autonomy.as_ref().map(|a| a.health());

        // 7. Reflection
        if cycle % self.config.reflection_every.max(1) == 0 {
            if let Some(hook) = &self.reflection_hook {
                if self.permitted("reflection_engine") {
                    hook();
                }
            }
        }

        // 8. Memory consolidation
        if cycle % self.config.memory_every.max(1) == 0 {
            if let Some(hook) = &self.consolidation_hook {
                if self.permitted("memory_consolidator") {
                    hook();
                }
            }
        }

        // 9. Cycle event
        let load = self.load.as_ref().map(|l| l.get_load());
        if let Some(bus) = &self.bus {
            bus.publish(
                "cognition.cycle",
                serde_json::json!({
                    "ts": now_secs(),
                    "cycle": cycle,
                    "interval": interval,
                    "load": load,
                    "autonomy": autonomy_health,
                }),
                false,
            );
        }

        // 10. Adaptive pacing
        if let Some(load) = load {
            if load > 0.8 {
                interval = (interval + 0.3).min(self.config.max_interval_secs);
            } else if load < 0.3 {
                interval = (interval - 0.2).max(self.config.min_interval_secs);
            }
        }
        *self.interval.lock().unwrap() = interval;
        debug!(cycle, interval, "CognitiveLoop: cycle complete");
        interval
    }

    /// Run the heartbeat until stopped
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let cycle_loop = self.clone();
        let handle = tokio::spawn(async move {
            info!("CognitiveLoop started");
            while cycle_loop.running.load(Ordering::SeqCst) {
                let interval = cycle_loop.run_cycle().await;
                tokio::time::sleep(Duration::from_secs_f64(interval.max(0.05))).await;
            }
            info!("CognitiveLoop stopped");
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}
