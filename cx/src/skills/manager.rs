//! Skill manager: lifecycle, event dispatch and tick scheduling
//!
//! The manager subscribes once to the whole bus and fans events out to
//! skills whose subscription globs match. Every callback runs as its own
//! task, so one skill failing or stalling never affects another. Cooldowns
//! are enforced in the context's `propose` path: ticks still run, visible
//! actions are suppressed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{ActionGate, Skill, SkillContext};
use crate::cognition::CognitiveLoadBalancer;
use crate::events::{EventBus, SubscriptionId};
use crate::exec::Orchestrator;
use crate::llm::LlmClient;
use crate::memory::VectorStore;
use crate::planner::Planner;
use crate::policy::PolicyEngine;
use crate::session::SessionManager;

const EVENT_QUEUE_CAPACITY: usize = 512;
const DRAIN_WAIT: Duration = Duration::from_millis(500);

struct SkillEntry {
    skill: Arc<dyn Skill>,
    gate: ActionGate,
    last_tick: Mutex<Option<Instant>>,
}

/// Shared wiring handed to every skill context
#[derive(Clone, Default)]
pub struct SkillDeps {
    pub bus: Option<Arc<EventBus>>,
    pub memory: Option<Arc<dyn VectorStore>>,
    pub llm: Option<Arc<dyn LlmClient>>,
    pub planner: Option<Arc<Planner>>,
    pub orchestrator: Option<Arc<Orchestrator>>,
    pub session: Option<Arc<SessionManager>>,
    pub policy: Option<Arc<PolicyEngine>>,
    pub load: Option<Arc<CognitiveLoadBalancer>>,
    pub default_session_id: Option<String>,
}

/// Owns skill instances and drives their callbacks
pub struct SkillManager {
    deps: SkillDeps,
    skills: Mutex<HashMap<String, Arc<SkillEntry>>>,
    subscription: Mutex<Option<SubscriptionId>>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

/// Match a topic against a subscription glob: exact, `prefix.*` (one extra
/// segment) or `*`
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" || pattern == topic {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        if let Some(rest) = topic.strip_prefix(prefix) {
            let rest = rest.strip_prefix('.');
            return matches!(rest, Some(tail) if !tail.is_empty() && !tail.contains('.'));
        }
    }
    false
}

impl SkillManager {
    pub fn new(deps: SkillDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            skills: Mutex::new(HashMap::new()),
            subscription: Mutex::new(None),
            runner: Mutex::new(None),
        })
    }

    /// Register a skill instance
    pub fn register(&self, skill: Arc<dyn Skill>) {
        let name = skill.name().to_string();
        let mut skills = self.skills.lock().unwrap();
        skills.insert(
            name.clone(),
            Arc::new(SkillEntry {
                skill,
                gate: ActionGate::default(),
                last_tick: Mutex::new(None),
            }),
        );
        info!(skill = %name, "SkillManager: loaded skill");
    }

    pub fn skill_names(&self) -> Vec<String> {
        let skills = self.skills.lock().unwrap();
        let mut names: Vec<String> = skills.keys().cloned().collect();
        names.sort();
        names
    }

    fn context_for(&self, entry: &SkillEntry) -> SkillContext {
        SkillContext::new(
            entry.skill.name().to_string(),
            self.deps.default_session_id.clone(),
            entry.skill.cooldown(),
            entry.gate.clone(),
            self.deps.bus.clone(),
            self.deps.memory.clone(),
            self.deps.llm.clone(),
            self.deps.planner.clone(),
            self.deps.orchestrator.clone(),
            self.deps.session.clone(),
            self.deps.policy.clone(),
            self.deps.load.clone(),
        )
    }

    /// Dispatch one event to every subscribed skill, each on its own task
    pub fn dispatch_event(&self, topic: &str, payload: &Value) {
        let entries: Vec<Arc<SkillEntry>> = {
            let skills = self.skills.lock().unwrap();
            skills
                .values()
                .filter(|entry| {
                    entry
                        .skill
                        .subscriptions()
                        .iter()
                        .any(|pattern| topic_matches(pattern, topic))
                })
                .cloned()
                .collect()
        };

        for entry in entries {
            let ctx = self.context_for(&entry);
            let payload = payload.clone();
            let topic = topic.to_string();
            tokio::spawn(async move {
                debug!(skill = %ctx.skill_name, topic, "SkillManager: dispatching event");
                entry.skill.on_event(&payload, &ctx).await;
            });
        }
    }

    /// Tick every skill whose interval has elapsed; each tick is isolated
    /// on its own task
    pub fn tick_all(&self) {
        let now = Instant::now();
        let due: Vec<Arc<SkillEntry>> = {
            let skills = self.skills.lock().unwrap();
            skills
                .values()
                .filter(|entry| {
                    let Some(interval) = entry.skill.tick_interval() else {
                        return false;
                    };
                    let mut last = entry.last_tick.lock().unwrap();
                    let due = match *last {
                        Some(at) => now.duration_since(at) >= interval,
                        None => true,
                    };
                    if due {
                        *last = Some(now);
                    }
                    due
                })
                .cloned()
                .collect()
        };

        for entry in due {
            let ctx = self.context_for(&entry);
            tokio::spawn(async move {
                entry.skill.tick(&ctx).await;
            });
        }
    }

    /// Start: `on_start` every skill, subscribe to the bus and run the
    /// drain/tick loop
    pub async fn start(self: &Arc<Self>) {
        let entries: Vec<Arc<SkillEntry>> = {
            let skills = self.skills.lock().unwrap();
            skills.values().cloned().collect()
        };
        for entry in &entries {
            entry.skill.on_start().await;
        }

        let Some(bus) = self.deps.bus.clone() else {
            info!("SkillManager: started without bus (tick-only)");
            return;
        };

        let (id, mut rx) = match bus.subscribe_channel("*", EVENT_QUEUE_CAPACITY) {
            Ok(sub) => sub,
            Err(e) => {
                tracing::warn!("SkillManager: bus subscription failed: {}", e);
                return;
            }
        };
        *self.subscription.lock().unwrap() = Some(id);

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match tokio::time::timeout(DRAIN_WAIT, rx.recv()).await {
                    Ok(Some((topic, payload))) => manager.dispatch_event(&topic, &payload),
                    Ok(None) => break,
                    Err(_) => manager.tick_all(),
                }
            }
            debug!("SkillManager: drain loop exiting");
        });
        *self.runner.lock().unwrap() = Some(handle);
        info!(skills = entries.len(), "SkillManager: started");
    }

    /// Stop: cancel the loop, unsubscribe, `on_stop` every skill
    pub async fn stop(&self) {
        if let Some(handle) = self.runner.lock().unwrap().take() {
            handle.abort();
        }
        if let (Some(bus), Some(id)) = (&self.deps.bus, self.subscription.lock().unwrap().take()) {
            bus.unsubscribe("*", id);
        }

        let entries: Vec<Arc<SkillEntry>> = {
            let skills = self.skills.lock().unwrap();
            skills.values().cloned().collect()
        };
        for entry in entries {
            entry.skill.on_stop().await;
        }
        info!("SkillManager: stopped");
    }
}
