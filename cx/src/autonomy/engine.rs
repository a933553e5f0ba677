//! Autonomy engine: the event -> intent -> decision -> plan loop
//!
//! Subscribes to `perception.*`, drops stale and self-originated events,
//! and fans the rest out to a bounded worker set. Each event is classified,
//! run through the decision policy, and — when permitted — planned and
//! dispatched to the orchestrator. Every outcome is recorded as an episode
//! in the session's provenance log. Processing failures are logged and the
//! event dropped; nothing cascades.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::decision::{AutonomyMode, Decision, DecisionKind, DecisionPolicy};
use super::intent::{Intent, IntentClassifier};
use crate::config::AutonomyConfig;
use crate::events::{now_secs, EventBus, SubscriptionId};
use crate::exec::{CancelToken, Orchestrator, StateTracker};
use crate::llm::LlmClient;
use crate::planner::Planner;
use crate::session::SessionManager;
use crate::skills::SkillProposal;

/// The autonomy control loop
pub struct AutonomyEngine {
    config: AutonomyConfig,
    bus: Arc<EventBus>,
    planner: Arc<Planner>,
    orchestrator: Arc<Orchestrator>,
    session: Option<(Arc<SessionManager>, String)>,
    classifier: IntentClassifier,
    policy: DecisionPolicy,
    subscription: Mutex<Option<SubscriptionId>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    processed: AtomicU64,
}

impl AutonomyEngine {
    pub fn new(
        config: AutonomyConfig,
        bus: Arc<EventBus>,
        planner: Arc<Planner>,
        orchestrator: Arc<Orchestrator>,
        llm: Option<Arc<dyn LlmClient>>,
        session: Option<(Arc<SessionManager>, String)>,
    ) -> Arc<Self> {
        let classifier = IntentClassifier::new(
            llm,
            256,
            Duration::from_millis(config.intent_timeout_ms),
        );

        let mut policy = DecisionPolicy::new(
            AutonomyMode::parse(&config.mode),
            config.high_confidence,
            config.medium_confidence,
        );
        if let Some((manager, session_id)) = &session {
            let manager = manager.clone();
            let session_id = session_id.clone();
            policy = policy.with_mode_source(Arc::new(move || {
                manager
                    .context_get(&session_id, "autonomy_mode")
                    .and_then(|v| v.as_str().map(String::from))
            }));
        }

        Arc::new(Self {
            config,
            bus,
            planner,
            orchestrator,
            session,
            classifier,
            policy,
            subscription: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
            processed: AtomicU64::new(0),
        })
    }

    /// Subscribe to perception and start the worker set
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (id, rx) = match self
            .bus
            .subscribe_channel("perception.*", self.config.event_queue_size)
        {
            Ok(sub) => sub,
            Err(e) => {
                warn!("AutonomyEngine: subscription failed: {}", e);
                return;
            }
        };
        *self.subscription.lock().unwrap() = Some(id);

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let concurrency = self.config.event_processing_concurrency.max(1);
        let mut workers = self.workers.lock().unwrap();
        for worker_id in 0..concurrency {
            let engine = self.clone();
            let rx = rx.clone();
            workers.push(tokio::spawn(async move {
                debug!(worker_id, "AutonomyEngine worker started");
                loop {
                    let event = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some((_, payload)) = event else { break };
                    if !engine.running.load(Ordering::SeqCst) {
                        break;
                    }
                    engine.process_event(&payload).await;
                }
                debug!(worker_id, "AutonomyEngine worker stopped");
            }));
        }
        info!(workers = concurrency, "AutonomyEngine started");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(id) = self.subscription.lock().unwrap().take() {
            self.bus.unsubscribe("perception.*", id);
        }
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap();
            guard.drain(..).collect()
        };
        for worker in workers {
            worker.abort();
        }
        info!("AutonomyEngine stopped");
    }

    /// Health snapshot for the cognitive loop
    pub fn health(&self) -> Value {
        serde_json::json!({
            "running": self.running.load(Ordering::SeqCst),
            "workers": self.workers.lock().unwrap().len(),
            "processed": self.processed.load(Ordering::SeqCst),
        })
    }

    /// One pipeline pass for a single perception event
    pub async fn process_event(&self, event: &Value) {
        // Never react to our own output
        if event.get("source").and_then(Value::as_str) == Some("autonomy") {
            return;
        }

        // Stale events are noise by the time we see them
        let ts = event.get("ts").and_then(Value::as_f64).unwrap_or_else(now_secs);
        let age = now_secs() - ts;
        if age > self.config.max_event_age_secs {
            debug!(age, "AutonomyEngine: dropping stale event");
            return;
        }

        self.processed.fetch_add(1, Ordering::SeqCst);

        let intent = self.classifier.classify(event).await;
        let decision = self.policy.evaluate(&intent);
        debug!(intent = %intent.intent, verdict = ?decision.decision, "AutonomyEngine: decided");

        match decision.decision {
            DecisionKind::Ignore => {
                self.record_episode(event, &intent, &decision, serde_json::json!({"status": "ignored"}));
            }
            DecisionKind::Ask => {
                self.publish_ask(event, &intent, &decision);
                self.record_episode(event, &intent, &decision, serde_json::json!({"status": "ask"}));
            }
            DecisionKind::Do => {
                let outcome = self.handle_do(event, &intent).await;
                self.record_episode(event, &intent, &decision, outcome);
            }
        }
    }

    /// Evaluate a (possibly fused) skill proposal through the same policy
    pub async fn process_proposal(&self, proposal: SkillProposal) {
        let decision = self.policy.decide_for_proposal(&proposal);
        let event = serde_json::json!({
            "type": "skill.proposal",
            "proposal": serde_json::to_value(&proposal).unwrap_or_default(),
        });
        let intent = Intent {
            intent: proposal.intent.clone(),
            confidence: proposal.confidence,
            params: proposal.params.clone(),
        };

        match decision.decision {
            DecisionKind::Ignore => {
                self.record_episode(&event, &intent, &decision, serde_json::json!({"status": "ignored"}));
            }
            DecisionKind::Ask => {
                self.publish_ask(&event, &intent, &decision);
                self.record_episode(&event, &intent, &decision, serde_json::json!({"status": "ask"}));
            }
            DecisionKind::Do => {
                let outcome = self.handle_do(&event, &intent).await;
                self.record_episode(&event, &intent, &decision, outcome);
            }
        }
    }

    fn session_id(&self) -> String {
        self.session
            .as_ref()
            .map(|(_, id)| id.clone())
            .unwrap_or_else(|| "default".to_string())
    }

    fn context_snapshot(&self) -> Map<String, Value> {
        match &self.session {
            Some((manager, session_id)) => manager
                .peek(session_id)
                .map(|s| s.context)
                .unwrap_or_default(),
            None => Map::new(),
        }
    }

    fn build_planning_prompt(&self, event: &Value, intent: &Intent) -> String {
        format!(
            "Produce a plan for the following situation.\n\nIntent: {} (confidence {:.2})\n\
             Params: {}\nEvent: {}",
            intent.intent,
            intent.confidence,
            Value::Object(intent.params.clone()),
            event,
        )
    }

    /// Plan and dispatch; each stage is wrapped in its own timeout
    async fn handle_do(&self, event: &Value, intent: &Intent) -> Value {
        let instruction = self.build_planning_prompt(event, intent);
        let context = self.context_snapshot();
        let session_id = self.session_id();

        let planner_timeout = Duration::from_millis(self.config.planner_timeout_ms);
        let planned = tokio::time::timeout(
            planner_timeout,
            self.planner.plan(&session_id, &instruction, &context),
        )
        .await;

        let mut plan = match planned {
            Ok(Ok(plan)) => plan,
            Ok(Err(e)) => {
                warn!("AutonomyEngine: planner failed: {}", e);
                return serde_json::json!({"status": "no_plan", "error": e.to_string()});
            }
            Err(_) => {
                warn!("AutonomyEngine: planner timed out");
                return serde_json::json!({"status": "planner_timeout"});
            }
        };

        let exec_timeout = Duration::from_millis(self.config.execution_timeout_ms);
        let dispatched = tokio::time::timeout(
            exec_timeout,
            self.orchestrator
                .execute_plan(&mut plan, Arc::new(StateTracker::new()), Arc::new(CancelToken::new())),
        )
        .await;

        match dispatched {
            Ok(summary) => serde_json::json!({
                "status": "dispatched",
                "plan_id": summary.plan_id,
                "plan_status": summary.status.as_str(),
            }),
            Err(_) => {
                warn!("AutonomyEngine: orchestrator timed out");
                serde_json::json!({"status": "orch_timeout", "plan_id": plan.id})
            }
        }
    }

    fn publish_ask(&self, event: &Value, intent: &Intent, decision: &Decision) {
        self.bus.publish(
            "autonomy.ask_user_confirmation",
            serde_json::json!({
                "source": "autonomy",
                "type": "ask_user_confirmation",
                "event": event,
                "intent": serde_json::to_value(intent).unwrap_or_default(),
                "decision": serde_json::to_value(decision).unwrap_or_default(),
                "ts": now_secs(),
            }),
            false,
        );
    }

    fn record_episode(&self, event: &Value, intent: &Intent, decision: &Decision, outcome: Value) {
        let Some((manager, session_id)) = &self.session else {
            debug!("Episode: {} -> {:?}", intent.intent, outcome);
            return;
        };
        let entry = serde_json::json!({
            "kind": "episode",
            "event": event,
            "intent": serde_json::to_value(intent).unwrap_or_default(),
            "decision": serde_json::to_value(decision).unwrap_or_default(),
            "outcome": outcome,
        });
        if let Err(e) = manager.append_provenance(session_id, entry) {
            warn!("AutonomyEngine: episode recording failed: {}", e);
        }
    }
}
