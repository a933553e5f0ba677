//! Cognitive load balancer
//!
//! Maintains a smoothed load value in [0, 1] from a decayed sum of weighted
//! events: each recorded event contributes `weight * 2^(-age/spread)`,
//! normalized by a soft capacity of `spread * 4`. Two thresholds split
//! three regimes: below `warn` everything is admitted, between `warn` and
//! `high` proposals are filtered and service ticks deferred, at or above
//! `high` only low-risk high-confidence work survives and background
//! services skip probabilistically.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use rand::Rng;
use serde_json::Value;
use tracing::debug;

use crate::config::LoadConfig;
use crate::events::{now_secs, EventBus};

/// What kind of occurrence is being recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadEventKind {
    Proposal,
    Tick,
    Io,
}

struct History {
    events: Vec<(Instant, f64)>,
    load: f64,
    last_emitted: f64,
}

/// Smoothed load tracking with admission decisions
pub struct CognitiveLoadBalancer {
    config: LoadConfig,
    history: Mutex<History>,
    bus: Option<Arc<EventBus>>,
}

impl CognitiveLoadBalancer {
    pub fn new(config: LoadConfig, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            config,
            history: Mutex::new(History {
                events: Vec::new(),
                load: 0.0,
                last_emitted: 0.0,
            }),
            bus,
        }
    }

    fn weight_for(&self, kind: LoadEventKind) -> f64 {
        match kind {
            LoadEventKind::Proposal => self.config.proposal_weight,
            LoadEventKind::Tick => self.config.tick_weight,
            LoadEventKind::Io => self.config.io_weight,
        }
    }

    /// Record an occurrence and recompute the smoothed load
    pub fn record_event(&self, kind: LoadEventKind, weight: Option<f64>) -> f64 {
        let weight = weight.unwrap_or_else(|| self.weight_for(kind));
        let now = Instant::now();

        let mut history = self.history.lock().unwrap();
        history.events.push((now, weight));

        // Bound the window
        let window = self.config.window_secs * 2.0;
        history.events.retain(|(ts, _)| ts.elapsed().as_secs_f64() <= window);

        // Decayed sum, normalized by the soft capacity
        let total: f64 = history
            .events
            .iter()
            .map(|(ts, w)| w * 2f64.powf(-ts.elapsed().as_secs_f64() / self.config.spread))
            .sum();
        let new_load = (total / (self.config.spread * 4.0).max(1.0)).clamp(0.0, 1.0);

        let changed = (new_load - history.load).abs() > 0.01;
        let previous = history.load;
        history.load = new_load;
        let last_emitted = history.last_emitted;
        if changed {
            history.last_emitted = new_load;
        }
        drop(history);

        if changed {
            self.emit_load_events(new_load, previous.max(last_emitted));
        }
        new_load
    }

    fn emit_load_events(&self, load: f64, previous: f64) {
        let Some(bus) = &self.bus else { return };
        let payload = serde_json::json!({"ts": now_secs(), "load": load});
        bus.publish("cognition.load.changed", payload.clone(), false);
        if load >= self.config.high {
            bus.publish("cognition.load.high", payload, false);
        } else if load <= self.config.warn * 0.8 && previous >= self.config.warn {
            bus.publish("cognition.load.low", payload, false);
        }
    }

    pub fn get_load(&self) -> f64 {
        self.history.lock().unwrap().load
    }

    /// Should this proposal proceed to decisioning?
    ///
    /// The proposal shape is caller-defined JSON with optional `risk`,
    /// `confidence` and `priority` fields.
    pub fn allow_proposal(&self, proposal: &Value) -> bool {
        let load = self.record_event(LoadEventKind::Proposal, None);
        if load < self.config.warn {
            return true;
        }

        let risk = proposal
            .get("risk")
            .and_then(Value::as_str)
            .unwrap_or("low")
            .to_ascii_lowercase();
        let confidence = proposal.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
        let priority = proposal.get("priority").and_then(Value::as_i64).unwrap_or(50);

        let admitted = if load < self.config.high {
            // Moderate load: medium/low risk with decent confidence, or
            // high-priority work
            (matches!(risk.as_str(), "low" | "medium") && confidence >= 0.5) || priority >= 80
        } else {
            // Heavy load: only low-risk high-confidence or urgent work
            (risk == "low" && confidence >= 0.75) || priority >= 90
        };

        if !admitted {
            debug!(load, risk, confidence, priority, "LoadBalancer: proposal throttled");
            if let Some(bus) = &self.bus {
                bus.publish(
                    "cognition.proposal.throttled",
                    serde_json::json!({"ts": now_secs(), "load": load, "proposal": proposal}),
                    false,
                );
            }
        }
        admitted
    }

    /// Should this background service run its cycle now?
    pub fn allow_service(&self, service_name: &str) -> bool {
        let load = self.record_event(LoadEventKind::Tick, None);
        let sensitivity = match service_name {
            "memory_consolidator" => 0.7,
            "reflection_engine" => 0.65,
            "predictive_context" => 0.6,
            "temporal_scheduler" => 0.85,
            "skill_manager" => 0.5,
            _ => 0.6,
        };
        if load < sensitivity {
            return true;
        }

        // Probabilistic skip: probability proportional to the excess over
        // the service's sensitivity, so throttling never goes fully silent
        let keep_probability = (1.0 - (load - sensitivity) * 2.0).max(0.0);
        let keep = rand::rng().random_bool(keep_probability.clamp(0.0, 1.0));
        if !keep {
            self.record_event(LoadEventKind::Io, Some(0.8));
            debug!(service_name, load, "LoadBalancer: service cycle skipped");
        }
        keep
    }

    pub fn snapshot(&self) -> Value {
        let history = self.history.lock().unwrap();
        serde_json::json!({
            "ts": now_secs(),
            "load": history.load,
            "history_len": history.events.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn balancer() -> CognitiveLoadBalancer {
        CognitiveLoadBalancer::new(LoadConfig::default(), None)
    }

    fn saturate(balancer: &CognitiveLoadBalancer) {
        for _ in 0..200 {
            balancer.record_event(LoadEventKind::Proposal, Some(1.0));
        }
    }

    #[test]
    fn test_load_starts_at_zero_and_saturates_at_one() {
        let balancer = balancer();
        assert_eq!(balancer.get_load(), 0.0);
        saturate(&balancer);
        assert!(balancer.get_load() > 0.9);
        assert!(balancer.get_load() <= 1.0);
    }

    #[test]
    fn test_below_warn_admits_everything() {
        let balancer = balancer();
        assert!(balancer.allow_proposal(&json!({"risk": "high", "confidence": 0.0})));
    }

    #[test]
    fn test_heavy_load_filters_proposals() {
        let balancer = balancer();
        saturate(&balancer);

        // Low risk + high confidence passes
        assert!(balancer.allow_proposal(&json!({"risk": "low", "confidence": 0.9})));
        // High risk low confidence is throttled
        assert!(!balancer.allow_proposal(&json!({"risk": "high", "confidence": 0.2})));
        // Priority overrides
        assert!(balancer.allow_proposal(&json!({"risk": "high", "confidence": 0.1, "priority": 95})));
    }

    #[test]
    fn test_services_allowed_when_idle() {
        let balancer = balancer();
        assert!(balancer.allow_service("memory_consolidator"));
        assert!(balancer.allow_service("anything"));
    }

    #[test]
    fn test_services_skip_probabilistically_under_load() {
        let balancer = balancer();
        saturate(&balancer);

        // At load ~1.0, keep probability for a 0.5-sensitivity service is 0
        let mut ran = 0;
        for _ in 0..20 {
            saturate(&balancer);
            if balancer.allow_service("skill_manager") {
                ran += 1;
            }
        }
        assert_eq!(ran, 0);
    }

    #[tokio::test]
    async fn test_threshold_events_published() {
        let bus = Arc::new(EventBus::default());
        let (_id, mut rx) = bus.subscribe_channel("cognition.load.high", 16).unwrap();
        let balancer = CognitiveLoadBalancer::new(LoadConfig::default(), Some(bus));
        saturate(&balancer);

        let event = rx.recv().await.unwrap();
        assert!(event.1["load"].as_f64().unwrap() >= 0.8);
    }

    #[tokio::test]
    async fn test_throttled_event_published() {
        let bus = Arc::new(EventBus::default());
        let (_id, mut rx) = bus.subscribe_channel("cognition.proposal.throttled", 16).unwrap();
        let balancer = CognitiveLoadBalancer::new(LoadConfig::default(), Some(bus));
        saturate(&balancer);

        assert!(!balancer.allow_proposal(&json!({"risk": "high", "confidence": 0.1})));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.1["proposal"]["risk"], "high");
    }
}
