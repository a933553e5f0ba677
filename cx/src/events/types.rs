//! Lifecycle event records with canonical serialization
//!
//! Events use a closed type enum and a deterministic canonical JSON form:
//! sorted keys, compact separators. The canonical form feeds SHA-256 to
//! build tamper-evident provenance chains.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::now_iso;

/// The closed set of lifecycle event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    PlanCreated,
    #[serde(rename = "DSLProduced")]
    DslProduced,
    #[serde(rename = "ASTParsed")]
    AstParsed,
    NodeStarted,
    NodeFinished,
    LoopIteration,
    RetryAttempt,
    DecisionTaken,
    TaskStarted,
    TaskFinished,
    PlanCompleted,
    ErrorOccurred,
}

impl EventType {
    /// The bus topic this event type publishes on
    pub fn topic(&self) -> &'static str {
        match self {
            EventType::PlanCreated => "plan.created",
            EventType::DslProduced => "dsl.produced",
            EventType::AstParsed => "ast.parsed",
            EventType::NodeStarted => "node.started",
            EventType::NodeFinished => "node.finished",
            EventType::LoopIteration => "loop.iteration",
            EventType::RetryAttempt => "retry.attempt",
            EventType::DecisionTaken => "decision.taken",
            EventType::TaskStarted => "task.started",
            EventType::TaskFinished => "task.finished",
            EventType::PlanCompleted => "plan.completed",
            EventType::ErrorOccurred => "error.occurred",
        }
    }

    /// Wire name, e.g. `NodeStarted`
    pub fn wire_name(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default()
    }
}

/// A lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub id: Option<String>,
    pub timestamp: String,
    pub session_id: Option<String>,
    pub plan_id: Option<String>,
    pub node_id: Option<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            id: None,
            timestamp: now_iso(),
            session_id: None,
            plan_id: None,
            node_id: None,
            payload: Map::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_plan(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        if let Value::Object(map) = payload {
            self.payload = map;
        }
        self
    }

    /// The event as a plain JSON object with the full field set
    pub fn as_value(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "type": self.event_type.wire_name(),
            "timestamp": self.timestamp,
            "session_id": self.session_id,
            "plan_id": self.plan_id,
            "node_id": self.node_id,
            "payload": Value::Object(self.payload.clone()),
            "metadata": Value::Object(self.metadata.clone()),
        })
    }

    /// Canonical JSON rendering: sorted keys, compact separators
    ///
    /// serde_json's default object map is ordered, so serializing the value
    /// form directly yields the canonical byte sequence.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(&self.as_value()).unwrap_or_default()
    }

    /// Build a provenance entry chaining off `previous_hash`
    pub fn to_provenance_entry(&self, previous_hash: Option<String>) -> ProvenanceEntry {
        let entry_canonical = self.canonical_json();
        let entry_hash = sha256_hex(entry_canonical.as_bytes());
        ProvenanceEntry {
            event: self.as_value(),
            previous_hash,
            entry_canonical,
            entry_hash,
        }
    }
}

/// One link in a provenance chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub event: Value,
    pub previous_hash: Option<String>,
    pub entry_canonical: String,
    pub entry_hash: String,
}

impl ProvenanceEntry {
    /// Recompute the hash over the recorded canonical form
    pub fn verify(&self) -> bool {
        sha256_hex(self.entry_canonical.as_bytes()) == self.entry_hash
    }
}

/// Hex-encoded SHA-256
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(EventType::PlanCreated.wire_name(), "PlanCreated");
        assert_eq!(EventType::DslProduced.wire_name(), "DSLProduced");
        assert_eq!(EventType::AstParsed.wire_name(), "ASTParsed");
        assert_eq!(EventType::ErrorOccurred.wire_name(), "ErrorOccurred");
    }

    #[test]
    fn test_topics() {
        assert_eq!(EventType::NodeStarted.topic(), "node.started");
        assert_eq!(EventType::PlanCompleted.topic(), "plan.completed");
    }

    #[test]
    fn test_canonical_json_sorted_and_compact() {
        let event = Event::new(EventType::NodeStarted)
            .with_plan("plan_1")
            .with_node("n1")
            .with_payload(serde_json::json!({"zeta": 1, "alpha": 2}));

        let canonical = event.canonical_json();
        // compact separators, no spaces
        assert!(!canonical.contains(": "));
        // payload keys sorted
        let alpha = canonical.find("alpha").unwrap();
        let zeta = canonical.find("zeta").unwrap();
        assert!(alpha < zeta);
    }

    #[test]
    fn test_provenance_entry_hash_verifies() {
        let event = Event::new(EventType::TaskFinished).with_node("n2");
        let entry = event.to_provenance_entry(None);

        assert!(entry.verify());
        assert_eq!(entry.entry_hash.len(), 64);
        assert!(entry.previous_hash.is_none());
    }

    #[test]
    fn test_provenance_chain_links() {
        let first = Event::new(EventType::TaskStarted).to_provenance_entry(None);
        let second = Event::new(EventType::TaskFinished).to_provenance_entry(Some(first.entry_hash.clone()));

        assert_eq!(second.previous_hash.as_deref(), Some(first.entry_hash.as_str()));
        assert!(second.verify());
    }

    #[test]
    fn test_hash_stable_across_computations() {
        let event = Event::new(EventType::DecisionTaken).with_payload(serde_json::json!({"label": "true"}));
        let a = event.to_provenance_entry(None);
        let b = event.to_provenance_entry(None);
        assert_eq!(a.entry_hash, b.entry_hash);
    }
}
