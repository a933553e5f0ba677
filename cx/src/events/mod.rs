//! Event vocabulary and pub/sub bus
//!
//! Every observable action in cortexd flows through here: typed lifecycle
//! events from the orchestrator and planner, free-form perception and
//! cognition payloads, and the topic bus that fans them out.

mod bus;
mod types;

pub use bus::{EventBus, SubscriptionId, DEFAULT_DISPATCH_WORKERS};
pub use types::{sha256_hex, Event, EventType, ProvenanceEntry};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Current UTC timestamp in ISO-8601 with a trailing Z
pub fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}
