//! Event bus - topic pub/sub with wildcard subscriptions
//!
//! Topics are dot-separated. A subscription is either exact (`plan.completed`),
//! a single-segment wildcard (`perception.*` matches `perception.transcript`
//! but not `perception.a.b`), or global (`*`). Handler dispatch is
//! non-blocking by default: each handler runs on its own task behind a
//! bounded permit pool, so a slow handler never stalls a publisher. Channel
//! subscriptions deliver inline in publish order, which is what queue-driven
//! consumers (autonomy engine, skill manager) rely on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eyre::{bail, Result};
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use super::types::Event;

/// Bound on concurrently running handler tasks
pub const DEFAULT_DISPATCH_WORKERS: usize = 8;

/// Token identifying one subscription, used to unsubscribe
pub type SubscriptionId = u64;

type Handler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
    /// Inline subscriptions are invoked at publish time (used for
    /// non-blocking channel sends, preserving publish order per subscriber)
    inline: bool,
}

/// Topic pub/sub bus
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<Subscription>>>,
    dispatch_permits: Arc<Semaphore>,
    dispatch_workers: usize,
    next_id: AtomicU64,
    shutdown: AtomicBool,
}

impl EventBus {
    pub fn new(dispatch_workers: usize) -> Self {
        debug!(dispatch_workers, "EventBus::new");
        Self {
            subscribers: Mutex::new(HashMap::new()),
            dispatch_permits: Arc::new(Semaphore::new(dispatch_workers)),
            dispatch_workers,
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Validate a subscription pattern: exact, `prefix.*`, or `*`
    fn validate_pattern(pattern: &str) -> Result<()> {
        if pattern.is_empty() {
            bail!("Empty subscription pattern");
        }
        if pattern == "*" {
            return Ok(());
        }
        let stars = pattern.matches('*').count();
        if stars == 0 {
            return Ok(());
        }
        if stars == 1 && pattern.ends_with(".*") && !pattern[..pattern.len() - 2].contains('*') {
            return Ok(());
        }
        bail!("Unsupported wildcard pattern: '{}' (only 'prefix.*' and '*' are allowed)", pattern)
    }

    /// Subscribe a handler to a topic pattern
    ///
    /// The handler runs on a pooled task per event; failures in one handler
    /// never affect others or the publisher.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.add_subscription(pattern, Arc::new(handler), false)
    }

    /// Subscribe with a bounded channel; events arrive in publish order
    ///
    /// When the channel is full the event is dropped for this subscriber
    /// with a warning (non-blocking delivery, matching publish semantics).
    pub fn subscribe_channel(
        &self,
        pattern: &str,
        capacity: usize,
    ) -> Result<(SubscriptionId, mpsc::Receiver<(String, Value)>)> {
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.add_subscription(
            pattern,
            Arc::new(move |topic: &str, payload: &Value| {
                if let Err(e) = tx.try_send((topic.to_string(), payload.clone())) {
                    warn!(topic, "EventBus: channel subscriber full, dropping event: {}", e);
                }
            }),
            true,
        )?;
        Ok((id, rx))
    }

    fn add_subscription(&self, pattern: &str, handler: Handler, inline: bool) -> Result<SubscriptionId> {
        Self::validate_pattern(pattern)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut subs = self.subscribers.lock().unwrap();
        subs.entry(pattern.to_string()).or_default().push(Subscription {
            id,
            handler,
            inline,
        });
        debug!(pattern, id, "EventBus: subscribed");
        Ok(id)
    }

    /// Remove a subscription by pattern and token
    pub fn unsubscribe(&self, pattern: &str, id: SubscriptionId) {
        let mut subs = self.subscribers.lock().unwrap();
        if let Some(list) = subs.get_mut(pattern) {
            list.retain(|s| s.id != id);
            if list.is_empty() {
                subs.remove(pattern);
            }
        }
        debug!(pattern, id, "EventBus: unsubscribed");
    }

    /// Patterns that match `topic`: exact, parent single-level wildcard, global
    fn matching_patterns(topic: &str) -> Vec<String> {
        let mut patterns = vec![topic.to_string()];
        if let Some(idx) = topic.rfind('.') {
            patterns.push(format!("{}.*", &topic[..idx]));
        }
        patterns.push("*".to_string());
        patterns
    }

    /// Publish an event payload on a topic
    ///
    /// `block = false` dispatches handlers asynchronously on the bounded
    /// pool; `block = true` invokes every handler inline before returning.
    pub fn publish(&self, topic: &str, payload: Value, block: bool) {
        if self.shutdown.load(Ordering::SeqCst) {
            warn!(topic, "EventBus shutting down, dropping event");
            return;
        }

        // Collect matching handlers under the lock, invoke outside it
        let mut matched: Vec<(SubscriptionId, Handler, bool)> = Vec::new();
        {
            let subs = self.subscribers.lock().unwrap();
            for pattern in Self::matching_patterns(topic) {
                if let Some(list) = subs.get(&pattern) {
                    for sub in list {
                        if !matched.iter().any(|(id, _, _)| *id == sub.id) {
                            matched.push((sub.id, sub.handler.clone(), sub.inline));
                        }
                    }
                }
            }
        }

        if matched.is_empty() {
            return;
        }
        debug!(topic, handlers = matched.len(), block, "EventBus: publishing");

        let payload = Arc::new(payload);
        for (_, handler, inline) in matched {
            if block || inline {
                handler(topic, &payload);
                continue;
            }
            let permits = self.dispatch_permits.clone();
            let topic = topic.to_string();
            let payload = payload.clone();
            tokio::spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                handler(&topic, &payload);
            });
        }
    }

    /// Publish a typed lifecycle event on its canonical topic
    pub fn emit(&self, event: &Event) {
        self.publish(event.event_type.topic(), event.as_value(), false);
    }

    /// Refuse new publishes and drain in-flight handler tasks
    pub async fn shutdown(&self, wait: bool, grace: Duration) {
        self.shutdown.store(true, Ordering::SeqCst);
        if !wait {
            return;
        }
        let drained = tokio::time::timeout(
            grace,
            self.dispatch_permits.acquire_many(self.dispatch_workers as u32),
        )
        .await;
        match drained {
            Ok(Ok(permits)) => drop(permits),
            _ => warn!("EventBus shutdown: handlers still running after grace period"),
        }
        debug!("EventBus shutdown complete");
    }

    /// Number of live subscriptions (all patterns)
    pub fn subscription_count(&self) -> usize {
        let subs = self.subscribers.lock().unwrap();
        subs.values().map(Vec::len).sum()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_DISPATCH_WORKERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counter_handler(counter: Arc<AtomicUsize>) -> impl Fn(&str, &Value) + Send + Sync {
        move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_exact_subscription_receives_once() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe("plan.completed", counter_handler(count.clone())).unwrap();

        bus.publish("plan.completed", json!({"plan_id": "p1"}), true);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wildcard_matches_one_level_only() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe("perception.*", counter_handler(count.clone())).unwrap();

        bus.publish("perception.transcript", json!({}), true);
        bus.publish("perception.mouse.move", json!({}), true);
        bus.publish("cognition.cycle", json!({}), true);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_global_wildcard_sees_everything() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe("*", counter_handler(count.clone())).unwrap();

        bus.publish("a", json!({}), true);
        bus.publish("a.b", json!({}), true);
        bus.publish("a.b.c", json!({}), true);

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_overlapping_subscriptions_deliver_exactly_once_each() {
        let bus = EventBus::default();
        let exact = Arc::new(AtomicUsize::new(0));
        let wild = Arc::new(AtomicUsize::new(0));
        let global = Arc::new(AtomicUsize::new(0));
        bus.subscribe("skill.proposal", counter_handler(exact.clone())).unwrap();
        bus.subscribe("skill.*", counter_handler(wild.clone())).unwrap();
        bus.subscribe("*", counter_handler(global.clone())).unwrap();

        bus.publish("skill.proposal", json!({}), true);

        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(wild.load(Ordering::SeqCst), 1);
        assert_eq!(global.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_multi_segment_wildcards_rejected() {
        let bus = EventBus::default();
        assert!(bus.subscribe("a.*.b", |_, _| {}).is_err());
        assert!(bus.subscribe("a.**", |_, _| {}).is_err());
        assert!(bus.subscribe("", |_, _| {}).is_err());
        assert!(bus.subscribe("a.*", |_, _| {}).is_ok());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe("t", counter_handler(count.clone())).unwrap();

        bus.publish("t", json!({}), true);
        bus.unsubscribe("t", id);
        bus.publish("t", json!({}), true);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_subscription_preserves_order() {
        let bus = EventBus::default();
        let (_id, mut rx) = bus.subscribe_channel("seq.*", 16).unwrap();

        for i in 0..5 {
            bus.publish("seq.tick", json!({"i": i}), false);
        }

        for i in 0..5 {
            let (topic, payload) = rx.recv().await.unwrap();
            assert_eq!(topic, "seq.tick");
            assert_eq!(payload["i"], json!(i));
        }
    }

    #[tokio::test]
    async fn test_channel_full_drops_not_blocks() {
        let bus = EventBus::default();
        let (_id, mut rx) = bus.subscribe_channel("x", 2).unwrap();

        for i in 0..10 {
            bus.publish("x", json!({"i": i}), false);
        }

        // First two made it, rest were dropped
        assert_eq!(rx.recv().await.unwrap().1["i"], json!(0));
        assert_eq!(rx.recv().await.unwrap().1["i"], json!(1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_async_dispatch_runs_handlers() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe("bg", counter_handler(count.clone())).unwrap();

        bus.publish("bg", json!({}), false);

        // Give the spawned handler a moment
        for _ in 0..50 {
            if count.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_publishes() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe("t", counter_handler(count.clone())).unwrap();

        bus.shutdown(true, Duration::from_millis(200)).await;
        bus.publish("t", json!({}), true);

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_emit_publishes_on_event_topic() {
        let bus = EventBus::default();
        let (_id, mut rx) = bus.subscribe_channel("node.started", 4).unwrap();

        let event = Event::new(crate::events::EventType::NodeStarted).with_node("n1");
        bus.emit(&event);

        let (topic, payload) = rx.recv().await.unwrap();
        assert_eq!(topic, "node.started");
        assert_eq!(payload["node_id"], json!("n1"));
        assert_eq!(payload["type"], json!("NodeStarted"));
    }
}
