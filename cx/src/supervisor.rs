//! Supervisor: watchdog with restart, backoff and circuit breaking
//!
//! Each watched service is a coroutine factory. The runner starts the
//! service under a timeout guard; timeouts, panics and errors count as
//! failures against the service's circuit. Failures back off exponentially
//! (`base^failures`, capped, with a deterministic jitter of at most 10%),
//! and after `max_retries` consecutive failures the service is marked dead
//! and `reliability.service.dead` is published.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::events::{now_secs, EventBus};

type ServiceFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
type ServiceFactory = Arc<dyn Fn() -> ServiceFuture + Send + Sync>;

/// Circuit state per watched service
#[derive(Debug, Clone, Default)]
pub struct CircuitState {
    pub failures: u32,
    pub last_failure_ts: f64,
    pub backoff_until: f64,
    pub dead: bool,
}

struct ServiceSpec {
    factory: ServiceFactory,
    restart: bool,
    timeout: Duration,
    max_retries: u32,
}

struct Inner {
    circuits: HashMap<String, CircuitState>,
    runners: HashMap<String, JoinHandle<()>>,
}

/// Watches long-running service loops
pub struct Supervisor {
    config: SupervisorConfig,
    inner: Mutex<Inner>,
    bus: Option<Arc<EventBus>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, bus: Option<Arc<EventBus>>) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(Inner {
                circuits: HashMap::new(),
                runners: HashMap::new(),
            }),
            bus,
        })
    }

    /// Deterministic backoff: `min(cap, base^failures)` plus a fractional
    /// jitter derived from the failure count, bounded by 10% of the backoff
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let backoff = self
            .config
            .backoff_base
            .powi(failures as i32)
            .min(self.config.max_backoff_secs);
        let jitter = 0.1 * backoff * (0.618 * failures as f64).fract();
        Duration::from_secs_f64(backoff + jitter)
    }

    fn publish(&self, topic: &str, payload: Value) {
        if let Some(bus) = &self.bus {
            bus.publish(topic, payload, false);
        }
    }

    /// Watch a service: start it in the background and keep it alive
    /// according to its restart policy
    pub fn watch<F, Fut>(self: &Arc<Self>, service_name: &str, factory: F, restart: bool)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.watch_with(
            service_name,
            Arc::new(move || Box::pin(factory()) as ServiceFuture),
            restart,
            None,
            None,
        );
    }

    /// `watch` with explicit timeout and retry budget
    pub fn watch_with(
        self: &Arc<Self>,
        service_name: &str,
        factory: ServiceFactory,
        restart: bool,
        timeout: Option<Duration>,
        max_retries: Option<u32>,
    ) {
        let spec = ServiceSpec {
            factory,
            restart,
            timeout: timeout.unwrap_or(Duration::from_millis(self.config.timeout_ms)),
            max_retries: max_retries.unwrap_or(self.config.max_retries),
        };

        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.runners.get(service_name) {
            if !existing.is_finished() {
                debug!(service = service_name, "Supervisor: already watching");
                return;
            }
        }
        inner.circuits.entry(service_name.to_string()).or_default();

        let supervisor = self.clone();
        let name = service_name.to_string();
        let handle = tokio::spawn(async move {
            supervisor.run_service(name, spec).await;
        });
        inner.runners.insert(service_name.to_string(), handle);
        info!(service = service_name, "Supervisor: watching service");
    }

    async fn run_service(self: Arc<Self>, name: String, spec: ServiceSpec) {
        let grace = Duration::from_millis(self.config.restart_grace_ms);

        loop {
            // Respect circuit state before each (re)start
            let wait = {
                let inner = self.inner.lock().unwrap();
                let circuit = inner.circuits.get(&name).cloned().unwrap_or_default();
                if circuit.dead {
                    return;
                }
                let now = now_secs();
                if circuit.backoff_until > now {
                    Some(Duration::from_secs_f64(circuit.backoff_until - now))
                } else {
                    None
                }
            };
            if let Some(wait) = wait {
                tokio::time::sleep(wait).await;
                continue;
            }

            let outcome = tokio::time::timeout(spec.timeout, (spec.factory)()).await;
            match outcome {
                Ok(Ok(())) => {
                    // Clean completion resets the circuit
                    {
                        let mut inner = self.inner.lock().unwrap();
                        if let Some(circuit) = inner.circuits.get_mut(&name) {
                            circuit.failures = 0;
                            circuit.backoff_until = 0.0;
                        }
                    }
                    if !spec.restart {
                        info!(service = %name, "Supervisor: service finished");
                        return;
                    }
                    tokio::time::sleep(grace).await;
                }
                Ok(Err(error)) => {
                    self.record_failure(&name, "exception", Some(&error), spec.max_retries);
                    if self.is_dead(&name) {
                        return;
                    }
                }
                Err(_) => {
                    warn!(service = %name, timeout = ?spec.timeout, "Supervisor: service timed out");
                    self.record_failure(&name, "timeout", None, spec.max_retries);
                    if self.is_dead(&name) {
                        return;
                    }
                }
            }
        }
    }

    fn record_failure(&self, name: &str, reason: &str, error: Option<&str>, max_retries: u32) {
        let (failures, dead, backoff) = {
            let mut inner = self.inner.lock().unwrap();
            let circuit = inner.circuits.entry(name.to_string()).or_default();
            circuit.failures += 1;
            circuit.last_failure_ts = now_secs();
            let failures = circuit.failures;
            let dead = failures >= max_retries;
            circuit.dead = dead;
            let backoff = self.backoff_for(failures);
            circuit.backoff_until = now_secs() + backoff.as_secs_f64();
            (failures, dead, backoff)
        };

        warn!(service = name, reason, failures, "Supervisor: service failed");
        self.publish(
            "reliability.service.failed",
            serde_json::json!({
                "service": name,
                "reason": reason,
                "error": error,
                "failures": failures,
            }),
        );

        if dead {
            warn!(service = name, failures, "Supervisor: service marked DEAD");
            self.publish(
                "reliability.service.dead",
                serde_json::json!({"service": name, "failures": failures}),
            );
        } else {
            debug!(service = name, ?backoff, "Supervisor: backing off");
        }
    }

    fn is_dead(&self, name: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.circuits.get(name).map(|c| c.dead).unwrap_or(false)
    }

    /// Stop watching a service and cancel its runner
    pub fn stop_service(&self, service_name: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(handle) = inner.runners.remove(service_name) {
            handle.abort();
        }
        inner.circuits.remove(service_name);
        info!(service = service_name, "Supervisor: stopped watching");
    }

    pub fn stop_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for (_, handle) in inner.runners.drain() {
            handle.abort();
        }
        inner.circuits.clear();
    }

    /// Compact health snapshot
    pub fn health(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        let services: serde_json::Map<String, Value> = inner
            .circuits
            .iter()
            .map(|(name, circuit)| {
                let running = inner.runners.get(name).map(|h| !h.is_finished()).unwrap_or(false);
                (
                    name.clone(),
                    serde_json::json!({
                        "running": running,
                        "failures": circuit.failures,
                        "last_failure": circuit.last_failure_ts,
                        "backoff_until": circuit.backoff_until,
                        "dead": circuit.dead,
                    }),
                )
            })
            .collect();
        serde_json::json!({
            "ts": now_secs(),
            "service_count": services.len(),
            "services": services,
        })
    }

    /// Any watched service currently marked dead?
    pub fn any_dead(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.circuits.values().any(|c| c.dead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            timeout_ms: 200,
            max_retries: 3,
            backoff_base: 1.1,
            max_backoff_secs: 0.05,
            restart_grace_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_failing_service_goes_dead_and_publishes() {
        let bus = Arc::new(EventBus::default());
        let (_id, mut rx) = bus.subscribe_channel("reliability.service.dead", 8).unwrap();
        let supervisor = Supervisor::new(fast_config(), Some(bus));

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        supervisor.watch(
            "flaky",
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("boom".to_string())
                }
            },
            true,
        );

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.1["service"], "flaky");
        assert_eq!(event.1["failures"], 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(supervisor.any_dead());
    }

    #[tokio::test]
    async fn test_clean_completion_restarts_when_requested() {
        let supervisor = Supervisor::new(fast_config(), None);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        supervisor.watch(
            "heartbeat",
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            true,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(runs.load(Ordering::SeqCst) >= 2);
        supervisor.stop_all();
    }

    #[tokio::test]
    async fn test_no_restart_service_runs_once() {
        let supervisor = Supervisor::new(fast_config(), None);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        supervisor.watch(
            "oneshot",
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            false,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hung_service_times_out_and_counts_failure() {
        let bus = Arc::new(EventBus::default());
        let (_id, mut rx) = bus.subscribe_channel("reliability.service.failed", 8).unwrap();
        let supervisor = Supervisor::new(fast_config(), Some(bus));

        supervisor.watch(
            "hung",
            || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
            true,
        );

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.1["reason"], "timeout");
        supervisor.stop_all();
    }

    #[test]
    fn test_backoff_is_deterministic_and_capped() {
        let config = SupervisorConfig {
            timeout_ms: 1000,
            max_retries: 5,
            backoff_base: 2.0,
            max_backoff_secs: 300.0,
            restart_grace_ms: 10,
        };
        // Construct directly to call the pure function
        let supervisor = Supervisor::new(config, None);

        let a = supervisor.backoff_for(3);
        let b = supervisor.backoff_for(3);
        assert_eq!(a, b);
        assert!(a >= Duration::from_secs_f64(8.0));
        assert!(a <= Duration::from_secs_f64(8.8)); // 10% jitter bound

        // Cap holds even for large failure counts
        let capped = supervisor.backoff_for(30);
        assert!(capped <= Duration::from_secs_f64(330.0));
    }

    #[tokio::test]
    async fn test_health_snapshot() {
        let supervisor = Supervisor::new(fast_config(), None);
        supervisor.watch("svc", || async { Ok(()) }, false);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let health = supervisor.health();
        assert_eq!(health["service_count"], 1);
        assert_eq!(health["services"]["svc"]["dead"], false);
        supervisor.stop_all();
    }
}
