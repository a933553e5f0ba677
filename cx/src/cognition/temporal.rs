//! Temporal scheduler: priority-queued timed job firing
//!
//! Jobs sit in a min-heap keyed by next-run time. Due jobs fire through the
//! event bus (topic from `payload.type`) or, for payloads carrying an
//! `action`, through the worker pool. Recurring jobs re-insert at
//! `last_run + recurrence`; one-off jobs are removed after firing. The job
//! table persists into the session store so schedules survive restarts.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::events::{now_secs, EventBus};
use crate::exec::{ActionRequest, WorkerPool};
use crate::plan::Action;
use crate::providers::ExecContext;
use crate::session::SessionManager;

/// A scheduled job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub start_ts: f64,
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<f64>,
    #[serde(default)]
    pub cancelled: bool,
}

impl ScheduledJob {
    /// Next firing time; `None` once a one-off job has run
    pub fn next_run(&self) -> Option<f64> {
        match self.last_run {
            None => Some(self.start_ts),
            Some(last) => self.recurrence.map(|r| last + r),
        }
    }
}

fn new_job_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("job_{}", &hex[..8])
}

struct Inner {
    jobs: HashMap<String, ScheduledJob>,
    // (next_run_millis, job_id) min-heap
    heap: BinaryHeap<Reverse<(u64, String)>>,
}

/// Min-heap driven job scheduler
pub struct TemporalScheduler {
    inner: Mutex<Inner>,
    config: SchedulerConfig,
    bus: Option<Arc<EventBus>>,
    pool: Option<Arc<WorkerPool>>,
    session: Option<(Arc<SessionManager>, String)>,
    notify: Notify,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TemporalScheduler {
    pub fn new(
        config: SchedulerConfig,
        bus: Option<Arc<EventBus>>,
        pool: Option<Arc<WorkerPool>>,
        session: Option<(Arc<SessionManager>, String)>,
    ) -> Self {
        let scheduler = Self {
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                heap: BinaryHeap::new(),
            }),
            config,
            bus,
            pool,
            session,
            notify: Notify::new(),
            handle: Mutex::new(None),
        };
        scheduler.load_persisted();
        scheduler
    }

    fn load_persisted(&self) {
        let Some((session, session_id)) = &self.session else { return };
        let Some(raw) = session.context_get(session_id, &self.config.persistence_key) else {
            return;
        };
        let Ok(jobs) = serde_json::from_value::<HashMap<String, ScheduledJob>>(raw) else {
            warn!("TemporalScheduler: persisted jobs unreadable, starting empty");
            return;
        };

        let mut inner = self.inner.lock().unwrap();
        for (id, job) in jobs {
            if let Some(next) = job.next_run() {
                if !job.cancelled {
                    inner.heap.push(Reverse(((next * 1000.0) as u64, id.clone())));
                }
            }
            inner.jobs.insert(id, job);
        }
        info!(count = inner.jobs.len(), "TemporalScheduler: jobs restored");
    }

    fn persist(&self) {
        let Some((session, session_id)) = &self.session else { return };
        let jobs: HashMap<String, ScheduledJob> = {
            let inner = self.inner.lock().unwrap();
            inner.jobs.clone()
        };
        let value = serde_json::to_value(jobs).unwrap_or(Value::Null);
        if let Err(e) = session.context_set(session_id, &self.config.persistence_key, value) {
            warn!("TemporalScheduler: failed to persist jobs: {}", e);
        }
    }

    /// Schedule a job; returns its id
    pub fn schedule(
        &self,
        start_ts: f64,
        payload: Map<String, Value>,
        recurrence: Option<f64>,
        job_id: Option<String>,
    ) -> String {
        let id = job_id.unwrap_or_else(new_job_id);
        let job = ScheduledJob {
            id: id.clone(),
            start_ts,
            payload,
            recurrence,
            last_run: None,
            cancelled: false,
        };

        let mut inner = self.inner.lock().unwrap();
        inner.heap.push(Reverse(((start_ts * 1000.0) as u64, id.clone())));
        inner.jobs.insert(id.clone(), job);
        drop(inner);

        self.persist();
        self.notify.notify_waiters();
        info!(job_id = %id, start_ts, ?recurrence, "Scheduled job");
        id
    }

    /// Cancel a job; it stays in the heap but is skipped when popped
    pub fn cancel(&self, job_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return false;
        };
        job.cancelled = true;
        drop(inner);

        self.persist();
        info!(job_id, "Cancelled job");
        true
    }

    pub fn list(&self) -> Vec<ScheduledJob> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<ScheduledJob> = inner.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    /// Pop and fire everything due; returns the fired job ids
    pub async fn run_due(&self) -> Vec<String> {
        let now = now_secs();
        let mut fired = Vec::new();

        loop {
            let due_job = {
                let mut inner = self.inner.lock().unwrap();
                let Some(Reverse((ts_millis, _))) = inner.heap.peek().cloned() else { break };
                if ts_millis as f64 / 1000.0 > now {
                    break;
                }
                let Reverse((_, job_id)) = inner.heap.pop().unwrap();
                let Some(job) = inner.jobs.get_mut(&job_id) else { continue };
                if job.cancelled {
                    inner.jobs.remove(&job_id);
                    continue;
                }
                job.last_run = Some(now_secs());
                let snapshot = job.clone();
                if job.recurrence.is_some() {
                    let next = job.next_run().unwrap_or(f64::MAX);
                    inner.heap.push(Reverse(((next * 1000.0) as u64, job_id.clone())));
                } else {
                    inner.jobs.remove(&job_id);
                }
                snapshot
            };

            self.trigger(&due_job).await;
            fired.push(due_job.id.clone());
        }

        if !fired.is_empty() {
            self.persist();
        }
        fired
    }

    async fn trigger(&self, job: &ScheduledJob) {
        debug!(job_id = %job.id, "TemporalScheduler: firing");

        // Payloads carrying an action go to the worker pool; everything
        // else publishes on the bus under payload.type
        if let Some(action_value) = job.payload.get("action") {
            if let (Some(pool), Ok(action)) = (
                &self.pool,
                serde_json::from_value::<Action>(action_value.clone()),
            ) {
                let request = ActionRequest {
                    action,
                    task_name: format!("scheduled:{}", job.id),
                    task_args: Map::new(),
                    context: ExecContext::default(),
                };
                let result = pool.run(request).await;
                if !result.is_ok() {
                    warn!(job_id = %job.id, "Scheduled action failed: {:?}", result.error);
                }
                return;
            }
        }

        if let Some(bus) = &self.bus {
            let topic = job
                .payload
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("scheduler.trigger")
                .to_string();
            bus.publish(&topic, Value::Object(job.payload.clone()), false);
        }
    }

    /// Run the scheduler loop until stopped; sleeps until the next due
    /// time, bounded for responsiveness
    pub fn start(self: &Arc<Self>) {
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                scheduler.run_due().await;

                let sleep_for = {
                    let inner = scheduler.inner.lock().unwrap();
                    match inner.heap.peek() {
                        Some(Reverse((ts_millis, _))) => {
                            let until = (*ts_millis as f64 / 1000.0 - now_secs()).max(0.0);
                            Duration::from_secs_f64(until.min(scheduler.config.max_sleep_ms as f64 / 1000.0))
                        }
                        None => Duration::from_millis(scheduler.config.max_sleep_ms),
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = scheduler.notify.notified() => {}
                }
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessionstore::{MemoryStorageAdapter, StorageAdapter};

    fn scheduler(bus: Option<Arc<EventBus>>) -> TemporalScheduler {
        TemporalScheduler::new(SchedulerConfig::default(), bus, None, None)
    }

    fn payload(topic: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("type".to_string(), topic.into());
        map
    }

    #[tokio::test]
    async fn test_due_job_fires_on_bus() {
        let bus = Arc::new(EventBus::default());
        let (_id, mut rx) = bus.subscribe_channel("jobs.backup", 8).unwrap();
        let scheduler = scheduler(Some(bus));

        scheduler.schedule(now_secs() - 1.0, payload("jobs.backup"), None, None);
        let fired = scheduler.run_due().await;
        assert_eq!(fired.len(), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.0, "jobs.backup");

        // One-off job is gone after firing
        assert!(scheduler.list().is_empty());
    }

    #[tokio::test]
    async fn test_future_job_does_not_fire() {
        let scheduler = scheduler(None);
        scheduler.schedule(now_secs() + 60.0, payload("later"), None, None);
        assert!(scheduler.run_due().await.is_empty());
        assert_eq!(scheduler.list().len(), 1);
    }

    #[tokio::test]
    async fn test_recurring_job_reinserts() {
        let scheduler = scheduler(None);
        let id = scheduler.schedule(now_secs() - 1.0, payload("tick"), Some(3600.0), None);

        let fired = scheduler.run_due().await;
        assert_eq!(fired, vec![id.clone()]);

        let jobs = scheduler.list();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].last_run.is_some());
        assert!(jobs[0].next_run().unwrap() > now_secs());

        // Not due again yet
        assert!(scheduler.run_due().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_job_skipped() {
        let scheduler = scheduler(None);
        let id = scheduler.schedule(now_secs() - 1.0, payload("x"), None, None);
        assert!(scheduler.cancel(&id));
        assert!(scheduler.run_due().await.is_empty());
        assert!(!scheduler.cancel("ghost"));
    }

    #[tokio::test]
    async fn test_jobs_survive_restart_via_session_store() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryStorageAdapter::new());
        let config = crate::config::SessionConfig {
            db_path: String::new(),
            default_ttl_secs: 3600.0,
            write_queue_size: 16,
            sweeper_interval_ms: 60_000,
        };
        let session = SessionManager::start(adapter, &config).unwrap();
        session.create(Some("default".to_string()), None);

        let start_ts = now_secs() + 120.0;
        {
            let scheduler = TemporalScheduler::new(
                SchedulerConfig::default(),
                None,
                None,
                Some((session.clone(), "default".to_string())),
            );
            scheduler.schedule(start_ts, payload("persisted"), Some(60.0), Some("job_keep".to_string()));
        }

        let restored = TemporalScheduler::new(
            SchedulerConfig::default(),
            None,
            None,
            Some((session, "default".to_string())),
        );
        let jobs = restored.list();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "job_keep");
        assert_eq!(jobs[0].start_ts, start_ts);
        assert_eq!(jobs[0].recurrence, Some(60.0));
    }

    #[tokio::test]
    async fn test_multiple_due_jobs_fire_in_time_order() {
        let bus = Arc::new(EventBus::default());
        let (_id, mut rx) = bus.subscribe_channel("seq.*", 8).unwrap();
        let scheduler = scheduler(Some(bus));

        scheduler.schedule(now_secs() - 1.0, payload("seq.second"), None, None);
        scheduler.schedule(now_secs() - 2.0, payload("seq.first"), None, None);

        let fired = scheduler.run_due().await;
        assert_eq!(fired.len(), 2);
        assert_eq!(rx.recv().await.unwrap().0, "seq.first");
        assert_eq!(rx.recv().await.unwrap().0, "seq.second");
    }
}
