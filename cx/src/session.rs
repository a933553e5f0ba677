//! Session manager: in-memory sessions with write-behind persistence
//!
//! Sessions live in memory and are loaded from the storage adapter at
//! startup. Every mutation bumps the version and enqueues a snapshot on the
//! bounded write queue; a single writer task drains it, so writes for one
//! session persist in order. A sweeper task evicts sessions past their TTL
//! (fixed or sliding).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sessionstore::{Session, StorageAdapter, StoreError, META_LAST_TOUCH};

use crate::config::SessionConfig;
use crate::events::now_secs;

/// Session layer failures
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Write-behind session manager
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    adapter: Arc<dyn StorageAdapter>,
    write_tx: Mutex<Option<mpsc::Sender<Session>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    default_ttl: f64,
}

impl SessionManager {
    /// Initialize the adapter, load all persisted sessions and start the
    /// writer and sweeper tasks
    pub fn start(adapter: Arc<dyn StorageAdapter>, config: &SessionConfig) -> Result<Arc<Self>, SessionError> {
        adapter.init()?;

        let mut sessions = HashMap::new();
        for session in adapter.export_all()? {
            sessions.insert(session.id.clone(), session);
        }
        info!(count = sessions.len(), "SessionManager: sessions loaded");

        let (write_tx, mut write_rx) = mpsc::channel::<Session>(config.write_queue_size.max(1));

        let manager = Arc::new(Self {
            sessions: Mutex::new(sessions),
            adapter: adapter.clone(),
            write_tx: Mutex::new(Some(write_tx)),
            writer: Mutex::new(None),
            sweeper: Mutex::new(None),
            default_ttl: config.default_ttl_secs,
        });

        // Writer: single consumer drains the queue in order
        let writer_adapter = adapter.clone();
        let writer = tokio::spawn(async move {
            while let Some(session) = write_rx.recv().await {
                let adapter = writer_adapter.clone();
                let result = tokio::task::spawn_blocking(move || adapter.save_session(&session)).await;
                match result {
                    Ok(Err(e)) => warn!("SessionManager: writer failed saving: {}", e),
                    Err(e) => warn!("SessionManager: writer task error: {}", e),
                    _ => {}
                }
            }
            debug!("SessionManager: writer exiting");
        });
        *manager.writer.lock().unwrap() = Some(writer);

        // Sweeper: TTL eviction
        let sweeper_manager = Arc::downgrade(&manager);
        let sweeper_interval = Duration::from_millis(config.sweeper_interval_ms.max(10));
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(manager) = sweeper_manager.upgrade() else { break };
                manager.sweep();
            }
            debug!("SessionManager: sweeper exiting");
        });
        *manager.sweeper.lock().unwrap() = Some(sweeper);

        Ok(manager)
    }

    /// Evict every expired session
    pub fn sweep(&self) {
        let now = now_secs();
        let expired: Vec<String> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .values()
                .filter(|s| s.is_expired(now, self.default_ttl))
                .map(|s| s.id.clone())
                .collect()
        };
        for session_id in expired {
            info!(session_id = %session_id, "Session expired");
            self.delete(&session_id);
        }
    }

    fn enqueue_save(&self, session: Session) {
        let tx = self.write_tx.lock().unwrap();
        if let Some(tx) = tx.as_ref() {
            if let Err(e) = tx.try_send(session) {
                warn!("SessionManager: write queue full, dropping save: {}", e);
            }
        }
    }

    /// Create a session; metadata watermarks are attached automatically
    pub fn create(&self, session_id: Option<String>, initial_metadata: Option<Map<String, Value>>) -> Session {
        let mut session = Session::new(session_id, self.default_ttl);
        if let Some(metadata) = initial_metadata {
            for (key, value) in metadata {
                session.metadata.insert(key, value);
            }
        }

        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(session.id.clone(), session.clone());
        drop(sessions);

        debug!(session_id = %session.id, "Session created");
        self.enqueue_save(session.clone());
        session
    }

    /// Fetch a session, refreshing its last-touch watermark
    pub fn get(&self, session_id: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(session_id)?;
        session.touch();
        let snapshot = session.clone();
        drop(sessions);

        self.enqueue_save(snapshot.clone());
        Some(snapshot)
    }

    /// Peek without touching (no watermark refresh, no persistence)
    pub fn peek(&self, session_id: &str) -> Option<Session> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(session_id).cloned()
    }

    /// Merge metadata/context updates; bumps the version
    pub fn update(
        &self,
        session_id: &str,
        metadata: Option<Map<String, Value>>,
        context: Option<Map<String, Value>>,
    ) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;

        if let Some(metadata) = metadata {
            for (key, value) in metadata {
                session.metadata.insert(key, value);
            }
        }
        if let Some(context) = context {
            for (key, value) in context {
                session.context.insert(key, value);
            }
        }
        session.version += 1;
        session.metadata.insert(META_LAST_TOUCH.to_string(), now_secs().into());
        let snapshot = session.clone();
        drop(sessions);

        self.enqueue_save(snapshot.clone());
        Ok(snapshot)
    }

    pub fn delete(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.remove(session_id);
        drop(sessions);

        let adapter = self.adapter.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = adapter.delete_session(&session_id) {
                warn!(session_id = %session_id, "SessionManager: delete failed: {}", e);
            }
        });
    }

    /// Append a provenance entry; a trace id and timestamp are attached
    pub fn append_provenance(&self, session_id: &str, mut entry: Value) -> Result<(), SessionError> {
        if let Some(map) = entry.as_object_mut() {
            let hex = uuid::Uuid::new_v4().simple().to_string();
            map.insert("trace_id".to_string(), format!("tr{}", &hex[..12]).into());
            map.insert("timestamp".to_string(), now_secs().into());
        }

        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
        session.provenance.push(entry);
        session.version += 1;
        let snapshot = session.clone();
        drop(sessions);

        self.enqueue_save(snapshot);
        Ok(())
    }

    /// Read one context key
    pub fn context_get(&self, session_id: &str, key: &str) -> Option<Value> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(session_id)?.context.get(key).cloned()
    }

    /// Write one context key (bumps the version)
    pub fn context_set(&self, session_id: &str, key: &str, value: Value) -> Result<(), SessionError> {
        let mut context = Map::new();
        context.insert(key.to_string(), value);
        self.update(session_id, None, Some(context)).map(|_| ())
    }

    pub fn list_ids(&self) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap();
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop the writer and sweeper, then flush everything synchronously
    pub async fn shutdown(&self) {
        {
            let mut tx = self.write_tx.lock().unwrap();
            tx.take();
        }
        let writer = self.writer.lock().unwrap().take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        let sweeper = self.sweeper.lock().unwrap().take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        let sessions: Vec<Session> = {
            let sessions = self.sessions.lock().unwrap();
            sessions.values().cloned().collect()
        };
        let adapter = self.adapter.clone();
        let _ = tokio::task::spawn_blocking(move || {
            for session in sessions {
                if let Err(e) = adapter.save_session(&session) {
                    warn!(session_id = %session.id, "SessionManager: final save failed: {}", e);
                }
            }
            if let Err(e) = adapter.close() {
                warn!("SessionManager: adapter close failed: {}", e);
            }
        })
        .await;
        info!("SessionManager: shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessionstore::MemoryStorageAdapter;

    fn config() -> SessionConfig {
        SessionConfig {
            db_path: String::new(),
            default_ttl_secs: 3600.0,
            write_queue_size: 64,
            sweeper_interval_ms: 60_000,
        }
    }

    fn manager() -> (Arc<dyn StorageAdapter>, Arc<SessionManager>) {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryStorageAdapter::new());
        let manager = SessionManager::start(adapter.clone(), &config()).unwrap();
        (adapter, manager)
    }

    #[tokio::test]
    async fn test_create_get_update_delete() {
        let (_adapter, manager) = manager();

        let session = manager.create(Some("s1".to_string()), None);
        assert_eq!(session.version, 1);

        let mut context = Map::new();
        context.insert("task".to_string(), "deploy".into());
        let updated = manager.update("s1", None, Some(context)).unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(manager.context_get("s1", "task"), Some("deploy".into()));

        manager.delete("s1");
        assert!(manager.peek("s1").is_none());
    }

    #[tokio::test]
    async fn test_version_monotonically_increases() {
        let (_adapter, manager) = manager();
        manager.create(Some("s2".to_string()), None);

        let mut last = 1;
        for i in 0..5 {
            let mut context = Map::new();
            context.insert("i".to_string(), i.into());
            let session = manager.update("s2", None, Some(context)).unwrap();
            assert!(session.version > last);
            last = session.version;
        }
        assert_eq!(last, 6);
    }

    #[tokio::test]
    async fn test_writes_reach_storage() {
        let (adapter, manager) = manager();
        manager.create(Some("s3".to_string()), None);
        manager.context_set("s3", "k", "v".into()).unwrap();

        // Give the writer a moment to drain
        tokio::time::sleep(Duration::from_millis(50)).await;
        let persisted = adapter.load_session("s3").unwrap().unwrap();
        assert_eq!(persisted.context.get("k"), Some(&Value::from("v")));
        assert_eq!(persisted.version, 2);
    }

    #[tokio::test]
    async fn test_restart_reloads_sessions() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryStorageAdapter::new());
        {
            let manager = SessionManager::start(adapter.clone(), &config()).unwrap();
            manager.create(Some("persist".to_string()), None);
            manager.shutdown().await;
        }

        let manager = SessionManager::start(adapter, &config()).unwrap();
        assert!(manager.peek("persist").is_some());
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired() {
        let (_adapter, manager) = manager();
        let session = manager.create(Some("short".to_string()), None);
        assert!(manager.peek("short").is_some());

        // Force expiry by rewinding the creation watermark
        {
            let mut metadata = Map::new();
            metadata.insert(
                sessionstore::META_CREATED_AT.to_string(),
                (session.created_at - 10_000.0).into(),
            );
            metadata.insert(sessionstore::META_TTL.to_string(), Value::from(1.0));
            manager.update("short", Some(metadata), None).unwrap();
        }

        manager.sweep();
        assert!(manager.peek("short").is_none());
    }

    #[tokio::test]
    async fn test_get_touches_last_watermark() {
        let (_adapter, manager) = manager();
        let created = manager.create(Some("touch".to_string()), None);
        let before = created.metadata[META_LAST_TOUCH].as_f64().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let touched = manager.get("touch").unwrap();
        let after = touched.metadata[META_LAST_TOUCH].as_f64().unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_provenance_auto_attaches_trace() {
        let (_adapter, manager) = manager();
        manager.create(Some("prov".to_string()), None);
        manager
            .append_provenance("prov", serde_json::json!({"event": "plan.created"}))
            .unwrap();

        let session = manager.peek("prov").unwrap();
        assert_eq!(session.provenance.len(), 1);
        assert!(session.provenance[0]["trace_id"].as_str().unwrap().starts_with("tr"));
        assert!(session.provenance[0]["timestamp"].as_f64().is_some());
        assert_eq!(session.version, 2);
    }

    #[tokio::test]
    async fn test_unknown_session_errors() {
        let (_adapter, manager) = manager();
        assert!(matches!(
            manager.update("ghost", None, None),
            Err(SessionError::UnknownSession(_))
        ));
        assert!(manager.append_provenance("ghost", serde_json::json!({})).is_err());
    }
}
