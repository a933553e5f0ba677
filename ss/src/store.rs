//! Session record and storage adapter contract

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::{META_CREATED_AT, META_LAST_TOUCH, META_SLIDING, META_TTL};

/// Errors from the storage layer
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage not initialized")]
    NotInitialized,

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Current unix time in seconds
pub(crate) fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn new_session_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("session_{}", &hex[..8])
}

/// A durable session record
///
/// `metadata` carries the watermark keys (`_created_at`, `_last_touch`,
/// `_ttl`, `_sliding`) alongside caller metadata such as `trust_level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session id
    pub id: String,
    /// Monotonically increasing version, bumped on every update
    pub version: u64,
    /// Watermarks plus caller metadata
    pub metadata: Map<String, Value>,
    /// Free-form runtime context
    pub context: Map<String, Value>,
    /// Ordered provenance entries
    pub provenance: Vec<Value>,
    /// Creation time (unix seconds)
    pub created_at: f64,
    /// Last persisted update time (unix seconds)
    pub updated_at: f64,
}

impl Session {
    /// Create a fresh session with watermark metadata
    pub fn new(id: Option<String>, ttl_seconds: f64) -> Self {
        let now = now_secs();
        let mut metadata = Map::new();
        metadata.insert(META_CREATED_AT.to_string(), now.into());
        metadata.insert(META_LAST_TOUCH.to_string(), now.into());
        metadata.insert(META_TTL.to_string(), ttl_seconds.into());
        metadata.insert(META_SLIDING.to_string(), false.into());

        Self {
            id: id.unwrap_or_else(new_session_id),
            version: 1,
            metadata,
            context: Map::new(),
            provenance: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Refresh the last-touch watermark
    pub fn touch(&mut self) {
        self.metadata.insert(META_LAST_TOUCH.to_string(), now_secs().into());
    }

    fn meta_f64(&self, key: &str, default: f64) -> f64 {
        self.metadata.get(key).and_then(Value::as_f64).unwrap_or(default)
    }

    /// Whether this session has outlived its TTL at time `now`
    ///
    /// Sliding sessions expire `ttl` seconds after the last touch; fixed
    /// sessions expire `ttl` seconds after creation.
    pub fn is_expired(&self, now: f64, default_ttl: f64) -> bool {
        let created = self.meta_f64(META_CREATED_AT, self.created_at);
        let ttl = self.meta_f64(META_TTL, default_ttl);
        let sliding = self
            .metadata
            .get(META_SLIDING)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let last_touch = self.meta_f64(META_LAST_TOUCH, created);
        let expiry = if sliding { last_touch + ttl } else { created + ttl };
        now > expiry
    }
}

/// Minimal storage adapter interface so the session manager can swap
/// backends. The bundled implementations are SQLite and in-memory.
pub trait StorageAdapter: Send + Sync {
    /// Prepare the backend (open connections, create tables)
    fn init(&self) -> Result<(), StoreError>;

    /// Insert or replace a session
    fn save_session(&self, session: &Session) -> Result<(), StoreError>;

    /// Load a single session, `None` if absent
    fn load_session(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    /// Remove a session; removing an absent session is not an error
    fn delete_session(&self, session_id: &str) -> Result<(), StoreError>;

    /// All stored session ids
    fn list_session_ids(&self) -> Result<Vec<String>, StoreError>;

    /// All stored sessions
    fn export_all(&self) -> Result<Vec<Session>, StoreError>;

    /// Flush and release resources
    fn close(&self) -> Result<(), StoreError>;
}

/// In-memory adapter for tests and ephemeral runtimes
#[derive(Default)]
pub struct MemoryStorageAdapter {
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemoryStorageAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageAdapter for MemoryStorageAdapter {
    fn init(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        debug!(session_id = %session.id, version = session.version, "MemoryStorageAdapter::save_session");
        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn load_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let sessions = self.sessions.lock().unwrap();
        Ok(sessions.get(session_id).cloned())
    }

    fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.remove(session_id);
        Ok(())
    }

    fn list_session_ids(&self) -> Result<Vec<String>, StoreError> {
        let sessions = self.sessions.lock().unwrap();
        Ok(sessions.keys().cloned().collect())
    }

    fn export_all(&self) -> Result<Vec<Session>, StoreError> {
        let sessions = self.sessions.lock().unwrap();
        Ok(sessions.values().cloned().collect())
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_has_watermarks() {
        let session = Session::new(None, 3600.0);
        assert_eq!(session.version, 1);
        assert!(session.metadata.contains_key(META_CREATED_AT));
        assert!(session.metadata.contains_key(META_LAST_TOUCH));
        assert_eq!(session.metadata.get(META_TTL).and_then(Value::as_f64), Some(3600.0));
        assert!(session.id.starts_with("session_"));
    }

    #[test]
    fn test_fixed_expiry() {
        let session = Session::new(Some("s1".to_string()), 10.0);
        let created = session.created_at;

        assert!(!session.is_expired(created + 5.0, 10.0));
        assert!(session.is_expired(created + 11.0, 10.0));
    }

    #[test]
    fn test_sliding_expiry_counts_from_last_touch() {
        let mut session = Session::new(Some("s2".to_string()), 10.0);
        session
            .metadata
            .insert(META_SLIDING.to_string(), true.into());
        let created = session.created_at;
        session
            .metadata
            .insert(META_LAST_TOUCH.to_string(), (created + 8.0).into());

        // Fixed expiry would trigger at created+10; sliding extends it
        assert!(!session.is_expired(created + 11.0, 10.0));
        assert!(session.is_expired(created + 19.0, 10.0));
    }

    #[test]
    fn test_memory_adapter_roundtrip() {
        let adapter = MemoryStorageAdapter::new();
        adapter.init().unwrap();

        let mut session = Session::new(Some("s3".to_string()), 60.0);
        session.context.insert("k".to_string(), "v".into());
        adapter.save_session(&session).unwrap();

        let loaded = adapter.load_session("s3").unwrap().unwrap();
        assert_eq!(loaded.context.get("k").and_then(Value::as_str), Some("v"));

        assert_eq!(adapter.list_session_ids().unwrap(), vec!["s3".to_string()]);

        adapter.delete_session("s3").unwrap();
        assert!(adapter.load_session("s3").unwrap().is_none());
    }
}
