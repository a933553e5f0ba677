//! SQLite storage adapter

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::store::{now_secs, Session, StorageAdapter, StoreError};

/// SQLite-backed storage adapter
///
/// Sessions are stored one row each with metadata/context/provenance as
/// JSON columns. WAL mode keeps writer latency low for the write-behind
/// queue in the daemon.
pub struct SqliteStorageAdapter {
    db_path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl SqliteStorageAdapter {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            conn: Mutex::new(None),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let guard = self.conn.lock().unwrap();
        let conn = guard.as_ref().ok_or(StoreError::NotInitialized)?;
        f(conn)
    }

    fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, rusqlite::Error> {
        let metadata: String = row.get(2)?;
        let context: String = row.get(3)?;
        let provenance: String = row.get(4)?;
        Ok(Session {
            id: row.get(0)?,
            version: row.get::<_, i64>(1)? as u64,
            metadata: serde_json::from_str::<Map<String, Value>>(&metadata).unwrap_or_default(),
            context: serde_json::from_str::<Map<String, Value>>(&context).unwrap_or_default(),
            provenance: serde_json::from_str::<Vec<Value>>(&provenance).unwrap_or_default(),
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}

impl StorageAdapter for SqliteStorageAdapter {
    fn init(&self) -> Result<(), StoreError> {
        debug!(path = %self.db_path.display(), "SqliteStorageAdapter::init");
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }

        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                version INTEGER,
                metadata TEXT,
                context_json TEXT,
                provenance_json TEXT,
                created_at REAL,
                updated_at REAL
            )",
            [],
        )?;

        let mut guard = self.conn.lock().unwrap();
        *guard = Some(conn);
        info!(path = %self.db_path.display(), "Session storage ready");
        Ok(())
    }

    fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&session.metadata)?;
        let context = serde_json::to_string(&session.context)?;
        let provenance = serde_json::to_string(&session.provenance)?;
        let now = now_secs();

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, version, metadata, context_json, provenance_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    version = excluded.version,
                    metadata = excluded.metadata,
                    context_json = excluded.context_json,
                    provenance_json = excluded.provenance_json,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    session.id,
                    session.version as i64,
                    metadata,
                    context,
                    provenance,
                    session.created_at,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    fn load_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, version, metadata, context_json, provenance_json, created_at, updated_at
                 FROM sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query_map([session_id], Self::row_to_session)?;
            match rows.next() {
                Some(row) => Ok(Some(row?)),
                None => Ok(None),
            }
        })
    }

    fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM sessions WHERE id = ?1", [session_id])?;
            Ok(())
        })
    }

    fn list_session_ids(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM sessions")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    fn export_all(&self) -> Result<Vec<Session>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, version, metadata, context_json, provenance_json, created_at, updated_at
                 FROM sessions",
            )?;
            let sessions = stmt
                .query_map([], Self::row_to_session)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(sessions)
        })
    }

    fn close(&self) -> Result<(), StoreError> {
        debug!("SqliteStorageAdapter::close");
        let mut guard = self.conn.lock().unwrap();
        if let Some(conn) = guard.take() {
            // Connection::close returns the connection on failure; drop it either way
            let _ = conn.close();
        }
        Ok(())
    }
}
