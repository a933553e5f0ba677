//! SessionStore - durable session records for cortexd
//!
//! A session is the durable container for one conversational/runtime context:
//! a version counter, watermark metadata (TTL, last touch), a free-form
//! context mapping and an ordered provenance log. This crate only provides
//! the synchronous storage layer; the daemon builds the write-behind manager
//! and TTL sweeper on top of it.
//!
//! # Example
//!
//! ```ignore
//! use sessionstore::{Session, SqliteStorageAdapter, StorageAdapter};
//!
//! let mut adapter = SqliteStorageAdapter::new("data/sessions.db");
//! adapter.init()?;
//! let session = Session::new(None, 3600.0);
//! adapter.save_session(&session)?;
//! ```

mod sqlite;
mod store;

pub use sqlite::SqliteStorageAdapter;
pub use store::{MemoryStorageAdapter, Session, StorageAdapter, StoreError};

/// Metadata key holding the creation watermark (unix seconds)
pub const META_CREATED_AT: &str = "_created_at";

/// Metadata key holding the last-touch watermark (unix seconds)
pub const META_LAST_TOUCH: &str = "_last_touch";

/// Metadata key holding the TTL in seconds
pub const META_TTL: &str = "_ttl";

/// Metadata key enabling sliding expiry (TTL counted from last touch)
pub const META_SLIDING: &str = "_sliding";
