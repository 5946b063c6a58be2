//! Storage layer
//!
//! Persists what the hub accepts.
//!
//! ## Architecture
//!
//! - **Change log**: source of truth, one row per accepted version
//! - **Snapshots**: materialized documents that shorten replays
//!
//! Both stores come in an in-memory and a SQLite flavour behind async
//! traits, so the hub does not care where data lives.

pub mod changes;
pub mod error;
pub mod schema;
pub mod snapshots;

pub use changes::{ChangeStore, MemoryChangeStore, SqliteChangeStore};
pub use error::{StorageError, StorageResult};
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
pub use snapshots::{
    MemorySnapshotStore, Snapshot, SnapshotEngine, SnapshotStore, SqliteSnapshotStore,
};
