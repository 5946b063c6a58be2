//! Tandem Core Library
//!
//! Real-time collaborative editing of structured documents using
//! operational transformation, with a central hub that orders changes.
//!
//! # Architecture
//!
//! - **Client session**: applies local edits optimistically and keeps at
//!   most one commit in flight
//! - **Hub**: assigns versions, rebases stale commits and broadcasts
//! - **Change log**: the hub's source of truth, replayable from snapshots
//!
//! # Quick Start
//!
//! ```text
//! let mut session = ClientSession::new("doc-1", Document::new(), 0);
//! session.transaction(|tx| {
//!     tx.create(json!({"id": "p1", "type": "paragraph", "content": ""}))?;
//!     tx.insert_text(path(["p1", "content"]), 0, "Hello")
//! })?;
//! ```
//!
//! # Modules
//!
//! - `model`: documents, operations, changes and selections
//! - `transform`: operational transformation of concurrent changes
//! - `history`: undo/redo that survives remote changes
//! - `sync`: client session, wire messages and the WebSocket task
//! - `hub`: server side request pipeline and broadcast
//! - `storage`: change log and snapshots
//! - `config`: application configuration

pub mod config;
pub mod emitter;
pub mod error;
pub mod history;
pub mod hub;
pub mod model;
pub mod storage;
pub mod sync;
pub mod transform;

pub use config::Config;
pub use emitter::{Emitter, EventBus, SubscriptionId};
pub use error::{CollabError, CollabResult, ErrorKind};
pub use history::{ChangeHistory, DEFAULT_MAX_LEVELS};
pub use hub::{CollabHub, HubServer, Pipeline};
pub use model::{path, Change, Diff, Document, Operation, Path, Selection};
pub use storage::{ChangeStore, MemoryChangeStore, SnapshotEngine, SqliteChangeStore, StorageError};
pub use sync::{ClientMessage, ClientSession, ServerMessage, SessionEvent, Transaction};
pub use transform::{transform, transformed};
