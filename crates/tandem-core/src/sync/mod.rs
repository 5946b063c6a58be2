//! Client side of the collaboration protocol
//!
//! Keeps a local document in step with a hub over WebSocket.
//!
//! ## Protocol
//!
//! 1. Connect via WebSocket (optionally with `?token=...`)
//! 2. Send `open` with the local version and any unconfirmed change
//! 3. Apply the `openDone` backlog
//! 4. Commit buffered edits on every tick, one commit in flight at a time
//! 5. Apply `update` / `updateSelection` broadcasts as they arrive
//!
//! ## Usage
//!
//! ```ignore
//! let session = ClientSession::new("doc-1", Document::new(), 0);
//! let handle = spawn_session_task(SessionTaskConfig::from_config(&config), session);
//! handle.edit(|tx| tx.insert_text(path(["p1", "content"]), 0, "hi"));
//! ```

mod collaborators;
mod debounce;
pub mod message;
mod persistent;
mod session;
mod transaction;

pub use collaborators::{Collaborator, Collaborators, IndexPool};
pub use debounce::{Debouncer, DEFAULT_DEBOUNCE};
pub use message::{ClientMessage, ServerMessage};
pub use persistent::{
    spawn_session_task, ConnectionStatus, EditFn, FrameFormat, SessionCommand, SessionHandle,
    SessionTaskConfig,
};
pub use session::{ClientSession, SessionEvent};
pub use transaction::Transaction;
