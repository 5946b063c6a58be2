//! Server side of the collaboration protocol
//!
//! - `collab`: version checks, rebasing, persistence and fan-out
//! - `connections`: live connections and the documents they joined
//! - `pipeline`: staged request handling (auth, execute, respond)
//! - `server`: WebSocket accept loop wiring sockets into the pipeline

pub mod collab;
pub mod connections;
pub mod pipeline;
pub mod server;

pub use collab::{CollabHub, HubReply};
pub use connections::{ConnectionId, ConnectionTable, Departed};
pub use pipeline::{Pipeline, PipelineHooks, PipelineState, Request, Response};
pub use server::{serve, HubServer};
