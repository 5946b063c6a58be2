//! Collaboration error handling
//!
//! Errors raised by the transform engine, the client session and the hub.
//! `ErrorKind` is the discriminant that travels over the wire inside
//! `["error", kind, message, changeId?]` messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageError;

/// Wire-visible error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    DocumentNotFound,
    VersionMismatch,
    SessionInvalid,
    TransformFailure,
    TransportClosed,
    Apply,
    Protocol,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::DocumentNotFound => "DocumentNotFound",
            ErrorKind::VersionMismatch => "VersionMismatch",
            ErrorKind::SessionInvalid => "SessionInvalid",
            ErrorKind::TransformFailure => "TransformFailure",
            ErrorKind::TransportClosed => "TransportClosed",
            ErrorKind::Apply => "Apply",
            ErrorKind::Protocol => "Protocol",
            ErrorKind::Storage => "Storage",
        }
    }
}

/// Errors that can occur while synchronizing a document
#[derive(Error, Debug)]
pub enum CollabError {
    /// The document is unknown to the hub
    #[error("Document not found: '{0}'")]
    DocumentNotFound(String),

    /// Client claims a version the server never produced
    #[error("Version mismatch for '{doc_id}': client at {client}, server at {server}")]
    VersionMismatch {
        doc_id: String,
        client: u64,
        server: u64,
    },

    /// Session was rejected by the server
    #[error("Session invalid: {0}")]
    SessionInvalid(String),

    /// Two operations touch the same path in a way that cannot be reconciled
    #[error("Cannot transform {left} against {right}: {reason}")]
    TransformFailure {
        left: String,
        right: String,
        reason: String,
    },

    /// The connection to the peer is gone
    #[error("Transport closed")]
    TransportClosed,

    /// An operation does not fit the document it is applied to
    #[error("Cannot apply operation at {path}: {reason}")]
    Apply { path: String, reason: String },

    /// Malformed wire data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Change or snapshot persistence failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl CollabError {
    pub fn apply(path: &[String], reason: impl Into<String>) -> Self {
        CollabError::Apply {
            path: format!("/{}", path.join("/")),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CollabError::DocumentNotFound(_) => ErrorKind::DocumentNotFound,
            CollabError::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            CollabError::SessionInvalid(_) => ErrorKind::SessionInvalid,
            CollabError::TransformFailure { .. } => ErrorKind::TransformFailure,
            CollabError::TransportClosed => ErrorKind::TransportClosed,
            CollabError::Apply { .. } => ErrorKind::Apply,
            CollabError::Protocol(_) => ErrorKind::Protocol,
            CollabError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether the client can recover by reopening the document
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CollabError::TransportClosed | CollabError::VersionMismatch { .. }
        )
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(err: serde_json::Error) -> Self {
        CollabError::Protocol(err.to_string())
    }
}

/// Result type for collaboration operations
pub type CollabResult<T> = Result<T, CollabError>;
