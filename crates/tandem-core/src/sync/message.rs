//! Sync protocol message types
//!
//! Messages are JSON arrays whose first element is a tag, e.g.
//! `["commit", docId, version, change]`. Text frames carry JSON; binary
//! frames carry the same array encoded as CBOR.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{CollabError, CollabResult, ErrorKind};
use crate::model::Change;

/// Messages sent by a client session to the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Value>", into = "Vec<Value>")]
pub enum ClientMessage {
    /// `["open", docId, version, change?]`
    Open {
        doc_id: String,
        version: u64,
        change: Option<Change>,
    },
    /// `["commit", docId, version, change]`
    Commit {
        doc_id: String,
        version: u64,
        change: Change,
    },
    /// `["updateSelection", docId, version, change]`
    UpdateSelection {
        doc_id: String,
        version: u64,
        change: Change,
    },
}

/// Messages sent by the hub to a client session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Value>", into = "Vec<Value>")]
pub enum ServerMessage {
    /// `["openDone", version, changes]`
    OpenDone { version: u64, changes: Vec<Change> },
    /// `["commitDone", version, changes]`
    CommitDone { version: u64, changes: Vec<Change> },
    /// `["update", version, change]`
    Update { version: u64, change: Change },
    /// `["updateSelection", version, change]`
    UpdateSelection { version: u64, change: Change },
    /// `["collaboratorLeft", sessionId]`
    CollaboratorLeft { session_id: String },
    /// `["error", kind, message, changeId?]`
    Error {
        kind: ErrorKind,
        message: String,
        change_id: Option<String>,
    },
}

impl ClientMessage {
    pub fn change(&self) -> Option<&Change> {
        match self {
            ClientMessage::Open { change, .. } => change.as_ref(),
            ClientMessage::Commit { change, .. }
            | ClientMessage::UpdateSelection { change, .. } => Some(change),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            ClientMessage::Open { .. } => "open",
            ClientMessage::Commit { .. } => "commit",
            ClientMessage::UpdateSelection { .. } => "updateSelection",
        }
    }

    pub fn encode_json(&self) -> CollabResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode_json(text: &str) -> CollabResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode_cbor(&self) -> CollabResult<Vec<u8>> {
        encode_cbor(self)
    }

    pub fn decode_cbor(bytes: &[u8]) -> CollabResult<Self> {
        decode_cbor(bytes)
    }
}

impl ServerMessage {
    pub fn error(err: &CollabError, change_id: Option<String>) -> Self {
        ServerMessage::Error {
            kind: err.kind(),
            message: err.to_string(),
            change_id,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            ServerMessage::OpenDone { .. } => "openDone",
            ServerMessage::CommitDone { .. } => "commitDone",
            ServerMessage::Update { .. } => "update",
            ServerMessage::UpdateSelection { .. } => "updateSelection",
            ServerMessage::CollaboratorLeft { .. } => "collaboratorLeft",
            ServerMessage::Error { .. } => "error",
        }
    }

    pub fn encode_json(&self) -> CollabResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode_json(text: &str) -> CollabResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode_cbor(&self) -> CollabResult<Vec<u8>> {
        encode_cbor(self)
    }

    pub fn decode_cbor(bytes: &[u8]) -> CollabResult<Self> {
        decode_cbor(bytes)
    }
}

fn encode_cbor<T: Serialize>(msg: &T) -> CollabResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(msg, &mut bytes)
        .map_err(|e| CollabError::Protocol(format!("CBOR encoding failed: {}", e)))?;
    Ok(bytes)
}

fn decode_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> CollabResult<T> {
    ciborium::from_reader(bytes)
        .map_err(|e| CollabError::Protocol(format!("CBOR decoding failed: {}", e)))
}

impl From<ClientMessage> for Vec<Value> {
    fn from(msg: ClientMessage) -> Self {
        match msg {
            ClientMessage::Open {
                doc_id,
                version,
                change,
            } => {
                let mut items = vec![json!("open"), json!(doc_id), json!(version)];
                if let Some(change) = change {
                    items.push(change_value(change));
                }
                items
            }
            ClientMessage::Commit {
                doc_id,
                version,
                change,
            } => vec![json!("commit"), json!(doc_id), json!(version), change_value(change)],
            ClientMessage::UpdateSelection {
                doc_id,
                version,
                change,
            } => vec![
                json!("updateSelection"),
                json!(doc_id),
                json!(version),
                change_value(change),
            ],
        }
    }
}

impl TryFrom<Vec<Value>> for ClientMessage {
    type Error = CollabError;

    fn try_from(items: Vec<Value>) -> Result<Self, CollabError> {
        let mut fields = Fields::new(items)?;
        let msg = match fields.tag.as_str() {
            "open" => ClientMessage::Open {
                doc_id: fields.string()?,
                version: fields.version()?,
                change: fields.optional_change()?,
            },
            "commit" => ClientMessage::Commit {
                doc_id: fields.string()?,
                version: fields.version()?,
                change: fields.change()?,
            },
            "updateSelection" => ClientMessage::UpdateSelection {
                doc_id: fields.string()?,
                version: fields.version()?,
                change: fields.change()?,
            },
            other => return Err(CollabError::Protocol(format!("Unknown message '{}'", other))),
        };
        fields.finish()?;
        Ok(msg)
    }
}

impl From<ServerMessage> for Vec<Value> {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::OpenDone { version, changes } => vec![
                json!("openDone"),
                json!(version),
                Value::Array(changes.into_iter().map(change_value).collect()),
            ],
            ServerMessage::CommitDone { version, changes } => vec![
                json!("commitDone"),
                json!(version),
                Value::Array(changes.into_iter().map(change_value).collect()),
            ],
            ServerMessage::Update { version, change } => {
                vec![json!("update"), json!(version), change_value(change)]
            }
            ServerMessage::UpdateSelection { version, change } => {
                vec![json!("updateSelection"), json!(version), change_value(change)]
            }
            ServerMessage::CollaboratorLeft { session_id } => {
                vec![json!("collaboratorLeft"), json!(session_id)]
            }
            ServerMessage::Error {
                kind,
                message,
                change_id,
            } => {
                let mut items = vec![json!("error"), json!(kind.as_str()), json!(message)];
                if let Some(id) = change_id {
                    items.push(json!(id));
                }
                items
            }
        }
    }
}

impl TryFrom<Vec<Value>> for ServerMessage {
    type Error = CollabError;

    fn try_from(items: Vec<Value>) -> Result<Self, CollabError> {
        let mut fields = Fields::new(items)?;
        let msg = match fields.tag.as_str() {
            "openDone" => ServerMessage::OpenDone {
                version: fields.version()?,
                changes: fields.changes()?,
            },
            "commitDone" => ServerMessage::CommitDone {
                version: fields.version()?,
                // older hubs omit the list on the fast path
                changes: if fields.is_exhausted() {
                    Vec::new()
                } else {
                    fields.changes()?
                },
            },
            "update" => ServerMessage::Update {
                version: fields.version()?,
                change: fields.change()?,
            },
            "updateSelection" => ServerMessage::UpdateSelection {
                version: fields.version()?,
                change: fields.change()?,
            },
            "collaboratorLeft" => ServerMessage::CollaboratorLeft {
                session_id: fields.string()?,
            },
            "error" => ServerMessage::Error {
                kind: serde_json::from_value(Value::String(fields.string()?))?,
                message: fields.string()?,
                change_id: if fields.is_exhausted() {
                    None
                } else {
                    Some(fields.string()?)
                },
            },
            other => return Err(CollabError::Protocol(format!("Unknown message '{}'", other))),
        };
        fields.finish()?;
        Ok(msg)
    }
}

fn change_value(change: Change) -> Value {
    // Change only holds JSON-representable data
    serde_json::to_value(change).unwrap_or(Value::Null)
}

/// Positional reader over a tagged message array
struct Fields {
    tag: String,
    items: std::vec::IntoIter<Value>,
}

impl Fields {
    fn new(items: Vec<Value>) -> CollabResult<Self> {
        let mut items = items.into_iter();
        let tag = match items.next() {
            Some(Value::String(tag)) => tag,
            _ => return Err(CollabError::Protocol("Message tag missing".to_string())),
        };
        Ok(Self { tag, items })
    }

    fn next(&mut self, what: &str) -> CollabResult<Value> {
        self.items.next().ok_or_else(|| {
            CollabError::Protocol(format!("'{}' message is missing {}", self.tag, what))
        })
    }

    fn string(&mut self) -> CollabResult<String> {
        match self.next("a string field")? {
            Value::String(s) => Ok(s),
            other => Err(CollabError::Protocol(format!("Expected string, got {}", other))),
        }
    }

    fn version(&mut self) -> CollabResult<u64> {
        let value = self.next("the version")?;
        value
            .as_u64()
            .ok_or_else(|| CollabError::Protocol(format!("Invalid version {}", value)))
    }

    fn change(&mut self) -> CollabResult<Change> {
        Ok(serde_json::from_value(self.next("the change")?)?)
    }

    fn optional_change(&mut self) -> CollabResult<Option<Change>> {
        match self.items.next() {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    fn changes(&mut self) -> CollabResult<Vec<Change>> {
        Ok(serde_json::from_value(self.next("the change list")?)?)
    }

    fn is_exhausted(&self) -> bool {
        self.items.len() == 0
    }

    fn finish(self) -> CollabResult<()> {
        if self.items.len() > 0 {
            return Err(CollabError::Protocol(format!(
                "Too many fields in '{}' message",
                self.tag
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{path, Diff, Operation};

    fn change() -> Change {
        Change::new(vec![Operation::update(
            path(["p1", "content"]),
            Diff::insert(0, "hi"),
        )])
        .with_session("s1")
    }

    #[test]
    fn test_commit_is_tagged_array() {
        let msg = ClientMessage::Commit {
            doc_id: "doc-1".to_string(),
            version: 3,
            change: change(),
        };
        let value: Value = serde_json::from_str(&msg.encode_json().unwrap()).unwrap();
        let items = value.as_array().unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[0], json!("commit"));
        assert_eq!(items[1], json!("doc-1"));
        assert_eq!(items[2], json!(3));
        assert_eq!(items[3]["sessionId"], json!("s1"));
    }

    #[test]
    fn test_open_without_change() {
        let decoded = ClientMessage::decode_json(r#"["open", "doc-1", 0]"#).unwrap();
        assert_eq!(
            decoded,
            ClientMessage::Open {
                doc_id: "doc-1".to_string(),
                version: 0,
                change: None,
            }
        );

        let encoded = decoded.encode_json().unwrap();
        assert_eq!(encoded, r#"["open","doc-1",0]"#);
    }

    #[test]
    fn test_open_with_pending_change() {
        let msg = ClientMessage::Open {
            doc_id: "doc-1".to_string(),
            version: 2,
            change: Some(change()),
        };
        let decoded = ClientMessage::decode_json(&msg.encode_json().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_server_messages_decode() {
        let text = r#"["commitDone", 6, []]"#;
        assert_eq!(
            ServerMessage::decode_json(text).unwrap(),
            ServerMessage::CommitDone {
                version: 6,
                changes: vec![]
            }
        );

        let fast_path = ServerMessage::decode_json(r#"["commitDone", 7]"#).unwrap();
        assert!(matches!(fast_path, ServerMessage::CommitDone { version: 7, .. }));

        let err = ServerMessage::decode_json(r#"["error", "TransformFailure", "boom", "c1"]"#)
            .unwrap();
        assert_eq!(
            err,
            ServerMessage::Error {
                kind: ErrorKind::TransformFailure,
                message: "boom".to_string(),
                change_id: Some("c1".to_string()),
            }
        );
    }

    #[test]
    fn test_rejects_malformed_messages() {
        assert!(ClientMessage::decode_json(r#"["launch", "doc", 1]"#).is_err());
        assert!(ClientMessage::decode_json(r#"["commit", "doc", 1]"#).is_err());
        assert!(ClientMessage::decode_json(r#"["commit", "doc", -1, {}]"#).is_err());
        assert!(ClientMessage::decode_json(r#"[]"#).is_err());
        assert!(ServerMessage::decode_json(r#"["collaboratorLeft", "s1", "extra"]"#).is_err());
    }

    #[test]
    fn test_cbor_frames() {
        let msg = ServerMessage::Update {
            version: 4,
            change: change(),
        };
        let bytes = msg.encode_cbor().unwrap();
        assert!(!bytes.is_empty());
        let decoded = ServerMessage::decode_cbor(&bytes).unwrap();
        match decoded {
            ServerMessage::Update { version, change } => {
                assert_eq!(version, 4);
                assert_eq!(change.session_id.as_deref(), Some("s1"));
            }
            other => panic!("Expected update, got {:?}", other),
        }
    }
}
