//! # Collaboration Hub
//!
//! Server side of the protocol: accepts commits, rebases stale ones over the
//! changes the client has not seen, persists them and fans them out.
//!
//! ## Ordering
//!
//! Each document has an async lock held across version check, transform,
//! append and broadcast. A [`HubReply`] keeps the lock until the reply has
//! been queued, so a later commit's broadcast can never reach a client
//! before the reply to its own commit. Different documents proceed in
//! parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::connections::{ConnectionId, ConnectionTable};
use crate::error::{CollabError, CollabResult};
use crate::model::Change;
use crate::storage::ChangeStore;
use crate::sync::{ClientMessage, ServerMessage};
use crate::transform::{transform, transform_selection};

/// Reply to a request, holding the document lock until it is sent
#[derive(Debug)]
pub struct HubReply {
    pub message: ServerMessage,
    guard: Option<OwnedMutexGuard<()>>,
}

impl HubReply {
    fn locked(message: ServerMessage, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            message,
            guard: Some(guard),
        }
    }

    /// Split into the message and the lock guard; drop the guard once the
    /// message is queued
    pub fn into_parts(self) -> (ServerMessage, Option<OwnedMutexGuard<()>>) {
        (self.message, self.guard)
    }
}

pub struct CollabHub<S> {
    store: Arc<S>,
    connections: ConnectionTable,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl<S: ChangeStore> CollabHub<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            connections: ConnectionTable::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    async fn lock(&self, doc_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(doc_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Route a decoded client message
    ///
    /// Selection updates produce no reply.
    pub async fn handle(
        &self,
        conn: ConnectionId,
        msg: ClientMessage,
    ) -> CollabResult<Option<HubReply>> {
        match msg {
            ClientMessage::Open {
                doc_id,
                version,
                change,
            } => self.open(conn, &doc_id, version, change).await.map(Some),
            ClientMessage::Commit {
                doc_id,
                version,
                change,
            } => self.commit(conn, &doc_id, version, change).await.map(Some),
            ClientMessage::UpdateSelection {
                doc_id,
                version,
                change,
            } => {
                self.update_selection(conn, &doc_id, version, change)
                    .await?;
                Ok(None)
            }
        }
    }

    /// Join a document, optionally committing a change carried along
    ///
    /// A change whose id is already in the log is a resend of a commit the
    /// client never saw confirmed; it is not appended again. The connection
    /// only joins once the open succeeded, so a failed open receives no
    /// broadcasts until the client opens again.
    pub async fn open(
        &self,
        conn: ConnectionId,
        doc_id: &str,
        client_version: u64,
        change: Option<Change>,
    ) -> CollabResult<HubReply> {
        let guard = self.lock(doc_id).await;
        let session_id = change.as_ref().and_then(|c| c.session_id.clone());

        let server_version = self.store.get_version(doc_id).await?;
        check_version(doc_id, client_version, server_version)?;

        let duplicate = match &change {
            Some(change) => self.store.find_change(doc_id, &change.id).await?.is_some(),
            None => false,
        };
        let (version, changes) = match change {
            Some(change) if duplicate => {
                info!("Duplicate resend of {} on '{}'", change.id, doc_id);
                let (changes, version) =
                    self.store.get_changes(doc_id, client_version, None).await?;
                (version, changes)
            }
            Some(change) => {
                self.commit_locked(conn, doc_id, client_version, server_version, change)
                    .await?
            }
            None => {
                let (changes, version) =
                    self.store.get_changes(doc_id, client_version, None).await?;
                (version, changes)
            }
        };

        self.connections.join(conn, doc_id).await;
        if let Some(session_id) = session_id {
            self.connections.set_session(conn, &session_id).await;
        }
        debug!(
            "Connection {} opened '{}' at {} ({} changes behind)",
            conn,
            doc_id,
            client_version,
            changes.len()
        );
        Ok(HubReply::locked(
            ServerMessage::OpenDone { version, changes },
            guard,
        ))
    }

    /// Accept a change made at `client_version`
    pub async fn commit(
        &self,
        conn: ConnectionId,
        doc_id: &str,
        client_version: u64,
        change: Change,
    ) -> CollabResult<HubReply> {
        let guard = self.lock(doc_id).await;
        self.ensure_joined(conn, doc_id).await?;
        if let Some(session_id) = change.session_id.as_deref() {
            self.connections.set_session(conn, session_id).await;
        }

        let server_version = self.store.get_version(doc_id).await?;
        check_version(doc_id, client_version, server_version)?;
        let (version, changes) = self
            .commit_locked(conn, doc_id, client_version, server_version, change)
            .await?;
        Ok(HubReply::locked(
            ServerMessage::CommitDone { version, changes },
            guard,
        ))
    }

    /// Rebase, persist and broadcast; caller holds the document lock
    ///
    /// Returns the new version and the changes the client had not seen.
    async fn commit_locked(
        &self,
        conn: ConnectionId,
        doc_id: &str,
        client_version: u64,
        server_version: u64,
        mut change: Change,
    ) -> CollabResult<(u64, Vec<Change>)> {
        let backlog = if client_version < server_version {
            let (changes, _) = self
                .store
                .get_changes(doc_id, client_version, Some(server_version))
                .await?;
            changes
        } else {
            Vec::new()
        };

        // Fast path when the client was up to date
        for past in &backlog {
            let mut past = past.clone();
            transform(&mut past, &mut change)?;
        }

        if change.is_empty() {
            return Ok((server_version, backlog));
        }

        change.info.version = Some(server_version + 1);
        let version = self.store.add_change(doc_id, &change).await?;
        debug!(
            "Accepted {} on '{}' at version {} (rebased over {})",
            change.id,
            doc_id,
            version,
            backlog.len()
        );

        let sent = self
            .connections
            .broadcast(doc_id, conn, &ServerMessage::Update { version, change })
            .await;
        debug!("Broadcast version {} of '{}' to {} peers", version, doc_id, sent);
        Ok((version, backlog))
    }

    /// Relay a selection to the other collaborators
    pub async fn update_selection(
        &self,
        conn: ConnectionId,
        doc_id: &str,
        client_version: u64,
        mut change: Change,
    ) -> CollabResult<()> {
        let _guard = self.lock(doc_id).await;
        self.ensure_joined(conn, doc_id).await?;
        if let Some(session_id) = change.session_id.as_deref() {
            self.connections.set_session(conn, session_id).await;
        }

        let server_version = self.store.get_version(doc_id).await?;
        check_version(doc_id, client_version, server_version)?;
        if client_version < server_version {
            let (missed, _) = self
                .store
                .get_changes(doc_id, client_version, Some(server_version))
                .await?;
            for past in &missed {
                transform_selection(&mut change.before.selection, &past.ops);
                transform_selection(&mut change.after.selection, &past.ops);
            }
        }

        self.connections
            .broadcast(
                doc_id,
                conn,
                &ServerMessage::UpdateSelection {
                    version: server_version,
                    change,
                },
            )
            .await;
        Ok(())
    }

    /// Drop a connection and tell its collaborators
    pub async fn disconnect(&self, conn: ConnectionId) {
        let Some(departed) = self.connections.remove(conn).await else {
            return;
        };
        let (Some(doc_id), Some(session_id)) = (departed.doc_id, departed.session_id) else {
            return;
        };
        let _guard = self.lock(&doc_id).await;
        let notified = self
            .connections
            .broadcast(&doc_id, conn, &ServerMessage::CollaboratorLeft { session_id })
            .await;
        debug!("Connection {} left '{}' ({} notified)", conn, doc_id, notified);
    }

    async fn ensure_joined(&self, conn: ConnectionId, doc_id: &str) -> CollabResult<()> {
        match self.connections.document_of(conn).await {
            Some(joined) if joined == doc_id => Ok(()),
            _ => {
                warn!("Connection {} used '{}' without opening it", conn, doc_id);
                Err(CollabError::Protocol(format!(
                    "Document '{}' is not open on this connection",
                    doc_id
                )))
            }
        }
    }
}

fn check_version(doc_id: &str, client: u64, server: u64) -> CollabResult<()> {
    if client > server {
        return Err(CollabError::VersionMismatch {
            doc_id: doc_id.to_string(),
            client,
            server,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{path, Diff, Operation, Selection};
    use crate::storage::MemoryChangeStore;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn content() -> Vec<String> {
        path(["p1", "content"])
    }

    fn insert(pos: usize, text: &str, session: &str) -> Change {
        Change::new(vec![Operation::update(content(), Diff::insert(pos, text))])
            .with_session(session)
    }

    struct Client {
        id: ConnectionId,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    async fn client(hub: &CollabHub<MemoryChangeStore>, doc_id: &str) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = hub.connections().register(tx).await;
        let reply = hub.open(id, doc_id, 0, None).await.unwrap();
        assert!(matches!(reply.message, ServerMessage::OpenDone { .. }));
        Client { id, rx }
    }

    async fn seeded_hub(versions: usize) -> CollabHub<MemoryChangeStore> {
        let store = Arc::new(MemoryChangeStore::new());
        store
            .add_change(
                "doc",
                &Change::new(vec![Operation::create(json!({"id": "p1", "content": ""}))]),
            )
            .await
            .unwrap();
        for i in 1..versions {
            store
                .add_change("doc", &insert(0, &i.to_string(), "seed"))
                .await
                .unwrap();
        }
        CollabHub::new(store)
    }

    #[tokio::test]
    async fn test_fast_path_commit() {
        let hub = seeded_hub(1).await;
        let mut a = client(&hub, "doc").await;
        let mut b = client(&hub, "doc").await;

        let reply = hub.commit(a.id, "doc", 1, insert(0, "x", "a")).await.unwrap();
        assert_eq!(
            reply.message,
            ServerMessage::CommitDone {
                version: 2,
                changes: vec![]
            }
        );
        drop(reply);

        match b.rx.try_recv().unwrap() {
            ServerMessage::Update { version, change } => {
                assert_eq!(version, 2);
                assert_eq!(change.info.version, Some(2));
            }
            other => panic!("Expected update, got {:?}", other),
        }
        assert!(a.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_commit_is_rebased() {
        // Client at version 3, server at 5: result is version 6 with a
        // backlog of the two changes the client missed
        let hub = seeded_hub(5).await;
        let a = client(&hub, "doc").await;
        let change = Change::new(vec![Operation::update(content(), Diff::insert(2, "!"))]);

        let reply = hub.commit(a.id, "doc", 3, change).await.unwrap();
        let (message, _guard) = reply.into_parts();
        match message {
            ServerMessage::CommitDone { version, changes } => {
                assert_eq!(version, 6);
                assert_eq!(changes.len(), 2);
                assert_eq!(changes[0].info.version, Some(4));
                assert_eq!(changes[1].info.version, Some(5));
            }
            other => panic!("Expected commitDone, got {:?}", other),
        }

        let (stored, version) = hub.store().get_changes("doc", 5, None).await.unwrap();
        assert_eq!(version, 6);
        // Two single-char inserts at the front moved the insert right
        assert_eq!(
            stored[0].ops[0],
            Operation::update(content(), Diff::insert(4, "!"))
        );
    }

    #[tokio::test]
    async fn test_versions_are_monotonic() {
        let hub = seeded_hub(1).await;
        let a = client(&hub, "doc").await;
        let b = client(&hub, "doc").await;

        let mut last = 1;
        for i in 0..5 {
            let conn = if i % 2 == 0 { a.id } else { b.id };
            // Everyone commits against the initial version
            let reply = hub.commit(conn, "doc", 1, insert(0, "x", "s")).await.unwrap();
            match reply.message {
                ServerMessage::CommitDone { version, .. } => {
                    assert_eq!(version, last + 1);
                    last = version;
                }
                other => panic!("Expected commitDone, got {:?}", other),
            }
        }
        assert_eq!(hub.store().get_version("doc").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_future_version_is_rejected() {
        let hub = seeded_hub(1).await;
        let a = client(&hub, "doc").await;
        let err = hub
            .commit(a.id, "doc", 7, insert(0, "x", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::VersionMismatch { client: 7, server: 1, .. }));
        assert_eq!(hub.store().get_version("doc").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_appends_nothing() {
        let hub = seeded_hub(2).await;
        let mut a = client(&hub, "doc").await;
        let mut b = client(&hub, "doc").await;

        // A set and a string edit on the same property cannot be reconciled
        hub.store()
            .add_change(
                "doc",
                &Change::new(vec![Operation::Set {
                    path: path(["p1", "level"]),
                    value: json!(2),
                    original: json!(null),
                }]),
            )
            .await
            .unwrap();
        let conflicting = Change::new(vec![Operation::update(
            path(["p1", "level"]),
            Diff::insert(0, "x"),
        )]);

        let err = hub.commit(a.id, "doc", 2, conflicting).await.unwrap_err();
        assert!(matches!(err, CollabError::TransformFailure { .. }));
        assert_eq!(hub.store().get_version("doc").await.unwrap(), 3);
        assert!(a.rx.try_recv().is_err());
        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_open_with_duplicate_resend() {
        let hub = seeded_hub(1).await;
        let a = client(&hub, "doc").await;
        let change = insert(0, "x", "a");
        drop(hub.commit(a.id, "doc", 1, change.clone()).await.unwrap());

        // Reply was lost; client reconnects and resends
        hub.disconnect(a.id).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = hub.connections().register(tx).await;
        let reply = hub.open(conn, "doc", 1, Some(change.clone())).await.unwrap();
        match reply.message {
            ServerMessage::OpenDone { version, changes } => {
                assert_eq!(version, 2);
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].id, change.id);
            }
            other => panic!("Expected openDone, got {:?}", other),
        }
        assert_eq!(hub.store().get_version("doc").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_open_commits_offline_change() {
        let hub = seeded_hub(2).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = hub.connections().register(tx).await;

        let reply = hub
            .open(conn, "doc", 1, Some(insert(0, "offline", "a")))
            .await
            .unwrap();
        match reply.message {
            ServerMessage::OpenDone { version, changes } => {
                assert_eq!(version, 3);
                assert_eq!(changes.len(), 1);
            }
            other => panic!("Expected openDone, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_open_does_not_join() {
        let hub = seeded_hub(2).await;
        let a = client(&hub, "doc").await;
        hub.store()
            .add_change(
                "doc",
                &Change::new(vec![Operation::Set {
                    path: path(["p1", "level"]),
                    value: json!(2),
                    original: json!(null),
                }]),
            )
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = hub.connections().register(tx).await;
        let offline = Change::new(vec![Operation::update(
            path(["p1", "level"]),
            Diff::insert(0, "x"),
        )])
        .with_session("b");
        let err = hub.open(conn, "doc", 2, Some(offline)).await.unwrap_err();
        assert!(matches!(err, CollabError::TransformFailure { .. }));
        assert_eq!(hub.connections().document_of(conn).await, None);

        // Later commits are not broadcast to the half-open connection
        drop(hub.commit(a.id, "doc", 3, insert(0, "y", "a")).await.unwrap());
        assert!(rx.try_recv().is_err());

        let reply = hub.open(conn, "doc", 2, None).await.unwrap();
        match reply.message {
            ServerMessage::OpenDone { version, changes } => {
                assert_eq!(version, 4);
                assert_eq!(changes.len(), 2);
            }
            other => panic!("Expected openDone, got {:?}", other),
        }
        assert_eq!(hub.connections().document_of(conn).await.as_deref(), Some("doc"));
    }

    #[tokio::test]
    async fn test_selection_relay_is_rebased() {
        let hub = seeded_hub(3).await;
        let a = client(&hub, "doc").await;
        let mut b = client(&hub, "doc").await;

        let sel = Selection::collapsed(content(), 0);
        let change = Change::selection_only(sel).with_session("a");
        hub.update_selection(a.id, "doc", 1, change).await.unwrap();

        match b.rx.try_recv().unwrap() {
            ServerMessage::UpdateSelection { version, change } => {
                assert_eq!(version, 3);
                // Two inserts at offset 0 pushed the caret along
                assert_eq!(change.after.selection, Selection::collapsed(content(), 2));
            }
            other => panic!("Expected selection update, got {:?}", other),
        }
        assert_eq!(hub.store().get_version("doc").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_commit_requires_open_document() {
        let hub = seeded_hub(1).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = hub.connections().register(tx).await;
        let err = hub
            .commit(conn, "doc", 1, insert(0, "x", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_disconnect_notifies_collaborators() {
        let hub = seeded_hub(1).await;
        let a = client(&hub, "doc").await;
        let mut b = client(&hub, "doc").await;
        drop(hub.commit(a.id, "doc", 1, insert(0, "x", "session-a")).await.unwrap());
        let _ = b.rx.try_recv();

        hub.disconnect(a.id).await;
        assert_eq!(
            b.rx.try_recv().unwrap(),
            ServerMessage::CollaboratorLeft {
                session_id: "session-a".to_string()
            }
        );
        assert_eq!(hub.connections().peers("doc").await, vec![b.id]);
    }

    #[tokio::test]
    async fn test_reply_holds_document_lock() {
        let hub = Arc::new(seeded_hub(1).await);
        let a = client(&hub, "doc").await;
        let b = client(&hub, "doc").await;

        let reply = hub.commit(a.id, "doc", 1, insert(0, "x", "a")).await.unwrap();
        let other = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.commit(b.id, "doc", 1, insert(0, "y", "b")).await })
        };
        tokio::task::yield_now().await;
        assert!(!other.is_finished());

        drop(reply);
        let second = other.await.unwrap().unwrap();
        assert!(matches!(
            second.message,
            ServerMessage::CommitDone { version: 3, .. }
        ));
    }
}
