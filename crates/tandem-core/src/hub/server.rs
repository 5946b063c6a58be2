//! WebSocket front end for the hub
//!
//! Each accepted socket gets a writer task draining its outbound queue and
//! a reader loop that feeds every decoded frame through the [`Pipeline`].
//! Replies use the frame type the client last spoke: CBOR for binary
//! frames, JSON for text.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::collab::CollabHub;
use super::connections::ConnectionId;
use super::pipeline::{Pipeline, PipelineHooks, Request, Response};
use crate::error::CollabError;
use crate::storage::ChangeStore;
use crate::sync::{ClientMessage, ServerMessage};

/// Pipeline hooks backed by a [`CollabHub`]
pub struct HubServer<S> {
    hub: Arc<CollabHub<S>>,
    auth_token: Option<String>,
}

impl<S: ChangeStore> HubServer<S> {
    pub fn new(hub: Arc<CollabHub<S>>, auth_token: Option<String>) -> Self {
        Self { hub, auth_token }
    }

    pub fn hub(&self) -> &Arc<CollabHub<S>> {
        &self.hub
    }
}

#[async_trait]
impl<S: ChangeStore + 'static> PipelineHooks for HubServer<S> {
    async fn authenticate(&self, req: &mut Request, res: &mut Response) {
        match &self.auth_token {
            Some(expected) if req.token.as_deref() != Some(expected.as_str()) => {
                warn!("Connection {} presented a bad token", req.connection);
                res.fail(CollabError::SessionInvalid(
                    "Missing or invalid token".to_string(),
                ));
            }
            _ => req.authenticated = true,
        }
    }

    async fn execute(&self, req: &mut Request, res: &mut Response) {
        res.change_id = req.message.change().map(|c| c.id.clone());
        match self.hub.handle(req.connection, req.message.clone()).await {
            Ok(Some(reply)) => {
                let (message, guard) = reply.into_parts();
                res.data = Some(message);
                res.lock = guard;
                res.ready = true;
            }
            Ok(None) => res.ready = true,
            Err(err) => {
                debug!(
                    "{} from connection {} failed: {}",
                    req.message.tag(),
                    req.connection,
                    err
                );
                res.fail(err);
            }
        }
    }

    async fn send_response(&self, req: &mut Request, res: &mut Response) {
        if let Some(message) = res.data.take() {
            if !self.hub.connections().send(req.connection, message).await {
                debug!("Connection {} closed before its reply", req.connection);
            }
        }
        res.lock = None;
        res.sent = true;
    }

    async fn send_error(&self, req: &mut Request, res: &mut Response) {
        if let Some(err) = &res.error {
            let message = ServerMessage::error(err, res.change_id.clone());
            self.hub.connections().send(req.connection, message).await;
        }
        res.lock = None;
        res.sent = true;
    }

    async fn on_connection(&self, conn: ConnectionId) {
        info!("Connection {} opened", conn);
    }

    async fn on_disconnect(&self, conn: ConnectionId) {
        self.hub.disconnect(conn).await;
        info!("Connection {} closed", conn);
    }
}

/// Accept WebSocket clients until the listener fails
pub async fn serve<S>(listener: TcpListener, pipeline: Arc<Pipeline<HubServer<S>>>) -> Result<()>
where
    S: ChangeStore + 'static,
{
    info!("Hub listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await?;
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_socket(stream, pipeline).await {
                warn!("Connection from {} ended with error: {}", peer, e);
            }
        });
    }
}

async fn handle_socket<S>(stream: TcpStream, pipeline: Arc<Pipeline<HubServer<S>>>) -> Result<()>
where
    S: ChangeStore + 'static,
{
    let mut token = None;
    let ws_stream = accept_hdr_async(
        stream,
        |req: &HandshakeRequest, resp: HandshakeResponse| -> Result<HandshakeResponse, ErrorResponse> {
            token = req.uri().query().and_then(token_from_query);
            Ok(resp)
        },
    )
    .await?;
    let (mut write, mut read) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let hub = pipeline.hooks().hub().clone();
    let conn = hub.connections().register(tx).await;
    pipeline.connected(conn).await;

    let binary = Arc::new(AtomicBool::new(false));
    let writer_binary = binary.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = if writer_binary.load(Ordering::Relaxed) {
                msg.encode_cbor().map(Message::Binary)
            } else {
                msg.encode_json().map(Message::Text)
            };
            match frame {
                Ok(frame) => {
                    if write.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("Failed to encode {}: {}", msg.tag(), e),
            }
        }
        write.close().await.ok();
    });

    while let Some(frame) = read.next().await {
        let decoded = match frame {
            Ok(Message::Text(text)) => {
                binary.store(false, Ordering::Relaxed);
                ClientMessage::decode_json(&text)
            }
            Ok(Message::Binary(data)) => {
                binary.store(true, Ordering::Relaxed);
                ClientMessage::decode_cbor(&data)
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Connection {} read error: {}", conn, e);
                break;
            }
        };

        let message = match decoded {
            Ok(message) => message,
            Err(err) => {
                warn!("Connection {} sent an unreadable frame: {}", conn, err);
                hub.connections()
                    .send(conn, ServerMessage::error(&err, None))
                    .await;
                continue;
            }
        };

        let mut req = Request::new(conn, message, token.clone());
        let mut res = Response::default();
        pipeline.next(&mut req, &mut res).await;
    }

    pipeline.disconnected(conn).await;
    writer.await.ok();
    Ok(())
}

fn token_from_query(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::pipeline::PipelineState;
    use crate::error::ErrorKind;
    use crate::model::Change;
    use crate::storage::MemoryChangeStore;

    fn server(token: Option<&str>) -> HubServer<MemoryChangeStore> {
        let hub = Arc::new(CollabHub::new(Arc::new(MemoryChangeStore::new())));
        HubServer::new(hub, token.map(str::to_string))
    }

    fn open(doc: &str) -> ClientMessage {
        ClientMessage::Open {
            doc_id: doc.to_string(),
            version: 0,
            change: None,
        }
    }

    #[test]
    fn test_token_from_query() {
        assert_eq!(token_from_query("token=abc"), Some("abc".to_string()));
        assert_eq!(token_from_query("a=1&token=xyz"), Some("xyz".to_string()));
        assert_eq!(token_from_query("a=1"), None);
    }

    #[tokio::test]
    async fn test_open_reply_is_queued() {
        let pipeline = Pipeline::new(server(None));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = pipeline.hooks().hub().connections().register(tx).await;

        let mut req = Request::new(conn, open("doc"), None);
        let mut res = Response::default();
        assert_eq!(pipeline.next(&mut req, &mut res).await, PipelineState::Done);

        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::OpenDone {
                version: 0,
                changes: vec![]
            }
        );
        assert!(res.lock.is_none());
    }

    #[tokio::test]
    async fn test_bad_token_is_rejected() {
        let pipeline = Pipeline::new(server(Some("secret")));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = pipeline.hooks().hub().connections().register(tx).await;

        let mut req = Request::new(conn, open("doc"), Some("wrong".to_string()));
        let mut res = Response::default();
        assert_eq!(pipeline.next(&mut req, &mut res).await, PipelineState::Done);

        match rx.try_recv().unwrap() {
            ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::SessionInvalid),
            other => panic!("unexpected {:?}", other),
        }
        assert!(pipeline.hooks().hub().connections().peers("doc").await.is_empty());
    }

    #[tokio::test]
    async fn test_good_token_is_accepted() {
        let pipeline = Pipeline::new(server(Some("secret")));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = pipeline.hooks().hub().connections().register(tx).await;

        let mut req = Request::new(conn, open("doc"), Some("secret".to_string()));
        let mut res = Response::default();
        assert_eq!(pipeline.next(&mut req, &mut res).await, PipelineState::Done);

        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::OpenDone { .. }));
    }

    #[tokio::test]
    async fn test_failed_commit_echoes_change_id() {
        let pipeline = Pipeline::new(server(None));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = pipeline.hooks().hub().connections().register(tx).await;

        let change = Change::new(vec![]);
        let id = change.id.clone();
        let commit = ClientMessage::Commit {
            doc_id: "doc".to_string(),
            version: 0,
            change,
        };
        let mut req = Request::new(conn, commit, None);
        let mut res = Response::default();
        assert_eq!(pipeline.next(&mut req, &mut res).await, PipelineState::Done);

        match rx.try_recv().unwrap() {
            ServerMessage::Error {
                kind, change_id, ..
            } => {
                assert_eq!(kind, ErrorKind::Protocol);
                assert_eq!(change_id, Some(id));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_hook_forgets_connection() {
        let pipeline = Pipeline::new(server(None));
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = pipeline.hooks().hub().connections().register(tx).await;

        pipeline.disconnected(conn).await;
        assert!(pipeline.hooks().hub().connections().is_empty().await);
    }
}
