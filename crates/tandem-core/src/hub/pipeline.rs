//! Request/response pipeline
//!
//! Every inbound message runs through the same stages:
//!
//! ```text
//! Initial -> Authenticated -> Authorized -> RequestEnhanced -> Executed -> Enhanced -> Done
//! ```
//!
//! The current stage is derived from the flags on [`Request`] and
//! [`Response`]; [`Pipeline::next`] runs the hook for it and repeats until
//! the stage stops changing. A hook that cannot finish yet returns without
//! touching the flags, and calling `next` again later resumes from there.
//! Setting `Response::error` at any stage diverts to `send_error`.

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use super::connections::ConnectionId;
use crate::error::CollabError;
use crate::sync::{ClientMessage, ServerMessage};

#[derive(Debug)]
pub struct Request {
    pub connection: ConnectionId,
    pub message: ClientMessage,
    /// Credential presented when the connection was opened
    pub token: Option<String>,
    pub authenticated: bool,
    pub authorized: bool,
    pub enhanced: bool,
}

impl Request {
    pub fn new(connection: ConnectionId, message: ClientMessage, token: Option<String>) -> Self {
        Self {
            connection,
            message,
            token,
            authenticated: false,
            authorized: false,
            enhanced: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct Response {
    /// Execution finished (with or without data)
    pub ready: bool,
    pub data: Option<ServerMessage>,
    pub enhanced: bool,
    pub sent: bool,
    pub error: Option<CollabError>,
    /// Change the error refers to, echoed back to the client
    pub change_id: Option<String>,
    /// Document lock held until the response is queued
    pub lock: Option<OwnedMutexGuard<()>>,
}

impl Response {
    pub fn fail(&mut self, err: CollabError) {
        self.error = Some(err);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Initial,
    Authenticated,
    Authorized,
    RequestEnhanced,
    Executed,
    Enhanced,
    Error,
    Done,
}

impl PipelineState {
    /// Derive the stage from the request and response flags
    ///
    /// `Done` and `Error` are checked first, so a failing stage never
    /// runs again.
    pub fn detect(req: &Request, res: &Response) -> Self {
        if res.sent {
            PipelineState::Done
        } else if res.error.is_some() {
            PipelineState::Error
        } else if !req.authenticated {
            PipelineState::Initial
        } else if !req.authorized {
            PipelineState::Authenticated
        } else if !req.enhanced {
            PipelineState::Authorized
        } else if !res.ready {
            PipelineState::RequestEnhanced
        } else if res.data.is_some() && !res.enhanced {
            PipelineState::Executed
        } else {
            PipelineState::Enhanced
        }
    }
}

/// Stage implementations
///
/// Every hook except `execute` has a pass-through default.
#[async_trait]
pub trait PipelineHooks: Send + Sync {
    async fn authenticate(&self, req: &mut Request, _res: &mut Response) {
        req.authenticated = true;
    }

    async fn authorize(&self, req: &mut Request, _res: &mut Response) {
        req.authorized = true;
    }

    async fn enhance_request(&self, req: &mut Request, _res: &mut Response) {
        req.enhanced = true;
    }

    /// Produce the response; set `res.ready` when done
    async fn execute(&self, req: &mut Request, res: &mut Response);

    async fn enhance_response(&self, _req: &mut Request, res: &mut Response) {
        res.enhanced = true;
    }

    async fn send_response(&self, _req: &mut Request, res: &mut Response) {
        res.lock = None;
        res.sent = true;
    }

    async fn send_error(&self, _req: &mut Request, res: &mut Response) {
        res.sent = true;
    }

    async fn on_connection(&self, _conn: ConnectionId) {}

    async fn on_disconnect(&self, _conn: ConnectionId) {}
}

pub struct Pipeline<H> {
    hooks: H,
}

impl<H: PipelineHooks> Pipeline<H> {
    pub fn new(hooks: H) -> Self {
        Self { hooks }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Advance the request as far as it can go
    ///
    /// Returns the stage it stopped at: `Done` once a response or error was
    /// sent, otherwise the stage whose hook deferred.
    pub async fn next(&self, req: &mut Request, res: &mut Response) -> PipelineState {
        loop {
            let state = PipelineState::detect(req, res);
            match state {
                PipelineState::Done => return state,
                PipelineState::Initial => self.hooks.authenticate(req, res).await,
                PipelineState::Authenticated => self.hooks.authorize(req, res).await,
                PipelineState::Authorized => self.hooks.enhance_request(req, res).await,
                PipelineState::RequestEnhanced => self.hooks.execute(req, res).await,
                PipelineState::Executed => self.hooks.enhance_response(req, res).await,
                PipelineState::Enhanced => self.hooks.send_response(req, res).await,
                PipelineState::Error => self.hooks.send_error(req, res).await,
            }
            if PipelineState::detect(req, res) == state {
                debug!("Pipeline for connection {} paused at {:?}", req.connection, state);
                return state;
            }
        }
    }

    pub async fn connected(&self, conn: ConnectionId) {
        self.hooks.on_connection(conn).await
    }

    pub async fn disconnected(&self, conn: ConnectionId) {
        self.hooks.on_disconnect(conn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::model::Change;

    /// Records the hooks that ran
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
        reject: bool,
        defer_execute: Mutex<bool>,
        reply: bool,
    }

    impl Recorder {
        fn record(&self, name: &'static str) {
            self.calls.lock().unwrap().push(name);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PipelineHooks for Recorder {
        async fn authenticate(&self, req: &mut Request, res: &mut Response) {
            self.record("authenticate");
            if self.reject {
                res.fail(CollabError::SessionInvalid("no token".to_string()));
            } else {
                req.authenticated = true;
            }
        }

        async fn execute(&self, _req: &mut Request, res: &mut Response) {
            self.record("execute");
            let mut defer = self.defer_execute.lock().unwrap();
            if *defer {
                *defer = false;
                return;
            }
            if self.reply {
                res.data = Some(ServerMessage::CommitDone {
                    version: 1,
                    changes: vec![],
                });
            }
            res.ready = true;
        }

        async fn enhance_response(&self, _req: &mut Request, res: &mut Response) {
            self.record("enhance_response");
            res.enhanced = true;
        }

        async fn send_response(&self, _req: &mut Request, res: &mut Response) {
            self.record("send_response");
            res.sent = true;
        }

        async fn send_error(&self, _req: &mut Request, res: &mut Response) {
            self.record("send_error");
            res.sent = true;
        }
    }

    fn request() -> Request {
        Request::new(
            1,
            ClientMessage::Commit {
                doc_id: "doc".to_string(),
                version: 0,
                change: Change::new(vec![]),
            },
            None,
        )
    }

    #[tokio::test]
    async fn test_full_run() {
        let pipeline = Pipeline::new(Recorder {
            reply: true,
            ..Default::default()
        });
        let (mut req, mut res) = (request(), Response::default());

        assert_eq!(pipeline.next(&mut req, &mut res).await, PipelineState::Done);
        assert_eq!(
            pipeline.hooks().calls(),
            vec!["authenticate", "execute", "enhance_response", "send_response"]
        );
        assert!(req.authorized && req.enhanced);
    }

    #[tokio::test]
    async fn test_no_data_skips_response_enhancement() {
        let pipeline = Pipeline::new(Recorder::default());
        let (mut req, mut res) = (request(), Response::default());

        assert_eq!(pipeline.next(&mut req, &mut res).await, PipelineState::Done);
        assert_eq!(
            pipeline.hooks().calls(),
            vec!["authenticate", "execute", "send_response"]
        );
    }

    #[tokio::test]
    async fn test_error_short_circuits() {
        let pipeline = Pipeline::new(Recorder {
            reject: true,
            ..Default::default()
        });
        let (mut req, mut res) = (request(), Response::default());

        assert_eq!(pipeline.next(&mut req, &mut res).await, PipelineState::Done);
        assert_eq!(pipeline.hooks().calls(), vec!["authenticate", "send_error"]);
        assert!(matches!(res.error, Some(CollabError::SessionInvalid(_))));
    }

    #[tokio::test]
    async fn test_deferred_stage_resumes() {
        let pipeline = Pipeline::new(Recorder {
            defer_execute: Mutex::new(true),
            reply: true,
            ..Default::default()
        });
        let (mut req, mut res) = (request(), Response::default());

        assert_eq!(
            pipeline.next(&mut req, &mut res).await,
            PipelineState::RequestEnhanced
        );
        assert_eq!(pipeline.next(&mut req, &mut res).await, PipelineState::Done);
        assert_eq!(
            pipeline.hooks().calls(),
            vec![
                "authenticate",
                "execute",
                "execute",
                "enhance_response",
                "send_response"
            ]
        );
    }

    #[test]
    fn test_detect_order() {
        let mut req = request();
        let mut res = Response::default();
        assert_eq!(PipelineState::detect(&req, &res), PipelineState::Initial);

        req.authenticated = true;
        assert_eq!(PipelineState::detect(&req, &res), PipelineState::Authenticated);
        req.authorized = true;
        assert_eq!(PipelineState::detect(&req, &res), PipelineState::Authorized);
        req.enhanced = true;
        assert_eq!(PipelineState::detect(&req, &res), PipelineState::RequestEnhanced);

        res.ready = true;
        res.data = Some(ServerMessage::CollaboratorLeft {
            session_id: "s".to_string(),
        });
        assert_eq!(PipelineState::detect(&req, &res), PipelineState::Executed);
        res.enhanced = true;
        assert_eq!(PipelineState::detect(&req, &res), PipelineState::Enhanced);

        res.error = Some(CollabError::TransportClosed);
        assert_eq!(PipelineState::detect(&req, &res), PipelineState::Error);
        res.sent = true;
        assert_eq!(PipelineState::detect(&req, &res), PipelineState::Done);
    }
}
