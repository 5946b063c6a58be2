//! Persistent session connection
//!
//! Runs a [`ClientSession`] against a hub over a long-lived WebSocket.
//! Handles reconnection automatically with exponential backoff; edits made
//! while offline are sent with the next `open`.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::debounce::DEFAULT_DEBOUNCE;
use super::message::{ClientMessage, ServerMessage};
use super::session::{ClientSession, SessionEvent};
use super::transaction::Transaction;
use crate::config::Config;
use crate::emitter::Emitter;
use crate::error::CollabResult;
use crate::history::DEFAULT_MAX_LEVELS;
use crate::model::Selection;

/// Local edit run inside the session task
pub type EditFn = Box<dyn FnOnce(&mut Transaction<'_>) -> CollabResult<()> + Send>;

/// Commands sent to the session task
pub enum SessionCommand {
    Edit(EditFn),
    SetSelection(Selection),
    Undo,
    Redo,
    /// Close the connection and stop the task
    Shutdown,
}

impl fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionCommand::Edit(_) => f.write_str("Edit"),
            SessionCommand::SetSelection(sel) => f.debug_tuple("SetSelection").field(sel).finish(),
            SessionCommand::Undo => f.write_str("Undo"),
            SessionCommand::Redo => f.write_str("Redo"),
            SessionCommand::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not connected, not trying
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Document open, edits flowing
    Connected,
    /// The hub refused the session; no further attempts are made
    Rejected,
}

/// Frame encoding used on the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameFormat {
    /// JSON text frames
    #[default]
    Text,
    /// CBOR binary frames
    Binary,
}

/// Handle to control the session task
pub struct SessionHandle {
    /// Send commands to the session task
    pub command_tx: mpsc::UnboundedSender<SessionCommand>,
    /// Events published by the session
    pub event_rx: mpsc::UnboundedReceiver<SessionEvent>,
    /// Watch connection status
    pub status_rx: watch::Receiver<ConnectionStatus>,
    /// Resolves to the session once the task stops
    pub task: JoinHandle<ClientSession>,
}

impl SessionHandle {
    pub fn edit<F>(&self, edit: F) -> bool
    where
        F: FnOnce(&mut Transaction<'_>) -> CollabResult<()> + Send + 'static,
    {
        self.command_tx
            .send(SessionCommand::Edit(Box::new(edit)))
            .is_ok()
    }

    /// Stop the task and hand back the session
    pub async fn shutdown(self) -> Option<ClientSession> {
        let _ = self.command_tx.send(SessionCommand::Shutdown);
        self.task.await.ok()
    }
}

/// Configuration for the session task
#[derive(Debug, Clone)]
pub struct SessionTaskConfig {
    /// Hub WebSocket URL
    pub url: String,
    /// Shared secret appended as the `token` query parameter
    pub auth_token: Option<String>,
    pub frame_format: FrameFormat,
    /// How often buffered edits are committed
    pub tick_interval: Duration,
    /// Initial reconnect delay
    pub initial_reconnect_delay: Duration,
    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,
    /// Undo levels kept by the session
    pub history_limit: usize,
    /// Quiet period before a selection change is broadcast
    pub selection_debounce: Duration,
}

impl Default for SessionTaskConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            auth_token: None,
            frame_format: FrameFormat::Text,
            tick_interval: Duration::from_secs(1),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            history_limit: DEFAULT_MAX_LEVELS,
            selection_debounce: DEFAULT_DEBOUNCE,
        }
    }
}

impl SessionTaskConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.server_url.clone().unwrap_or_default(),
            auth_token: config.auth_token.clone(),
            frame_format: FrameFormat::Text,
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            initial_reconnect_delay: Duration::from_millis(config.initial_reconnect_delay_ms),
            max_reconnect_delay: Duration::from_millis(config.max_reconnect_delay_ms),
            history_limit: config.history_limit,
            selection_debounce: Duration::from_millis(config.selection_debounce_ms),
        }
    }

    /// URL to dial, with the auth token attached
    pub fn connect_url(&self) -> String {
        match &self.auth_token {
            Some(token) => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}token={}", self.url, sep, token)
            }
            None => self.url.clone(),
        }
    }
}

enum RunOutcome {
    Shutdown,
    Closed,
    Rejected,
}

/// Spawn a persistent session task
///
/// Returns a handle to control and monitor the task.
/// The task will automatically reconnect on disconnection.
pub fn spawn_session_task(config: SessionTaskConfig, mut session: ClientSession) -> SessionHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
    let (_, event_rx) = session.subscribe();
    session.set_history_limit(config.history_limit);
    session.set_selection_debounce(config.selection_debounce);

    let task = tokio::spawn(session_task_loop(config, session, command_rx, status_tx));

    SessionHandle {
        command_tx,
        event_rx,
        status_rx,
        task,
    }
}

/// Main task loop with reconnection
async fn session_task_loop(
    config: SessionTaskConfig,
    mut session: ClientSession,
    mut command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    status_tx: watch::Sender<ConnectionStatus>,
) -> ClientSession {
    let mut reconnect_delay = config.initial_reconnect_delay;

    loop {
        let _ = status_tx.send(ConnectionStatus::Connecting);

        match connect_and_run(&config, &mut session, &mut command_rx, &status_tx).await {
            Ok(RunOutcome::Shutdown) => {
                session.on_disconnect();
                break;
            }
            Ok(RunOutcome::Rejected) => {
                let _ = status_tx.send(ConnectionStatus::Rejected);
                return session;
            }
            Ok(RunOutcome::Closed) => {
                // Connection closed normally, reset backoff
                reconnect_delay = config.initial_reconnect_delay;
            }
            Err(e) => {
                warn!("Connection error: {}", e);
            }
        }

        session.on_disconnect();
        let _ = status_tx.send(ConnectionStatus::Disconnected);

        // Wait before reconnecting; keep accepting offline edits meanwhile
        let deadline = Instant::now() + reconnect_delay;
        let mut shutdown = false;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                cmd = command_rx.recv() => match cmd {
                    Some(SessionCommand::Shutdown) | None => {
                        shutdown = true;
                        break;
                    }
                    Some(cmd) => run_command(&mut session, cmd),
                }
            }
        }
        if shutdown {
            break;
        }
        // Exponential backoff
        reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay);
    }

    let _ = status_tx.send(ConnectionStatus::Disconnected);
    session
}

/// Connect, open the document and run until disconnection or shutdown
async fn connect_and_run(
    config: &SessionTaskConfig,
    session: &mut ClientSession,
    command_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
    status_tx: &watch::Sender<ConnectionStatus>,
) -> Result<RunOutcome> {
    let (ws_stream, _) = connect_async(config.connect_url()).await?;
    let (mut write, mut read) = ws_stream.split();

    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
    session.open(outbox_tx)?;
    let _ = status_tx.send(ConnectionStatus::Connected);
    info!("Connected to {}", config.url);

    let mut ticker = tokio::time::interval(config.tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let selection_deadline = session.selection_deadline();

        tokio::select! {
            Some(msg) = outbox_rx.recv() => {
                write.send(encode_frame(&msg, config.frame_format)?).await?;
            }

            msg = read.next() => {
                let decoded = match msg {
                    Some(Ok(Message::Text(text))) => ServerMessage::decode_json(&text),
                    Some(Ok(Message::Binary(data))) => ServerMessage::decode_cbor(&data),
                    Some(Ok(Message::Close(_))) | None => return Ok(RunOutcome::Closed),
                    Some(Err(e)) => return Err(e.into()),
                    _ => continue,
                };
                match decoded {
                    Ok(msg) => {
                        debug!("Received {}", msg.tag());
                        if let Err(e) = session.handle_server_message(msg) {
                            // Local state no longer matches the hub; reopen to resync
                            warn!("Failed to apply server message: {}", e);
                            write.close().await.ok();
                            return Ok(RunOutcome::Closed);
                        }
                        if session.is_invalidated() {
                            write.close().await.ok();
                            return Ok(RunOutcome::Rejected);
                        }
                        if session.needs_resync() {
                            info!("Reopening '{}' to resync", session.doc_id());
                            write.close().await.ok();
                            return Ok(RunOutcome::Closed);
                        }
                    }
                    Err(e) => warn!("Ignoring malformed message: {}", e),
                }
            }

            _ = ticker.tick() => {
                session.tick()?;
            }

            _ = wait_until(selection_deadline) => {
                session.flush_selection(Instant::now())?;
            }

            cmd = command_rx.recv() => {
                match cmd {
                    Some(SessionCommand::Shutdown) | None => {
                        // Flush what we can before leaving
                        session.tick().ok();
                        while let Ok(msg) = outbox_rx.try_recv() {
                            write.send(encode_frame(&msg, config.frame_format)?).await.ok();
                        }
                        write.close().await.ok();
                        return Ok(RunOutcome::Shutdown);
                    }
                    Some(cmd) => run_command(session, cmd),
                }
            }
        }
    }
}

fn run_command(session: &mut ClientSession, cmd: SessionCommand) {
    let result = match cmd {
        SessionCommand::Edit(edit) => session.transaction(edit).map(|_| ()),
        SessionCommand::SetSelection(selection) => {
            session.set_selection(selection, Instant::now());
            Ok(())
        }
        SessionCommand::Undo => session.undo().map(|_| ()),
        SessionCommand::Redo => session.redo().map(|_| ()),
        SessionCommand::Shutdown => Ok(()),
    };
    if let Err(e) = result {
        warn!("Command failed: {}", e);
    }
}

fn encode_frame(msg: &ClientMessage, format: FrameFormat) -> CollabResult<Message> {
    Ok(match format {
        FrameFormat::Text => Message::Text(msg.encode_json()?),
        FrameFormat::Binary => Message::Binary(msg.encode_cbor()?),
    })
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionTaskConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.initial_reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.max_reconnect_delay, Duration::from_secs(30));
        assert_eq!(config.frame_format, FrameFormat::Text);
    }

    #[test]
    fn test_connect_url_carries_token() {
        let mut config = SessionTaskConfig {
            url: "ws://localhost:7878/".to_string(),
            ..Default::default()
        };
        assert_eq!(config.connect_url(), "ws://localhost:7878/");

        config.auth_token = Some("s3cret".to_string());
        assert_eq!(config.connect_url(), "ws://localhost:7878/?token=s3cret");

        config.url = "ws://localhost:7878/?doc=a".to_string();
        assert_eq!(config.connect_url(), "ws://localhost:7878/?doc=a&token=s3cret");
    }

    #[test]
    fn test_from_config() {
        let config = Config {
            server_url: Some("ws://hub:7878".to_string()),
            tick_interval_ms: 500,
            history_limit: 7,
            selection_debounce_ms: 40,
            ..Config::default()
        };
        let task_config = SessionTaskConfig::from_config(&config);
        assert_eq!(task_config.url, "ws://hub:7878");
        assert_eq!(task_config.tick_interval, Duration::from_millis(500));
        assert_eq!(task_config.history_limit, 7);
        assert_eq!(task_config.selection_debounce, Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_task_applies_session_limits() {
        let config = SessionTaskConfig {
            // Nothing listens here; the task just keeps retrying
            url: "ws://127.0.0.1:9".to_string(),
            history_limit: 3,
            selection_debounce: Duration::from_millis(40),
            ..Default::default()
        };
        let session = ClientSession::new("doc", crate::model::Document::new(), 0);
        let handle = spawn_session_task(config, session);

        let session = handle.shutdown().await.unwrap();
        assert_eq!(session.history().max_levels(), 3);
        assert_eq!(session.selection_debounce(), Duration::from_millis(40));
    }

    #[test]
    fn test_command_debug() {
        let cmd = SessionCommand::Edit(Box::new(|_: &mut Transaction<'_>| -> CollabResult<()> {
            Ok(())
        }));
        assert_eq!(format!("{:?}", cmd), "Edit");
        assert_eq!(format!("{:?}", SessionCommand::Undo), "Undo");
    }
}
