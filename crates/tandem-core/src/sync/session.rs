//! Client-side collaboration session
//!
//! A [`ClientSession`] owns the local copy of one document and keeps it in
//! step with the hub. Local edits are applied immediately and buffered; at
//! most one commit is in flight at a time. Remote changes are transformed
//! against the unconfirmed local work before they are applied.
//!
//! The session does no I/O itself: outbound messages go to the channel given
//! to [`ClientSession::open`], inbound messages are fed to
//! [`ClientSession::handle_server_message`]. See `persistent` for the task
//! that wires it to a WebSocket.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::collaborators::{Collaborator, Collaborators};
use super::debounce::{Debouncer, DEFAULT_DEBOUNCE};
use super::message::{ClientMessage, ServerMessage};
use super::transaction::Transaction;
use crate::emitter::{Emitter, EventBus, SubscriptionId};
use crate::error::{CollabError, CollabResult, ErrorKind};
use crate::history::{ChangeHistory, DEFAULT_MAX_LEVELS};
use crate::model::{Change, Document, Selection};
use crate::transform::{transform, transform_selection};

/// Events published by a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A remote change was applied to the local document
    DocumentUpdated(Change),
    /// A local change (edit, undo or redo) was recorded
    LocalChange(Change),
    /// The hub accepted our commit and the session reached `version`
    CommitConfirmed { version: u64 },
    CollaboratorUpdated(Collaborator),
    CollaboratorLeft(String),
    /// The hub rejected a commit; it has been taken out of the local document
    Rescue { change: Change, message: String },
    /// The hub refused the session; the user must sign in again
    SessionInvalid(String),
    /// The hub no longer has the history the local copy was built on; the
    /// copy was dropped and is reloaded from version 0
    Reset(String),
    Disconnected,
}

/// Client view of one shared document
#[derive(Debug)]
pub struct ClientSession {
    doc_id: String,
    session_id: String,
    version: u64,
    document: Document,
    /// Local edits not yet sent
    pending: Option<Change>,
    /// Sent, waiting for `commitDone`/`openDone`
    in_flight: Option<Change>,
    committing: bool,
    /// `open` sent, `openDone` not yet received
    opening: bool,
    /// Local state no longer lines up with the connection; reopen before
    /// handling anything else
    resync: bool,
    invalidated: bool,
    collaborators: Collaborators,
    selection: Selection,
    history: ChangeHistory,
    events: EventBus<SessionEvent>,
    debouncer: Debouncer,
    outbox: Option<mpsc::UnboundedSender<ClientMessage>>,
}

impl ClientSession {
    /// Start a session for a document the client holds at `version`
    pub fn new(doc_id: impl Into<String>, document: Document, version: u64) -> Self {
        Self {
            doc_id: doc_id.into(),
            session_id: Uuid::new_v4().to_string(),
            version,
            document,
            pending: None,
            in_flight: None,
            committing: false,
            opening: false,
            resync: false,
            invalidated: false,
            collaborators: Collaborators::new(),
            selection: Selection::Null,
            history: ChangeHistory::with_max_levels(DEFAULT_MAX_LEVELS),
            events: EventBus::new(),
            debouncer: Debouncer::new(DEFAULT_DEBOUNCE),
            outbox: None,
        }
    }

    pub fn with_history_limit(mut self, max_levels: usize) -> Self {
        self.set_history_limit(max_levels);
        self
    }

    pub fn with_selection_debounce(mut self, delay: Duration) -> Self {
        self.set_selection_debounce(delay);
        self
    }

    pub fn set_history_limit(&mut self, max_levels: usize) {
        self.history.set_max_levels(max_levels);
    }

    pub fn set_selection_debounce(&mut self, delay: Duration) {
        self.debouncer = Debouncer::new(delay);
    }

    pub fn selection_debounce(&self) -> Duration {
        self.debouncer.delay()
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn pending(&self) -> Option<&Change> {
        self.pending.as_ref()
    }

    pub fn in_flight(&self) -> Option<&Change> {
        self.in_flight.as_ref()
    }

    pub fn is_committing(&self) -> bool {
        self.committing
    }

    pub fn is_connected(&self) -> bool {
        self.outbox.is_some()
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// True when the document has to be opened again on a fresh connection
    pub fn needs_resync(&self) -> bool {
        self.resync
    }

    /// True when every local edit has been confirmed by the hub
    pub fn is_synced(&self) -> bool {
        self.pending.is_none() && self.in_flight.is_none()
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn history(&self) -> &ChangeHistory {
        &self.history
    }

    /// Deadline of the pending selection broadcast, if any
    pub fn selection_deadline(&self) -> Option<Instant> {
        self.debouncer.deadline()
    }

    /// Attach a connection and (re)open the document
    ///
    /// An unconfirmed commit is resent as-is so the hub can recognise it by
    /// id; otherwise buffered edits ride along with the open request.
    pub fn open(&mut self, outbox: mpsc::UnboundedSender<ClientMessage>) -> CollabResult<()> {
        self.outbox = Some(outbox);
        self.resync = false;
        self.opening = true;
        if self.in_flight.is_none() {
            self.in_flight = self.pending.take();
        }
        let change = self.in_flight.clone();
        self.committing = change.is_some();
        info!(
            "Opening '{}' at version {} (resending: {})",
            self.doc_id,
            self.version,
            change.is_some()
        );
        self.send(ClientMessage::Open {
            doc_id: self.doc_id.clone(),
            version: self.version,
            change,
        })
    }

    /// Buffer a change that has already been applied to the local document
    pub fn commit_local_change(&mut self, change: Change) {
        if change.is_empty() {
            return;
        }
        let change = change.with_session(self.session_id.clone());
        self.events.emit(SessionEvent::LocalChange(change.clone()));
        match self.pending.as_mut() {
            Some(pending) => pending.merge(change),
            None => self.pending = Some(change),
        }
    }

    /// Run a local edit
    ///
    /// Each step is applied to the document as it is made. If the closure
    /// fails, the applied steps are inverted and nothing else changes.
    pub fn transaction<F>(&mut self, edit: F) -> CollabResult<Option<Change>>
    where
        F: FnOnce(&mut Transaction<'_>) -> CollabResult<()>,
    {
        let mut tx = Transaction::new(&mut self.document, self.selection.clone());
        if let Err(err) = edit(&mut tx) {
            tx.rollback();
            return Err(err);
        }
        if tx.is_empty() {
            self.selection = tx.selection().clone();
            return Ok(None);
        }
        let change = tx.finish().with_session(self.session_id.clone());
        self.selection = change.after.selection.clone();
        self.history.commit(change.clone());
        self.commit_local_change(change.clone());
        Ok(Some(change))
    }

    /// Send buffered edits if no commit is outstanding
    ///
    /// Returns true when a commit was sent.
    pub fn tick(&mut self) -> CollabResult<bool> {
        if self.committing || self.opening || self.resync || self.outbox.is_none() {
            return Ok(false);
        }
        let Some(change) = self.pending.take() else {
            return Ok(false);
        };
        let msg = ClientMessage::Commit {
            doc_id: self.doc_id.clone(),
            version: self.version,
            change: change.clone(),
        };
        if let Err(err) = self.send(msg) {
            self.pending = Some(change);
            return Err(err);
        }
        debug!(
            "Committed {} ops to '{}' at version {}",
            change.ops.len(),
            self.doc_id,
            self.version
        );
        self.in_flight = Some(change);
        self.committing = true;
        Ok(true)
    }

    /// Dispatch a message from the hub
    pub fn handle_server_message(&mut self, msg: ServerMessage) -> CollabResult<()> {
        if self.resync {
            debug!("Dropping {} for '{}' until it is reopened", msg.tag(), self.doc_id);
            return Ok(());
        }
        match msg {
            ServerMessage::OpenDone { version, changes } => self.on_open_done(version, changes),
            ServerMessage::CommitDone { version, changes } => {
                self.on_commit_done(version, changes)
            }
            ServerMessage::Update { version, change } => {
                if version <= self.version {
                    debug!("Skipping update {} (at {})", version, self.version);
                    return Ok(());
                }
                if version > self.version + 1 {
                    warn!(
                        "Missed versions {}..{} of '{}'; reopening",
                        self.version + 1,
                        version - 1,
                        self.doc_id
                    );
                    self.resync = true;
                    return Ok(());
                }
                self.apply_remote_change(change)?;
                self.version = version;
                Ok(())
            }
            ServerMessage::UpdateSelection { change, .. } => {
                self.on_update_selection(change);
                Ok(())
            }
            ServerMessage::CollaboratorLeft { session_id } => {
                self.on_collaborator_left(&session_id);
                Ok(())
            }
            ServerMessage::Error {
                kind,
                message,
                change_id,
            } => {
                self.on_error(kind, &message, change_id.as_deref());
                Ok(())
            }
        }
    }

    pub fn on_open_done(&mut self, version: u64, changes: Vec<Change>) -> CollabResult<()> {
        self.opening = false;
        self.apply_server_changes(version, changes)
    }

    pub fn on_commit_done(&mut self, version: u64, changes: Vec<Change>) -> CollabResult<()> {
        self.apply_server_changes(version, changes)
    }

    fn apply_server_changes(&mut self, version: u64, changes: Vec<Change>) -> CollabResult<()> {
        for change in changes {
            if self.in_flight.as_ref().map(|c| &c.id) == Some(&change.id) {
                // Our own commit, already part of the local document
                self.in_flight = None;
                if let Some(v) = change.info.version {
                    self.version = self.version.max(v);
                }
                continue;
            }
            if matches!(change.info.version, Some(v) if v <= self.version) {
                continue;
            }
            let change_version = change.info.version;
            self.apply_remote_change(change)?;
            if self.resync {
                return Ok(());
            }
            if let Some(v) = change_version {
                self.version = self.version.max(v);
            }
        }

        let confirmed = self.in_flight.take().is_some();
        self.committing = false;
        self.version = self.version.max(version);
        if confirmed || self.pending.is_none() {
            self.events.emit(SessionEvent::CommitConfirmed {
                version: self.version,
            });
        }
        Ok(())
    }

    /// Apply a change made by another session
    ///
    /// The change is moved past our unconfirmed work (in-flight first, then
    /// pending) so it applies on top of the local document; the unconfirmed
    /// work is rebased in the same step. Local work the change cannot be
    /// moved past is given up (see [`SessionEvent::Rescue`]). On error the
    /// session is unchanged.
    pub fn apply_remote_change(&mut self, change: Change) -> CollabResult<()> {
        let mut incoming = change.clone();
        let mut in_flight = self.in_flight.clone();
        let mut pending = self.pending.clone();
        match rebase_and_apply(
            &mut self.document,
            &mut incoming,
            in_flight.as_mut(),
            pending.as_mut(),
        ) {
            Ok(()) => {
                self.in_flight = in_flight;
                self.pending = pending;
            }
            Err(err) => incoming = self.apply_over_local_work(change, &err)?,
        }
        self.finish_remote_change(incoming);
        Ok(())
    }

    /// Apply a remote change that conflicts with unconfirmed local work
    ///
    /// Pending edits are dropped first. If the in-flight commit is in the
    /// way as well it is dropped too, and the session asks to be reopened:
    /// the hub's answer to that commit can no longer be matched.
    fn apply_over_local_work(
        &mut self,
        change: Change,
        cause: &CollabError,
    ) -> CollabResult<Change> {
        warn!(
            "Remote change {} conflicts with local work on '{}': {}",
            change.id, self.doc_id, cause
        );
        let message = cause.to_string();

        if let Some(pending) = &self.pending {
            let inverse = pending.invert();
            let mut document = self.document.clone();
            let mut incoming = change.clone();
            let mut in_flight = self.in_flight.clone();
            if document.apply_change(&inverse).is_ok()
                && rebase_and_apply(&mut document, &mut incoming, in_flight.as_mut(), None).is_ok()
            {
                self.document = document;
                self.in_flight = in_flight;
                transform_selection(&mut self.selection, &inverse.ops);
                let dropped = self.pending.take().into_iter().collect();
                self.give_up(dropped, &message);
                return Ok(incoming);
            }
        }

        let mut document = self.document.clone();
        let mut reverted = Vec::new();
        for local in [self.pending.as_ref(), self.in_flight.as_ref()]
            .into_iter()
            .flatten()
        {
            let inverse = local.invert();
            document.apply_change(&inverse)?;
            reverted.push(inverse);
        }
        document.apply_change(&change)?;

        self.document = document;
        for inverse in &reverted {
            transform_selection(&mut self.selection, &inverse.ops);
        }
        if self.in_flight.is_some() {
            self.committing = false;
            self.resync = true;
        }
        let dropped = [self.in_flight.take(), self.pending.take()]
            .into_iter()
            .flatten()
            .collect();
        self.give_up(dropped, &message);
        Ok(change)
    }

    fn finish_remote_change(&mut self, change: Change) {
        transform_selection(&mut self.selection, &change.ops);
        let origin = change.session_id.clone();
        for collaborator in self.collaborators.iter_mut() {
            if Some(&collaborator.session_id) != origin.as_ref() {
                transform_selection(&mut collaborator.selection, &change.ops);
            }
        }
        self.history.rebase(&change);

        if let Some(origin) = origin.filter(|id| *id != self.session_id) {
            let collaborator = self
                .collaborators
                .upsert(&origin, change.after.selection.clone())
                .clone();
            self.events
                .emit(SessionEvent::CollaboratorUpdated(collaborator));
        }
        self.events.emit(SessionEvent::DocumentUpdated(change));
    }

    /// Record a collaborator's selection relayed by the hub
    pub fn on_update_selection(&mut self, change: Change) {
        let Some(origin) = change.session_id.clone() else {
            return;
        };
        if origin == self.session_id {
            return;
        }
        let mut selection = change.after.selection;
        if let Some(in_flight) = &self.in_flight {
            transform_selection(&mut selection, &in_flight.ops);
        }
        if let Some(pending) = &self.pending {
            transform_selection(&mut selection, &pending.ops);
        }
        let collaborator = self.collaborators.upsert(&origin, selection).clone();
        self.events
            .emit(SessionEvent::CollaboratorUpdated(collaborator));
    }

    pub fn on_collaborator_left(&mut self, session_id: &str) {
        if self.collaborators.remove(session_id).is_some() {
            self.events
                .emit(SessionEvent::CollaboratorLeft(session_id.to_string()));
        }
    }

    /// Update the local selection and schedule its broadcast
    pub fn set_selection(&mut self, selection: Selection, now: Instant) {
        self.selection = selection;
        self.debouncer.schedule(now);
    }

    /// Broadcast the local selection once the debounce delay has passed
    ///
    /// Returns true when a selection update was sent.
    pub fn flush_selection(&mut self, now: Instant) -> CollabResult<bool> {
        if self.outbox.is_none() || !self.debouncer.fire_if_due(now) {
            return Ok(false);
        }
        let change =
            Change::selection_only(self.selection.clone()).with_session(self.session_id.clone());
        self.send(ClientMessage::UpdateSelection {
            doc_id: self.doc_id.clone(),
            version: self.version,
            change,
        })?;
        Ok(true)
    }

    /// Undo the last local change and commit the inverse
    pub fn undo(&mut self) -> CollabResult<Option<Change>> {
        let Some(change) = self.history.undo(&mut self.document)? else {
            return Ok(None);
        };
        Ok(Some(self.record_replay(change)))
    }

    /// Redo the last undone change and commit it again
    pub fn redo(&mut self) -> CollabResult<Option<Change>> {
        let Some(change) = self.history.redo(&mut self.document)? else {
            return Ok(None);
        };
        Ok(Some(self.record_replay(change)))
    }

    fn record_replay(&mut self, change: Change) -> Change {
        let change = change.with_session(self.session_id.clone());
        self.selection = change.after.selection.clone();
        self.commit_local_change(change.clone());
        change
    }

    /// The transport went away; unconfirmed work is kept for the next open
    pub fn on_disconnect(&mut self) {
        if self.outbox.take().is_some() {
            info!("Session for '{}' disconnected", self.doc_id);
        }
        self.committing = false;
        self.opening = false;
        self.debouncer.cancel();
        self.events.emit(SessionEvent::Disconnected);
    }

    /// Handle an error reported by the hub
    ///
    /// A failed `open` leaves the connection outside the document, so the
    /// session asks to be reopened once the rejected work is rescued.
    pub fn on_error(&mut self, kind: ErrorKind, message: &str, change_id: Option<&str>) {
        match kind {
            ErrorKind::SessionInvalid => {
                warn!("Session rejected by hub: {}", message);
                self.invalidated = true;
                self.outbox = None;
                self.committing = false;
                self.opening = false;
                self.events
                    .emit(SessionEvent::SessionInvalid(message.to_string()));
                return;
            }
            ErrorKind::VersionMismatch => {
                self.discard_local_copy(message);
                return;
            }
            _ => {}
        }

        let rejected = match (&self.in_flight, change_id) {
            (Some(in_flight), Some(id)) => in_flight.id == id,
            (Some(_), None) => self.committing,
            (None, _) => false,
        };
        let failed_open = self.opening;
        match self.in_flight.take() {
            Some(change) if rejected => {
                self.committing = false;
                self.rescue(change, message);
            }
            in_flight => {
                self.in_flight = in_flight;
                warn!("Hub reported {}: {}", kind.as_str(), message);
            }
        }
        if failed_open {
            self.opening = false;
            self.committing = false;
            self.resync = true;
        }
    }

    /// Take a rejected commit out of the local document
    fn rescue(&mut self, change: Change, message: &str) {
        warn!("Commit {} rejected: {}", change.id, message);
        let mut inverse = change.invert();
        let mut pending = self.pending.clone();
        match rebase_and_apply(&mut self.document, &mut inverse, None, pending.as_mut()) {
            Ok(()) => {
                self.pending = pending;
                transform_selection(&mut self.selection, &inverse.ops);
                self.history.clear();
            }
            Err(err) => self.discard_local_copy(&format!(
                "could not revert rejected commit {}: {}",
                change.id, err
            )),
        }
        self.events.emit(SessionEvent::Rescue {
            change,
            message: message.to_string(),
        });
    }

    /// Rescue unconfirmed changes that were dropped locally
    fn give_up(&mut self, changes: Vec<Change>, message: &str) {
        self.history.clear();
        for change in changes {
            warn!("Dropped local change {}: {}", change.id, message);
            self.events.emit(SessionEvent::Rescue {
                change,
                message: message.to_string(),
            });
        }
    }

    /// Drop the local copy and reload the document from version 0
    fn discard_local_copy(&mut self, message: &str) {
        warn!(
            "Discarding local copy of '{}' at version {}: {}",
            self.doc_id, self.version, message
        );
        let dropped = [self.in_flight.take(), self.pending.take()]
            .into_iter()
            .flatten()
            .collect();
        self.give_up(dropped, message);
        self.document = Document::new();
        self.version = 0;
        self.selection = Selection::Null;
        self.committing = false;
        self.opening = false;
        self.resync = true;
        self.events.emit(SessionEvent::Reset(message.to_string()));
    }

    fn send(&mut self, msg: ClientMessage) -> CollabResult<()> {
        let outbox = self.outbox.as_ref().ok_or(CollabError::TransportClosed)?;
        if outbox.send(msg).is_err() {
            self.outbox = None;
            return Err(CollabError::TransportClosed);
        }
        Ok(())
    }
}

/// Move `change` past unconfirmed local work and apply it
///
/// The document is untouched on error; the local changes may not be, so
/// callers pass copies.
fn rebase_and_apply(
    document: &mut Document,
    change: &mut Change,
    in_flight: Option<&mut Change>,
    pending: Option<&mut Change>,
) -> CollabResult<()> {
    for local in [in_flight, pending].into_iter().flatten() {
        transform(change, local)?;
    }
    document.apply_change(change)
}

impl Emitter<SessionEvent> for ClientSession {
    fn subscribe(&mut self) -> (SubscriptionId, mpsc::UnboundedReceiver<SessionEvent>) {
        self.events.subscribe()
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    fn emit(&mut self, event: SessionEvent) {
        self.events.emit(event)
    }
}
