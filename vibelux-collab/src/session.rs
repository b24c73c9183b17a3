//! Public façade: one [`CollaborationSession`] per (document, user).
//!
//! Calls are commands into the session's connection actor; sends never
//! wait for delivery. Events come back on a broadcast channel, either
//! unfiltered ([`CollaborationSession::subscribe`]) or restricted to a set
//! of [`EventKind`]s ([`CollaborationSession::subscribe_to`]).

use std::collections::HashSet;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::SessionConfig;
use crate::connection::{Command, ConnectionManager, ConnectionState, Query};
use crate::error::{CollabError, Result};
use crate::model::{Comment, CommentDraft, CursorPosition, Presence, PresencePatch, Selection};
use crate::ot::Operation;
use crate::protocol::CollaborationEvent;
use crate::router::{EventKind, SessionEvent};

pub struct CollaborationSession {
    config: SessionConfig,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
}

impl CollaborationSession {
    /// Create a session and start its connection actor (not yet connected).
    ///
    /// Must be called from within a Tokio runtime. Anything sent before
    /// [`connect`](Self::connect) is queued and replayed once connected.
    pub fn new(config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (commands, _handle) = ConnectionManager::spawn(config.clone(), events.clone());
        Self {
            config,
            commands,
            events,
        }
    }

    /// Open the connection. Configuration errors are returned and nothing
    /// is attempted; a transport failure is returned too, but a reconnect
    /// is already scheduled.
    pub async fn connect(&self) -> Result<()> {
        self.config.validate()?;
        let (ack, outcome) = oneshot::channel();
        self.command(Command::Connect(ack))?;
        outcome.await.map_err(|_| CollabError::ConnectionClosed)?
    }

    /// Close the connection and stop every timer. Returns once the
    /// transport is released.
    pub async fn disconnect(&self) {
        let (ack, done) = oneshot::channel();
        if self.command(Command::Disconnect(ack)).is_ok() {
            let _ = done.await;
        }
    }

    pub fn send_cursor(&self, position: CursorPosition) -> Result<()> {
        self.send(CollaborationEvent::cursor(self.user_id(), position))
    }

    pub fn send_selection(&self, selection: &Selection) -> Result<()> {
        self.send(CollaborationEvent::selection(self.user_id(), selection))
    }

    /// Send a local edit that is already applied to the local document.
    ///
    /// Edits go out one at a time; each waits for the hub to acknowledge
    /// the previous one, and remote edits arriving meanwhile are rebased
    /// over the ones still waiting before they are delivered.
    ///
    /// `version` is the version of the last `Edit` or `Sync` event the
    /// caller applied. If the session has delivered a newer one since, the
    /// edit is refused with an `Error` event and must be redone on top of
    /// it. `None` skips the check.
    pub fn send_edit(&self, operation: Operation, version: Option<u64>) -> Result<()> {
        self.command(Command::SendEdit { operation, version })
    }

    /// Publish a new comment (or a new revision of one with a known id).
    pub fn send_comment(&self, draft: CommentDraft) -> Result<Comment> {
        let comment = draft.into_comment(self.user_id());
        self.command(Command::SendComment(comment.clone()))?;
        Ok(comment)
    }

    pub fn reply_to_comment(&self, parent: &Comment, text: impl Into<String>) -> Result<Comment> {
        let mut thread = parent.clone();
        thread.add_reply(CommentDraft::new(text).into_comment(self.user_id()));
        self.command(Command::SendComment(thread.clone()))?;
        Ok(thread)
    }

    pub fn resolve_comment(&self, comment: &Comment) -> Result<Comment> {
        let mut thread = comment.clone();
        thread.resolve();
        self.command(Command::SendComment(thread.clone()))?;
        Ok(thread)
    }

    /// Merge into the local presence and broadcast it.
    pub fn update_presence(&self, patch: PresencePatch) -> Result<()> {
        self.command(Command::UpdatePresence(patch))
    }

    /// Ask the hub for an authoritative snapshot.
    pub fn request_sync(&self) -> Result<()> {
        self.command(Command::RequestSync)
    }

    pub async fn active_users(&self) -> Result<Vec<Presence>> {
        self.query(Query::ActiveUsers).await
    }

    pub async fn document_version(&self) -> Result<u64> {
        self.query(Query::DocumentVersion).await
    }

    pub async fn comments(&self) -> Result<Vec<Comment>> {
        self.query(Query::Comments).await
    }

    pub async fn connection_state(&self) -> Result<ConnectionState> {
        self.query(Query::State).await
    }

    /// Number of events waiting for the connection.
    pub async fn queued_events(&self) -> Result<usize> {
        self.query(Query::QueuedEvents).await
    }

    /// Local edits the hub has not acknowledged yet.
    pub async fn pending_edits(&self) -> Result<usize> {
        self.query(Query::PendingEdits).await
    }

    /// Receive every session event.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Receive only events of the given kinds.
    pub fn subscribe_to(&self, kinds: impl IntoIterator<Item = EventKind>) -> Subscription {
        Subscription {
            rx: self.events.subscribe(),
            kinds: kinds.into_iter().collect(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn user_id(&self) -> &str {
        self.config.user_id()
    }

    fn send(&self, event: CollaborationEvent) -> Result<()> {
        self.command(Command::Send {
            event,
            activity: true,
        })
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| CollabError::ConnectionClosed)
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Query) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Query(make(reply)))?;
        rx.await.map_err(|_| CollabError::ConnectionClosed)
    }
}

/// A filtered event stream from [`CollaborationSession::subscribe_to`].
pub struct Subscription {
    rx: broadcast::Receiver<SessionEvent>,
    kinds: HashSet<EventKind>,
}

impl Subscription {
    /// Next matching event, or `None` once the session is gone.
    ///
    /// A slow subscriber loses the oldest events; the gap is logged and
    /// delivery resumes.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.kinds.contains(&event.kind()) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("Subscriber lagged, skipped {missed} events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn kinds(&self) -> &HashSet<EventKind> {
        &self.kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::User;

    fn offline_config() -> SessionConfig {
        let mut config = SessionConfig::new(
            "ws://127.0.0.1:9",
            "greenhouse-1",
            User::new("me", "Me", "me@example.com"),
        );
        config.reconnect_delay_ms = 60_000;
        config.connect_timeout_ms = 2_000;
        config
    }

    #[tokio::test]
    async fn test_connect_rejects_missing_document() {
        let mut config = offline_config();
        config.document_id.clear();
        let session = CollaborationSession::new(config);

        assert_eq!(session.connect().await, Err(CollabError::MissingDocumentId));
        assert_eq!(session.connection_state().await.unwrap(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_rejects_missing_user() {
        let mut config = offline_config();
        config.user = None;
        let session = CollaborationSession::new(config);
        let err = session.connect().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_sends_before_connect_are_queued() {
        let session = CollaborationSession::new(offline_config());
        session.send_cursor(CursorPosition::new(1.0, 2.0)).unwrap();
        session.send_selection(&Selection::new("bench-4", 0, 3)).unwrap();
        session.send_edit(Operation::insert(0, "x"), None).unwrap();

        assert_eq!(session.queued_events().await.unwrap(), 2);
        assert_eq!(session.pending_edits().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_comment_helpers_track_thread() {
        let session = CollaborationSession::new(offline_config());
        let root = session.send_comment(CommentDraft::new("Too much shade here")).unwrap();
        let replied = session.reply_to_comment(&root, "Moving the rack").unwrap();
        let resolved = session.resolve_comment(&replied).unwrap();

        assert_eq!(resolved.id, root.id);
        assert_eq!(resolved.replies.len(), 1);
        assert_eq!(resolved.replies[0].user_id, "me");

        let comments = session.comments().await.unwrap();
        assert_eq!(comments.len(), 1);
        assert!(comments[0].resolved);
    }

    #[tokio::test]
    async fn test_filtered_subscription_skips_other_kinds() {
        let session = CollaborationSession::new(offline_config());
        let mut errors = session.subscribe_to([EventKind::Error]);
        assert!(errors.kinds().contains(&EventKind::Error));

        // The failed attempt surfaces as an error event.
        assert!(session.connect().await.is_err());
        assert!(matches!(errors.recv().await, Some(SessionEvent::Error(_))));
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_harmless() {
        let session = CollaborationSession::new(offline_config());
        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.connection_state().await.unwrap(), ConnectionState::Disconnected);
    }
}
