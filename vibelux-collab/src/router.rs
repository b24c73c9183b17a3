//! Inbound dispatch: one decoded envelope in, zero or more actions out.
//!
//! The router owns everything a session learns from the network: the
//! [`PresenceRegistry`], the cursor/selection caches, the comment list,
//! the local DocumentVersion and the local edits still awaiting a hub
//! acknowledgement. It performs no I/O; the connection manager executes
//! the returned [`RouteAction`]s.

use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;

use crate::model::{Comment, CursorPosition, Presence, Selection};
use crate::ot::Operation;
use crate::pending::PendingEdits;
use crate::presence::{PresenceChange, PresenceRegistry};
use crate::protocol::{CollaborationEvent, EventType, SyncPayload};

/// Application-level event delivered to session subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    PresenceUpdate(Vec<Presence>),
    Cursor { user_id: String, position: CursorPosition },
    Selection { user_id: String, selection: Selection },
    Comment(Comment),
    /// A remote edit accepted at `version`, rebased over this session's
    /// unacknowledged edits and ready for the document applier.
    Edit { user_id: String, operation: Operation, version: u64 },
    /// Authoritative document state; replaces local state.
    Sync { version: u64, content: String },
    UserJoined(Presence),
    UserLeft(String),
    Error(String),
}

/// Discriminant of [`SessionEvent`], used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    PresenceUpdate,
    Cursor,
    Selection,
    Comment,
    Edit,
    Sync,
    UserJoined,
    UserLeft,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::PresenceUpdate => "presence-update",
            Self::Cursor => "cursor",
            Self::Selection => "selection",
            Self::Comment => "comment",
            Self::Edit => "edit",
            Self::Sync => "sync",
            Self::UserJoined => "user-joined",
            Self::UserLeft => "user-left",
            Self::Error => "error",
        }
    }
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Disconnected => EventKind::Disconnected,
            Self::PresenceUpdate(_) => EventKind::PresenceUpdate,
            Self::Cursor { .. } => EventKind::Cursor,
            Self::Selection { .. } => EventKind::Selection,
            Self::Comment(_) => EventKind::Comment,
            Self::Edit { .. } => EventKind::Edit,
            Self::Sync { .. } => EventKind::Sync,
            Self::UserJoined(_) => EventKind::UserJoined,
            Self::UserLeft(_) => EventKind::UserLeft,
            Self::Error(_) => EventKind::Error,
        }
    }
}

/// What the connection manager must do after routing an event.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteAction {
    Emit(SessionEvent),
    /// A stale edit was seen; ask for a snapshot newer than `since`.
    RequestResync { since: u64 },
    /// The hub is ready for the next pending local edit.
    SendPendingEdits,
}

pub struct EventRouter {
    local_user_id: String,
    /// Tag carried by this session's edits
    origin: Option<String>,
    version: u64,
    /// Version of the last `Edit` or `Sync` handed to subscribers
    delivered_version: u64,
    pending: PendingEdits,
    /// Set on every open; the next snapshot is the hub's join greeting.
    awaiting_welcome: bool,
    presence: PresenceRegistry,
    cursors: HashMap<String, CursorPosition>,
    selections: HashMap<String, Selection>,
    comments: Vec<Comment>,
}

impl EventRouter {
    pub fn new(local_user_id: impl Into<String>, idle_timeout: Duration) -> Self {
        let local_user_id = local_user_id.into();
        Self {
            presence: PresenceRegistry::new(local_user_id.clone(), idle_timeout),
            local_user_id,
            origin: None,
            version: 0,
            delivered_version: 0,
            pending: PendingEdits::new(),
            awaiting_welcome: false,
            cursors: HashMap::new(),
            selections: HashMap::new(),
            comments: Vec::new(),
        }
    }

    /// Tag outgoing edits so another session of the same user can tell
    /// them apart from its own.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Dispatch one inbound envelope.
    pub fn route(&mut self, event: CollaborationEvent) -> Vec<RouteAction> {
        if event.user_id == self.local_user_id && !self.is_sibling_edit(&event) {
            log::trace!("Ignoring echo of own {} event", event.event_type);
            return Vec::new();
        }

        match event.event_type {
            EventType::Cursor => self.route_cursor(&event),
            EventType::Selection => self.route_selection(&event),
            EventType::Presence => self.route_presence(&event),
            EventType::Comment => self.route_comment(&event),
            EventType::Edit => self.route_edit(&event),
            EventType::Sync => self.route_sync(&event),
            EventType::Error => {
                let message = event
                    .error_payload()
                    .map(|p| p.message)
                    .unwrap_or_else(|_| "unspecified error".to_string());
                log::warn!("Error from {}: {message}", event.user_id);
                vec![RouteAction::Emit(SessionEvent::Error(message))]
            }
        }
    }

    /// An edit under our user id that another session produced.
    fn is_sibling_edit(&self, event: &CollaborationEvent) -> bool {
        if event.event_type != EventType::Edit {
            return false;
        }
        match (&self.origin, event.edit_payload()) {
            (Some(own), Ok(payload)) => payload.origin.is_some_and(|origin| origin != *own),
            _ => false,
        }
    }

    fn route_cursor(&mut self, event: &CollaborationEvent) -> Vec<RouteAction> {
        match event.cursor_position() {
            Ok(position) => {
                self.cursors.insert(event.user_id.clone(), position);
                self.presence.record_activity(&event.user_id, Utc::now());
                vec![RouteAction::Emit(SessionEvent::Cursor {
                    user_id: event.user_id.clone(),
                    position,
                })]
            }
            Err(e) => {
                log::warn!("Dropping cursor event from {}: {e}", event.user_id);
                Vec::new()
            }
        }
    }

    fn route_selection(&mut self, event: &CollaborationEvent) -> Vec<RouteAction> {
        match event.selection_range() {
            Ok(selection) => {
                self.selections.insert(event.user_id.clone(), selection.clone());
                self.presence.record_activity(&event.user_id, Utc::now());
                vec![RouteAction::Emit(SessionEvent::Selection {
                    user_id: event.user_id.clone(),
                    selection,
                })]
            }
            Err(e) => {
                log::warn!("Dropping selection event from {}: {e}", event.user_id);
                Vec::new()
            }
        }
    }

    fn route_presence(&mut self, event: &CollaborationEvent) -> Vec<RouteAction> {
        match self.presence.apply_event(event) {
            Ok(changes) => self.presence_actions(changes),
            Err(e) => {
                log::warn!("Dropping presence event from {}: {e}", event.user_id);
                Vec::new()
            }
        }
    }

    fn presence_actions(&mut self, changes: Vec<PresenceChange>) -> Vec<RouteAction> {
        changes
            .into_iter()
            .map(|change| match change {
                PresenceChange::UserJoined(presence) => {
                    RouteAction::Emit(SessionEvent::UserJoined(presence))
                }
                PresenceChange::UserLeft(user_id) => {
                    self.evict_caches(&user_id);
                    RouteAction::Emit(SessionEvent::UserLeft(user_id))
                }
                PresenceChange::Updated(snapshot) => {
                    RouteAction::Emit(SessionEvent::PresenceUpdate(snapshot))
                }
            })
            .collect()
    }

    fn route_comment(&mut self, event: &CollaborationEvent) -> Vec<RouteAction> {
        match event.comment_payload() {
            Ok(comment) => {
                self.upsert_comment(comment.clone());
                vec![RouteAction::Emit(SessionEvent::Comment(comment))]
            }
            Err(e) => {
                log::warn!("Dropping comment event from {}: {e}", event.user_id);
                Vec::new()
            }
        }
    }

    fn route_edit(&mut self, event: &CollaborationEvent) -> Vec<RouteAction> {
        let payload = match event.edit_payload() {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Unreadable edit from {}: {e}", event.user_id);
                return vec![RouteAction::Emit(SessionEvent::Error(format!(
                    "unreadable edit from {}: {e}",
                    event.user_id
                )))];
            }
        };

        let version = match event.version {
            Some(v) if v <= self.version => {
                log::warn!(
                    "Stale edit v{v} from {} (local v{}), requesting resync",
                    event.user_id,
                    self.version
                );
                return vec![RouteAction::RequestResync { since: self.version }];
            }
            Some(v) => v,
            None => self.version.saturating_add(1),
        };

        self.version = version;
        self.delivered_version = version;
        let operation = self.pending.transform_remote(&payload.operation);
        log::debug!(
            "Accepted edit v{version} from {} ({} local edits pending)",
            event.user_id,
            self.pending.len()
        );
        vec![RouteAction::Emit(SessionEvent::Edit {
            user_id: event.user_id.clone(),
            operation,
            version,
        })]
    }

    fn route_sync(&mut self, event: &CollaborationEvent) -> Vec<RouteAction> {
        match event.sync_payload() {
            Ok(SyncPayload::Snapshot { version, content }) => self.route_snapshot(version, content),
            Ok(SyncPayload::Ack { version }) => self.route_ack(version),
            Ok(SyncPayload::Request { since }) => {
                log::debug!("Ignoring sync request from {} (since v{since})", event.user_id);
                Vec::new()
            }
            Err(e) => {
                log::warn!("Dropping sync event from {}: {e}", event.user_id);
                Vec::new()
            }
        }
    }

    fn route_snapshot(&mut self, version: u64, content: String) -> Vec<RouteAction> {
        let welcome = std::mem::take(&mut self.awaiting_welcome);
        if welcome && version == self.version && !self.pending.is_empty() {
            // Nothing landed while we were away, including our in-flight edit.
            self.pending.requeue();
            log::info!(
                "Rejoined at v{version}, resending {} local edits",
                self.pending.len()
            );
            return vec![RouteAction::SendPendingEdits];
        }

        log::info!("Resynced to v{version} (was v{})", self.version);
        self.version = version;
        self.delivered_version = version;
        let mut actions = Vec::with_capacity(2);
        let dropped = self.pending.discard();
        if dropped > 0 {
            log::warn!("Snapshot v{version} discarded {dropped} unacknowledged local edits");
            actions.push(RouteAction::Emit(SessionEvent::Error(format!(
                "{dropped} local edits were not confirmed by the hub and were discarded"
            ))));
        }
        actions.push(RouteAction::Emit(SessionEvent::Sync { version, content }));
        actions
    }

    fn route_ack(&mut self, version: u64) -> Vec<RouteAction> {
        if !self.pending.acknowledge() {
            log::warn!("Ack for v{version} with no edit in flight");
            return Vec::new();
        }
        let expected = self.version.saturating_add(1);
        if version != expected {
            log::warn!("Ack for v{version}, expected v{expected}; requesting resync");
            return vec![RouteAction::RequestResync { since: self.version }];
        }
        self.version = version;
        log::trace!("Edit acknowledged as v{version}");
        vec![RouteAction::SendPendingEdits]
    }

    /// Record a local edit that is already applied to the local document.
    pub fn submit_local_edit(&mut self, operation: Operation) {
        self.pending.push(operation);
    }

    /// The next local edit to put on the wire, based on the current
    /// version. `None` while one is unacknowledged or before the hub's
    /// join greeting.
    pub fn next_outgoing_edit(&mut self) -> Option<CollaborationEvent> {
        if self.awaiting_welcome {
            return None;
        }
        let operation = self.pending.next_to_send()?;
        Some(CollaborationEvent::edit_from(
            self.local_user_id.clone(),
            self.origin.clone(),
            operation,
            Some(self.version),
        ))
    }

    /// A fresh connection is open; hold edits until its greeting arrives.
    pub fn expect_welcome(&mut self) {
        self.awaiting_welcome = true;
    }

    /// Version of the last edit or snapshot delivered to subscribers.
    /// Acknowledgements of local edits advance [`document_version`]
    /// but not this.
    ///
    /// [`document_version`]: Self::document_version
    pub fn delivered_version(&self) -> u64 {
        self.delivered_version
    }

    pub fn pending_edits(&self) -> usize {
        self.pending.len()
    }

    /// Insert a new comment thread, or replace the stored copy of an
    /// existing one (reply/resolve). Comments are never removed here.
    pub fn upsert_comment(&mut self, comment: Comment) {
        match self.comments.iter_mut().find(|c| c.id == comment.id) {
            Some(existing) => *existing = comment,
            None => self.comments.push(comment),
        }
    }

    /// Evict peers silent for more than twice the idle timeout.
    pub fn evict_stale(&mut self) -> Vec<RouteAction> {
        let evicted = self.presence.evict_stale();
        if evicted.is_empty() {
            return Vec::new();
        }
        let mut actions: Vec<RouteAction> = evicted
            .into_iter()
            .map(|user_id| {
                self.evict_caches(&user_id);
                RouteAction::Emit(SessionEvent::UserLeft(user_id))
            })
            .collect();
        actions.push(RouteAction::Emit(SessionEvent::PresenceUpdate(
            self.presence.active_users(),
        )));
        actions
    }

    /// Forget every peer (local disconnect). Comments and the document
    /// version survive so a reconnect can resume from them.
    pub fn clear_presence(&mut self) -> Vec<String> {
        self.cursors.clear();
        self.selections.clear();
        self.presence.clear()
    }

    fn evict_caches(&mut self, user_id: &str) {
        self.cursors.remove(user_id);
        self.selections.remove(user_id);
    }

    pub fn document_version(&self) -> u64 {
        self.version
    }

    pub fn active_users(&self) -> Vec<Presence> {
        self.presence.active_users()
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    pub fn cursor(&self, user_id: &str) -> Option<CursorPosition> {
        self.cursors.get(user_id).copied()
    }

    pub fn selection(&self, user_id: &str) -> Option<&Selection> {
        self.selections.get(user_id)
    }
}
