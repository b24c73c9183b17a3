//! JSON wire protocol: one envelope per WebSocket text frame.
//!
//! ```text
//! { "type": "cursor"|"selection"|"edit"|"comment"|"presence"|"sync"|"error",
//!   "userId": "...", "timestamp": "2026-01-01T12:00:00Z", "version": 7,
//!   "data": { ...type-specific payload... } }
//! ```
//!
//! The payload stays an untyped JSON value until asked for. Typed
//! accessors (`cursor_position()`, `edit_payload()`, ...) check the
//! envelope type before parsing it.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CollabError, Result};
use crate::model::{Comment, CursorPosition, Presence, PresenceStatus, Selection, User, Viewport};
use crate::ot::Operation;

/// User id the hub stamps on events it originates (snapshots, errors).
pub const HUB_USER_ID: &str = "hub";

/// Envelope discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Cursor,
    Selection,
    Edit,
    Comment,
    Presence,
    Sync,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cursor => "cursor",
            Self::Selection => "selection",
            Self::Edit => "edit",
            Self::Comment => "comment",
            Self::Presence => "presence",
            Self::Sync => "sync",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ───────────────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditPayload {
    pub operation: Operation,
    /// Connection that produced the edit. Lets two sessions of one user
    /// tell each other's edits apart from their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// Presence broadcast. Heartbeats are presence events with `heartbeat`
/// set; they refresh `lastActive` without implying user activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub heartbeat: bool,
}

impl PresencePayload {
    /// Bare status change for a user (used for `away` notifications).
    pub fn status_only(status: PresenceStatus) -> Self {
        Self {
            user: None,
            status,
            cursor: None,
            selection: None,
            viewport: None,
            last_active: None,
            heartbeat: false,
        }
    }

    pub fn heartbeat(presence: &Presence) -> Self {
        Self {
            heartbeat: true,
            ..Self::from(presence)
        }
    }
}

impl From<&Presence> for PresencePayload {
    fn from(presence: &Presence) -> Self {
        Self {
            user: Some(presence.user.clone()),
            status: presence.status,
            cursor: presence.cursor,
            selection: presence.selection.clone(),
            viewport: presence.viewport,
            last_active: Some(presence.last_active),
            heartbeat: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SyncPayload {
    /// Ask the hub for an authoritative snapshot.
    Request { since: u64 },
    /// Authoritative document state.
    Snapshot { version: u64, content: String },
    /// The hub accepted the author's in-flight edit as `version`.
    Ack { version: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

// ───────────────────────────────────────────────────────────────────
// Envelope
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl CollaborationEvent {
    /// Build an envelope around any serializable payload, stamped now.
    pub fn new<T: Serialize>(event_type: EventType, user_id: impl Into<String>, payload: &T) -> Self {
        Self {
            event_type,
            user_id: user_id.into(),
            timestamp: Utc::now(),
            version: None,
            data: serde_json::to_value(payload).unwrap_or_default(),
        }
    }

    pub fn with_version(mut self, version: Option<u64>) -> Self {
        self.version = version;
        self
    }

    pub fn cursor(user_id: impl Into<String>, position: CursorPosition) -> Self {
        Self::new(EventType::Cursor, user_id, &position)
    }

    pub fn selection(user_id: impl Into<String>, selection: &Selection) -> Self {
        Self::new(EventType::Selection, user_id, selection)
    }

    pub fn edit(user_id: impl Into<String>, operation: Operation, version: Option<u64>) -> Self {
        Self::edit_from(user_id, None, operation, version)
    }

    /// An edit tagged with the connection it came from.
    pub fn edit_from(
        user_id: impl Into<String>,
        origin: Option<String>,
        operation: Operation,
        version: Option<u64>,
    ) -> Self {
        Self::new(EventType::Edit, user_id, &EditPayload { operation, origin }).with_version(version)
    }

    pub fn comment(user_id: impl Into<String>, comment: &Comment) -> Self {
        Self::new(EventType::Comment, user_id, comment)
    }

    pub fn presence(user_id: impl Into<String>, payload: &PresencePayload) -> Self {
        Self::new(EventType::Presence, user_id, payload)
    }

    pub fn sync_request(user_id: impl Into<String>, since: u64) -> Self {
        Self::new(EventType::Sync, user_id, &SyncPayload::Request { since })
    }

    pub fn sync_snapshot(user_id: impl Into<String>, version: u64, content: impl Into<String>) -> Self {
        let payload = SyncPayload::Snapshot {
            version,
            content: content.into(),
        };
        Self::new(EventType::Sync, user_id, &payload).with_version(Some(version))
    }

    /// Hub acknowledgement of the receiving connection's own edit.
    pub fn sync_ack(version: u64) -> Self {
        Self::new(EventType::Sync, HUB_USER_ID, &SyncPayload::Ack { version }).with_version(Some(version))
    }

    pub fn error(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        let payload = ErrorPayload {
            message: message.into(),
        };
        Self::new(EventType::Error, user_id, &payload)
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| CollabError::Serialization(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| CollabError::Deserialization(e.to_string()))
    }

    /// Deserialize from a binary frame holding UTF-8 JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| CollabError::Deserialization(e.to_string()))
    }

    pub fn cursor_position(&self) -> Result<CursorPosition> {
        self.payload(EventType::Cursor)
    }

    pub fn selection_range(&self) -> Result<Selection> {
        self.payload(EventType::Selection)
    }

    pub fn edit_payload(&self) -> Result<EditPayload> {
        self.payload(EventType::Edit)
    }

    pub fn comment_payload(&self) -> Result<Comment> {
        self.payload(EventType::Comment)
    }

    pub fn presence_payload(&self) -> Result<PresencePayload> {
        self.payload(EventType::Presence)
    }

    pub fn sync_payload(&self) -> Result<SyncPayload> {
        self.payload(EventType::Sync)
    }

    pub fn error_payload(&self) -> Result<ErrorPayload> {
        self.payload(EventType::Error)
    }

    fn payload<T: DeserializeOwned>(&self, expected: EventType) -> Result<T> {
        if self.event_type != expected {
            return Err(CollabError::InvalidMessageType {
                expected: expected.to_string(),
                actual: self.event_type.to_string(),
            });
        }
        serde_json::from_value(self.data.clone())
            .map_err(|e| CollabError::Deserialization(format!("{expected} payload: {e}")))
    }
}
