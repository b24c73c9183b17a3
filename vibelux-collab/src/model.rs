//! Shared data model: participants, their ephemeral state, and comments.
//!
//! Everything here is plain data that crosses the wire as camelCase JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Users
// ───────────────────────────────────────────────────────────────────

/// An authenticated participant. Immutable for the session lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub display_name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
    /// `#rrggbb` color used for this user's cursor and selections.
    pub assigned_color: String,
}

impl User {
    /// Create a user whose color is derived from the id.
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        let id = id.into();
        let assigned_color = color_for_user(&id);
        Self {
            id,
            display_name: display_name.into(),
            email: email.into(),
            avatar_ref: None,
            assigned_color,
        }
    }

    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }

    /// Placeholder identity for a peer we only know by id.
    pub fn anonymous(id: impl Into<String>) -> Self {
        let id = id.into();
        let short: String = id.chars().take(8).collect();
        Self::new(id.clone(), format!("Peer-{short}"), String::new())
    }
}

/// Stable, visually distinct `#rrggbb` color for a user id.
///
/// The hue comes from an FNV-1a hash of the id; saturation and lightness
/// are fixed so every cursor stays vivid on a light canvas.
pub fn color_for_user(user_id: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in user_id.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    let hue = (hash % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Ephemeral state
// ───────────────────────────────────────────────────────────────────

/// Cursor position in document (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A selected character range inside one element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub element_id: String,
    pub start: usize,
    pub end: usize,
}

impl Selection {
    pub fn new(element_id: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            element_id: element_id.into(),
            start,
            end,
        }
    }
}

/// Visible region of the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub zoom: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Active,
    Idle,
    Away,
}

impl PresenceStatus {
    /// Status implied by a stretch of inactivity: idle after one
    /// `idle_timeout`, away after two.
    pub fn for_inactivity(inactive: std::time::Duration, idle_timeout: std::time::Duration) -> Self {
        if inactive >= idle_timeout * 2 {
            Self::Away
        } else if inactive >= idle_timeout {
            Self::Idle
        } else {
            Self::Active
        }
    }
}

/// One participant's ephemeral state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub user: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
    pub last_active: DateTime<Utc>,
    pub status: PresenceStatus,
}

impl Presence {
    pub fn new(user: User) -> Self {
        Self {
            user,
            cursor: None,
            selection: None,
            viewport: None,
            last_active: Utc::now(),
            status: PresenceStatus::Active,
        }
    }

    /// Merge a partial update; `None` fields keep their current value.
    pub fn merge(&mut self, patch: &PresencePatch) {
        if let Some(cursor) = patch.cursor {
            self.cursor = Some(cursor);
        }
        if let Some(selection) = &patch.selection {
            self.selection = Some(selection.clone());
        }
        if let Some(viewport) = patch.viewport {
            self.viewport = Some(viewport);
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
    }
}

/// Partial self-presence update accepted by the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresencePatch {
    pub cursor: Option<CursorPosition>,
    pub selection: Option<Selection>,
    pub viewport: Option<Viewport>,
    pub status: Option<PresenceStatus>,
}

// ───────────────────────────────────────────────────────────────────
// Comments
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub user_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_ref: Option<String>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub replies: Vec<Comment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Comment {
    /// Append a reply and bump `updated_at`.
    pub fn add_reply(&mut self, reply: Comment) {
        self.updated_at = reply.created_at.max(self.updated_at);
        self.replies.push(reply);
    }

    pub fn resolve(&mut self) {
        self.resolved = true;
        self.updated_at = Utc::now();
    }
}

/// A comment as the caller writes it; missing fields are filled in by
/// [`CommentDraft::into_comment`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentDraft {
    pub id: Option<String>,
    pub text: String,
    pub position: Option<CursorPosition>,
    pub element_ref: Option<String>,
    pub resolved: bool,
    pub replies: Vec<Comment>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CommentDraft {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn at(mut self, position: CursorPosition) -> Self {
        self.position = Some(position);
        self
    }

    pub fn on_element(mut self, element_ref: impl Into<String>) -> Self {
        self.element_ref = Some(element_ref.into());
        self
    }

    pub fn into_comment(self, user_id: &str) -> Comment {
        let now = Utc::now();
        let created_at = self.created_at.unwrap_or(now);
        Comment {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            user_id: user_id.to_string(),
            text: self.text,
            position: self.position,
            element_ref: self.element_ref,
            resolved: self.resolved,
            replies: self.replies,
            created_at,
            updated_at: self.updated_at.unwrap_or(created_at),
        }
    }
}
