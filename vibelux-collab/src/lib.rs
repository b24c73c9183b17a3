//! # vibelux-collab: Real-time collaboration core for Vibelux
//!
//! Lets several users edit one design document at once: live cursors and
//! selections, presence, threaded comments, and text edits reconciled with
//! operational transformation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐    WebSocket (JSON)    ┌─────────────┐
//! │ CollaborationSession │ ◄────────────────────► │ SyncServer  │
//! │  (per doc × user)    │  /collaborate/{docId}  │             │
//! └──────────┬───────────┘                        └──────┬──────┘
//!            │ commands                                  │
//!            ▼                                           ▼
//! ┌──────────────────────┐                        ┌─────────────┐
//! │ ConnectionManager    │                        │ HubRegistry │
//! │  queue · timers      │                        └──────┬──────┘
//! └──────────┬───────────┘                               ▼
//!            ▼                                    ┌─────────────┐
//! ┌──────────────────────┐                        │ DocumentHub │
//! │ EventRouter          │ ◄── ack per edit ───── │ content, OT │
//! │  PresenceRegistry    │                        │ history     │
//! │  PendingEdits        │                        │             │
//! └──────────┬───────────┘                        └──────┬──────┘
//!            ▼                                           ▼
//!      SessionEvent                               BroadcastGroup
//! ```
//!
//! ## Modules
//!
//! - [`ot`]: operations, transform, apply
//! - [`protocol`]: JSON envelope and payloads
//! - [`presence`]: who is here and what they are pointing at
//! - [`connection`]: per-session actor (transport, queue, heartbeat, reconnect)
//! - [`router`]: inbound dispatch and version tracking
//! - [`pending`]: local edits awaiting the hub's acknowledgement
//! - [`session`]: public client API
//! - [`hub`], [`broadcast`], [`server`]: the authoritative server side

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod model;
pub mod ot;
pub mod pending;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, PeerId};
pub use config::{OverflowPolicy, SessionConfig};
pub use connection::{ConnectionState, OutboundQueue};
pub use error::{CollabError, Result};
pub use hub::{DocumentHub, HubHandle, HubRegistry};
pub use model::{
    Comment, CommentDraft, CursorPosition, Presence, PresencePatch, PresenceStatus, Selection,
    User, Viewport,
};
pub use ot::{apply, transform, Operation, Priority};
pub use pending::PendingEdits;
pub use presence::{PresenceChange, PresenceRegistry};
pub use protocol::{CollaborationEvent, EventType};
pub use router::{EventKind, EventRouter, SessionEvent};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{CollaborationSession, Subscription};
