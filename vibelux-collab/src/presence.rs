//! Presence registry: the local view of every other participant.
//!
//! ```text
//! presence event (remote)
//!       │
//!       ▼
//! PresenceRegistry::apply_presence_update()
//!       │  upsert / remove on "away"
//!       ▼
//! PresenceChange::{UserJoined, UserLeft, Updated(snapshot)}
//!       │
//!       ▼
//! EventRouter → SessionEvent subscribers
//! ```
//!
//! `lastActive` is the time we last heard from a peer (presence,
//! heartbeat, cursor or selection). Entries silent for longer than the
//! idle timeout drop out of [`PresenceRegistry::active_users`] before they
//! are evicted.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;
use crate::model::{Presence, PresenceStatus, User};
use crate::protocol::{CollaborationEvent, PresencePayload};

/// Outcome of a registry mutation, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    UserJoined(Presence),
    UserLeft(String),
    /// Full active-user snapshot after the change.
    Updated(Vec<Presence>),
}

pub struct PresenceRegistry {
    local_user_id: String,
    entries: HashMap<String, Presence>,
    idle_timeout: Duration,
    idle_window: chrono::Duration,
}

impl PresenceRegistry {
    pub fn new(local_user_id: impl Into<String>, idle_timeout: Duration) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            entries: HashMap::new(),
            idle_timeout,
            idle_window: chrono::Duration::from_std(idle_timeout)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
        }
    }

    /// Parse and apply a `presence` envelope, stamped with the local
    /// receive time. The sender's clock is not trusted for idleness.
    pub fn apply_event(&mut self, event: &CollaborationEvent) -> Result<Vec<PresenceChange>> {
        let payload = event.presence_payload()?;
        Ok(self.apply_presence_update(&event.user_id, payload, Utc::now()))
    }

    /// Apply one presence update from `user_id`.
    ///
    /// Our own presence is locally authoritative and ignored. `away`
    /// removes the entry; anything else upserts it.
    pub fn apply_presence_update(
        &mut self,
        user_id: &str,
        payload: PresencePayload,
        received_at: DateTime<Utc>,
    ) -> Vec<PresenceChange> {
        if user_id == self.local_user_id {
            return Vec::new();
        }

        if payload.status == PresenceStatus::Away {
            return match self.entries.remove(user_id) {
                Some(_) => vec![
                    PresenceChange::UserLeft(user_id.to_string()),
                    PresenceChange::Updated(self.active_users_at(received_at)),
                ],
                None => Vec::new(),
            };
        }

        let mut changes = Vec::with_capacity(2);
        match self.entries.get_mut(user_id) {
            Some(entry) => {
                if let Some(user) = payload.user {
                    entry.user = user;
                }
                entry.status = payload.status;
                if payload.cursor.is_some() {
                    entry.cursor = payload.cursor;
                }
                if payload.selection.is_some() {
                    entry.selection = payload.selection;
                }
                if payload.viewport.is_some() {
                    entry.viewport = payload.viewport;
                }
                entry.last_active = entry.last_active.max(received_at);
            }
            None => {
                let presence = Presence {
                    user: payload.user.unwrap_or_else(|| User::anonymous(user_id)),
                    cursor: payload.cursor,
                    selection: payload.selection,
                    viewport: payload.viewport,
                    last_active: received_at,
                    status: payload.status,
                };
                log::debug!("Presence: {} ({}) joined", presence.user.display_name, user_id);
                changes.push(PresenceChange::UserJoined(presence.clone()));
                self.entries.insert(user_id.to_string(), presence);
            }
        }

        changes.push(PresenceChange::Updated(self.active_users_at(received_at)));
        changes
    }

    /// Refresh `lastActive` for a known peer (cursor/selection traffic).
    pub fn record_activity(&mut self, user_id: &str, at: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(user_id) {
            entry.last_active = entry.last_active.max(at);
        }
    }

    /// Active or idle peers heard from within the idle timeout, by user id.
    pub fn active_users(&self) -> Vec<Presence> {
        self.active_users_at(Utc::now())
    }

    pub fn active_users_at(&self, now: DateTime<Utc>) -> Vec<Presence> {
        let mut users: Vec<Presence> = self
            .entries
            .values()
            .filter(|p| p.status != PresenceStatus::Away)
            .filter(|p| now.signed_duration_since(p.last_active) <= self.idle_window)
            .cloned()
            .collect();
        users.sort_by(|a, b| a.user.id.cmp(&b.user.id));
        users
    }

    /// Remove peers silent for more than twice the idle timeout.
    pub fn evict_stale(&mut self) -> Vec<String> {
        self.evict_stale_at(Utc::now())
    }

    pub fn evict_stale_at(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = self.idle_window * 2;
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, p)| now.signed_duration_since(p.last_active) > cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            self.entries.remove(id);
        }
        stale
    }

    pub fn remove(&mut self, user_id: &str) -> Option<Presence> {
        self.entries.remove(user_id)
    }

    /// Drop every entry, returning the ids that were present.
    pub fn clear(&mut self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.drain().map(|(id, _)| id).collect();
        ids.sort();
        ids
    }

    pub fn get(&self, user_id: &str) -> Option<&Presence> {
        self.entries.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}
