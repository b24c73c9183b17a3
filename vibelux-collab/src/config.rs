//! Per-session configuration.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{CollabError, Result};
use crate::model::User;

/// What to do when the outbound queue is full while disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to make room.
    #[default]
    DropOldest,
    /// Keep the queue as is and refuse the new event.
    RejectNewest,
}

/// Client session configuration.
///
/// Every field can be overridden per session; JSON keys are camelCase
/// (`reconnectDelayMs`, `heartbeatIntervalMs`, ...).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Transport base URL, e.g. `ws://127.0.0.1:9090`
    pub base_url: String,
    pub document_id: String,
    pub user: Option<User>,
    pub reconnect_delay_ms: u64,
    /// Multiplier applied per failed attempt; 1.0 keeps the delay fixed
    pub reconnect_backoff: f64,
    pub max_reconnect_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub idle_timeout_ms: u64,
    pub idle_check_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub outbound_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Subscriber channel capacity
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://127.0.0.1:9090".to_string(),
            document_id: String::new(),
            user: None,
            reconnect_delay_ms: 5_000,
            reconnect_backoff: 1.0,
            max_reconnect_delay_ms: 60_000,
            heartbeat_interval_ms: 30_000,
            idle_timeout_ms: 300_000,
            idle_check_interval_ms: 60_000,
            connect_timeout_ms: 10_000,
            outbound_queue_capacity: 1_000,
            overflow_policy: OverflowPolicy::DropOldest,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn new(base_url: impl Into<String>, document_id: impl Into<String>, user: User) -> Self {
        Self {
            base_url: base_url.into(),
            document_id: document_id.into(),
            user: Some(user),
            ..Self::default()
        }
    }

    /// Load from a JSON object; absent keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CollabError::InvalidConfig(e.to_string()))
    }

    /// Fatal checks run before any connection attempt.
    pub fn validate(&self) -> Result<()> {
        if self.document_id.trim().is_empty() {
            return Err(CollabError::MissingDocumentId);
        }
        if !self.document_id.chars().all(is_path_safe) {
            return Err(CollabError::InvalidConfig(format!(
                "documentId {:?} may only contain ASCII letters, digits and -._~",
                self.document_id
            )));
        }
        match &self.user {
            None => return Err(CollabError::MissingUser),
            Some(user) if user.id.trim().is_empty() => return Err(CollabError::MissingUser),
            Some(_) => {}
        }
        if self.base_url.trim().is_empty() {
            return Err(CollabError::InvalidConfig("base url is empty".into()));
        }
        let intervals = [
            ("reconnectDelayMs", self.reconnect_delay_ms),
            ("heartbeatIntervalMs", self.heartbeat_interval_ms),
            ("idleTimeoutMs", self.idle_timeout_ms),
            ("idleCheckIntervalMs", self.idle_check_interval_ms),
            ("connectTimeoutMs", self.connect_timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, ms)| *ms == 0) {
            return Err(CollabError::InvalidConfig(format!("{name} must be greater than zero")));
        }
        if !(self.reconnect_backoff >= 1.0) {
            return Err(CollabError::InvalidConfig("reconnectBackoff must be >= 1.0".into()));
        }
        if self.outbound_queue_capacity == 0 || self.event_capacity == 0 {
            return Err(CollabError::InvalidConfig("queue capacities must be greater than zero".into()));
        }
        Ok(())
    }

    /// `{baseUrl}/collaborate/{documentId}`
    pub fn endpoint(&self) -> String {
        format!(
            "{}/collaborate/{}",
            self.base_url.trim_end_matches('/'),
            self.document_id
        )
    }

    pub fn user_id(&self) -> &str {
        self.user.as_ref().map(|u| u.id.as_str()).unwrap_or_default()
    }

    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let base = self.reconnect_delay_ms as f64;
        let scaled = base * self.reconnect_backoff.powi(attempt.min(64) as i32);
        let capped = scaled.min(self.max_reconnect_delay_ms.max(self.reconnect_delay_ms) as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Characters that pass through a URL path segment unescaped.
fn is_path_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
}
