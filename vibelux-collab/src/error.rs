//! Error type shared by every layer of the collaboration core.
//!
//! Only the configuration variants are fatal to a caller: everything else
//! is logged and handled inside the session (dropped message, reconnect,
//! resync) and at most surfaces as a [`crate::SessionEvent::Error`].

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollabError {
    #[error("missing document id")]
    MissingDocumentId,

    #[error("missing user")]
    MissingUser,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("invalid message type: expected {expected}, got {actual}")]
    InvalidMessageType { expected: String, actual: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection timeout")]
    Timeout,

    #[error("position {position} out of bounds for document of length {len}")]
    OutOfBounds { position: usize, len: usize },

    #[error("outbound queue full ({0} events)")]
    QueueFull(usize),
}

impl CollabError {
    /// Whether this error must stop `connect()` from being attempted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MissingDocumentId | Self::MissingUser | Self::InvalidConfig(_)
        )
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(e: serde_json::Error) -> Self {
        Self::Deserialization(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CollabError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        match e {
            tokio_tungstenite::tungstenite::Error::ConnectionClosed
            | tokio_tungstenite::tungstenite::Error::AlreadyClosed => Self::ConnectionClosed,
            other => Self::Transport(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CollabError>;
