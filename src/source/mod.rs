pub mod matrix;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use matrix::MatrixClient;

/// Leading character of every room ID. Directory names are located by it.
pub const ROOM_ID_SIGIL: char = '!';

/// Stable, server-assigned identifier of a room (e.g. `!abc123:example.org`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One immutable timeline event.
///
/// Only the ID and timestamp are interpreted; every other field is kept
/// verbatim in `payload` and written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub origin_server_ts: i64,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Event {
    pub fn new(event_id: impl Into<String>, origin_server_ts: i64) -> Self {
        Self {
            event_id: event_id.into(),
            origin_server_ts,
            payload: Map::new(),
        }
    }
}

/// A single page of room history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub events: Vec<Event>,
    pub start: String,
    /// Continuation token; `None` when the server reports no further history.
    pub end: Option<String>,
}

/// Identity confirmed by the homeserver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub user_id: String,
    pub device_id: Option<String>,
}

/// Network-level failure categories, as far as they can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    ConnectionRefused,
    Dns,
    Timeout,
    UnexpectedEof,
    Unreachable,
    Other,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::ConnectionRefused => "connection refused",
            TransportKind::Dns => "dns lookup failed",
            TransportKind::Timeout => "timed out",
            TransportKind::UnexpectedEof => "unexpected end of stream",
            TransportKind::Unreachable => "network unreachable",
            TransportKind::Other => "transport",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("{kind}: {message}")]
    Transport { kind: TransportKind, message: String },

    #[error("HTTP {status} {}: {message}", errcode.as_deref().unwrap_or("(no errcode)"))]
    Http {
        status: u16,
        errcode: Option<String>,
        message: String,
    },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Other(String),
}

impl SourceError {
    pub fn is_not_found(&self) -> bool {
        match self {
            SourceError::Http {
                status, errcode, ..
            } => *status == 404 || errcode.as_deref() == Some("M_NOT_FOUND"),
            _ => false,
        }
    }
}

/// Capability interface to the remote room history.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Confirm the credentials are accepted by the server.
    async fn verify_session(&self) -> Result<SessionInfo, SourceError>;

    /// Rooms the account can back up.
    async fn list_rooms(&self) -> Result<Vec<RoomId>, SourceError>;

    /// Best-effort human-readable label; implementations fall back to the
    /// room ID itself rather than failing when nothing better is known.
    async fn resolve_label(&self, room_id: &RoomId) -> Result<String, SourceError>;

    /// Fetch up to `limit` events forward from `from` (empty = start of history).
    async fn fetch_page(
        &self,
        room_id: &RoomId,
        from: &str,
        limit: u32,
    ) -> Result<Page, SourceError>;
}
