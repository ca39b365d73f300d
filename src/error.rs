use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::source::SourceError;
use crate::sync::SyncStage;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode {what}: {source}")]
    Encode {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Event {event_id} has an unrepresentable timestamp: {timestamp}")]
    InvalidTimestamp { event_id: String, timestamp: i64 },

    #[error("Matrix API error: {0}")]
    Source(#[from] SourceError),

    #[error("Failed to verify session after {attempts} attempts: {source}")]
    ConnectExhausted {
        attempts: u32,
        #[source]
        source: SourceError,
    },

    #[error("Non-retryable error while verifying session: {0}")]
    ConnectFatal(#[source] SourceError),

    #[error("Room {room_id} failed during {stage}: {source}")]
    Room {
        room_id: String,
        stage: SyncStage,
        #[source]
        source: Box<Error>,
    },

    #[error("Encountered errors during merge: {0}")]
    Migration(MigrationErrors),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn decode(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Error::Decode {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn in_stage(self, room_id: &str, stage: SyncStage) -> Self {
        Error::Room {
            room_id: room_id.to_string(),
            stage,
            source: Box::new(self),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Room { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// Failures collected from independent old-directory merges, rendered as one message.
#[derive(Debug)]
pub struct MigrationErrors(pub Vec<Error>);

impl fmt::Display for MigrationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        f.write_str(&messages.join("; "))
    }
}

/// A problem the operation recovered from by falling back to a safe default.
///
/// These never fail the operation, but callers are expected to report them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    pub path: PathBuf,
    pub message: String,
}

impl fmt::Display for Recovered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
