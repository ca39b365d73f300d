pub mod config;
pub mod date_util;
pub mod error;
pub mod source;
pub mod storage;
pub mod sync;

pub use config::{CredentialOverrides, Credentials, CredentialsFile};
pub use error::{Error, Result};
pub use source::{Event, EventSource, MatrixClient, RoomId, SessionInfo, SourceError};
pub use storage::{merge_events, migrate_old_rooms, sanitize_filename, Checkpoint};
pub use sync::retry::{FixedDelay, RetryPolicy};
pub use sync::{
    NoopProgress, RunReport, SyncOptions, SyncProgress, SyncReport, SyncStage, SyncStatus,
};

use tokio_util::sync::CancellationToken;

use sync::{retry, syncer};

/// Main entry point for backing up a Matrix account.
pub struct MatrixBackup {
    source: Box<dyn EventSource>,
    options: SyncOptions,
    retry: Box<dyn RetryPolicy>,
    cancel: CancellationToken,
}

impl MatrixBackup {
    pub fn new(source: Box<dyn EventSource>, options: SyncOptions) -> Self {
        Self {
            source,
            options,
            retry: Box::new(FixedDelay::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Connect with the given credentials using the HTTP client.
    pub fn from_credentials(creds: &Credentials, options: SyncOptions) -> Result<Self> {
        let client = MatrixClient::new(&creds.server, &creds.token)?;
        Ok(Self::new(Box::new(client), options))
    }

    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry = Box::new(policy);
        self
    }

    /// Token that stops the run at the next remote call or delay when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Verify the session, retrying transient failures.
    pub async fn connect(&self, progress: &dyn SyncProgress) -> Result<SessionInfo> {
        retry::verify_session(self.source.as_ref(), self.retry.as_ref(), &self.cancel, progress)
            .await
    }

    /// Back up every joined room.
    pub async fn backup_all(&self, progress: &dyn SyncProgress) -> Result<RunReport> {
        syncer::backup_rooms(self.source.as_ref(), &self.options, &self.cancel, progress).await
    }

    /// Back up a single room.
    pub async fn backup_room(&self, room_id: &RoomId, progress: &dyn SyncProgress) -> SyncReport {
        syncer::sync_room(
            self.source.as_ref(),
            room_id,
            &self.options,
            &self.cancel,
            progress,
        )
        .await
    }
}
