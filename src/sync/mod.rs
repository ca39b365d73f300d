pub mod fetch;
pub mod retry;
pub mod syncer;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::source::{RoomId, SourceError};

/// Events requested per `/messages` call.
pub const DEFAULT_PAGE_SIZE: u32 = 100;
/// Pause between consecutive page requests.
pub const DEFAULT_FETCH_DELAY: Duration = Duration::from_millis(10);

/// Options controlling a backup run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub backup_dir: PathBuf,
    pub page_size: u32,
    pub fetch_delay: Duration,
}

impl SyncOptions {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            page_size: DEFAULT_PAGE_SIZE,
            fetch_delay: DEFAULT_FETCH_DELAY,
        }
    }
}

/// Steps of a single room's sync, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncStage {
    ResolveLabel,
    EnsureDirectory,
    MigrateOld,
    LoadCheckpoint,
    Fetching,
    Done,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStage::ResolveLabel => "label resolution",
            SyncStage::EnsureDirectory => "directory creation",
            SyncStage::MigrateOld => "old directory migration",
            SyncStage::LoadCheckpoint => "checkpoint load",
            SyncStage::Fetching => "message fetch",
            SyncStage::Done => "completion",
        };
        f.write_str(s)
    }
}

/// Report returned after a room has been synced.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub room_id: String,
    pub room_dir: Option<String>,
    pub status: SyncStatus,
    pub events_fetched: u64,
    pub pages: u32,
    pub final_token: String,
    pub failed_stage: Option<SyncStage>,
    /// Non-fatal problems that were recovered from.
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl SyncReport {
    pub fn new(room_id: &RoomId) -> Self {
        Self {
            room_id: room_id.to_string(),
            room_dir: None,
            status: SyncStatus::Success,
            events_fetched: 0,
            pages: 0,
            final_token: String::new(),
            failed_stage: None,
            warnings: Vec::new(),
            error: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == SyncStatus::Failed
    }

    pub(crate) fn fail(&mut self, err: &Error) {
        self.status = SyncStatus::Failed;
        if let Error::Room { stage, .. } = err {
            self.failed_stage = Some(*stage);
        }
        self.error = Some(err.to_string());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncStatus {
    Success,
    Failed,
    Cancelled,
}

/// Outcome of backing up every joined room.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub rooms: Vec<SyncReport>,
    /// Set when the run stopped early because cancellation was requested.
    pub cancelled: bool,
}

impl RunReport {
    pub fn failed_rooms(&self) -> usize {
        self.rooms.iter().filter(|r| r.is_failed()).count()
    }

    pub fn events_fetched(&self) -> u64 {
        self.rooms.iter().map(|r| r.events_fetched).sum()
    }

    /// True when no room failed and the run was not cancelled.
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed_rooms() == 0
    }
}

/// Observer for sync progress and for problems that were handled without
/// failing the room. All methods default to doing nothing.
pub trait SyncProgress {
    fn on_room_start(&self, _room_id: &RoomId, _index: usize, _total: usize) {}

    fn on_page_fetched(&self, _room_id: &RoomId, _count: usize, _total: u64) {}

    fn on_connect_retry(&self, _attempt: u32, _delay: Duration, _error: &SourceError) {}

    fn on_recovered(&self, _room_id: &RoomId, _problem: &str) {}

    fn on_room_complete(&self, _report: &SyncReport) {}
}

/// A `SyncProgress` that ignores everything.
pub struct NoopProgress;

impl SyncProgress for NoopProgress {}

/// Sleep for `delay` unless cancellation is requested first.
pub(crate) async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
