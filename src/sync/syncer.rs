use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Recovered, Result};
use crate::source::{EventSource, RoomId};
use crate::storage::{self, migrate_old_rooms, room_dir_name, Checkpoint};
use crate::sync::fetch::fetch_room_history;
use crate::sync::{RunReport, SyncOptions, SyncProgress, SyncReport, SyncStage, SyncStatus};

/// Back up every room the source lists, one at a time.
///
/// Listing the rooms or creating the backup root are fatal for the run. A
/// room that fails is reported and the run moves on to the next one.
pub async fn backup_rooms(
    source: &dyn EventSource,
    options: &SyncOptions,
    cancel: &CancellationToken,
    progress: &dyn SyncProgress,
) -> Result<RunReport> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    log::info!("Fetching list of joined rooms...");
    let rooms = source.list_rooms().await?;
    log::info!("Found {} joined rooms", rooms.len());

    storage::create_dir_all(&options.backup_dir)?;

    let total = rooms.len();
    let mut run = RunReport::default();
    for (i, room_id) in rooms.iter().enumerate() {
        if cancel.is_cancelled() {
            run.cancelled = true;
            break;
        }
        progress.on_room_start(room_id, i, total);
        let report = sync_room(source, room_id, options, cancel, progress).await;
        let cancelled = report.status == SyncStatus::Cancelled;
        run.rooms.push(report);
        if cancelled {
            run.cancelled = true;
            break;
        }
    }

    let failed = run.failed_rooms();
    if failed > 0 {
        log::error!("{failed} of {total} rooms failed to back up completely");
    }
    if run.cancelled {
        log::warn!("Backup cancelled after {} of {total} rooms", run.rooms.len());
    }
    Ok(run)
}

/// Sync a single room: resolve its directory, fold in directories left over
/// from earlier labels, then page forward from the checkpoint.
///
/// Never returns an error; failures are recorded in the report.
pub async fn sync_room(
    source: &dyn EventSource,
    room_id: &RoomId,
    options: &SyncOptions,
    cancel: &CancellationToken,
    progress: &dyn SyncProgress,
) -> SyncReport {
    log::info!("{room_id}: starting room backup");
    let mut report = SyncReport::new(room_id);

    if let Err(e) = run_stages(source, room_id, options, cancel, progress, &mut report).await {
        if e.is_cancelled() {
            log::warn!("{room_id}: cancelled");
            report.fail(&e);
            report.status = SyncStatus::Cancelled;
        } else {
            log::error!("Failed to back up room {room_id}: {e}");
            report.fail(&e);
        }
    } else if report.events_fetched > 0 {
        log::info!(
            "{room_id}: room backup finished, {} events fetched",
            report.events_fetched
        );
    } else {
        log::debug!("{room_id}: already up to date");
    }

    progress.on_room_complete(&report);
    report
}

async fn run_stages(
    source: &dyn EventSource,
    room_id: &RoomId,
    options: &SyncOptions,
    cancel: &CancellationToken,
    progress: &dyn SyncProgress,
    report: &mut SyncReport,
) -> Result<()> {
    let id = room_id.as_str();

    if cancel.is_cancelled() {
        return Err(Error::Cancelled.in_stage(id, SyncStage::ResolveLabel));
    }
    let label = source
        .resolve_label(room_id)
        .await
        .map_err(|e| Error::from(e).in_stage(id, SyncStage::ResolveLabel))?;
    let label = if label.trim().is_empty() {
        id.to_string()
    } else {
        label
    };

    let dir_name = room_dir_name(&label, room_id);
    let room_path: PathBuf = options.backup_dir.join(&dir_name);
    log::debug!("{room_id}: label {label:?} -> directory {dir_name}");
    report.room_dir = Some(dir_name.clone());
    storage::create_dir_all(&room_path).map_err(|e| e.in_stage(id, SyncStage::EnsureDirectory))?;

    let migration = migrate_old_rooms(&options.backup_dir, room_id, &dir_name, &room_path);
    for recovered in &migration.recovered {
        note_recovered(room_id, recovered, progress, report);
    }
    if let Some(err) = migration.into_error() {
        log::warn!("{room_id}: failed to merge data from old room directories: {err}");
        let message = err.in_stage(id, SyncStage::MigrateOld).to_string();
        progress.on_recovered(room_id, &message);
        report.warnings.push(message);
    }

    let mut checkpoint =
        Checkpoint::load(&room_path).map_err(|e| e.in_stage(id, SyncStage::LoadCheckpoint))?;

    let outcome = fetch_room_history(
        source,
        room_id,
        &room_path,
        &mut checkpoint,
        options,
        cancel,
        progress,
    )
    .await;
    report.events_fetched = outcome.total_fetched;
    report.pages = outcome.pages;
    report.final_token = outcome.final_token.clone();
    for recovered in &outcome.recovered {
        note_recovered(room_id, recovered, progress, report);
    }
    if let Some(err) = outcome.error {
        return Err(err.in_stage(id, SyncStage::Fetching));
    }

    match checkpoint.advance(&room_path, &outcome.final_token) {
        Ok(true) => log::debug!("{room_id}: updated next sync token"),
        Ok(false) => {}
        Err(e) => {
            log::error!("{room_id}: failed to write updated checkpoint: {e}");
            let message = e.in_stage(id, SyncStage::Done).to_string();
            progress.on_recovered(room_id, &message);
            report.warnings.push(message);
        }
    }

    Ok(())
}

fn note_recovered(
    room_id: &RoomId,
    recovered: &Recovered,
    progress: &dyn SyncProgress,
    report: &mut SyncReport,
) {
    let message = recovered.to_string();
    progress.on_recovered(room_id, &message);
    report.warnings.push(message);
}
