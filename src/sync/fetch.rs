use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Recovered};
use crate::source::{EventSource, RoomId};
use crate::storage::{merge_events, Checkpoint, CHECKPOINT_FILENAME};
use crate::sync::{sleep_or_cancel, SyncOptions, SyncProgress};

/// Result of paging through a room's history.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Last token whose preceding events are safely merged.
    pub final_token: String,
    pub total_fetched: u64,
    pub pages: u32,
    pub recovered: Vec<Recovered>,
    /// Set when the loop stopped on an error instead of reaching the end.
    pub error: Option<Error>,
}

/// Page forward through `room_id` starting at the checkpoint, merging each
/// page into the day shards under `room_path`.
///
/// A page is merged before the checkpoint moves past it, so an interrupted
/// run only ever repeats work. The loop ends on an empty page or when the
/// server reports no further progress; any error stops it and is returned
/// in the outcome alongside the last safely reached token.
pub async fn fetch_room_history(
    source: &dyn EventSource,
    room_id: &RoomId,
    room_path: &Path,
    checkpoint: &mut Checkpoint,
    options: &SyncOptions,
    cancel: &CancellationToken,
    progress: &dyn SyncProgress,
) -> FetchOutcome {
    let mut current = checkpoint.next_token.clone();
    let mut outcome = FetchOutcome {
        final_token: current.clone(),
        ..FetchOutcome::default()
    };

    loop {
        if cancel.is_cancelled() {
            outcome.error = Some(Error::Cancelled);
            break;
        }

        log::debug!(
            "{room_id}: fetching messages (token={current:?}, limit={})",
            options.page_size
        );
        let page = match source.fetch_page(room_id, &current, options.page_size).await {
            Ok(page) => page,
            Err(e) => {
                log::error!("{room_id}: failed to fetch messages: {e}");
                outcome.error = Some(e.into());
                break;
            }
        };

        if page.events.is_empty() {
            log::debug!("{room_id}: fetched empty chunk, sync complete");
            break;
        }
        let count = page.events.len();
        log::debug!(
            "{room_id}: fetched {count} events (start={:?}, end={:?})",
            page.start,
            page.end
        );

        match merge_events(room_path, &page.events) {
            Ok(report) => outcome.recovered.extend(report.recovered),
            Err(e) => {
                log::error!("{room_id}: failed to store message chunk: {e}");
                outcome.error = Some(e);
                break;
            }
        }
        outcome.total_fetched += count as u64;
        outcome.pages += 1;
        progress.on_page_fetched(room_id, count, outcome.total_fetched);

        let next = match page.end {
            Some(token) if token != current => token,
            _ => {
                log::debug!("{room_id}: reached end of history (token did not change)");
                break;
            }
        };
        current = next;
        outcome.final_token = current.clone();

        if let Err(e) = checkpoint.advance(room_path, &current) {
            log::error!("{room_id}: failed to write checkpoint: {e}");
            outcome.recovered.push(Recovered {
                path: room_path.join(CHECKPOINT_FILENAME),
                message: format!("checkpoint not saved: {e}"),
            });
        }

        if let Err(e) = sleep_or_cancel(options.fetch_delay, cancel).await {
            outcome.error = Some(e);
            break;
        }
    }

    outcome
}
