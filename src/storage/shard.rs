use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::date_util;
use crate::error::{Error, Recovered, Result};
use crate::source::Event;
use crate::storage::{create_dir_all, read_optional, write_json_atomic, DATA_FILENAME};

/// Outcome of a successful [`merge_events`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    /// Day directories whose shard was rewritten, in write order.
    pub days_written: Vec<String>,
    /// Shard files that existed but could not be decoded and were replaced.
    pub recovered: Vec<Recovered>,
}

/// Merge `events` into the day shards under `room_path`.
///
/// Events are bucketed by the UTC date of their timestamp. Each affected
/// shard is read, deduplicated by event ID (incoming copies replace stored
/// ones), sorted by timestamp and rewritten in full. An empty batch does no
/// I/O at all.
///
/// Days are processed in ascending order and the call stops at the first
/// error; shards written before the failure stay on disk.
pub fn merge_events(room_path: &Path, events: &[Event]) -> Result<MergeReport> {
    let mut report = MergeReport::default();
    if events.is_empty() {
        return Ok(report);
    }

    let mut by_day: BTreeMap<String, Vec<&Event>> = BTreeMap::new();
    for event in events {
        let day = date_util::day_key(event.origin_server_ts).ok_or_else(|| {
            Error::InvalidTimestamp {
                event_id: event.event_id.clone(),
                timestamp: event.origin_server_ts,
            }
        })?;
        by_day.entry(day).or_default().push(event);
    }

    for (day, day_events) in by_day {
        let day_path = room_path.join(&day);
        create_dir_all(&day_path)?;
        let data_path = day_path.join(DATA_FILENAME);

        let existing = match read_optional(&data_path)? {
            Some(data) => match serde_json::from_slice::<Vec<Event>>(&data) {
                Ok(events) => events,
                Err(e) => {
                    log::warn!(
                        "Failed to decode existing data file {}, will overwrite: {e}",
                        data_path.display()
                    );
                    report.recovered.push(Recovered {
                        path: data_path.clone(),
                        message: format!("undecodable shard discarded: {e}"),
                    });
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let merged = dedup_sorted(existing, day_events.into_iter().cloned());
        write_json_atomic(&data_path, &merged)?;
        log::trace!("Wrote {} events to {}", merged.len(), data_path.display());
        report.days_written.push(day);
    }

    Ok(report)
}

/// Union of `existing` and `incoming` keyed by event ID, later copies winning,
/// stably sorted by timestamp.
///
/// Each ID keeps the position where it was first seen, so the order of
/// timestamp ties depends only on merge history.
fn dedup_sorted(existing: Vec<Event>, incoming: impl IntoIterator<Item = Event>) -> Vec<Event> {
    let mut merged: Vec<Event> = Vec::with_capacity(existing.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(existing.len());

    for event in existing.into_iter().chain(incoming) {
        match index.get(&event.event_id) {
            Some(&i) => merged[i] = event,
            None => {
                index.insert(event.event_id.clone(), merged.len());
                merged.push(event);
            }
        }
    }

    merged.sort_by_key(|e| e.origin_server_ts);
    merged
}

/// Read one shard file, returning the decoded events.
pub fn read_shard(path: &Path) -> Result<Vec<Event>> {
    let data = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    serde_json::from_slice(&data).map_err(|e| Error::decode(path, e))
}
