pub mod checkpoint;
pub mod migrate;
pub mod sanitize;
pub mod shard;

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::source::RoomId;

pub use checkpoint::Checkpoint;
pub use migrate::{migrate_old_rooms, MigrationReport};
pub use sanitize::sanitize_filename;
pub use shard::{merge_events, MergeReport};

/// Name of the per-room resume token file.
pub const CHECKPOINT_FILENAME: &str = "checkpoint.json";
/// Checkpoint file name written by earlier versions of the backup layout.
pub const LEGACY_CHECKPOINT_FILENAME: &str = "metadata.json";
/// Name of the per-day event file inside each `YYYY-MM-DD` directory.
pub const DATA_FILENAME: &str = "data.json";
/// Separates the sanitized label from the room ID in a room directory name.
pub const ROOM_DIR_SEPARATOR: char = ':';

/// Directory name for a room: `<sanitized label>:<room id>`.
pub fn room_dir_name(label: &str, room_id: &RoomId) -> String {
    format!("{}{}{}", sanitize_filename(label), ROOM_DIR_SEPARATOR, room_id)
}

/// Room ID encoded in a room directory name, if it has one.
///
/// The ID starts at the last `:!` so labels containing colons still resolve.
pub fn room_id_from_dir_name(dir_name: &str) -> Option<&str> {
    let marker = format!("{}{}", ROOM_DIR_SEPARATOR, crate::source::ROOM_ID_SIGIL);
    dir_name
        .rfind(&marker)
        .map(|idx| &dir_name[idx + ROOM_DIR_SEPARATOR.len_utf8()..])
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
///
/// The content is written to a temporary file in the same directory and then
/// renamed over the target, so readers never observe a half-written file.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).map_err(|source| Error::Encode {
        what: path.display().to_string(),
        source,
    })?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .map_err(|e| Error::io(dir, e))?;
    tmp.write_all(&data).map_err(|e| Error::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| Error::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| Error::io(path, e.error))?;
    Ok(())
}

/// Read a file, mapping "not found" to `Ok(None)`.
pub(crate) fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(path, e)),
    }
}

pub(crate) fn create_dir_all(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::io(path, e))
}
