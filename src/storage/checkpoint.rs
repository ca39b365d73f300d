use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::{
    read_optional, write_json_atomic, CHECKPOINT_FILENAME, LEGACY_CHECKPOINT_FILENAME,
};

/// Per-room resume point: the token to pass as `from` on the next fetch.
///
/// An empty token means "start of history".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub next_token: String,
}

impl Checkpoint {
    /// Load the checkpoint stored in `room_path`.
    ///
    /// A missing file yields the default checkpoint; a file that exists but
    /// does not decode is an error. Falls back to the legacy `metadata.json`
    /// name when `checkpoint.json` is absent.
    pub fn load(room_path: &Path) -> Result<Self> {
        for name in [CHECKPOINT_FILENAME, LEGACY_CHECKPOINT_FILENAME] {
            let path = room_path.join(name);
            if let Some(data) = read_optional(&path)? {
                return serde_json::from_slice(&data).map_err(|e| Error::decode(&path, e));
            }
        }
        Ok(Self::default())
    }

    /// Write this checkpoint to `room_path` atomically.
    pub fn save(&self, room_path: &Path) -> Result<()> {
        write_json_atomic(&room_path.join(CHECKPOINT_FILENAME), self)
    }

    /// Move the checkpoint to `new_token` and persist it.
    ///
    /// Does nothing (and returns `Ok(false)`) when the token is unchanged. The
    /// in-memory value is updated even if the write fails, so the caller can
    /// keep going and the next successful save catches the file up.
    pub fn advance(&mut self, room_path: &Path, new_token: &str) -> Result<bool> {
        if self.next_token == new_token {
            return Ok(false);
        }
        self.next_token = new_token.to_string();
        self.save(room_path)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_missing_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let cp = Checkpoint::load(dir.path()).unwrap();
        assert_eq!(cp, Checkpoint::default());
        assert!(cp.next_token.is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cp = Checkpoint {
            next_token: "t_42".into(),
        };
        cp.save(dir.path()).unwrap();

        let raw = fs::read_to_string(dir.path().join(CHECKPOINT_FILENAME)).unwrap();
        assert!(raw.contains("\"next_token\": \"t_42\""));
        assert_eq!(Checkpoint::load(dir.path()).unwrap(), cp);
    }

    #[test]
    fn test_load_corrupt_is_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CHECKPOINT_FILENAME), b"{not json").unwrap();
        assert!(matches!(
            Checkpoint::load(dir.path()),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn test_load_legacy_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(LEGACY_CHECKPOINT_FILENAME),
            br#"{"next_token": "legacy"}"#,
        )
        .unwrap();
        assert_eq!(Checkpoint::load(dir.path()).unwrap().next_token, "legacy");

        // The current name wins once it exists.
        Checkpoint {
            next_token: "current".into(),
        }
        .save(dir.path())
        .unwrap();
        assert_eq!(Checkpoint::load(dir.path()).unwrap().next_token, "current");
    }

    #[test]
    fn test_advance_unchanged_does_no_io() {
        let dir = tempfile::tempdir().unwrap();
        let mut cp = Checkpoint::default();
        assert!(!cp.advance(dir.path(), "").unwrap());
        assert!(!dir.path().join(CHECKPOINT_FILENAME).exists());

        // Unchanged token against an unwritable location still succeeds.
        let mut cp = Checkpoint {
            next_token: "same".into(),
        };
        assert!(!cp.advance(&dir.path().join("missing"), "same").unwrap());
    }

    #[test]
    fn test_advance_failure_keeps_in_memory_value() {
        let dir = tempfile::tempdir().unwrap();
        Checkpoint {
            next_token: "old".into(),
        }
        .save(dir.path())
        .unwrap();

        let mut cp = Checkpoint::load(dir.path()).unwrap();
        let missing = dir.path().join("gone");
        assert!(cp.advance(&missing, "new").is_err());
        assert_eq!(cp.next_token, "new");

        // Nothing was written anywhere; the durable value is still the old one.
        assert_eq!(Checkpoint::load(&missing).unwrap().next_token, "");
        assert_eq!(Checkpoint::load(dir.path()).unwrap().next_token, "old");
    }
}
