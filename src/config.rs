use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default credentials file, shared with matrix-commander.
pub const DEFAULT_CREDENTIALS_PATH: &str = "~/.config/matrix-commander/credentials.json";

/// On-disk credentials, in the format matrix-commander writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homeserver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// Credentials as given on the command line, before merging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialOverrides {
    pub server: Option<String>,
    pub user: Option<String>,
    pub token: Option<String>,
    pub device: Option<String>,
}

/// Validated credentials used to talk to the homeserver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub server: String,
    pub user: String,
    pub token: String,
    pub device: Option<String>,
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Read the credentials file at `path`.
///
/// Returns `Ok(None)` when the file does not exist. A file that cannot be
/// read or parsed is an error.
pub fn load_credentials_file(path: &Path) -> Result<Option<CredentialsFile>> {
    log::info!("Loading credentials from {}", path.display());
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::warn!(
                "Config file {} not found, relying on command line flags",
                path.display()
            );
            return Ok(None);
        }
        Err(e) => {
            return Err(Error::Config(format!(
                "failed to read config file {}: {e}",
                path.display()
            )))
        }
    };
    serde_json::from_slice(&data).map(Some).map_err(|e| {
        Error::Config(format!(
            "failed to parse config file {}: {e}",
            path.display()
        ))
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Credentials {
    /// Merge flag values over file values and check that everything required
    /// is present. Every missing field is named in the one error.
    pub fn resolve(flags: CredentialOverrides, file: Option<CredentialsFile>) -> Result<Self> {
        let file = file.unwrap_or_default();
        let server = non_empty(flags.server).or(non_empty(file.homeserver));
        let user = non_empty(flags.user).or(non_empty(file.user_id));
        let token = non_empty(flags.token).or(non_empty(file.access_token));
        let device = non_empty(flags.device).or(non_empty(file.device_id));

        let mut missing = Vec::new();
        if server.is_none() {
            missing.push("Server (--server or config file)");
        }
        if user.is_none() {
            missing.push("User (--user or config file)");
        }
        if token.is_none() {
            missing.push("Token (--token or config file)");
        }

        match (server, user, token) {
            (Some(server), Some(user), Some(token)) => Ok(Self {
                server,
                user,
                token,
                device,
            }),
            _ => Err(Error::Config(format!(
                "missing required credentials: {}",
                missing.join(", ")
            ))),
        }
    }

    /// Load the file at `path` (if any) and merge it with `flags`.
    pub fn load(flags: CredentialOverrides, path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => load_credentials_file(path)?,
            None => None,
        };
        Self::resolve(flags, file)
    }
}
