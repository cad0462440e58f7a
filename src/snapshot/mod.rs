//! Persistence of infrastructure snapshots between runs.

use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::{debug, info};

use crate::infra::InfraSnapshot;

/// Default location of the state file, relative to the working directory.
pub const DEFAULT_STATE_FILE: &str = "rigger.state.json";

const TEMP_SUFFIX: &str = ".tmp";

/// Errors raised while reading or writing the state file.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the state file holds invalid JSON.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Decoder message.
        message: String,
    },
    /// Raised when a snapshot cannot be encoded.
    #[error("failed to encode snapshot: {0}")]
    Serialize(String),
}

/// JSON file holding the snapshot of the current infrastructure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotStore {
    path: Utf8PathBuf,
}

impl SnapshotStore {
    /// Creates a store backed by `path`. Nothing is touched until the first
    /// operation.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the state file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Reads the stored snapshot, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] when the file exists but cannot be read or
    /// decoded.
    pub fn load(&self) -> Result<Option<InfraSnapshot>, SnapshotError> {
        let (parent, file_name) = self.split()?;
        let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(parent, &err)),
        };
        let contents = match dir.read_to_string(file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&self.path, &err)),
        };

        let snapshot = serde_json::from_str(&contents).map_err(|err| SnapshotError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
        })?;
        debug!(path = %self.path, "loaded infrastructure snapshot");
        Ok(Some(snapshot))
    }

    /// Writes `snapshot`, replacing any previous one atomically.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] when encoding or writing fails.
    pub fn save(&self, snapshot: &InfraSnapshot) -> Result<(), SnapshotError> {
        let (parent, file_name) = self.split()?;
        let rendered = serde_json::to_string_pretty(snapshot)
            .map_err(|err| SnapshotError::Serialize(err.to_string()))?;

        Dir::create_ambient_dir_all(parent, ambient_authority())
            .map_err(|err| io_error(parent, &err))?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority())
            .map_err(|err| io_error(parent, &err))?;

        let temp_name = format!("{file_name}{TEMP_SUFFIX}");
        let temp_path = parent.join(&temp_name);
        let mut file = dir
            .create(&temp_name)
            .map_err(|err| io_error(&temp_path, &err))?;
        file.write_all(rendered.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .and_then(|()| file.sync_all())
            .map_err(|err| io_error(&temp_path, &err))?;
        drop(file);

        dir.rename(&temp_name, &dir, file_name)
            .map_err(|err| io_error(&self.path, &err))?;
        info!(path = %self.path, name = %snapshot.name, "saved infrastructure snapshot");
        Ok(())
    }

    /// Deletes the state file. Returns `false` when there was none.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Io`] when the file exists but cannot be
    /// removed.
    pub fn remove(&self) -> Result<bool, SnapshotError> {
        let (parent, file_name) = self.split()?;
        let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(io_error(parent, &err)),
        };
        match dir.remove_file(file_name) {
            Ok(()) => {
                info!(path = %self.path, "removed infrastructure snapshot");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_error(&self.path, &err)),
        }
    }

    fn split(&self) -> Result<(&Utf8Path, &str), SnapshotError> {
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        let file_name = self.path.file_name().ok_or_else(|| SnapshotError::Io {
            path: self.path.clone(),
            message: String::from("state file path is missing a filename"),
        })?;
        Ok((parent, file_name))
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_FILE)
    }
}

fn io_error(path: &Utf8Path, err: &io::Error) -> SnapshotError {
    SnapshotError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests;
