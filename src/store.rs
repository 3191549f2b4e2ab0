//! Persisting the user-maintained part of the state.
//!
//! Filters, whitelist entries, and user preferences survive restarts. They
//! are kept in a single JSON file that is rewritten completely after every
//! change made through the administrative interface.

use std::{fs, io};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use log::{error, info};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use crate::error::Failed;
use crate::exceptions::LocalExceptions;
use crate::state::{Snapshot, UserPreferences};


//------------ PersistedState ------------------------------------------------

/// The content of the data file.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(flatten)]
    pub exceptions: LocalExceptions,

    #[serde(default)]
    pub user_preferences: UserPreferences,
}

impl PersistedState {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        PersistedState {
            exceptions: snapshot.exceptions().clone(),
            user_preferences: snapshot.preferences(),
        }
    }
}


//------------ Store ---------------------------------------------------------

/// Access to the data file.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,

    /// The version of the last snapshot successfully written.
    ///
    /// The mutex also serializes writing.
    saved: Mutex<Option<u64>>,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Store { path: path.into(), saved: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted state.
    ///
    /// If the file doesn’t exist, the default state is returned. A file
    /// that exists but can’t be read or parsed is an error since the first
    /// save would otherwise replace it and lose whatever it contains.
    pub fn load(&self) -> Result<PersistedState, Failed> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(
                    "No data file {}, starting with empty exceptions.",
                    self.path.display()
                );
                return Ok(PersistedState::default())
            }
            Err(err) => {
                error!(
                    "Fatal: failed to read data file {}: {}",
                    self.path.display(), err
                );
                return Err(Failed)
            }
        };
        serde_json::from_slice(&data).map_err(|err| {
            error!(
                "Fatal: failed to parse data file {}: {}",
                self.path.display(), err
            );
            Failed
        })
    }

    /// Writes the persistent part of a snapshot.
    ///
    /// The file is replaced atomically. If a newer snapshot has been
    /// written already, nothing happens since that one contains all changes
    /// of the given snapshot, too.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), io::Error> {
        let mut saved = self.saved.lock().expect("poisoned store lock");
        if let Some(version) = *saved {
            if version > snapshot.version() {
                return Ok(())
            }
        }
        self.write(&PersistedState::from_snapshot(snapshot))?;
        *saved = Some(snapshot.version());
        Ok(())
    }

    fn write(&self, state: &PersistedState) -> Result<(), io::Error> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut file, state)?;
        file.write_all(b"\n")?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }
}


//============ Tests =========================================================
