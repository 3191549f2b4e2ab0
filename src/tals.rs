//! Trust anchor locators.
//!
//! The trust anchors to validate are configured as a directory of trust
//! anchor locator files. Every file with a `.tal` extension becomes one
//! trust anchor named after the file stem. The files are not read here.
//! The collector is given their path.

use std::{fmt, fs};
use std::path::{Path, PathBuf};
use log::{error, info};
use crate::error::Failed;


//------------ TrustAnchorLocator --------------------------------------------

/// A trust anchor locator found on disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TrustAnchorLocator {
    /// The name of the trust anchor, i.e., the file stem.
    name: String,

    /// The path of the locator file.
    path: PathBuf,
}

impl TrustAnchorLocator {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        TrustAnchorLocator { name: name.into(), path: path.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads all locators from the given directory.
    ///
    /// Fails if the directory cannot be read or contains no locators at
    /// all. The locators are returned ordered by name.
    pub fn read_dir(dir: &Path) -> Result<Vec<Self>, Failed> {
        let entries = fs::read_dir(dir).map_err(|err| {
            error!(
                "Failed to open TAL directory {}: {}.",
                dir.display(), err
            );
            Failed
        })?;

        let mut res = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                error!(
                    "Failed to iterate over TAL directory {}: {}",
                    dir.display(), err
                );
                Failed
            })?;
            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue
            }
            let path = entry.path();
            if path.extension().map(|ext| ext != "tal").unwrap_or(true) {
                continue
            }
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(name) => name.to_string(),
                None => {
                    error!(
                        "Bad TAL file name {}. Skipping.", path.display()
                    );
                    continue
                }
            };
            res.push(TrustAnchorLocator::new(name, path));
        }

        if res.is_empty() {
            error!(
                "No TALs found in TAL directory {}.", dir.display()
            );
            return Err(Failed)
        }
        res.sort_by(|left, right| left.name.cmp(&right.name));
        info!("Found {} TALs in {}.", res.len(), dir.display());
        Ok(res)
    }
}

impl fmt::Display for TrustAnchorLocator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.name)
    }
}


//============ Tests =========================================================
