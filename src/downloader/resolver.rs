//! Cross-depot ownership tracking.
//!
//! Depots are applied here strictly in the order they were supplied, so the
//! last depot to provide a path owns it no matter which download finished
//! first on the wall clock. The resolver is only ever driven from the
//! orchestrator's sequential per-depot loop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverwriteEntry {
    pub path: PathBuf,
    pub previous_depot: u32,
    pub new_depot: u32,
}

#[derive(Debug, Default)]
pub struct OverwriteResolver {
    owners: HashMap<PathBuf, u32>,
    log: Vec<OverwriteEntry>,
}

impl OverwriteResolver {
    pub fn new() -> Self {
        OverwriteResolver::default()
    }

    /// Records that `depot_id` provides `path`. A change of owner appends to
    /// the overwrite log; the same depot registering a path twice is a no-op.
    pub fn register(&mut self, path: &Path, depot_id: u32) {
        match self.owners.get(path) {
            Some(&owner) if owner == depot_id => {}
            Some(&owner) => {
                self.log.push(OverwriteEntry {
                    path: path.to_path_buf(),
                    previous_depot: owner,
                    new_depot: depot_id,
                });
                self.owners.insert(path.to_path_buf(), depot_id);
            }
            None => {
                self.owners.insert(path.to_path_buf(), depot_id);
            }
        }
    }

    pub fn owners(&self) -> &HashMap<PathBuf, u32> {
        &self.owners
    }

    pub fn log(&self) -> &[OverwriteEntry] {
        &self.log
    }

    pub fn into_parts(self) -> (HashMap<PathBuf, u32>, Vec<OverwriteEntry>) {
        (self.owners, self.log)
    }
}

pub const REPORT_FILE: &str = "overwritten_files.txt";

/// Writes the overwrite report under `root`, one line per overwrite in
/// resolution order. Written to a temp file and renamed into place so a
/// crash can never leave a half-written report. Returns the report path, or
/// `None` when there was nothing to report.
pub async fn write_report(
    root: &Path,
    entries: &[OverwriteEntry],
) -> std::io::Result<Option<PathBuf>> {
    if entries.is_empty() {
        return Ok(None);
    }

    let mut text =
        String::from("# File versions from depots listed later in the recipe were kept.\n\n");
    for entry in entries {
        text.push_str(&format!(
            "File \"{}\" from depot {} was overwritten by depot {}.\n",
            entry.path.display(),
            entry.previous_depot,
            entry.new_depot
        ));
    }

    let final_path = root.join(REPORT_FILE);
    let tmp_path = final_path.with_extension("tmp");
    tokio::fs::write(&tmp_path, text).await?;
    tokio::fs::rename(&tmp_path, &final_path).await?;
    Ok(Some(final_path))
}
