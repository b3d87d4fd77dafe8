//! Progress reporting collaborator.
//!
//! The engine publishes chunk, file, and depot events through this trait and
//! never decides how they are rendered. The CLI renders a byte bar; tests
//! record events or ignore them.

use crate::downloader::DepotState;
use crate::downloader::pool::FileFailure;
use crate::downloader::resolver::OverwriteEntry;
use crate::manifest::ChunkInfo;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Mutex;

pub trait ProgressSink: Send + Sync {
    /// A download phase is starting and will fetch `total_bytes` in chunks.
    fn download_started(&self, _depot_id: u32, _total_bytes: u64) {}
    fn chunk_done(&self, _depot_id: u32, _path: &Path, _chunk: &ChunkInfo) {}
    fn file_done(&self, _depot_id: u32, _path: &Path) {}
    fn file_failed(&self, _depot_id: u32, _failure: &FileFailure) {}
    fn depot_state(&self, _depot_id: u32, _state: DepotState) {}
    /// The run is over; `entries` is the full overwrite log in order.
    fn overwrites(&self, _entries: &[OverwriteEntry]) {}
}

/// Sink that swallows everything. Callers embedding the engine can start
/// here and observe only the run summary.
pub struct NullSink;

impl ProgressSink for NullSink {}

/// Terminal sink: one byte-granular bar per depot download phase, file
/// failures surfaced as they happen.
pub struct ConsoleSink {
    bar: Mutex<Option<ProgressBar>>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        ConsoleSink {
            bar: Mutex::new(None),
        }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ConsoleSink {
    fn download_started(&self, depot_id: u32, total_bytes: u64) {
        let bar = ProgressBar::new(total_bytes);
        bar.set_style(
            ProgressStyle::with_template(
                "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
            )
            .unwrap()
            .progress_chars("##-"),
        );
        bar.set_message(format!("depot {}", depot_id));
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(old) = slot.take() {
                old.finish_and_clear();
            }
            *slot = Some(bar);
        }
    }

    fn chunk_done(&self, _depot_id: u32, _path: &Path, chunk: &ChunkInfo) {
        if let Ok(slot) = self.bar.lock() {
            if let Some(bar) = slot.as_ref() {
                bar.inc(chunk.length);
            }
        }
    }

    fn file_done(&self, depot_id: u32, path: &Path) {
        tracing::debug!(depot = depot_id, path = %path.display(), "file complete");
    }

    fn file_failed(&self, depot_id: u32, failure: &FileFailure) {
        if let Ok(slot) = self.bar.lock() {
            match slot.as_ref() {
                Some(bar) => bar.println(format!("depot {}: {}", depot_id, failure)),
                None => eprintln!("depot {}: {}", depot_id, failure),
            }
        }
    }

    fn depot_state(&self, depot_id: u32, state: DepotState) {
        if matches!(state, DepotState::Completed | DepotState::Failed) {
            if let Ok(mut slot) = self.bar.lock() {
                if let Some(bar) = slot.take() {
                    bar.finish_and_clear();
                }
            }
        }
        tracing::info!(depot = depot_id, state = %state, "depot state");
    }

    fn overwrites(&self, entries: &[OverwriteEntry]) {
        if !entries.is_empty() {
            println!(
                "{} file(s) were overwritten by later depots.",
                entries.len()
            );
        }
    }
}
