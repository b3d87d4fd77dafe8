//! Fetch queue construction.
//!
//! Verification output becomes an ordered stream of fetch tasks over a
//! bounded channel: the producer suspends once the queue is full, so a very
//! large depot never holds its whole task list in memory.

use crate::manifest::ChunkInfo;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// One queued unit of work: fetch a single chunk of a single file.
/// Created here, consumed and retired by a pool worker.
#[derive(Debug, Clone)]
pub struct FetchTask {
    pub depot_id: u32,
    pub path: PathBuf,
    pub chunk: ChunkInfo,
    pub attempts: u32,
}

pub struct Scheduler {
    tx: mpsc::Sender<FetchTask>,
    seen: HashSet<(PathBuf, u64)>,
}

impl Scheduler {
    /// Creates the scheduler and the receiving end the worker pool drains.
    /// Dropping the scheduler closes the queue.
    pub fn new(queue_depth: usize) -> (Self, mpsc::Receiver<FetchTask>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        (
            Scheduler {
                tx,
                seen: HashSet::new(),
            },
            rx,
        )
    }

    /// Queues one task per bad chunk in ascending offset order, skipping any
    /// (path, offset) already queued through this scheduler. Returns how many
    /// tasks were actually queued; stops early if the consumer went away.
    pub async fn enqueue_file(
        &mut self,
        depot_id: u32,
        path: &Path,
        bad_chunks: &[ChunkInfo],
    ) -> u64 {
        let mut ordered: Vec<&ChunkInfo> = bad_chunks.iter().collect();
        ordered.sort_by_key(|chunk| chunk.offset);

        let mut queued = 0;
        for chunk in ordered {
            if !self.seen.insert((path.to_path_buf(), chunk.offset)) {
                continue;
            }
            let task = FetchTask {
                depot_id,
                path: path.to_path_buf(),
                chunk: chunk.clone(),
                attempts: 0,
            };
            if self.tx.send(task).await.is_err() {
                break;
            }
            queued += 1;
        }
        queued
    }
}
