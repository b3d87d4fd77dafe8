//! Bounded-concurrency chunk download execution.
//!
//! N workers drain the fetch queue. Writes for one file go through a single
//! shared handle behind a mutex; tasks never overlap in byte range, so the
//! mutex only serializes the seek+write pair, not whole chunks of work.

use crate::downloader::scheduler::FetchTask;
use crate::fetch::{ChunkFetcher, FetchError};
use crate::progress::ProgressSink;
use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("fetched bytes do not match the expected hash")]
    HashMismatch,
    #[error("write failed: {0}")]
    Write(#[from] std::io::Error),
}

impl ChunkError {
    fn is_retryable(&self) -> bool {
        match self {
            ChunkError::Fetch(err) => err.is_retryable(),
            // a corrupt transfer may succeed on the next attempt
            ChunkError::HashMismatch => true,
            // disk full or permissions will not fix themselves
            ChunkError::Write(_) => false,
        }
    }
}

/// File-level escalation of a chunk that ran out of attempts. Carries enough
/// context for the caller to decide whether the whole run is worth retrying.
#[derive(Debug, Error)]
#[error("{path:?}: chunk at offset {offset} failed after {attempts} attempt(s): {source}")]
pub struct FileFailure {
    pub path: PathBuf,
    pub offset: u64,
    pub attempts: u32,
    #[source]
    pub source: ChunkError,
}

/// Bounded retry with exponential backoff, injected into the pool rather
/// than hard-coded in the retry loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt after `attempt` failed ones: base, 2x, 4x...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default)]
pub struct PoolOutcome {
    /// Files whose every queued chunk was fetched, verified, and written.
    pub completed_files: HashSet<PathBuf>,
    pub failures: Vec<FileFailure>,
    pub chunks_fetched: u64,
    pub bytes_fetched: u64,
    /// True when the run-level token stopped the pool (not fail-fast).
    pub cancelled: bool,
}

pub struct WorkerPool {
    fetcher: Arc<dyn ChunkFetcher>,
    sink: Arc<dyn ProgressSink>,
    retry: RetryPolicy,
    workers: usize,
    fail_fast: bool,
    cancel: CancellationToken,
}

struct Shared {
    fetcher: Arc<dyn ChunkFetcher>,
    sink: Arc<dyn ProgressSink>,
    retry: RetryPolicy,
    fail_fast: bool,
    stop: CancellationToken,
    root: PathBuf,
    /// One write handle per file, opened on first use and shared by every
    /// worker touching that file.
    handles: Mutex<HashMap<PathBuf, Arc<Mutex<File>>>>,
    /// Chunks still outstanding per file; a file completes when it hits 0.
    remaining: Mutex<HashMap<PathBuf, u64>>,
    /// Files that already failed; their remaining tasks are dropped.
    failed: Mutex<HashSet<PathBuf>>,
    outcome: Mutex<PoolOutcome>,
}

enum TaskEnd {
    Done,
    Failed(u32, FileFailure),
    Cancelled,
}

impl WorkerPool {
    pub fn new(
        fetcher: Arc<dyn ChunkFetcher>,
        sink: Arc<dyn ProgressSink>,
        retry: RetryPolicy,
        workers: usize,
        fail_fast: bool,
        cancel: CancellationToken,
    ) -> Self {
        WorkerPool {
            fetcher,
            sink,
            retry,
            workers,
            fail_fast,
            cancel,
        }
    }

    /// Drains `rx` with the configured number of workers and reports what
    /// completed. `remaining` maps each scheduled file to its queued chunk
    /// count; paths are relative to `root`.
    pub async fn run(
        &self,
        root: &Path,
        rx: mpsc::Receiver<FetchTask>,
        remaining: HashMap<PathBuf, u64>,
    ) -> PoolOutcome {
        let shared = Arc::new(Shared {
            fetcher: Arc::clone(&self.fetcher),
            sink: Arc::clone(&self.sink),
            retry: self.retry.clone(),
            fail_fast: self.fail_fast,
            // fail-fast cancels this child without marking the whole run
            stop: self.cancel.child_token(),
            root: root.to_path_buf(),
            handles: Mutex::new(HashMap::new()),
            remaining: Mutex::new(remaining),
            failed: Mutex::new(HashSet::new()),
            outcome: Mutex::new(PoolOutcome::default()),
        });

        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::new();
        for _ in 0..self.workers.max(1) {
            workers.push(tokio::spawn(Self::worker(
                Arc::clone(&shared),
                Arc::clone(&rx),
            )));
        }
        for worker in workers {
            let _ = worker.await;
        }

        let mut outcome = std::mem::take(&mut *shared.outcome.lock().await);
        outcome.cancelled = self.cancel.is_cancelled();
        outcome
    }

    async fn worker(shared: Arc<Shared>, rx: Arc<Mutex<mpsc::Receiver<FetchTask>>>) {
        loop {
            let task = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    biased;
                    _ = shared.stop.cancelled() => None,
                    task = rx.recv() => task,
                }
            };
            let Some(task) = task else { break };

            if shared.failed.lock().await.contains(&task.path) {
                continue;
            }

            match Self::run_task(&shared, task).await {
                TaskEnd::Done => {}
                TaskEnd::Cancelled => break,
                TaskEnd::Failed(depot_id, failure) => {
                    let first = shared.failed.lock().await.insert(failure.path.clone());
                    if first {
                        tracing::warn!(
                            depot = depot_id,
                            path = %failure.path.display(),
                            "file failed: {failure}"
                        );
                        shared.sink.file_failed(depot_id, &failure);
                        shared.outcome.lock().await.failures.push(failure);
                        if shared.fail_fast {
                            shared.stop.cancel();
                        }
                    }
                }
            }
        }
    }

    async fn run_task(shared: &Arc<Shared>, mut task: FetchTask) -> TaskEnd {
        loop {
            task.attempts += 1;
            match Self::attempt(shared, &task).await {
                Ok(()) => {
                    shared.sink.chunk_done(task.depot_id, &task.path, &task.chunk);
                    {
                        let mut outcome = shared.outcome.lock().await;
                        outcome.chunks_fetched += 1;
                        outcome.bytes_fetched += task.chunk.length;
                    }
                    let finished = {
                        let mut remaining = shared.remaining.lock().await;
                        match remaining.get_mut(&task.path) {
                            Some(left) => {
                                *left = left.saturating_sub(1);
                                *left == 0
                            }
                            None => false,
                        }
                    };
                    if finished {
                        shared.sink.file_done(task.depot_id, &task.path);
                        shared
                            .outcome
                            .lock()
                            .await
                            .completed_files
                            .insert(task.path.clone());
                    }
                    return TaskEnd::Done;
                }
                Err(err) => {
                    if err.is_retryable() && task.attempts < shared.retry.max_attempts {
                        let delay = shared.retry.backoff(task.attempts);
                        tracing::debug!(
                            path = %task.path.display(),
                            offset = task.chunk.offset,
                            attempt = task.attempts,
                            "chunk attempt failed, backing off: {err}"
                        );
                        tokio::select! {
                            biased;
                            _ = shared.stop.cancelled() => return TaskEnd::Cancelled,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                    return TaskEnd::Failed(
                        task.depot_id,
                        FileFailure {
                            path: task.path,
                            offset: task.chunk.offset,
                            attempts: task.attempts,
                            source: err,
                        },
                    );
                }
            }
        }
    }

    /// One fetch-verify-write attempt. The fetched bytes are hashed before
    /// anything touches the disk; a chunk is only ever reported complete
    /// after both the hash check and the write succeeded.
    async fn attempt(shared: &Arc<Shared>, task: &FetchTask) -> Result<(), ChunkError> {
        let bytes = shared.fetcher.fetch(task.depot_id, &task.chunk).await?;
        if !task.chunk.matches(&bytes) {
            return Err(ChunkError::HashMismatch);
        }

        let handle = Self::file_handle(shared, &task.path).await?;
        let mut file = handle.lock().await;
        file.seek(SeekFrom::Start(task.chunk.offset)).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(())
    }

    async fn file_handle(
        shared: &Arc<Shared>,
        relative: &Path,
    ) -> std::io::Result<Arc<Mutex<File>>> {
        let mut handles = shared.handles.lock().await;
        if let Some(handle) = handles.get(relative) {
            return Ok(Arc::clone(handle));
        }

        let local = shared.root.join(relative);
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // no truncate: verified bytes already on disk must survive
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&local)
            .await?;
        let handle = Arc::new(Mutex::new(file));
        handles.insert(relative.to_path_buf(), Arc::clone(&handle));
        Ok(handle)
    }
}
