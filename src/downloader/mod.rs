//! The download engine: verification, scheduling, execution, and cross-depot
//! ownership, driven depot by depot in the order the recipe declared them.

pub mod pool;
pub mod resolver;
pub mod scheduler;
pub mod verifier;

use crate::fetch::ChunkFetcher;
use crate::manifest::{ChunkInfo, Depot, FileEntry, ManifestError, safe_join};
use crate::progress::ProgressSink;
use crate::utils::bounded::BoundedSpawner;
use crate::utils::multierr::MultiError;
use pool::{ChunkError, FileFailure, PoolOutcome, RetryPolicy, WorkerPool};
use resolver::{OverwriteEntry, OverwriteResolver};
use scheduler::Scheduler;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio_util::sync::CancellationToken;
use verifier::verify_file;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepotState {
    Queued,
    Verifying,
    Downloading,
    Repairing,
    Completed,
    Failed,
}

impl fmt::Display for DepotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DepotState::Queued => "queued",
            DepotState::Verifying => "verifying",
            DepotState::Downloading => "downloading",
            DepotState::Repairing => "repairing",
            DepotState::Completed => "completed",
            DepotState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub root: PathBuf,
    pub workers: usize,
    pub queue_depth: usize,
    pub retry: RetryPolicy,
    /// Abort the whole run on the first failed file.
    pub fail_fast: bool,
    /// Run one extra pass over failed chunks before giving up on a depot.
    pub repair: bool,
}

impl DownloadConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DownloadConfig {
            root: root.into(),
            workers: 8,
            queue_depth: 64,
            retry: RetryPolicy::default(),
            fail_fast: false,
            repair: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("i/o failure under the target root: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct DepotReport {
    pub depot_id: u32,
    pub state: DepotState,
    /// Owned files verified or downloaded to completion.
    pub files_completed: usize,
    /// Files this depot provides but a later depot owns; never fetched.
    pub files_superseded: usize,
    pub failures: Vec<FileFailure>,
    pub chunks_fetched: u64,
    pub bytes_fetched: u64,
}

#[derive(Debug)]
pub struct RunSummary {
    pub depots: Vec<DepotReport>,
    pub owners: HashMap<PathBuf, u32>,
    pub overwrites: Vec<OverwriteEntry>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn is_complete(&self) -> bool {
        !self.cancelled
            && self
                .depots
                .iter()
                .all(|d| d.state == DepotState::Completed)
    }

    /// Flattens every file failure into one error, for callers that want a
    /// process exit code rather than a report.
    pub fn into_result(self) -> Result<(), MultiError<FileFailure>> {
        let failures: Vec<FileFailure> = self
            .depots
            .into_iter()
            .flat_map(|depot| depot.failures)
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(MultiError::new(failures))
        }
    }
}

struct PlannedFile {
    entry: FileEntry,
    local: PathBuf,
    /// False when a later depot also provides this path. Superseded files
    /// are registered for the overwrite log but never verified or fetched;
    /// fetching them would only produce bytes the later depot immediately
    /// replaces, and re-fetching them on a second run would break
    /// idempotence.
    owned: bool,
}

pub struct Orchestrator {
    config: DownloadConfig,
    fetcher: Arc<dyn ChunkFetcher>,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: DownloadConfig,
        fetcher: Arc<dyn ChunkFetcher>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Orchestrator {
            config,
            fetcher,
            sink,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the run: workers wind down promptly, in-flight files
    /// are cut back to their verified boundary, and a later run resumes from
    /// exactly that point.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Processes every depot in the order given and reports the outcome.
    /// Manifest problems are caught up front, before anything touches the
    /// disk or the network.
    pub async fn run(&self, depots: &[Depot]) -> Result<RunSummary, DownloadError> {
        let plans = plan_depots(&self.config.root, depots)?;
        tokio::fs::create_dir_all(&self.config.root).await?;

        let mut resolver = OverwriteResolver::new();
        let mut reports = Vec::new();
        for (depot, files) in depots.iter().zip(plans) {
            if self.cancel.is_cancelled() {
                break;
            }
            reports.push(self.process_depot(depot, files, &mut resolver).await);
        }

        self.sink.overwrites(resolver.log());
        let (owners, overwrites) = resolver.into_parts();
        Ok(RunSummary {
            depots: reports,
            owners,
            overwrites,
            cancelled: self.cancel.is_cancelled(),
        })
    }

    async fn process_depot(
        &self,
        depot: &Depot,
        files: Vec<PlannedFile>,
        resolver: &mut OverwriteResolver,
    ) -> DepotReport {
        let depot_id = depot.id;
        self.sink.depot_state(depot_id, DepotState::Queued);
        self.sink.depot_state(depot_id, DepotState::Verifying);
        tracing::info!(
            depot = depot_id,
            manifest = %depot.manifest_gid,
            files = files.len(),
            "verifying depot"
        );

        let mut completed: HashSet<PathBuf> = HashSet::new();
        let mut failures: Vec<FileFailure> = Vec::new();
        let mut to_fetch: Vec<(FileEntry, PathBuf, Vec<ChunkInfo>)> = Vec::new();

        let spawner = BoundedSpawner::new(self.config.workers);
        let mut handles = Vec::new();
        for planned in files.iter().filter(|f| f.owned) {
            let entry = planned.entry.clone();
            let local = planned.local.clone();
            handles.push(
                spawner
                    .spawn(async move {
                        if entry.total_size == 0 {
                            let created = materialize_empty(&local).await;
                            (entry, created.map(|_| Vec::new()))
                        } else {
                            let verified = verify_file(&entry, &local, true).await;
                            (entry, verified.map(|v| v.bad_chunks))
                        }
                    })
                    .await,
            );
        }
        for (handle, planned) in handles.into_iter().zip(files.iter().filter(|f| f.owned)) {
            let Ok((entry, outcome)) = handle.await else {
                tracing::error!(path = %planned.entry.path.display(), "verification task died");
                continue;
            };
            match outcome {
                Ok(bad) if bad.is_empty() => {
                    completed.insert(entry.path.clone());
                }
                Ok(bad) => to_fetch.push((entry, planned.local.clone(), bad)),
                Err(err) => failures.push(FileFailure {
                    path: entry.path.clone(),
                    offset: 0,
                    attempts: 0,
                    source: ChunkError::Write(err),
                }),
            }
        }

        let mut chunks_fetched = 0u64;
        let mut bytes_fetched = 0u64;

        if !to_fetch.is_empty() && !self.cancel.is_cancelled() {
            self.sink.depot_state(depot_id, DepotState::Downloading);
            let total: u64 = to_fetch
                .iter()
                .map(|(_, _, bad)| bad.iter().map(|c| c.length).sum::<u64>())
                .sum();
            self.sink.download_started(depot_id, total);
            tracing::info!(
                depot = depot_id,
                files = to_fetch.len(),
                bytes = total,
                "fetching missing chunks"
            );

            let outcome = self.run_queue(depot_id, &to_fetch).await;
            chunks_fetched += outcome.chunks_fetched;
            bytes_fetched += outcome.bytes_fetched;
            completed.extend(outcome.completed_files);
            failures.extend(outcome.failures);

            if !failures.is_empty() && self.config.repair && !self.cancel.is_cancelled() {
                self.sink.depot_state(depot_id, DepotState::Repairing);
                let outcome = self
                    .repair_pass(depot_id, &files, &mut completed, &mut failures)
                    .await;
                chunks_fetched += outcome.chunks_fetched;
                bytes_fetched += outcome.bytes_fetched;
            }
        }

        // never leave a partially-written file longer than its verified
        // prefix when the run is being torn down
        if self.cancel.is_cancelled() {
            for (entry, local, _) in &to_fetch {
                if !completed.contains(&entry.path) {
                    let _ = verify_file(entry, local, true).await;
                }
            }
        }

        let cancelled = self.cancel.is_cancelled();
        let state = if cancelled || !failures.is_empty() {
            DepotState::Failed
        } else {
            DepotState::Completed
        };

        let mut files_completed = 0;
        let mut files_superseded = 0;
        for planned in &files {
            if !planned.owned {
                files_superseded += 1;
                if !cancelled {
                    resolver.register(&planned.entry.path, depot_id);
                }
            } else if completed.contains(&planned.entry.path) {
                files_completed += 1;
                if !cancelled {
                    resolver.register(&planned.entry.path, depot_id);
                }
            }
        }

        self.sink.depot_state(depot_id, state);
        if state == DepotState::Completed {
            tracing::info!(depot = depot_id, files = files_completed, "depot completed");
        } else {
            tracing::warn!(
                depot = depot_id,
                failed = failures.len(),
                cancelled,
                "depot did not complete"
            );
        }

        DepotReport {
            depot_id,
            state,
            files_completed,
            files_superseded,
            failures,
            chunks_fetched,
            bytes_fetched,
        }
    }

    /// Re-verifies previously failed files and queues whatever is still
    /// outstanding through a fresh scheduler. Recovered files drop out of the
    /// failure list; files that fail again keep their newest failure.
    async fn repair_pass(
        &self,
        depot_id: u32,
        files: &[PlannedFile],
        completed: &mut HashSet<PathBuf>,
        failures: &mut Vec<FileFailure>,
    ) -> PoolOutcome {
        let failed_paths: HashSet<PathBuf> = failures.iter().map(|f| f.path.clone()).collect();
        let mut targets = Vec::new();
        for planned in files
            .iter()
            .filter(|f| f.owned && failed_paths.contains(&f.entry.path))
        {
            match verify_file(&planned.entry, &planned.local, true).await {
                Ok(result) if result.is_complete() => {
                    completed.insert(planned.entry.path.clone());
                    failures.retain(|f| f.path != planned.entry.path);
                }
                Ok(result) => {
                    targets.push((planned.entry.clone(), planned.local.clone(), result.bad_chunks))
                }
                Err(_) => {} // keep the failure it already has
            }
        }
        if targets.is_empty() {
            return PoolOutcome::default();
        }

        tracing::info!(depot = depot_id, files = targets.len(), "repair pass");
        let outcome = self.run_queue(depot_id, &targets).await;
        failures.retain(|f| !outcome.completed_files.contains(&f.path));
        completed.extend(outcome.completed_files.iter().cloned());
        for failure in &outcome.failures {
            failures.retain(|f| f.path != failure.path);
        }
        let mut outcome = outcome;
        failures.append(&mut outcome.failures);
        outcome
    }

    /// Wires one scheduler, one producer, and one worker pool together for a
    /// batch of files and drives the queue dry.
    async fn run_queue(
        &self,
        depot_id: u32,
        targets: &[(FileEntry, PathBuf, Vec<ChunkInfo>)],
    ) -> PoolOutcome {
        let (mut scheduler, rx) = Scheduler::new(self.config.queue_depth);
        let remaining: HashMap<PathBuf, u64> = targets
            .iter()
            .map(|(entry, _, bad)| (entry.path.clone(), bad.len() as u64))
            .collect();

        let queue_input: Vec<(PathBuf, Vec<ChunkInfo>)> = targets
            .iter()
            .map(|(entry, _, bad)| (entry.path.clone(), bad.clone()))
            .collect();
        let producer = tokio::spawn(async move {
            for (path, bad) in queue_input {
                scheduler.enqueue_file(depot_id, &path, &bad).await;
            }
        });

        let pool = WorkerPool::new(
            Arc::clone(&self.fetcher),
            Arc::clone(&self.sink),
            self.config.retry.clone(),
            self.config.workers,
            self.config.fail_fast,
            self.cancel.clone(),
        );
        let outcome = pool.run(&self.config.root, rx, remaining).await;
        let _ = producer.await;
        outcome
    }
}

/// Validates every manifest and resolves every target path before a run
/// starts, and marks which depot finally owns each path.
fn plan_depots(root: &Path, depots: &[Depot]) -> Result<Vec<Vec<PlannedFile>>, ManifestError> {
    let mut final_owner: HashMap<PathBuf, usize> = HashMap::new();
    for (index, depot) in depots.iter().enumerate() {
        depot.manifest.validate()?;
        for entry in &depot.manifest.files {
            final_owner.insert(entry.path.clone(), index);
        }
    }

    let mut plans = Vec::with_capacity(depots.len());
    for (index, depot) in depots.iter().enumerate() {
        let mut files = Vec::with_capacity(depot.manifest.files.len());
        for entry in &depot.manifest.files {
            let local = safe_join(root, &entry.path)?;
            files.push(PlannedFile {
                entry: entry.clone(),
                local,
                owned: final_owner[&entry.path] == index,
            });
        }
        plans.push(files);
    }
    Ok(plans)
}

async fn materialize_empty(local: &Path) -> std::io::Result<()> {
    if let Some(parent) = local.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(local)
        .await?;
    Ok(())
}

#[derive(Debug)]
pub struct VerifyFileReport {
    pub depot_id: u32,
    pub path: PathBuf,
    pub missing_chunks: usize,
    pub bytes_needed: u64,
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub files_ok: usize,
    pub needs_repair: Vec<VerifyFileReport>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.needs_repair.is_empty()
    }

    pub fn bytes_needed(&self) -> u64 {
        self.needs_repair.iter().map(|f| f.bytes_needed).sum()
    }
}

/// Read-only integrity check of the final merged tree: each path is checked
/// against the depot that finally owns it. Nothing is truncated, created, or
/// fetched.
pub async fn verify_tree(
    config: &DownloadConfig,
    depots: &[Depot],
) -> Result<VerifyReport, DownloadError> {
    let plans = plan_depots(&config.root, depots)?;

    let mut report = VerifyReport::default();
    let spawner = BoundedSpawner::new(config.workers);
    for (depot, files) in depots.iter().zip(plans) {
        let mut handles = Vec::new();
        for planned in files.into_iter().filter(|f| f.owned) {
            let depot_id = depot.id;
            handles.push(
                spawner
                    .spawn(async move {
                        let (ok, missing_chunks, bytes_needed) = if planned.entry.total_size == 0 {
                            let ok = matches!(
                                tokio::fs::metadata(&planned.local).await,
                                Ok(meta) if meta.is_file() && meta.len() == 0
                            );
                            (ok, 0, 0)
                        } else {
                            match verify_file(&planned.entry, &planned.local, false).await {
                                Ok(result) => (
                                    result.is_complete(),
                                    result.bad_chunks.len(),
                                    result.bytes_needed(),
                                ),
                                Err(_) => (
                                    false,
                                    planned.entry.chunks.len(),
                                    planned.entry.chunks.iter().map(|c| c.length).sum(),
                                ),
                            }
                        };
                        (depot_id, planned.entry.path, ok, missing_chunks, bytes_needed)
                    })
                    .await,
            );
        }
        for handle in handles {
            let Ok((depot_id, path, ok, missing_chunks, bytes_needed)) = handle.await else {
                continue;
            };
            if ok {
                report.files_ok += 1;
            } else {
                report.needs_repair.push(VerifyFileReport {
                    depot_id,
                    path,
                    missing_chunks,
                    bytes_needed,
                });
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchError;
    use crate::manifest::{Manifest, sha1_hex};
    use crate::progress::NullSink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    struct MapFetcher {
        chunks: HashMap<String, Vec<u8>>,
        transient_failures: std::sync::Mutex<HashMap<String, u32>>,
        calls: AtomicU64,
        cancel_on: std::sync::Mutex<Option<(String, CancellationToken)>>,
    }

    impl MapFetcher {
        fn serving(data: &[&[u8]]) -> Arc<Self> {
            Arc::new(MapFetcher {
                chunks: data
                    .iter()
                    .map(|bytes| (sha1_hex(bytes), bytes.to_vec()))
                    .collect(),
                transient_failures: std::sync::Mutex::new(HashMap::new()),
                calls: AtomicU64::new(0),
                cancel_on: std::sync::Mutex::new(None),
            })
        }

        fn fail_transiently(&self, data: &[u8], times: u32) {
            self.transient_failures
                .lock()
                .unwrap()
                .insert(sha1_hex(data), times);
        }

        fn cancel_when_asked_for(&self, data: &[u8], token: CancellationToken) {
            *self.cancel_on.lock().unwrap() = Some((sha1_hex(data), token));
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChunkFetcher for MapFetcher {
        async fn fetch(&self, _depot_id: u32, chunk: &ChunkInfo) -> Result<Vec<u8>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((sha1, token)) = &*self.cancel_on.lock().unwrap() {
                if *sha1 == chunk.sha1 {
                    token.cancel();
                    return Err(FetchError::Transient {
                        reason: "connection torn down".to_string(),
                    });
                }
            }
            if let Some(left) = self
                .transient_failures
                .lock()
                .unwrap()
                .get_mut(&chunk.sha1)
            {
                if *left > 0 {
                    *left -= 1;
                    return Err(FetchError::Transient {
                        reason: "scripted outage".to_string(),
                    });
                }
            }
            match self.chunks.get(&chunk.sha1) {
                Some(bytes) => Ok(bytes.clone()),
                None => Err(FetchError::NotFound {
                    sha1: chunk.sha1.clone(),
                }),
            }
        }
    }

    struct StateSink {
        states: std::sync::Mutex<Vec<(u32, DepotState)>>,
    }

    impl ProgressSink for StateSink {
        fn depot_state(&self, depot_id: u32, state: DepotState) {
            self.states.lock().unwrap().push((depot_id, state));
        }
    }

    fn entry(path: &str, parts: &[&[u8]]) -> FileEntry {
        let mut chunks = Vec::new();
        let mut offset = 0u64;
        for part in parts {
            chunks.push(ChunkInfo {
                offset,
                length: part.len() as u64,
                sha1: sha1_hex(part),
            });
            offset += part.len() as u64;
        }
        FileEntry {
            path: PathBuf::from(path),
            total_size: offset,
            chunks,
        }
    }

    fn depot(id: u32, files: Vec<FileEntry>) -> Depot {
        Depot {
            id,
            manifest_gid: format!("{}000", id),
            key: String::new(),
            manifest: Manifest { files },
        }
    }

    fn quick_config(root: &Path) -> DownloadConfig {
        let mut config = DownloadConfig::new(root);
        config.workers = 4;
        config.retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
        };
        config
    }

    fn orchestrator(root: &Path, fetcher: Arc<dyn ChunkFetcher>) -> Orchestrator {
        Orchestrator::new(quick_config(root), fetcher, Arc::new(NullSink))
    }

    #[tokio::test]
    async fn fresh_download_builds_the_tree() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::serving(&[b"aaaa", b"bbbb", b"cc"]);
        let depots = vec![depot(
            440,
            vec![
                entry("bin/game.bin", &[b"aaaa", b"bbbb", b"cc"]),
                entry("empty.cfg", &[]),
            ],
        )];
        let orch = orchestrator(dir.path(), Arc::clone(&fetcher) as Arc<dyn ChunkFetcher>);

        let summary = orch.run(&depots).await.unwrap();

        assert!(summary.is_complete());
        assert_eq!(summary.depots[0].state, DepotState::Completed);
        assert_eq!(summary.depots[0].files_completed, 2);
        assert_eq!(summary.depots[0].chunks_fetched, 3);
        assert_eq!(summary.depots[0].bytes_fetched, 10);
        assert_eq!(
            std::fs::read(dir.path().join("bin/game.bin")).unwrap(),
            b"aaaabbbbcc"
        );
        assert_eq!(
            std::fs::metadata(dir.path().join("empty.cfg")).unwrap().len(),
            0
        );
        assert_eq!(summary.owners[Path::new("bin/game.bin")], 440);
        assert_eq!(summary.owners[Path::new("empty.cfg")], 440);
        assert!(summary.overwrites.is_empty());
    }

    #[tokio::test]
    async fn a_second_run_over_a_correct_tree_fetches_nothing() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::serving(&[b"aaaa", b"bbbb"]);
        let depots = vec![depot(440, vec![entry("game.bin", &[b"aaaa", b"bbbb"])])];
        let orch = orchestrator(dir.path(), Arc::clone(&fetcher) as Arc<dyn ChunkFetcher>);

        orch.run(&depots).await.unwrap();
        let calls_after_first = fetcher.calls();

        let summary = orch.run(&depots).await.unwrap();

        assert!(summary.is_complete());
        assert_eq!(summary.depots[0].chunks_fetched, 0);
        assert_eq!(fetcher.calls(), calls_after_first);
        assert!(summary.overwrites.is_empty());
    }

    #[tokio::test]
    async fn corruption_resumes_from_the_verified_boundary() {
        // chunk 1 of 3 goes bad after a full download: only chunks 1 and 2
        // are refetched and the file comes back identical
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::serving(&[b"aaaa", b"bbbb", b"cccc"]);
        let depots = vec![depot(
            440,
            vec![entry("game.bin", &[b"aaaa", b"bbbb", b"cccc"])],
        )];
        let orch = orchestrator(dir.path(), Arc::clone(&fetcher) as Arc<dyn ChunkFetcher>);

        orch.run(&depots).await.unwrap();
        let calls_after_first = fetcher.calls();

        let local = dir.path().join("game.bin");
        let mut bytes = std::fs::read(&local).unwrap();
        bytes[4..8].copy_from_slice(b"XXXX");
        std::fs::write(&local, &bytes).unwrap();

        let summary = orch.run(&depots).await.unwrap();

        assert!(summary.is_complete());
        assert_eq!(summary.depots[0].chunks_fetched, 2);
        assert_eq!(fetcher.calls(), calls_after_first + 2);
        assert_eq!(std::fs::read(&local).unwrap(), b"aaaabbbbcccc");
    }

    #[tokio::test]
    async fn the_last_depot_in_order_owns_a_shared_path() {
        let dir = tempdir().unwrap();
        // depot 440's version of shared.bin is not even served: it must
        // never be requested
        let fetcher = MapFetcher::serving(&[b"BBBB", b"CC"]);
        let depots = vec![
            depot(440, vec![entry("shared.bin", &[b"AAAA"])]),
            depot(
                441,
                vec![entry("shared.bin", &[b"BBBB"]), entry("own.bin", &[b"CC"])],
            ),
        ];
        let orch = orchestrator(dir.path(), Arc::clone(&fetcher) as Arc<dyn ChunkFetcher>);

        let summary = orch.run(&depots).await.unwrap();

        assert!(summary.is_complete());
        assert_eq!(
            std::fs::read(dir.path().join("shared.bin")).unwrap(),
            b"BBBB"
        );
        assert_eq!(summary.owners[Path::new("shared.bin")], 441);
        assert_eq!(
            summary.overwrites,
            vec![OverwriteEntry {
                path: PathBuf::from("shared.bin"),
                previous_depot: 440,
                new_depot: 441,
            }]
        );
        assert_eq!(summary.depots[0].files_superseded, 1);
        assert_eq!(summary.depots[0].files_completed, 0);
        assert_eq!(summary.depots[0].state, DepotState::Completed);
        assert_eq!(fetcher.calls(), 2);

        // and the merge is stable: a rerun changes nothing
        let summary = orch.run(&depots).await.unwrap();
        assert_eq!(summary.overwrites.len(), 1);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn a_missing_chunk_fails_one_file_without_blocking_the_rest() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::serving(&[b"good"]);
        let depots = vec![depot(
            440,
            vec![
                entry("good.bin", &[b"good"]),
                entry("bad.bin", &[b"gone"]),
            ],
        )];
        let orch = orchestrator(dir.path(), Arc::clone(&fetcher) as Arc<dyn ChunkFetcher>);

        let summary = orch.run(&depots).await.unwrap();

        assert_eq!(summary.depots[0].state, DepotState::Failed);
        assert_eq!(summary.depots[0].files_completed, 1);
        assert_eq!(summary.depots[0].failures.len(), 1);
        assert_eq!(summary.depots[0].failures[0].path, PathBuf::from("bad.bin"));
        assert_eq!(
            std::fs::read(dir.path().join("good.bin")).unwrap(),
            b"good"
        );
        assert_eq!(summary.owners.get(Path::new("good.bin")), Some(&440));
        assert_eq!(summary.owners.get(Path::new("bad.bin")), None);
        assert!(summary.into_result().is_err());
    }

    #[tokio::test]
    async fn a_requested_repair_pass_recovers_from_an_outage() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::serving(&[b"aaaa", b"bbbb"]);
        // one more failure than a single pass will tolerate
        fetcher.fail_transiently(b"bbbb", 1);
        let depots = vec![depot(440, vec![entry("game.bin", &[b"aaaa", b"bbbb"])])];

        let mut config = quick_config(dir.path());
        config.workers = 1;
        config.retry.max_attempts = 1;
        config.repair = true;
        let sink = Arc::new(StateSink {
            states: std::sync::Mutex::new(Vec::new()),
        });
        let orch = Orchestrator::new(
            config,
            Arc::clone(&fetcher) as Arc<dyn ChunkFetcher>,
            Arc::clone(&sink) as Arc<dyn ProgressSink>,
        );

        let summary = orch.run(&depots).await.unwrap();

        assert!(summary.is_complete());
        assert!(summary.depots[0].failures.is_empty());
        assert_eq!(
            std::fs::read(dir.path().join("game.bin")).unwrap(),
            b"aaaabbbb"
        );
        let states: Vec<DepotState> = sink
            .states
            .lock()
            .unwrap()
            .iter()
            .map(|(_, state)| *state)
            .collect();
        assert_eq!(
            states,
            vec![
                DepotState::Queued,
                DepotState::Verifying,
                DepotState::Downloading,
                DepotState::Repairing,
                DepotState::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn without_a_repair_request_the_depot_stays_failed() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::serving(&[b"aaaa"]);
        fetcher.fail_transiently(b"aaaa", 1);
        let depots = vec![depot(440, vec![entry("game.bin", &[b"aaaa"])])];

        let mut config = quick_config(dir.path());
        config.retry.max_attempts = 1;
        let orch = Orchestrator::new(
            config,
            Arc::clone(&fetcher) as Arc<dyn ChunkFetcher>,
            Arc::new(NullSink),
        );

        let summary = orch.run(&depots).await.unwrap();

        assert_eq!(summary.depots[0].state, DepotState::Failed);
        assert_eq!(summary.depots[0].failures.len(), 1);
        assert_eq!(summary.depots[0].failures[0].attempts, 1);
    }

    #[tokio::test]
    async fn cancellation_before_the_run_starts_nothing() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::serving(&[b"aaaa"]);
        let depots = vec![depot(440, vec![entry("game.bin", &[b"aaaa"])])];
        let orch = orchestrator(dir.path(), Arc::clone(&fetcher) as Arc<dyn ChunkFetcher>);
        orch.cancellation_token().cancel();

        let summary = orch.run(&depots).await.unwrap();

        assert!(summary.cancelled);
        assert!(summary.depots.is_empty());
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_mid_download_leaves_the_file_at_its_verified_boundary() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::serving(&[b"aaaa", b"bbbb"]);
        let depots = vec![depot(440, vec![entry("game.bin", &[b"aaaa", b"bbbb"])])];

        let mut config = quick_config(dir.path());
        config.workers = 1;
        let orch = Orchestrator::new(
            config,
            Arc::clone(&fetcher) as Arc<dyn ChunkFetcher>,
            Arc::new(NullSink),
        );
        // the run is cancelled the moment chunk 1 is requested, after chunk 0
        // was already written
        fetcher.cancel_when_asked_for(b"bbbb", orch.cancellation_token());

        let summary = orch.run(&depots).await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.depots[0].state, DepotState::Failed);
        assert_eq!(
            std::fs::metadata(dir.path().join("game.bin")).unwrap().len(),
            4
        );
        assert_eq!(std::fs::read(dir.path().join("game.bin")).unwrap(), b"aaaa");
        // nothing was registered for the torn-down depot
        assert!(summary.owners.is_empty());
    }

    #[tokio::test]
    async fn an_unsafe_manifest_path_aborts_before_any_work() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::serving(&[b"aaaa"]);
        let depots = vec![depot(440, vec![entry("../evil.bin", &[b"aaaa"])])];
        let orch = orchestrator(dir.path(), Arc::clone(&fetcher) as Arc<dyn ChunkFetcher>);

        let err = orch.run(&depots).await.unwrap_err();

        assert!(matches!(
            err,
            DownloadError::Manifest(ManifestError::UnsafePath { .. })
        ));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn verify_tree_reports_deficits_without_writing() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("ok.bin"), b"good").unwrap();
        std::fs::write(dir.path().join("part.bin"), b"aaaa").unwrap();
        let depots = vec![depot(
            440,
            vec![
                entry("ok.bin", &[b"good"]),
                entry("part.bin", &[b"aaaa", b"bbbb", b"cccc"]),
                entry("empty.cfg", &[]),
            ],
        )];

        let report = verify_tree(&quick_config(dir.path()), &depots)
            .await
            .unwrap();

        assert!(!report.is_clean());
        assert_eq!(report.files_ok, 1);
        assert_eq!(report.needs_repair.len(), 2);
        assert_eq!(report.bytes_needed(), 8);
        let partial = report
            .needs_repair
            .iter()
            .find(|f| f.path == Path::new("part.bin"))
            .unwrap();
        assert_eq!(partial.missing_chunks, 2);
        // read-only: the partial file keeps its length, nothing is created
        assert_eq!(
            std::fs::metadata(dir.path().join("part.bin")).unwrap().len(),
            4
        );
        assert!(!dir.path().join("empty.cfg").exists());
    }

    #[tokio::test]
    async fn verify_tree_checks_a_shared_path_against_its_final_owner() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("shared.bin"), b"BBBB").unwrap();
        let depots = vec![
            depot(440, vec![entry("shared.bin", &[b"AAAA"])]),
            depot(441, vec![entry("shared.bin", &[b"BBBB"])]),
        ];

        let report = verify_tree(&quick_config(dir.path()), &depots)
            .await
            .unwrap();

        assert!(report.is_clean());
        assert_eq!(report.files_ok, 1);
    }
}
