//! Local verification - decides which bytes of a file are already correct.
//!
//! A file is trusted up to its first verified error and no further: once a
//! chunk fails its hash, everything after it is considered bad even if later
//! chunks would individually match, because trailing bytes past a corruption
//! cannot be proven to mean what the manifest thinks they mean. Truncating to
//! the verified boundary makes an interrupted run resume from exactly the
//! last good byte.

use crate::manifest::{ChunkInfo, FileEntry};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

#[derive(Debug, Clone)]
pub struct VerificationResult {
    /// Length of the longest run of chunks from offset 0 that all matched.
    pub verified_prefix: u64,
    /// Chunks that must be fetched, in ascending offset order.
    pub bad_chunks: Vec<ChunkInfo>,
}

impl VerificationResult {
    pub fn is_complete(&self) -> bool {
        self.bad_chunks.is_empty()
    }

    pub fn bytes_needed(&self) -> u64 {
        self.bad_chunks.iter().map(|c| c.length).sum()
    }

    fn nothing_verified(entry: &FileEntry) -> Self {
        VerificationResult {
            verified_prefix: 0,
            bad_chunks: entry.chunks.clone(),
        }
    }
}

/// Checks `local` against the manifest entry chunk by chunk.
///
/// A missing, short, or unreadable file is treated as fully missing, never as
/// an error. With `truncate` set, a file longer than its verified prefix is
/// cut back to the prefix boundary so stale trailing bytes can never be
/// mistaken for downloaded data; only that truncation can fail.
pub async fn verify_file(
    entry: &FileEntry,
    local: &Path,
    truncate: bool,
) -> std::io::Result<VerificationResult> {
    let file_len = match tokio::fs::metadata(local).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => return Ok(VerificationResult::nothing_verified(entry)),
    };

    let mut file = match OpenOptions::new().read(true).open(local).await {
        Ok(file) => file,
        Err(_) => return Ok(VerificationResult::nothing_verified(entry)),
    };

    let mut verified_prefix = 0u64;
    let mut bad_chunks = Vec::new();
    let mut prefix_broken = false;
    let mut buf = Vec::new();

    for chunk in &entry.chunks {
        if prefix_broken || chunk.end() > file_len {
            prefix_broken = true;
            bad_chunks.push(chunk.clone());
            continue;
        }

        buf.resize(chunk.length as usize, 0);
        let read = async {
            file.seek(SeekFrom::Start(chunk.offset)).await?;
            file.read_exact(&mut buf).await
        }
        .await;

        match read {
            Ok(_) if chunk.matches(&buf) => verified_prefix = chunk.end(),
            _ => {
                prefix_broken = true;
                bad_chunks.push(chunk.clone());
            }
        }
    }
    drop(file);

    if truncate && file_len > verified_prefix {
        let file = OpenOptions::new().write(true).open(local).await?;
        file.set_len(verified_prefix).await?;
    }

    Ok(VerificationResult {
        verified_prefix,
        bad_chunks,
    })
}
