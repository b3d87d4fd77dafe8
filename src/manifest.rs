use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("file {path:?} declares {declared} bytes but its chunks cover {covered}")]
    ChunkCoverage {
        path: PathBuf,
        declared: u64,
        covered: u64,
    },
    #[error("file {path:?} has a chunk gap or overlap at offset {offset}")]
    ChunkLayout { path: PathBuf, offset: u64 },
    #[error("path {path:?} appears twice in one manifest")]
    DuplicatePath { path: PathBuf },
    #[error("path {path:?} escapes the target root")]
    UnsafePath { path: PathBuf },
}

/// One contiguous byte range of a file and the SHA-1 its contents must hash
/// to. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub offset: u64,
    pub length: u64,
    pub sha1: String,
}

impl ChunkInfo {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// True when `data` is exactly this chunk's bytes.
    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() as u64 == self.length && sha1_hex(data) == self.sha1
    }
}

/// Lowercase hex SHA-1 of `data`, the form chunk hashes are carried in.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: PathBuf,
    pub total_size: u64,
    pub chunks: Vec<ChunkInfo>,
}

impl FileEntry {
    /// Chunks must start at offset 0, be contiguous and non-overlapping, and
    /// sum to `total_size`. Zero-length files carry an empty chunk list.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut expected = 0u64;
        for chunk in &self.chunks {
            if chunk.offset != expected || chunk.length == 0 {
                return Err(ManifestError::ChunkLayout {
                    path: self.path.clone(),
                    offset: chunk.offset,
                });
            }
            expected = chunk.end();
        }
        if expected != self.total_size {
            return Err(ManifestError::ChunkCoverage {
                path: self.path.clone(),
                declared: self.total_size,
                covered: expected,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub files: Vec<FileEntry>,
}

impl Manifest {
    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut seen = std::collections::HashSet::new();
        for file in &self.files {
            file.validate()?;
            if !seen.insert(&file.path) {
                return Err(ManifestError::DuplicatePath {
                    path: file.path.clone(),
                });
            }
        }
        Ok(())
    }
}

/// One unit of content, processed in the fixed order it was supplied.
/// `key` is the depot decryption key, carried opaquely: manifests arrive
/// already decoded and the engine never touches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Depot {
    pub id: u32,
    pub manifest_gid: String,
    #[serde(default)]
    pub key: String,
    pub manifest: Manifest,
}

/// Joins a manifest-relative path onto `root`, rejecting anything that could
/// land outside it (absolute paths, `..` components, drive prefixes).
pub fn safe_join(root: &Path, relative: &Path) -> Result<PathBuf, ManifestError> {
    let mut joined = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            _ => {
                return Err(ManifestError::UnsafePath {
                    path: relative.to_path_buf(),
                });
            }
        }
    }
    if joined == root {
        return Err(ManifestError::UnsafePath {
            path: relative.to_path_buf(),
        });
    }
    Ok(joined)
}
