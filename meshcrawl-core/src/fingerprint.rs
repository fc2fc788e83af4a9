//! Content fingerprint index
//!
//! Maps the SHA-256 of every stored body to the file holding it, so a newly
//! fetched payload can be checked for byte-identical duplicates in O(1)
//! instead of rehashing everything already on disk.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{write_atomic, StorageError};

/// Hex SHA-256 of a payload
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Persisted fingerprint → storage path map
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FingerprintIndex {
    entries: HashMap<String, PathBuf>,
}

impl FingerprintIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a saved index; `None` when no index file exists yet
    pub fn load(path: &Path) -> Result<Option<Self>, StorageError> {
        if !path.exists() {
            return Ok(None);
        }

        let raw = fs::read(path).map_err(|source| StorageError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let index = serde_json::from_slice(&raw).map_err(|source| StorageError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(index))
    }

    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &encoded)
    }

    /// Hash every file under `root` except the given state files
    pub fn rebuild(root: &Path, exclude: &[&Path]) -> Self {
        let mut index = Self::new();

        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if exclude.iter().any(|skip| *skip == path) || is_temporary(path) {
                continue;
            }

            match fs::read(path) {
                Ok(bytes) => {
                    index
                        .entries
                        .entry(fingerprint(&bytes))
                        .or_insert_with(|| path.to_path_buf());
                }
                Err(e) => warn!("Cannot hash {}: {}", path.display(), e),
            }
        }

        debug!("Rebuilt fingerprint index with {} entries", index.len());
        index
    }

    /// Stored path holding this fingerprint, dropping entries whose file is gone
    pub fn lookup(&mut self, fingerprint: &str) -> Option<PathBuf> {
        let path = self.entries.get(fingerprint)?.clone();
        if path.is_file() {
            Some(path)
        } else {
            debug!("Dropping stale fingerprint entry for {}", path.display());
            self.entries.remove(fingerprint);
            None
        }
    }

    pub fn record(&mut self, fingerprint: String, path: PathBuf) {
        self.entries.entry(fingerprint).or_insert(path);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_temporary(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
        && path.to_string_lossy().contains(".tmp.")
}
