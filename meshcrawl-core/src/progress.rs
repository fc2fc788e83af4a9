//! Per-agent progress snapshot
//!
//! Lets one agent resume its own work after a restart, independently of the
//! shared coordination record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::{write_atomic, StorageError};

/// Saved sets for one agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    #[serde(default)]
    pub visited_urls: BTreeSet<String>,
    #[serde(default)]
    pub downloaded_files: BTreeSet<String>,
    #[serde(default)]
    pub failed_urls: BTreeSet<String>,
    #[serde(rename = "laptop_id", default)]
    pub agent_id: String,
    #[serde(default)]
    pub last_update: String,
}

/// Progress file inside the agent's output directory
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(output_dir: &Path, agent_id: &str) -> Self {
        Self {
            path: output_dir.join(format!("scraper_progress_{}.json", agent_id)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Previous snapshot, if this agent ever saved one
    pub fn load(&self) -> Result<Option<ProgressSnapshot>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let raw = fs::read(&self.path).map_err(|source| StorageError::Read {
            path: self.path.clone(),
            source,
        })?;
        let snapshot: ProgressSnapshot =
            serde_json::from_slice(&raw).map_err(|source| StorageError::Decode {
                path: self.path.clone(),
                source,
            })?;

        info!(
            "Loaded progress: {} visited, {} downloaded, {} failed",
            snapshot.visited_urls.len(),
            snapshot.downloaded_files.len(),
            snapshot.failed_urls.len()
        );
        Ok(Some(snapshot))
    }

    /// Overwrite the snapshot wholesale
    pub fn save(&self, snapshot: &ProgressSnapshot) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&self.path, &encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CrawlState;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::new(dir.path(), "laptop1");
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_round_trip_restores_sets() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::new(dir.path(), "laptop1");

        let mut state = CrawlState::new();
        for url in ["https://a.ca/", "https://a.ca/en", "https://a.ca/gone"] {
            state.mark_visited(url);
        }
        state.mark_downloaded("https://a.ca/");
        state.mark_downloaded("https://a.ca/r.pdf");
        state.mark_failed("https://a.ca/gone");

        store.save(&state.to_progress("laptop1")).unwrap();

        let loaded = store.load().unwrap().unwrap();
        let restored = CrawlState::from_progress(&loaded);
        assert_eq!(restored.visited(), state.visited());
        assert_eq!(restored.downloaded(), state.downloaded());
        assert_eq!(restored.failed(), state.failed());
        assert_eq!(loaded.agent_id, "laptop1");
    }

    #[test]
    fn test_file_uses_laptop_id_key() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::new(dir.path(), "laptop2");
        store.save(&CrawlState::new().to_progress("laptop2")).unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(value["laptop_id"], "laptop2");
        assert!(value["visited_urls"].is_array());
        assert!(value["downloaded_files"].is_array());
        assert!(value["failed_urls"].is_array());
        assert!(value["last_update"].is_string());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::new(dir.path(), "laptop1");
        fs::write(store.path(), b"[1, 2").unwrap();
        assert!(matches!(store.load(), Err(StorageError::Decode { .. })));
    }
}
