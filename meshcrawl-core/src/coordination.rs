//! Shared coordination record
//!
//! Every agent publishes its own slot as a separate file:
//!
//! ```text
//! distributed_coordination.json          merged view, same shape as before
//! distributed_coordination.json.agents/
//!     laptop1.json                       written only by laptop1
//!     laptop2.json                       written only by laptop2
//! ```
//!
//! Slot files are replaced atomically (temp file + rename) and only ever by
//! their owner, so agents cannot clobber each other. Readers merge all slots
//! by union. The merged record is regenerated after each publication for
//! tools that expect a single file; slots present only in that file (from
//! older agents) are still read and preserved.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{write_atomic, StorageError};

/// Errors from the coordination record
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("Coordination I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed coordination data in {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid agent id: {0:?}")]
    InvalidAgentId(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One agent's published crawl state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    #[serde(default)]
    pub downloaded_files: BTreeSet<String>,
    #[serde(default)]
    pub visited_urls: BTreeSet<String>,
    #[serde(default)]
    pub failed_urls: BTreeSet<String>,
    #[serde(default)]
    pub last_update: String,
    #[serde(default)]
    pub vpn_status: String,
    /// Keys written by other tools, carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Merged view over all agents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinationRecord {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentSnapshot>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CoordinationRecord {
    /// Union of every agent's downloaded identifiers
    pub fn downloaded_union(&self) -> HashSet<String> {
        self.agents
            .values()
            .flat_map(|a| a.downloaded_files.iter().cloned())
            .collect()
    }

    /// Union of downloads published by agents other than `agent_id`
    pub fn downloaded_by_others(&self, agent_id: &str) -> HashSet<String> {
        self.agents
            .iter()
            .filter(|(id, _)| id.as_str() != agent_id)
            .flat_map(|(_, a)| a.downloaded_files.iter().cloned())
            .collect()
    }
}

/// Whether an agent id can name a slot file
pub fn is_valid_agent_id(agent_id: &str) -> bool {
    !agent_id.is_empty()
        && agent_id.len() <= 128
        && !agent_id.starts_with('.')
        && agent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, CoordinationError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CoordinationError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| CoordinationError::Malformed {
            path: path.to_path_buf(),
            source,
        })
}

/// File-backed coordination store for one agent
#[derive(Debug)]
pub struct CoordinationStore {
    record_path: PathBuf,
    slots_dir: PathBuf,
    agent_id: String,
    write_guard: Mutex<()>,
}

impl CoordinationStore {
    pub fn new(record_path: impl Into<PathBuf>, agent_id: &str) -> Result<Self, CoordinationError> {
        if !is_valid_agent_id(agent_id) {
            return Err(CoordinationError::InvalidAgentId(agent_id.to_string()));
        }

        let record_path = record_path.into();
        let mut slots_name = record_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "coordination".into());
        slots_name.push(".agents");
        let slots_dir = record_path.with_file_name(slots_name);

        Ok(Self {
            record_path,
            slots_dir,
            agent_id: agent_id.to_string(),
            write_guard: Mutex::new(()),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn record_path(&self) -> &Path {
        &self.record_path
    }

    pub fn slots_dir(&self) -> &Path {
        &self.slots_dir
    }

    /// Create the record's parent directory; true if it had to be created
    pub fn ensure_parent(&self) -> Result<bool, CoordinationError> {
        let Some(parent) = self
            .record_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        else {
            return Ok(false);
        };
        if parent.is_dir() {
            return Ok(false);
        }

        warn!("Creating coordination directory {}", parent.display());
        fs::create_dir_all(parent).map_err(|source| CoordinationError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
        Ok(true)
    }

    fn slot_path(&self, agent_id: &str) -> PathBuf {
        self.slots_dir.join(format!("{}.json", agent_id))
    }

    /// Merged record: the single-file view overlaid with every slot file
    pub fn read_record(&self) -> Result<CoordinationRecord, CoordinationError> {
        let mut record = match read_json::<CoordinationRecord>(&self.record_path) {
            Ok(record) => record.unwrap_or_default(),
            Err(e @ CoordinationError::Malformed { .. }) => {
                warn!("Ignoring merged coordination view: {}", e);
                CoordinationRecord::default()
            }
            Err(e) => return Err(e),
        };

        let entries = match fs::read_dir(&self.slots_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(record),
            Err(source) => {
                return Err(CoordinationError::Io {
                    path: self.slots_dir.clone(),
                    source,
                })
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(agent_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            match read_json::<AgentSnapshot>(&path) {
                Ok(Some(snapshot)) => {
                    record.agents.insert(agent_id.to_string(), snapshot);
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping coordination slot: {}", e),
            }
        }

        Ok(record)
    }

    /// Union of downloaded identifiers across all agents; absent record is empty
    pub fn load(&self) -> Result<HashSet<String>, CoordinationError> {
        let record = self.read_record()?;
        let downloaded = record.downloaded_union();
        debug!(
            "Coordination: {} agents, {} downloaded identifiers",
            record.agents.len(),
            downloaded.len()
        );
        Ok(downloaded)
    }

    /// Publish this agent's slot and refresh the merged view
    pub fn save(&self, snapshot: &AgentSnapshot) -> Result<(), CoordinationError> {
        let _guard = self.write_guard.lock();

        let slot_path = self.slot_path(&self.agent_id);
        let mut snapshot = snapshot.clone();

        // Keep keys other tools added to our slot
        if let Ok(Some(previous)) = read_json::<AgentSnapshot>(&slot_path) {
            for (key, value) in previous.extra {
                snapshot.extra.entry(key).or_insert(value);
            }
        }

        let encoded = serde_json::to_vec_pretty(&snapshot).map_err(StorageError::from)?;
        write_atomic(&slot_path, &encoded)?;

        let mut record = self.read_record()?;
        record.agents.insert(self.agent_id.clone(), snapshot);
        let encoded = serde_json::to_vec_pretty(&record).map_err(StorageError::from)?;
        write_atomic(&self.record_path, &encoded)?;

        debug!("Published coordination slot for {}", self.agent_id);
        Ok(())
    }
}
