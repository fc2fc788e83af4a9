//! Background coordination sync
//!
//! The crawl driver owns its state and publishes immutable snapshots on a
//! watch channel. This task periodically saves the latest snapshot to the
//! coordination store and sends back what other agents have downloaded.
//! Coordination I/O failures are logged and skipped for that cycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use meshcrawl_core::{AgentSnapshot, CoordinationStore};

/// Handle used to stop a running sync task
pub struct SyncHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Stop the task and wait for it to exit
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            warn!("Coordination sync task ended abnormally: {}", e);
        }
    }
}

pub struct SyncTask {
    store: Arc<CoordinationStore>,
    snapshots: watch::Receiver<AgentSnapshot>,
    learned: watch::Sender<HashSet<String>>,
    period: Duration,
}

impl SyncTask {
    pub fn new(
        store: Arc<CoordinationStore>,
        snapshots: watch::Receiver<AgentSnapshot>,
        learned: watch::Sender<HashSet<String>>,
        period: Duration,
    ) -> Self {
        Self {
            store,
            snapshots,
            learned,
            period,
        }
    }

    /// One save-then-reload cycle
    pub fn sync_once(&self) {
        let snapshot = self.snapshots.borrow().clone();
        if let Err(e) = self.store.save(&snapshot) {
            warn!("Coordination save failed, skipping this cycle: {}", e);
            return;
        }

        match self.store.read_record() {
            Ok(record) => {
                let others = record.downloaded_by_others(self.store.agent_id());
                debug!(
                    "Coordination sync: {} agents, {} downloaded elsewhere",
                    record.agents.len(),
                    others.len()
                );
                self.learned.send_replace(others);
            }
            Err(e) => warn!("Coordination reload failed, skipping this cycle: {}", e),
        }
    }

    /// Run on the tokio runtime until the handle shuts it down
    pub fn spawn(self) -> SyncHandle {
        let (tx, mut rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            info!(
                "Coordination sync every {:?} via {}",
                self.period,
                self.store.record_path().display()
            );

            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = ticker.tick() => self.sync_once(),
                }
            }
            debug!("Coordination sync stopped");
        });

        SyncHandle {
            shutdown: Some(tx),
            task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn snapshot(downloaded: &[&str]) -> AgentSnapshot {
        AgentSnapshot {
            downloaded_files: downloaded.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            last_update: meshcrawl_core::timestamp(),
            ..Default::default()
        }
    }

    #[test]
    fn test_sync_once_saves_and_reports_others() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coord.json");
        let other = CoordinationStore::new(&path, "laptop2").unwrap();
        other.save(&snapshot(&["https://a.ca/b.pdf"])).unwrap();

        let store = Arc::new(CoordinationStore::new(&path, "laptop1").unwrap());
        let (_snap_tx, snap_rx) = watch::channel(snapshot(&["https://a.ca/a.pdf"]));
        let (learned_tx, learned_rx) = watch::channel(HashSet::new());

        SyncTask::new(store.clone(), snap_rx, learned_tx, Duration::from_secs(30)).sync_once();

        let record = store.read_record().unwrap();
        assert!(record.agents["laptop1"]
            .downloaded_files
            .contains("https://a.ca/a.pdf"));
        assert_eq!(
            *learned_rx.borrow(),
            HashSet::from(["https://a.ca/b.pdf".to_string()])
        );
    }

    #[tokio::test]
    async fn test_spawned_task_syncs_latest_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CoordinationStore::new(dir.path().join("c.json"), "laptop1").unwrap());
        let (snap_tx, snap_rx) = watch::channel(snapshot(&[]));
        let (learned_tx, _learned_rx) = watch::channel(HashSet::new());

        let handle = SyncTask::new(store.clone(), snap_rx, learned_tx, Duration::from_millis(20))
            .spawn();
        snap_tx.send_replace(snapshot(&["https://a.ca/x.pdf"]));
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.shutdown().await;

        let record = store.read_record().unwrap();
        assert!(record.agents["laptop1"]
            .downloaded_files
            .contains("https://a.ca/x.pdf"));
    }

    #[tokio::test]
    async fn test_unwritable_store_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        // The slot directory path is occupied by a regular file
        std::fs::write(dir.path().join("c.json.agents"), b"").unwrap();
        let store = Arc::new(CoordinationStore::new(dir.path().join("c.json"), "laptop1").unwrap());
        let (_snap_tx, snap_rx) = watch::channel(snapshot(&["u"]));
        let (learned_tx, learned_rx) = watch::channel(HashSet::new());

        SyncTask::new(store, snap_rx, learned_tx, Duration::from_secs(30)).sync_once();
        assert!(learned_rx.borrow().is_empty());
    }
}
