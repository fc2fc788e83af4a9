//! In-memory crawl state owned by a single agent

use std::collections::HashSet;
use std::path::PathBuf;

use crate::{AgentSnapshot, ProgressSnapshot};

/// Lifecycle of one crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrawlPhase {
    #[default]
    Idle,
    Running,
    /// Traversal finished on its own
    Completed,
    /// Stopped by a shutdown signal
    Interrupted,
    /// Could not start or continue
    Aborted,
}

impl CrawlPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Interrupted | Self::Aborted)
    }
}

/// Terminal outcome for a single URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlOutcome {
    /// Content written to this path
    Stored(PathBuf),
    /// Byte-identical content already stored at `original`
    DuplicateSkipped { original: PathBuf },
    /// Already downloaded by this or another agent, or present on disk
    AlreadySatisfied,
    /// Transport failure below the escalation limit; retried once later
    Deferred,
    /// Permanently failed for this session
    Failed,
    /// Fetched but could not be written
    StorageFailed,
}

/// Visited / downloaded / failed sets
#[derive(Debug, Clone, Default)]
pub struct CrawlState {
    visited: HashSet<String>,
    downloaded: HashSet<String>,
    failed: HashSet<String>,
}

impl CrawlState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a saved progress snapshot
    pub fn from_progress(snapshot: &ProgressSnapshot) -> Self {
        Self {
            visited: snapshot.visited_urls.iter().cloned().collect(),
            downloaded: snapshot.downloaded_files.iter().cloned().collect(),
            failed: snapshot.failed_urls.iter().cloned().collect(),
        }
    }

    /// Marks a URL visited; false if it already was
    pub fn mark_visited(&mut self, url: &str) -> bool {
        self.visited.insert(url.to_string())
    }

    pub fn is_visited(&self, url: &str) -> bool {
        self.visited.contains(url)
    }

    pub fn mark_downloaded(&mut self, id: &str) {
        self.downloaded.insert(id.to_string());
    }

    pub fn is_downloaded(&self, id: &str) -> bool {
        self.downloaded.contains(id)
    }

    pub fn mark_failed(&mut self, url: &str) {
        self.failed.insert(url.to_string());
    }

    pub fn is_failed(&self, url: &str) -> bool {
        self.failed.contains(url)
    }

    /// Merge identifiers downloaded elsewhere; returns how many were new
    pub fn merge_downloaded<I>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let before = self.downloaded.len();
        self.downloaded.extend(ids);
        self.downloaded.len() - before
    }

    pub fn visited(&self) -> &HashSet<String> {
        &self.visited
    }

    pub fn downloaded(&self) -> &HashSet<String> {
        &self.downloaded
    }

    pub fn failed(&self) -> &HashSet<String> {
        &self.failed
    }

    /// Local progress snapshot for this agent
    pub fn to_progress(&self, agent_id: &str) -> ProgressSnapshot {
        ProgressSnapshot {
            visited_urls: self.visited.iter().cloned().collect(),
            downloaded_files: self.downloaded.iter().cloned().collect(),
            failed_urls: self.failed.iter().cloned().collect(),
            agent_id: agent_id.to_string(),
            last_update: crate::timestamp(),
        }
    }

    /// Coordination slot contents for this agent
    pub fn to_agent_snapshot(&self, rotation_status: &str) -> AgentSnapshot {
        AgentSnapshot {
            downloaded_files: self.downloaded.iter().cloned().collect(),
            visited_urls: self.visited.iter().cloned().collect(),
            failed_urls: self.failed.iter().cloned().collect(),
            last_update: crate::timestamp(),
            vpn_status: rotation_status.to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_visited_once() {
        let mut state = CrawlState::new();
        assert!(state.mark_visited("https://a.ca/"));
        assert!(!state.mark_visited("https://a.ca/"));
        assert!(state.is_visited("https://a.ca/"));
    }

    #[test]
    fn test_merge_downloaded_counts_new() {
        let mut state = CrawlState::new();
        state.mark_downloaded("https://a.ca/x.pdf");
        let added = state.merge_downloaded(vec![
            "https://a.ca/x.pdf".to_string(),
            "https://a.ca/y.pdf".to_string(),
        ]);
        assert_eq!(added, 1);
        assert!(state.is_downloaded("https://a.ca/y.pdf"));
    }

    #[test]
    fn test_progress_conversion() {
        let mut state = CrawlState::new();
        state.mark_visited("https://a.ca/");
        state.mark_downloaded("https://a.ca/");
        state.mark_failed("https://a.ca/broken");

        let snapshot = state.to_progress("laptop1");
        assert_eq!(snapshot.agent_id, "laptop1");
        assert!(snapshot.failed_urls.contains("https://a.ca/broken"));

        let restored = CrawlState::from_progress(&snapshot);
        assert_eq!(restored.visited(), state.visited());
        assert_eq!(restored.downloaded(), state.downloaded());
        assert_eq!(restored.failed(), state.failed());
    }

    #[test]
    fn test_terminal_phases() {
        assert!(!CrawlPhase::Running.is_terminal());
        assert!(CrawlPhase::Interrupted.is_terminal());
    }
}
