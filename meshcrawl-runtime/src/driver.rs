//! Crawl driver
//!
//! Depth-first traversal over an explicit `(url, depth)` work stack:
//!
//! ```text
//! Idle -> Running -> Completed | Interrupted | Aborted
//! ```
//!
//! Each popped URL is marked visited, then either downloaded as a document
//! or fetched as a page. Pages are deduplicated against stored content,
//! persisted, scanned for document links (downloaded immediately) and, below
//! the depth bound, for child pages (pushed in document order).
//!
//! Transport failures go through error escalation. A failure that does not
//! exhaust rotation defers the URL; deferred URLs get exactly one more
//! attempt after the stack drains, and a second failure marks them failed.
//!
//! Both the local progress file and the coordination slot are flushed when
//! the crawl ends, however it ends.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use url::Url;

use meshcrawl_core::{
    normalize, normalize_key, parse_url, AgentSnapshot, ConfigError, ContentKind,
    CoordinationError, CoordinationStore, CrawlConfig, CrawlPhase, CrawlState, ProgressStore,
    StorageError, StorageLayout, UrlClassifier, UrlKind, UrlOutcome, MAX_LINK_DEPTH,
};
use meshcrawl_net::{extract_links, SharedRotator, SharedTransport, TransportError};

use crate::{
    ContentCheck, ErrorEscalation, Escalation, EscalationPolicy, FetchEngine, SyncHandle, SyncTask,
};

/// Errors that stop a driver from being built or flushed
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Totals for one crawl run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlReport {
    pub phase: CrawlPhase,
    /// Final set sizes, including state loaded at startup
    pub visited: usize,
    pub downloaded: usize,
    pub failed: usize,
    /// Per-outcome counts for this run
    pub stored: usize,
    pub duplicates: usize,
    pub already_satisfied: usize,
    pub storage_failures: usize,
    pub deferred: usize,
    pub rotations: u32,
    /// Every store was saved when the crawl ended
    pub flushed: bool,
}

impl CrawlReport {
    fn record(&mut self, outcome: &UrlOutcome) {
        match outcome {
            UrlOutcome::Stored(_) => self.stored += 1,
            UrlOutcome::DuplicateSkipped { .. } => self.duplicates += 1,
            UrlOutcome::AlreadySatisfied => self.already_satisfied += 1,
            UrlOutcome::Deferred => self.deferred += 1,
            UrlOutcome::StorageFailed => self.storage_failures += 1,
            UrlOutcome::Failed => {}
        }
    }
}

impl fmt::Display for CrawlReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} visited, {} downloaded, {} failed ({} stored, {} duplicates, {} already satisfied, {} storage failures, {} rotations)",
            self.visited,
            self.downloaded,
            self.failed,
            self.stored,
            self.duplicates,
            self.already_satisfied,
            self.storage_failures,
            self.rotations
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    Retry,
}

type WorkStack = Vec<(Url, usize)>;

pub struct CrawlDriver {
    agent_id: String,
    output_dir: PathBuf,
    sync_interval: Duration,
    phase: CrawlPhase,
    classifier: UrlClassifier,
    engine: FetchEngine,
    escalation: ErrorEscalation,
    rotator: SharedRotator,
    state: CrawlState,
    progress: ProgressStore,
    coordination: Arc<CoordinationStore>,
    snapshots: watch::Sender<AgentSnapshot>,
    learned: watch::Receiver<HashSet<String>>,
    deferred: WorkStack,
    /// Keys of everything on `deferred`, so discovery never re-queues them
    deferred_keys: HashSet<String>,
    rotation_status: String,
    report: CrawlReport,
}

impl CrawlDriver {
    /// Build a driver, seeding state from the local progress file and the
    /// coordination record. Unreadable state is logged and ignored.
    pub fn new(
        config: &CrawlConfig,
        transport: SharedTransport,
        rotator: SharedRotator,
    ) -> Result<Self, CrawlError> {
        config.validate()?;

        let classifier = UrlClassifier::new(config.base_url()?, &config.classifier);
        let coordination = Arc::new(CoordinationStore::new(
            &config.coordination_file,
            &config.agent_id,
        )?);
        let progress = ProgressStore::new(&config.output_dir, &config.agent_id);

        let mut state = match progress.load() {
            Ok(Some(snapshot)) => CrawlState::from_progress(&snapshot),
            Ok(None) => CrawlState::new(),
            Err(e) => {
                warn!("Ignoring unreadable progress file: {}", e);
                CrawlState::new()
            }
        };

        match coordination.load() {
            Ok(downloaded) => {
                let added = state.merge_downloaded(downloaded);
                info!("Merged {} downloaded identifiers from coordination", added);
            }
            Err(e) => warn!("Coordination record unavailable: {}", e),
        }

        let engine = FetchEngine::open(
            transport,
            StorageLayout::new(&config.output_dir),
            config.fingerprint_path(),
            &[progress.path()],
        );

        let escalation = ErrorEscalation::new(
            rotator.clone(),
            EscalationPolicy {
                max_consecutive_errors: config.max_consecutive_errors,
                max_rotation_attempts: config.max_rotation_attempts,
                settle_pause: config.rotation.settle_pause(),
            },
        );

        let (snapshots, _) = watch::channel(AgentSnapshot::default());
        let (_, learned) = watch::channel(HashSet::new());

        Ok(Self {
            agent_id: config.agent_id.clone(),
            output_dir: config.output_dir.clone(),
            sync_interval: config.sync_interval(),
            phase: CrawlPhase::Idle,
            classifier,
            engine,
            escalation,
            rotator,
            state,
            progress,
            coordination,
            snapshots,
            learned,
            deferred: Vec::new(),
            deferred_keys: HashSet::new(),
            rotation_status: "Unknown".to_string(),
            report: CrawlReport::default(),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn phase(&self) -> CrawlPhase {
        self.phase
    }

    pub fn state(&self) -> &CrawlState {
        &self.state
    }

    pub fn report(&self) -> &CrawlReport {
        &self.report
    }

    pub fn coordination(&self) -> &CoordinationStore {
        &self.coordination
    }

    /// Crawl from `start` (the base URL when `None`) until done
    pub async fn scrape_site(&mut self, start: Option<&str>) -> CrawlReport {
        self.scrape_site_until(start, std::future::pending()).await
    }

    /// Crawl until done or until `shutdown` resolves
    pub async fn scrape_site_until<F>(&mut self, start: Option<&str>, shutdown: F) -> CrawlReport
    where
        F: Future<Output = ()>,
    {
        self.phase = CrawlPhase::Running;
        self.report = CrawlReport::default();

        info!("Starting distributed crawl with agent id: {}", self.agent_id);
        info!(
            "Coordination file: {}",
            self.coordination.record_path().display()
        );
        self.rotation_status = self.rotator.status().await;
        info!("Network identity: {}", self.rotation_status);

        let raw = start
            .map(str::to_string)
            .unwrap_or_else(|| self.classifier.base().to_string());
        let start_url = match parse_url(&raw) {
            Ok(url) => normalize(&url),
            Err(e) => {
                error!("Cannot start crawl: {}", e);
                return self.finish(CrawlPhase::Aborted);
            }
        };

        if let Err(e) = fs::create_dir_all(&self.output_dir) {
            error!(
                "Cannot create output directory {}: {}",
                self.output_dir.display(),
                e
            );
            return self.finish(CrawlPhase::Aborted);
        }
        if let Err(e) = self.coordination.ensure_parent() {
            warn!("{}", e);
        }

        let sync = self.start_sync();
        self.publish();

        let phase = tokio::select! {
            _ = self.run(start_url) => CrawlPhase::Completed,
            _ = shutdown => {
                warn!("Crawl interrupted, saving state");
                CrawlPhase::Interrupted
            }
        };

        sync.shutdown().await;
        self.rotation_status = self.rotator.status().await;
        self.finish(phase)
    }

    /// Save local progress, the coordination slot and the fingerprint index.
    /// Every store is attempted; the first error is returned.
    pub fn flush(&self) -> Result<(), CrawlError> {
        let mut first: Option<CrawlError> = None;

        if let Err(e) = self.progress.save(&self.state.to_progress(&self.agent_id)) {
            error!("Failed to save progress: {}", e);
            first.get_or_insert(e.into());
        }
        let snapshot = self.state.to_agent_snapshot(&self.rotation_status);
        if let Err(e) = self.coordination.save(&snapshot) {
            error!("Failed to save coordination: {}", e);
            first.get_or_insert(e.into());
        }
        if let Err(e) = self.engine.save_index() {
            error!("Failed to save fingerprint index: {}", e);
            first.get_or_insert(e.into());
        }

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn finish(&mut self, phase: CrawlPhase) -> CrawlReport {
        self.phase = phase;
        self.report.flushed = self.flush().is_ok();
        self.report.phase = phase;
        self.report.visited = self.state.visited().len();
        self.report.downloaded = self.state.downloaded().len();
        self.report.failed = self.state.failed().len();
        self.report.rotations = self.escalation.rotations();

        info!("Crawl {:?}: {}", phase, self.report);
        self.report.clone()
    }

    fn start_sync(&mut self) -> SyncHandle {
        let (learned_tx, learned_rx) = watch::channel(HashSet::new());
        self.learned = learned_rx;
        SyncTask::new(
            self.coordination.clone(),
            self.snapshots.subscribe(),
            learned_tx,
            self.sync_interval,
        )
        .spawn()
    }

    fn publish(&self) {
        if self.snapshots.receiver_count() > 0 {
            self.snapshots
                .send_replace(self.state.to_agent_snapshot(&self.rotation_status));
        }
    }

    /// Fold in downloads other agents published since the last URL
    fn merge_learned(&mut self) {
        if !self.learned.has_changed().unwrap_or(false) {
            return;
        }
        let learned = self.learned.borrow_and_update().clone();
        let added = self.state.merge_downloaded(learned);
        if added > 0 {
            info!("Learned {} downloads from other agents", added);
        }
    }

    async fn run(&mut self, start: Url) {
        if let Some(location) = self.rotator.next_location() {
            info!("Initial connection to {}", location);
            if self.rotator.connect(&location).await {
                self.rotation_status = self.rotator.status().await;
            } else {
                warn!("Initial connection to {} failed, using current network", location);
            }
        }

        let mut stack: WorkStack = vec![(start, 0)];
        self.drain(&mut stack).await;

        loop {
            let deferred = std::mem::take(&mut self.deferred);
            if deferred.is_empty() {
                break;
            }
            info!("Retrying {} deferred URLs", deferred.len());
            for (url, depth) in deferred {
                self.visit(url, depth, Attempt::Retry, &mut stack).await;
                self.drain(&mut stack).await;
            }
        }
    }

    async fn drain(&mut self, stack: &mut WorkStack) {
        while let Some((url, depth)) = stack.pop() {
            self.visit(url, depth, Attempt::First, stack).await;
        }
    }

    async fn visit(&mut self, url: Url, depth: usize, attempt: Attempt, stack: &mut WorkStack) {
        self.merge_learned();

        let key = normalize_key(&url);
        if !self.state.mark_visited(&key) && attempt == Attempt::First {
            return;
        }

        let outcome = match self.classifier.classify(&url) {
            UrlKind::Document => {
                self.download(&url, ContentKind::Document, depth, attempt)
                    .await
            }
            _ => self.scrape_page(&url, depth, attempt, stack).await,
        };
        self.record(&url, &outcome);
    }

    fn record(&mut self, url: &Url, outcome: &UrlOutcome) {
        debug!(url = %url, "Outcome: {:?}", outcome);
        self.report.record(outcome);
        self.publish();
    }

    /// Fetch and store a single resource without following its links
    async fn download(
        &mut self,
        url: &Url,
        kind: ContentKind,
        depth: usize,
        attempt: Attempt,
    ) -> UrlOutcome {
        self.merge_learned();

        let key = normalize_key(url);
        if self.state.is_downloaded(&key) {
            debug!("Already downloaded by an agent: {}", url);
            return UrlOutcome::AlreadySatisfied;
        }
        if self.engine.exists_locally(url, kind) {
            info!("File already exists locally: {}", url);
            self.state.mark_downloaded(&key);
            return UrlOutcome::AlreadySatisfied;
        }

        info!(depth, "Downloading: {}", url);
        let resource = match self.engine.fetch(url).await {
            Ok(resource) => resource,
            Err(e) => return self.on_transport_error(url, depth, attempt, &e).await,
        };
        self.escalation.record_success();

        let result = self.engine.store(url, kind, &resource.body);
        self.settle(url, &key, result)
    }

    async fn scrape_page(
        &mut self,
        url: &Url,
        depth: usize,
        attempt: Attempt,
        stack: &mut WorkStack,
    ) -> UrlOutcome {
        info!(depth, "Scraping page: {}", url);
        let resource = match self.engine.fetch(url).await {
            Ok(resource) => resource,
            Err(e) => return self.on_transport_error(url, depth, attempt, &e).await,
        };
        self.escalation.record_success();

        let key = normalize_key(url);
        let target = self.engine.locate(url, ContentKind::Page);
        let outcome = match self.engine.is_duplicate(&resource.body, &target) {
            ContentCheck::Duplicate { original } => {
                info!(
                    "Duplicate content detected, skipping: {} (same as {})",
                    url,
                    original.display()
                );
                return UrlOutcome::DuplicateSkipped { original };
            }
            ContentCheck::SamePath => {
                self.state.mark_downloaded(&key);
                UrlOutcome::AlreadySatisfied
            }
            ContentCheck::New if self.state.is_downloaded(&key) => UrlOutcome::AlreadySatisfied,
            ContentCheck::New => {
                let result = self.engine.persist(url, ContentKind::Page, &resource.body);
                self.settle(url, &key, result)
            }
        };

        let links = extract_links(&resource.body, &resource.url);
        self.download_linked_documents(&links.documents, depth).await;

        if depth < MAX_LINK_DEPTH {
            self.push_children(&links.pages, depth, stack);
        }

        outcome
    }

    fn settle(
        &mut self,
        url: &Url,
        key: &str,
        result: Result<UrlOutcome, StorageError>,
    ) -> UrlOutcome {
        match result {
            Ok(outcome) => {
                match &outcome {
                    UrlOutcome::Stored(path) => {
                        info!("Saved {}", path.display());
                        self.state.mark_downloaded(key);
                    }
                    UrlOutcome::AlreadySatisfied => self.state.mark_downloaded(key),
                    _ => {}
                }
                outcome
            }
            Err(e) => {
                error!("Failed to store {}: {}", url, e);
                UrlOutcome::StorageFailed
            }
        }
    }

    async fn download_linked_documents(&mut self, documents: &[Url], depth: usize) {
        for link in documents {
            let kind = match self.classifier.classify(link) {
                UrlKind::OffSite => continue,
                UrlKind::Document => ContentKind::Document,
                UrlKind::Skipped | UrlKind::Page => ContentKind::Page,
            };
            let doc = normalize(link);
            let key = normalize_key(&doc);
            if self.state.is_downloaded(&key)
                || self.state.is_failed(&key)
                || self.state.is_visited(&key)
                || self.deferred_keys.contains(&key)
            {
                continue;
            }

            let outcome = self.download(&doc, kind, depth + 1, Attempt::First).await;
            self.record(&doc, &outcome);
        }
    }

    fn push_children(&self, pages: &[Url], depth: usize, stack: &mut WorkStack) {
        let mut children = Vec::new();
        for link in pages {
            let Some(child) = self.classifier.admit(link) else {
                continue;
            };
            let key = normalize_key(&child);
            if self.state.is_visited(&key)
                || self.state.is_failed(&key)
                || self.deferred_keys.contains(&key)
            {
                continue;
            }
            if self.classifier.is_downloadable_document(&child) && self.state.is_downloaded(&key) {
                continue;
            }
            children.push(child);
        }

        debug!(depth, "Queued {} child links", children.len());
        stack.extend(children.into_iter().rev().map(|c| (c, depth + 1)));
    }

    async fn on_transport_error(
        &mut self,
        url: &Url,
        depth: usize,
        attempt: Attempt,
        err: &TransportError,
    ) -> UrlOutcome {
        let key = normalize_key(url);

        match self.escalation.record_failure(url, err).await {
            Escalation::Exhausted => {
                error!("Could not recover, marking failed: {}", url);
                self.state.mark_failed(&key);
                UrlOutcome::Failed
            }
            escalation => {
                if escalation == Escalation::Rotated {
                    self.rotation_status = self.rotator.status().await;
                }
                match attempt {
                    Attempt::Retry => {
                        warn!("Retry failed, marking failed: {}", url);
                        self.state.mark_failed(&key);
                        UrlOutcome::Failed
                    }
                    Attempt::First => {
                        if self.deferred_keys.insert(key) {
                            debug!("Deferring {} for one retry", url);
                            self.deferred.push((url.clone(), depth));
                        }
                        UrlOutcome::Deferred
                    }
                }
            }
        }
    }
}

impl Drop for CrawlDriver {
    /// A crawl torn down mid-run (a panic unwinding through the driver)
    /// still gets a best-effort flush
    fn drop(&mut self) {
        if self.phase == CrawlPhase::Running {
            warn!("Crawl ended unexpectedly, saving state");
            self.phase = CrawlPhase::Aborted;
            let _ = self.flush();
        }
    }
}
