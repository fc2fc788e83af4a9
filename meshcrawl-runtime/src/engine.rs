//! Content fetch and dedup engine
//!
//! Fetches through the transport, detects byte-identical content via the
//! fingerprint index and writes accepted bodies into the storage layout.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use url::Url;

use meshcrawl_core::{
    fingerprint, write_atomic, ContentKind, FingerprintIndex, StorageError, StorageLayout,
    UrlOutcome,
};
use meshcrawl_net::{FetchedResource, SharedTransport, TransportError};

/// Result of checking a body against stored content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentCheck {
    /// Never stored before
    New,
    /// Identical content already sits at the path this URL resolves to
    SamePath,
    /// Identical content stored under a different URL
    Duplicate { original: PathBuf },
}

pub struct FetchEngine {
    transport: SharedTransport,
    layout: StorageLayout,
    index: FingerprintIndex,
    index_path: PathBuf,
}

impl FetchEngine {
    /// Open the engine, loading the fingerprint index or rebuilding it from
    /// the files under the storage root. `exclude` lists state files that
    /// live there but are not content.
    pub fn open(
        transport: SharedTransport,
        layout: StorageLayout,
        index_path: PathBuf,
        exclude: &[&Path],
    ) -> Self {
        let index = match FingerprintIndex::load(&index_path) {
            Ok(Some(index)) => {
                info!("Loaded fingerprint index with {} entries", index.len());
                index
            }
            Ok(None) => Self::rebuild(&layout, &index_path, exclude),
            Err(e) => {
                warn!("Fingerprint index unreadable, rebuilding: {}", e);
                Self::rebuild(&layout, &index_path, exclude)
            }
        };

        Self {
            transport,
            layout,
            index,
            index_path,
        }
    }

    fn rebuild(layout: &StorageLayout, index_path: &Path, exclude: &[&Path]) -> FingerprintIndex {
        let mut skip: Vec<&Path> = exclude.to_vec();
        skip.push(index_path);
        let index = FingerprintIndex::rebuild(layout.root(), &skip);
        info!(
            "Built fingerprint index from {} ({} entries)",
            layout.root().display(),
            index.len()
        );
        index
    }

    pub fn index(&self) -> &FingerprintIndex {
        &self.index
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Fetch a URL; non-success statuses are transport errors
    pub async fn fetch(&self, url: &Url) -> Result<FetchedResource, TransportError> {
        self.transport.get(url).await
    }

    /// Where a URL's content is stored
    pub fn locate(&self, url: &Url, kind: ContentKind) -> PathBuf {
        self.layout.locate(url, kind)
    }

    /// Whether a file already exists where this URL would be stored
    pub fn exists_locally(&self, url: &Url, kind: ContentKind) -> bool {
        self.locate(url, kind).is_file()
    }

    /// Check a body against everything stored so far
    pub fn is_duplicate(&mut self, body: &[u8], target: &Path) -> ContentCheck {
        self.check_fingerprint(&fingerprint(body), target)
    }

    fn check_fingerprint(&mut self, fp: &str, target: &Path) -> ContentCheck {
        match self.index.lookup(fp) {
            Some(original) if original == target => ContentCheck::SamePath,
            Some(original) => ContentCheck::Duplicate { original },
            None => ContentCheck::New,
        }
    }

    /// Write a body to its storage path, never replacing an existing file
    pub fn persist(
        &mut self,
        url: &Url,
        kind: ContentKind,
        body: &[u8],
    ) -> Result<UrlOutcome, StorageError> {
        self.persist_fingerprinted(url, kind, body, fingerprint(body))
    }

    fn persist_fingerprinted(
        &mut self,
        url: &Url,
        kind: ContentKind,
        body: &[u8],
        fp: String,
    ) -> Result<UrlOutcome, StorageError> {
        let path = self.layout.prepare(url, kind)?;
        if path.exists() {
            debug!("File already exists locally: {}", path.display());
            return Ok(UrlOutcome::AlreadySatisfied);
        }

        write_atomic(&path, body)?;
        self.index.record(fp, path.clone());
        Ok(UrlOutcome::Stored(path))
    }

    /// Dedup check followed by persist
    pub fn store(
        &mut self,
        url: &Url,
        kind: ContentKind,
        body: &[u8],
    ) -> Result<UrlOutcome, StorageError> {
        let fp = fingerprint(body);
        let target = self.locate(url, kind);

        match self.check_fingerprint(&fp, &target) {
            ContentCheck::SamePath => Ok(UrlOutcome::AlreadySatisfied),
            ContentCheck::Duplicate { original } => {
                info!("Duplicate content detected, skipping: {}", url);
                Ok(UrlOutcome::DuplicateSkipped { original })
            }
            ContentCheck::New => self.persist_fingerprinted(url, kind, body, fp),
        }
    }

    pub fn save_index(&self) -> Result<(), StorageError> {
        self.index.save(&self.index_path)
    }
}
