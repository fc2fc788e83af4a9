//! On-disk layout for downloaded content
//!
//! Every URL maps to a file under the output root that mirrors the URL path:
//! all path segments but the last become sanitized directories, the last one
//! becomes the file name.

use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;
use url::Url;

/// Errors from the local filesystem
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed state file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// How a URL's content is named on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// Stored as `<name>.html`
    Page,
    /// Keeps its own file name and extension
    Document,
}

static INVALID_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).unwrap());

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static REPEATED_UNDERSCORES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_+").unwrap());

static TRAILING_EXTENSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.[a-zA-Z0-9]+$").unwrap());

/// Make a single path component safe for the filesystem
pub fn sanitize_component(raw: &str) -> String {
    let cleaned = INVALID_CHARS.replace_all(raw, "_");
    let cleaned = WHITESPACE.replace_all(&cleaned, "_");
    let cleaned = REPEATED_UNDERSCORES.replace_all(&cleaned, "_");
    cleaned.trim_matches('_').to_string()
}

/// Sanitize a directory name, dropping any extension-like suffix
pub fn sanitize_directory(raw: &str) -> String {
    let cleaned = sanitize_component(raw);
    let cleaned = TRAILING_EXTENSION.replace(&cleaned, "");
    cleaned.trim_matches('_').to_string()
}

fn is_traversal(component: &str) -> bool {
    component.is_empty() || component.chars().all(|c| c == '.')
}

fn decode_segment(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

fn path_segments(url: &Url) -> Vec<String> {
    url.path()
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .map(decode_segment)
        .collect()
}

/// Query string folded into a file name
fn encode_query(query: &str) -> String {
    INVALID_CHARS
        .replace_all(query, "_")
        .replace('&', "_and_")
        .replace('=', "_")
}

/// Directory for a URL under `root`, without touching the filesystem
pub fn storage_directory(url: &Url, root: &Path) -> PathBuf {
    let segments = path_segments(url);
    let mut dir = root.to_path_buf();

    if let Some((_, parents)) = segments.split_last() {
        for part in parents {
            let clean = sanitize_directory(part);
            if !is_traversal(&clean) {
                dir.push(clean);
            }
        }
    }

    dir
}

/// Directory for a URL under `root`, created if missing
pub fn derive_storage_path(url: &Url, root: &Path) -> Result<PathBuf, StorageError> {
    let dir = storage_directory(url, root);
    fs::create_dir_all(&dir).map_err(|source| StorageError::CreateDir {
        path: dir.clone(),
        source,
    })?;
    Ok(dir)
}

/// File name for an HTML page
pub fn derive_page_filename(url: &Url) -> String {
    let mut base = match path_segments(url).pop() {
        Some(last) if last.contains('.') => {
            let lower = last.to_lowercase();
            if lower.ends_with(".html") {
                last[..last.len() - 5].to_string()
            } else if lower.ends_with(".htm") {
                last[..last.len() - 4].to_string()
            } else {
                last
            }
        }
        _ => "index".to_string(),
    };

    if let Some(query) = url.query().filter(|q| !q.is_empty()) {
        base.push('_');
        base.push_str(&encode_query(query));
    }

    let name = sanitize_component(&format!("{}.html", base));
    if is_traversal(name.trim_end_matches(".html")) {
        "index.html".to_string()
    } else {
        name
    }
}

/// File name for a downloadable document, keeping its extension
pub fn derive_document_filename(url: &Url) -> String {
    let last = path_segments(url)
        .pop()
        .unwrap_or_else(|| "document".to_string());

    let name = match url.query().filter(|q| !q.is_empty()) {
        Some(query) => match last.rsplit_once('.') {
            Some((stem, ext)) => format!("{}_{}.{}", stem, encode_query(query), ext),
            None => format!("{}_{}", last, encode_query(query)),
        },
        None => last,
    };

    let name = sanitize_component(&name);
    if is_traversal(&name) {
        "document".to_string()
    } else {
        name
    }
}

pub fn derive_filename(url: &Url, kind: ContentKind) -> String {
    match kind {
        ContentKind::Page => derive_page_filename(url),
        ContentKind::Document => derive_document_filename(url),
    }
}

/// Write via a temporary sibling and rename into place
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| StorageError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    fs::write(&tmp_path, bytes).map_err(|source| StorageError::Write {
        path: tmp_path.clone(),
        source,
    })?;
    fs::rename(&tmp_path, path).map_err(|source| {
        let _ = fs::remove_file(&tmp_path);
        StorageError::Write {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Resolves storage locations under a fixed output root
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full path for a URL, without creating anything
    pub fn locate(&self, url: &Url, kind: ContentKind) -> PathBuf {
        storage_directory(url, &self.root).join(derive_filename(url, kind))
    }

    /// Full path for a URL, creating its directory
    pub fn prepare(&self, url: &Url, kind: ContentKind) -> Result<PathBuf, StorageError> {
        Ok(derive_storage_path(url, &self.root)?.join(derive_filename(url, kind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("a  b\tc"), "a_b_c");
        assert_eq!(sanitize_component("__x<>y__"), "x_y");
        assert_eq!(sanitize_component("what?now*"), "what_now");
    }

    #[test]
    fn test_sanitize_directory_drops_extension() {
        assert_eq!(sanitize_directory("reports.aspx"), "reports");
        assert_eq!(sanitize_directory("Annual Reports"), "Annual_Reports");
    }

    #[test]
    fn test_storage_directory_mirrors_path() {
        let root = Path::new("/out");
        let dir = storage_directory(
            &url("https://nrc.canada.ca/en/research%20and%20development/page.html"),
            root,
        );
        assert_eq!(dir, Path::new("/out/en/research_and_development"));

        let dir = storage_directory(&url("https://nrc.canada.ca/"), root);
        assert_eq!(dir, Path::new("/out"));
    }

    #[test]
    fn test_storage_directory_ignores_dot_segments() {
        let dir = storage_directory(&url("https://a.ca/%2E%2E/%2E%2E/x.html"), Path::new("/out"));
        assert_eq!(dir, Path::new("/out"));
    }

    #[test]
    fn test_page_filename() {
        assert_eq!(derive_page_filename(&url("https://a.ca/")), "index.html");
        assert_eq!(derive_page_filename(&url("https://a.ca/en/about")), "index.html");
        assert_eq!(derive_page_filename(&url("https://a.ca/en/about.html")), "about.html");
        assert_eq!(derive_page_filename(&url("https://a.ca/en/old.htm")), "old.html");
        assert_eq!(
            derive_page_filename(&url("https://a.ca/en/list.html?page=2&sort=asc")),
            "list_page_2_and_sort_asc.html"
        );
        assert_eq!(
            derive_page_filename(&url("https://a.ca/en/?q=a/b")),
            "index_q_a_b.html"
        );
    }

    #[test]
    fn test_page_filename_is_pure() {
        let u = url("https://a.ca/en/news.html?id=7#top");
        assert_eq!(derive_page_filename(&u), derive_page_filename(&u));
    }

    #[test]
    fn test_document_filename_keeps_extension() {
        assert_eq!(
            derive_document_filename(&url("https://a.ca/pubs/Annual%20Report.pdf")),
            "Annual_Report.pdf"
        );
        assert_eq!(
            derive_document_filename(&url("https://a.ca/data/table.csv?year=2020")),
            "table_year_2020.csv"
        );
    }

    #[test]
    fn test_prepare_creates_directories() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        let path = layout
            .prepare(&url("https://a.ca/en/pubs/report.pdf"), ContentKind::Document)
            .unwrap();

        assert_eq!(path, dir.path().join("en").join("pubs").join("report.pdf"));
        assert!(dir.path().join("en").join("pubs").is_dir());
        assert!(!path.exists());
    }

    #[test]
    fn test_write_atomic_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
