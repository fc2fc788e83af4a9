//! URL classification and normalization
//!
//! Decides whether a discovered URL belongs to the crawl:
//! - same site as the base URL
//! - not skip-listed (asset directories, translated content, style/script bundles)
//! - a downloadable document or an ordinary page
//!
//! Normalized URLs are the dedup keys used by every store.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Path fragments that are never crawled as pages
pub const DEFAULT_SKIP_PATTERNS: &[&str] = &[
    "/docs/",
    "/sites/default/files/css/",
    "/sites/default/files/js/",
    "/libraries/",
    "/sites/default/files/index.ico",
    "/sites/default/files/css_css_",
    "/libraries_theme-gcweb_assets_",
    "/libraries_wet-boew_css_",
    "/sites_default_files_",
    "/fr/",
];

/// Extensions of static assets that are never crawled
pub const DEFAULT_SKIP_EXTENSIONS: &[&str] = &[
    "css", "js", "ico", "svg", "png", "jpg", "jpeg", "gif", "woff", "woff2", "ttf", "eot",
];

/// Extensions treated as downloadable documents
pub const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "txt", "rtf", "csv", "xml", "json",
];

/// Errors from URL handling
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("Invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),
}

/// Skip-list configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Substrings of the lowercased path that exclude a URL
    pub skip_patterns: Vec<String>,
    /// Extensions (without the dot) that exclude a URL
    pub skip_extensions: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            skip_patterns: DEFAULT_SKIP_PATTERNS.iter().map(|s| s.to_string()).collect(),
            skip_extensions: DEFAULT_SKIP_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// What the crawler should do with a URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlKind {
    /// Different host than the crawl base
    OffSite,
    /// Matches the skip-list
    Skipped,
    /// Downloadable document, fetched but never parsed for links
    Document,
    /// HTML page, stored and parsed for links
    Page,
}

/// Parse an absolute http(s) URL
pub fn parse_url(raw: &str) -> Result<Url, ClassifyError> {
    let url = Url::parse(raw.trim()).map_err(|source| ClassifyError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ClassifyError::UnsupportedScheme(other.to_string())),
    }
}

/// Strip the fragment, keeping scheme, host, path and query
pub fn normalize(url: &Url) -> Url {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    normalized
}

/// Normalized string form used as a dedup key
pub fn normalize_key(url: &Url) -> String {
    normalize(url).into()
}

/// Exact host match against the crawl base
pub fn same_site(url: &Url, base: &Url) -> bool {
    match (url.host_str(), base.host_str()) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

/// Lowercased extension of the last path segment
fn path_extension(path: &str) -> Option<&str> {
    let last = path.rsplit('/').next()?;
    let (_, ext) = last.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext)
    }
}

/// Classifies URLs relative to a fixed crawl base
#[derive(Debug, Clone)]
pub struct UrlClassifier {
    base: Url,
    skip_patterns: Vec<String>,
    skip_extensions: Vec<String>,
}

impl UrlClassifier {
    pub fn new(base: Url, config: &ClassifierConfig) -> Self {
        Self {
            base,
            skip_patterns: config.skip_patterns.iter().map(|p| p.to_lowercase()).collect(),
            skip_extensions: config
                .skip_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn with_defaults(base: Url) -> Self {
        Self::new(base, &ClassifierConfig::default())
    }

    /// The crawl base URL
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Whether the URL is on the crawl site
    pub fn same_site(&self, url: &Url) -> bool {
        same_site(url, &self.base)
    }

    /// Whether the URL is excluded from page crawling.
    ///
    /// PDFs are never skipped, whatever the pattern or extension lists say.
    pub fn should_skip(&self, url: &Url) -> bool {
        let path = url.path().to_lowercase();

        if path.ends_with(".pdf") {
            return false;
        }

        // Fragment-only links (page anchors) resolve to an empty or root path
        if path.is_empty()
            || (path == "/" && url.fragment().is_some() && url.query().is_none())
        {
            return true;
        }

        if self.skip_patterns.iter().any(|p| path.contains(p.as_str())) {
            return true;
        }

        match path_extension(&path) {
            Some("pdf") => false,
            Some(ext) => self.skip_extensions.iter().any(|e| e == ext),
            None => false,
        }
    }

    /// Whether the URL points at a downloadable document
    pub fn is_downloadable_document(&self, url: &Url) -> bool {
        is_downloadable_document(url)
    }

    pub fn classify(&self, url: &Url) -> UrlKind {
        if !self.same_site(url) {
            UrlKind::OffSite
        } else if self.is_downloadable_document(url) {
            UrlKind::Document
        } else if self.should_skip(url) {
            UrlKind::Skipped
        } else {
            UrlKind::Page
        }
    }

    /// Normalized form of a discovered link if it is crawlable
    pub fn admit(&self, url: &Url) -> Option<Url> {
        if !self.same_site(url) || self.should_skip(url) {
            return None;
        }
        Some(normalize(url))
    }
}

/// Whether the URL path ends in a document extension
pub fn is_downloadable_document(url: &Url) -> bool {
    let path = url.path().to_lowercase();
    DOCUMENT_EXTENSIONS
        .iter()
        .any(|ext| path.ends_with(&format!(".{}", ext)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn classifier() -> UrlClassifier {
        UrlClassifier::with_defaults(url("https://nrc.canada.ca/en"))
    }

    #[test]
    fn test_normalize_strips_fragment() {
        let with = url("https://nrc.canada.ca/en/research?page=2#wb-cont");
        let without = url("https://nrc.canada.ca/en/research?page=2");
        assert_eq!(normalize(&with), normalize(&without));
        assert_eq!(
            normalize_key(&with),
            "https://nrc.canada.ca/en/research?page=2"
        );
    }

    #[test]
    fn test_pdf_never_skipped() {
        let c = classifier();
        for raw in [
            "https://nrc.canada.ca/docs/report.pdf",
            "https://nrc.canada.ca/fr/rapport.pdf",
            "https://nrc.canada.ca/libraries/a.PDF",
            "https://nrc.canada.ca/sites/default/files/css/x.pdf",
        ] {
            assert!(!c.should_skip(&url(raw)), "{} should not be skipped", raw);
        }
    }

    #[test]
    fn test_skip_patterns_and_extensions() {
        let c = classifier();
        assert!(c.should_skip(&url("https://nrc.canada.ca/fr/page")));
        assert!(c.should_skip(&url("https://nrc.canada.ca/docs/index.html")));
        assert!(c.should_skip(&url("https://nrc.canada.ca/theme/site.css")));
        assert!(c.should_skip(&url("https://nrc.canada.ca/img/logo.PNG")));
        assert!(c.should_skip(&url("https://nrc.canada.ca/#wb-info")));
        assert!(!c.should_skip(&url("https://nrc.canada.ca/en/research")));
        assert!(!c.should_skip(&url("https://nrc.canada.ca/")));
    }

    #[test]
    fn test_custom_skip_config() {
        let config = ClassifierConfig {
            skip_patterns: vec!["/Archive/".to_string()],
            skip_extensions: vec![".zip".to_string()],
        };
        let c = UrlClassifier::new(url("https://example.org/"), &config);
        assert!(c.should_skip(&url("https://example.org/archive/2020")));
        assert!(c.should_skip(&url("https://example.org/bundle.zip")));
        assert!(!c.should_skip(&url("https://example.org/theme/site.css")));
    }

    #[test]
    fn test_document_detection() {
        assert!(is_downloadable_document(&url("https://a.ca/x/report.PDF")));
        assert!(is_downloadable_document(&url("https://a.ca/data.csv?v=2")));
        assert!(!is_downloadable_document(&url("https://a.ca/page.html")));
        assert!(!is_downloadable_document(&url("https://a.ca/pdf")));
    }

    #[test]
    fn test_classify() {
        let c = classifier();
        assert_eq!(c.classify(&url("https://other.ca/en")), UrlKind::OffSite);
        assert_eq!(
            c.classify(&url("https://nrc.canada.ca/fr/a.pdf")),
            UrlKind::Document
        );
        assert_eq!(
            c.classify(&url("https://nrc.canada.ca/a/site.js")),
            UrlKind::Skipped
        );
        assert_eq!(c.classify(&url("https://nrc.canada.ca/en/a")), UrlKind::Page);
    }

    #[test]
    fn test_admit_normalizes() {
        let c = classifier();
        let admitted = c.admit(&url("https://nrc.canada.ca/en/a#top")).unwrap();
        assert_eq!(admitted.as_str(), "https://nrc.canada.ca/en/a");
        assert!(c.admit(&url("https://elsewhere.ca/en/a")).is_none());
    }

    #[test]
    fn test_parse_url_rejects_other_schemes() {
        assert!(parse_url("https://nrc.canada.ca").is_ok());
        assert!(matches!(
            parse_url("ftp://nrc.canada.ca/file"),
            Err(ClassifyError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            parse_url("not a url"),
            Err(ClassifyError::InvalidUrl { .. })
        ));
    }
}
