//! Link extraction from fetched markup
//!
//! Pages yield two link sets: ordinary anchors for traversal, and
//! document candidates found by four independent strategies:
//! 1. anchors whose href ends in `.pdf`
//! 2. anchors whose text mentions "pdf" or "download"
//! 3. `data-pdf-url` attributes
//! 4. `.pdf` string literals inside inline scripts

use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::sync::LazyLock;
use url::Url;

static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a").unwrap());

static DATA_PDF: LazyLock<Selector> = LazyLock::new(|| Selector::parse("[data-pdf-url]").unwrap());

static SCRIPT: LazyLock<Selector> = LazyLock::new(|| Selector::parse("script").unwrap());

static SCRIPT_PDF_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["']([^"']*\.pdf[^"']*)["']"#).unwrap());

/// Words in anchor text that suggest a document download
const DOCUMENT_TRIGGER_WORDS: &[&str] = &["pdf", "download"];

/// Links found on a page, absolute and in document order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedLinks {
    /// Every anchor target
    pub pages: Vec<Url>,
    /// Document candidates from all strategies, deduplicated
    pub documents: Vec<Url>,
}

/// Resolve an href against the page URL, keeping only http(s) targets
fn resolve(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let url = base.join(href).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

/// Keeps first occurrence order while dropping repeats
struct OrderedSet {
    seen: HashSet<String>,
    items: Vec<Url>,
}

impl OrderedSet {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            items: Vec::new(),
        }
    }

    fn push(&mut self, url: Url) {
        if self.seen.insert(url.as_str().to_string()) {
            self.items.push(url);
        }
    }
}

/// Extract traversal and document links from raw markup.
///
/// Undecodable bytes are replaced, so malformed markup simply yields fewer
/// links.
pub fn extract_links(body: &[u8], base: &Url) -> ExtractedLinks {
    let html = String::from_utf8_lossy(body);
    let document = Html::parse_document(&html);

    ExtractedLinks {
        pages: page_links(&document, base),
        documents: document_links(&document, base),
    }
}

fn page_links(document: &Html, base: &Url) -> Vec<Url> {
    let mut links = OrderedSet::new();
    for element in document.select(&ANCHOR) {
        if let Some(url) = element.value().attr("href").and_then(|h| resolve(base, h)) {
            links.push(url);
        }
    }
    links.items
}

fn document_links(document: &Html, base: &Url) -> Vec<Url> {
    let mut links = OrderedSet::new();

    // Direct PDF anchors
    for element in document.select(&ANCHOR) {
        if let Some(href) = element.value().attr("href") {
            if href.trim().to_lowercase().ends_with(".pdf") {
                if let Some(url) = resolve(base, href) {
                    links.push(url);
                }
            }
        }
    }

    // Anchor text hints
    for element in document.select(&ANCHOR) {
        let text = element.text().collect::<String>().to_lowercase();
        if !DOCUMENT_TRIGGER_WORDS.iter().any(|w| text.contains(w)) {
            continue;
        }
        if let Some(url) = element.value().attr("href").and_then(|h| resolve(base, h)) {
            links.push(url);
        }
    }

    // Data attributes
    for element in document.select(&DATA_PDF) {
        if let Some(url) = element
            .value()
            .attr("data-pdf-url")
            .and_then(|h| resolve(base, h))
        {
            links.push(url);
        }
    }

    // Inline script literals
    for element in document.select(&SCRIPT) {
        let source = element.text().collect::<String>();
        for cap in SCRIPT_PDF_LITERAL.captures_iter(&source) {
            if let Some(url) = resolve(base, &cap[1]) {
                links.push(url);
            }
        }
    }

    links.items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://nrc.canada.ca/en/research/index.html").unwrap()
    }

    #[test]
    fn test_page_links_resolved_and_deduplicated() {
        let html = br##"
            <html><body>
                <a href="/en/about">About</a>
                <a href="team.html">Team</a>
                <a href="/en/about">About again</a>
                <a href="#wb-cont">Skip</a>
                <a href="mailto:info@nrc.ca">Mail</a>
                <a>No href</a>
            </body></html>
        "##;

        let links = extract_links(html, &base());
        let pages: Vec<_> = links.pages.iter().map(|u| u.as_str()).collect();
        assert_eq!(
            pages,
            vec![
                "https://nrc.canada.ca/en/about",
                "https://nrc.canada.ca/en/research/team.html",
            ]
        );
    }

    #[test]
    fn test_all_document_strategies() {
        let html = br#"
            <html><body>
                <a href="/pubs/annual.PDF">Annual report</a>
                <a href="/get?id=7">Download the dataset</a>
                <a href="/viewer">View PDF version</a>
                <div data-pdf-url="/files/spec.pdf"></div>
                <script>
                    var doc = "/files/brochure.pdf?v=2";
                    var other = '/static/app.js';
                </script>
            </body></html>
        "#;

        let links = extract_links(html, &base());
        let docs: Vec<_> = links.documents.iter().map(|u| u.as_str()).collect();
        assert_eq!(
            docs,
            vec![
                "https://nrc.canada.ca/pubs/annual.PDF",
                "https://nrc.canada.ca/get?id=7",
                "https://nrc.canada.ca/viewer",
                "https://nrc.canada.ca/files/spec.pdf",
                "https://nrc.canada.ca/files/brochure.pdf?v=2",
            ]
        );
    }

    #[test]
    fn test_document_found_by_two_strategies_listed_once() {
        let html = br#"<a href="/r.pdf">Download PDF</a>"#;
        let links = extract_links(html, &base());
        assert_eq!(links.documents.len(), 1);
    }

    #[test]
    fn test_malformed_markup_degrades() {
        let links = extract_links(b"\xff\xfe<a href=\"/x\"", &base());
        assert!(links.documents.is_empty());

        let empty = extract_links(b"", &base());
        assert_eq!(empty, ExtractedLinks::default());
    }
}
