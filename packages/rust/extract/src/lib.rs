//! HTML content extraction.
//!
//! Turns a fetched HTML document into readable text, outbound links, and
//! page metadata (title, representative image, published date). Boilerplate
//! elements (navigation, scripts, chrome) are skipped; the main content is
//! taken from `<main>`, then `<article>`, then `<body>`.

pub mod chunk;

pub use chunk::chunk_text;

use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use url::Url;

/// Elements whose entire subtree carries no readable content.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "noscript", "svg", "nav", "header", "footer", "aside", "form", "iframe",
];

/// Elements that end a line of text.
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "li", "ul", "ol", "table", "tr", "br", "h1", "h2", "h3",
    "h4", "h5", "h6", "blockquote", "pre",
];

/// Everything extracted from one HTML page.
#[derive(Debug, Clone)]
pub struct ExtractedPage {
    /// Page title: `<title>`, else the first `<h1>`.
    pub title: Option<String>,
    /// Readable text of the main content area.
    pub text: String,
    /// Absolute http(s) links found anywhere in the document, fragments stripped.
    pub links: Vec<Url>,
    /// og:image, else the first in-content `<img>`.
    pub image_url: Option<String>,
    /// Published date as advertised by the page (`article:published_time` etc.).
    pub published_date: Option<String>,
}

/// Extract text, links, and metadata from an HTML document.
pub fn extract_page(html: &str, base_url: &Url) -> ExtractedPage {
    let doc = Html::parse_document(html);

    let content_root = select_content_root(&doc);
    let text = content_root
        .map(|root| collect_readable_text(root))
        .unwrap_or_default();

    ExtractedPage {
        title: extract_title(&doc),
        links: extract_links(&doc, base_url),
        image_url: extract_image(&doc, content_root, base_url),
        published_date: extract_published_date(&doc),
        text,
    }
}

/// Hex SHA-256 of extracted text, used for change detection.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Content selection
// ---------------------------------------------------------------------------

fn select_content_root(doc: &Html) -> Option<ElementRef<'_>> {
    for sel_str in ["main", "article", "body"] {
        let selector = Selector::parse(sel_str).unwrap();
        if let Some(el) = doc.select(&selector).next() {
            return Some(el);
        }
    }
    None
}

/// Walk the content subtree collecting text, skipping non-content elements.
fn collect_readable_text(root: ElementRef<'_>) -> String {
    let mut out = String::new();
    walk_text(root, &mut out);
    normalize_whitespace(&out)
}

fn walk_text(el: ElementRef<'_>, out: &mut String) {
    let name = el.value().name();
    if SKIP_TAGS.contains(&name) {
        return;
    }

    for child in el.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            walk_text(child_el, out);
        } else if let Some(text) = child.value().as_text() {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                    out.push(' ');
                }
                out.push_str(trimmed);
            }
        }
    }

    if BLOCK_TAGS.contains(&name) && !out.ends_with('\n') {
        out.push('\n');
    }
}

/// Collapse runs of spaces and blank lines.
fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if !line.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&line);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

fn extract_title(doc: &Html) -> Option<String> {
    let title_sel = Selector::parse("title").unwrap();
    if let Some(el) = doc.select(&title_sel).next() {
        let title = el.text().collect::<String>().trim().to_string();
        if !title.is_empty() {
            return Some(title);
        }
    }

    let h1_sel = Selector::parse("h1").unwrap();
    doc.select(&h1_sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

fn extract_links(doc: &Html, base_url: &Url) -> Vec<Url> {
    let link_sel = Selector::parse("a[href]").unwrap();
    let mut links = Vec::new();

    for el in doc.select(&link_sel) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        if href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:")
        {
            continue;
        }

        if let Ok(mut resolved) = base_url.join(href) {
            resolved.set_fragment(None);
            if matches!(resolved.scheme(), "http" | "https") {
                links.push(resolved);
            }
        }
    }

    links
}

fn extract_image(doc: &Html, content_root: Option<ElementRef<'_>>, base_url: &Url) -> Option<String> {
    let og_sel = Selector::parse(r#"meta[property="og:image"]"#).unwrap();
    if let Some(content) = doc
        .select(&og_sel)
        .next()
        .and_then(|el| el.value().attr("content"))
    {
        if let Ok(resolved) = base_url.join(content.trim()) {
            if matches!(resolved.scheme(), "http" | "https") {
                return Some(resolved.to_string());
            }
        }
    }

    let img_sel = Selector::parse("img[src]").unwrap();
    let root = content_root?;
    for el in root.select(&img_sel) {
        let Some(src) = el.value().attr("src") else {
            continue;
        };
        if let Ok(resolved) = base_url.join(src.trim()) {
            if matches!(resolved.scheme(), "http" | "https") {
                return Some(resolved.to_string());
            }
        }
    }

    None
}

fn extract_published_date(doc: &Html) -> Option<String> {
    let meta_selectors = [
        r#"meta[property="article:published_time"]"#,
        r#"meta[name="article:published_time"]"#,
        r#"meta[property="og:article:published_time"]"#,
        r#"meta[itemprop="datePublished"]"#,
        r#"meta[name="date"]"#,
    ];

    for sel_str in meta_selectors {
        let selector = Selector::parse(sel_str).unwrap();
        if let Some(content) = doc
            .select(&selector)
            .next()
            .and_then(|el| el.value().attr("content"))
        {
            let content = content.trim();
            if !content.is_empty() {
                return Some(content.to_string());
            }
        }
    }

    let time_sel = Selector::parse("time[datetime]").unwrap();
    doc.select(&time_sel)
        .next()
        .and_then(|el| el.value().attr("datetime"))
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
}
