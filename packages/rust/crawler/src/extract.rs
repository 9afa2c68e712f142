//! Page analysis: readable text, asset links, and outgoing links.
//!
//! [`analyze_page`] is synchronous because `scraper::Html` is not `Send`;
//! the engine calls it between awaits and only keeps the owned result.

use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{ElementRef, Html, Node, Selector};
use url::Url;

/// Containers tried, in order, before falling back to `<body>`.
const CONTENT_SELECTORS: &[&str] = &[
    "main",
    "article",
    "#content",
    ".content",
    "#main",
    ".main",
    r#"[role="main"]"#,
];

/// A semantic container is used only if it holds more text than this.
const MIN_CONTAINER_CHARS: usize = 200;

/// Never rendered as visible text.
const INVISIBLE_TAGS: &[&str] = &["script", "style", "noscript", "template", "svg", "iframe"];

/// Site chrome skipped when falling back to the whole body.
const CHROME_TAGS: &[&str] = &["nav", "header", "footer", "aside"];

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "main", "li", "ul", "ol", "h1", "h2", "h3", "h4", "h5",
    "h6", "br", "tr", "table", "blockquote", "pre", "dt", "dd", "figcaption", "address",
];

static CONTAINER_SELECTORS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    CONTENT_SELECTORS
        .iter()
        .filter_map(|css| Selector::parse(css).ok())
        .collect()
});
static BODY: LazyLock<Selector> = LazyLock::new(|| parse_selector("body"));
static IMG: LazyLock<Selector> = LazyLock::new(|| parse_selector("img"));
static ANCHOR: LazyLock<Selector> = LazyLock::new(|| parse_selector("a[href]"));

fn parse_selector(css: &str) -> Selector {
    Selector::parse(css).unwrap_or_else(|e| panic!("invalid built-in selector {css:?}: {e}"))
}

/// Everything the crawler needs from one fetched page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageAnalysis {
    /// Readable text, present only if longer than the configured minimum.
    pub text: Option<String>,
    /// Absolute image URLs, in document order, without duplicates.
    pub images: Vec<Url>,
    /// Absolute PDF URLs, in document order, without duplicates.
    pub documents: Vec<Url>,
    /// Absolute http(s) links with fragments removed.
    pub links: Vec<Url>,
}

/// Parse `html` fetched from `base` and pull out text, assets, and links.
pub fn analyze_page(html: &str, base: &Url, min_text_chars: usize) -> PageAnalysis {
    let doc = Html::parse_document(html);

    let text = readable_text(&doc);
    let text = (text.chars().count() > min_text_chars).then_some(text);

    let mut links = Vec::new();
    let mut documents = Vec::new();
    let mut seen_links = HashSet::new();
    let mut seen_docs = HashSet::new();

    for el in doc.select(&ANCHOR) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let Some(url) = resolve_link(base, href) else {
            continue;
        };

        if url.path().to_lowercase().ends_with(".pdf") {
            if seen_docs.insert(url.to_string()) {
                documents.push(url.clone());
            }
        }
        if seen_links.insert(url.to_string()) {
            links.push(url);
        }
    }

    let mut images = Vec::new();
    let mut seen_images = HashSet::new();
    for el in doc.select(&IMG) {
        let Some(src) = image_source(el) else {
            continue;
        };
        if let Some(url) = resolve_http(base, src) {
            if seen_images.insert(url.to_string()) {
                images.push(url);
            }
        }
    }

    PageAnalysis {
        text,
        images,
        documents,
        links,
    }
}

/// Text of the first substantial semantic container, else the body minus chrome.
fn readable_text(doc: &Html) -> String {
    for selector in CONTAINER_SELECTORS.iter() {
        if let Some(el) = doc.select(selector).next() {
            let text = visible_text(el, false);
            if text.chars().count() > MIN_CONTAINER_CHARS {
                return text;
            }
        }
    }

    doc.select(&BODY)
        .next()
        .map(|body| visible_text(body, true))
        .unwrap_or_default()
}

/// Rendered text of `root`: one line per block element, whitespace collapsed.
fn visible_text(root: ElementRef<'_>, skip_chrome: bool) -> String {
    let mut raw = String::new();
    collect_text(root, skip_chrome, &mut raw);

    raw.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collect_text(el: ElementRef<'_>, skip_chrome: bool, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(element) => {
                let name = element.name();
                if INVISIBLE_TAGS.contains(&name) || (skip_chrome && CHROME_TAGS.contains(&name)) {
                    continue;
                }
                let block = BLOCK_TAGS.contains(&name);
                if block {
                    out.push('\n');
                }
                if let Some(child_el) = ElementRef::wrap(child) {
                    collect_text(child_el, skip_chrome, out);
                }
                if block {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

/// The best URL candidate on an `<img>`, covering common lazy-load attributes.
fn image_source<'a>(el: ElementRef<'a>) -> Option<&'a str> {
    let attrs = el.value();
    ["src", "data-src", "data-original", "data-lazy-src"]
        .iter()
        .filter_map(|name| attrs.attr(name))
        .map(str::trim)
        .find(|src| !src.is_empty() && !src.starts_with("data:"))
        .or_else(|| {
            // First srcset candidate: "url 480w, url2 800w"
            attrs
                .attr("srcset")
                .and_then(|set| set.split(',').next())
                .and_then(|candidate| candidate.split_whitespace().next())
                .filter(|src| !src.starts_with("data:"))
        })
}

fn resolve_link(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
    {
        return None;
    }
    resolve_http(base, href)
}

fn resolve_http(base: &Url, raw: &str) -> Option<Url> {
    let mut url = base.join(raw).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.set_fragment(None);
    Some(url)
}
