//! Download link discovery on the NEXRAD inventory page.
//!
//! The page lists each archive file as
//! `<div class="bdpLink"><a href="...">name</a></div>`. Extraction is a pure
//! function of the page text and the URL it was served from.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::{debug, trace};
use url::Url;

use crate::models::DownloadLink;

/// Class that marks a download entry on the inventory page.
const LINK_CLASS: &str = "bdpLink";

#[allow(clippy::expect_used)]
static DIV_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<div\b([^>]*)>").expect("div regex is valid"));

#[allow(clippy::expect_used)]
static DIV_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</div\s*>").expect("closing div regex is valid"));

#[allow(clippy::expect_used)]
static ANCHOR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<a\b([^>]*)>").expect("anchor regex is valid"));

#[allow(clippy::expect_used)]
static CLASS_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:^|\s)class\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("class attribute regex is valid")
});

#[allow(clippy::expect_used)]
static HREF_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:^|\s)href\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("href attribute regex is valid")
});

/// Returns the absolute URL of every download entry, in page order.
///
/// Duplicates are kept. Entries without an anchor, anchors without an
/// `href`, and hrefs that cannot be resolved are skipped. An unparseable
/// `base_url` yields no links.
#[tracing::instrument(skip(page), fields(page_len = page.len()))]
pub fn extract(page: &str, base_url: &str) -> Vec<DownloadLink> {
    let Ok(base) = Url::parse(base_url) else {
        debug!("base URL is not absolute, no links extracted");
        return Vec::new();
    };

    let mut links = Vec::new();
    for div in DIV_OPEN.captures_iter(page) {
        let attrs = div.get(1).map_or("", |m| m.as_str());
        if !has_class(attrs, LINK_CLASS) {
            continue;
        }

        // Entries may sit inside wrapper divs, so the body runs from this
        // tag to the next closing tag rather than a balanced match.
        let rest = div.get(0).map_or("", |m| &page[m.end()..]);
        let Some(close) = DIV_CLOSE.find(rest) else {
            trace!("unterminated link entry skipped");
            continue;
        };
        let body = &rest[..close.start()];
        let Some(anchor) = ANCHOR_PATTERN.captures(body) else {
            trace!("link entry without anchor skipped");
            continue;
        };
        let anchor_attrs = anchor.get(1).map_or("", |m| m.as_str());
        let Some(href) = HREF_ATTR.captures(anchor_attrs).map(|c| attr_value(&c)) else {
            debug!("anchor without href skipped");
            continue;
        };

        let href = decode_entities(href.trim());
        match base.join(&href) {
            Ok(url) => links.push(DownloadLink::new(url.to_string())),
            Err(e) => debug!(href = %href, error = %e, "unresolvable href skipped"),
        }
    }

    debug!(links = links.len(), "extracted download links");
    links
}

/// Keeps the first occurrence of each link, preserving page order.
pub fn dedup_links(links: Vec<DownloadLink>) -> Vec<DownloadLink> {
    let before = links.len();
    let mut seen = HashSet::new();
    let links: Vec<_> = links.into_iter().filter(|link| seen.insert(link.clone())).collect();
    if links.len() < before {
        debug!(removed = before - links.len(), "dropped duplicate links");
    }
    links
}

fn has_class(attrs: &str, class: &str) -> bool {
    CLASS_ATTR
        .captures(attrs)
        .is_some_and(|c| attr_value(&c).split_ascii_whitespace().any(|token| token == class))
}

fn attr_value<'h>(captures: &Captures<'h>) -> &'h str {
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .or_else(|| captures.get(3))
        .map_or("", |m| m.as_str())
}

fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
