//! Structured metadata extraction from HTML.
//!
//! Parsing never fails: malformed input yields whatever could be recovered
//! plus `parse_error = true`.

use std::collections::BTreeMap;

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

/// Metadata extracted from one page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub canonical_url: Option<String>,
    pub language: Option<String>,
    pub favicon: Option<String>,
    /// `og:*` properties keyed without the prefix
    pub open_graph: BTreeMap<String, String>,
    /// `twitter:*` properties keyed without the prefix
    pub twitter_card: BTreeMap<String, String>,
    pub headings: Headings,
    pub links: LinkStats,
    pub image_count: usize,
    pub word_count: usize,
    pub parse_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headings {
    pub h1: Vec<String>,
    pub h2: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub internal: usize,
    pub external: usize,
}

/// Extracts [`PageMetadata`] from an HTML document.
#[derive(Debug, Clone)]
pub struct MetadataParser {
    /// Cap on headings collected per level
    max_headings: usize,
}

impl Default for MetadataParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataParser {
    pub fn new() -> Self {
        Self { max_headings: 20 }
    }

    pub fn with_max_headings(mut self, max: usize) -> Self {
        self.max_headings = max;
        self
    }

    /// Parse `html`, resolving relative URLs against `base_url`.
    pub fn parse(&self, html: &str, base_url: &str) -> PageMetadata {
        let base = Url::parse(base_url).ok();
        let mut metadata = PageMetadata {
            url: base_url.to_string(),
            ..Default::default()
        };

        if base.is_none() || !looks_like_markup(html) {
            metadata.parse_error = true;
            return metadata;
        }

        let document = Html::parse_document(html);
        let resolve = |href: &str| -> Option<String> {
            let base = base.as_ref()?;
            base.join(href.trim()).ok().map(|u| u.to_string())
        };

        metadata.title = first_text(&document, "title");
        metadata.language = first_attr(&document, "html", "lang");
        metadata.canonical_url = first_attr(&document, "link[rel='canonical']", "href")
            .and_then(|href| resolve(&href));
        metadata.favicon = first_attr(
            &document,
            "link[rel='icon'], link[rel='shortcut icon'], link[rel='apple-touch-icon']",
            "href",
        )
        .and_then(|href| resolve(&href));

        for meta in select(&document, "meta") {
            let value = meta.value();
            let Some(content) = value.attr("content").map(clean_text) else {
                continue;
            };
            if content.is_empty() {
                continue;
            }
            let key = value
                .attr("property")
                .or_else(|| value.attr("name"))
                .map(|k| k.trim().to_ascii_lowercase());
            match key.as_deref() {
                Some("description") if metadata.description.is_none() => {
                    metadata.description = Some(content);
                }
                Some(k) if k.starts_with("og:") => {
                    metadata
                        .open_graph
                        .entry(k.trim_start_matches("og:").to_string())
                        .or_insert(content);
                }
                Some(k) if k.starts_with("twitter:") => {
                    metadata
                        .twitter_card
                        .entry(k.trim_start_matches("twitter:").to_string())
                        .or_insert(content);
                }
                _ => {}
            }
        }

        if metadata.title.is_none() {
            metadata.title = metadata.open_graph.get("title").cloned();
        }
        if metadata.description.is_none() {
            metadata.description = metadata.open_graph.get("description").cloned();
        }

        metadata.headings = Headings {
            h1: texts(&document, "h1", self.max_headings),
            h2: texts(&document, "h2", self.max_headings),
        };

        let host = base.as_ref().and_then(|b| b.host_str().map(str::to_string));
        for anchor in select(&document, "a[href]") {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let href = href.trim();
            if href.starts_with('#')
                || href.starts_with("javascript:")
                || href.starts_with("mailto:")
                || href.starts_with("tel:")
            {
                continue;
            }
            let Some(resolved) = base.as_ref().and_then(|b| b.join(href).ok()) else {
                continue;
            };
            if resolved.host_str().map(str::to_string) == host {
                metadata.links.internal += 1;
            } else {
                metadata.links.external += 1;
            }
        }

        metadata.image_count = select(&document, "img").count();
        metadata.word_count = select(&document, "body")
            .next()
            .map(|body| {
                body.text()
                    .filter(|t| !t.trim().is_empty())
                    .map(|t| t.split_whitespace().count())
                    .sum()
            })
            .unwrap_or(0);

        metadata
    }
}

/// Rejects empty bodies and binary payloads.
fn looks_like_markup(html: &str) -> bool {
    let trimmed = html.trim();
    !trimmed.is_empty() && !trimmed.contains('\0') && trimmed.contains('<')
}

fn select<'a>(document: &'a Html, selector: &str) -> impl Iterator<Item = ElementRef<'a>> + 'a {
    let parsed = Selector::parse(selector).ok();
    parsed
        .into_iter()
        .flat_map(move |sel| document.select(&sel).collect::<Vec<_>>())
}

fn first_text(document: &Html, selector: &str) -> Option<String> {
    select(document, selector)
        .map(|el| clean_text(&el.text().collect::<String>()))
        .find(|t| !t.is_empty())
}

fn first_attr(document: &Html, selector: &str, attr: &str) -> Option<String> {
    select(document, selector)
        .filter_map(|el| el.value().attr(attr).map(clean_text))
        .find(|v| !v.is_empty())
}

fn texts(document: &Html, selector: &str, limit: usize) -> Vec<String> {
    select(document, selector)
        .map(|el| clean_text(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty())
        .take(limit)
        .collect()
}

fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
  <title>  Example   Domain </title>
  <meta name="description" content="An example page">
  <meta property="og:title" content="OG Example">
  <meta property="og:image" content="https://example.com/og.png">
  <meta name="twitter:card" content="summary">
  <link rel="canonical" href="/canonical">
  <link rel="icon" href="/favicon.ico">
</head>
<body>
  <h1>Welcome</h1>
  <h2>First</h2><h2>Second</h2>
  <p>Some words in a paragraph.</p>
  <a href="/about">About</a>
  <a href="https://example.com/contact">Contact</a>
  <a href="https://other.org/">Other</a>
  <a href="mailto:hi@example.com">Mail</a>
  <a href="#top">Top</a>
  <img src="a.png"><img src="b.png">
</body>
</html>"##;

    #[test]
    fn extracts_core_metadata() {
        let meta = MetadataParser::new().parse(PAGE, "https://example.com/page");

        assert!(!meta.parse_error);
        assert_eq!(meta.title.as_deref(), Some("Example Domain"));
        assert_eq!(meta.description.as_deref(), Some("An example page"));
        assert_eq!(meta.language.as_deref(), Some("en"));
        assert_eq!(
            meta.canonical_url.as_deref(),
            Some("https://example.com/canonical")
        );
        assert_eq!(
            meta.favicon.as_deref(),
            Some("https://example.com/favicon.ico")
        );
        assert_eq!(meta.open_graph.get("title").map(String::as_str), Some("OG Example"));
        assert_eq!(meta.twitter_card.get("card").map(String::as_str), Some("summary"));
    }

    #[test]
    fn collects_headings_links_and_counts() {
        let meta = MetadataParser::new().parse(PAGE, "https://example.com/page");

        assert_eq!(meta.headings.h1, vec!["Welcome"]);
        assert_eq!(meta.headings.h2, vec!["First", "Second"]);
        assert_eq!(meta.links, LinkStats { internal: 2, external: 1 });
        assert_eq!(meta.image_count, 2);
        assert!(meta.word_count >= 10);
    }

    #[test]
    fn falls_back_to_open_graph_title() {
        let html = r#"<html><head><meta property="og:title" content="Only OG"></head><body></body></html>"#;
        let meta = MetadataParser::new().parse(html, "https://example.com");
        assert_eq!(meta.title.as_deref(), Some("Only OG"));
    }

    #[test]
    fn empty_or_binary_input_sets_parse_error() {
        let parser = MetadataParser::new();
        assert!(parser.parse("", "https://example.com").parse_error);
        assert!(parser.parse("   ", "https://example.com").parse_error);
        assert!(parser.parse("\0\0binary", "https://example.com").parse_error);
    }

    #[test]
    fn invalid_base_url_sets_parse_error() {
        let meta = MetadataParser::new().parse(PAGE, "not a url");
        assert!(meta.parse_error);
        assert_eq!(meta.url, "not a url");
    }

    #[test]
    fn broken_markup_still_yields_partial_result() {
        let html = "<html><head><title>Half open<body><h1>Heading";
        let meta = MetadataParser::new().parse(html, "https://example.com");
        assert!(!meta.parse_error);
        assert!(meta.title.is_some());
    }

    #[test]
    fn heading_limit_is_respected() {
        let html = format!("<html><body>{}</body></html>", "<h2>x</h2>".repeat(30));
        let meta = MetadataParser::new()
            .with_max_headings(5)
            .parse(&html, "https://example.com");
        assert_eq!(meta.headings.h2.len(), 5);
    }
}
