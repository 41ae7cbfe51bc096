use std::collections::HashSet;

use scraper::{node::Node, Html, Selector};
use url::Url;

use crate::url::normalize;

fn selector(s: &str) -> Option<Selector> {
    Selector::parse(s).ok()
}

/// Trimmed `<title>` text, or an empty string when the document has none.
pub fn extract_title(html: &str) -> String {
    let document = Html::parse_document(html);
    selector("title")
        .and_then(|s| document.select(&s).next())
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

/// Visible text with script/style/noscript content removed and whitespace
/// collapsed. Malformed markup degrades to whatever html5ever recovers;
/// this never fails.
pub fn extract_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut parts: Vec<&str> = Vec::new();
    for node in document.root_element().descendants() {
        if let Node::Text(text) = node.value() {
            let hidden = node.ancestors().any(|ancestor| match ancestor.value() {
                Node::Element(el) => matches!(el.name(), "script" | "style" | "noscript"),
                _ => false,
            });
            if !hidden {
                parts.push(&text.text);
            }
        }
    }
    parts
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// All anchor hrefs absolutized against `base` and normalized, deduplicated
/// in document order. Off-domain links are kept; callers decide what enters
/// the frontier.
pub fn extract_links(base: &Url, html: &str) -> Vec<Url> {
    let document = Html::parse_document(html);
    let Some(sel) = selector("a[href]") else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for el in document.select(&sel) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        if let Some(url) = normalize(base, href) {
            if seen.insert(url.clone()) {
                links.push(url);
            }
        }
    }
    links
}

/// The `<html lang>` attribute when present.
pub fn extract_language(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    selector("html")
        .and_then(|s| document.select(&s).next())
        .and_then(|el| el.value().attr("lang").map(|s| s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_is_trimmed_and_missing_title_is_empty() {
        let html = "<html><head><title>  Sample Page  </title></head><body></body></html>";
        assert_eq!(extract_title(html), "Sample Page");

        let html_no_title = "<html><head></head><body></body></html>";
        assert_eq!(extract_title(html_no_title), "");
    }

    #[test]
    fn text_strips_non_content_tags() {
        let html = "<html><head><script>var x=1;</script><style>.cls{}</style></head>\
                    <body><p>Hello</p><noscript>ignore</noscript></body></html>";
        assert_eq!(extract_text(html), "Hello");
    }

    #[test]
    fn text_collapses_whitespace() {
        let html = "<body><p>Hello\n\n   world</p>\t<span>again</span></body>";
        assert_eq!(extract_text(html), "Hello world again");
    }

    #[test]
    fn malformed_html_does_not_panic() {
        let html = "<html><body><div><p>unclosed<div><<<>>>&&&";
        assert!(extract_text(html).contains("unclosed"));
        assert_eq!(extract_title(html), "");
    }

    #[test]
    fn links_are_absolutized_and_deduplicated() {
        let base = Url::parse("https://example.com/base/").unwrap();
        let html = r#"<body>
            <a href="/about">About</a>
            <a href="/about">About again</a>
            <a href="../relative">Rel</a>
            <a href="https://other.com/x">Other</a>
            <a href="javascript:void(0)">JS</a>
            <a href="mailto:a@b.c">Mail</a>
        </body>"#;

        let links = extract_links(&base, html);
        let as_strings: Vec<&str> = links.iter().map(|u| u.as_str()).collect();
        assert_eq!(
            as_strings,
            vec![
                "https://example.com/about",
                "https://example.com/relative",
                "https://other.com/x",
            ]
        );
    }

    #[test]
    fn language_comes_from_the_html_element() {
        assert_eq!(
            extract_language(r#"<html lang="fa"><body></body></html>"#),
            Some("fa".to_string())
        );
        assert_eq!(extract_language("<html><body></body></html>"), None);
    }
}
