//! Searchable-text sanitization: HTML stripped, whitespace collapsed,
//! highlight sentinels removed.

use regex::Regex;
use select::document::Document;
use select::node::Data;

use crate::search::{HIGHLIGHT_END, HIGHLIGHT_START};

/// Elements whose text content never belongs in the index.
const SKIPPED_ELEMENTS: [&str; 2] = ["script", "style"];

fn whitespace_regex() -> &'static Regex {
    static WHITESPACE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    WHITESPACE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

/// Flatten a possibly-HTML fragment into plain indexable text.
pub(crate) fn sanitize(input: &str) -> String {
    let stripped = strip_html(input);
    let without_markers: String = stripped
        .chars()
        .filter(|c| *c != HIGHLIGHT_START && *c != HIGHLIGHT_END)
        .collect();
    whitespace_regex()
        .replace_all(&without_markers, " ")
        .trim()
        .to_string()
}

fn strip_html(input: &str) -> String {
    if !input.contains('<') && !input.contains('&') {
        return input.to_string();
    }
    let document = Document::from(input);
    let mut out = String::with_capacity(input.len());
    for (index, raw) in document.nodes.iter().enumerate() {
        if let Data::Text(text) = &raw.data {
            let skipped = document
                .nth(index)
                .and_then(|node| node.parent())
                .and_then(|parent| parent.name().map(|n| SKIPPED_ELEMENTS.contains(&n)))
                .unwrap_or(false);
            if !skipped {
                out.push_str(text);
                out.push(' ');
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_unchanged() {
        assert_eq!(sanitize("hello world"), "hello world");
    }

    #[test]
    fn test_tags_stripped() {
        assert_eq!(
            sanitize("<p>hello <strong>bold</strong> world</p>"),
            "hello bold world"
        );
    }

    #[test]
    fn test_entities_decoded() {
        assert_eq!(sanitize("fish &amp; chips"), "fish & chips");
    }

    #[test]
    fn test_script_and_style_dropped() {
        let html = "<p>keep</p><script>var dropped = 1;</script><style>.x{}</style><p>this</p>";
        assert_eq!(sanitize(html), "keep this");
    }

    #[test]
    fn test_whitespace_collapsed() {
        assert_eq!(sanitize("a\n\n   b\tc  "), "a b c");
    }

    #[test]
    fn test_markers_removed() {
        let input = format!("a{}b{}c", HIGHLIGHT_START, HIGHLIGHT_END);
        assert_eq!(sanitize(&input), "abc");
    }
}
