//! HTML artifacts (status pages, saved dashboards) to Markdown.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;

use oncall_shared::{OncallError, Result};

/// Convert an HTML page to Markdown, keeping only the main content.
pub(crate) fn to_markdown(name: &str, html: &str) -> Result<String> {
    let content_html = extract_content_html(html);

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "nav", "iframe", "noscript", "svg", "footer"])
        .build();

    let markdown = converter
        .convert(&content_html)
        .map_err(|e| OncallError::extraction(name, format!("HTML conversion failed: {e}")))?;

    let cleaned = collapse_blank_lines(markdown.trim());
    debug!(artifact = name, len = cleaned.len(), "converted HTML artifact");
    Ok(cleaned)
}

/// Main content container, falling back to `<body>`, then the raw input.
fn extract_content_html(html: &str) -> String {
    let doc = Html::parse_document(html);

    for sel_str in ["main", "article", "[role=\"main\"]", ".content", "body"] {
        if let Ok(selector) = Selector::parse(sel_str) {
            if let Some(el) = doc.select(&selector).next() {
                return el.inner_html();
            }
        }
    }
    html.to_string()
}

fn collapse_blank_lines(md: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));
    MULTI_BLANK_RE.replace_all(md, "\n\n").into_owned()
}
