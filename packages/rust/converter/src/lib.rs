//! HTML-to-document conversion.
//!
//! Turns fetched [`ByteStream`]s into [`Document`]s. HTML is reduced to its main
//! content, converted to Markdown with `htmd`, and tidied by the cleanup passes;
//! plain-text output additionally strips the Markdown markup.
//!
//! Conversion never aborts a batch: a stream that is not HTML or cannot be
//! parsed yields a document with empty content and a `conversion_error`
//! metadata entry, and a warning is logged.

mod charset;
mod cleanup;

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;

use webrag_shared::{
    ByteStream, ConverterConfig, Document, Metadata, OutputFormat, RagError, Result,
};

/// Tags whose content never reaches the document.
const SKIPPED_TAGS: [&str; 6] = ["script", "style", "nav", "iframe", "noscript", "svg"];

/// Content containers tried in priority order before falling back to `<body>`.
const CONTENT_SELECTORS: [&str; 7] = [
    "article .markdown",
    ".vp-doc",
    ".markdown-section",
    "[role=\"main\"]",
    "article",
    "main",
    ".content",
];

// ---------------------------------------------------------------------------
// HtmlToDocument
// ---------------------------------------------------------------------------

/// Text extracted from one HTML page.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub text: String,
    pub title: Option<String>,
    pub word_count: usize,
}

/// Converter from fetched HTML streams to documents.
pub struct HtmlToDocument {
    format: OutputFormat,
}

impl HtmlToDocument {
    pub fn new(config: &ConverterConfig) -> Self {
        Self {
            format: config.format,
        }
    }

    /// Convert every stream, producing exactly one document per stream, in order.
    #[instrument(skip_all, fields(streams = streams.len(), format = ?self.format))]
    pub fn run(&self, streams: &[ByteStream]) -> Vec<Document> {
        streams
            .iter()
            .map(|stream| match self.convert_stream(stream) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(url = %stream.url, error = %e, "conversion failed, emitting empty document");
                    let mut meta = stream_meta(stream);
                    meta.insert("conversion_error".into(), Value::from(e.to_string()));
                    Document::new(String::new(), meta)
                }
            })
            .collect()
    }

    /// Convert a single stream, failing with [`RagError::Conversion`].
    pub fn convert_stream(&self, stream: &ByteStream) -> Result<Document> {
        if !stream.is_html() {
            return Err(RagError::Conversion(format!(
                "unsupported content type {}",
                stream.content_type.as_deref().unwrap_or("(unknown)")
            )));
        }

        let (html, encoding) = charset::decode_html(&stream.data, stream.charset.as_deref());

        let base_url = Url::parse(&stream.url).ok();
        let extracted = convert_html(&html, base_url.as_ref(), self.format)?;

        let mut meta = stream_meta(stream);
        meta.insert("charset".into(), Value::from(encoding.name()));
        if let Some(title) = &extracted.title {
            meta.insert("title".into(), Value::from(title.clone()));
        }
        meta.insert("word_count".into(), Value::from(extracted.word_count));

        Ok(Document::new(extracted.text, meta))
    }
}

fn stream_meta(stream: &ByteStream) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert("url".into(), Value::from(stream.url.clone()));
    meta.insert("fetched_at".into(), Value::from(stream.fetched_at.to_rfc3339()));
    meta.insert("content_hash".into(), Value::from(stream.content_hash.clone()));
    if let Some(ct) = &stream.content_type {
        meta.insert("content_type".into(), Value::from(ct.clone()));
    }
    meta
}

// ---------------------------------------------------------------------------
// HTML → text
// ---------------------------------------------------------------------------

/// Convert an HTML page to Markdown or plain text.
#[instrument(skip(html), fields(len = html.len()))]
pub fn convert_html(html: &str, base_url: Option<&Url>, format: OutputFormat) -> Result<Extracted> {
    let doc = Html::parse_document(html);
    let page_title = document_title(&doc);
    let content_html = main_content_html(&doc).unwrap_or_else(|| html.to_string());
    let content_html = tables_to_markdown(&content_html);

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(SKIPPED_TAGS.to_vec())
        .build();
    let raw = converter
        .convert(&content_html)
        .map_err(|e| RagError::Conversion(format!("htmd conversion failed: {e}")))?;

    let markdown = cleanup::tidy_markdown(&raw, base_url);
    let title = first_h1(&markdown).or(page_title);
    let word_count = count_words(&markdown);

    let text = match format {
        OutputFormat::Markdown => markdown,
        OutputFormat::Text => cleanup::markdown_to_text(&markdown),
    };

    debug!(?title, word_count, text_len = text.len(), "html converted");

    Ok(Extracted {
        text,
        title,
        word_count,
    })
}

/// Inner HTML of the first matching content container, else of `<body>`.
fn main_content_html(doc: &Html) -> Option<String> {
    CONTENT_SELECTORS
        .iter()
        .chain(std::iter::once(&"body"))
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|sel| doc.select(&sel).next().map(|el| el.inner_html()))
}

fn document_title(doc: &Html) -> Option<String> {
    let sel = Selector::parse("title").ok()?;
    doc.select(&sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Replace each `<table>` with a Markdown table; htmd leaves tables as raw text.
fn tables_to_markdown(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let Ok(table_sel) = Selector::parse("table") else {
        return html.to_string();
    };

    let mut result = html.to_string();
    for table in fragment.select(&table_sel) {
        let rendered = render_table(&table);
        result = result.replacen(&table.html(), &rendered, 1);
    }
    result
}

fn render_table(table: &ElementRef) -> String {
    let (Ok(tr), Ok(cell)) = (Selector::parse("tr"), Selector::parse("th, td")) else {
        return String::new();
    };

    let rows: Vec<Vec<String>> = table
        .select(&tr)
        .map(|row| {
            row.select(&cell)
                .map(|c| c.text().collect::<String>().trim().replace('|', "\\|"))
                .collect::<Vec<_>>()
        })
        .filter(|cells| !cells.is_empty())
        .collect();

    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    if width == 0 {
        return String::new();
    }

    let line = |cells: &[String]| {
        let mut padded = cells.to_vec();
        padded.resize(width, String::new());
        format!("| {} |\n", padded.join(" | "))
    };

    let mut md = String::from("\n\n");
    md.push_str(&line(&rows[0]));
    md.push_str(&line(&vec!["---".to_string(); width]));
    for row in &rows[1..] {
        md.push_str(&line(row));
    }
    md.push('\n');
    md
}

fn first_h1(md: &str) -> Option<String> {
    static H1_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^# (.+)$").expect("valid regex"));
    H1_RE.captures(md).map(|c| c[1].trim().to_string())
}

/// Count words outside fenced code blocks.
fn count_words(md: &str) -> usize {
    static CODE_BLOCK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("valid regex"));
    CODE_BLOCK_RE
        .replace_all(md, "")
        .split_whitespace()
        .filter(|w| w.chars().any(char::is_alphanumeric))
        .count()
}
