//! Post-conversion cleanup for document text.
//!
//! Each pass is a `&str -> String` function applied in order by [`tidy_markdown`].
//! [`markdown_to_text`] strips the remaining Markdown syntax for plain-text output.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use url::Url;

/// Run every Markdown cleanup pass.
pub(crate) fn tidy_markdown(md: &str, base_url: Option<&Url>) -> String {
    let md = demote_extra_h1(md);
    let md = strip_stray_tags(&md);
    let md = absolutize_links(&md, base_url);
    let md = trim_line_ends(&md);
    collapse_blank_lines(&md).trim().to_string()
}

/// Keep the first H1; later H1s become H2.
fn demote_extra_h1(md: &str) -> String {
    let mut seen_h1 = false;
    md.lines()
        .map(|line| match line.strip_prefix("# ") {
            Some(text) if seen_h1 => format!("## {text}"),
            Some(_) => {
                seen_h1 = true;
                line.to_string()
            }
            None => line.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remove layout tags htmd passes through, leaving their text. Code fences are untouched.
fn strip_stray_tags(md: &str) -> String {
    static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"</?(?:div|span|section|article|aside|header|footer|figure|figcaption|details|summary)(?:\s[^>]*)?>",
        )
        .expect("valid regex")
    });

    let mut in_fence = false;
    md.lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
            }
            if in_fence {
                line.to_string()
            } else {
                TAG_RE.replace_all(line, "").into_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Resolve relative link targets against the page URL. Images and anchors are kept.
fn absolutize_links(md: &str, base_url: Option<&Url>) -> String {
    static LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(!?)\[([^\]]*)\]\(([^)\s]+)\)").expect("valid regex"));

    let Some(base) = base_url else {
        return md.to_string();
    };

    LINK_RE
        .replace_all(md, |caps: &Captures| {
            let (bang, text, href) = (&caps[1], &caps[2], &caps[3]);
            let keep = !bang.is_empty()
                || href.starts_with('#')
                || href.starts_with("mailto:")
                || Url::parse(href).is_ok();
            if keep {
                return caps[0].to_string();
            }
            match base.join(href) {
                Ok(resolved) => format!("[{text}]({resolved})"),
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn trim_line_ends(md: &str) -> String {
    md.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

/// Runs of blank lines collapse to a single blank line.
fn collapse_blank_lines(md: &str) -> String {
    static BLANKS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));
    BLANKS_RE.replace_all(md, "\n\n").into_owned()
}

/// Strip Markdown markup, keeping the readable text.
pub(crate) fn markdown_to_text(md: &str) -> String {
    static HEADING_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s+").expect("valid regex"));
    static IMAGE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"!\[([^\]]*)\]\([^)]*\)").expect("valid regex"));
    static LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").expect("valid regex"));
    static EMPHASIS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(\*\*|__|\*|`)").expect("valid regex"));
    static UNDERSCORE_EM_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(^|[^\w])_([^_\n]+)_").expect("valid regex"));
    static FENCE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^```.*$\n?").expect("valid regex"));
    static BULLET_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^(\s*)[*+-]\s+").expect("valid regex"));

    let text = FENCE_RE.replace_all(md, "");
    let text = HEADING_RE.replace_all(&text, "");
    let text = IMAGE_RE.replace_all(&text, "$1");
    let text = LINK_RE.replace_all(&text, "$1");
    let text = BULLET_RE.replace_all(&text, "$1");
    let text = EMPHASIS_RE.replace_all(&text, "");
    let text = UNDERSCORE_EM_RE.replace_all(&text, "$1$2");
    collapse_blank_lines(&trim_line_ends(&text)).trim().to_string()
}
