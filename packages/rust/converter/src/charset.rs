//! Character-set detection for fetched HTML bodies.
//!
//! Precedence: byte-order mark, then the `Content-Type` charset parameter,
//! then a `<meta>` declaration in the first KiB, then UTF-8 if the body is
//! valid UTF-8, else windows-1252.

use std::borrow::Cow;
use std::sync::LazyLock;

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use regex::Regex;

/// Bytes scanned for a `<meta charset>` declaration.
const META_PRESCAN_BYTES: usize = 1024;

/// Decode an HTML body to text, returning the encoding that was used.
///
/// Undecodable sequences become U+FFFD rather than failing.
pub(crate) fn decode_html<'a>(
    data: &'a [u8],
    declared: Option<&str>,
) -> (Cow<'a, str>, &'static Encoding) {
    let encoding = detect(data, declared);
    // `decode` strips a BOM and lets it override `encoding`.
    let (text, used, _had_errors) = encoding.decode(data);
    (text, used)
}

fn detect(data: &[u8], declared: Option<&str>) -> &'static Encoding {
    if let Some((encoding, _)) = Encoding::for_bom(data) {
        return encoding;
    }
    if let Some(encoding) = declared.and_then(|label| Encoding::for_label(label.trim().as_bytes())) {
        return encoding;
    }
    if let Some(encoding) = meta_charset(data) {
        return encoding;
    }
    if std::str::from_utf8(data).is_ok() {
        UTF_8
    } else {
        WINDOWS_1252
    }
}

/// Charset from `<meta charset=..>` or `<meta http-equiv content="..; charset=..">`.
fn meta_charset(data: &[u8]) -> Option<&'static Encoding> {
    static META_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"(?i)<meta[^>]*?charset\s*=\s*["']?\s*([a-z0-9_:.\-]+)"#)
            .expect("valid regex")
    });

    let head = String::from_utf8_lossy(&data[..data.len().min(META_PRESCAN_BYTES)]);
    let label = META_RE.captures(&head)?.get(1)?.as_str().to_string();
    let encoding = Encoding::for_label(label.as_bytes())?;
    // A UTF-16 meta label cannot describe an ASCII-compatible prescan.
    if encoding == encoding_rs::UTF_16LE || encoding == encoding_rs::UTF_16BE {
        Some(UTF_8)
    } else {
        Some(encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_passes_through() {
        let (text, enc) = decode_html("<p>Café</p>".as_bytes(), None);
        assert_eq!(text, "<p>Café</p>");
        assert_eq!(enc, UTF_8);
    }

    #[test]
    fn header_charset_is_honoured() {
        let (text, enc) = decode_html(b"<p>Caf\xe9</p>", Some("ISO-8859-1"));
        assert_eq!(text, "<p>Café</p>");
        assert_eq!(enc, WINDOWS_1252);
    }

    #[test]
    fn meta_charset_is_honoured() {
        let body = b"<html><head><meta charset=\"iso-8859-15\"></head><body>\xa4 5</body></html>";
        let (text, enc) = decode_html(body, None);
        assert_eq!(enc, encoding_rs::ISO_8859_15);
        assert!(text.contains("€ 5"));
    }

    #[test]
    fn http_equiv_meta_is_honoured() {
        let body = b"<meta http-equiv=\"Content-Type\" content=\"text/html; charset=windows-1252\"><p>\x93quoted\x94</p>";
        let (text, _) = decode_html(body, None);
        assert!(text.contains("\u{201c}quoted\u{201d}"));
    }

    #[test]
    fn undeclared_non_utf8_falls_back_to_windows_1252() {
        let (text, enc) = decode_html(b"<p>Caf\xe9 menu</p>", None);
        assert_eq!(text, "<p>Café menu</p>");
        assert_eq!(enc, WINDOWS_1252);
    }

    #[test]
    fn bom_wins_over_declaration() {
        let (text, enc) = decode_html(b"\xef\xbb\xbf<p>ok</p>", Some("iso-8859-1"));
        assert_eq!(text, "<p>ok</p>");
        assert_eq!(enc, UTF_8);
    }

    #[test]
    fn unknown_label_is_ignored() {
        let (text, enc) = decode_html(b"<p>plain</p>", Some("x-made-up"));
        assert_eq!(text, "<p>plain</p>");
        assert_eq!(enc, UTF_8);
    }
}
