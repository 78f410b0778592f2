//! Transfer-encoding and charset helpers used by text normalization.
//!
//! Mail in the wild frequently lies about its encoding. Besides honest
//! quoted-printable decoding this module detects two legacy manglings by
//! content: quoted-printable that was never declared, and bodies that were
//! base64-wrapped a second time ("bork").

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8};
use once_cell::sync::Lazy;
use regex::bytes::Regex;

static QP_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"=[0-9A-F]{2}").expect("QP escape regex pattern is valid and should compile"));

static BASE64_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9+/]{16,}={0,2}$").expect("Base64 line regex pattern is valid and should compile")
});

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode quoted-printable. Malformed escapes are kept literally.
pub fn decode_quoted_printable(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        if b != b'=' {
            out.push(b);
            i += 1;
            continue;
        }

        // Soft line break, allowing trailing whitespace before the newline.
        let mut j = i + 1;
        while j < data.len() && (data[j] == b' ' || data[j] == b'\t') {
            j += 1;
        }
        if j < data.len() && data[j] == b'\n' {
            i = j + 1;
            continue;
        }
        if j + 1 < data.len() && data[j] == b'\r' && data[j + 1] == b'\n' {
            i = j + 2;
            continue;
        }
        if j == data.len() {
            break;
        }

        match (data.get(i + 1).copied().and_then(hex_value), data.get(i + 2).copied().and_then(hex_value)) {
            (Some(hi), Some(lo)) => {
                out.push(hi << 4 | lo);
                i += 3;
            }
            _ => {
                out.push(b'=');
                i += 1;
            }
        }
    }
    out
}

/// Undeclared quoted-printable: enough `=XX` escapes plus soft breaks (or an
/// escaped `=`) inside the first `window` bytes.
pub fn looks_like_legacy_qp(data: &[u8], window: usize, min_escapes: usize) -> bool {
    let sample = &data[..data.len().min(window)];
    let escapes = QP_ESCAPE.find_iter(sample).count();
    if escapes < min_escapes {
        return false;
    }
    let soft_breaks = memchr::memmem::find(sample, b"=\n").is_some() || memchr::memmem::find(sample, b"=\r\n").is_some();
    soft_breaks || memchr::memmem::find(sample, b"=3D").is_some()
}

fn is_textual(data: &[u8]) -> bool {
    if std::str::from_utf8(data).is_ok() {
        return !data.iter().any(|&b| b == 0);
    }
    !data
        .iter()
        .any(|&b| matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F))
}

/// Repair a body that was base64-encoded without being declared so.
///
/// At least `min_lines` leading base64-alphabet lines must appear within the
/// first `window` bytes, the whole body must decode, and the result must be
/// text. Returns the decoded bytes.
pub fn repair_bork(data: &[u8], window: usize, min_lines: usize) -> Option<Vec<u8>> {
    if min_lines == 0 {
        return None;
    }
    let sample = &data[..data.len().min(window)];
    let leading = sample
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .take_while(|line| BASE64_LINE.is_match(line))
        .count();
    if leading < min_lines {
        return None;
    }

    let compact: Vec<u8> = data.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
    let decoded = STANDARD.decode(&compact).ok()?;
    if decoded.is_empty() || !is_textual(&decoded) {
        return None;
    }
    Some(decoded)
}

fn is_utf8_label(label: &str) -> bool {
    Encoding::for_label(label.trim().as_bytes()) == Some(UTF_8)
}

/// Re-encode `data` as UTF-8.
///
/// `charset` is the declared label. Returns `None` when the bytes are already
/// UTF-8 (declared or not) and nothing needs to change.
pub fn to_utf8(data: &[u8], charset: Option<&str>) -> Option<Vec<u8>> {
    let valid_utf8 = std::str::from_utf8(data).is_ok();

    let encoding = match charset.map(str::trim).filter(|c| !c.is_empty()) {
        Some(label) if is_utf8_label(label) || label.eq_ignore_ascii_case("us-ascii") => {
            if valid_utf8 {
                return None;
            }
            // Declared UTF-8 but it is not; guess instead.
            guess_encoding(data)
        }
        Some(label) => match Encoding::for_label(label.as_bytes()) {
            Some(enc) => enc,
            None if valid_utf8 => return None,
            None => guess_encoding(data),
        },
        None if valid_utf8 => return None,
        None => guess_encoding(data),
    };

    let (decoded, _, had_errors) = encoding.decode(data);
    if had_errors {
        tracing::debug!(encoding = encoding.name(), "charset conversion replaced malformed sequences");
    }
    Some(decoded.into_owned().into_bytes())
}

fn guess_encoding(data: &[u8]) -> &'static Encoding {
    let mut detector = EncodingDetector::new();
    detector.feed(data, true);
    detector.guess(None, true)
}

/// Lossy decode for display strings (header values, file names).
pub fn safe_decode(data: &[u8], charset: Option<&str>) -> String {
    if data.is_empty() {
        return String::new();
    }
    match to_utf8(data, charset) {
        Some(converted) => String::from_utf8_lossy(&converted).into_owned(),
        None => String::from_utf8_lossy(data).into_owned(),
    }
}
