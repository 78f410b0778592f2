//! Magic-byte sniffing.
//!
//! Three independent detectors are combined by [`CompositeSniffer`]:
//!
//! - [`TransportSniffer`]: the small, browser-style rule set (HTML tags, `%PDF`,
//!   image signatures, "is this plain text?").
//! - [`SignatureSniffer`]: the `infer` signature database.
//! - [`DeepSniffer`]: looks inside containers (OOXML/ODF zip entries, OLE
//!   compound files, RFC 5322 header blocks).
//!
//! In [`SniffMode::Longest`] every detector runs and the most specific (longest)
//! answer wins. In [`SniffMode::First`] the first successful detector wins.

use crate::core::mime::{
    DOCX_MIME_TYPE, EML_MIME_TYPE, EXCEL_BINARY_MIME_TYPE, EXCEL_MIME_TYPE, HTML_MIME_TYPE, LEGACY_POWERPOINT_MIME_TYPE,
    LEGACY_WORD_MIME_TYPE, MSG_MIME_TYPE, OCTET_STREAM_MIME_TYPE, PDF_MIME_TYPE, PLAIN_TEXT_MIME_TYPE,
    POWER_POINT_MIME_TYPE, SVG_MIME_TYPE, XML_DSIG_MIME_TYPE,
};
use crate::error::{MimepackError, Result};
use memchr::memmem;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Bytes of a body examined by the sniffers.
pub const SNIFF_WINDOW: usize = 64 * 1024;

/// How detector results are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SniffMode {
    /// Run every detector, keep the longest non-empty answer.
    #[default]
    Longest,
    /// Stop at the first detector that answers.
    First,
}

/// One magic-byte detector.
pub trait Sniffer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Content type of `prefix`, or an error when nothing matched.
    fn sniff(&self, prefix: &[u8]) -> Result<String>;
}

fn no_match(detector: &str) -> MimepackError {
    MimepackError::UnsupportedFormat(format!("{}: no signature matched", detector))
}

// ============================================================================
// Transport sniffer
// ============================================================================

pub struct TransportSniffer;

const HTML_PATTERNS: &[&[u8]] = &[
    b"<!DOCTYPE HTML",
    b"<HTML",
    b"<HEAD",
    b"<SCRIPT",
    b"<IFRAME",
    b"<H1",
    b"<DIV",
    b"<FONT",
    b"<TABLE",
    b"<A",
    b"<STYLE",
    b"<TITLE",
    b"<B",
    b"<BODY",
    b"<BR",
    b"<P",
    b"<!--",
];

const EXACT_SIGNATURES: &[(&[u8], &str)] = &[
    (b"%PDF-", PDF_MIME_TYPE),
    (b"%!PS-Adobe-", "application/postscript"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"\x89PNG\x0D\x0A\x1A\x0A", "image/png"),
    (b"\xFF\xD8\xFF", "image/jpeg"),
    (b"BM", "image/bmp"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1F\x8B\x08", "application/x-gzip"),
    (b"Rar!\x1A\x07", "application/x-rar-compressed"),
    (b"\xEF\xBB\xBF", PLAIN_TEXT_MIME_TYPE),
    (b"\xFE\xFF", PLAIN_TEXT_MIME_TYPE),
    (b"\xFF\xFE", PLAIN_TEXT_MIME_TYPE),
];

fn is_tag_terminator(b: u8) -> bool {
    b == b' ' || b == b'>'
}

fn is_binary_control(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}

impl Sniffer for TransportSniffer {
    fn name(&self) -> &'static str {
        "transport"
    }

    fn sniff(&self, prefix: &[u8]) -> Result<String> {
        if prefix.is_empty() {
            return Err(no_match(self.name()));
        }

        let start = prefix
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(prefix.len());
        let trimmed = &prefix[start..];

        for pattern in HTML_PATTERNS {
            if trimmed.len() > pattern.len()
                && trimmed[..pattern.len()].eq_ignore_ascii_case(pattern)
                && is_tag_terminator(trimmed[pattern.len()])
            {
                return Ok(HTML_MIME_TYPE.to_string());
            }
        }
        if trimmed.starts_with(b"<?xml") {
            return Ok("text/xml".to_string());
        }
        if prefix.len() >= 12 && &prefix[..4] == b"RIFF" && &prefix[8..12] == b"WEBP" {
            return Ok("image/webp".to_string());
        }
        for (signature, mime) in EXACT_SIGNATURES {
            if prefix.starts_with(signature) {
                return Ok(mime.to_string());
            }
        }

        if !prefix.iter().copied().any(is_binary_control) {
            return Ok(PLAIN_TEXT_MIME_TYPE.to_string());
        }
        Err(no_match(self.name()))
    }
}

// ============================================================================
// Signature sniffer
// ============================================================================

pub struct SignatureSniffer;

impl Sniffer for SignatureSniffer {
    fn name(&self) -> &'static str {
        "signature"
    }

    fn sniff(&self, prefix: &[u8]) -> Result<String> {
        match infer::get(prefix) {
            Some(kind) if kind.mime_type() != OCTET_STREAM_MIME_TYPE => Ok(kind.mime_type().to_string()),
            _ => Err(no_match(self.name())),
        }
    }
}

// ============================================================================
// Deep sniffer
// ============================================================================

pub struct DeepSniffer;

const OLE_SIGNATURE: &[u8] = b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1";

const MAIL_HEADERS: &[&str] = &[
    "from",
    "to",
    "cc",
    "bcc",
    "subject",
    "date",
    "received",
    "mime-version",
    "message-id",
    "return-path",
    "delivered-to",
    "reply-to",
    "sender",
    "content-type",
    "in-reply-to",
    "references",
];

const STRONG_MAIL_HEADERS: &[&str] = &[
    "from",
    "received",
    "mime-version",
    "message-id",
    "return-path",
    "delivered-to",
];

fn utf16le(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}

static OLE_MARKERS: Lazy<Vec<(Vec<u8>, &'static str)>> = Lazy::new(|| {
    vec![
        (utf16le("__substg1.0_"), MSG_MIME_TYPE),
        (utf16le("__properties_version1.0"), MSG_MIME_TYPE),
        (utf16le("WordDocument"), LEGACY_WORD_MIME_TYPE),
        (utf16le("Workbook"), EXCEL_BINARY_MIME_TYPE),
        (utf16le("PowerPoint Document"), LEGACY_POWERPOINT_MIME_TYPE),
    ]
});

impl DeepSniffer {
    fn sniff_zip(prefix: &[u8]) -> Option<String> {
        let mut offset = 0usize;
        let mut first = true;
        let mut has_content_types = false;

        while offset + 30 <= prefix.len() && &prefix[offset..offset + 4] == b"PK\x03\x04" {
            let header = &prefix[offset..];
            let method = u16::from_le_bytes([header[8], header[9]]);
            let compressed = u32::from_le_bytes([header[18], header[19], header[20], header[21]]) as usize;
            let name_len = u16::from_le_bytes([header[26], header[27]]) as usize;
            let extra_len = u16::from_le_bytes([header[28], header[29]]) as usize;
            let name_end = 30 + name_len;
            if header.len() < name_end {
                break;
            }
            let name = &header[30..name_end];

            if first && name == b"mimetype" && method == 0 {
                let data_start = name_end + extra_len;
                if let Some(data) = header.get(data_start..data_start + compressed) {
                    let declared = String::from_utf8_lossy(data).trim().to_ascii_lowercase();
                    if declared.contains('/') {
                        return Some(declared);
                    }
                }
            }
            first = false;

            if name == b"[Content_Types].xml" {
                has_content_types = true;
            }
            if name.starts_with(b"word/") {
                return Some(DOCX_MIME_TYPE.to_string());
            }
            if name.starts_with(b"xl/") {
                return Some(EXCEL_MIME_TYPE.to_string());
            }
            if name.starts_with(b"ppt/") {
                return Some(POWER_POINT_MIME_TYPE.to_string());
            }

            // Sizes live in a trailing data descriptor; the local headers cannot be walked further.
            let flags = u16::from_le_bytes([header[6], header[7]]);
            if flags & 0x0008 != 0 && compressed == 0 {
                break;
            }
            offset += name_end + extra_len + compressed;
        }

        if has_content_types {
            return Some("application/vnd.openxmlformats-officedocument".to_string());
        }
        None
    }

    fn sniff_ole(prefix: &[u8]) -> Option<String> {
        OLE_MARKERS
            .iter()
            .find(|(marker, _)| memmem::find(prefix, marker).is_some())
            .map(|(_, mime)| mime.to_string())
    }

    fn looks_like_mail(prefix: &[u8]) -> bool {
        let text = String::from_utf8_lossy(&prefix[..prefix.len().min(16 * 1024)]);
        let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l)).peekable();

        if lines.peek().is_some_and(|l| l.starts_with("From ")) {
            lines.next();
        }

        let mut known = 0usize;
        let mut strong = false;
        for (idx, line) in lines.enumerate() {
            if line.is_empty() {
                break;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                continue;
            }
            let Some((name, _)) = line.split_once(':') else {
                return false;
            };
            let name = name.trim();
            if name.is_empty() || name.contains(char::is_whitespace) {
                return idx > 0 && known >= 2 && strong;
            }
            let lower = name.to_ascii_lowercase();
            if MAIL_HEADERS.contains(&lower.as_str()) {
                known += 1;
                strong |= STRONG_MAIL_HEADERS.contains(&lower.as_str());
            }
        }
        known >= 2 && strong
    }
}

impl Sniffer for DeepSniffer {
    fn name(&self) -> &'static str {
        "deep"
    }

    fn sniff(&self, prefix: &[u8]) -> Result<String> {
        if prefix.starts_with(b"PK\x03\x04") {
            return Self::sniff_zip(prefix).ok_or_else(|| no_match(self.name()));
        }
        if prefix.starts_with(OLE_SIGNATURE) {
            return Self::sniff_ole(prefix).ok_or_else(|| no_match(self.name()));
        }
        if Self::looks_like_mail(prefix) {
            return Ok(EML_MIME_TYPE.to_string());
        }
        Err(no_match(self.name()))
    }
}

// ============================================================================
// Composite
// ============================================================================

pub struct CompositeSniffer {
    sniffers: Vec<Box<dyn Sniffer>>,
    mode: SniffMode,
}

impl CompositeSniffer {
    pub fn new(sniffers: Vec<Box<dyn Sniffer>>, mode: SniffMode) -> Self {
        Self { sniffers, mode }
    }

    /// Transport, signature and deep detectors in that order.
    pub fn standard(mode: SniffMode) -> Self {
        Self::new(
            vec![Box::new(TransportSniffer), Box::new(SignatureSniffer), Box::new(DeepSniffer)],
            mode,
        )
    }

    pub fn mode(&self) -> SniffMode {
        self.mode
    }

    /// Best content type for `prefix`; the last detector error when none answered.
    pub fn sniff(&self, prefix: &[u8]) -> Result<String> {
        let mut best: Option<String> = None;
        let mut last_error = None;

        for sniffer in &self.sniffers {
            match sniffer.sniff(prefix) {
                Ok(found) if !found.is_empty() => {
                    tracing::trace!(detector = sniffer.name(), found = %found, "sniffer matched");
                    if self.mode == SniffMode::First {
                        return Ok(found);
                    }
                    if best.as_ref().is_none_or(|b| found.len() > b.len()) {
                        best = Some(found);
                    }
                }
                Ok(_) => last_error = Some(no_match(sniffer.name())),
                Err(e) => last_error = Some(e),
            }
        }

        best.ok_or_else(|| last_error.unwrap_or_else(|| no_match("composite")))
    }
}

static LONGEST: Lazy<CompositeSniffer> = Lazy::new(|| CompositeSniffer::standard(SniffMode::Longest));
static FIRST: Lazy<CompositeSniffer> = Lazy::new(|| CompositeSniffer::standard(SniffMode::First));

/// Shared standard sniffer for `mode`.
pub fn standard_sniffer(mode: SniffMode) -> &'static CompositeSniffer {
    match mode {
        SniffMode::Longest => &LONGEST,
        SniffMode::First => &FIRST,
    }
}

/// `true` when `prefix` opens with a header block typical of a mail message.
pub fn looks_like_mail(prefix: &[u8]) -> bool {
    DeepSniffer::looks_like_mail(prefix)
}

/// `true` when the first line of `prefix` (after an mbox `From ` line) is a
/// well-formed `Name: value` header field.
pub fn starts_with_header_field(prefix: &[u8]) -> bool {
    let window = &prefix[..prefix.len().min(4096)];
    let mut lines = window.split(|b| *b == b'\n');
    let mut first = lines.next().unwrap_or_default();
    if first.starts_with(b"From ") {
        first = lines.next().unwrap_or_default();
    }
    let Some(colon) = first.iter().position(|b| *b == b':') else {
        return false;
    };
    let name = &first[..colon];
    !name.is_empty() && name.iter().all(|b| b.is_ascii_graphic())
}

/// Strong structural evidence: an XML document whose namespace identifies it.
pub fn structural_evidence(prefix: &[u8]) -> Option<&'static str> {
    let window = &prefix[..prefix.len().min(4096)];
    let start = window.iter().position(|b| !b.is_ascii_whitespace())?;
    let body = window[start..].strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&window[start..]);
    if !body.starts_with(b"<") {
        return None;
    }

    if memmem::find(body, b"http://www.w3.org/2000/09/xmldsig#").is_some() {
        return Some(XML_DSIG_MIME_TYPE);
    }
    if memmem::find(body, b"http://www.w3.org/1999/xhtml").is_some() {
        return Some(HTML_MIME_TYPE);
    }
    if memmem::find(body, b"http://www.w3.org/2000/svg").is_some() {
        return Some(SVG_MIME_TYPE);
    }
    None
}
