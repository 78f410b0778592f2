//! Content-type resolution.
//!
//! Combines the declared content type, the file-name extension and magic-byte
//! sniffing into one corrected classification. Precedence:
//!
//! 1. Structural XML evidence (a known namespace) wins outright.
//! 2. A non-generic declared type with no conflicting extension is kept.
//! 3. Otherwise the composite sniffer is consulted. A generic declared type is
//!    replaced by the sniffed type (or the extension type).
//! 4. When declared and extension types conflict, the sniffed type is preferred
//!    if it agrees with the extension, or if no converter handles the declared
//!    type.
//! 5. Otherwise the declared type stands.
//!
//! Resolution never fails and never blocks. Every decision is logged at `debug`.

use crate::core::mime::{self, OCTET_STREAM_MIME_TYPE, PLAIN_TEXT_MIME_TYPE};
use crate::core::sniff::{CompositeSniffer, structural_evidence};

/// Outcome of [`resolve`] with the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub content_type: String,
    pub reason: &'static str,
}

/// `true` when `specific` is a refinement of the broader `sniffed` family.
fn refines(specific: &str, sniffed: &str) -> bool {
    if specific == sniffed {
        return false;
    }
    match sniffed {
        PLAIN_TEXT_MIME_TYPE => mime::is_text(specific),
        "text/xml" | "application/xml" => specific.ends_with("+xml") || specific.ends_with("/xml"),
        "application/zip" => {
            specific.ends_with("+zip")
                || specific.starts_with("application/vnd.openxmlformats")
                || specific.starts_with("application/vnd.oasis.opendocument")
        }
        _ => false,
    }
}

/// Resolve a part's content type.
///
/// `has_converter` reports whether the dispatch table can handle a type; it is
/// only consulted when declared and extension types disagree.
pub fn resolve(
    prefix: &[u8],
    declared: &str,
    file_name: Option<&str>,
    sniffer: &CompositeSniffer,
    has_converter: impl Fn(&str) -> bool,
) -> Resolution {
    let declared = declared.trim().to_ascii_lowercase();
    let resolution = decide(prefix, &declared, file_name, sniffer, has_converter);

    tracing::debug!(
        declared = %declared,
        resolved = %resolution.content_type,
        file_name = file_name.unwrap_or(""),
        reason = resolution.reason,
        "content type resolved"
    );
    resolution
}

fn decide(
    prefix: &[u8],
    declared: &str,
    file_name: Option<&str>,
    sniffer: &CompositeSniffer,
    has_converter: impl Fn(&str) -> bool,
) -> Resolution {
    let pick = |content_type: &str, reason: &'static str| Resolution {
        content_type: content_type.to_string(),
        reason,
    };

    if let Some(evident) = structural_evidence(prefix) {
        return pick(evident, "structural evidence");
    }

    let generic = mime::is_generic(declared);
    let by_extension = file_name.and_then(mime::mime_from_file_name);
    let conflicting = by_extension.as_deref().is_some_and(|ext| ext != declared);

    if !generic && !conflicting {
        return pick(declared, "declared");
    }

    let sniffed = sniffer.sniff(prefix).ok();

    if generic {
        return match (sniffed.as_deref(), by_extension.as_deref()) {
            (Some(sniffed), Some(ext)) if refines(ext, sniffed) => pick(ext, "extension refines sniffed"),
            (Some(sniffed), _) => pick(sniffed, "sniffed (generic declared)"),
            (None, Some(ext)) => pick(ext, "extension (generic declared)"),
            (None, None) => pick(OCTET_STREAM_MIME_TYPE, "unknown"),
        };
    }

    // Declared and extension disagree.
    let ext = by_extension.as_deref().unwrap_or_default();
    match sniffed.as_deref() {
        Some(sniffed) if sniffed == ext || refines(ext, sniffed) => pick(ext, "sniffed agrees with extension"),
        Some(sniffed) if sniffed == declared || refines(declared, sniffed) => pick(declared, "sniffed agrees with declared"),
        Some(sniffed) if !has_converter(declared) => pick(sniffed, "sniffed (no converter for declared)"),
        _ => pick(declared, "declared (conflict unresolved)"),
    }
}
