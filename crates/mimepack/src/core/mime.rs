//! MIME type constants, extension lookup and family predicates.
//!
//! The extension table mirrors the formats the default converters understand;
//! anything missing falls back to `mime_guess`.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::Path;

pub const HTML_MIME_TYPE: &str = "text/html";
pub const XHTML_MIME_TYPE: &str = "application/xhtml+xml";
pub const PDF_MIME_TYPE: &str = "application/pdf";
pub const PLAIN_TEXT_MIME_TYPE: &str = "text/plain";
pub const OCTET_STREAM_MIME_TYPE: &str = "application/octet-stream";
pub const POWER_POINT_MIME_TYPE: &str = "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const DOCX_MIME_TYPE: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const EXCEL_MIME_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const LEGACY_WORD_MIME_TYPE: &str = "application/msword";
pub const LEGACY_POWERPOINT_MIME_TYPE: &str = "application/vnd.ms-powerpoint";
pub const EXCEL_BINARY_MIME_TYPE: &str = "application/vnd.ms-excel";
pub const OPENDOC_TEXT_MIME_TYPE: &str = "application/vnd.oasis.opendocument.text";
pub const OPENDOC_SPREADSHEET_MIME_TYPE: &str = "application/vnd.oasis.opendocument.spreadsheet";
pub const OPENDOC_PRESENTATION_MIME_TYPE: &str = "application/vnd.oasis.opendocument.presentation";
pub const RTF_MIME_TYPE: &str = "application/rtf";

pub const EML_MIME_TYPE: &str = "message/rfc822";
pub const MSG_MIME_TYPE: &str = "application/vnd.ms-outlook";
pub const XML_MIME_TYPE: &str = "application/xml";
pub const XML_TEXT_MIME_TYPE: &str = "text/xml";
pub const XML_DSIG_MIME_TYPE: &str = "application/xml-dsig";
pub const SVG_MIME_TYPE: &str = "image/svg+xml";

pub const ZIP_MIME_TYPE: &str = "application/zip";
pub const TAR_MIME_TYPE: &str = "application/x-tar";
pub const GZIP_MIME_TYPE: &str = "application/gzip";
pub const RAR_MIME_TYPE: &str = "application/vnd.rar";
pub const SEVEN_Z_MIME_TYPE: &str = "application/x-7z-compressed";

/// Extension to MIME type mapping.
static EXT_TO_MIME: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();

    m.insert("txt", PLAIN_TEXT_MIME_TYPE);
    m.insert("text", PLAIN_TEXT_MIME_TYPE);
    m.insert("log", PLAIN_TEXT_MIME_TYPE);
    m.insert("csv", "text/csv");
    m.insert("md", "text/markdown");

    m.insert("pdf", PDF_MIME_TYPE);

    m.insert("html", HTML_MIME_TYPE);
    m.insert("htm", HTML_MIME_TYPE);
    m.insert("xhtml", XHTML_MIME_TYPE);

    m.insert("xlsx", EXCEL_MIME_TYPE);
    m.insert("xls", EXCEL_BINARY_MIME_TYPE);
    m.insert("xlsm", "application/vnd.ms-excel.sheet.macroEnabled.12");
    m.insert("ods", OPENDOC_SPREADSHEET_MIME_TYPE);

    m.insert("pptx", POWER_POINT_MIME_TYPE);
    m.insert("ppt", LEGACY_POWERPOINT_MIME_TYPE);
    m.insert("odp", OPENDOC_PRESENTATION_MIME_TYPE);

    m.insert("docx", DOCX_MIME_TYPE);
    m.insert("doc", LEGACY_WORD_MIME_TYPE);
    m.insert("odt", OPENDOC_TEXT_MIME_TYPE);
    m.insert("rtf", RTF_MIME_TYPE);

    m.insert("bmp", "image/bmp");
    m.insert("gif", "image/gif");
    m.insert("jpg", "image/jpeg");
    m.insert("jpeg", "image/jpeg");
    m.insert("png", "image/png");
    m.insert("tiff", "image/tiff");
    m.insert("tif", "image/tiff");
    m.insert("webp", "image/webp");
    m.insert("svg", SVG_MIME_TYPE);

    m.insert("xml", XML_MIME_TYPE);

    m.insert("eml", EML_MIME_TYPE);
    m.insert("msg", MSG_MIME_TYPE);

    m.insert("zip", ZIP_MIME_TYPE);
    m.insert("tar", TAR_MIME_TYPE);
    m.insert("gz", GZIP_MIME_TYPE);
    m.insert("tgz", GZIP_MIME_TYPE);
    m.insert("rar", RAR_MIME_TYPE);
    m.insert("7z", SEVEN_Z_MIME_TYPE);

    m.insert("p7s", "application/pkcs7-signature");
    m.insert("asc", "application/pgp-signature");

    m
});

/// Preferred file extension for a MIME type (without the dot).
static MIME_TO_EXT: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(PLAIN_TEXT_MIME_TYPE, "txt");
    m.insert(HTML_MIME_TYPE, "html");
    m.insert(PDF_MIME_TYPE, "pdf");
    m.insert(EML_MIME_TYPE, "eml");
    m.insert(MSG_MIME_TYPE, "msg");
    m.insert("image/jpeg", "jpg");
    m.insert("image/png", "png");
    m.insert("image/gif", "gif");
    m.insert("image/tiff", "tiff");
    m.insert(DOCX_MIME_TYPE, "docx");
    m.insert(EXCEL_MIME_TYPE, "xlsx");
    m.insert(POWER_POINT_MIME_TYPE, "pptx");
    m.insert(LEGACY_WORD_MIME_TYPE, "doc");
    m.insert(EXCEL_BINARY_MIME_TYPE, "xls");
    m.insert(LEGACY_POWERPOINT_MIME_TYPE, "ppt");
    m.insert(ZIP_MIME_TYPE, "zip");
    m.insert(GZIP_MIME_TYPE, "gz");
    m.insert(TAR_MIME_TYPE, "tar");
    m.insert(OCTET_STREAM_MIME_TYPE, "bin");
    m
});

/// MIME type implied by a file name's extension, if any.
pub fn mime_from_file_name(file_name: &str) -> Option<String> {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_ascii_lowercase())?;

    if let Some(mime_type) = EXT_TO_MIME.get(extension.as_str()) {
        return Some(mime_type.to_string());
    }

    mime_guess::from_ext(&extension).first().map(|m| m.essence_str().to_string())
}

/// File extension for a MIME type, falling back to `bin`.
pub fn extension_for(mime_type: &str) -> &'static str {
    if let Some(ext) = MIME_TO_EXT.get(mime_type) {
        return ext;
    }
    mime_guess::get_mime_extensions_str(mime_type)
        .and_then(|exts| exts.first().copied())
        .unwrap_or("bin")
}

/// Declared types that carry no real information.
pub fn is_generic(mime_type: &str) -> bool {
    matches!(
        mime_type.trim(),
        "" | OCTET_STREAM_MIME_TYPE
            | "application/unknown"
            | "application/binary"
            | "application/x-unknown"
            | "application/force-download"
            | "binary/octet-stream"
            | "unknown/unknown"
    )
}

pub fn is_text(mime_type: &str) -> bool {
    mime_type.starts_with("text/")
}

pub fn is_html(mime_type: &str) -> bool {
    mime_type == HTML_MIME_TYPE || mime_type == XHTML_MIME_TYPE
}

pub fn is_image(mime_type: &str) -> bool {
    mime_type.starts_with("image/")
}

pub fn is_mail(mime_type: &str) -> bool {
    mime_type == EML_MIME_TYPE || mime_type == "message/global"
}

/// Containers that the expansion stage opens in-process or via the external unpacker.
pub fn is_archive(mime_type: &str) -> bool {
    matches!(
        mime_type,
        ZIP_MIME_TYPE
            | "application/x-zip-compressed"
            | TAR_MIME_TYPE
            | "application/tar"
            | "application/x-gtar"
            | "application/x-ustar"
            | GZIP_MIME_TYPE
            | "application/x-gzip"
            | RAR_MIME_TYPE
            | "application/x-rar-compressed"
            | SEVEN_Z_MIME_TYPE
    )
}

pub fn is_container(mime_type: &str) -> bool {
    is_archive(mime_type) || mime_type == MSG_MIME_TYPE
}

/// Detached signatures with nothing to render.
pub fn is_signature(mime_type: &str) -> bool {
    matches!(
        mime_type,
        "application/pkcs7-signature"
            | "application/x-pkcs7-signature"
            | "application/pgp-signature"
            | XML_DSIG_MIME_TYPE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_from_file_name_office() {
        let test_cases = vec![
            ("test.xlsx", EXCEL_MIME_TYPE),
            ("test.xls", EXCEL_BINARY_MIME_TYPE),
            ("test.pptx", POWER_POINT_MIME_TYPE),
            ("test.ppt", LEGACY_POWERPOINT_MIME_TYPE),
            ("test.docx", DOCX_MIME_TYPE),
            ("test.doc", LEGACY_WORD_MIME_TYPE),
        ];

        for (filename, expected_mime) in test_cases {
            assert_eq!(
                mime_from_file_name(filename).as_deref(),
                Some(expected_mime),
                "Failed for {}",
                filename
            );
        }
    }

    #[test]
    fn test_mime_from_file_name_case_insensitive() {
        assert_eq!(mime_from_file_name("REPORT.PDF").as_deref(), Some(PDF_MIME_TYPE));
        assert_eq!(mime_from_file_name("a.Eml").as_deref(), Some(EML_MIME_TYPE));
    }

    #[test]
    fn test_mime_from_file_name_fallback_and_none() {
        assert_eq!(mime_from_file_name("clip.mp4").as_deref(), Some("video/mp4"));
        assert!(mime_from_file_name("README").is_none());
        assert!(mime_from_file_name("archive.zzzzunknown").is_none());
    }

    #[test]
    fn test_extension_for() {
        assert_eq!(extension_for("application/pdf"), "pdf");
        assert_eq!(extension_for("image/jpeg"), "jpg");
        assert_eq!(extension_for("application/x-never-heard-of-it"), "bin");
    }

    #[test]
    fn test_family_predicates() {
        assert!(is_generic(""));
        assert!(is_generic("application/octet-stream"));
        assert!(!is_generic("application/pdf"));
        assert!(is_archive("application/zip"));
        assert!(is_container(MSG_MIME_TYPE));
        assert!(!is_container(EML_MIME_TYPE));
        assert!(is_signature("application/pkcs7-signature"));
        assert!(is_html("text/html"));
        assert!(is_mail("message/rfc822"));
    }
}
