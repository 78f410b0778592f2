//! Shared fixtures for the integration tests.
//!
//! The mock converter stands in for LibreOffice so the pipeline can be
//! exercised without external tools.

#![allow(dead_code)]

use async_trait::async_trait;
use mimepack::plugins::SourceReader;
use mimepack::{Converter, ConverterRegistry, MimepackError, Plugin, Result, Route};
use parking_lot::Mutex;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// Install a test-writer subscriber honouring `RUST_LOG`; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Prefix the mock writes in front of every converted source.
pub const CONVERTED_MARKER: &[u8] = b"%PDF-mock\n";

/// Converter writing `CONVERTED_MARKER` followed by the source bytes.
///
/// Sources containing `FAIL` are rejected. Every call is recorded.
pub struct MockConverter {
    name: &'static str,
    delay: Duration,
    cacheable: bool,
    calls: AtomicUsize,
    seen: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockConverter {
    pub fn new() -> Self {
        Self {
            name: "mock",
            delay: Duration::ZERO,
            cacheable: false,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Content types and bytes of every source seen so far.
    pub fn seen(&self) -> Vec<(String, Vec<u8>)> {
        self.seen.lock().clone()
    }
}

impl Plugin for MockConverter {
    fn name(&self) -> &str {
        self.name
    }
}

#[async_trait]
impl Converter for MockConverter {
    async fn convert(
        &self,
        cancel: &CancellationToken,
        dest: &Path,
        mut source: SourceReader,
        content_type: &str,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut data = Vec::new();
        source.read_to_end(&mut data).await?;
        self.seen.lock().push((content_type.to_string(), data.clone()));

        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(MimepackError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        if data.windows(4).any(|w| w == b"FAIL") {
            return Err(MimepackError::conversion(self.name, "source rejected"));
        }

        let mut output = CONVERTED_MARKER.to_vec();
        output.extend_from_slice(&data);
        tokio::fs::write(dest, output).await?;
        Ok(())
    }

    fn cacheable(&self) -> bool {
        self.cacheable
    }
}

/// Routes for mail, zip archives, text, HTML and PDF, all converted by `mock`.
pub fn mock_registry(mock: Arc<MockConverter>) -> ConverterRegistry {
    let mut registry = ConverterRegistry::new();
    registry.route_exact("message/rfc822", Route::Recurse);
    registry.route_exact("application/zip", Route::Recurse);
    registry.route_exact("application/pkcs7-signature", Route::Skip);
    registry
        .register_converter(mock, &["application/pdf", "text/*", "image/*"])
        .expect("mock registration should succeed");
    registry
}

/// A ZIP archive holding `entries` in order.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut zip = ZipWriter::new(&mut cursor);
        let options = SimpleFileOptions::default();
        for (name, data) in entries {
            zip.start_file(*name, options).expect("zip entry should start");
            zip.write_all(data).expect("zip entry should be written");
        }
        zip.finish().expect("zip should finish");
    }
    cursor.into_inner()
}

/// Member names of the ZIP at `path`, in stored order.
pub fn zip_member_names(path: &Path) -> Vec<String> {
    let file = std::fs::File::open(path).expect("zip should open");
    let mut archive = zip::ZipArchive::new(file).expect("zip should parse");
    (0..archive.len())
        .map(|i| archive.by_index(i).expect("member should open").name().to_string())
        .collect()
}

pub fn zip_member(path: &Path, name: &str) -> Vec<u8> {
    let file = std::fs::File::open(path).expect("zip should open");
    let mut archive = zip::ZipArchive::new(file).expect("zip should parse");
    let mut member = archive.by_name(name).expect("member should exist");
    let mut data = Vec::new();
    member.read_to_end(&mut data).expect("member should read");
    data
}

/// One MIME attachment section for [`multipart_message`].
pub struct Attachment<'a> {
    pub content_type: &'a str,
    pub file_name: Option<&'a str>,
    pub extra_headers: Vec<(&'a str, String)>,
    pub body: &'a [u8],
}

impl<'a> Attachment<'a> {
    pub fn new(content_type: &'a str, file_name: Option<&'a str>, body: &'a [u8]) -> Self {
        Self {
            content_type,
            file_name,
            extra_headers: Vec::new(),
            body,
        }
    }

    pub fn header(mut self, name: &'a str, value: impl Into<String>) -> Self {
        self.extra_headers.push((name, value.into()));
        self
    }
}

/// A multipart message of `subtype` with `sections`, bodies base64 encoded.
pub fn multipart_message(subtype: &str, subject: &str, sections: &[Attachment<'_>]) -> Vec<u8> {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    let boundary = "----=_mimepack_test_boundary";
    let mut out = format!(
        "From: sender@example.com\r\nTo: recipient@example.com\r\nSubject: {}\r\nDate: Mon, 1 Jan 2024 12:00:00 +0000\r\nMIME-Version: 1.0\r\nContent-Type: multipart/{}; boundary=\"{}\"\r\n\r\n",
        subject, subtype, boundary
    );
    for section in sections {
        out.push_str(&format!("--{}\r\nContent-Type: {}", boundary, section.content_type));
        if let Some(name) = section.file_name {
            out.push_str(&format!("; name=\"{}\"\r\nContent-Disposition: attachment; filename=\"{}\"", name, name));
        }
        out.push_str("\r\n");
        for (name, value) in &section.extra_headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str("Content-Transfer-Encoding: base64\r\n\r\n");
        let encoded = STANDARD.encode(section.body);
        for line in encoded.as_bytes().chunks(76) {
            out.push_str(std::str::from_utf8(line).expect("base64 is ascii"));
            out.push_str("\r\n");
        }
    }
    out.push_str(&format!("--{}--\r\n", boundary));
    out.into_bytes()
}
