//! Main conversion entry points.
//!
//! # Functions
//!
//! - [`convert_document`] - Decompose and convert a document, keeping the items
//! - [`convert_file`] - Same, reading the document from disk
//! - [`convert_to_zip`] - Convert and package everything into one ZIP
//! - [`convert_to_pdf`] - Convert and merge every PDF into one document
//!
//! Every call gets its own [`ConversionSession`]: a scratch directory, an
//! error collector and the cancellation token. Converted items live in that
//! scratch directory, so they are only valid while the [`ConvertedDocument`]
//! that owns the session is alive.

use crate::assembly;
use crate::core::config::ConversionConfig;
use crate::core::io::read_input_file;
use crate::core::mime::{self, OCTET_STREAM_MIME_TYPE};
use crate::core::orchestrator;
use crate::core::session::ConversionSession;
use crate::extraction::email::WalkInput;
use crate::plugins::ConverterRegistry;
use crate::types::{ArtifactItem, AssemblyReport, ConversionOutcome, MediaType};
use crate::{MimepackError, Result};
use once_cell::sync::Lazy;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runtime behind the `_sync` wrappers.
static GLOBAL_RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create global Tokio runtime - system may be out of resources")
});

/// Items of one conversion call together with the session that owns their files.
#[derive(Debug)]
pub struct ConvertedDocument {
    outcome: ConversionOutcome,
    session: Arc<ConversionSession>,
}

impl ConvertedDocument {
    pub fn items(&self) -> &[ArtifactItem] {
        &self.outcome.items
    }

    /// Aggregate of the non-fatal errors, if any.
    pub fn error(&self) -> Option<&MimepackError> {
        self.outcome.error.as_ref()
    }

    pub fn outcome(&self) -> &ConversionOutcome {
        &self.outcome
    }

    pub fn session(&self) -> &ConversionSession {
        &self.session
    }

    /// Package the items into a ZIP at `dest`.
    pub async fn write_zip(self, dest: &Path) -> Result<AssemblyReport> {
        let continue_on_error = self.session.config().continue_on_error;
        let ConvertedDocument { outcome, session } = self;
        let report = assembly::assemble_to_path(dest, outcome.items, outcome.error, continue_on_error).await?;
        drop(session);
        Ok(report)
    }

    /// Merge the converted PDFs into one document at `dest`.
    pub async fn write_pdf(self, dest: &Path) -> Result<PdfReport> {
        let session = &self.session;
        let config = session.config();
        let documents = assembly::merge_pdfs(
            &self.outcome.items,
            dest,
            session.work_dir(),
            &config.merge_command,
            config.timeout_secs,
            session.cancel_token(),
        )
        .await?;

        let failed: Vec<String> = self.outcome.failures().map(|item| item.name()).collect();
        Ok(PdfReport {
            documents,
            failed,
            error: self.outcome.error,
        })
    }
}

/// Result of [`convert_to_pdf`].
#[derive(Debug)]
pub struct PdfReport {
    /// Documents merged into the output.
    pub documents: usize,
    /// Archive names of leaves that could not be converted.
    pub failed: Vec<String>,
    /// Aggregate of the non-fatal errors, if any.
    pub error: Option<MimepackError>,
}

fn walk_input(data: &[u8], content_type: &str, file_name: Option<&str>, session: &ConversionSession) -> Result<WalkInput> {
    if data.is_empty() {
        return Err(MimepackError::validation("Input is empty"));
    }
    Ok(WalkInput {
        body: session.body(data.to_vec())?,
        media_type: MediaType::parse(content_type),
        file_name: file_name.map(str::to_string),
    })
}

/// Convert `data` with the converters built from `config`.
///
/// `content_type` is the declared type; it is checked against the bytes
/// and `file_name` before anything is routed.
///
/// # Errors
///
/// Fails on empty input, on cancellation, and when no item at all could be
/// produced. Per-leaf failures are packaged as items and summarized in
/// [`ConvertedDocument::error`].
///
/// # Example
///
/// ```rust,no_run
/// use mimepack::core::config::ConversionConfig;
/// use mimepack::core::converter::convert_document;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> mimepack::Result<()> {
/// let eml = std::fs::read("message.eml")?;
/// let converted = convert_document(&eml, "message/rfc822", Some("message.eml"), &ConversionConfig::default(), &CancellationToken::new()).await?;
/// for item in converted.items() {
///     println!("{} ({})", item.name(), item.content_type);
/// }
/// # Ok(())
/// # }
/// ```
pub async fn convert_document(
    data: &[u8],
    content_type: &str,
    file_name: Option<&str>,
    config: &ConversionConfig,
    cancel: &CancellationToken,
) -> Result<ConvertedDocument> {
    config.validate()?;
    let registry = Arc::new(ConverterRegistry::from_config(config)?);
    convert_document_with_registry(data, content_type, file_name, config, registry, cancel).await
}

/// Like [`convert_document`] with a caller-supplied dispatch table.
pub async fn convert_document_with_registry(
    data: &[u8],
    content_type: &str,
    file_name: Option<&str>,
    config: &ConversionConfig,
    registry: Arc<ConverterRegistry>,
    cancel: &CancellationToken,
) -> Result<ConvertedDocument> {
    let session = Arc::new(ConversionSession::new(Arc::new(config.clone()), registry, cancel.clone())?);
    let input = walk_input(data, content_type, file_name, &session)?;

    tracing::debug!(
        content_type,
        file_name = file_name.unwrap_or(""),
        bytes = data.len(),
        "conversion started"
    );
    let outcome = orchestrator::convert(Arc::clone(&session), input).await?;
    Ok(ConvertedDocument { outcome, session })
}

/// Convert the file at `path`, declaring its type from the extension.
pub async fn convert_file(
    path: impl AsRef<Path>,
    config: &ConversionConfig,
    cancel: &CancellationToken,
) -> Result<ConvertedDocument> {
    let path = path.as_ref();
    let data = read_input_file(path).await?;
    let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned());
    let content_type = file_name
        .as_deref()
        .and_then(mime::mime_from_file_name)
        .unwrap_or_else(|| OCTET_STREAM_MIME_TYPE.to_string());
    convert_document(&data, &content_type, file_name.as_deref(), config, cancel).await
}

/// Convert `data` and package every item into a ZIP at `dest`.
///
/// A caller always gets either a complete archive (with an error manifest
/// when some leaves failed) or an error and no archive.
pub async fn convert_to_zip(
    data: &[u8],
    content_type: &str,
    file_name: Option<&str>,
    dest: &Path,
    config: &ConversionConfig,
    cancel: &CancellationToken,
) -> Result<AssemblyReport> {
    convert_document(data, content_type, file_name, config, cancel)
        .await?
        .write_zip(dest)
        .await
}

/// Convert `data` and merge the resulting PDFs into one document at `dest`.
pub async fn convert_to_pdf(
    data: &[u8],
    content_type: &str,
    file_name: Option<&str>,
    dest: &Path,
    config: &ConversionConfig,
    cancel: &CancellationToken,
) -> Result<PdfReport> {
    convert_document(data, content_type, file_name, config, cancel)
        .await?
        .write_pdf(dest)
        .await
}

/// Synchronous wrapper for [`convert_to_zip`].
pub fn convert_to_zip_sync(
    data: &[u8],
    content_type: &str,
    file_name: Option<&str>,
    dest: &Path,
    config: &ConversionConfig,
) -> Result<AssemblyReport> {
    GLOBAL_RUNTIME.block_on(convert_to_zip(
        data,
        content_type,
        file_name,
        dest,
        config,
        &CancellationToken::new(),
    ))
}

/// Synchronous wrapper for [`convert_to_pdf`].
pub fn convert_to_pdf_sync(
    data: &[u8],
    content_type: &str,
    file_name: Option<&str>,
    dest: &Path,
    config: &ConversionConfig,
) -> Result<PdfReport> {
    GLOBAL_RUNTIME.block_on(convert_to_pdf(
        data,
        content_type,
        file_name,
        dest,
        config,
        &CancellationToken::new(),
    ))
}
