//! Mimepack - decompose mail and archives, convert every part, package the results.
//!
//! Mimepack takes one document (an email, an Outlook message, an archive or a
//! plain file), splits it into its leaf parts, runs each leaf through a
//! converter (normally to PDF) and packages the outputs into one deterministic
//! ZIP or one merged PDF.
//!
//! # Pipeline
//!
//! 1. **Walk** ([`extraction::email`]): the MIME tree is visited depth-first;
//!    every leaf gets a sequence number and a resolved content type.
//! 2. **Filter** ([`filters`]): container expansion, deduplication, text
//!    normalization, header injection and HTML/CID assembly, each a concurrent
//!    stage over bounded channels.
//! 3. **Convert** ([`core::orchestrator`]): a bounded worker pool dispatches
//!    leaves through the [`plugins::ConverterRegistry`]; nested messages are
//!    fed through the whole pipeline again.
//! 4. **Assemble** ([`assembly`]): items are sorted by name and written to a
//!    ZIP, with an `errors.txt` manifest when anything failed.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mimepack::{ConversionConfig, convert_to_zip};
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> mimepack::Result<()> {
//! let eml = std::fs::read("message.eml")?;
//! let report = convert_to_zip(
//!     &eml,
//!     "message/rfc822",
//!     Some("message.eml"),
//!     Path::new("message.zip"),
//!     &ConversionConfig::default(),
//!     &CancellationToken::new(),
//! )
//! .await?;
//! println!("{} members", report.members.len());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod assembly;
pub mod cache;
pub mod converters;
pub mod core;
pub mod error;
pub mod extraction;
pub mod filters;
pub mod plugins;
pub mod text;
pub mod types;
pub mod utils;

pub use error::{MimepackError, Result};
pub use types::*;

pub use core::config::ConversionConfig;
pub use core::converter::{
    ConvertedDocument, PdfReport, convert_document, convert_document_with_registry, convert_file, convert_to_pdf,
    convert_to_pdf_sync, convert_to_zip, convert_to_zip_sync,
};

pub use assembly::ERRORS_MANIFEST_NAME;
pub use plugins::{Converter, ConverterRegistry, Plugin, Route};
