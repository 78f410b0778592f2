//! Error types for mimepack.
//!
//! All fallible operations return [`MimepackError`]. The variants follow the
//! failure taxonomy of the conversion pipeline:
//!
//! - Classification ambiguity never produces an error; the resolver always
//!   settles on some content type.
//! - `Parsing` covers decomposition failures (an unreadable archive member or
//!   mail part). These are reported and the walk continues.
//! - `UnsupportedFormat` and `Conversion` describe a single leaf that could not
//!   be converted. The orchestrator packages the original bytes instead.
//! - `Validation`, `Cancelled` and `Io` are fatal to the whole call.
//!
//! **System errors MUST always bubble up unchanged:** `MimepackError::Io` is
//! never wrapped or suppressed.
//!
//! # Example
//!
//! ```rust
//! use mimepack::{MimepackError, Result};
//!
//! fn load(path: &str) -> Result<Vec<u8>> {
//!     let bytes = std::fs::read(path)?;
//!     if bytes.is_empty() {
//!         return Err(MimepackError::validation(format!("Input is empty: {}", path)));
//!     }
//!     Ok(bytes)
//! }
//! ```
use thiserror::Error;

/// Result type alias using `MimepackError`.
pub type Result<T> = std::result::Result<T, MimepackError>;

/// Main error type for all mimepack operations.
#[derive(Debug, Error)]
pub enum MimepackError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parsing error: {message}")]
    Parsing {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Cache error: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Conversion error in '{converter}': {message}")]
    Conversion { message: String, converter: String },

    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    #[error("Operation cancelled")]
    Cancelled,

    /// Sentinel returned by a converter that deliberately produces nothing.
    #[error("Conversion skipped: {0}")]
    SkipConversion(String),

    #[error("{} error(s) during conversion{}:\n{}", .messages.len(), if *.truncated { " (truncated)" } else { "" }, .messages.join("\n"))]
    Aggregate { messages: Vec<String>, truncated: bool },

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for MimepackError {
    fn from(err: serde_json::Error) -> Self {
        MimepackError::Serialization {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<zip::result::ZipError> for MimepackError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(io) => MimepackError::Io(io),
            other => MimepackError::Parsing {
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }
}

macro_rules! error_constructor {
    ($name:ident, $variant:ident) => {
        pastey::paste! {
            #[doc = "Create a " $variant " error"]
            pub fn $name<S: Into<String>>(message: S) -> Self {
                Self::$variant {
                    message: message.into(),
                    source: None,
                }
            }

            #[doc = "Create a " $variant " error with source"]
            pub fn [<$name _with_source>]<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
                message: S,
                source: E,
            ) -> Self {
                Self::$variant {
                    message: message.into(),
                    source: Some(Box::new(source)),
                }
            }
        }
    };
}

impl MimepackError {
    error_constructor!(parsing, Parsing);
    error_constructor!(validation, Validation);
    error_constructor!(cache, Cache);
    error_constructor!(serialization, Serialization);

    /// Create a converter failure attributed to `converter`.
    pub fn conversion<C: Into<String>, S: Into<String>>(converter: C, message: S) -> Self {
        Self::Conversion {
            message: message.into(),
            converter: converter.into(),
        }
    }

    /// Errors that abort the whole call instead of being packaged per leaf.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MimepackError::Validation { .. } | MimepackError::Cancelled | MimepackError::Io(_)
        )
    }

    /// `true` for the "intentionally produced nothing" sentinel.
    pub fn is_skip(&self) -> bool {
        matches!(self, MimepackError::SkipConversion(_))
    }
}
