//! Converter capability.
//!
//! A converter turns one leaf's bytes into the target format (normally PDF)
//! at a destination path. Implementations must:
//!
//! - produce the same output for the same inputs,
//! - leave no valid-looking file at `dest` when they fail,
//! - return [`MimepackError::SkipConversion`](crate::MimepackError::SkipConversion)
//!   to say "nothing to render here" without it counting as a failure.

use crate::Result;
use crate::core::mime::PDF_MIME_TYPE;
use crate::plugins::Plugin;
use async_trait::async_trait;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Readable source bytes handed to a converter.
pub type SourceReader = Box<dyn AsyncRead + Send + Unpin>;

/// Trait for converter plugins.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use mimepack::plugins::{Converter, Plugin, SourceReader};
/// use mimepack::Result;
/// use std::path::Path;
/// use tokio_util::sync::CancellationToken;
///
/// struct Copy;
///
/// impl Plugin for Copy {
///     fn name(&self) -> &str { "copy" }
/// }
///
/// #[async_trait]
/// impl Converter for Copy {
///     async fn convert(&self, _cancel: &CancellationToken, dest: &Path, source: SourceReader, _ct: &str) -> Result<()> {
///         mimepack::plugins::converter::write_source(dest, source).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Converter: Plugin {
    /// Write the converted form of `source` (declared as `content_type`) to `dest`.
    async fn convert(
        &self,
        cancel: &CancellationToken,
        dest: &Path,
        source: SourceReader,
        content_type: &str,
    ) -> Result<()>;

    /// Content type written to `dest`.
    fn output_type(&self) -> &str {
        PDF_MIME_TYPE
    }

    /// Whether results may be served from the content-addressed cache.
    fn cacheable(&self) -> bool {
        true
    }
}

/// Copy `source` into a new file at `dest`; returns the byte count.
///
/// The file is removed again if copying fails part-way.
pub async fn write_source(dest: &Path, mut source: SourceReader) -> Result<u64> {
    let mut file = tokio::fs::File::create(dest).await?;
    let copied = match tokio::io::copy(&mut source, &mut file).await {
        Ok(n) => n,
        Err(e) => {
            drop(file);
            let _ = tokio::fs::remove_file(dest).await;
            return Err(e.into());
        }
    };
    file.flush().await?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_source_copies_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let source: SourceReader = Box::new(std::io::Cursor::new(b"payload".to_vec()));
        let n = write_source(&dest, source).await.unwrap();
        assert_eq!(n, 7);
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
    }
}
