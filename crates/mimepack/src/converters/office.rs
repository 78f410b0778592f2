use crate::core::config::LibreOfficeConfig;
use crate::core::mime;
use crate::extraction::libreoffice;
use crate::plugins::converter::write_source;
use crate::plugins::{Converter, Plugin, SourceReader};
use crate::{MimepackError, Result};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Office documents, RTF, text, HTML and images through headless LibreOffice.
#[derive(Debug)]
pub struct LibreOfficeConverter {
    configured: Option<PathBuf>,
    located: OnceCell<PathBuf>,
    timeout_secs: u64,
    single_instance: bool,
}

impl LibreOfficeConverter {
    pub fn new(config: &LibreOfficeConfig, timeout_secs: u64) -> Self {
        Self {
            configured: config.binary.clone(),
            located: OnceCell::new(),
            timeout_secs,
            single_instance: config.single_instance,
        }
    }

    fn soffice(&self) -> Result<&Path> {
        self.located
            .get_or_try_init(|| libreoffice::locate_soffice_binary(self.configured.as_deref()))
            .map(PathBuf::as_path)
    }
}

impl Plugin for LibreOfficeConverter {
    fn name(&self) -> &str {
        "libreoffice"
    }

    fn description(&self) -> &str {
        "Converts office, text, HTML and image formats to PDF with soffice"
    }
}

#[async_trait]
impl Converter for LibreOfficeConverter {
    async fn convert(
        &self,
        cancel: &CancellationToken,
        dest: &Path,
        source: SourceReader,
        content_type: &str,
    ) -> Result<()> {
        let soffice = self.soffice()?.to_path_buf();

        // soffice picks its import filter from the extension.
        let scratch = tempfile::Builder::new().prefix("mimepack-lo-").tempdir()?;
        let input = scratch
            .path()
            .join(format!("input.{}", mime::extension_for(content_type)));
        write_source(&input, source).await?;

        let produced = libreoffice::convert_to_pdf(
            &soffice,
            &input,
            &scratch.path().join("out"),
            self.timeout_secs,
            self.single_instance,
            cancel,
        )
        .await?;

        if let Err(e) = tokio::fs::copy(&produced, dest).await {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(MimepackError::Io(e));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary_reports_dependency() {
        let config = LibreOfficeConfig {
            binary: Some(PathBuf::from("/nonexistent/soffice")),
            single_instance: false,
        };
        let converter = LibreOfficeConverter::new(&config, 5);
        assert_eq!(converter.name(), "libreoffice");
        assert_eq!(converter.output_type(), "application/pdf");
        // Falls through the configured path to discovery; only assert the shape.
        if let Err(err) = converter.soffice() {
            assert!(matches!(err, MimepackError::MissingDependency(_)));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_convert_with_fake_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("soffice");
        std::fs::write(
            &fake,
            "#!/bin/sh\nwhile [ \"$1\" != \"--outdir\" ]; do shift; done\nout=\"$2\"; in=\"$3\"\nb=$(basename \"$in\"); cp \"$in\" \"$out/${b%.*}.pdf\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = LibreOfficeConfig {
            binary: Some(fake),
            single_instance: true,
        };
        let converter = LibreOfficeConverter::new(&config, 10);
        let dest = dir.path().join("result.pdf");
        let source: SourceReader = Box::new(std::io::Cursor::new(b"hello".to_vec()));
        converter
            .convert(&CancellationToken::new(), &dest, source, "text/plain")
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello");
    }
}
