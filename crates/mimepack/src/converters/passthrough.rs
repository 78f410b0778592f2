use crate::Result;
use crate::plugins::converter::write_source;
use crate::plugins::{Converter, Plugin, SourceReader};
use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Copies sources that are already in the target format (PDF).
#[derive(Debug, Default)]
pub struct PassthroughConverter;

impl Plugin for PassthroughConverter {
    fn name(&self) -> &str {
        "pdf-passthrough"
    }

    fn description(&self) -> &str {
        "Copies PDF input unchanged"
    }
}

#[async_trait]
impl Converter for PassthroughConverter {
    async fn convert(&self, cancel: &CancellationToken, dest: &Path, source: SourceReader, _: &str) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(crate::MimepackError::Cancelled);
        }
        write_source(dest, source).await?;
        Ok(())
    }

    fn cacheable(&self) -> bool {
        false
    }
}
