//! Snapshot of HTML bodies before header injection and CID inlining rewrite them.
//!
//! The part continues with its body read back from the snapshot file.

use super::{FilterStage, forward};
use crate::Result;
use crate::core::session::WalkContext;
use crate::types::{Body, Part};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct PreserveHtmlStage {
    dir: PathBuf,
}

impl PreserveHtmlStage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn snapshot(&self, ctx: &WalkContext, part: &Part) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self
            .dir
            .join(format!("{}{}.html", ctx.name_prefix(), ctx.label(part.sequence)));

        let mut reader = part.body.reader().await?;
        let mut file = tokio::fs::File::create(&path).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        Ok(path)
    }
}

#[async_trait]
impl FilterStage for PreserveHtmlStage {
    fn name(&self) -> &'static str {
        "preserve-html"
    }

    async fn run(&self, ctx: Arc<WalkContext>, mut input: mpsc::Receiver<Part>, output: mpsc::Sender<Part>) -> Result<()> {
        while let Some(mut part) = input.recv().await {
            if part.media_type.is_html() {
                match self.snapshot(&ctx, &part).await.and_then(|path| Ok((Body::from_path(&path)?, path))) {
                    Ok((body, path)) => {
                        tracing::debug!(sequence = part.sequence, path = %path.display(), "original HTML preserved");
                        part = part.with_body(body);
                    }
                    Err(e) => ctx.report(format!("part {}: cannot preserve original HTML: {}", part.sequence, e)),
                }
            }
            if !forward(&output, part).await {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support::{context, part, run_stage};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_html_snapshot_written() {
        let dir = TempDir::new().unwrap();
        let stage = PreserveHtmlStage::new(dir.path().join("originals"));
        let out = run_stage(
            &stage,
            context(),
            vec![part(3, "text/html", b"<p>hi</p>"), part(4, "text/plain", b"hi")],
        )
        .await;

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].body.path(), Some(dir.path().join("originals").join("0003.html").as_path()));
        assert_eq!(out[0].body.to_vec().unwrap(), b"<p>hi</p>");
        let saved = std::fs::read(dir.path().join("originals").join("0003.html")).unwrap();
        assert_eq!(saved, b"<p>hi</p>");
        assert!(!dir.path().join("originals").join("0004.html").exists());
    }

    #[tokio::test]
    async fn test_unwritable_dir_reports_and_passes() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let ctx = context();
        let out = run_stage(&PreserveHtmlStage::new(blocker.join("sub")), ctx.clone(), vec![part(1, "text/html", b"<p/>")]).await;
        assert_eq!(out.len(), 1);
        assert!(!ctx.session().errors().is_empty());
    }
}
