//! Filter pipeline.
//!
//! Every stage consumes the ordered part stream of one walk and produces a new
//! one. Stages run concurrently, connected by bounded channels, in this fixed
//! order:
//!
//! 1. [`ExpandStage`]: open containers and re-inject their members
//! 2. [`DedupStage`]: drop repeats of a caller-supplied content hash
//! 3. [`NormalizeStage`]: transfer-encoding and charset repair
//! 4. [`PreserveHtmlStage`]: snapshot original HTML (when configured)
//! 5. [`HeaderStage`]: splice a From/To/Subject block into text and HTML
//! 6. [`RelatedStage`]: pair alternatives and inline `cid:` images
//! 7. [`DedupStage`] again, for repeats produced by stage 6
//!
//! A stage closes its output by returning, which drops its sender. Cancellation
//! drops the stage future, closing both of its channel ends.

pub mod dedup;
pub mod expand;
pub mod headers;
pub mod normalize;
pub mod preserve;
pub mod related;

pub use dedup::DedupStage;
pub use expand::ExpandStage;
pub use headers::HeaderStage;
pub use normalize::NormalizeStage;
pub use preserve::PreserveHtmlStage;
pub use related::RelatedStage;

use crate::core::config::ConversionConfig;
use crate::core::session::WalkContext;
use crate::types::Part;
use crate::{MimepackError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// One streaming transformation over the part stream.
#[async_trait]
pub trait FilterStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Consume `input` until it closes, sending results to `output`.
    ///
    /// Returning drops `output`, which closes the stream for the next stage.
    async fn run(&self, ctx: Arc<WalkContext>, input: mpsc::Receiver<Part>, output: mpsc::Sender<Part>) -> Result<()>;
}

/// Send `part` downstream; `false` once the next stage has gone away.
pub(crate) async fn forward(output: &mpsc::Sender<Part>, part: Part) -> bool {
    output.send(part).await.is_ok()
}

/// The standard stage chain for `config`.
pub fn standard_stages(config: &ConversionConfig) -> Vec<Arc<dyn FilterStage>> {
    let mut stages: Vec<Arc<dyn FilterStage>> = vec![
        Arc::new(ExpandStage),
        Arc::new(DedupStage::from_config(&config.dedup)),
        Arc::new(NormalizeStage::from_config(&config.text)),
    ];
    if let Some(dir) = &config.html.preserve_original_dir {
        stages.push(Arc::new(PreserveHtmlStage::new(dir.clone())));
    }
    if config.html.inject_headers {
        stages.push(Arc::new(HeaderStage));
    }
    stages.push(Arc::new(RelatedStage));
    stages.push(Arc::new(DedupStage::from_config(&config.dedup)));
    stages
}

/// Spawn `stages` onto `tasks`, chained after `input`.
///
/// Returns the receiving end of the last stage. Each stage holds a stage guard
/// on the session for as long as it runs.
pub fn spawn_stages(
    ctx: &Arc<WalkContext>,
    stages: Vec<Arc<dyn FilterStage>>,
    mut input: mpsc::Receiver<Part>,
    capacity: usize,
    tasks: &mut JoinSet<()>,
) -> mpsc::Receiver<Part> {
    for stage in stages {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let ctx = Arc::clone(ctx);
        let guard = ctx.session().enter_stage(stage.name());
        let stage_input = std::mem::replace(&mut input, rx);

        tasks.spawn(async move {
            let _guard = guard;
            let cancel = ctx.cancel_token().clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(stage = stage.name(), "stage cancelled");
                }
                result = stage.run(Arc::clone(&ctx), stage_input, tx) => match result {
                    Ok(()) | Err(MimepackError::Cancelled) => {}
                    Err(e) => ctx.report(format!("{} stage failed: {}", stage.name(), e)),
                },
            }
        });
    }
    input
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::core::session::ConversionSession;
    use crate::plugins::ConverterRegistry;
    use crate::types::{Body, HeaderMap, MediaType};
    use crate::utils::limiter::ConcurrencyLimiter;
    use tokio_util::sync::CancellationToken;

    pub fn context_with(config: ConversionConfig) -> Arc<WalkContext> {
        let registry = Arc::new(ConverterRegistry::from_config(&config).unwrap());
        let session = ConversionSession::with_limiter(
            Arc::new(config),
            registry,
            ConcurrencyLimiter::new(2),
            CancellationToken::new(),
        )
        .unwrap();
        Arc::new(WalkContext::new(Arc::new(session)))
    }

    pub fn context() -> Arc<WalkContext> {
        context_with(ConversionConfig::default())
    }

    pub fn part(sequence: u64, content_type: &str, body: &[u8]) -> Part {
        Part {
            sequence,
            level: 1,
            parent: Some(0),
            media_type: MediaType::parse(content_type),
            header: HeaderMap::new(),
            body: Body::from_vec(body.to_vec()),
            file_name: None,
            fallback: None,
        }
    }

    /// Feed `parts` through `stage` and collect everything it emits.
    pub async fn run_stage(stage: &dyn FilterStage, ctx: Arc<WalkContext>, parts: Vec<Part>) -> Vec<Part> {
        let (in_tx, in_rx) = mpsc::channel(parts.len().max(1));
        for part in parts {
            ctx.lineage().record(&part);
            in_tx.send(part).await.unwrap();
        }
        drop(in_tx);

        let (out_tx, mut out_rx) = mpsc::channel(64);
        let collector = tokio::spawn(async move {
            let mut out = Vec::new();
            while let Some(part) = out_rx.recv().await {
                out.push(part);
            }
            out
        });
        stage.run(ctx, in_rx, out_tx).await.unwrap();
        collector.await.unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_standard_stage_order() {
        let mut config = ConversionConfig::default();
        let names: Vec<_> = standard_stages(&config).iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["expand", "dedup", "normalize", "headers", "related", "dedup"]);

        config.html.preserve_original_dir = Some("/tmp/originals".into());
        config.html.inject_headers = false;
        let names: Vec<_> = standard_stages(&config).iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["expand", "dedup", "normalize", "preserve-html", "related", "dedup"]);
    }

    #[tokio::test]
    async fn test_chain_passes_plain_parts_in_order() {
        let ctx = context();
        let (tx, rx) = mpsc::channel(4);
        let mut tasks = JoinSet::new();
        let mut out = spawn_stages(&ctx, standard_stages(ctx.config()), rx, 2, &mut tasks);

        let feeder = tokio::spawn(async move {
            for seq in 1..=3u64 {
                tx.send(part(seq, "application/pdf", b"%PDF-1.4")).await.unwrap();
            }
        });

        let mut seen = Vec::new();
        while let Some(p) = out.recv().await {
            seen.push(p.sequence);
        }
        feeder.await.unwrap();
        while tasks.join_next().await.is_some() {}

        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(ctx.session().active_stages(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_closes_every_stage() {
        let ctx = context();
        let (tx, rx) = mpsc::channel(1);
        let mut tasks = JoinSet::new();
        let mut out = spawn_stages(&ctx, standard_stages(ctx.config()), rx, 1, &mut tasks);

        ctx.session().cancel_token().cancel();
        assert!(out.recv().await.is_none());
        while tasks.join_next().await.is_some() {}
        assert_eq!(ctx.session().active_stages(), 0);
        drop(tx);
    }
}
