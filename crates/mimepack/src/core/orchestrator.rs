//! Conversion orchestrator.
//!
//! Drives one walk end to end: the walker feeds the filter stages, and every
//! leaf coming out of the last stage is handed to a bounded pool of workers.
//! A worker either recurses into a nested message, drops a skipped leaf, or
//! runs the leaf's converter while holding a limiter token.
//!
//! Leaves that cannot be converted are never dropped: their original bytes are
//! packaged as a failure item instead. Items come back in completion order;
//! the assembler sorts them.

use crate::cache::CachedConverter;
use crate::core::mime;
use crate::core::session::{ConversionSession, WalkContext};
use crate::extraction::email::{self, WalkInput};
use crate::filters::{self, FilterStage};
use crate::plugins::{Converter, Route};
use crate::types::{ArtifactItem, ConversionOutcome, Part};
use crate::{MimepackError, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Grace period on top of the converter timeout before the orchestrator gives up on a call.
const TIMEOUT_GRACE_SECS: u64 = 5;

type WalkFuture = Pin<Box<dyn Future<Output = Result<Vec<ArtifactItem>>> + Send>>;

/// Convert `input` and everything nested in it.
///
/// Returns every produced item together with the aggregate of non-fatal
/// errors. Fails outright on cancellation, or when nothing at all was
/// produced while errors were collected.
pub async fn convert(session: Arc<ConversionSession>, input: WalkInput) -> Result<ConversionOutcome> {
    let started = Instant::now();
    let ctx = Arc::new(WalkContext::new(Arc::clone(&session)));
    let stages = filters::standard_stages(session.config());

    let items = process(ctx, input, stages).await?;
    session.check_cancelled()?;

    let error = session.errors().take();
    tracing::debug!(
        items = items.len(),
        failures = items.iter().filter(|item| item.is_failure()).count(),
        errors = error.is_some(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "conversion finished"
    );

    match error {
        Some(error) if items.is_empty() => Err(error),
        error => Ok(ConversionOutcome { items, error }),
    }
}

/// One walk: walker, filter stages and the worker pool.
///
/// Boxed because workers call back into it for nested messages.
fn process(ctx: Arc<WalkContext>, input: WalkInput, stages: Vec<Arc<dyn FilterStage>>) -> WalkFuture {
    Box::pin(async move {
        let session = Arc::clone(ctx.session());
        let capacity = session.config().queue_capacity;

        let (walked, walker) = email::spawn_walk(Arc::clone(&ctx), input, capacity);
        let mut stage_tasks = JoinSet::new();
        let mut leaves = filters::spawn_stages(&ctx, stages, walked, capacity, &mut stage_tasks);

        let workers = Arc::new(Semaphore::new(session.config().concurrency()));
        let mut tasks: JoinSet<Result<Vec<ArtifactItem>>> = JoinSet::new();
        let mut items = Vec::new();
        let mut fatal = None;

        while let Some(part) = leaves.recv().await {
            if session.is_cancelled() || fatal.is_some() {
                break;
            }
            let Ok(permit) = Arc::clone(&workers).acquire_owned().await else {
                break;
            };
            let ctx = Arc::clone(&ctx);
            tasks.spawn(async move {
                let _permit = permit;
                handle_leaf(ctx, part).await
            });

            // Reap finished workers so results do not pile up behind a long walk.
            while let Some(joined) = tasks.try_join_next() {
                collect(joined, &mut items, &mut fatal);
            }
        }
        drop(leaves);

        while let Some(joined) = tasks.join_next().await {
            collect(joined, &mut items, &mut fatal);
        }
        while stage_tasks.join_next().await.is_some() {}
        if let Err(e) = walker.await {
            ctx.report(format!("walker task failed: {}", e));
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        session.check_cancelled()?;

        items.extend(ctx.take_artifacts());
        Ok(items)
    })
}

fn collect(
    joined: std::result::Result<Result<Vec<ArtifactItem>>, tokio::task::JoinError>,
    items: &mut Vec<ArtifactItem>,
    fatal: &mut Option<MimepackError>,
) {
    match joined {
        Ok(Ok(produced)) => items.extend(produced),
        Ok(Err(e)) => {
            fatal.get_or_insert(e);
        }
        Err(e) => {
            fatal.get_or_insert(MimepackError::Other(format!("conversion worker panicked: {}", e)));
        }
    }
}

/// Items for one leaf. Only fatal errors are returned as `Err`.
async fn handle_leaf(ctx: Arc<WalkContext>, part: Part) -> Result<Vec<ArtifactItem>> {
    ctx.session().check_cancelled()?;

    match ctx.session().registry().dispatch(&part.media_type) {
        Some(Route::Skip) => {
            tracing::debug!(sequence = part.sequence, content_type = part.content_type(), "leaf skipped");
            Ok(Vec::new())
        }
        Some(Route::Recurse) => recurse(ctx, part).await,
        Some(Route::Convert(converter)) => convert_leaf(&ctx, &part, converter).await,
        None => {
            let reason = format!("no converter for {}", part.content_type());
            Ok(vec![failure(&ctx, &part, reason)])
        }
    }
}

/// Run the whole pipeline again on a nested message and adopt its items.
async fn recurse(ctx: Arc<WalkContext>, part: Part) -> Result<Vec<ArtifactItem>> {
    if ctx.depth() + 1 > ctx.config().max_depth {
        let reason = format!("nested message depth {} exceeds the limit", ctx.depth() + 1);
        return Ok(vec![failure(&ctx, &part, reason)]);
    }

    tracing::debug!(sequence = part.sequence, depth = ctx.depth() + 1, "descending into nested message");
    let nested = Arc::new(ctx.nested(part.sequence));
    let input = WalkInput {
        body: part.body.clone(),
        media_type: part.media_type.clone(),
        file_name: part.file_name.clone(),
    };
    let stages = filters::standard_stages(ctx.config());
    process(nested, input, stages).await
}

async fn convert_leaf(ctx: &WalkContext, part: &Part, converter: Arc<dyn Converter>) -> Result<Vec<ArtifactItem>> {
    let converter = CachedConverter::wrap(converter, ctx.session().cache());

    let error = match run_converter(ctx, part, &converter).await {
        Ok(Some(item)) => return Ok(vec![item]),
        Ok(None) => return Ok(Vec::new()),
        Err(MimepackError::Cancelled) => return Err(MimepackError::Cancelled),
        Err(e) => e,
    };

    if let Some(fallback) = part.fallback.as_deref() {
        tracing::warn!(
            sequence = part.sequence,
            converter = converter.name(),
            error = %error,
            "HTML conversion failed, converting the plain-text alternative"
        );
        if let Some(Route::Convert(fallback_converter)) = ctx.session().registry().dispatch(&fallback.media_type) {
            let fallback_converter = CachedConverter::wrap(fallback_converter, ctx.session().cache());
            match run_converter(ctx, fallback, &fallback_converter).await {
                Ok(Some(item)) => return Ok(vec![item]),
                Ok(None) => return Ok(Vec::new()),
                Err(MimepackError::Cancelled) => return Err(MimepackError::Cancelled),
                Err(e) => tracing::warn!(sequence = fallback.sequence, error = %e, "plain-text alternative failed too"),
            }
        }
    }

    Ok(vec![failure(ctx, part, error.to_string())])
}

/// `Ok(None)` when the converter asked to skip the leaf.
async fn run_converter(ctx: &WalkContext, part: &Part, converter: &Arc<dyn Converter>) -> Result<Option<ArtifactItem>> {
    let session = ctx.session();
    let output_type = converter.output_type().to_string();
    let extension = mime::extension_for(&output_type);
    let dest = session.scratch_path(extension);
    let source = part.body.reader().await?;

    // The token covers the converter call only, never a nested walk.
    let mut token = session.limiter().acquire().await?;
    session.check_cancelled()?;

    let started = Instant::now();
    let limit = Duration::from_secs(session.config().timeout_secs + TIMEOUT_GRACE_SECS);
    let result = match tokio::time::timeout(
        limit,
        converter.convert(session.cancel_token(), &dest, source, part.content_type()),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(MimepackError::Timeout(session.config().timeout_secs)),
    };
    token.release();

    tracing::debug!(
        sequence = part.sequence,
        converter = converter.name(),
        content_type = part.content_type(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        ok = result.is_ok(),
        "converter finished"
    );

    match result {
        Ok(()) if tokio::fs::try_exists(&dest).await.unwrap_or(false) => Ok(Some(ArtifactItem::from_path(
            &dest,
            ctx.archive_name(part, extension),
            &output_type,
        ))),
        Ok(()) => Err(MimepackError::conversion(
            converter.name(),
            format!("{} produced no output", converter.name()),
        )),
        Err(MimepackError::SkipConversion(_)) => {
            let _ = tokio::fs::remove_file(&dest).await;
            tracing::debug!(sequence = part.sequence, converter = converter.name(), "converter skipped leaf");
            Ok(None)
        }
        Err(MimepackError::Cancelled) => Err(MimepackError::Cancelled),
        Err(e) => {
            let _ = tokio::fs::remove_file(&dest).await;
            Err(e)
        }
    }
}

/// Package the leaf's original bytes under a traceable name and report why.
fn failure(ctx: &WalkContext, part: &Part, reason: String) -> ArtifactItem {
    let name = ctx.archive_name(part, mime::extension_for(part.content_type()));
    ctx.report(format!("{}: {}", name, reason));
    ArtifactItem::failed(part.body.clone(), name, part.content_type(), reason)
}
