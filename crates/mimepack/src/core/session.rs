//! Per-call state shared by the walker, the filter stages and the orchestrator.
//!
//! A [`ConversionSession`] lives for one top-level conversion call. It owns the
//! scratch directory, the cancellation token, the error collector and handles
//! to the shared limiter and cache. A [`WalkContext`] lives for one pass of the
//! pipeline over one input; nested messages get a child context with their own
//! sequence space and lineage, but share the session.

use crate::cache::ContentCache;
use crate::core::config::ConversionConfig;
use crate::core::resolve::resolve;
use crate::core::sniff::{SNIFF_WINDOW, standard_sniffer};
use crate::error::{MimepackError, Result};
use crate::plugins::ConverterRegistry;
use crate::types::{ArtifactItem, Body, HeaderMap, Part};
use crate::utils::limiter::{self, ConcurrencyLimiter};
use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Bounded accumulator for non-fatal errors.
///
/// Once the collected text reaches `max_bytes`, further messages are counted
/// as dropped and the aggregate is flagged as truncated.
#[derive(Debug)]
pub struct ErrorCollector {
    max_bytes: usize,
    state: Mutex<CollectorState>,
}

#[derive(Debug, Default)]
struct CollectorState {
    messages: Vec<String>,
    bytes: usize,
    truncated: bool,
}

impl ErrorCollector {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            state: Mutex::new(CollectorState::default()),
        }
    }

    pub fn push(&self, message: impl Display) {
        let message = message.to_string();
        tracing::warn!("{}", message);

        let mut state = self.state.lock();
        if state.bytes + message.len() > self.max_bytes {
            state.truncated = true;
            return;
        }
        state.bytes += message.len();
        state.messages.push(message);
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.messages.is_empty() && !state.truncated
    }

    pub fn truncated(&self) -> bool {
        self.state.lock().truncated
    }

    pub fn messages(&self) -> Vec<String> {
        self.state.lock().messages.clone()
    }

    /// Drain into a single [`MimepackError::Aggregate`], or `None` when nothing was collected.
    pub fn take(&self) -> Option<MimepackError> {
        let mut state = self.state.lock();
        if state.messages.is_empty() && !state.truncated {
            return None;
        }
        let taken = std::mem::take(&mut *state);
        Some(MimepackError::Aggregate {
            messages: taken.messages,
            truncated: taken.truncated,
        })
    }
}

/// Decrements the session's live-stage counter when dropped.
#[derive(Debug)]
pub struct StageGuard {
    name: &'static str,
    active: Arc<AtomicUsize>,
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!(stage = self.name, "stage closed");
    }
}

/// State for one top-level conversion call.
#[derive(Debug)]
pub struct ConversionSession {
    config: Arc<ConversionConfig>,
    registry: Arc<ConverterRegistry>,
    limiter: ConcurrencyLimiter,
    cache: Option<Arc<ContentCache>>,
    work_dir: PathBuf,
    _scratch: Option<TempDir>,
    cancel: CancellationToken,
    errors: ErrorCollector,
    active_stages: Arc<AtomicUsize>,
    scratch_counter: AtomicU64,
}

impl ConversionSession {
    /// Build a session with its own scratch directory.
    ///
    /// Uses the process-wide limiter sized by `config.concurrency()` and opens
    /// the cache when one is configured and enabled. A cache that cannot be
    /// opened is logged and skipped.
    pub fn new(config: Arc<ConversionConfig>, registry: Arc<ConverterRegistry>, cancel: CancellationToken) -> Result<Self> {
        let limiter = limiter::global(config.concurrency());
        Self::with_limiter(config, registry, limiter, cancel)
    }

    pub fn with_limiter(
        config: Arc<ConversionConfig>,
        registry: Arc<ConverterRegistry>,
        limiter: ConcurrencyLimiter,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let cache = match &config.cache {
            Some(cache_config) if cache_config.enabled => match ContentCache::new(cache_config) {
                Ok(cache) => Some(Arc::new(cache)),
                Err(e) => {
                    tracing::warn!("Conversion cache disabled: {}", e);
                    None
                }
            },
            _ => None,
        };

        let scratch = tempfile::Builder::new().prefix("mimepack-").tempdir()?;
        let (work_dir, scratch) = if config.keep_temp_files {
            let path = scratch.keep();
            tracing::info!("Keeping temporary files in {}", path.display());
            (path, None)
        } else {
            (scratch.path().to_path_buf(), Some(scratch))
        };

        Ok(Self {
            errors: ErrorCollector::new(config.max_error_bytes),
            config,
            registry,
            limiter,
            cache,
            work_dir,
            _scratch: scratch,
            cancel,
            active_stages: Arc::new(AtomicUsize::new(0)),
            scratch_counter: AtomicU64::new(0),
        })
    }

    /// Replace the cache handle (tests and callers sharing one cache).
    pub fn set_cache(&mut self, cache: Option<Arc<ContentCache>>) {
        self.cache = cache;
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConverterRegistry {
        &self.registry
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn cache(&self) -> Option<&Arc<ContentCache>> {
        self.cache.as_ref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(MimepackError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn errors(&self) -> &ErrorCollector {
        &self.errors
    }

    pub fn report(&self, message: impl Display) {
        self.errors.push(message);
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Fresh, unused path inside the scratch directory.
    pub fn scratch_path(&self, extension: &str) -> PathBuf {
        let n = self.scratch_counter.fetch_add(1, Ordering::Relaxed);
        self.work_dir.join(format!("{:06}.{}", n, extension))
    }

    /// Fresh, empty directory inside the scratch directory.
    pub fn scratch_dir(&self) -> Result<PathBuf> {
        let n = self.scratch_counter.fetch_add(1, Ordering::Relaxed);
        let dir = self.work_dir.join(format!("{:06}.d", n));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Body that spills to the scratch directory above the in-memory threshold.
    pub fn body(&self, data: Vec<u8>) -> Result<Body> {
        Body::with_threshold(data, self.config.in_memory_threshold, &self.work_dir)
    }

    /// Mark a stage as running until the returned guard is dropped.
    pub fn enter_stage(&self, name: &'static str) -> StageGuard {
        self.active_stages.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(stage = name, "stage started");
        StageGuard {
            name,
            active: Arc::clone(&self.active_stages),
        }
    }

    /// Number of stages that have started and not yet closed.
    pub fn active_stages(&self) -> usize {
        self.active_stages.load(Ordering::Acquire)
    }
}

/// What a later stage needs to know about an already emitted part.
#[derive(Debug, Clone)]
pub struct LineageRecord {
    pub level: u32,
    pub parent: Option<u64>,
    pub content_type: String,
    pub header: HeaderMap,
}

/// Arena of emitted parts keyed by sequence number.
///
/// Parts refer to their parent by sequence only; this table resolves those
/// references without any part owning another.
#[derive(Debug, Default)]
pub struct Lineage {
    records: RwLock<AHashMap<u64, LineageRecord>>,
}

impl Lineage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, part: &Part) {
        self.records.write().insert(
            part.sequence,
            LineageRecord {
                level: part.level,
                parent: part.parent,
                content_type: part.media_type.essence.clone(),
                header: part.header.clone(),
            },
        );
    }

    pub fn get(&self, sequence: u64) -> Option<LineageRecord> {
        self.records.read().get(&sequence).cloned()
    }

    /// Closest ancestor of `sequence` (starting with its parent) matching `predicate`.
    pub fn nearest_ancestor(&self, sequence: u64, predicate: impl Fn(&LineageRecord) -> bool) -> Option<LineageRecord> {
        let records = self.records.read();
        let mut current = records.get(&sequence).and_then(|r| r.parent);
        // Bounded by the table size in case of a malformed chain.
        for _ in 0..=records.len() {
            let seq = current?;
            let record = records.get(&seq)?;
            if predicate(record) {
                return Some(record.clone());
            }
            current = record.parent;
        }
        None
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

/// First sequence number handed to archive members.
///
/// The walker and the expand stage run concurrently, so members draw from a
/// range of their own and neither numbering depends on scheduling.
pub const MEMBER_SEQUENCE_BASE: u64 = 1 << 40;

/// State for one pass of the pipeline over one input.
#[derive(Debug)]
pub struct WalkContext {
    session: Arc<ConversionSession>,
    lineage: Lineage,
    sequence: AtomicU64,
    member_sequence: AtomicU64,
    labels: RwLock<AHashMap<u64, String>>,
    depth: usize,
    name_prefix: String,
    artifacts: Mutex<Vec<ArtifactItem>>,
}

impl WalkContext {
    pub fn new(session: Arc<ConversionSession>) -> Self {
        Self {
            session,
            lineage: Lineage::new(),
            sequence: AtomicU64::new(0),
            member_sequence: AtomicU64::new(MEMBER_SEQUENCE_BASE),
            labels: RwLock::new(AHashMap::new()),
            depth: 0,
            name_prefix: String::new(),
            artifacts: Mutex::new(Vec::new()),
        }
    }

    /// Context for a nested message found at `sequence` in this walk.
    pub fn nested(&self, sequence: u64) -> Self {
        Self {
            session: Arc::clone(&self.session),
            lineage: Lineage::new(),
            sequence: AtomicU64::new(0),
            member_sequence: AtomicU64::new(MEMBER_SEQUENCE_BASE),
            labels: RwLock::new(AHashMap::new()),
            depth: self.depth + 1,
            name_prefix: format!("{}{}-", self.name_prefix, self.label(sequence)),
            artifacts: Mutex::new(Vec::new()),
        }
    }

    pub fn session(&self) -> &Arc<ConversionSession> {
        &self.session
    }

    pub fn config(&self) -> &ConversionConfig {
        self.session.config()
    }

    pub fn lineage(&self) -> &Lineage {
        &self.lineage
    }

    /// Recursion depth of this walk (0 for the caller's document).
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Prefix for archive names produced by this walk.
    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    /// Traceable archive name `<prefix><label>-<stem>.<extension>` for `part`.
    pub fn archive_name(&self, part: &Part, extension: &str) -> String {
        let stem = part
            .file_name
            .as_deref()
            .map(|name| {
                let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
                base.rsplit_once('.').map_or(base, |(stem, _)| stem).trim()
            })
            .filter(|stem| !stem.is_empty())
            .unwrap_or("part");
        format!("{}{}-{}.{}", self.name_prefix, self.label(part.sequence), stem, extension)
    }

    /// Position of `sequence` in the container tree.
    ///
    /// Walker parts are labelled by their zero-padded sequence, archive
    /// members by their container's label and their index in it.
    pub fn label(&self, sequence: u64) -> String {
        self.labels
            .read()
            .get(&sequence)
            .cloned()
            .unwrap_or_else(|| format!("{:04}", sequence))
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Sequence number for the member at `index` of `container`.
    pub fn member_sequence(&self, container: u64, index: usize) -> u64 {
        let sequence = self.member_sequence.fetch_add(1, Ordering::Relaxed);
        let label = format!("{}.{:04}", self.label(container), index + 1);
        self.labels.write().insert(sequence, label);
        sequence
    }

    /// Re-resolve `part`'s content type against its own leading bytes.
    pub fn classify(&self, part: &mut Part) -> Result<()> {
        let prefix = part.body.prefix(SNIFF_WINDOW)?;
        let registry = self.session.registry();
        let resolution = resolve(
            &prefix,
            &part.media_type.essence,
            part.file_name.as_deref(),
            standard_sniffer(self.config().sniff_mode),
            |content_type| registry.has_converter(content_type),
        );
        if resolution.content_type != part.media_type.essence {
            part.media_type = part.media_type.with_essence(&resolution.content_type);
        }
        Ok(())
    }

    /// Artifact produced outside the orchestrator (e.g. an unopenable container).
    pub fn emit_artifact(&self, item: ArtifactItem) {
        self.artifacts.lock().push(item);
    }

    pub fn take_artifacts(&self) -> Vec<ArtifactItem> {
        std::mem::take(&mut *self.artifacts.lock())
    }

    pub fn is_cancelled(&self) -> bool {
        self.session.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        self.session.cancel_token()
    }

    pub fn report(&self, message: impl Display) {
        self.session.report(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaType;

    fn part(sequence: u64, parent: Option<u64>, header: &[(&str, &str)]) -> Part {
        let mut map = HeaderMap::new();
        for (k, v) in header {
            map.append(*k, *v);
        }
        Part {
            sequence,
            level: parent.map_or(0, |_| 1),
            parent,
            media_type: MediaType::new("text/plain"),
            header: map,
            body: Body::empty(),
            file_name: None,
            fallback: None,
        }
    }

    fn session(config: ConversionConfig) -> Arc<ConversionSession> {
        let config = Arc::new(config);
        let registry = Arc::new(ConverterRegistry::new());
        Arc::new(
            ConversionSession::with_limiter(config, registry, ConcurrencyLimiter::new(2), CancellationToken::new())
                .unwrap(),
        )
    }

    #[test]
    fn test_error_collector_truncates() {
        let collector = ErrorCollector::new(10);
        collector.push("12345");
        collector.push("67890");
        collector.push("overflow");
        assert!(collector.truncated());
        assert_eq!(collector.messages().len(), 2);

        match collector.take() {
            Some(MimepackError::Aggregate { messages, truncated }) => {
                assert_eq!(messages, vec!["12345", "67890"]);
                assert!(truncated);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(collector.take().is_none());
    }

    #[test]
    fn test_lineage_nearest_ancestor() {
        let lineage = Lineage::new();
        lineage.record(&part(0, None, &[("From", "a@example.com"), ("Subject", "hi")]));
        lineage.record(&part(1, Some(0), &[("Content-Type", "multipart/mixed")]));
        lineage.record(&part(2, Some(1), &[]));

        let found = lineage.nearest_ancestor(2, |r| r.header.contains("From")).unwrap();
        assert_eq!(found.header.get("subject"), Some("hi"));
        assert!(lineage.nearest_ancestor(0, |_| true).is_none());
    }

    #[test]
    fn test_scratch_dir_removed_on_drop() {
        let session = session(ConversionConfig::default());
        let dir = session.work_dir().to_path_buf();
        assert!(dir.is_dir());
        assert_ne!(session.scratch_path("pdf"), session.scratch_path("pdf"));
        drop(session);
        assert!(!dir.exists());
    }

    #[test]
    fn test_keep_temp_files() {
        let config = ConversionConfig {
            keep_temp_files: true,
            ..Default::default()
        };
        let session = session(config);
        let dir = session.work_dir().to_path_buf();
        drop(session);
        assert!(dir.is_dir());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_stage_guard_counts() {
        let session = session(ConversionConfig::default());
        let a = session.enter_stage("a");
        let b = session.enter_stage("b");
        assert_eq!(session.active_stages(), 2);
        drop(a);
        drop(b);
        assert_eq!(session.active_stages(), 0);
    }

    #[test]
    fn test_nested_context_prefix() {
        let ctx = WalkContext::new(session(ConversionConfig::default()));
        let child = ctx.nested(3);
        let grandchild = child.nested(12);
        assert_eq!(grandchild.name_prefix(), "0003-0012-");
        assert_eq!(grandchild.depth(), 2);
        assert_eq!(child.next_sequence(), 0);

        let mut p = part(7, Some(1), &[]);
        p.file_name = Some("dir/Quarterly report.docx".to_string());
        assert_eq!(child.archive_name(&p, "pdf"), "0003-0007-Quarterly report.pdf");
        p.file_name = None;
        assert_eq!(ctx.archive_name(&p, "bin"), "0007-part.bin");
    }

    #[test]
    fn test_member_labels_follow_container_tree() {
        let ctx = WalkContext::new(session(ConversionConfig::default()));
        let walker = ctx.next_sequence();
        let container = ctx.next_sequence();

        let first = ctx.member_sequence(container, 0);
        let nested = ctx.member_sequence(first, 2);
        // Walker numbering is unaffected by members allocated in between.
        assert_eq!(ctx.next_sequence(), 2);
        assert!(first >= MEMBER_SEQUENCE_BASE && nested > first);
        assert_eq!(ctx.label(walker), "0000");
        assert_eq!(ctx.label(first), "0001.0001");
        assert_eq!(ctx.label(nested), "0001.0001.0003");

        let mut p = part(nested, Some(first), &[]);
        p.file_name = Some("deep/notes.txt".to_string());
        assert_eq!(ctx.archive_name(&p, "pdf"), "0001.0001.0003-notes.pdf");
        assert_eq!(ctx.nested(first).name_prefix(), "0001.0001-");
    }
}
