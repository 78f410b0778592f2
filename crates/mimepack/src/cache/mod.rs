//! Content-addressed cache of conversion results.
//!
//! Entries live as flat files named `<blake3-hex>.bin` under the cache
//! directory. The key covers the source type, the target type and every byte
//! of the source, so a hit can be copied to the destination verbatim.
//!
//! Writes go through a temporary file in the cache directory followed by a
//! rename, which means a concurrent reader either sees a complete entry or
//! nothing. Every [`EVICTION_INTERVAL`] writes an eviction pass drops expired
//! entries and then the oldest ones until the cache fits its byte budget.
//!
//! All methods on [`ContentCache`] touch the filesystem synchronously;
//! [`CachedConverter`] runs them on the blocking pool.

use crate::core::config::CacheConfig;
use crate::plugins::{Converter, Plugin, SourceReader};
use crate::{MimepackError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const ENTRY_EXTENSION: &str = "bin";
const SPOOL_CHUNK: usize = 64 * 1024;
const MIB: f64 = 1024.0 * 1024.0;
const DAY_SECS: f64 = 24.0 * 3600.0;

/// Writes between two eviction passes.
pub const EVICTION_INTERVAL: usize = 100;

/// Snapshot of the cache directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    /// Free space on the cache's filesystem, when the platform reports it.
    pub free_bytes: Option<u64>,
    pub oldest_age_secs: u64,
}

/// What one eviction pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Eviction {
    pub removed: usize,
    pub freed_bytes: u64,
}

#[derive(Debug)]
struct Entry {
    path: PathBuf,
    bytes: u64,
    age: Duration,
}

#[derive(Debug)]
pub struct ContentCache {
    cache_dir: PathBuf,
    max_age: Duration,
    max_bytes: u64,
    min_free_bytes: u64,
    writes: AtomicUsize,
}

fn mb_to_bytes(mb: f64) -> u64 {
    (mb.max(0.0) * MIB) as u64
}

fn days_to_duration(days: f64) -> Duration {
    Duration::try_from_secs_f64(days * DAY_SECS).unwrap_or(if days > 0.0 { Duration::MAX } else { Duration::ZERO })
}

fn age_of(modified: SystemTime) -> Duration {
    // Timestamps in the future count as brand new.
    SystemTime::now().duration_since(modified).unwrap_or_default()
}

impl ContentCache {
    /// Open (and create) the cache directory named by `config`, defaulting to
    /// the platform cache directory.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let cache_dir = match &config.cache_dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("mimepack")
                .join("conversions"),
        };

        fs::create_dir_all(&cache_dir).map_err(|e| {
            MimepackError::cache_with_source(format!("Failed to create cache directory {}", cache_dir.display()), e)
        })?;

        Ok(Self {
            cache_dir,
            max_age: days_to_duration(config.max_age_days),
            max_bytes: mb_to_bytes(config.max_size_mb),
            min_free_bytes: mb_to_bytes(config.min_free_space_mb),
            writes: AtomicUsize::new(0),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf> {
        if !validate_cache_key(key) {
            return Err(MimepackError::cache(format!("Invalid cache key: {}", key)));
        }
        Ok(self.cache_dir.join(format!("{}.{}", key, ENTRY_EXTENSION)))
    }

    /// Path of a fresh entry for `key`, or `None` on a miss.
    ///
    /// Expired entries are removed on sight.
    pub fn get(&self, key: &str) -> Result<Option<PathBuf>> {
        let path = self.entry_path(key)?;
        let modified = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta.modified()?,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if age_of(modified) > self.max_age {
            discard(&path)?;
            return Ok(None);
        }
        Ok(Some(path))
    }

    /// Store the file at `source` under `key`.
    pub fn put(&self, key: &str, source: &Path) -> Result<()> {
        let path = self.entry_path(key)?;

        let mut reader = fs::File::open(source)?;
        let mut staged = tempfile::Builder::new()
            .prefix(".incoming-")
            .tempfile_in(&self.cache_dir)?;
        std::io::copy(&mut reader, staged.as_file_mut())?;
        staged.as_file().sync_all()?;
        staged
            .persist(&path)
            .map_err(|e| MimepackError::cache_with_source("Failed to commit cache entry", e.error))?;

        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % EVICTION_INTERVAL == 0 {
            match self.evict() {
                Ok(eviction) if eviction.removed > 0 => {
                    tracing::debug!(removed = eviction.removed, freed_bytes = eviction.freed_bytes, "Cache eviction finished");
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("Cache eviction failed: {}", e),
            }
        }
        Ok(())
    }

    /// Committed entries, oldest first.
    fn entries(&self) -> Result<Vec<Entry>> {
        let listing = fs::read_dir(&self.cache_dir)
            .map_err(|e| MimepackError::cache_with_source("Failed to read cache directory", e))?;

        let mut entries: Vec<Entry> = listing
            .filter_map(|dirent| dirent.ok())
            .filter_map(|dirent| {
                let path = dirent.path();
                let stem = path.file_stem()?.to_str()?;
                let is_entry = path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION) && validate_cache_key(stem);
                if !is_entry {
                    return None;
                }
                let meta = dirent.metadata().ok().filter(|m| m.is_file())?;
                Some(Entry {
                    bytes: meta.len(),
                    age: age_of(meta.modified().ok()?),
                    path,
                })
            })
            .collect();
        entries.sort_by(|a, b| b.age.cmp(&a.age).then_with(|| a.path.cmp(&b.path)));
        Ok(entries)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let entries = self.entries()?;
        Ok(CacheStats {
            entries: entries.len(),
            total_bytes: entries.iter().map(|e| e.bytes).sum(),
            free_bytes: free_bytes(&self.cache_dir),
            oldest_age_secs: entries.first().map_or(0, |e| e.age.as_secs()),
        })
    }

    /// Drop expired entries, then the oldest until the cache fits its budget.
    ///
    /// Over the size limit the cache shrinks to 80% of it; when the disk is
    /// short of the configured free space, to half.
    pub fn evict(&self) -> Result<Eviction> {
        let entries = self.entries()?;
        let mut kept: u64 = entries.iter().map(|e| e.bytes).sum();

        let low_disk = free_bytes(&self.cache_dir).is_some_and(|free| free < self.min_free_bytes);
        let budget = if low_disk {
            self.max_bytes / 2
        } else if kept > self.max_bytes {
            self.max_bytes / 10 * 8
        } else {
            u64::MAX
        };

        let mut eviction = Eviction::default();
        for entry in entries {
            if entry.age <= self.max_age && kept <= budget {
                continue;
            }
            match discard(&entry.path) {
                Ok(()) => {
                    kept = kept.saturating_sub(entry.bytes);
                    eviction.removed += 1;
                    eviction.freed_bytes += entry.bytes;
                }
                Err(e) => tracing::debug!("Failed to evict {}: {}", entry.path.display(), e),
            }
        }
        Ok(eviction)
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<Eviction> {
        let mut eviction = Eviction::default();
        for entry in self.entries()? {
            discard(&entry.path)?;
            eviction.removed += 1;
            eviction.freed_bytes += entry.bytes;
        }
        Ok(eviction)
    }
}

/// Remove `path`; an entry already gone counts as removed.
fn discard(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Content key for converting `bytes` from `src_type` to `dst_type`.
pub fn cache_key(src_type: &str, dst_type: &str, bytes: &[u8]) -> String {
    let mut hasher = key_hasher(src_type, dst_type);
    hasher.update(bytes);
    hasher.finalize().to_hex().to_string()
}

fn key_hasher(src_type: &str, dst_type: &str) -> blake3::Hasher {
    let mut hasher = blake3::Hasher::new();
    hasher.update(src_type.as_bytes());
    hasher.update(b":");
    hasher.update(dst_type.as_bytes());
    hasher.update(b":");
    hasher
}

pub fn validate_cache_key(key: &str) -> bool {
    key.len() == blake3::OUT_LEN * 2 && key.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn free_bytes(dir: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(dir.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
        tracing::debug!("statvfs failed for {}", dir.display());
        return None;
    }
    #[allow(clippy::unnecessary_cast)]
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn free_bytes(_dir: &Path) -> Option<u64> {
    None
}

/// Consults a [`ContentCache`] before delegating to the wrapped converter.
///
/// The source is spooled to a temporary file while it is hashed, so the
/// inner converter still sees the full stream on a miss. A cache that cannot
/// be read or written degrades to plain conversion.
pub struct CachedConverter {
    inner: Arc<dyn Converter>,
    cache: Arc<ContentCache>,
}

impl CachedConverter {
    pub fn new(inner: Arc<dyn Converter>, cache: Arc<ContentCache>) -> Self {
        Self { inner, cache }
    }

    /// Wrap `inner` when its output is cacheable, else return it unchanged.
    pub fn wrap(inner: Arc<dyn Converter>, cache: Option<&Arc<ContentCache>>) -> Arc<dyn Converter> {
        match cache {
            Some(cache) if inner.cacheable() => Arc::new(Self::new(inner, Arc::clone(cache))),
            _ => inner,
        }
    }

    /// Run a cache operation on the blocking pool.
    async fn with_cache<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ContentCache) -> Result<T> + Send + 'static,
    {
        let cache = Arc::clone(&self.cache);
        tokio::task::spawn_blocking(move || op(&cache))
            .await
            .map_err(|e| MimepackError::cache_with_source("Cache task failed", e))?
    }
}

impl Plugin for CachedConverter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }
}

#[async_trait]
impl Converter for CachedConverter {
    async fn convert(
        &self,
        cancel: &CancellationToken,
        dest: &Path,
        mut source: SourceReader,
        content_type: &str,
    ) -> Result<()> {
        let spool = tempfile::Builder::new().prefix("mimepack-spool-").tempfile()?;
        let mut hasher = key_hasher(content_type, self.inner.output_type());
        {
            let mut writer = tokio::fs::File::create(spool.path()).await?;
            let mut buf = vec![0u8; SPOOL_CHUNK];
            loop {
                if cancel.is_cancelled() {
                    return Err(MimepackError::Cancelled);
                }
                let n = source.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                writer.write_all(&buf[..n]).await?;
            }
            writer.flush().await?;
        }
        let key = hasher.finalize().to_hex().to_string();

        let lookup_key = key.clone();
        match self.with_cache(move |cache| cache.get(&lookup_key)).await {
            Ok(Some(hit)) => match tokio::fs::copy(&hit, dest).await {
                Ok(_) => {
                    tracing::debug!(converter = self.inner.name(), key = %key, "Cache hit");
                    return Ok(());
                }
                Err(e) => tracing::warn!("Failed to read cache entry {}: {}", hit.display(), e),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!("Cache lookup failed: {}", e),
        }

        let spooled: SourceReader = Box::new(tokio::fs::File::open(spool.path()).await?);
        self.inner.convert(cancel, dest, spooled, content_type).await?;

        let store_key = key.clone();
        let produced = dest.to_path_buf();
        if let Err(e) = self.with_cache(move |cache| cache.put(&store_key, &produced)).await {
            tracing::warn!("Failed to store cache entry {}: {}", key, e);
        }
        Ok(())
    }

    fn output_type(&self) -> &str {
        self.inner.output_type()
    }

    fn cacheable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::converter::write_source;
    use tempfile::tempdir;

    fn cache_with(dir: &Path, max_size_mb: f64, min_free_space_mb: f64) -> ContentCache {
        ContentCache::new(&CacheConfig {
            enabled: true,
            cache_dir: Some(dir.to_path_buf()),
            max_age_days: 30.0,
            max_size_mb,
            min_free_space_mb,
        })
        .unwrap()
    }

    fn cache_in(dir: &Path) -> ContentCache {
        cache_with(dir, 500.0, 0.0)
    }

    fn fill(cache: &ContentCache, scratch: &Path, count: u8, bytes: usize) {
        let src = scratch.join("payload");
        fs::write(&src, vec![0u8; bytes]).unwrap();
        for i in 0..count {
            cache.put(&cache_key("a/b", "c/d", &[i]), &src).unwrap();
        }
    }

    struct CountingConverter {
        calls: AtomicUsize,
    }

    impl Plugin for CountingConverter {
        fn name(&self) -> &str {
            "counting"
        }
    }

    #[async_trait]
    impl Converter for CountingConverter {
        async fn convert(&self, _: &CancellationToken, dest: &Path, source: SourceReader, _: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            write_source(dest, source).await?;
            Ok(())
        }
    }

    #[test]
    fn test_cache_key_depends_on_types() {
        let a = cache_key("text/plain", "application/pdf", b"abc");
        let b = cache_key("text/html", "application/pdf", b"abc");
        assert_ne!(a, b);
        assert_eq!(a, cache_key("text/plain", "application/pdf", b"abc"));
        assert!(validate_cache_key(&a));
        assert!(!validate_cache_key("not-a-key"));
    }

    #[test]
    fn test_put_then_get() {
        let dir = tempdir().unwrap();
        let cache = cache_in(dir.path());
        let key = cache_key("text/plain", "application/pdf", b"hello");

        assert!(cache.get(&key).unwrap().is_none());

        let src = dir.path().join("source.pdf");
        fs::write(&src, b"converted").unwrap();
        cache.put(&key, &src).unwrap();

        let hit = cache.get(&key).unwrap().unwrap();
        assert_eq!(fs::read(hit).unwrap(), b"converted");
    }

    #[test]
    fn test_invalid_key_rejected() {
        let dir = tempdir().unwrap();
        let cache = cache_in(dir.path());
        assert!(matches!(cache.get("../escape"), Err(MimepackError::Cache { .. })));
    }

    #[test]
    fn test_stats_ignore_foreign_files() {
        let dir = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let cache = cache_in(dir.path());
        fill(&cache, scratch.path(), 3, 2048);
        fs::write(dir.path().join("notes.bin"), b"not an entry").unwrap();
        fs::write(dir.path().join(".incoming-stale"), b"half written").unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.total_bytes, 3 * 2048);

        let cleared = cache.clear().unwrap();
        assert_eq!(cleared, Eviction { removed: 3, freed_bytes: 3 * 2048 });
        assert_eq!(cache.stats().unwrap().entries, 0);
        assert!(dir.path().join("notes.bin").exists());
    }

    #[test]
    fn test_eviction_shrinks_to_budget() {
        let dir = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        // 10 KiB limit, four 4 KiB entries: shrink to 8 KiB.
        let cache = cache_with(dir.path(), 10.0 / 1024.0, 0.0);
        fill(&cache, scratch.path(), 4, 4096);

        let eviction = cache.evict().unwrap();
        assert_eq!(eviction.removed, 2);
        assert_eq!(eviction.freed_bytes, 8192);
        assert_eq!(cache.stats().unwrap().entries, 2);
        assert_eq!(cache.evict().unwrap(), Eviction::default());
    }

    #[test]
    fn test_eviction_under_disk_pressure_halves_budget() {
        let dir = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let cache = cache_with(dir.path(), 10.0 / 1024.0, f64::MAX);
        fill(&cache, scratch.path(), 2, 4096);

        if cache.stats().unwrap().free_bytes.is_none() {
            return;
        }
        // Within the size limit, but the disk never has enough room: keep at most 5 KiB.
        let eviction = cache.evict().unwrap();
        assert_eq!(eviction.removed, 1);
        assert_eq!(cache.stats().unwrap().entries, 1);
    }

    #[tokio::test]
    async fn test_cached_converter_runs_inner_once() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(cache_in(&dir.path().join("cache")));
        let inner = Arc::new(CountingConverter {
            calls: AtomicUsize::new(0),
        });
        let cached = CachedConverter::new(inner.clone(), cache);
        let cancel = CancellationToken::new();

        let first = dir.path().join("first.pdf");
        let second = dir.path().join("second.pdf");
        for dest in [&first, &second] {
            let source: SourceReader = Box::new(std::io::Cursor::new(b"same bytes".to_vec()));
            cached.convert(&cancel, dest, source, "text/plain").await.unwrap();
        }

        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_cached_converter_concurrent_on_single_thread() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(cache_in(&dir.path().join("cache")));
        let inner = Arc::new(CountingConverter {
            calls: AtomicUsize::new(0),
        });
        let cached = Arc::new(CachedConverter::new(inner.clone(), cache));

        for round in 0..2 {
            let mut tasks = tokio::task::JoinSet::new();
            for i in 0..4u8 {
                let cached = Arc::clone(&cached);
                let dest = dir.path().join(format!("r{}-{}.pdf", round, i));
                tasks.spawn(async move {
                    let source: SourceReader = Box::new(std::io::Cursor::new(vec![b'a' + i; 32]));
                    cached.convert(&CancellationToken::new(), &dest, source, "text/plain").await
                });
            }
            while let Some(done) = tasks.join_next().await {
                done.unwrap().unwrap();
            }
        }

        assert_eq!(inner.calls.load(Ordering::SeqCst), 4, "second round should be served from the cache");
        assert_eq!(fs::read(dir.path().join("r1-2.pdf")).unwrap(), vec![b'c'; 32]);
    }

    #[tokio::test]
    async fn test_wrap_skips_uncacheable() {
        use crate::converters::PassthroughConverter;

        let dir = tempdir().unwrap();
        let cache = Arc::new(cache_in(dir.path()));
        let wrapped = CachedConverter::wrap(Arc::new(PassthroughConverter), Some(&cache));
        assert_eq!(wrapped.name(), "pdf-passthrough");
        assert!(!wrapped.cacheable());
    }
}
