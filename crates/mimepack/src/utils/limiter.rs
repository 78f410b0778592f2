//! Process-wide limit on simultaneous external converter invocations.
//!
//! Tokens are acquired right before a converter runs and returned as soon as
//! it finishes, never across a recursive sub-pipeline, so nested messages can
//! never deadlock waiting on permits held by their parents.
//!
//! # Example
//!
//! ```rust
//! use mimepack::utils::limiter::ConcurrencyLimiter;
//!
//! # tokio_test::block_on(async {
//! let limiter = ConcurrencyLimiter::new(2);
//! let mut token = limiter.acquire().await.unwrap();
//! assert_eq!(limiter.available(), 1);
//! token.release();
//! token.release(); // stale release is a no-op
//! assert_eq!(limiter.available(), 2);
//! # });
//! ```

use crate::error::{MimepackError, Result};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting limiter backed by a tokio semaphore.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A held slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct LimiterToken {
    permit: Option<OwnedSemaphorePermit>,
}

impl LimiterToken {
    /// Return the slot early. Calling this on an already released token does nothing.
    pub fn release(&mut self) {
        self.permit.take();
    }

    pub fn is_held(&self) -> bool {
        self.permit.is_some()
    }
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<LimiterToken> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| MimepackError::Other("concurrency limiter closed".to_string()))?;
        Ok(LimiterToken { permit: Some(permit) })
    }

    /// Return `token`'s slot; stale tokens are accepted.
    pub fn release(&self, mut token: LimiterToken) {
        token.release();
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

static GLOBAL_LIMITER: OnceCell<ConcurrencyLimiter> = OnceCell::new();

/// The process-wide limiter. The first caller fixes its capacity.
pub fn global(capacity: usize) -> ConcurrencyLimiter {
    let limiter = GLOBAL_LIMITER.get_or_init(|| ConcurrencyLimiter::new(capacity));
    if limiter.capacity() != capacity.max(1) {
        tracing::debug!(
            requested = capacity,
            capacity = limiter.capacity(),
            "Global limiter already sized; requested capacity ignored"
        );
    }
    limiter.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_and_drop_releases() {
        let limiter = ConcurrencyLimiter::new(1);
        {
            let _token = limiter.acquire().await.unwrap();
            assert_eq!(limiter.available(), 0);
        }
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn test_stale_release_is_harmless() {
        let limiter = ConcurrencyLimiter::new(2);
        let mut token = limiter.acquire().await.unwrap();
        token.release();
        assert!(!token.is_held());
        limiter.release(token);
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_clamped() {
        let limiter = ConcurrencyLimiter::new(0);
        assert_eq!(limiter.capacity(), 1);
    }

    #[tokio::test]
    async fn test_never_exceeds_capacity() {
        let limiter = ConcurrencyLimiter::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tasks.spawn(async move {
                let _token = limiter.acquire().await.unwrap();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        while tasks.join_next().await.is_some() {}

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(limiter.available(), 3);
    }

    struct Capture(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_global_is_shared() {
        let a = global(4);
        let b = global(99);
        assert_eq!(a.capacity(), b.capacity());
    }

    #[test]
    fn test_global_logs_ignored_capacity() {
        let fixed = global(4).capacity();
        let captured = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || Capture(Arc::clone(&sink)))
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            assert_eq!(global(fixed).capacity(), fixed);
            assert_eq!(global(fixed + 7).capacity(), fixed);
        });

        let logs = String::from_utf8_lossy(&captured.lock()).into_owned();
        assert_eq!(logs.matches("requested capacity ignored").count(), 1);
        assert!(logs.contains(&format!("requested={}", fixed + 7)));
    }
}
