//! Single-entry TTL cache for the storage-unit result set. Reduces upstream
//! load when Prometheus scrapes faster than NetBackup storage inventory
//! actually changes.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

/// `get` serves a fresh entry lock-free; a stale or missing entry takes the
/// refresh lock so concurrent callers collapse into one upstream fetch.
pub struct TtlCache<T> {
    ttl: Duration,
    entry: AsyncMutex<Option<Entry<T>>>,
    last_refresh: Mutex<Option<Instant>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: AsyncMutex::new(None),
            last_refresh: Mutex::new(None),
        }
    }

    /// Return the cached value if still fresh; otherwise call `fetch` to
    /// repopulate it. Only one `fetch` runs at a time per cache, even under
    /// concurrent callers, because they all contend on the same async
    /// mutex guarding the entry.
    pub async fn get<F, Fut, E>(&self, fetch: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut guard = self.entry.lock().await;
        if let Some(entry) = guard.as_ref() {
            if entry.expires_at > Instant::now() {
                return Ok(entry.value.clone());
            }
        }

        let value = fetch().await?;
        *guard = Some(Entry {
            value: value.clone(),
            expires_at: Instant::now() + self.ttl,
        });
        *self.last_refresh.lock().unwrap() = Some(Instant::now());
        Ok(value)
    }

    /// Unix-seconds timestamp of the last successful refresh, if any.
    pub fn last_refresh_unix_seconds(&self) -> Option<u64> {
        let instant = (*self.last_refresh.lock().unwrap())?;
        let elapsed = instant.elapsed();
        let now = std::time::SystemTime::now();
        now.checked_sub(elapsed)
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
    }

    /// Drop the cached entry. `last_refresh` is left untouched so freshness
    /// reporting stays truthful about the last time we actually had data,
    /// until the next successful refresh replaces it.
    pub async fn flush(&self) {
        let mut guard = self.entry.lock().await;
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn serves_cached_value_within_ttl() {
        let cache = TtlCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let v: Result<u32, ()> = cache
                .get(|| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await;
            assert_eq!(v.unwrap(), 42);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refetches_after_ttl_expires() {
        let cache = TtlCache::new(Duration::from_millis(10));
        let calls = Arc::new(AtomicUsize::new(0));

        let calls1 = calls.clone();
        cache
            .get(|| async move {
                calls1.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ()>(1)
            })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(30)).await;

        let calls2 = calls.clone();
        let v = cache
            .get(|| async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ()>(2)
            })
            .await
            .unwrap();

        assert_eq!(v, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn error_does_not_populate_cache_or_update_last_refresh() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60));
        let err: Result<u32, &'static str> = cache.get(|| async { Err("upstream down") }).await;
        assert!(err.is_err());
        assert!(cache.last_refresh_unix_seconds().is_none());

        let ok = cache.get(|| async { Ok::<_, &'static str>(7) }).await;
        assert_eq!(ok.unwrap(), 7);
        assert!(cache.last_refresh_unix_seconds().is_some());
    }

    #[tokio::test]
    async fn flush_forces_refetch_but_keeps_last_refresh_stamp() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.get(|| async { Ok::<_, ()>(1) }).await.unwrap();
        let stamp_before = cache.last_refresh_unix_seconds();

        cache.flush().await;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        cache
            .get(|| async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ()>(2)
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(stamp_before.is_some());
    }
}
