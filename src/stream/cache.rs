//! Extraction cache.
//!
//! Memoises resolver outcomes per [`CacheKey`]. Concurrent callers for one
//! key share a single in-flight resolution (moka's `get_with` coalesces
//! initialisers), successes live for the service TTL, failures for the
//! negative TTL, and the whole cache is bounded with LRU eviction.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::future::Cache;
use moka::policy::EvictionPolicy;
use moka::Expiry;
use tracing::debug;

use super::request::CacheKey;
use super::resolver::ResolvedStream;
use crate::config::CachePolicy;
use crate::error::{ProxyError, Result};

/// Lifecycle of a cached resolution. In-flight resolutions are not stored;
/// waiters park inside the cache until the entry lands as one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Ready,
    Failed,
}

/// One finished resolution.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub outcome: std::result::Result<Arc<ResolvedStream>, ProxyError>,
    pub created: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn state(&self) -> EntryState {
        if self.outcome.is_ok() {
            EntryState::Ready
        } else {
            EntryState::Failed
        }
    }

    pub fn is_expired(&self) -> bool {
        self.created.elapsed() >= self.ttl
    }
}

/// Per-entry expiry: the TTL chosen when the entry was created.
struct EntryExpiry;

impl Expiry<CacheKey, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

pub struct ExtractionCache {
    entries: Cache<CacheKey, CacheEntry>,
    policy: CachePolicy,
    resolutions: AtomicU64,
}

impl ExtractionCache {
    pub fn new(policy: CachePolicy) -> Self {
        let entries = Cache::builder()
            .max_capacity(policy.capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(EntryExpiry)
            .build();
        Self {
            entries,
            policy,
            resolutions: AtomicU64::new(0),
        }
    }

    /// Cached outcome for `key`, or run `resolve` exactly once across all
    /// concurrent callers and share its outcome.
    pub async fn get_or_resolve<F, Fut>(&self, key: &CacheKey, resolve: F) -> Result<Arc<ResolvedStream>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ResolvedStream>>,
    {
        let entry = self
            .entries
            .get_with(key.clone(), async {
                self.resolutions.fetch_add(1, Ordering::Relaxed);
                let outcome = resolve().await.map(Arc::new);
                let ttl = match &outcome {
                    Ok(_) => self.policy.ttl_for(key.service()),
                    Err(_) => self.policy.negative_ttl,
                };
                debug!(key = %key, ok = outcome.is_ok(), ttl_secs = ttl.as_secs_f64(), "cached resolution");
                CacheEntry {
                    outcome,
                    created: Instant::now(),
                    ttl,
                }
            })
            .await;
        entry.outcome
    }

    /// Current entry for `key`, without resolving.
    pub async fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.get(key).await.filter(|e| !e.is_expired())
    }

    /// Drop the entry for `key`; the next request resolves afresh.
    pub async fn invalidate(&self, key: &CacheKey) {
        debug!(key = %key, "invalidating cached resolution");
        self.entries.invalidate(key).await;
    }

    pub async fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
    }

    /// Entry count after pending evictions are applied.
    pub async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Resolutions started since creation (cache misses).
    pub fn resolutions(&self) -> u64 {
        self.resolutions.load(Ordering::Relaxed)
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::resolver::MediaKind;
    use crate::stream::Service;
    use std::sync::atomic::AtomicUsize;

    fn stream(url: &str) -> ResolvedStream {
        ResolvedStream::new(Service::Generic, url, MediaKind::Hls)
    }

    fn key(url: &str) -> CacheKey {
        CacheKey::new(url, Service::Generic)
    }

    fn short_policy(ttl_ms: u64, negative_ms: u64) -> CachePolicy {
        let mut policy = CachePolicy::default().with_ttl(Service::Generic, Duration::from_millis(ttl_ms));
        policy.negative_ttl = Duration::from_millis(negative_ms);
        policy
    }

    #[tokio::test]
    async fn test_single_flight_under_concurrency() {
        let cache = Arc::new(ExtractionCache::new(CachePolicy::default()));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_resolve(&key("https://a.example/live.m3u8"), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(stream("https://cdn.example/live.m3u8"))
                    })
                    .await
            }));
        }

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
        assert_eq!(cache.resolutions(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_share_failure() {
        let cache = Arc::new(ExtractionCache::new(CachePolicy::default()));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_resolve(&key("https://broken.example/"), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err(ProxyError::unavailable("connection reset"))
                    })
                    .await
            }));
        }
        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert_eq!(err, ProxyError::unavailable("connection reset"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entry_not_served_after_ttl() {
        let cache = ExtractionCache::new(short_policy(100, 100));
        let k = key("https://a.example/x.m3u8");

        cache.get_or_resolve(&k, || async { Ok(stream("https://v1/")) }).await.unwrap();
        let hit = cache.get_or_resolve(&k, || async { Ok(stream("https://v2/")) }).await.unwrap();
        assert_eq!(hit.url, "https://v1/");

        tokio::time::sleep(Duration::from_millis(250)).await;
        let fresh = cache.get_or_resolve(&k, || async { Ok(stream("https://v3/")) }).await.unwrap();
        assert_eq!(fresh.url, "https://v3/");
        assert_eq!(cache.resolutions(), 2);
    }

    #[tokio::test]
    async fn test_negative_cache_window() {
        let cache = ExtractionCache::new(short_policy(60_000, 150));
        let k = key("https://down.example/");

        let first = cache
            .get_or_resolve(&k, || async { Err(ProxyError::unavailable("503")) })
            .await;
        assert!(first.is_err());
        // Inside the window the failure is replayed without resolving.
        let replay = cache.get_or_resolve(&k, || async { Ok(stream("https://up/")) }).await;
        assert!(replay.is_err());
        assert_eq!(cache.peek(&k).await.unwrap().state(), EntryState::Failed);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let retried = cache.get_or_resolve(&k, || async { Ok(stream("https://up/")) }).await;
        assert_eq!(retried.unwrap().url, "https://up/");
        assert_eq!(cache.resolutions(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_resolution() {
        let cache = ExtractionCache::new(CachePolicy::default());
        let k = key("https://a.example/");
        cache.get_or_resolve(&k, || async { Ok(stream("https://old/")) }).await.unwrap();
        cache.invalidate(&k).await;
        assert!(cache.peek(&k).await.is_none());
        let fresh = cache.get_or_resolve(&k, || async { Ok(stream("https://new/")) }).await.unwrap();
        assert_eq!(fresh.url, "https://new/");
    }

    #[tokio::test]
    async fn test_equal_keys_after_normalisation_share_entry() {
        let cache = ExtractionCache::new(CachePolicy::default());
        cache
            .get_or_resolve(&key("https://A.example/x?b=1&a=2"), || async { Ok(stream("https://one/")) })
            .await
            .unwrap();
        let hit = cache
            .get_or_resolve(&key("https://a.example/x?a=2&b=1"), || async { Ok(stream("https://two/")) })
            .await
            .unwrap();
        assert_eq!(hit.url, "https://one/");
    }

    #[tokio::test]
    async fn test_capacity_bound() {
        let mut policy = CachePolicy::default();
        policy.capacity = 2;
        let cache = ExtractionCache::new(policy);
        for i in 0..5 {
            let url = format!("https://a.example/{i}");
            cache
                .get_or_resolve(&key(&url), || async move { Ok(stream(&url)) })
                .await
                .unwrap();
        }
        assert!(cache.len().await <= 2);
    }
}
