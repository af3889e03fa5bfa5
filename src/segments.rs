//! Server-side decryption pipeline for fMP4 segments.
//!
//! Init segments are cached for ten minutes; decrypted media segments for
//! thirty seconds, which covers a player re-requesting a segment and the
//! segments fetched ahead of it. After each decrypt the next few numbered
//! segments (`seg-41.m4s` → `seg-42.m4s` ...) are fetched and decrypted in the
//! background. Concurrent requests for the same segment share one upstream
//! fetch.

use std::time::Duration;

use bytes::Bytes;
use moka::future::Cache;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;
use url::Url;

use crate::drm::{cenc, DrmDescriptor};
use crate::error::{ProxyError, Result};
use crate::fingerprint::RequestKind;
use crate::relay::StreamRelay;
use crate::stream::request::HeaderOverrides;
use crate::stream::Service;

const INIT_CACHE_CAPACITY: u64 = 64;
const INIT_CACHE_TTL: Duration = Duration::from_secs(600);

const SEGMENT_CACHE_CAPACITY: u64 = 50;
const SEGMENT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Segments fetched ahead of the one just served.
pub const PREFETCH_AHEAD: u64 = 3;

static SEGMENT_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-_](\d+)\.[A-Za-z0-9]+$").expect("valid regex"));

/// One decrypted segment: where it came from and the key material used.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentKey {
    pub url: String,
    pub init_url: String,
    pub drm: DrmDescriptor,
}

/// Fetch, decrypt and cache. Cheap to clone; clones share both caches.
#[derive(Clone)]
pub struct SegmentDecryptor {
    relay: StreamRelay,
    inits: Cache<String, Bytes>,
    segments: Cache<SegmentKey, Bytes>,
    prefetch: bool,
}

impl SegmentDecryptor {
    pub fn new(relay: StreamRelay) -> Self {
        Self {
            relay,
            inits: Cache::builder()
                .max_capacity(INIT_CACHE_CAPACITY)
                .time_to_live(INIT_CACHE_TTL)
                .build(),
            segments: Cache::builder()
                .max_capacity(SEGMENT_CACHE_CAPACITY)
                .time_to_live(SEGMENT_CACHE_TTL)
                .build(),
            prefetch: true,
        }
    }

    #[must_use]
    pub fn with_prefetch(mut self, prefetch: bool) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Raw init segment, from cache when possible.
    pub async fn init_segment(&self, url: &str, headers: &HeaderOverrides) -> Result<Bytes> {
        if let Some(init) = self.inits.get(url).await {
            return Ok(init);
        }
        let fetched = self
            .relay
            .fetch(url, Service::detect(url), RequestKind::Media, headers)
            .await?;
        self.inits.insert(url.to_string(), fetched.body.clone()).await;
        Ok(fetched.body)
    }

    /// Clear media segment for `key`, then prefetch the ones after it.
    pub async fn segment(&self, key: SegmentKey, headers: &HeaderOverrides) -> Result<Bytes> {
        let clear = self.load(key.clone(), headers).await?;
        if self.prefetch {
            self.prefetch_after(&key, headers);
        }
        Ok(clear)
    }

    async fn load(&self, key: SegmentKey, headers: &HeaderOverrides) -> Result<Bytes> {
        let fetch = async {
            let (init, segment) = tokio::try_join!(
                self.init_segment(&key.init_url, headers),
                self.relay
                    .fetch(&key.url, Service::detect(&key.url), RequestKind::Media, headers),
            )?;
            cenc::decrypt_segment(&init, &segment.body, &key.drm).map(Bytes::from)
        };
        self.segments
            .try_get_with(key.clone(), fetch)
            .await
            .map_err(|err| ProxyError::clone(&err))
    }

    fn prefetch_after(&self, key: &SegmentKey, headers: &HeaderOverrides) {
        for url in next_segment_urls(&key.url, PREFETCH_AHEAD) {
            let next = SegmentKey {
                url,
                ..key.clone()
            };
            if self.segments.contains_key(&next) {
                continue;
            }
            let this = self.clone();
            let headers = headers.clone();
            tokio::spawn(async move {
                match this.load(next.clone(), &headers).await {
                    Ok(clear) => debug!(url = %next.url, bytes = clear.len(), "prefetched segment"),
                    Err(err) => debug!(url = %next.url, error = %err, "segment prefetch failed"),
                }
            });
        }
    }

    /// Decrypted segments currently held.
    pub async fn cached_segments(&self) -> u64 {
        self.segments.run_pending_tasks().await;
        self.segments.entry_count()
    }
}

/// URLs of the `count` segments after `url`, when its file name ends in a
/// separator and a sequence number. Zero padding is kept.
pub fn next_segment_urls(url: &str, count: u64) -> Vec<String> {
    let Ok(mut parsed) = Url::parse(url) else {
        return Vec::new();
    };
    let path = parsed.path().to_string();
    let Some(digits) = SEGMENT_NUMBER.captures(&path).and_then(|c| c.get(1)) else {
        return Vec::new();
    };
    let Ok(current) = digits.as_str().parse::<u64>() else {
        return Vec::new();
    };
    let width = digits.as_str().len();
    let (prefix, suffix) = (&path[..digits.start()], &path[digits.end()..]);

    (1..=count)
        .filter_map(|step| current.checked_add(step))
        .map(|number| {
            parsed.set_path(&format!("{prefix}{number:0width$}{suffix}"));
            parsed.to_string()
        })
        .collect()
}
