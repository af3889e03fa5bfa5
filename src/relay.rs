//! Upstream fetches for manifests, keys and segments.
//!
//! Every fetch goes through the same retry loop: transport failures and 5xx
//! answers are retried with exponential backoff up to
//! [`RelayPolicy::max_retries`] times, 4xx answers are returned at once as
//! [`ProxyError::UpstreamRejected`]. Segment bodies are handed back as the
//! live [`reqwest::Response`] so the server can stream them; dropping the
//! response (client gone) closes the upstream read.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, RANGE};
use reqwest::{Response, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::config::RelayPolicy;
use crate::error::{ProxyError, Result};
use crate::fingerprint::RequestKind;
use crate::http_client::UpstreamClient;
use crate::stream::request::HeaderOverrides;
use crate::stream::Service;

/// Response headers copied from upstream to the client.
const PASSTHROUGH_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "content-range",
    "accept-ranges",
    "last-modified",
    "etag",
    "cache-control",
];

/// A fully read upstream body and the URL it came from after redirects.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub url: Url,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl Fetched {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Retrying upstream fetcher shared by every relay endpoint.
#[derive(Clone)]
pub struct StreamRelay {
    client: Arc<UpstreamClient>,
    policy: RelayPolicy,
}

impl StreamRelay {
    pub fn new(client: Arc<UpstreamClient>) -> Self {
        let policy = client.policy().clone();
        Self { client, policy }
    }

    pub fn client(&self) -> &UpstreamClient {
        &self.client
    }

    /// Delay before retry number `attempt` (1-based).
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.policy.base_delay.saturating_mul(factor).min(self.policy.max_delay)
    }

    /// Open `url` and return the response once headers arrive. The body is
    /// not read.
    pub async fn open(
        &self,
        url: &str,
        service: Service,
        kind: RequestKind,
        headers: &HeaderOverrides,
        range: Option<&HeaderValue>,
    ) -> Result<Response> {
        let mut extra = headers.to_header_map();
        if let Some(range) = range {
            extra.insert(RANGE, range.clone());
        }

        let mut attempt = 0;
        loop {
            let request = self.client.get(url, service, kind, &extra)?;
            let failure = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    if attempt > 0 {
                        debug!(url = %url, attempt, "upstream recovered after retry");
                    }
                    return Ok(resp);
                }
                Ok(resp) if resp.status().is_client_error() => {
                    debug!(url = %url, status = resp.status().as_u16(), "upstream rejected request");
                    return Err(ProxyError::UpstreamRejected {
                        status: resp.status().as_u16(),
                    });
                }
                Ok(resp) => ProxyError::unavailable(format!("upstream returned HTTP {}", resp.status())),
                Err(err) => ProxyError::from_transport(&err),
            };

            if attempt >= self.policy.max_retries {
                warn!(url = %url, attempts = attempt + 1, error = %failure, "upstream unavailable");
                return Err(failure);
            }
            attempt += 1;
            let delay = self.backoff(attempt);
            debug!(url = %url, attempt, delay_ms = delay.as_millis() as u64, error = %failure, "retrying upstream fetch");
            tokio::time::sleep(delay).await;
        }
    }

    /// Fetch a small body (manifest, key, init segment) into memory.
    pub async fn fetch(
        &self,
        url: &str,
        service: Service,
        kind: RequestKind,
        headers: &HeaderOverrides,
    ) -> Result<Fetched> {
        let resp = self.open(url, service, kind, headers, None).await?;
        let final_url = resp.url().clone();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await.map_err(|e| ProxyError::from_transport(&e))?;
        Ok(Fetched {
            url: final_url,
            content_type,
            body,
        })
    }
}

/// Headers worth forwarding to the client. `Content-Length` is dropped when
/// the body was transparently decompressed.
pub fn passthrough_headers(upstream: &HeaderMap) -> HeaderMap {
    let decoded = upstream.contains_key(CONTENT_ENCODING);
    let mut out = HeaderMap::new();
    for name in PASSTHROUGH_HEADERS {
        if decoded && *name == CONTENT_LENGTH.as_str() {
            continue;
        }
        if let Some(value) = upstream.get(*name) {
            out.insert(*name, value.clone());
        }
    }
    out
}

/// Status to answer the client with for a successful upstream response.
pub fn client_status(upstream: StatusCode) -> StatusCode {
    if upstream == StatusCode::PARTIAL_CONTENT {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use axum::extract::State;
    use axum::http::HeaderMap as AxumHeaders;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn relay(retries: u32) -> StreamRelay {
        let mut config = ProxyConfig::default();
        config.relay.max_retries = retries;
        config.relay.base_delay = Duration::from_millis(5);
        StreamRelay::new(Arc::new(UpstreamClient::new(&config).unwrap()))
    }

    #[tokio::test]
    async fn test_retries_5xx_then_succeeds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/seg.ts",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                        (StatusCode::BAD_GATEWAY, "down")
                    } else {
                        (StatusCode::OK, "segment")
                    }
                }),
            )
            .with_state(hits.clone());
        let base = serve(app).await;

        let fetched = relay(2)
            .fetch(&format!("{base}/seg.ts"), Service::Generic, RequestKind::Media, &HeaderOverrides::new())
            .await
            .unwrap();
        assert_eq!(&fetched.body[..], b"segment");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_retries() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/seg.ts",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    StatusCode::SERVICE_UNAVAILABLE
                }),
            )
            .with_state(hits.clone());
        let base = serve(app).await;

        let err = relay(2)
            .fetch(&format!("{base}/seg.ts"), Service::Generic, RequestKind::Media, &HeaderOverrides::new())
            .await
            .unwrap_err();
        assert_eq!(err.category(), "upstream_unavailable");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_4xx_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/gone.ts",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    StatusCode::NOT_FOUND
                }),
            )
            .with_state(hits.clone());
        let base = serve(app).await;

        let err = relay(3)
            .fetch(&format!("{base}/gone.ts"), Service::Generic, RequestKind::Media, &HeaderOverrides::new())
            .await
            .unwrap_err();
        assert_eq!(err, ProxyError::UpstreamRejected { status: 404 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_headers_and_range_forwarded() {
        let app = Router::new().route(
            "/file.mp4",
            get(|headers: AxumHeaders| async move {
                let referer = headers.get("referer").and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
                let range = headers.get("range").and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
                (
                    StatusCode::PARTIAL_CONTENT,
                    [("content-range", "bytes 0-3/10"), ("x-internal", "1")],
                    format!("{referer}|{range}"),
                )
            }),
        );
        let base = serve(app).await;

        let mut headers = HeaderOverrides::new();
        headers.insert("referer", "https://site.example/");
        let range = HeaderValue::from_static("bytes=0-3");
        let resp = relay(0)
            .open(&format!("{base}/file.mp4"), Service::Generic, RequestKind::Media, &headers, Some(&range))
            .await
            .unwrap();
        assert_eq!(client_status(resp.status()), StatusCode::PARTIAL_CONTENT);
        let forwarded = passthrough_headers(resp.headers());
        assert_eq!(forwarded["content-range"], "bytes 0-3/10");
        assert!(forwarded.get("x-internal").is_none());
        assert_eq!(resp.text().await.unwrap(), "https://site.example/|bytes=0-3");
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        let err = relay(1)
            .fetch("http://127.0.0.1:9/x.ts", Service::Generic, RequestKind::Media, &HeaderOverrides::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamUnavailable { .. }));
    }

    #[test]
    fn test_backoff_is_capped() {
        let relay = relay(5);
        assert_eq!(relay.backoff(1), Duration::from_millis(5));
        assert_eq!(relay.backoff(3), Duration::from_millis(20));
        assert_eq!(relay.backoff(30), relay.policy.max_delay);
    }

    #[test]
    fn test_passthrough_drops_length_when_decoded() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-type", HeaderValue::from_static("video/mp2t"));
        upstream.insert("content-length", HeaderValue::from_static("100"));
        upstream.insert("content-encoding", HeaderValue::from_static("gzip"));
        upstream.insert("set-cookie", HeaderValue::from_static("a=b"));
        let out = passthrough_headers(&upstream);
        assert_eq!(out.len(), 1);
        assert_eq!(out["content-type"], "video/mp2t");
    }
}
