//! Passthrough resolver for URLs that are already playable.
//!
//! The URL is kept as is (redirector links are followed once). Client
//! header overrides are forwarded, `Referer`/`Origin` default to the target
//! origin, and the media kind comes from the extension or a sniff of the response.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE, RANGE};
use tracing::{debug, warn};

use crate::error::StageContext;
use crate::fingerprint::RequestKind;
use crate::http_client::UpstreamClient;
use crate::stream::request::{HeaderOverrides, SourceRequest};
use crate::stream::resolver::{origin_of, MediaKind, ResolvedStream, StepResult, StreamResolver};
use crate::stream::Service;

/// Referer expected by add-on redirectors.
const REDIRECTOR_REFERER: &str = "https://strem.io/";

#[derive(Debug, Default)]
pub struct GenericResolver;

impl GenericResolver {
    pub fn new() -> Self {
        Self
    }
}

/// Add-on style URLs that answer with a redirect to the real file.
fn is_redirector(url: &str) -> bool {
    let lowered = url.to_ascii_lowercase();
    lowered.contains("/resolve/") || lowered.contains("torrentio")
}

/// Header set sent upstream. Player user agents (VLC, libmpv, ExoPlayer)
/// are replaced by the browser profile; everything else passes through.
fn upstream_headers(request: &SourceRequest) -> HeaderOverrides {
    let mut headers = HeaderOverrides::new();
    for (name, value) in request.headers.iter() {
        if name == "user-agent" {
            let lowered = value.to_ascii_lowercase();
            if lowered.contains("chrome") || lowered.contains("applewebkit") || lowered.contains("firefox") {
                headers.insert(name, value);
            }
            continue;
        }
        headers.insert(name, value);
    }

    if is_redirector(&request.url) {
        headers.insert_default("referer", REDIRECTOR_REFERER);
    } else if let Some(origin) = origin_of(&request.url) {
        headers.insert_default("referer", &origin);
        headers.insert_default("origin", &origin);
    }
    headers
}

#[async_trait]
impl StreamResolver for GenericResolver {
    fn service(&self) -> Service {
        Service::Generic
    }

    async fn resolve(
        &self,
        request: &SourceRequest,
        client: &UpstreamClient,
    ) -> StepResult<ResolvedStream> {
        let headers = upstream_headers(request);
        let mut url = request.url.clone();

        if is_redirector(&url) {
            match follow_redirects(client, &url, &headers).await {
                Ok(target) => {
                    debug!(from = %url, to = %target, "followed redirector");
                    url = target;
                }
                Err(e) => warn!(url = %url, error = %e, "redirector did not resolve, keeping original URL"),
            }
        }

        let kind = match MediaKind::from_url(&url) {
            Some(kind) => kind,
            None => sniff_kind(client, &url, &headers).await.unwrap_or(MediaKind::Hls),
        };

        Ok(ResolvedStream::new(Service::Generic, url, kind).with_headers(&headers))
    }
}

async fn follow_redirects(
    client: &UpstreamClient,
    url: &str,
    headers: &HeaderOverrides,
) -> StepResult<String> {
    let mut extra = headers.to_header_map();
    extra.remove(RANGE);
    let response = client
        .get(url, Service::Generic, RequestKind::Page, &extra)
        .stage("follow redirector")?
        .send()
        .await
        .stage("follow redirector")?;
    Ok(response.url().to_string())
}

/// Content type first, then the first body chunk. `None` when the upstream
/// gives no usable signal; the relay decides later.
async fn sniff_kind(client: &UpstreamClient, url: &str, headers: &HeaderOverrides) -> Option<MediaKind> {
    let extra: HeaderMap = headers.to_header_map();
    let mut response = client
        .get(url, Service::Generic, RequestKind::Media, &extra)
        .ok()?
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    let from_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(MediaKind::from_content_type);
    if from_type.is_some() {
        return from_type;
    }
    let chunk = response.chunk().await.ok()??;
    MediaKind::sniff(&chunk)
}
