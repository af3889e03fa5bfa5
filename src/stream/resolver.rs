//! Resolver contract and the resolved-stream model.
//!
//! A [`StreamResolver`] turns one [`SourceRequest`] into a playable
//! [`ResolvedStream`] for a single service. Resolvers report failures as a
//! [`StepError`] naming the step that broke; the registry attaches the
//! service and turns it into [`crate::ProxyError::ExtractionFailed`].

use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use scraper::{Html, Selector};
use serde::Serialize;
use url::Url;

use super::request::{CacheKey, HeaderOverrides, SourceRequest};
use super::Service;
use crate::drm::DrmDescriptor;
use crate::error::{StageContext, StepError};
use crate::fingerprint::RequestKind;
use crate::http_client::UpstreamClient;

/// Result of a single resolver step.
pub type StepResult<T> = std::result::Result<T, StepError>;

/// Manifest flavour of a resolved stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Hls,
    Mpd,
    /// Progressive file (mp4, mkv, ts) relayed byte for byte.
    Raw,
}

impl MediaKind {
    /// Guess from the URL path extension.
    pub fn from_url(url: &str) -> Option<Self> {
        let path = Url::parse(url)
            .map(|u| u.path().to_ascii_lowercase())
            .unwrap_or_else(|_| url.to_ascii_lowercase());
        if path.ends_with(".m3u8") || path.ends_with(".m3u") {
            Some(Self::Hls)
        } else if path.ends_with(".mpd") {
            Some(Self::Mpd)
        } else if [".mp4", ".mkv", ".ts", ".webm", ".m4s", ".avi"]
            .iter()
            .any(|ext| path.ends_with(ext))
        {
            Some(Self::Raw)
        } else {
            None
        }
    }

    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let ct = content_type.to_ascii_lowercase();
        if ct.contains("mpegurl") {
            Some(Self::Hls)
        } else if ct.contains("dash+xml") {
            Some(Self::Mpd)
        } else if ct.starts_with("video/") || ct.starts_with("audio/") || ct.contains("octet-stream") {
            Some(Self::Raw)
        } else {
            None
        }
    }

    /// Inspect the first bytes of a body.
    pub fn sniff(body: &[u8]) -> Option<Self> {
        let head = String::from_utf8_lossy(&body[..body.len().min(512)]);
        let head = head.trim_start_matches('\u{feff}').trim_start();
        if head.starts_with("#EXTM3U") {
            Some(Self::Hls)
        } else if head.contains("<MPD") {
            Some(Self::Mpd)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hls => "hls",
            Self::Mpd => "mpd",
            Self::Raw => "raw",
        }
    }
}

/// A playable stream: where to fetch it and with which headers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedStream {
    pub service: Service,
    /// Direct media URL (manifest for HLS/MPD, the file itself for raw).
    pub url: String,
    /// Headers the upstream requires for this URL and everything below it.
    pub headers: HeaderOverrides,
    pub kind: MediaKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drm: Option<DrmDescriptor>,
}

impl ResolvedStream {
    pub fn new(service: Service, url: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            service,
            url: url.into(),
            headers: HeaderOverrides::new(),
            kind,
            drm: None,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: &HeaderOverrides) -> Self {
        self.headers.extend(headers);
        self
    }
}

/// One service's extraction strategy.
#[async_trait]
pub trait StreamResolver: Send + Sync {
    fn service(&self) -> Service;

    async fn resolve(
        &self,
        request: &SourceRequest,
        client: &UpstreamClient,
    ) -> StepResult<ResolvedStream>;

    /// Drop any per-source state (sessions, tokens). No-op by default.
    fn invalidate(&self, key: &CacheKey) {
        let _ = key;
    }
}

/// A fetched HTML/JSON page after redirects.
#[derive(Debug, Clone)]
pub struct Page {
    pub url: Url,
    pub body: String,
    pub content_type: Option<String>,
}

impl Page {
    pub fn origin(&self) -> String {
        self.url.origin().ascii_serialization()
    }

    /// Resolve a link found in this page.
    pub fn join(&self, link: &str) -> Option<String> {
        absolutize(&self.url, link)
    }

    /// Absolute `src` of the first embedded player frame.
    pub fn iframe_src(&self) -> Option<String> {
        self.attr_values("iframe[src]", "src")
            .into_iter()
            .filter(|src| !src.starts_with("about:") && !src.starts_with("javascript:"))
            .find_map(|src| self.join(&src))
    }

    /// Values of `attr` on every element matching `css`.
    pub fn attr_values(&self, css: &str, attr: &str) -> Vec<String> {
        let document = Html::parse_document(&self.body);
        let Ok(selector) = Selector::parse(css) else {
            return Vec::new();
        };
        document
            .select(&selector)
            .filter_map(|el| el.value().attr(attr))
            .map(str::to_string)
            .collect()
    }

    /// Inner text of every element matching `css` (inline scripts, JSON
    /// islands).
    pub fn texts(&self, css: &str) -> Vec<String> {
        let document = Html::parse_document(&self.body);
        let Ok(selector) = Selector::parse(css) else {
            return Vec::new();
        };
        document
            .select(&selector)
            .map(|el| el.text().collect::<String>())
            .collect()
    }
}

/// GET `url` as a browser page load and read the body as text.
/// Non-2xx responses fail the step with the upstream status attached.
pub async fn fetch_page(
    client: &UpstreamClient,
    service: Service,
    url: &str,
    headers: &HeaderMap,
    stage: &'static str,
) -> StepResult<Page> {
    fetch(client, service, url, RequestKind::Page, headers, stage).await
}

/// Same as [`fetch_page`] with API-style `Accept` headers.
pub async fn fetch_api(
    client: &UpstreamClient,
    service: Service,
    url: &str,
    headers: &HeaderMap,
    stage: &'static str,
) -> StepResult<Page> {
    fetch(client, service, url, RequestKind::Api, headers, stage).await
}

async fn fetch(
    client: &UpstreamClient,
    service: Service,
    url: &str,
    kind: RequestKind,
    headers: &HeaderMap,
    stage: &'static str,
) -> StepResult<Page> {
    let response = client
        .get(url, service, kind, headers)
        .stage(stage)?
        .send()
        .await
        .stage(stage)?;
    let status = response.status();
    if !status.is_success() {
        return Err(StepError::status(stage, status.as_u16()));
    }
    let final_url = response.url().clone();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.stage(stage)?;
    Ok(Page {
        url: final_url,
        body,
        content_type,
    })
}

/// `scheme://host[:port]` of `url`.
pub fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed.host_str()?;
    Some(parsed.origin().ascii_serialization())
}

/// Resolve a possibly relative or scheme-relative link against `base`.
pub fn absolutize(base: &Url, link: &str) -> Option<String> {
    let link = link.trim();
    if link.is_empty() {
        return None;
    }
    base.join(link).ok().map(String::from)
}
