//! Request-handling context shared by every inbound request.
//!
//! [`ProxyEngine`] owns the configuration, the pooled upstream client, the
//! resolver registry, the extraction cache, the relay and the segment
//! decryptor. Each public method
//! serves one inbound endpoint from its decoded [`RouteState`] and checks the
//! API password before touching anything upstream.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use reqwest::header::HeaderValue;
use reqwest::Response;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::drm::{self, cenc, ClearKeyLicense, DrmDescriptor};
use crate::error::{ProxyError, Result};
use crate::fingerprint::RequestKind;
use crate::http_client::UpstreamClient;
use crate::manifest::{hls, Endpoint, Mpd, ProxyLinks, RewriteContext, RouteState};
use crate::playlist::{PlaylistCombiner, PlaylistSpec};
use crate::relay::{Fetched, StreamRelay};
use crate::segments::{SegmentDecryptor, SegmentKey};
use crate::stream::request::{CacheKey, DrmHint, HeaderOverrides, SourceRequest};
use crate::stream::resolver::{MediaKind, ResolvedStream};
use crate::stream::{ExtractionCache, ResolverRegistry, Service};

pub const HLS_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Which manifest endpoint was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    /// Detect from the resolution, the URL or the body.
    Auto,
    /// Treat the target as DASH and convert it.
    Mpd,
}

/// Result of a manifest request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestOutcome {
    /// Rewritten HLS text.
    Playlist(String),
    /// The target is not a manifest; relay it from this proxy link.
    Redirect(String),
}

/// Resolution details returned by the extractor endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractorInfo {
    #[serde(flatten)]
    pub stream: ResolvedStream,
    /// Proxy link that plays the stream.
    pub proxy_url: String,
}

pub struct ProxyEngine {
    config: Arc<ProxyConfig>,
    client: Arc<UpstreamClient>,
    registry: ResolverRegistry,
    cache: ExtractionCache,
    relay: StreamRelay,
    segments: SegmentDecryptor,
}

impl ProxyEngine {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let client = Arc::new(UpstreamClient::new(&config)?);
        let registry = ResolverRegistry::new(&config.cache);
        let cache = ExtractionCache::new(config.cache.clone());
        let relay = StreamRelay::new(client.clone());
        let segments = SegmentDecryptor::new(relay.clone()).with_prefetch(config.prefetch_segments);
        info!(
            max_depth = config.max_playlist_depth,
            retries = config.relay.max_retries,
            cache_capacity = config.cache.capacity,
            prefetch = config.prefetch_segments,
            "proxy engine ready"
        );
        Ok(Self {
            config: Arc::new(config),
            client,
            registry,
            cache,
            relay,
            segments,
        })
    }

    /// Replace the resolver registry (custom DLHD/Vavoo endpoints).
    #[must_use]
    pub fn with_registry(mut self, registry: ResolverRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn cache(&self) -> &ExtractionCache {
        &self.cache
    }

    pub fn relay(&self) -> &StreamRelay {
        &self.relay
    }

    pub fn authorize(&self, state: &RouteState) -> Result<()> {
        self.config.check_password(state.api_password.as_deref())
    }

    /// Links emitted for requests that reached this proxy at `base`.
    pub fn links(&self, base: &str) -> ProxyLinks {
        ProxyLinks::new(base, self.config.api_password.clone())
    }

    /// Build the resolution request for an entry-point route.
    pub fn source_request(state: &RouteState) -> Result<SourceRequest> {
        let mut request = SourceRequest::new(state.target()?)
            .with_headers(state.headers.clone())
            .force_refresh(state.force_refresh);
        if let Some(service) = state.service {
            request = request.with_service(service);
        }
        let hint = match (&state.drm, &state.license_url) {
            (Some(drm), _) => Some(DrmHint::ClearKey(drm.to_param())),
            (None, Some(url)) => Some(DrmHint::LicenseUrl(url.clone())),
            (None, None) => None,
        };
        Ok(request.with_drm(hint))
    }

    /// Resolve through the extraction cache. `force_refresh` drops the
    /// cached entry and any resolver session first.
    pub async fn resolve(&self, request: &SourceRequest) -> Result<Arc<ResolvedStream>> {
        let key = request.cache_key();
        if request.force_refresh {
            self.invalidate(&key).await;
        }
        self.cache
            .get_or_resolve(&key, || self.registry.resolve(request, &self.client))
            .await
    }

    async fn invalidate(&self, key: &CacheKey) {
        self.cache.invalidate(key).await;
        self.registry.invalidate(key);
    }

    /// Manifest endpoints. Entry requests resolve the source; links emitted
    /// by a previous rewrite carry a depth and are fetched directly.
    pub async fn manifest(
        &self,
        state: &RouteState,
        links: ProxyLinks,
        format: ManifestFormat,
    ) -> Result<ManifestOutcome> {
        self.authorize(state)?;
        let target = state.target()?;

        let mut ctx = RewriteContext::new(links, self.config.max_playlist_depth)
            .at_depth(state.depth.unwrap_or(0));
        ctx.check_depth()?;
        ctx.client_decrypt = state.client_decrypt;
        ctx.original_channel_url = state.original_channel_url.clone();

        // Entry requests for hoster services keep their request so a 403 on
        // the resolved URL can refresh the resolution once.
        let (mut url, mut service, kind, refreshable) = if state.depth.is_some() {
            ctx.headers = state.headers.clone();
            ctx.drm = state.drm.clone();
            let service = state.service.unwrap_or_else(|| Service::detect(target));
            (target.to_string(), service, None, None)
        } else {
            let request = Self::source_request(state)?;
            let resolved = self.resolve(&request).await?;
            let refreshable = (resolved.service != Service::Generic).then(|| request.clone());
            if refreshable.is_some() && ctx.original_channel_url.is_none() {
                ctx.original_channel_url = Some(request.url.clone());
            }
            ctx.headers = resolved.headers.clone();
            ctx.drm = state.drm.clone().or_else(|| resolved.drm.clone());
            (resolved.url.clone(), resolved.service, Some(resolved.kind), refreshable)
        };

        let kind = match (format, kind) {
            (ManifestFormat::Mpd, _) => Some(MediaKind::Mpd),
            (_, Some(MediaKind::Raw)) => {
                return Ok(ManifestOutcome::Redirect(ctx.segment_link(&url)));
            }
            (_, kind) => kind,
        };

        let fetched = match (self.relay.fetch(&url, service, RequestKind::Media, &ctx.headers).await, refreshable) {
            (Ok(fetched), _) => fetched,
            (Err(err), Some(request)) if err.is_forbidden() => {
                warn!(service = %service, url = %url, "manifest fetch forbidden, refreshing resolution");
                let request = request.force_refresh(true);
                let resolved = self.resolve(&request).await?;
                ctx.headers = resolved.headers.clone();
                if state.drm.is_none() {
                    ctx.drm = resolved.drm.clone();
                }
                url = resolved.url.clone();
                service = resolved.service;
                match self.relay.fetch(&url, service, RequestKind::Media, &ctx.headers).await {
                    Ok(fetched) => fetched,
                    Err(err) => {
                        if err.is_forbidden() {
                            self.invalidate(&request.cache_key()).await;
                        }
                        return Err(err);
                    }
                }
            }
            (Err(err), _) => return Err(err),
        };
        let kind = kind
            .filter(|k| *k != MediaKind::Raw)
            .or_else(|| MediaKind::sniff(&fetched.body))
            .or_else(|| fetched.content_type.as_deref().and_then(MediaKind::from_content_type))
            .unwrap_or(MediaKind::Raw);

        match kind {
            MediaKind::Hls => {
                let text = fetched.text();
                if !hls::is_playlist(&text) {
                    return Ok(ManifestOutcome::Redirect(ctx.segment_link(&url)));
                }
                Ok(ManifestOutcome::Playlist(hls::rewrite(&text, &fetched.url, &ctx)?))
            }
            MediaKind::Mpd => self.convert_mpd(state, &fetched, service, ctx).await,
            MediaKind::Raw => Ok(ManifestOutcome::Redirect(ctx.segment_link(&url))),
        }
    }

    async fn convert_mpd(
        &self,
        state: &RouteState,
        fetched: &Fetched,
        service: Service,
        mut ctx: RewriteContext,
    ) -> Result<ManifestOutcome> {
        let mpd = Mpd::parse(&fetched.text())?;

        if ctx.drm.is_none() {
            let protection = mpd.protection();
            let license_url = state.license_url.clone().or(protection.license_url.clone());
            if let Some(license_url) = license_url.filter(|_| protection.is_protected() || state.license_url.is_some()) {
                let drm = self
                    .fetch_license(&license_url, &protection.kids, service, &ctx.headers)
                    .await?;
                ctx.drm = Some(drm);
            } else if protection.is_protected() {
                debug!(url = %fetched.url, "protected MPD without key material, segments stay encrypted");
            }
        }

        let playlist = match state.rep_id.as_deref() {
            Some(rep_id) => mpd.media_playlist(rep_id, &fetched.url, &ctx, Utc::now())?,
            None => mpd.master_playlist(&fetched.url, &ctx)?,
        };
        Ok(ManifestOutcome::Playlist(playlist))
    }

    /// POST a W3C ClearKey license request and parse the JWK answer.
    async fn fetch_license(
        &self,
        url: &str,
        kids: &[[u8; drm::KEY_LEN]],
        service: Service,
        headers: &HeaderOverrides,
    ) -> Result<DrmDescriptor> {
        debug!(license_url = %url, kids = kids.len(), "requesting ClearKey license");
        let resp = self
            .client
            .post(url, service, RequestKind::Api, &headers.to_header_map())?
            .json(&drm::license_request(kids))
            .send()
            .await
            .map_err(|e| ProxyError::from_transport(&e))?;
        let body = license_body(resp).await?;
        DrmDescriptor::from_license_response(&body, Some(url))
    }

    /// Raw relay of a segment or file. The body is not read here.
    pub async fn open_stream(&self, state: &RouteState, range: Option<&HeaderValue>) -> Result<Response> {
        self.authorize(state)?;
        let target = state.target()?;
        let service = state.service.unwrap_or_else(|| Service::detect(target));
        self.relay
            .open(target, service, RequestKind::Media, &state.headers, range)
            .await
    }

    /// Key endpoint. A 403 on a key tied to a channel refreshes that
    /// channel's resolution and retries once with its new headers.
    pub async fn key(&self, state: &RouteState) -> Result<Bytes> {
        self.authorize(state)?;
        if let Some(key) = state.static_key.as_deref() {
            return Ok(Bytes::copy_from_slice(&drm::decode_16("static_key", key)?));
        }

        let Some(target) = state.url.as_deref() else {
            // Client-side decryption asks for the key of its descriptor.
            return match state.drm.as_ref().and_then(|d| d.keys.first()) {
                Some(pair) => Ok(Bytes::copy_from_slice(&pair.key)),
                None => Err(ProxyError::bad_request("missing 'key_url' parameter")),
            };
        };

        let service = state.service.unwrap_or_else(|| Service::detect(target));
        match self.relay.fetch(target, service, RequestKind::Media, &state.headers).await {
            Ok(fetched) => Ok(fetched.body),
            Err(err) if err.is_forbidden() => {
                let Some(channel) = state.original_channel_url.as_deref() else {
                    return Err(err);
                };
                warn!(channel = %channel, "key fetch forbidden, refreshing channel resolution");
                let request = SourceRequest::new(channel).force_refresh(true);
                let resolved = self.resolve(&request).await?;
                let mut headers = resolved.headers.clone();
                headers.extend(&state.headers);
                Ok(self
                    .relay
                    .fetch(target, resolved.service, RequestKind::Media, &headers)
                    .await?
                    .body)
            }
            Err(err) => Err(err),
        }
    }

    fn require_drm(state: &RouteState) -> Result<&DrmDescriptor> {
        state
            .drm
            .as_ref()
            .ok_or_else(|| ProxyError::bad_request("missing 'clearkey' or 'key_id'/'key' parameters"))
    }

    /// Clear init segment.
    pub async fn decrypt_init(&self, state: &RouteState) -> Result<Vec<u8>> {
        self.authorize(state)?;
        let drm = Self::require_drm(state)?;
        let init = self.segments.init_segment(state.target()?, &state.headers).await?;
        cenc::decrypt_init(&init, drm)
    }

    /// Clear media segment. The init segment supplies track and `tenc`
    /// defaults; only the media segment is returned.
    pub async fn decrypt_segment(&self, state: &RouteState) -> Result<Bytes> {
        self.authorize(state)?;
        let drm = Self::require_drm(state)?;
        let target = state.target()?;
        let init_url = state
            .init_url
            .as_deref()
            .ok_or_else(|| ProxyError::bad_request("missing 'init_url' parameter"))?;

        let key = SegmentKey {
            url: target.to_string(),
            init_url: init_url.to_string(),
            drm: drm.clone(),
        };
        self.segments.segment(key, &state.headers).await
    }

    pub fn segments(&self) -> &SegmentDecryptor {
        &self.segments
    }

    /// ClearKey license built from the route's descriptor.
    pub fn license(&self, state: &RouteState) -> Result<ClearKeyLicense> {
        self.authorize(state)?;
        Ok(Self::require_drm(state)?.to_license())
    }

    /// Forward a player's license request body to the license server in
    /// `url` with the carried headers.
    pub async fn forward_license(&self, state: &RouteState, body: Bytes) -> Result<Bytes> {
        self.authorize(state)?;
        let target = state.target()?;
        let service = state.service.unwrap_or_else(|| Service::detect(target));
        let resp = self
            .client
            .post(target, service, RequestKind::Api, &state.headers.to_header_map())?
            .body(body)
            .send()
            .await
            .map_err(|e| ProxyError::from_transport(&e))?;
        license_body(resp).await
    }

    /// Resolve and describe a source, with a playable proxy link.
    pub async fn extract(&self, state: &RouteState, links: &ProxyLinks) -> Result<ExtractorInfo> {
        self.authorize(state)?;
        let request = Self::source_request(state)?;
        let resolved = self.resolve(&request).await?;

        let endpoint = match resolved.kind {
            MediaKind::Hls => Endpoint::HlsManifest,
            MediaKind::Mpd => Endpoint::MpdManifest,
            MediaKind::Raw => Endpoint::Stream,
        };
        let drm = state.drm.as_ref().or(resolved.drm.as_ref());
        let proxy_url = links
            .to(endpoint, &resolved.url)
            .param("host", Service::Generic.name())
            .headers(&resolved.headers)
            .drm(drm)
            .build();
        Ok(ExtractorInfo {
            stream: (*resolved).clone(),
            proxy_url,
        })
    }

    /// Merged channel list. The password is checked before any source is
    /// fetched.
    pub async fn playlist(&self, definitions: &str, password: Option<&str>, links: ProxyLinks) -> Result<String> {
        self.config.check_password(password)?;
        let specs = PlaylistSpec::parse_list(definitions)?;
        PlaylistCombiner::new(self.relay.clone(), links).combine(&specs).await
    }
}

async fn license_body(resp: Response) -> Result<Bytes> {
    let status = resp.status();
    if status.is_client_error() {
        return Err(ProxyError::UpstreamRejected {
            status: status.as_u16(),
        });
    }
    if !status.is_success() {
        return Err(ProxyError::unavailable(format!("license server returned HTTP {status}")));
    }
    resp.bytes().await.map_err(|e| ProxyError::from_transport(&e))
}
