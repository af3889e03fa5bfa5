//! Proxy link encoding and decoding.
//!
//! Every URI a rewritten manifest emits points back at this proxy and
//! carries the upstream target plus everything needed to fetch it (header
//! overrides, ClearKey material, nesting depth). The relay re-expands that
//! state from the query string alone; no server-side lookup is involved.

use url::form_urlencoded;

use crate::drm::DrmDescriptor;
use crate::error::{ProxyError, Result};
use crate::stream::request::HeaderOverrides;
use crate::stream::Service;

/// Inbound endpoints that proxy links can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    HlsManifest,
    MpdManifest,
    Stream,
    Key,
    DecryptInit,
    DecryptSegment,
    License,
}

impl Endpoint {
    pub const fn path(self) -> &'static str {
        match self {
            Self::HlsManifest => "/proxy/hls/manifest.m3u8",
            Self::MpdManifest => "/proxy/mpd/manifest.m3u8",
            Self::Stream => "/proxy/stream",
            Self::Key => "/key",
            Self::DecryptInit => "/decrypt/init.mp4",
            Self::DecryptSegment => "/decrypt/segment.mp4",
            Self::License => "/license",
        }
    }

    /// Query parameter that names the upstream target.
    const fn target_param(self) -> &'static str {
        match self {
            Self::HlsManifest | Self::MpdManifest => "d",
            Self::Key => "key_url",
            Self::Stream | Self::DecryptInit | Self::DecryptSegment | Self::License => "url",
        }
    }
}

/// Public base of this proxy (`http://host:port`) and the password every
/// emitted link must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLinks {
    base: String,
    api_password: Option<String>,
}

impl ProxyLinks {
    pub fn new(base: impl Into<String>, api_password: Option<String>) -> Self {
        let base = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
            api_password: api_password.filter(|p| !p.is_empty()),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Start a link to `endpoint` for `target`.
    pub fn to(&self, endpoint: Endpoint, target: &str) -> LinkBuilder<'_> {
        let mut builder = LinkBuilder {
            links: self,
            endpoint,
            params: Vec::new(),
        };
        if !target.is_empty() {
            builder.params.push((endpoint.target_param().to_string(), target.to_string()));
        }
        builder
    }
}

/// Accumulates query parameters for one proxy link.
#[derive(Debug)]
pub struct LinkBuilder<'a> {
    links: &'a ProxyLinks,
    endpoint: Endpoint,
    params: Vec<(String, String)>,
}

impl LinkBuilder<'_> {
    #[must_use]
    pub fn param(mut self, name: &str, value: impl Into<String>) -> Self {
        self.params.push((name.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn param_opt(self, name: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.param(name, value),
            None => self,
        }
    }

    #[must_use]
    pub fn headers(mut self, headers: &HeaderOverrides) -> Self {
        for (name, value) in headers.to_query_pairs() {
            self.params.push((name, value.to_string()));
        }
        self
    }

    #[must_use]
    pub fn drm(self, drm: Option<&DrmDescriptor>) -> Self {
        match drm {
            Some(drm) => self.param("clearkey", drm.to_param()),
            None => self,
        }
    }

    pub fn build(self) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        for (name, value) in &self.params {
            query.append_pair(name, value);
        }
        if let Some(password) = &self.links.api_password {
            query.append_pair("api_password", password);
        }
        format!("{}{}?{}", self.links.base, self.endpoint.path(), query.finish())
    }
}

/// Routing state decoded from an inbound proxy request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteState {
    /// Upstream target (`url`, `d` or `key_url`).
    pub url: Option<String>,
    pub headers: HeaderOverrides,
    pub drm: Option<DrmDescriptor>,
    /// ClearKey license server to query when no key was supplied.
    pub license_url: Option<String>,
    /// Nesting depth; present only on links emitted by a rewrite.
    pub depth: Option<usize>,
    pub init_url: Option<String>,
    pub original_channel_url: Option<String>,
    /// Manual service override (`host=`).
    pub service: Option<Service>,
    pub force_refresh: bool,
    pub client_decrypt: bool,
    /// DASH representation for a media playlist.
    pub rep_id: Option<String>,
    /// Key bytes supplied directly to the key endpoint.
    pub static_key: Option<String>,
    pub redirect_stream: bool,
    pub api_password: Option<String>,
}

impl RouteState {
    /// Decode percent-decoded query pairs. Malformed DRM material or depth
    /// fails the request instead of being ignored.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let pairs: Vec<(&str, &str)> = pairs.into_iter().collect();
        let get = |name: &str| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.trim())
                .filter(|v| !v.is_empty())
        };
        let flag = |name: &str| {
            get(name).is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        };

        let drm = if let Some(clearkey) = get("clearkey") {
            Some(DrmDescriptor::from_clearkey(clearkey)?)
        } else if let (Some(kid), Some(key)) = (get("key_id"), get("key")) {
            Some(DrmDescriptor::from_parts(kid, key)?)
        } else {
            None
        };

        let depth = get("depth")
            .map(|d| {
                d.parse::<usize>()
                    .map_err(|_| ProxyError::bad_request(format!("depth must be a number, got '{d}'")))
            })
            .transpose()?;

        let service = get("host")
            .map(|h| h.parse::<Service>().map_err(ProxyError::BadRequest))
            .transpose()?;

        Ok(Self {
            url: get("url").or_else(|| get("d")).or_else(|| get("key_url")).map(str::to_string),
            headers: HeaderOverrides::from_query(pairs.iter().copied()),
            drm,
            license_url: get("license_url").map(str::to_string),
            depth,
            init_url: get("init_url").map(str::to_string),
            original_channel_url: get("original_channel_url").map(str::to_string),
            service,
            force_refresh: flag("force"),
            client_decrypt: get("decrypt").is_some_and(|v| v.eq_ignore_ascii_case("client")),
            rep_id: get("rep_id").map(str::to_string),
            static_key: get("static_key").map(str::to_string),
            redirect_stream: flag("redirect_stream"),
            api_password: get("api_password").map(str::to_string),
        })
    }

    /// Decode a raw (still percent-encoded) query string.
    pub fn from_query(query: &str) -> Result<Self> {
        let owned: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Self::from_pairs(owned.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// `api_password` from a raw query, read without decoding anything else.
    pub fn password_in(query: &str) -> Option<String> {
        form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == "api_password")
            .map(|(_, v)| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// The upstream target, required by every relay endpoint.
    pub fn target(&self) -> Result<&str> {
        self.url
            .as_deref()
            .ok_or_else(|| ProxyError::bad_request("missing 'url' (or 'd') parameter"))
    }
}

/// Everything a rewrite carries into the URIs it emits.
#[derive(Debug, Clone)]
pub struct RewriteContext {
    pub links: ProxyLinks,
    pub headers: HeaderOverrides,
    pub drm: Option<DrmDescriptor>,
    /// Depth of the manifest being rewritten; the entry manifest is 0.
    pub depth: usize,
    pub max_depth: usize,
    pub original_channel_url: Option<String>,
    /// Keep segments encrypted and hand the key to the player instead.
    pub client_decrypt: bool,
}

impl RewriteContext {
    pub fn new(links: ProxyLinks, max_depth: usize) -> Self {
        Self {
            links,
            headers: HeaderOverrides::new(),
            drm: None,
            depth: 0,
            max_depth,
            original_channel_url: None,
            client_decrypt: false,
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: HeaderOverrides) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_drm(mut self, drm: Option<DrmDescriptor>) -> Self {
        self.drm = drm;
        self
    }

    #[must_use]
    pub fn at_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Fail when this manifest sits deeper than the nesting bound.
    pub fn check_depth(&self) -> Result<()> {
        if self.depth > self.max_depth {
            return Err(ProxyError::rewrite(format!(
                "playlist nesting depth {} exceeds limit of {}",
                self.depth, self.max_depth
            )));
        }
        Ok(())
    }

    /// Decrypt segments on the proxy before they reach the player.
    pub fn decrypts_server_side(&self) -> bool {
        self.drm.is_some() && !self.client_decrypt
    }

    /// Child playlist, one level deeper.
    pub fn manifest_link(&self, target: &str) -> String {
        self.child(Endpoint::HlsManifest, target).build()
    }

    /// One DASH representation rendered as an HLS media playlist.
    pub fn representation_link(&self, mpd_url: &str, rep_id: &str) -> String {
        self.child(Endpoint::MpdManifest, mpd_url)
            .param("rep_id", rep_id)
            .build()
    }

    pub fn segment_link(&self, target: &str) -> String {
        self.links.to(Endpoint::Stream, target).headers(&self.headers).build()
    }

    pub fn key_link(&self, target: &str) -> String {
        self.links
            .to(Endpoint::Key, target)
            .param_opt("original_channel_url", self.original_channel_url.as_deref())
            .headers(&self.headers)
            .drm(self.drm.as_ref())
            .build()
    }

    pub fn decrypt_init_link(&self, target: &str) -> String {
        self.links
            .to(Endpoint::DecryptInit, target)
            .headers(&self.headers)
            .drm(self.drm.as_ref())
            .build()
    }

    pub fn decrypt_segment_link(&self, target: &str, init_url: Option<&str>) -> String {
        self.links
            .to(Endpoint::DecryptSegment, target)
            .param_opt("init_url", init_url)
            .headers(&self.headers)
            .drm(self.drm.as_ref())
            .build()
    }

    fn child(&self, endpoint: Endpoint, target: &str) -> LinkBuilder<'_> {
        let mut link = self
            .links
            .to(endpoint, target)
            .param("depth", (self.depth + 1).to_string())
            .param_opt("original_channel_url", self.original_channel_url.as_deref())
            .headers(&self.headers)
            .drm(self.drm.as_ref());
        if self.client_decrypt {
            link = link.param("decrypt", "client");
        }
        link
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLEARKEY: &str = "eb676abbcb345e96bbcf616630f1a3da:100b6c20940f779a4589152b57d2dacb";

    fn ctx() -> RewriteContext {
        let mut headers = HeaderOverrides::new();
        headers.insert("referer", "https://site.example/");
        RewriteContext::new(ProxyLinks::new("http://proxy.local:7860/", Some("pw".into())), 3)
            .with_headers(headers)
    }

    fn decode(link: &str) -> RouteState {
        let query = link.split_once('?').map_or("", |(_, q)| q);
        RouteState::from_query(query).unwrap()
    }

    #[test]
    fn test_manifest_link_roundtrip() {
        let link = ctx().manifest_link("https://cdn.example/v/720p.m3u8?tok=a&b=c");
        assert!(link.starts_with("http://proxy.local:7860/proxy/hls/manifest.m3u8?d="));

        let state = decode(&link);
        assert_eq!(state.target().unwrap(), "https://cdn.example/v/720p.m3u8?tok=a&b=c");
        assert_eq!(state.depth, Some(1));
        assert_eq!(state.headers.get("referer"), Some("https://site.example/"));
        assert_eq!(state.api_password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_key_link_carries_drm_and_channel() {
        let mut ctx = ctx().with_drm(Some(DrmDescriptor::from_clearkey(CLEARKEY).unwrap()));
        ctx.original_channel_url = Some("https://dlhd.dad/watch.php?id=51".into());
        let state = decode(&ctx.key_link("https://keys.example/k/1"));
        assert_eq!(state.url.as_deref(), Some("https://keys.example/k/1"));
        assert_eq!(state.drm.unwrap().to_param(), CLEARKEY);
        assert_eq!(state.original_channel_url.as_deref(), Some("https://dlhd.dad/watch.php?id=51"));
    }

    #[test]
    fn test_decrypt_segment_link() {
        let ctx = ctx().with_drm(Some(DrmDescriptor::from_clearkey(CLEARKEY).unwrap()));
        let link = ctx.decrypt_segment_link("https://cdn.example/seg-1.m4s", Some("https://cdn.example/init.mp4"));
        assert!(link.contains("/decrypt/segment.mp4?url="));
        let state = decode(&link);
        assert_eq!(state.init_url.as_deref(), Some("https://cdn.example/init.mp4"));
        assert!(state.drm.is_some());
    }

    #[test]
    fn test_depth_bound() {
        assert!(ctx().at_depth(3).check_depth().is_ok());
        let err = ctx().at_depth(4).check_depth().unwrap_err();
        assert_eq!(err.category(), "rewrite_error");
    }

    #[test]
    fn test_route_state_accepts_key_id_pair() {
        let (kid, key) = CLEARKEY.split_once(':').unwrap();
        let state = RouteState::from_pairs([("url", "https://a/x.m4s"), ("key_id", kid), ("key", key)]).unwrap();
        assert_eq!(state.drm.unwrap().to_param(), CLEARKEY);
    }

    #[test]
    fn test_route_state_rejects_bad_input() {
        let err = RouteState::from_pairs([("url", "https://a/"), ("clearkey", "abcd:ef")]).unwrap_err();
        assert!(matches!(err, ProxyError::BadDrmDescriptor(_)));
        assert!(RouteState::from_pairs([("depth", "deep")]).is_err());
        assert!(RouteState::from_pairs([("host", "nosuchservice")]).is_err());
        assert!(RouteState::from_pairs([("force", "true")]).unwrap().target().is_err());
    }

    #[test]
    fn test_route_state_flags_and_service() {
        let state = RouteState::from_query(
            "d=https%3A%2F%2Fvavoo.to%2Fplay%2F1&host=dlhd&force=1&decrypt=client&redirect_stream=true",
        )
        .unwrap();
        assert_eq!(state.service, Some(Service::Dlhd));
        assert!(state.force_refresh);
        assert!(state.client_decrypt);
        assert!(state.redirect_stream);
        assert_eq!(state.depth, None);
    }

    #[test]
    fn test_links_without_password() {
        let links = ProxyLinks::new("http://p", None);
        let link = links.to(Endpoint::Stream, "https://a/b.ts").build();
        assert_eq!(link, "http://p/proxy/stream?url=https%3A%2F%2Fa%2Fb.ts");
    }
}
