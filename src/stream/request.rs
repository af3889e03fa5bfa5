//! Inbound request model: source URL, header overrides, DRM hint and the
//! normalised cache identity derived from them.

use std::collections::BTreeMap;
use std::fmt;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use url::Url;

use super::Service;

/// Query parameter prefix carrying header overrides (`h_referer=...`).
pub const HEADER_PARAM_PREFIX: &str = "h_";

/// Headers a client may never forward upstream.
const FORBIDDEN_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "forwarded",
    "via",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-forwarded-port",
    "x-real-ip",
    "cf-connecting-ip",
    "true-client-ip",
    "accept-encoding",
];

/// Client-supplied header overrides, keyed by lowercase header name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct HeaderOverrides(BTreeMap<String, String>);

impl HeaderOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect `h_<name>` parameters from decoded query pairs.
    pub fn from_query<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut headers = Self::new();
        for (key, value) in pairs {
            if let Some(name) = key.strip_prefix(HEADER_PARAM_PREFIX) {
                headers.insert(name, value);
            }
        }
        headers
    }

    /// Insert a header unless it is hop-by-hop or client-identifying.
    /// Underscores in names become dashes (`user_agent` → `user-agent`).
    pub fn insert(&mut self, name: &str, value: &str) {
        let name = name.trim().to_ascii_lowercase().replace('_', "-");
        if name.is_empty() || FORBIDDEN_HEADERS.contains(&name.as_str()) {
            return;
        }
        self.0.insert(name, value.trim().to_string());
    }

    /// Insert only if no override for `name` exists yet.
    pub fn insert_default(&mut self, name: &str, value: &str) {
        if !self.contains(name) {
            self.insert(name, value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merge `other` on top of `self`.
    pub fn extend(&mut self, other: &HeaderOverrides) {
        for (name, value) in other.iter() {
            self.insert(name, value);
        }
    }

    /// Render as a reqwest header map, skipping values that are not valid
    /// header text.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in &self.0 {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.insert(name, value);
            }
        }
        map
    }

    /// Render as `h_<name>` query pairs.
    pub fn to_query_pairs(&self) -> impl Iterator<Item = (String, &str)> {
        self.0
            .iter()
            .map(|(k, v)| (format!("{HEADER_PARAM_PREFIX}{k}"), v.as_str()))
    }
}

/// DRM material supplied with the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrmHint {
    /// Raw `KID:KEY[,KID:KEY]` text, validated by the DRM module.
    ClearKey(String),
    /// ClearKey license server to query for keys.
    LicenseUrl(String),
}

/// One inbound resolution request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRequest {
    pub url: String,
    pub service: Service,
    pub headers: HeaderOverrides,
    pub drm: Option<DrmHint>,
    /// Drop any cached resolution before resolving.
    pub force_refresh: bool,
}

impl SourceRequest {
    /// Request with the service detected from the URL.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let service = Service::detect(&url);
        Self {
            url,
            service,
            headers: HeaderOverrides::new(),
            drm: None,
            force_refresh: false,
        }
    }

    #[must_use]
    pub fn with_service(mut self, service: Service) -> Self {
        self.service = service;
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: HeaderOverrides) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_drm(mut self, drm: Option<DrmHint>) -> Self {
        self.drm = drm;
        self
    }

    #[must_use]
    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.url, self.service)
    }
}

/// Normalised source identity. Equal keys share one resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    url: String,
    service: Service,
}

impl CacheKey {
    /// Normalise `url`: lowercase scheme and host, default port removed,
    /// fragment dropped, query pairs sorted.
    pub fn new(url: &str, service: Service) -> Self {
        Self {
            url: normalize_url(url),
            service,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn service(&self) -> Service {
        self.service
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.url)
    }
}

fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_overrides_from_query() {
        let headers = HeaderOverrides::from_query([
            ("url", "https://x/"),
            ("h_Referer", "https://site/"),
            ("h_user_agent", "VLC"),
            ("h_x-forwarded-for", "1.2.3.4"),
        ]);
        assert_eq!(headers.get("referer"), Some("https://site/"));
        assert_eq!(headers.get("user-agent"), Some("VLC"));
        assert!(!headers.contains("x-forwarded-for"));
        assert_eq!(headers.iter().count(), 2);
    }

    #[test]
    fn test_insert_default_keeps_client_value() {
        let mut headers = HeaderOverrides::new();
        headers.insert("Referer", "https://client/");
        headers.insert_default("referer", "https://origin/");
        headers.insert_default("origin", "https://origin");
        assert_eq!(headers.get("referer"), Some("https://client/"));
        assert_eq!(headers.get("origin"), Some("https://origin"));
    }

    #[test]
    fn test_query_pairs_roundtrip() {
        let mut headers = HeaderOverrides::new();
        headers.insert("referer", "https://a/");
        let pairs: Vec<(String, String)> = headers
            .to_query_pairs()
            .map(|(k, v)| (k, v.to_string()))
            .collect();
        assert_eq!(pairs, vec![("h_referer".to_string(), "https://a/".to_string())]);
        let back = HeaderOverrides::from_query(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        assert_eq!(back, headers);
    }

    #[test]
    fn test_invalid_header_value_skipped_in_map() {
        let mut headers = HeaderOverrides::new();
        headers.insert("referer", "https://ok/");
        headers.insert("x-bad", "line\nbreak");
        let map = headers.to_header_map();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_cache_key_normalisation() {
        let a = CacheKey::new("HTTPS://Example.COM:443/live.m3u8?b=2&a=1#frag", Service::Generic);
        let b = CacheKey::new("https://example.com/live.m3u8?a=1&b=2", Service::Generic);
        assert_eq!(a, b);
        assert_eq!(a.url(), "https://example.com/live.m3u8?a=1&b=2");
    }

    #[test]
    fn test_cache_key_distinguishes_service() {
        let url = "https://example.com/watch.php?id=1";
        assert_ne!(
            CacheKey::new(url, Service::Dlhd),
            CacheKey::new(url, Service::Generic)
        );
    }

    #[test]
    fn test_source_request_detects_service() {
        let request = SourceRequest::new("https://vavoo.to/play/1/index.m3u8");
        assert_eq!(request.service, Service::Vavoo);
        let hinted = request.with_service(Service::Generic);
        assert_eq!(hinted.cache_key().service(), Service::Generic);
    }
}
