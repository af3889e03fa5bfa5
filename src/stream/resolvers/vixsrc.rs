//! VixSrc: Inertia navigation to the embed, then the master playlist token.
//!
//! Title pages are Inertia apps: the `data-page` JSON carries an asset
//! `version` that must be echoed in `X-Inertia-Version` on the follow-up
//! navigation, whose JSON props point at the embed page. The embed page sets
//! `window.masterPlaylist = { params: { token, expires }, url }`; the final
//! playlist is that URL with `token`/`expires` (and `h=1` when FHD is
//! allowed).

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::{StageContext, StepError};
use crate::http_client::UpstreamClient;
use crate::stream::request::{HeaderOverrides, SourceRequest};
use crate::stream::resolver::{fetch_api, fetch_page, MediaKind, Page, ResolvedStream, StepResult, StreamResolver};
use crate::stream::Service;

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"['"]token['"]\s*:\s*['"]([^'"]+)['"]"#).expect("valid regex"));
static EXPIRES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"['"]expires['"]\s*:\s*['"]?(\d+)"#).expect("valid regex"));
static PLAYLIST_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\burl\s*:\s*['"]([^'"]+)['"]"#).expect("valid regex"));
static FHD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"window\.canPlayFHD\s*=\s*true").expect("valid regex"));

/// Parsed `window.masterPlaylist`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterPlaylist {
    pub url: String,
    pub token: String,
    pub expires: String,
    pub fhd: bool,
}

impl MasterPlaylist {
    pub fn parse(html: &str) -> Option<Self> {
        let start = html.find("window.masterPlaylist")?;
        let block = &html[start..];
        let block = &block[..block.len().min(2048)];
        Some(Self {
            url: PLAYLIST_URL.captures(block)?[1].to_string(),
            token: TOKEN.captures(block)?[1].to_string(),
            expires: EXPIRES.captures(block)?[1].to_string(),
            fhd: FHD.is_match(html),
        })
    }

    pub fn playlist_url(&self) -> StepResult<String> {
        let mut url = Url::parse(&self.url).stage("build playlist url")?;
        url.query_pairs_mut()
            .append_pair("token", &self.token)
            .append_pair("expires", &self.expires);
        if self.fhd {
            url.query_pairs_mut().append_pair("h", "1");
        }
        Ok(url.into())
    }
}

#[derive(Debug, Default)]
pub struct VixSrcResolver;

impl VixSrcResolver {
    pub fn new() -> Self {
        Self
    }
}

/// Inertia asset version from the `data-page` attribute.
fn inertia_version(page: &Page) -> Option<String> {
    page.attr_values("[data-page]", "data-page")
        .iter()
        .filter_map(|raw| serde_json::from_str::<Value>(raw).ok())
        .find_map(|json| json.get("version").and_then(Value::as_str).map(str::to_string))
}

/// First string in an Inertia props tree that looks like an embed link.
fn embed_link(json: &Value) -> Option<String> {
    match json {
        Value::String(s) if s.contains("/embed/") || s.contains("/iframe/") => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(embed_link),
        Value::Object(map) => map.values().find_map(embed_link),
        _ => None,
    }
}

fn inertia_headers(version: &str, referer: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("x-inertia"), HeaderValue::from_static("true"));
    headers.insert(
        HeaderName::from_static("x-requested-with"),
        HeaderValue::from_static("XMLHttpRequest"),
    );
    if let Ok(value) = HeaderValue::from_str(version) {
        headers.insert(HeaderName::from_static("x-inertia-version"), value);
    }
    if let Ok(value) = HeaderValue::from_str(referer) {
        headers.insert(reqwest::header::REFERER, value);
    }
    headers
}

impl VixSrcResolver {
    /// Page that carries `window.masterPlaylist`.
    async fn embed_page(&self, page: Page, client: &UpstreamClient) -> StepResult<Page> {
        if MasterPlaylist::parse(&page.body).is_some() {
            return Ok(page);
        }

        let referer = format!("{}/", page.origin());
        let embed = if let Some(version) = inertia_version(&page) {
            debug!(version = %version, "following inertia navigation");
            let nav = fetch_api(
                client,
                Service::VixSrc,
                page.url.as_str(),
                &inertia_headers(&version, &referer),
                "inertia navigation",
            )
            .await?;
            let props: Value = serde_json::from_str(&nav.body).stage("inertia navigation")?;
            embed_link(&props).and_then(|link| page.join(&link))
        } else {
            None
        };
        let embed = embed
            .or_else(|| page.iframe_src())
            .stage("locate embed page")?;

        let mut headers = HeaderOverrides::new();
        headers.insert("referer", &referer);
        fetch_page(client, Service::VixSrc, &embed, &headers.to_header_map(), "fetch embed page").await
    }
}

#[async_trait]
impl StreamResolver for VixSrcResolver {
    fn service(&self) -> Service {
        Service::VixSrc
    }

    async fn resolve(
        &self,
        request: &SourceRequest,
        client: &UpstreamClient,
    ) -> StepResult<ResolvedStream> {
        let page = fetch_page(
            client,
            Service::VixSrc,
            &request.url,
            &request.headers.to_header_map(),
            "fetch page",
        )
        .await?;
        let embed = self.embed_page(page, client).await?;

        let master = MasterPlaylist::parse(&embed.body)
            .ok_or_else(|| StepError::new("extract playlist token", "window.masterPlaylist not found"))?;
        let url = master.playlist_url()?;
        let origin = embed.origin();
        Ok(ResolvedStream::new(Service::VixSrc, url, MediaKind::Hls)
            .with_header("referer", &format!("{origin}/"))
            .with_header("origin", &origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMBED: &str = r"<script>
        window.video = {id: 1};
        window.masterPlaylist = {
            params: {
                'token': 'f00dbabe',
                'expires': '1718000000',
                'asn': '',
            },
            url: 'https://vixsrc.to/playlist/12345?b=1',
        }
        window.canPlayFHD = true
    </script>";

    #[test]
    fn test_master_playlist_parse() {
        let master = MasterPlaylist::parse(EMBED).unwrap();
        assert_eq!(master.token, "f00dbabe");
        assert_eq!(master.expires, "1718000000");
        assert_eq!(master.url, "https://vixsrc.to/playlist/12345?b=1");
        assert!(master.fhd);
        assert_eq!(
            master.playlist_url().unwrap(),
            "https://vixsrc.to/playlist/12345?b=1&token=f00dbabe&expires=1718000000&h=1"
        );
    }

    #[test]
    fn test_master_playlist_without_fhd() {
        let html = EMBED.replace("window.canPlayFHD = true", "");
        let master = MasterPlaylist::parse(&html).unwrap();
        assert!(!master.playlist_url().unwrap().contains("h=1"));
    }

    #[test]
    fn test_inertia_version_and_embed_link() {
        let page = Page {
            url: Url::parse("https://vixsrc.to/movie/550").unwrap(),
            body: r#"<div id="app" data-page="{&quot;component&quot;:&quot;Movie&quot;,&quot;version&quot;:&quot;9f3c&quot;}"></div>"#.into(),
            content_type: None,
        };
        assert_eq!(inertia_version(&page).as_deref(), Some("9f3c"));

        let props: Value = serde_json::json!({
            "component": "Movie",
            "props": {"title": {"id": 550}, "embedUrl": "https://vixsrc.to/embed/550?token=x"}
        });
        assert_eq!(embed_link(&props).as_deref(), Some("https://vixsrc.to/embed/550?token=x"));
    }

    #[test]
    fn test_inertia_headers() {
        let headers = inertia_headers("9f3c", "https://vixsrc.to/");
        assert_eq!(headers["x-inertia"], "true");
        assert_eq!(headers["x-inertia-version"], "9f3c");
    }
}
