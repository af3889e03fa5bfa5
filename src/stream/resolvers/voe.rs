//! VOE: bounded script redirects, then a rotated/base64 JSON payload.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::error::StepError;
use crate::http_client::UpstreamClient;
use crate::stream::deobfuscate::{decode_base64_any, decode_voe_payload};
use crate::stream::request::SourceRequest;
use crate::stream::resolver::{fetch_page, MediaKind, Page, ResolvedStream, StepResult, StreamResolver};
use crate::stream::Service;

/// Script redirects followed before giving up.
pub const MAX_REDIRECTS: usize = 3;

static JS_REDIRECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"window\.location\.href\s*=\s*["']([^"']+)["']"#).expect("valid regex")
});

static LEGACY_HLS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"["']hls["']\s*:\s*["']([^"']+)["']"#).expect("valid regex"));

#[derive(Debug, Default)]
pub struct VoeResolver;

impl VoeResolver {
    pub fn new() -> Self {
        Self
    }
}

/// Media URL from the JSON island (`source`, then `direct_access_url`) or
/// the older inline `'hls': '<url or base64>'` form.
fn extract_source(page: &Page) -> Option<String> {
    for island in page.texts(r#"script[type="application/json"]"#) {
        let encoded = match serde_json::from_str::<serde_json::Value>(island.trim()) {
            Ok(serde_json::Value::Array(items)) => items.first().and_then(|v| v.as_str()).map(str::to_string),
            Ok(serde_json::Value::String(s)) => Some(s),
            _ => Some(island.trim().to_string()),
        };
        let Some(payload) = encoded.as_deref().and_then(decode_voe_payload) else {
            continue;
        };
        if let Some(url) = ["source", "direct_access_url"]
            .iter()
            .find_map(|field| payload.get(*field).and_then(|v| v.as_str()))
        {
            return Some(url.to_string());
        }
    }

    let raw = LEGACY_HLS.captures(&page.body)?.get(1)?.as_str().to_string();
    if raw.starts_with("http") {
        Some(raw)
    } else {
        String::from_utf8(decode_base64_any(&raw)?)
            .ok()
            .filter(|s| s.starts_with("http"))
    }
}

#[async_trait]
impl StreamResolver for VoeResolver {
    fn service(&self) -> Service {
        Service::Voe
    }

    async fn resolve(
        &self,
        request: &SourceRequest,
        client: &UpstreamClient,
    ) -> StepResult<ResolvedStream> {
        let headers = request.headers.to_header_map();
        let mut page = fetch_page(client, Service::Voe, &request.url, &headers, "fetch page").await?;

        let mut hops = 0;
        while let Some(target) = JS_REDIRECT.captures(&page.body).and_then(|c| page.join(&c[1])) {
            if extract_source(&page).is_some() {
                break;
            }
            if hops == MAX_REDIRECTS {
                return Err(StepError::new(
                    "follow redirect",
                    format!("more than {MAX_REDIRECTS} script redirects"),
                ));
            }
            hops += 1;
            debug!(hop = hops, url = %target, "following VOE redirect");
            page = fetch_page(client, Service::Voe, &target, &headers, "follow redirect").await?;
        }

        let url = extract_source(&page)
            .ok_or_else(|| StepError::new("decode payload", "no decodable source in page"))?;
        let origin = page.origin();
        let kind = MediaKind::from_url(&url).unwrap_or(MediaKind::Raw);
        Ok(ResolvedStream::new(Service::Voe, url, kind)
            .with_header("referer", &format!("{origin}/"))
            .with_header("origin", &origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::deobfuscate::rot13;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use url::Url;

    fn page(body: &str) -> Page {
        Page {
            url: Url::parse("https://voe.sx/e/abc").unwrap(),
            body: body.to_string(),
            content_type: None,
        }
    }

    fn encode_voe(json: &str) -> String {
        let inner = STANDARD.encode(json);
        let reversed: String = inner.chars().rev().collect();
        let shifted: String = reversed
            .chars()
            .map(|c| char::from_u32(c as u32 + 3).unwrap())
            .collect();
        rot13(&STANDARD.encode(shifted))
    }

    #[test]
    fn test_json_island_source() {
        let payload = encode_voe(r#"{"source":"https://delivery.example/engine/hls/x/master.m3u8"}"#);
        let body = format!(r#"<script type="application/json">["{payload}"]</script>"#);
        assert_eq!(
            extract_source(&page(&body)).as_deref(),
            Some("https://delivery.example/engine/hls/x/master.m3u8")
        );
    }

    #[test]
    fn test_direct_access_fallback() {
        let payload = encode_voe(r#"{"direct_access_url":"https://delivery.example/v.mp4"}"#);
        let body = format!(r#"<script type="application/json">["{payload}"]</script>"#);
        assert_eq!(
            extract_source(&page(&body)).as_deref(),
            Some("https://delivery.example/v.mp4")
        );
    }

    #[test]
    fn test_legacy_base64_hls() {
        let encoded = STANDARD.encode("https://delivery.example/legacy/master.m3u8");
        let body = format!("<script>var sources = {{'hls': '{encoded}', 'video_height': 720}};</script>");
        assert_eq!(
            extract_source(&page(&body)).as_deref(),
            Some("https://delivery.example/legacy/master.m3u8")
        );
    }

    #[test]
    fn test_redirect_pattern() {
        let body = "<script>window.location.href = 'https://mirror.example/e/abc';</script>";
        let p = page(body);
        let target = JS_REDIRECT.captures(&p.body).and_then(|c| p.join(&c[1]));
        assert_eq!(target.as_deref(), Some("https://mirror.example/e/abc"));
        assert!(extract_source(&p).is_none());
    }
}
