//! Sportsonline: page → player iframe → packed script → `.m3u8`.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::error::{StageContext, StepError};
use crate::http_client::UpstreamClient;
use crate::stream::deobfuscate::unpack_all;
use crate::stream::request::{HeaderOverrides, SourceRequest};
use crate::stream::resolver::{fetch_page, MediaKind, Page, ResolvedStream, StepResult, StreamResolver};
use crate::stream::Service;

static SRC_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:src|file|source)\s*[:=]\s*["']([^"']+\.m3u8[^"']*)["']"#).expect("valid regex")
});

static ANY_M3U8: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"((?:https?:)?//[^\s"'<>\\]+\.m3u8[^\s"'<>\\]*)"#).expect("valid regex"));

#[derive(Debug, Default)]
pub struct SportsonlineResolver;

impl SportsonlineResolver {
    pub fn new() -> Self {
        Self
    }
}

/// Find the playlist URL in the player page: unpacked scripts first, then
/// the raw page.
fn find_playlist(player: &Page) -> Option<String> {
    let unpacked = unpack_all(&player.body);
    unpacked
        .iter()
        .chain(std::iter::once(&player.body))
        .find_map(|script| {
            SRC_ASSIGNMENT
                .captures(script)
                .or_else(|| ANY_M3U8.captures(script))
                .map(|c| c[1].to_string())
        })
        .and_then(|link| player.join(&link))
}

#[async_trait]
impl StreamResolver for SportsonlineResolver {
    fn service(&self) -> Service {
        Service::Sportsonline
    }

    async fn resolve(
        &self,
        request: &SourceRequest,
        client: &UpstreamClient,
    ) -> StepResult<ResolvedStream> {
        let page = fetch_page(
            client,
            Service::Sportsonline,
            &request.url,
            &request.headers.to_header_map(),
            "fetch page",
        )
        .await?;

        let iframe = page.iframe_src().stage("locate player iframe")?;
        let mut headers = HeaderOverrides::new();
        headers.insert("referer", &format!("{}/", page.origin()));
        let player = fetch_page(
            client,
            Service::Sportsonline,
            &iframe,
            &headers.to_header_map(),
            "fetch player page",
        )
        .await?;

        let playlist = find_playlist(&player)
            .ok_or_else(|| StepError::new("unpack player script", "no .m3u8 in packed or inline script"))?;
        debug!(url = %playlist, "sportsonline playlist found");

        let origin = player.origin();
        Ok(ResolvedStream::new(Service::Sportsonline, playlist, MediaKind::Hls)
            .with_header("referer", &format!("{origin}/"))
            .with_header("origin", &origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn page(body: &str) -> Page {
        Page {
            url: Url::parse("https://player.example/embed/ch1.php").unwrap(),
            body: body.to_string(),
            content_type: None,
        }
    }

    #[test]
    fn test_finds_playlist_in_packed_script() {
        let body = r"<script>eval(function(p,a,c,k,e,d){return p}('0 1=\'2://3.4/5/6.7?8=9\';',10,10,'var|src|https|edge|example|hls|ch1|m3u8|t|abc'.split('|'),0,{}))</script>";
        assert_eq!(
            find_playlist(&page(body)).as_deref(),
            Some("https://edge.example/hls/ch1.m3u8?t=abc")
        );
    }

    #[test]
    fn test_falls_back_to_inline_url() {
        let body = r#"<script>var player = new Clappr.Player({source: "//edge.example/live/ch2.m3u8"});</script>"#;
        assert_eq!(
            find_playlist(&page(body)).as_deref(),
            Some("https://edge.example/live/ch2.m3u8")
        );
    }

    #[test]
    fn test_no_playlist() {
        assert!(find_playlist(&page("<html>offline</html>")).is_none());
    }
}
