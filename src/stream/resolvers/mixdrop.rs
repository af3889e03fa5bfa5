//! Mixdrop: the embed page hides the file URL in a packed script that
//! assigns `MDCore.wurl`. The packer is reversed as a string transform.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::StepError;
use crate::http_client::UpstreamClient;
use crate::stream::deobfuscate::unpack_all;
use crate::stream::request::SourceRequest;
use crate::stream::resolver::{fetch_page, MediaKind, ResolvedStream, StepResult, StreamResolver};
use crate::stream::Service;

static WURL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"MDCore\.wurl\s*=\s*["']([^"']+)["']"#).expect("valid regex"));

const REMOVED_MARKERS: &[&str] = &["can't find the file", "File has been removed", "deleted"];

#[derive(Debug, Default)]
pub struct MixdropResolver;

impl MixdropResolver {
    pub fn new() -> Self {
        Self
    }
}

/// `/f/<id>` file pages become `/e/<id>` embed pages.
fn embed_url(url: &str) -> String {
    url.replacen("/f/", "/e/", 1)
}

/// Recover the `wurl` value from an embed page.
fn extract_wurl(html: &str) -> Option<String> {
    let wurl = unpack_all(html)
        .iter()
        .find_map(|script| WURL.captures(script).map(|c| c[1].to_string()))
        .or_else(|| WURL.captures(html).map(|c| c[1].to_string()))?;
    Some(if wurl.starts_with("//") {
        format!("https:{wurl}")
    } else {
        wurl
    })
}

#[async_trait]
impl StreamResolver for MixdropResolver {
    fn service(&self) -> Service {
        Service::Mixdrop
    }

    async fn resolve(
        &self,
        request: &SourceRequest,
        client: &UpstreamClient,
    ) -> StepResult<ResolvedStream> {
        let page = fetch_page(
            client,
            Service::Mixdrop,
            &embed_url(&request.url),
            &request.headers.to_header_map(),
            "fetch embed page",
        )
        .await?;

        let Some(wurl) = extract_wurl(&page.body) else {
            let cause = if REMOVED_MARKERS.iter().any(|m| page.body.contains(m)) {
                "file removed"
            } else {
                "MDCore.wurl not found in packed script"
            };
            return Err(StepError::new("unpack player script", cause));
        };

        let origin = page.origin();
        let kind = MediaKind::from_url(&wurl).unwrap_or(MediaKind::Raw);
        Ok(ResolvedStream::new(Service::Mixdrop, wurl, kind)
            .with_header("referer", &format!("{origin}/"))
            .with_header("origin", &origin))
    }
}
