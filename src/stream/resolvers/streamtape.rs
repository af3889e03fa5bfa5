//! Streamtape: content id plus the split "ip token" from the robot link.
//!
//! The page assembles its download link as
//! `'//streamtape.com/get_video?id=..&expires=..&ip=..&token=' + ('xyztoken').substring(1).substring(2)`.
//! The substrings are applied here and the parts are placed into the
//! direct-download template.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::error::{StageContext, StepError};
use crate::http_client::UpstreamClient;
use crate::stream::request::SourceRequest;
use crate::stream::resolver::{fetch_page, MediaKind, ResolvedStream, StepResult, StreamResolver};
use crate::stream::Service;

const DOWNLOAD_BASE: &str = "https://streamtape.com/get_video";

static ROBOT_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"getElementById\(\s*['"][a-z]*link['"]\s*\)\.innerHTML\s*=\s*["']([^"']+)["']\s*\+\s*\(\s*["']([^"']+)["']\s*\)((?:\.substring\(\s*\d+\s*\))*)"#,
    )
    .expect("valid regex")
});

static SUBSTRING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.substring\(\s*(\d+)\s*\)").expect("valid regex"));

static CONTENT_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"/[ev]/([A-Za-z0-9]+)").expect("valid regex"));

#[derive(Debug, Default)]
pub struct StreamtapeResolver;

impl StreamtapeResolver {
    pub fn new() -> Self {
        Self
    }
}

/// Concatenated robot link with its substring calls applied.
fn robot_link(html: &str) -> Option<String> {
    let caps = ROBOT_LINK.captures(html)?;
    let mut tail: String = caps[2].to_string();
    for cut in SUBSTRING.captures_iter(caps.get(3).map_or("", |m| m.as_str())) {
        let skip: usize = cut[1].parse().ok()?;
        tail = tail.chars().skip(skip).collect();
    }
    Some(format!("{}{tail}", &caps[1]))
}

/// Build the direct download URL from the page and the source URL.
fn download_url(html: &str, source_url: &str) -> StepResult<String> {
    let link = robot_link(html).stage("extract ip token")?;
    let link = if link.starts_with("//") {
        format!("https:{link}")
    } else if link.starts_with('/') {
        format!("https:/{link}")
    } else {
        link
    };
    let parsed = Url::parse(&link).stage("extract ip token")?;
    let param = |name: &str| {
        parsed
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    };

    let id = param("id")
        .or_else(|| CONTENT_ID.captures(source_url).map(|c| c[1].to_string()))
        .stage("extract content id")?;
    let (Some(expires), Some(ip), Some(token)) = (param("expires"), param("ip"), param("token")) else {
        return Err(StepError::new("extract ip token", "robot link is missing expires/ip/token"));
    };

    let mut url = Url::parse(DOWNLOAD_BASE).stage("build download url")?;
    url.query_pairs_mut()
        .append_pair("id", &id)
        .append_pair("expires", &expires)
        .append_pair("ip", &ip)
        .append_pair("token", &token)
        .append_pair("stream", "1");
    Ok(url.into())
}

#[async_trait]
impl StreamResolver for StreamtapeResolver {
    fn service(&self) -> Service {
        Service::Streamtape
    }

    async fn resolve(
        &self,
        request: &SourceRequest,
        client: &UpstreamClient,
    ) -> StepResult<ResolvedStream> {
        let page = fetch_page(
            client,
            Service::Streamtape,
            &request.url,
            &request.headers.to_header_map(),
            "fetch page",
        )
        .await?;
        let url = download_url(&page.body, &request.url)?;
        let origin = page.origin();
        Ok(ResolvedStream::new(Service::Streamtape, url, MediaKind::Raw)
            .with_header("referer", &format!("{origin}/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<div id="robotlink">/streamtape.com/get_video?id=AbC</div>
        <script>document.getElementById('robotlink').innerHTML = '//streamtape.com/get_video?id=AbC123&expires=1718000000&ip=F0xyz&token=' + ('xcdR4nd0mT0k3n').substring(1).substring(2);</script>"#;

    #[test]
    fn test_robot_link_applies_substrings() {
        assert_eq!(
            robot_link(PAGE).as_deref(),
            Some("//streamtape.com/get_video?id=AbC123&expires=1718000000&ip=F0xyz&token=R4nd0mT0k3n")
        );
    }

    #[test]
    fn test_download_url_template() {
        let url = download_url(PAGE, "https://streamtape.com/e/AbC123").unwrap();
        assert_eq!(
            url,
            "https://streamtape.com/get_video?id=AbC123&expires=1718000000&ip=F0xyz&token=R4nd0mT0k3n&stream=1"
        );
    }

    #[test]
    fn test_id_from_source_url_when_missing() {
        let page = r#"<script>document.getElementById('norobotlink').innerHTML = '//streamtape.com/get_video?expires=1&ip=2&token=' + ('abcd').substring(2);</script>"#;
        let url = download_url(page, "https://streamtape.com/v/ZZ9/title.mp4").unwrap();
        assert!(url.contains("id=ZZ9"));
        assert!(url.contains("token=cd"));
    }

    #[test]
    fn test_missing_link_names_stage() {
        let err = download_url("<html></html>", "https://streamtape.com/e/x").unwrap_err();
        assert_eq!(err.stage, "extract ip token");
    }
}
