//! DLHD: channel pages behind an auth handshake.
//!
//! Handshake: channel page → player iframe → inline auth parameters
//! (`channelKey`, `authTs`, `authRnd`, `authSig`, possibly `atob` wrapped) →
//! `auth.php` exchange (sets session cookies) → `server_lookup` for the edge
//! server key → edge playlist URL.
//!
//! The resulting session (cookies, referer, edge URL) is kept per source in
//! a small state machine and reused until it expires with the cache entry or
//! the edge answers 403. A 403 drops the session and triggers exactly one
//! fresh handshake.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use reqwest::header::SET_COOKIE;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{StageContext, StepError};
use crate::fingerprint::RequestKind;
use crate::http_client::UpstreamClient;
use crate::stream::deobfuscate::decode_base64_any;
use crate::stream::request::{CacheKey, HeaderOverrides, SourceRequest};
use crate::stream::resolver::{fetch_api, fetch_page, MediaKind, ResolvedStream, StepResult, StreamResolver};
use crate::stream::Service;

/// Edge playlist template; `{server_key}` and `{channel_key}` are filled in.
pub const DEFAULT_EDGE_TEMPLATE: &str = "https://{server_key}new.newkso.ru/{server_key}/{channel_key}/mono.m3u8";

/// The `top1/cdn` server key uses its own host layout.
const TOP1_EDGE_TEMPLATE: &str = "https://top1.newkso.ru/top1/cdn/{channel_key}/mono.m3u8";

static AUTH_VARS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?:const|var|let)\s+(channelKey|authTs|authRnd|authSig)\s*=\s*(atob\(\s*)?["']([^"']*)["']"#,
    )
    .expect("valid regex")
});

static AUTH_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"["']([^"'\s]*/auth\.php)"#).expect("valid regex"));

static LOOKUP_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"["']([^"'\s]*server_lookup(?:\.php)?)\?channel_id="#).expect("valid regex"));

/// Auth parameters embedded in the player page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthParams {
    pub channel_key: String,
    pub ts: String,
    pub rnd: String,
    pub sig: String,
}

impl AuthParams {
    /// Collect the four variables; `atob("...")` values are base64 decoded.
    pub fn parse(script: &str) -> Option<Self> {
        let mut found = HashMap::new();
        for caps in AUTH_VARS.captures_iter(script) {
            let raw = &caps[3];
            let value = if caps.get(2).is_some() {
                String::from_utf8(decode_base64_any(raw)?).ok()?
            } else {
                raw.to_string()
            };
            found.entry(caps[1].to_string()).or_insert(value);
        }
        Some(Self {
            channel_key: found.remove("channelKey")?,
            ts: found.remove("authTs")?,
            rnd: found.remove("authRnd")?,
            sig: found.remove("authSig")?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ServerLookup {
    server_key: String,
}

/// An authenticated DLHD session for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub channel_key: String,
    pub edge_url: String,
    pub headers: HeaderOverrides,
    pub established: Instant,
}

/// Per-source session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Handshaking,
    Authenticated(Session),
    /// The edge refused the session; the next resolve handshakes again.
    Invalidated,
}

pub struct DlhdResolver {
    sessions: Mutex<HashMap<CacheKey, SessionState>>,
    session_ttl: Duration,
    edge_template: String,
}

impl DlhdResolver {
    pub fn new(session_ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            session_ttl,
            edge_template: DEFAULT_EDGE_TEMPLATE.to_string(),
        }
    }

    #[must_use]
    pub fn with_edge_template(mut self, template: impl Into<String>) -> Self {
        self.edge_template = template.into();
        self
    }

    pub fn state(&self, key: &CacheKey) -> SessionState {
        self.sessions
            .lock()
            .get(key)
            .cloned()
            .unwrap_or(SessionState::Unauthenticated)
    }

    /// Move `key` to `next`. Other sources keep an entry only while they
    /// hold a live session, so the map is bounded by the live channels plus
    /// the one being transitioned.
    fn transition(&self, key: &CacheKey, next: SessionState) {
        let mut sessions = self.sessions.lock();
        let ttl = self.session_ttl;
        sessions.retain(|k, state| {
            k == key || matches!(state, SessionState::Authenticated(s) if s.established.elapsed() < ttl)
        });
        match next {
            SessionState::Unauthenticated => {
                sessions.remove(key);
            }
            next => {
                sessions.insert(key.clone(), next);
            }
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.sessions.lock().len()
    }

    fn live_session(&self, key: &CacheKey) -> Option<Session> {
        match self.sessions.lock().get(key) {
            Some(SessionState::Authenticated(session)) if session.established.elapsed() < self.session_ttl => {
                Some(session.clone())
            }
            _ => None,
        }
    }

    fn edge_url(&self, server_key: &str, channel_key: &str) -> String {
        let template = if server_key == "top1/cdn" {
            TOP1_EDGE_TEMPLATE
        } else {
            &self.edge_template
        };
        template
            .replace("{server_key}", server_key)
            .replace("{channel_key}", channel_key)
    }

    async fn session_for(
        &self,
        key: &CacheKey,
        request: &SourceRequest,
        client: &UpstreamClient,
    ) -> StepResult<Session> {
        if let Some(session) = self.live_session(key) {
            debug!(channel = %session.channel_key, "reusing DLHD session");
            return Ok(session);
        }
        self.transition(key, SessionState::Handshaking);
        match self.handshake(request, client).await {
            Ok(session) => {
                info!(channel = %session.channel_key, "DLHD session established");
                self.transition(key, SessionState::Authenticated(session.clone()));
                Ok(session)
            }
            Err(e) => {
                self.transition(key, SessionState::Unauthenticated);
                Err(e)
            }
        }
    }

    async fn handshake(&self, request: &SourceRequest, client: &UpstreamClient) -> StepResult<Session> {
        let page = fetch_page(
            client,
            Service::Dlhd,
            &request.url,
            &request.headers.to_header_map(),
            "fetch channel page",
        )
        .await?;

        let player = match page.iframe_src() {
            Some(src) => {
                let mut headers = HeaderOverrides::new();
                headers.insert("referer", &format!("{}/", page.origin()));
                fetch_page(client, Service::Dlhd, &src, &headers.to_header_map(), "fetch player page").await?
            }
            None => page,
        };

        let auth = AuthParams::parse(&player.body).stage("extract auth token")?;
        let player_origin = player.origin();
        let mut headers = HeaderOverrides::new();
        headers.insert("referer", &format!("{player_origin}/"));
        headers.insert("origin", &player_origin);

        let auth_url = AUTH_URL
            .captures(&player.body)
            .and_then(|c| player.join(&c[1]))
            .unwrap_or_else(|| format!("{player_origin}/auth.php"));
        let cookies = exchange_token(client, &auth_url, &auth, &headers).await?;
        if !cookies.is_empty() {
            headers.insert("cookie", &cookies);
        }

        let lookup_base = LOOKUP_URL
            .captures(&player.body)
            .and_then(|c| player.join(&c[1]))
            .unwrap_or_else(|| format!("{player_origin}/server_lookup.php"));
        let lookup_url = format!(
            "{lookup_base}?channel_id={}",
            urlencoding::encode(&auth.channel_key)
        );
        let lookup = fetch_api(client, Service::Dlhd, &lookup_url, &headers.to_header_map(), "lookup edge server").await?;
        let server: ServerLookup = serde_json::from_str(&lookup.body).stage("lookup edge server")?;

        Ok(Session {
            edge_url: self.edge_url(&server.server_key, &auth.channel_key),
            channel_key: auth.channel_key,
            headers,
            established: Instant::now(),
        })
    }
}

/// Call the auth endpoint and return the cookies it sets as one `Cookie`
/// header value.
async fn exchange_token(
    client: &UpstreamClient,
    auth_url: &str,
    auth: &AuthParams,
    headers: &HeaderOverrides,
) -> StepResult<String> {
    const STAGE: &str = "exchange auth token";
    let response = client
        .get(auth_url, Service::Dlhd, RequestKind::Api, &headers.to_header_map())
        .stage(STAGE)?
        .query(&[
            ("channel_id", auth.channel_key.as_str()),
            ("ts", auth.ts.as_str()),
            ("rnd", auth.rnd.as_str()),
            ("sig", auth.sig.as_str()),
        ])
        .send()
        .await
        .stage(STAGE)?;
    let status = response.status();
    if !status.is_success() {
        return Err(StepError::status(STAGE, status.as_u16()));
    }
    let cookies: Vec<String> = response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .map(|pair| pair.trim().to_string())
        .filter(|pair| pair.contains('='))
        .collect();

    let body = response.text().await.stage(STAGE)?;
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(&body) {
        if json.get("status").and_then(|s| s.as_str()).is_some_and(|s| s != "ok") {
            return Err(StepError::new(STAGE, format!("auth rejected: {}", json["status"])));
        }
    }
    Ok(cookies.join("; "))
}

/// GET the edge playlist with the session headers.
async fn check_edge(client: &UpstreamClient, session: &Session) -> StepResult<()> {
    const STAGE: &str = "check edge stream";
    let response = client
        .get(&session.edge_url, Service::Dlhd, RequestKind::Media, &session.headers.to_header_map())
        .stage(STAGE)?
        .send()
        .await
        .stage(STAGE)?;
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(StepError::status(STAGE, status.as_u16()))
    }
}

#[async_trait]
impl StreamResolver for DlhdResolver {
    fn service(&self) -> Service {
        Service::Dlhd
    }

    async fn resolve(
        &self,
        request: &SourceRequest,
        client: &UpstreamClient,
    ) -> StepResult<ResolvedStream> {
        let key = request.cache_key();
        let mut retried = false;
        loop {
            let session = self.session_for(&key, request, client).await?;
            match check_edge(client, &session).await {
                Ok(()) => {
                    return Ok(ResolvedStream::new(Service::Dlhd, session.edge_url, MediaKind::Hls)
                        .with_headers(&session.headers));
                }
                Err(e) if e.is_forbidden() && !retried => {
                    warn!(channel = %session.channel_key, "edge refused DLHD session, handshaking again");
                    self.invalidate(&key);
                    retried = true;
                }
                Err(e) => {
                    self.invalidate(&key);
                    return Err(e);
                }
            }
        }
    }

    fn invalidate(&self, key: &CacheKey) {
        if matches!(self.state(key), SessionState::Authenticated(_)) {
            debug!(key = %key, "DLHD session invalidated");
        }
        self.transition(key, SessionState::Invalidated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYER: &str = r#"
        <script>
          const channelKey = "premium51";
          var authTs = "1718000000";
          let authRnd = atob("YWJjMTIz");
          const authSig = 'c2lnbmF0dXJl';
          fetchWithRetry('https://auth.example/auth.php', {});
          fetch('/server_lookup.php?channel_id=' + channelKey);
        </script>"#;

    #[test]
    fn test_auth_params_parse() {
        let auth = AuthParams::parse(PLAYER).unwrap();
        assert_eq!(auth.channel_key, "premium51");
        assert_eq!(auth.ts, "1718000000");
        assert_eq!(auth.rnd, "abc123");
        // Only atob() values are decoded.
        assert_eq!(auth.sig, "c2lnbmF0dXJl");
    }

    #[test]
    fn test_auth_params_missing_field() {
        assert!(AuthParams::parse(r#"const channelKey = "x";"#).is_none());
    }

    #[test]
    fn test_endpoint_discovery() {
        assert_eq!(&AUTH_URL.captures(PLAYER).unwrap()[1], "https://auth.example/auth.php");
        assert_eq!(&LOOKUP_URL.captures(PLAYER).unwrap()[1], "/server_lookup.php");
    }

    #[test]
    fn test_edge_url_templates() {
        let resolver = DlhdResolver::new(Duration::from_secs(60));
        assert_eq!(
            resolver.edge_url("wind", "premium51"),
            "https://windnew.newkso.ru/wind/premium51/mono.m3u8"
        );
        assert_eq!(
            resolver.edge_url("top1/cdn", "premium51"),
            "https://top1.newkso.ru/top1/cdn/premium51/mono.m3u8"
        );
        let local = DlhdResolver::new(Duration::from_secs(60))
            .with_edge_template("http://127.0.0.1:9/{server_key}/{channel_key}.m3u8");
        assert_eq!(local.edge_url("a", "b"), "http://127.0.0.1:9/a/b.m3u8");
    }

    fn session() -> Session {
        Session {
            channel_key: "premium51".into(),
            edge_url: "https://edge/premium51/mono.m3u8".into(),
            headers: HeaderOverrides::new(),
            established: Instant::now(),
        }
    }

    #[test]
    fn test_session_state_machine() {
        let resolver = DlhdResolver::new(Duration::from_secs(60));
        let key = CacheKey::new("https://dlhd.example/watch.php?id=51", Service::Dlhd);
        assert_eq!(resolver.state(&key), SessionState::Unauthenticated);

        resolver.transition(&key, SessionState::Handshaking);
        assert_eq!(resolver.state(&key), SessionState::Handshaking);
        assert!(resolver.live_session(&key).is_none());

        resolver.transition(&key, SessionState::Authenticated(session()));
        assert!(resolver.live_session(&key).is_some());

        resolver.invalidate(&key);
        assert_eq!(resolver.state(&key), SessionState::Invalidated);
        assert!(resolver.live_session(&key).is_none());
    }

    #[test]
    fn test_sessions_map_stays_bounded() {
        let resolver = DlhdResolver::new(Duration::from_secs(60));
        for id in 0..500 {
            let key = CacheKey::new(&format!("https://dlhd.example/watch.php?id={id}"), Service::Dlhd);
            // Failed handshake.
            resolver.transition(&key, SessionState::Handshaking);
            resolver.transition(&key, SessionState::Unauthenticated);
            // Invalidation of a source never seen before.
            resolver.invalidate(&key);
        }
        assert!(resolver.tracked() <= 1, "{} entries", resolver.tracked());

        let live = CacheKey::new("https://dlhd.example/watch.php?id=live", Service::Dlhd);
        resolver.transition(&live, SessionState::Authenticated(session()));
        for id in 0..50 {
            let key = CacheKey::new(&format!("https://dlhd.example/watch.php?id=gone{id}"), Service::Dlhd);
            resolver.invalidate(&key);
        }
        assert!(resolver.live_session(&live).is_some());
        assert_eq!(resolver.tracked(), 2);
    }

    #[test]
    fn test_expired_session_not_reused() {
        let resolver = DlhdResolver::new(Duration::ZERO);
        let key = CacheKey::new("https://dlhd.example/watch.php?id=51", Service::Dlhd);
        resolver.transition(&key, SessionState::Authenticated(session()));
        assert!(resolver.live_session(&key).is_none());
    }
}
