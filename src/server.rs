//! HTTP surface: a thin axum router over [`ProxyEngine`].
//!
//! Handlers decode the query into a [`RouteState`], fold in the
//! `x-api-password` header, call the engine and map [`ProxyError`] to a JSON
//! error body with the error's stable status.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{RawQuery, State};
use axum::http::header::{CONTENT_TYPE, LOCATION, RANGE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::config::ProxyConfig;
use crate::engine::{ManifestFormat, ManifestOutcome, ProxyEngine, HLS_CONTENT_TYPE};
use crate::error::{ProxyError, Result};
use crate::manifest::RouteState;
use crate::relay::{client_status, passthrough_headers};

const PASSWORD_HEADER: &str = "x-api-password";

type AppState = Arc<ProxyEngine>;

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        debug!(status = status.as_u16(), category = self.category(), error = %self, "request failed");
        let body = serde_json::json!({
            "error": self.category(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Router with every proxy endpoint.
pub fn router(engine: Arc<ProxyEngine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/proxy/manifest.m3u8", get(hls_manifest))
        .route("/proxy/hls/manifest.m3u8", get(hls_manifest))
        .route("/proxy/mpd/manifest.m3u8", get(mpd_manifest))
        .route("/proxy/stream", get(stream))
        .route("/key", get(key))
        .route("/decrypt/init.mp4", get(decrypt_init))
        .route("/decrypt/segment.mp4", get(decrypt_segment))
        .route("/license", get(license).post(license))
        .route("/playlist", get(playlist))
        .route("/extractor/video", get(extractor))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

/// Bind and serve until the process is stopped.
pub async fn serve(engine: ProxyEngine) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", engine.config().bind, engine.config().port)
        .parse()
        .map_err(|e| ProxyError::Config(format!("invalid bind address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::Config(format!("cannot bind {addr}: {e}")))?;
    info!(%addr, "streamrelay listening");
    axum::serve(listener, router(Arc::new(engine)))
        .await
        .map_err(|e| ProxyError::Config(format!("server stopped: {e}")))
}

/// Route state from the query, with the header password as a fallback.
/// The password is checked before the rest of the query is decoded, so an
/// unauthenticated caller cannot tell a malformed key from a good one.
fn route_state(config: &ProxyConfig, query: Option<&str>, headers: &HeaderMap) -> Result<RouteState> {
    let query = query.unwrap_or("");
    let password = RouteState::password_in(query).or_else(|| {
        headers
            .get(PASSWORD_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });
    config.check_password(password.as_deref())?;
    let mut state = RouteState::from_query(query)?;
    state.api_password = password;
    Ok(state)
}

/// Public base URL the client used to reach this proxy.
fn public_base(headers: &HeaderMap) -> String {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let scheme = header("x-forwarded-proto").unwrap_or("http");
    let host = header("x-forwarded-host").or_else(|| header("host")).unwrap_or("localhost");
    format!("{scheme}://{host}")
}

fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(LOCATION, value)]).into_response(),
        Err(_) => ProxyError::rewrite("redirect target is not a valid header value").into_response(),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
    }))
}

async fn manifest(engine: &ProxyEngine, query: Option<&str>, headers: &HeaderMap, format: ManifestFormat) -> Result<Response> {
    let state = route_state(engine.config(), query, headers)?;
    let links = engine.links(&public_base(headers));
    Ok(match engine.manifest(&state, links, format).await? {
        ManifestOutcome::Playlist(text) => ([(CONTENT_TYPE, HLS_CONTENT_TYPE)], text).into_response(),
        ManifestOutcome::Redirect(link) => found(&link),
    })
}

async fn hls_manifest(State(engine): State<AppState>, RawQuery(query): RawQuery, headers: HeaderMap) -> Result<Response> {
    manifest(&engine, query.as_deref(), &headers, ManifestFormat::Auto).await
}

async fn mpd_manifest(State(engine): State<AppState>, RawQuery(query): RawQuery, headers: HeaderMap) -> Result<Response> {
    manifest(&engine, query.as_deref(), &headers, ManifestFormat::Mpd).await
}

/// Streams the upstream body; dropping the response body on client
/// disconnect drops the upstream connection with it.
async fn stream(State(engine): State<AppState>, RawQuery(query): RawQuery, headers: HeaderMap) -> Result<Response> {
    let state = route_state(engine.config(), query.as_deref(), &headers)?;
    let upstream = engine.open_stream(&state, headers.get(RANGE)).await?;
    let status = client_status(upstream.status());
    let forwarded = passthrough_headers(upstream.headers());
    let body = Body::from_stream(upstream.bytes_stream());
    Ok((status, forwarded, body).into_response())
}

async fn key(State(engine): State<AppState>, RawQuery(query): RawQuery, headers: HeaderMap) -> Result<Response> {
    let state = route_state(engine.config(), query.as_deref(), &headers)?;
    let key = engine.key(&state).await?;
    Ok(([(CONTENT_TYPE, "application/octet-stream")], key).into_response())
}

async fn decrypt_init(State(engine): State<AppState>, RawQuery(query): RawQuery, headers: HeaderMap) -> Result<Response> {
    let state = route_state(engine.config(), query.as_deref(), &headers)?;
    let init = engine.decrypt_init(&state).await?;
    Ok(([(CONTENT_TYPE, "video/mp4")], init).into_response())
}

async fn decrypt_segment(State(engine): State<AppState>, RawQuery(query): RawQuery, headers: HeaderMap) -> Result<Response> {
    let state = route_state(engine.config(), query.as_deref(), &headers)?;
    let segment = engine.decrypt_segment(&state).await?;
    Ok(([(CONTENT_TYPE, "video/mp4")], segment).into_response())
}

/// ClearKey license from `clearkey`, or the request body forwarded to the
/// license server in `url`.
async fn license(State(engine): State<AppState>, RawQuery(query): RawQuery, headers: HeaderMap, body: Bytes) -> Result<Response> {
    let state = route_state(engine.config(), query.as_deref(), &headers)?;
    if state.drm.is_some() {
        return Ok(Json(engine.license(&state)?).into_response());
    }
    let answer = engine.forward_license(&state, body).await?;
    Ok(([(CONTENT_TYPE, "application/json")], answer).into_response())
}

async fn playlist(State(engine): State<AppState>, RawQuery(query): RawQuery, headers: HeaderMap) -> Result<Response> {
    let state = route_state(engine.config(), query.as_deref(), &headers)?;
    let definitions = state
        .url
        .as_deref()
        .ok_or_else(|| ProxyError::bad_request("missing 'url' parameter"))?;
    let links = engine.links(&public_base(&headers));
    let merged = engine
        .playlist(definitions, state.api_password.as_deref(), links)
        .await?;
    Ok(([(CONTENT_TYPE, HLS_CONTENT_TYPE)], merged).into_response())
}

async fn extractor(State(engine): State<AppState>, RawQuery(query): RawQuery, headers: HeaderMap) -> Result<Response> {
    let state = route_state(engine.config(), query.as_deref(), &headers)?;
    let links = engine.links(&public_base(&headers));
    let info = engine.extract(&state, &links).await?;
    if state.redirect_stream {
        return Ok(found(&info.proxy_url));
    }
    Ok(Json(info).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_base_prefers_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("10.0.0.5:7860"));
        assert_eq!(public_base(&headers), "http://10.0.0.5:7860");
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("relay.example"));
        assert_eq!(public_base(&headers), "https://relay.example");
    }

    #[test]
    fn test_password_header_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(PASSWORD_HEADER, HeaderValue::from_static("hdr"));
        let config = ProxyConfig::default();
        let state = route_state(&config, Some("d=x"), &headers).unwrap();
        assert_eq!(state.api_password.as_deref(), Some("hdr"));
        let state = route_state(&config, Some("d=x&api_password=q"), &headers).unwrap();
        assert_eq!(state.api_password.as_deref(), Some("q"));
    }

    #[test]
    fn test_password_checked_before_query_decoding() {
        let config = ProxyConfig {
            api_password: Some("pw".into()),
            ..ProxyConfig::default()
        };
        let headers = HeaderMap::new();
        let err = route_state(&config, Some("d=x&clearkey=zz:yy&depth=many"), &headers).unwrap_err();
        assert_eq!(err, ProxyError::Unauthorized);

        let err = route_state(&config, Some("d=x&clearkey=zz:yy&api_password=pw"), &headers).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let state = route_state(&config, Some("d=x&api_password=pw"), &headers).unwrap();
        assert_eq!(state.api_password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_error_response_status() {
        let resp = ProxyError::UpstreamRejected { status: 404 }.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = ProxyError::Unauthorized.into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
