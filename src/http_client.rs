//! Pooled upstream HTTP clients.
//!
//! One reqwest [`Client`] per distinct outbound route (direct, or through a
//! given forward proxy). Clients are built lazily and kept for the life of the
//! process so connections to the same edge host are reused across requests:
//! - HTTP/2 multiplexing with adaptive window
//! - TLS via rustls
//! - Brotli, Zstd, Gzip, Deflate decompression
//! - Connection pooling with keep-alive
//! - Browser identity headers from a [`BrowserProfile`]

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder};
use tracing::{debug, info};

use crate::config::{ProxyConfig, ProxySettings, RelayPolicy};
use crate::error::{ProxyError, Result};
use crate::fingerprint::{default_profile, random_profile, BrowserProfile, RequestKind};
use crate::stream::Service;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    proxy: Option<String>,
    insecure: bool,
}

/// Shared upstream client pool.
pub struct UpstreamClient {
    proxies: ProxySettings,
    policy: RelayPolicy,
    profile: BrowserProfile,
    clients: RwLock<HashMap<RouteKey, Client>>,
}

impl UpstreamClient {
    /// Build the pool. Every configured proxy URL is validated up front so a
    /// typo fails at start-up instead of on the first request.
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let profile = if config.random_profile {
            random_profile()
        } else {
            default_profile()
        };
        debug!(user_agent = %profile.user_agent, "browser profile selected");
        Self::with_profile(config, profile)
    }

    pub fn with_profile(config: &ProxyConfig, profile: BrowserProfile) -> Result<Self> {
        let pool = Self {
            proxies: config.proxies.clone(),
            policy: config.relay.clone(),
            profile,
            clients: RwLock::new(HashMap::new()),
        };

        let direct = RouteKey {
            proxy: None,
            insecure: false,
        };
        let client = pool.build(&direct)?;
        pool.clients.write().insert(direct, client);

        for endpoint in pool.proxies.all_endpoints() {
            reqwest::Proxy::all(endpoint)
                .map_err(|e| ProxyError::Config(format!("invalid proxy '{endpoint}': {e}")))?;
        }
        info!(
            proxies = pool.proxies.all_endpoints().len(),
            "upstream client pool ready"
        );
        Ok(pool)
    }

    fn build(&self, key: &RouteKey) -> Result<Client> {
        let mut builder = Client::builder()
            // Let the server negotiate HTTP/2
            .http2_adaptive_window(true)
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .use_rustls_tls()
            .brotli(true)
            .zstd(true)
            .gzip(true)
            .deflate(true)
            .default_headers(self.profile.identity_headers())
            // Per-call timeouts; no total timeout so long segments can stream
            .connect_timeout(self.policy.connect_timeout)
            .read_timeout(self.policy.read_timeout)
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(proxy) = &key.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| ProxyError::Config(format!("invalid proxy '{proxy}': {e}")))?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }
        if key.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }

        builder
            .build()
            .map_err(|e| ProxyError::Config(format!("cannot build HTTP client: {e}")))
    }

    /// Client for an outbound URL, applying proxy routing for `service`.
    pub fn client_for(&self, url: &str, service: Service) -> Result<Client> {
        let choice = self.proxies.select(url, service);
        let key = RouteKey {
            proxy: choice.proxy,
            insecure: choice.disable_ssl,
        };

        if let Some(client) = self.clients.read().get(&key) {
            return Ok(client.clone());
        }

        debug!(proxy = ?key.proxy, insecure = key.insecure, "building upstream client");
        let client = self.build(&key)?;
        Ok(self.clients.write().entry(key).or_insert(client).clone())
    }

    /// GET request with the profile's headers for `kind`, then `extra`
    /// headers layered on top.
    pub fn get(
        &self,
        url: &str,
        service: Service,
        kind: RequestKind,
        extra: &HeaderMap,
    ) -> Result<RequestBuilder> {
        let client = self.client_for(url, service)?;
        Ok(client.get(url).headers(self.merged(kind, extra)))
    }

    /// POST request, same header layering as [`UpstreamClient::get`].
    pub fn post(
        &self,
        url: &str,
        service: Service,
        kind: RequestKind,
        extra: &HeaderMap,
    ) -> Result<RequestBuilder> {
        let client = self.client_for(url, service)?;
        Ok(client.post(url).headers(self.merged(kind, extra)))
    }

    fn merged(&self, kind: RequestKind, extra: &HeaderMap) -> HeaderMap {
        let mut headers = self.profile.headers_for(kind);
        for (name, value) in extra {
            headers.insert(name.clone(), value.clone());
        }
        headers
    }

    pub fn profile(&self) -> &BrowserProfile {
        &self.profile
    }

    pub fn policy(&self) -> &RelayPolicy {
        &self.policy
    }

    /// Number of distinct routes with a live client.
    pub fn pooled_routes(&self) -> usize {
        self.clients.read().len()
    }
}
