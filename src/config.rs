//! Process configuration.
//!
//! Read once at start-up (TOML file first, environment on top) into a
//! [`ProxyConfig`] that is shared by reference with every request handler.
//! Nothing below this module reads the environment.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::stream::Service;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 7860;

/// Default bound on nested playlist depth.
pub const DEFAULT_MAX_PLAYLIST_DEPTH: usize = 3;

/// Cache lifetimes and capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    ttl: HashMap<Service, Duration>,
    /// How long a failed resolution is remembered.
    pub negative_ttl: Duration,
    /// Maximum number of cached resolutions.
    pub capacity: u64,
}

impl CachePolicy {
    /// TTL for a service, falling back to its built-in default.
    pub fn ttl_for(&self, service: Service) -> Duration {
        self.ttl
            .get(&service)
            .copied()
            .unwrap_or_else(|| service.default_ttl())
    }

    #[must_use]
    pub fn with_ttl(mut self, service: Service, ttl: Duration) -> Self {
        self.ttl.insert(service, ttl);
        self
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: Service::ALL.iter().map(|s| (*s, s.default_ttl())).collect(),
            negative_ttl: Duration::from_secs(10),
            capacity: 1024,
        }
    }
}

/// Retry and timeout settings for upstream fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPolicy {
    /// Retries after the first attempt on transient failures.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// URL-pattern based proxy route. The first route whose pattern is a
/// substring of the outbound URL wins.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransportRoute {
    #[serde(rename = "url")]
    pub pattern: String,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub disable_ssl: bool,
}

/// Outbound proxy endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySettings {
    pub global: Vec<String>,
    pub per_service: HashMap<Service, Vec<String>>,
    pub routes: Vec<TransportRoute>,
}

/// Result of proxy selection for one outbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyChoice {
    pub proxy: Option<String>,
    pub disable_ssl: bool,
}

impl ProxySettings {
    /// Pick the proxy for an outbound URL: transport route, then service
    /// proxies, then global proxies. Multiple candidates are chosen at random
    /// to spread load.
    pub fn select(&self, url: &str, service: Service) -> ProxyChoice {
        if let Some(route) = self.routes.iter().find(|r| url.contains(&r.pattern)) {
            return ProxyChoice {
                proxy: route.proxy.clone().filter(|p| !p.is_empty()),
                disable_ssl: route.disable_ssl,
            };
        }
        let candidates = self
            .per_service
            .get(&service)
            .filter(|list| !list.is_empty())
            .unwrap_or(&self.global);
        ProxyChoice {
            proxy: candidates.choose(&mut rand::thread_rng()).cloned(),
            disable_ssl: false,
        }
    }

    /// Every distinct proxy URL that may be selected.
    pub fn all_endpoints(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .global
            .iter()
            .chain(self.per_service.values().flatten())
            .map(String::as_str)
            .chain(self.routes.iter().filter_map(|r| r.proxy.as_deref()))
            .filter(|p| !p.is_empty())
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

/// Complete proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub api_password: Option<String>,
    pub bind: String,
    pub port: u16,
    pub proxies: ProxySettings,
    pub cache: CachePolicy,
    pub relay: RelayPolicy,
    pub max_playlist_depth: usize,
    /// Pick a random Chrome or Firefox identity per client pool instead of
    /// the fixed desktop Chrome one.
    pub random_profile: bool,
    /// Decrypt the next numbered segments in the background.
    pub prefetch_segments: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            api_password: None,
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            proxies: ProxySettings::default(),
            cache: CachePolicy::default(),
            relay: RelayPolicy::default(),
            max_playlist_depth: DEFAULT_MAX_PLAYLIST_DEPTH,
            random_profile: false,
            prefetch_segments: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    api_password: Option<String>,
    bind: Option<String>,
    port: Option<u16>,
    max_playlist_depth: Option<usize>,
    random_profile: Option<bool>,
    prefetch_segments: Option<bool>,
    cache: FileCache,
    proxies: FileProxies,
    relay: FileRelay,
    routes: Vec<TransportRoute>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileCache {
    capacity: Option<u64>,
    negative_ttl_secs: Option<u64>,
    ttl: HashMap<String, u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileProxies {
    global: Vec<String>,
    service: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileRelay {
    retries: Option<u32>,
    connect_timeout_secs: Option<u64>,
    read_timeout_secs: Option<u64>,
}

impl ProxyConfig {
    /// Load configuration: optional TOML file, then process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    ProxyError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        base.apply_env(|key| std::env::var(key).ok())
    }

    /// Parse a TOML document on top of the defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: FileConfig =
            toml::from_str(text).map_err(|e| ProxyError::Config(e.to_string()))?;
        let mut config = Self::default();

        config.api_password = file.api_password.filter(|p| !p.is_empty());
        if let Some(bind) = file.bind {
            config.bind = bind;
        }
        if let Some(port) = file.port {
            config.port = port;
        }
        if let Some(depth) = file.max_playlist_depth {
            config.max_playlist_depth = depth;
        }
        if let Some(random) = file.random_profile {
            config.random_profile = random;
        }
        if let Some(prefetch) = file.prefetch_segments {
            config.prefetch_segments = prefetch;
        }
        if let Some(capacity) = file.cache.capacity {
            config.cache.capacity = capacity;
        }
        if let Some(secs) = file.cache.negative_ttl_secs {
            config.cache.negative_ttl = Duration::from_secs(secs);
        }
        for (name, secs) in file.cache.ttl {
            config
                .cache
                .ttl
                .insert(parse_service(&name)?, Duration::from_secs(secs));
        }
        config.proxies.global = file.proxies.global;
        for (name, list) in file.proxies.service {
            config.proxies.per_service.insert(parse_service(&name)?, list);
        }
        config.proxies.routes = file.routes;
        if let Some(retries) = file.relay.retries {
            config.relay.max_retries = retries;
        }
        if let Some(secs) = file.relay.connect_timeout_secs {
            config.relay.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.relay.read_timeout_secs {
            config.relay.read_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    /// Overlay environment variables, looked up through `lookup`.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string());

        if let Some(password) = get("API_PASSWORD") {
            self.api_password = Some(password).filter(|p| !p.is_empty());
        }
        if let Some(bind) = get("BIND").filter(|b| !b.is_empty()) {
            self.bind = bind;
        }
        if let Some(port) = get("PORT") {
            self.port = parse_number("PORT", &port)?;
        }
        if let Some(depth) = get("MAX_PLAYLIST_DEPTH") {
            self.max_playlist_depth = parse_number("MAX_PLAYLIST_DEPTH", &depth)?;
        }
        if let Some(flag) = get("RANDOM_BROWSER_PROFILE") {
            self.random_profile = parse_flag(&flag);
        }
        if let Some(flag) = get("PREFETCH_SEGMENTS") {
            self.prefetch_segments = parse_flag(&flag);
        }
        if let Some(list) = get("GLOBAL_PROXY") {
            self.proxies.global = split_list(&list);
        }
        if let Some(routes) = get("TRANSPORT_ROUTES") {
            self.proxies.routes = parse_transport_routes(&routes)?;
        }
        for service in Service::ALL {
            let key = service.env_key();
            if let Some(list) = get(&format!("{key}_PROXY")) {
                self.proxies.per_service.insert(service, split_list(&list));
            }
            let ttl_key = format!("CACHE_TTL_{key}");
            if let Some(secs) = get(&ttl_key) {
                let secs: u64 = parse_number(&ttl_key, &secs)?;
                self.cache.ttl.insert(service, Duration::from_secs(secs));
            }
        }
        if let Some(capacity) = get("CACHE_CAPACITY") {
            self.cache.capacity = parse_number("CACHE_CAPACITY", &capacity)?;
        }
        if let Some(secs) = get("NEGATIVE_CACHE_TTL") {
            let secs: u64 = parse_number("NEGATIVE_CACHE_TTL", &secs)?;
            self.cache.negative_ttl = Duration::from_secs(secs);
        }
        if let Some(retries) = get("RELAY_RETRIES") {
            self.relay.max_retries = parse_number("RELAY_RETRIES", &retries)?;
        }
        if let Some(secs) = get("UPSTREAM_CONNECT_TIMEOUT") {
            let secs: u64 = parse_number("UPSTREAM_CONNECT_TIMEOUT", &secs)?;
            self.relay.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = get("UPSTREAM_READ_TIMEOUT") {
            let secs: u64 = parse_number("UPSTREAM_READ_TIMEOUT", &secs)?;
            self.relay.read_timeout = Duration::from_secs(secs);
        }

        debug!(
            global_proxies = self.proxies.global.len(),
            routes = self.proxies.routes.len(),
            password_set = self.api_password.is_some(),
            "configuration loaded"
        );
        Ok(self)
    }

    /// Gate a request on the configured API password.
    pub fn check_password(&self, supplied: Option<&str>) -> Result<()> {
        match &self.api_password {
            None => Ok(()),
            Some(expected) if supplied == Some(expected.as_str()) => Ok(()),
            Some(_) => Err(ProxyError::Unauthorized),
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| ProxyError::Config(format!("{key} must be a number, got '{value}'")))
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_service(name: &str) -> Result<Service> {
    name.parse().map_err(ProxyError::Config)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `{URL=pattern, PROXY=url, DISABLE_SSL=true}, {...}`.
fn parse_transport_routes(value: &str) -> Result<Vec<TransportRoute>> {
    let mut routes = Vec::new();
    for block in value.split('}') {
        let block = block.trim().trim_start_matches(',').trim();
        let Some(body) = block.strip_prefix('{') else {
            if block.is_empty() {
                continue;
            }
            return Err(ProxyError::Config(format!(
                "TRANSPORT_ROUTES entry must be wrapped in braces: '{block}'"
            )));
        };

        let mut route = TransportRoute {
            pattern: String::new(),
            proxy: None,
            disable_ssl: false,
        };
        for field in body.split(',') {
            let Some((key, val)) = field.split_once('=') else {
                continue;
            };
            let val = val.trim();
            match key.trim().to_ascii_uppercase().as_str() {
                "URL" => route.pattern = val.to_string(),
                "PROXY" => route.proxy = Some(val.to_string()).filter(|p| !p.is_empty()),
                "DISABLE_SSL" => {
                    route.disable_ssl = parse_flag(val);
                }
                _ => {}
            }
        }
        if route.pattern.is_empty() {
            return Err(ProxyError::Config(
                "TRANSPORT_ROUTES entry is missing URL=".to_string(),
            ));
        }
        routes.push(route);
    }
    Ok(routes)
}
