//! `streamrelay` - streaming media proxy core
//!
//! # Features
//!
//! - **Resolution**: per-service resolvers (Vavoo, DLHD, Sportsonline, VixSrc,
//!   VOE, Streamtape, Mixdrop, generic HLS/DASH) behind one registry
//! - **Caching**: single-flight extraction cache with per-service TTLs,
//!   negative caching and an LRU bound
//! - **Rewriting**: HLS manifests re-routed through the proxy, DASH MPDs
//!   converted to HLS
//! - **DRM**: ClearKey descriptors and server-side CENC (AES-CTR) decryption
//! - **Relay**: retrying, streaming pass-through for segments and keys
//! - **Segments**: decrypted segment cache with read-ahead prefetch
//!
//! # Example
//!
//! ```rust,no_run
//! use streamrelay::{ProxyConfig, ProxyEngine};
//! use streamrelay::stream::SourceRequest;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = ProxyEngine::new(ProxyConfig::default())?;
//!     let stream = engine.resolve(&SourceRequest::new("https://cdn.example/live.m3u8")).await?;
//!     println!("{} -> {}", stream.service, stream.url);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod drm;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod http_client;
pub mod manifest;
pub mod playlist;
pub mod relay;
pub mod segments;
pub mod server;
pub mod stream;

pub use config::{CachePolicy, ProxyConfig, RelayPolicy};
pub use drm::DrmDescriptor;
pub use engine::{ManifestFormat, ManifestOutcome, ProxyEngine};
pub use error::{ProxyError, Result};
pub use fingerprint::{chrome_profile, firefox_profile, random_profile, BrowserProfile};
pub use http_client::UpstreamClient;
pub use playlist::{PlaylistCombiner, PlaylistSpec};
pub use relay::StreamRelay;
pub use stream::{ExtractionCache, ResolvedStream, ResolverRegistry, Service, SourceRequest};

/// Version of streamrelay
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
