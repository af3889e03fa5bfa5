//! Source resolution: services, resolvers, the registry and the cache.
//!
//! A [`SourceRequest`] is matched to a [`Service`], resolved by that
//! service's [`StreamResolver`] through the [`ResolverRegistry`], and the
//! outcome is memoised in the [`ExtractionCache`].

pub mod cache;
pub mod deobfuscate;
pub mod registry;
pub mod request;
pub mod resolver;
pub mod resolvers;
pub mod service;

pub use cache::{CacheEntry, EntryState, ExtractionCache};
pub use registry::ResolverRegistry;
pub use request::{CacheKey, DrmHint, HeaderOverrides, SourceRequest};
pub use resolver::{MediaKind, ResolvedStream, StreamResolver};
pub use service::Service;
