//! Manifest rewriting: HLS playlists and DASH MPDs converted to HLS.
//!
//! All emitted URIs are proxy links built by [`links::RewriteContext`].

pub mod hls;
pub mod links;
pub mod mpd;

pub use links::{Endpoint, LinkBuilder, ProxyLinks, RewriteContext, RouteState};
pub use mpd::{Mpd, MpdProtection};
