pub mod decrypt;
pub mod resolve;
pub mod serve;

use std::path::Path;

use anyhow::{Context, Result};

use streamrelay::ProxyConfig;

/// Configuration from the optional file, then the process environment.
pub fn load_config(path: Option<&Path>) -> Result<ProxyConfig> {
    ProxyConfig::load(path).context("loading configuration")
}
