use std::path::Path;

use anyhow::Result;

use streamrelay::{server, ProxyEngine};

pub async fn cmd_serve(config: Option<&Path>, port: Option<u16>, bind: Option<String>) -> Result<()> {
    let mut config = super::load_config(config)?;
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(bind) = bind {
        config.bind = bind;
    }

    let engine = ProxyEngine::new(config)?;
    server::serve(engine).await?;
    Ok(())
}
