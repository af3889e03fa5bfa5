use std::path::Path;

use anyhow::{bail, Result};

use streamrelay::stream::{HeaderOverrides, Service, SourceRequest};
use streamrelay::ProxyEngine;

pub async fn cmd_resolve(config: Option<&Path>, url: &str, raw_headers: &[String], host: Option<&str>) -> Result<()> {
    let engine = ProxyEngine::new(super::load_config(config)?)?;

    let mut headers = HeaderOverrides::new();
    for raw in raw_headers {
        let Some((name, value)) = raw.split_once(':') else {
            bail!("header '{raw}' is not in 'Name: value' form");
        };
        headers.insert(name.trim(), value.trim());
    }

    let mut request = SourceRequest::new(url).with_headers(headers);
    if let Some(host) = host {
        let service: Service = host.parse().map_err(anyhow::Error::msg)?;
        request = request.with_service(service);
    }

    eprintln!("🔎 Resolving {url} ({})", request.service);
    let resolved = engine.resolve(&request).await?;
    println!("{}", serde_json::to_string_pretty(&*resolved)?);
    Ok(())
}
