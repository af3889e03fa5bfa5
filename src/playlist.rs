//! Channel list merging.
//!
//! A playlist request names one or more source M3U lists, each with its own
//! `sort` and `noproxy` options. Sources are fetched concurrently and emitted
//! in request order under a single `#EXTM3U` header; proxied entries are
//! rewritten to manifest links that carry the entry's VLC headers and
//! ClearKey material.

use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};
use url::Url;

use crate::error::{ProxyError, Result};
use crate::fingerprint::RequestKind;
use crate::manifest::{Endpoint, ProxyLinks};
use crate::relay::StreamRelay;
use crate::stream::request::HeaderOverrides;
use crate::stream::Service;

/// One source list with its options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistSpec {
    pub url: String,
    /// Alphabetise this source's entries by channel name.
    pub sort: bool,
    /// Emit this source's entries unchanged.
    pub no_proxy: bool,
}

impl PlaylistSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sort: false,
            no_proxy: false,
        }
    }

    /// Parse `url|sort=true|noproxy=false;url2|...`.
    ///
    /// Definitions are separated by `;`; inside a definition, fields are
    /// separated by `|`. A field starting with `http://` or `https://` is a
    /// source URL; a second URL inside one definition starts a new one, so
    /// `a|sort=true|b` is two sources. Options attach to the source they
    /// follow (or precede, when they come first).
    pub fn parse_list(text: &str) -> Result<Vec<Self>> {
        let mut specs = Vec::new();
        for definition in text.split(';').map(str::trim).filter(|d| !d.is_empty()) {
            let mut current: Option<PlaylistSpec> = None;
            let mut pending: Vec<(String, String)> = Vec::new();

            for field in definition.split('|').map(str::trim).filter(|f| !f.is_empty()) {
                let lowered = field.to_ascii_lowercase();
                if lowered.starts_with("http://") || lowered.starts_with("https://") {
                    if let Some(done) = current.take() {
                        specs.push(done);
                    }
                    let mut spec = PlaylistSpec::new(field);
                    for (key, value) in pending.drain(..) {
                        spec.apply(&key, &value)?;
                    }
                    current = Some(spec);
                } else if let Some((key, value)) = field.split_once('=') {
                    match current.as_mut() {
                        Some(spec) => spec.apply(key, value)?,
                        None => pending.push((key.to_string(), value.to_string())),
                    }
                } else {
                    return Err(ProxyError::bad_request(format!(
                        "playlist field '{field}' is neither a URL nor key=value"
                    )));
                }
            }

            match current {
                Some(spec) => specs.push(spec),
                None => {
                    return Err(ProxyError::bad_request(format!(
                        "playlist definition '{definition}' has no source URL"
                    )))
                }
            }
        }
        if specs.is_empty() {
            return Err(ProxyError::bad_request("no playlist definitions provided"));
        }
        Ok(specs)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let on = matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes");
        match key.trim().to_ascii_lowercase().as_str() {
            "sort" => self.sort = on,
            "noproxy" | "no_proxy" | "no-proxy" => self.no_proxy = on,
            other => {
                return Err(ProxyError::bad_request(format!("unknown playlist option '{other}'")));
            }
        }
        Ok(())
    }
}

/// One channel of a source list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEntry {
    pub name: String,
    /// Directive lines preceding the URL, `#EXTINF` included.
    pub directives: Vec<String>,
    pub url: String,
}

impl ChannelEntry {
    /// Header overrides from `#EXTVLCOPT:http-*` directives.
    pub fn vlc_headers(&self) -> HeaderOverrides {
        let mut headers = HeaderOverrides::new();
        for line in &self.directives {
            let Some(option) = line.strip_prefix("#EXTVLCOPT:") else { continue };
            let Some((key, value)) = option.split_once('=') else { continue };
            let Some(name) = key.trim().to_ascii_lowercase().strip_prefix("http-").map(str::to_string) else {
                continue;
            };
            let name = if name == "referrer" { "referer".to_string() } else { name };
            headers.insert(&name, value);
        }
        headers
    }

    /// `inputstream.adaptive.license_key` value, if any.
    pub fn license_key(&self) -> Option<&str> {
        self.directives.iter().find_map(|line| {
            line.strip_prefix("#KODIPROP:")?
                .trim()
                .strip_prefix("inputstream.adaptive.license_key=")
                .map(str::trim)
                .filter(|v| !v.is_empty())
        })
    }
}

/// A parsed source list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelList {
    /// EPG URLs announced by the header (`url-tvg`, `x-tvg-url`).
    pub epg: Vec<String>,
    pub entries: Vec<ChannelEntry>,
}

impl ChannelList {
    pub fn parse(body: &str) -> Self {
        let mut list = ChannelList::default();
        let mut directives: Vec<String> = Vec::new();

        for line in body.trim_start_matches('\u{feff}').lines().map(str::trim) {
            if line.is_empty() {
                continue;
            }
            if let Some(attrs) = line.strip_prefix("#EXTM3U") {
                for name in ["url-tvg", "x-tvg-url"] {
                    if let Some(value) = tvg_attribute(attrs, name) {
                        list.epg.extend(value.split(',').map(str::trim).filter(|v| !v.is_empty()).map(str::to_string));
                    }
                }
                continue;
            }
            if line.starts_with('#') {
                directives.push(line.to_string());
                continue;
            }
            let name = directives
                .iter()
                .find_map(|d| d.strip_prefix("#EXTINF:").map(channel_name))
                .unwrap_or_default();
            list.entries.push(ChannelEntry {
                name,
                directives: std::mem::take(&mut directives),
                url: line.to_string(),
            });
        }
        list
    }
}

/// Display name after the first comma outside quotes.
fn channel_name(extinf: &str) -> String {
    let mut quoted = false;
    for (i, c) in extinf.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => return extinf[i + 1..].trim().to_string(),
            _ => {}
        }
    }
    String::new()
}

static HEADER_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([A-Za-z0-9_-]+)="([^"]*)""#).expect("valid regex"));

/// `name="value"` inside an `#EXTM3U` header, space separated.
fn tvg_attribute<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    HEADER_ATTR
        .captures_iter(attrs)
        .find(|c| c[1].eq_ignore_ascii_case(name))
        .and_then(|c| c.get(2))
        .map(|m| m.as_str())
}

/// Fetches and merges source lists.
pub struct PlaylistCombiner {
    relay: StreamRelay,
    links: ProxyLinks,
}

impl PlaylistCombiner {
    pub fn new(relay: StreamRelay, links: ProxyLinks) -> Self {
        Self { relay, links }
    }

    /// Fetch every source concurrently and merge them in request order.
    /// A source that cannot be fetched is skipped; if none can, the last
    /// failure is returned.
    pub async fn combine(&self, specs: &[PlaylistSpec]) -> Result<String> {
        let fetches = specs.iter().map(|spec| async move {
            let fetched = self
                .relay
                .fetch(&spec.url, Service::Generic, RequestKind::Page, &HeaderOverrides::new())
                .await;
            (spec, fetched)
        });

        let mut lists = Vec::with_capacity(specs.len());
        let mut last_error = None;
        for (spec, fetched) in join_all(fetches).await {
            match fetched {
                Ok(fetched) => {
                    let list = ChannelList::parse(&fetched.text());
                    debug!(url = %spec.url, entries = list.entries.len(), "source playlist loaded");
                    lists.push((spec, list));
                }
                Err(err) => {
                    warn!(url = %spec.url, error = %err, "source playlist skipped");
                    last_error = Some(err);
                }
            }
        }
        if lists.is_empty() {
            return Err(last_error.unwrap_or_else(|| ProxyError::bad_request("no playlist sources")));
        }

        Ok(self.render(lists))
    }

    /// Render already-parsed sources.
    pub fn render(&self, lists: Vec<(&PlaylistSpec, ChannelList)>) -> String {
        let mut epg: Vec<String> = Vec::new();
        for (_, list) in &lists {
            for url in &list.epg {
                if !epg.contains(url) {
                    epg.push(url.clone());
                }
            }
        }

        let mut out = if epg.is_empty() {
            "#EXTM3U\n".to_string()
        } else {
            format!("#EXTM3U url-tvg=\"{}\"\n", epg.join(","))
        };

        for (spec, mut list) in lists {
            if spec.sort {
                list.entries.sort_by_key(|e| e.name.to_lowercase());
            }
            for entry in &list.entries {
                if spec.no_proxy {
                    for line in &entry.directives {
                        out.push_str(line);
                        out.push('\n');
                    }
                    out.push_str(&entry.url);
                } else {
                    for line in entry
                        .directives
                        .iter()
                        .filter(|l| !l.starts_with("#EXTVLCOPT:http-") && !l.starts_with("#KODIPROP:"))
                    {
                        out.push_str(line);
                        out.push('\n');
                    }
                    out.push_str(&self.entry_link(entry));
                }
                out.push('\n');
            }
        }
        out
    }

    fn entry_link(&self, entry: &ChannelEntry) -> String {
        let is_mpd = Url::parse(&entry.url)
            .map(|u| u.path().to_ascii_lowercase().ends_with(".mpd"))
            .unwrap_or(false);
        let endpoint = if is_mpd {
            Endpoint::MpdManifest
        } else {
            Endpoint::HlsManifest
        };

        let mut link = self.links.to(endpoint, &entry.url).headers(&entry.vlc_headers());
        if let Some(key) = entry.license_key() {
            link = if key.contains("://") {
                link.param("license_url", key)
            } else {
                link.param("clearkey", key)
            };
        }
        link.build()
    }
}
