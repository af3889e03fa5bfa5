//! Upstream service variants and the ordered URL match list.
//!
//! Dispatch is a closed set: adding a service means adding a variant here and
//! an arm in the registry, so the selection order is visible in one place.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A streaming service with its own resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Vavoo,
    Dlhd,
    VixSrc,
    Sportsonline,
    Mixdrop,
    Voe,
    Streamtape,
    /// Passthrough for URLs that are already playable.
    Generic,
}

static DLHD_WATCH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)watch\.php\?id=\d+|/stream/stream-\d+\.php").expect("valid regex"));

static VIXSRC_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)vixsrc\.to/(movie|tv|iframe|embed)/").expect("valid regex"));

const VOE_HOSTS: &[&str] = &[
    "voe.sx",
    "voe-unblock",
    "voeunblock",
    "voe-network",
    "audaciousdefaulthouse",
    "launchreliantcleaverriver",
    "reputationsheriffkennethsand",
    "fittingcentermondaysunday",
    "v-o-e",
];

/// Ordered match list. The first predicate that accepts the URL wins;
/// [`Service::Generic`] is the fallthrough.
static MATCH_ORDER: &[(Service, fn(&str) -> bool)] = &[
    (Service::Vavoo, |u| u.contains("vavoo.to")),
    (Service::Dlhd, |u| {
        u.contains("daddylive") || u.contains("dlhd") || u.contains("daddyhd") || DLHD_WATCH.is_match(u)
    }),
    (Service::VixSrc, |u| VIXSRC_PATH.is_match(u)),
    (Service::Sportsonline, |u| {
        u.contains("sportzonline") || u.contains("sportsonline")
    }),
    (Service::Mixdrop, |u| u.contains("mixdrop") || u.contains("mxdrop")),
    (Service::Voe, |u| VOE_HOSTS.iter().any(|h| u.contains(h))),
    (Service::Streamtape, |u| {
        u.contains("streamtape.com") || u.contains("streamtape.to") || u.contains("streamtape.net")
    }),
];

impl Service {
    /// All variants, in match order.
    pub const ALL: [Service; 8] = [
        Service::Vavoo,
        Service::Dlhd,
        Service::VixSrc,
        Service::Sportsonline,
        Service::Mixdrop,
        Service::Voe,
        Service::Streamtape,
        Service::Generic,
    ];

    /// Select the service for a source URL.
    pub fn detect(url: &str) -> Service {
        let lowered = url.to_ascii_lowercase();
        MATCH_ORDER
            .iter()
            .find(|(_, matches)| matches(&lowered))
            .map_or(Service::Generic, |(service, _)| *service)
    }

    /// Short lowercase name (`"dlhd"`, `"vixsrc"`, ...).
    pub fn name(self) -> &'static str {
        match self {
            Service::Vavoo => "vavoo",
            Service::Dlhd => "dlhd",
            Service::VixSrc => "vixsrc",
            Service::Sportsonline => "sportsonline",
            Service::Mixdrop => "mixdrop",
            Service::Voe => "voe",
            Service::Streamtape => "streamtape",
            Service::Generic => "generic",
        }
    }

    /// Environment variable prefix (`DLHD`, `VIXSRC`, ...).
    pub fn env_key(self) -> String {
        self.name().to_ascii_uppercase()
    }

    /// Default cache lifetime. Session-heavy services live longer so the
    /// handshake cost is amortised.
    pub fn default_ttl(self) -> Duration {
        let secs = match self {
            Service::Dlhd => 2 * 60 * 60,
            Service::Vavoo => 10 * 60,
            Service::VixSrc => 20 * 60,
            Service::Sportsonline => 30 * 60,
            Service::Mixdrop | Service::Voe | Service::Streamtape => 60 * 60,
            Service::Generic => 5 * 60,
        };
        Duration::from_secs(secs)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Service {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "vavoo" => Ok(Service::Vavoo),
            "dlhd" | "daddylive" | "daddyhd" => Ok(Service::Dlhd),
            "vixsrc" => Ok(Service::VixSrc),
            "sportsonline" | "sportzonline" => Ok(Service::Sportsonline),
            "mixdrop" => Ok(Service::Mixdrop),
            "voe" => Ok(Service::Voe),
            "streamtape" => Ok(Service::Streamtape),
            "generic" => Ok(Service::Generic),
            other => Err(format!("unknown service '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_each_service() {
        let cases = [
            ("https://vavoo.to/vavoo-iptv/play/12345", Service::Vavoo),
            ("https://dlhd.dad/watch.php?id=51", Service::Dlhd),
            ("https://daddylive.sx/stream/stream-44.php", Service::Dlhd),
            ("https://example.org/watch.php?id=7", Service::Dlhd),
            ("https://vixsrc.to/movie/603", Service::VixSrc),
            ("https://sportzonline.si/channels/hd/hd1.php", Service::Sportsonline),
            ("https://mixdrop.ag/e/abc123", Service::Mixdrop),
            ("https://voe.sx/e/xyz", Service::Voe),
            ("https://streamtape.com/e/Kq7", Service::Streamtape),
            ("https://cdn.example.com/live/index.m3u8", Service::Generic),
        ];
        for (url, expected) in cases {
            assert_eq!(Service::detect(url), expected, "{url}");
        }
    }

    #[test]
    fn test_detect_is_case_insensitive() {
        assert_eq!(Service::detect("https://VAVOO.TO/play/1"), Service::Vavoo);
    }

    #[test]
    fn test_vixsrc_root_is_generic() {
        // Only player paths resolve through VixSrc.
        assert_eq!(Service::detect("https://vixsrc.to/"), Service::Generic);
    }

    #[test]
    fn test_order_prefers_earlier_pattern() {
        // A DLHD channel URL proxied through a vavoo.to mirror still belongs to Vavoo.
        assert_eq!(
            Service::detect("https://vavoo.to/redirect?u=watch.php?id=3"),
            Service::Vavoo
        );
    }

    #[test]
    fn test_from_str_roundtrips_names() {
        for service in Service::ALL {
            assert_eq!(service.name().parse::<Service>().unwrap(), service);
        }
        assert!("netflix".parse::<Service>().is_err());
    }

    #[test]
    fn test_dlhd_ttl_longest() {
        let max = Service::ALL.iter().map(|s| s.default_ttl()).max().unwrap();
        assert_eq!(max, Service::Dlhd.default_ttl());
    }
}
