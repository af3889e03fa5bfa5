//! Browser header profiles.
//!
//! Hoster pages and edge CDNs reject requests that do not look like a real
//! player. A [`BrowserProfile`] renders a consistent header set for the three
//! kinds of request the resolvers make: page navigations, XHR/API calls and
//! media fetches.

use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};

/// User agent used when no profile randomisation is wanted.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36";

/// Chrome releases with meaningful share in 2025.
const CHROME_VERSIONS: &[(&str, &str)] = &[
    ("136", "136.0.0.0"),
    ("135", "135.0.0.0"),
    ("134", "134.0.0.0"),
    ("133", "133.0.0.0"),
];

const FIREFOX_VERSIONS: &[&str] = &["138.0", "137.0", "136.0"];

/// What the request is for; selects `Accept` and `Sec-Fetch-*` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Top-level page or iframe navigation.
    Page,
    /// XHR/fetch to a JSON endpoint.
    Api,
    /// Manifest, key or segment fetch issued by a media element.
    Media,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOS,
    Windows,
    Linux,
}

impl Platform {
    fn random() -> Self {
        let roll: f32 = rand::thread_rng().gen();
        if roll < 0.7 {
            Platform::Windows
        } else if roll < 0.9 {
            Platform::MacOS
        } else {
            Platform::Linux
        }
    }

    fn os_string(self) -> &'static str {
        match self {
            Platform::MacOS => "Macintosh; Intel Mac OS X 10_15_7",
            Platform::Windows => "Windows NT 10.0; Win64; x64",
            Platform::Linux => "X11; Linux x86_64",
        }
    }

    fn sec_ch_platform(self) -> &'static str {
        match self {
            Platform::MacOS => "\"macOS\"",
            Platform::Windows => "\"Windows\"",
            Platform::Linux => "\"Linux\"",
        }
    }
}

/// A coherent set of browser identity headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserProfile {
    pub user_agent: String,
    pub accept_language: String,
    /// Empty for browsers that do not send client hints.
    pub sec_ch_ua: String,
    pub sec_ch_ua_platform: String,
}

/// The fixed desktop Chrome profile.
#[must_use]
pub fn default_profile() -> BrowserProfile {
    BrowserProfile {
        user_agent: DEFAULT_USER_AGENT.to_string(),
        accept_language: "en-US,en;q=0.9".to_string(),
        sec_ch_ua: chrome_brands("136"),
        sec_ch_ua_platform: Platform::Windows.sec_ch_platform().to_string(),
    }
}

/// A randomised Chrome profile.
#[must_use]
pub fn chrome_profile() -> BrowserProfile {
    let mut rng = rand::thread_rng();
    let platform = Platform::random();
    let (major, full) = CHROME_VERSIONS
        .choose(&mut rng)
        .copied()
        .unwrap_or(("136", "136.0.0.0"));

    BrowserProfile {
        user_agent: format!(
            "Mozilla/5.0 ({}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{full} Safari/537.36",
            platform.os_string()
        ),
        accept_language: random_accept_language(),
        sec_ch_ua: chrome_brands(major),
        sec_ch_ua_platform: platform.sec_ch_platform().to_string(),
    }
}

/// A randomised Firefox profile (no client hints).
#[must_use]
pub fn firefox_profile() -> BrowserProfile {
    let mut rng = rand::thread_rng();
    let platform = Platform::random();
    let version = FIREFOX_VERSIONS.choose(&mut rng).copied().unwrap_or("138.0");

    BrowserProfile {
        user_agent: format!(
            "Mozilla/5.0 ({}; rv:{version}) Gecko/20100101 Firefox/{version}",
            platform.os_string()
        ),
        accept_language: random_accept_language(),
        sec_ch_ua: String::new(),
        sec_ch_ua_platform: String::new(),
    }
}

/// Chrome 80%, Firefox 20%.
#[must_use]
pub fn random_profile() -> BrowserProfile {
    if rand::thread_rng().gen::<f32>() < 0.8 {
        chrome_profile()
    } else {
        firefox_profile()
    }
}

fn chrome_brands(major: &str) -> String {
    format!("\"Chromium\";v=\"{major}\", \"Google Chrome\";v=\"{major}\", \"Not.A/Brand\";v=\"99\"")
}

fn random_accept_language() -> String {
    let languages = [
        "en-US,en;q=0.9",
        "en-GB,en;q=0.9",
        "it-IT,it;q=0.9,en-US;q=0.8,en;q=0.7",
        "en-US,en;q=0.9,es;q=0.8",
        "de-DE,de;q=0.9,en;q=0.8",
    ];
    languages
        .choose(&mut rand::thread_rng())
        .map_or_else(|| "en-US,en;q=0.9".to_string(), |l| (*l).to_string())
}

impl Default for BrowserProfile {
    fn default() -> Self {
        default_profile()
    }
}

impl BrowserProfile {
    /// Identity headers only (user agent, language, client hints). Installed
    /// as client-wide defaults.
    pub fn identity_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        insert(&mut headers, USER_AGENT, &self.user_agent);
        insert(&mut headers, ACCEPT_LANGUAGE, &self.accept_language);
        if !self.sec_ch_ua.is_empty() {
            insert(&mut headers, HeaderName::from_static("sec-ch-ua"), &self.sec_ch_ua);
            insert(&mut headers, HeaderName::from_static("sec-ch-ua-mobile"), "?0");
            insert(
                &mut headers,
                HeaderName::from_static("sec-ch-ua-platform"),
                &self.sec_ch_ua_platform,
            );
        }
        headers
    }

    /// Full header set for one kind of request.
    pub fn headers_for(&self, kind: RequestKind) -> HeaderMap {
        let mut headers = self.identity_headers();
        let (accept, dest, mode) = match kind {
            RequestKind::Page => (
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
                "iframe",
                "navigate",
            ),
            RequestKind::Api => ("application/json, text/plain, */*", "empty", "cors"),
            RequestKind::Media => ("*/*", "empty", "cors"),
        };
        insert(&mut headers, ACCEPT, accept);
        insert(&mut headers, HeaderName::from_static("sec-fetch-dest"), dest);
        insert(&mut headers, HeaderName::from_static("sec-fetch-mode"), mode);
        insert(&mut headers, HeaderName::from_static("sec-fetch-site"), "cross-site");
        headers
    }
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile_is_stable() {
        assert_eq!(default_profile(), default_profile());
        assert_eq!(default_profile().user_agent, DEFAULT_USER_AGENT);
    }

    #[test]
    fn test_chrome_profile() {
        let profile = chrome_profile();
        assert!(profile.user_agent.contains("Chrome"));
        assert!(!profile.sec_ch_ua.is_empty());
    }

    #[test]
    fn test_firefox_profile_has_no_client_hints() {
        let profile = firefox_profile();
        assert!(profile.user_agent.contains("Firefox"));
        assert!(!profile.identity_headers().contains_key("sec-ch-ua"));
    }

    #[test]
    fn test_headers_per_kind() {
        let profile = default_profile();
        let page = profile.headers_for(RequestKind::Page);
        let media = profile.headers_for(RequestKind::Media);
        assert_eq!(page.get("sec-fetch-mode").unwrap(), "navigate");
        assert_eq!(media.get("sec-fetch-mode").unwrap(), "cors");
        assert_eq!(media.get(ACCEPT).unwrap(), "*/*");
        assert!(page.contains_key(USER_AGENT));
    }

    #[test]
    fn test_random_profile_has_user_agent() {
        for _ in 0..10 {
            assert!(random_profile().user_agent.starts_with("Mozilla/5.0"));
        }
    }
}
