//! HLS playlist rewriting.
//!
//! Lines are processed one at a time. Tags are emitted verbatim except for
//! their `URI="..."` attribute; bare URI lines are replaced by a proxy link.
//! Nothing else (durations, sequence numbers, discontinuities) is touched.

use url::Url;

use super::links::RewriteContext;
use crate::error::{ProxyError, Result};

/// Tags whose `URI` attribute points at key material.
const KEY_TAGS: &[&str] = &["#EXT-X-KEY", "#EXT-X-SESSION-KEY"];

/// Tags whose `URI` attribute points at media bytes.
const SEGMENT_TAGS: &[&str] = &["#EXT-X-MAP", "#EXT-X-PART", "#EXT-X-PRELOAD-HINT"];

/// Tags whose `URI` attribute points at another playlist.
const PLAYLIST_TAGS: &[&str] = &[
    "#EXT-X-MEDIA",
    "#EXT-X-I-FRAME-STREAM-INF",
    "#EXT-X-RENDITION-REPORT",
];

/// `true` when `body` starts with the `#EXTM3U` header.
pub fn is_playlist(body: &str) -> bool {
    body.trim_start_matches('\u{feff}').trim_start().starts_with("#EXTM3U")
}

/// Rewrite `body`, fetched from `base`, so every reference goes through the
/// proxy.
pub fn rewrite(body: &str, base: &Url, ctx: &RewriteContext) -> Result<String> {
    ctx.check_depth()?;
    if !is_playlist(body) {
        return Err(ProxyError::rewrite("body is not an HLS playlist (missing #EXTM3U)"));
    }

    let mut out = String::with_capacity(body.len() * 2);
    let mut expect_variant = false;

    for raw in body.trim_start_matches('\u{feff}').lines() {
        let line = raw.trim();
        if line.is_empty() {
            out.push('\n');
            continue;
        }

        if line.starts_with('#') {
            let tag = tag_name(line);
            if tag == "#EXT-X-STREAM-INF" {
                expect_variant = true;
            }
            out.push_str(&rewrite_tag(line, tag, base, ctx));
        } else {
            let Some(target) = join(base, line) else {
                return Err(ProxyError::rewrite(format!("unresolvable URI line '{line}'")));
            };
            let link = if expect_variant || looks_like_playlist(&target) {
                ctx.manifest_link(&target)
            } else {
                ctx.segment_link(&target)
            };
            expect_variant = false;
            out.push_str(&link);
        }
        out.push('\n');
    }
    Ok(out)
}

fn rewrite_tag(line: &str, tag: &str, base: &Url, ctx: &RewriteContext) -> String {
    if KEY_TAGS.contains(&tag) {
        let attrs = line.split_once(':').map_or("", |(_, a)| a);
        if attribute(attrs, "METHOD").is_some_and(|m| m.eq_ignore_ascii_case("NONE")) {
            return line.to_string();
        }
        return replace_uri(line, |uri| {
            if uri.starts_with("data:") || uri.starts_with("skd:") {
                None
            } else {
                join(base, uri).map(|target| ctx.key_link(&target))
            }
        });
    }
    if SEGMENT_TAGS.contains(&tag) {
        return replace_uri(line, |uri| join(base, uri).map(|t| ctx.segment_link(&t)));
    }
    if PLAYLIST_TAGS.contains(&tag) {
        return replace_uri(line, |uri| join(base, uri).map(|t| ctx.manifest_link(&t)));
    }
    line.to_string()
}

/// `#EXT-X-KEY` out of `#EXT-X-KEY:METHOD=...`.
fn tag_name(line: &str) -> &str {
    line.split_once(':').map_or(line, |(tag, _)| tag)
}

fn join(base: &Url, uri: &str) -> Option<String> {
    base.join(uri.trim()).ok().map(String::from)
}

fn looks_like_playlist(url: &str) -> bool {
    let path = Url::parse(url).map_or_else(|_| url.to_string(), |u| u.path().to_string());
    let path = path.to_ascii_lowercase();
    path.ends_with(".m3u8") || path.ends_with(".m3u")
}

/// Replace the quoted value of the `URI` attribute. The line is returned
/// unchanged when there is no such attribute or `map` declines.
fn replace_uri<F>(line: &str, map: F) -> String
where
    F: FnOnce(&str) -> Option<String>,
{
    let Some((start, end)) = uri_span(line) else {
        return line.to_string();
    };
    match map(&line[start..end]) {
        Some(replacement) => format!("{}{}{}", &line[..start], replacement, &line[end..]),
        None => line.to_string(),
    }
}

/// Byte range of the `URI` attribute's value, quotes excluded.
fn uri_span(line: &str) -> Option<(usize, usize)> {
    let mut from = 0;
    while let Some(pos) = line[from..].find("URI=\"") {
        let at = from + pos;
        let boundary = at == 0 || matches!(line.as_bytes()[at - 1], b':' | b',');
        let start = at + "URI=\"".len();
        let end = start + line[start..].find('"')?;
        if boundary {
            return Some((start, end));
        }
        from = end;
    }
    None
}

/// Parse an attribute list (`KEY=value,KEY="quoted, value"`).
pub fn attributes(list: &str) -> Vec<(&str, &str)> {
    let mut out = Vec::new();
    let mut rest = list;
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim();
        let after = &rest[eq + 1..];
        let (value, tail) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(close) => (&quoted[..close], &quoted[close + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(comma) => (&after[..comma], &after[comma..]),
                None => (after, ""),
            }
        };
        out.push((key, value));
        rest = tail.trim_start_matches(',');
    }
    out
}

/// Value of one attribute, quotes removed.
pub fn attribute<'a>(list: &'a str, name: &str) -> Option<&'a str> {
    attributes(list)
        .into_iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::links::{ProxyLinks, RouteState};
    use crate::stream::request::HeaderOverrides;

    const MASTER: &str = "#EXTM3U
#EXT-X-VERSION:6
#EXT-X-INDEPENDENT-SEGMENTS
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aac\",NAME=\"English\",DEFAULT=YES,URI=\"audio/en.m3u8\"
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720,CODECS=\"avc1.64001f,mp4a.40.2\",AUDIO=\"aac\"
720p/index
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360
https://other.example/360p.m3u8?token=x
#EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=90000,URI=\"iframes.m3u8\"
";

    const MEDIA: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:6
#EXT-X-MEDIA-SEQUENCE:1042
#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example/k?id=9\",IV=0x0000000000000000000000000000abcd
#EXTINF:6.006,
seg1042.ts
#EXT-X-DISCONTINUITY
#EXTINF:5.005,title
/abs/seg1043.ts

#EXT-X-KEY:METHOD=NONE
#EXTINF:6.000,
seg1044.ts?sig=1
#EXT-X-ENDLIST
";

    fn ctx() -> RewriteContext {
        let mut headers = HeaderOverrides::new();
        headers.insert("referer", "https://site.example/");
        RewriteContext::new(ProxyLinks::new("http://proxy.local", None), 3).with_headers(headers)
    }

    fn base() -> Url {
        Url::parse("https://cdn.example/live/master.m3u8").unwrap()
    }

    fn target_of(link: &str) -> String {
        let query = link.split_once('?').unwrap().1;
        RouteState::from_query(query).unwrap().url.unwrap()
    }

    fn tags(body: &str) -> Vec<String> {
        body.lines()
            .filter(|l| l.starts_with('#'))
            .map(|l| match uri_span(l) {
                Some((s, e)) => format!("{}{}", &l[..s], &l[e..]),
                None => l.to_string(),
            })
            .collect()
    }

    fn uri_lines(body: &str) -> Vec<&str> {
        body.lines().filter(|l| !l.is_empty() && !l.starts_with('#')).collect()
    }

    #[test]
    fn test_master_variants_become_manifest_links() {
        let out = rewrite(MASTER, &base(), &ctx()).unwrap();
        let uris = uri_lines(&out);
        assert_eq!(uris.len(), 2);
        assert!(uris[0].starts_with("http://proxy.local/proxy/hls/manifest.m3u8?d="));
        assert_eq!(target_of(uris[0]), "https://cdn.example/live/720p/index");
        assert_eq!(target_of(uris[1]), "https://other.example/360p.m3u8?token=x");

        let media = out.lines().find(|l| l.starts_with("#EXT-X-MEDIA:")).unwrap();
        let (s, e) = uri_span(media).unwrap();
        assert_eq!(target_of(&media[s..e]), "https://cdn.example/live/audio/en.m3u8");
        assert!(media.ends_with("\""));
    }

    #[test]
    fn test_media_segments_and_keys() {
        let out = rewrite(MEDIA, &base(), &ctx()).unwrap();
        let uris = uri_lines(&out);
        assert_eq!(uris.len(), 3);
        assert!(uris.iter().all(|u| u.starts_with("http://proxy.local/proxy/stream?url=")));
        assert_eq!(target_of(uris[1]), "https://cdn.example/abs/seg1043.ts");

        let key = out.lines().find(|l| l.contains("METHOD=AES-128")).unwrap();
        assert!(key.contains("http://proxy.local/key?key_url="));
        assert!(key.ends_with(",IV=0x0000000000000000000000000000abcd"));
        assert!(out.contains("#EXT-X-KEY:METHOD=NONE\n"));
    }

    #[test]
    fn test_structure_preserved() {
        for input in [MASTER, MEDIA] {
            let out = rewrite(input, &base(), &ctx()).unwrap();
            assert_eq!(tags(&out), tags(input));
            assert_eq!(uri_lines(&out).len(), uri_lines(input).len());

            // A second pass keeps the shape too.
            let again = rewrite(&out, &base(), &ctx()).unwrap();
            assert_eq!(tags(&again), tags(input));
            assert_eq!(uri_lines(&again).len(), uri_lines(input).len());
        }
    }

    #[test]
    fn test_headers_travel_with_links() {
        let out = rewrite(MEDIA, &base(), &ctx()).unwrap();
        let first = uri_lines(&out)[0];
        let state = RouteState::from_query(first.split_once('?').unwrap().1).unwrap();
        assert_eq!(state.headers.get("referer"), Some("https://site.example/"));
    }

    #[test]
    fn test_data_and_skd_keys_untouched() {
        let body = "#EXTM3U\n#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"skd://key-id\",KEYFORMAT=\"com.apple.streamingkeydelivery\"\n";
        let out = rewrite(body, &base(), &ctx()).unwrap();
        assert!(out.contains("URI=\"skd://key-id\""));
    }

    #[test]
    fn test_map_and_part_routed_as_segments() {
        let body = "#EXTM3U\n#EXT-X-MAP:URI=\"init.mp4\",BYTERANGE=\"720@0\"\n#EXT-X-PART:DURATION=1.0,URI=\"part1.m4s\"\n";
        let out = rewrite(body, &base(), &ctx()).unwrap();
        assert!(out.contains("#EXT-X-MAP:URI=\"http://proxy.local/proxy/stream?url="));
        assert!(out.contains(",BYTERANGE=\"720@0\""));
        assert!(out.contains("#EXT-X-PART:DURATION=1.0,URI=\"http://proxy.local/proxy/stream?"));
    }

    #[test]
    fn test_not_a_playlist() {
        let err = rewrite("<html>blocked</html>", &base(), &ctx()).unwrap_err();
        assert_eq!(err.category(), "rewrite_error");
    }

    #[test]
    fn test_depth_exceeded_is_error() {
        let err = rewrite(MASTER, &base(), &ctx().at_depth(4)).unwrap_err();
        assert!(err.to_string().contains("nesting depth"));
    }

    #[test]
    fn test_attribute_parser() {
        let attrs = attributes("METHOD=AES-128,URI=\"https://k/a,b\",IV=0x01");
        assert_eq!(attrs, vec![("METHOD", "AES-128"), ("URI", "https://k/a,b"), ("IV", "0x01")]);
        assert_eq!(attribute("TYPE=AUDIO,GROUP-ID=\"g\"", "group-id"), Some("g"));
    }

    #[test]
    fn test_uri_span_requires_attribute_boundary() {
        assert_eq!(uri_span("#EXT-X-FOO:X-URI=\"a\""), None);
        let line = "#EXT-X-FOO:X-URI=\"a\",URI=\"b\"";
        let (s, e) = uri_span(line).unwrap();
        assert_eq!(&line[s..e], "b");
    }
}
