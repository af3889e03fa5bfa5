//! Benchmarks for manifest rewriting: HLS media playlists of varying length
//! and MPD to HLS conversion.
//!
//! Run with: `cargo bench --bench rewrite_bench`

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use streamrelay::manifest::{hls, Mpd, ProxyLinks, RewriteContext};
use streamrelay::stream::HeaderOverrides;
use url::Url;

/// Media playlist with `segments` six-second segments, a key rotation every
/// 50 segments and the occasional discontinuity.
fn generate_media_playlist(segments: usize) -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:0\n");
    for i in 0..segments {
        if i % 50 == 0 {
            out.push_str(&format!(
                "#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example/k/{}\",IV=0x{:032x}\n",
                i / 50,
                i
            ));
        }
        if i % 200 == 199 {
            out.push_str("#EXT-X-DISCONTINUITY\n");
        }
        out.push_str(&format!("#EXTINF:6.006,\nseg-{i:05}.ts?token=abcdef0123456789\n"));
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}

fn context() -> RewriteContext {
    let mut headers = HeaderOverrides::new();
    headers.insert("referer", "https://site.example/");
    headers.insert("user-agent", "Mozilla/5.0 (Windows NT 10.0; Win64; x64)");
    RewriteContext::new(ProxyLinks::new("http://127.0.0.1:7860", Some("secret".into())), 3).with_headers(headers)
}

fn bench_hls_rewrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("hls_rewrite");
    let base = Url::parse("https://cdn.example/live/720p/index.m3u8").unwrap();
    let ctx = context();

    for &segments in &[10usize, 100, 1_000, 5_000] {
        let playlist = generate_media_playlist(segments);
        group.throughput(Throughput::Bytes(playlist.len() as u64));
        group.bench_with_input(BenchmarkId::new("media", segments), &playlist, |b, playlist| {
            b.iter(|| black_box(hls::rewrite(black_box(playlist), &base, &ctx).unwrap()));
        });
    }

    group.finish();
}

/// Static MPD with one SegmentTimeline of `entries` runs, two video and one
/// audio representation.
fn generate_mpd(entries: usize) -> String {
    let mut timeline = String::new();
    let mut t = 0u64;
    for i in 0..entries {
        let d = if i % 3 == 0 { 180_180 } else { 180_000 };
        timeline.push_str(&format!("<S t=\"{t}\" d=\"{d}\" r=\"1\"/>"));
        t += d * 2;
    }
    format!(
        r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT{secs}S">
  <Period id="0" start="PT0S">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="90000" initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/$Time$.m4s">
        <SegmentTimeline>{timeline}</SegmentTimeline>
      </SegmentTemplate>
      <Representation id="v1080" bandwidth="5000000" width="1920" height="1080" codecs="avc1.640028"/>
      <Representation id="v720" bandwidth="3000000" width="1280" height="720" codecs="avc1.64001f"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4" lang="en">
      <SegmentTemplate timescale="90000" initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/$Time$.m4s">
        <SegmentTimeline>{timeline}</SegmentTimeline>
      </SegmentTemplate>
      <Representation id="a128" bandwidth="128000" codecs="mp4a.40.2"/>
    </AdaptationSet>
  </Period>
</MPD>"#,
        secs = t / 90_000
    )
}

fn bench_mpd_conversion(c: &mut Criterion) {
    let mut group = c.benchmark_group("mpd_to_hls");
    let manifest_url = Url::parse("https://cdn.example/vod/manifest.mpd").unwrap();
    let ctx = context();
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    for &entries in &[10usize, 500, 2_000] {
        let xml = generate_mpd(entries);
        group.throughput(Throughput::Bytes(xml.len() as u64));

        group.bench_with_input(BenchmarkId::new("parse", entries), &xml, |b, xml| {
            b.iter(|| black_box(Mpd::parse(black_box(xml)).unwrap()));
        });

        let mpd = Mpd::parse(&xml).unwrap();
        group.bench_with_input(BenchmarkId::new("media_playlist", entries), &mpd, |b, mpd| {
            b.iter(|| black_box(mpd.media_playlist("v1080", &manifest_url, &ctx, now).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_hls_rewrite, bench_mpd_conversion);
criterion_main!(benches);
