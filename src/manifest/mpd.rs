//! DASH MPD parsing and conversion to HLS.
//!
//! The MPD is read with quick-xml into a small model (periods, adaptation
//! sets, representations, segment addressing, content protection). The
//! conversion exposes one video and one audio representation, chosen by
//! highest bandwidth with ties going to declaration order, as an HLS master
//! playlist whose entries point at per-representation media playlists.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use url::Url;

use super::links::RewriteContext;
use crate::drm::{decode_16, CLEARKEY_SCHEME, KEY_LEN};
use crate::error::{ProxyError, Result};

/// Seconds of a live presentation exposed in one media playlist.
pub const LIVE_WINDOW_SECS: f64 = 180.0;

/// Newest live segments withheld because the CDN may still be writing them.
pub const LIVE_HOLD_BACK: usize = 3;

/// Upper bound on segments expanded from one representation.
pub const MAX_SEGMENTS: u64 = 100_000;

fn too_many_segments(count: u64) -> ProxyError {
    ProxyError::rewrite(format!("MPD expands to {count} segments, more than {MAX_SEGMENTS}"))
}

static ISO_DURATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^P(?:(\d+(?:\.\d+)?)D)?(?:T(?:(\d+(?:\.\d+)?)H)?(?:(\d+(?:\.\d+)?)M)?(?:(\d+(?:\.\d+)?)S)?)?$")
        .expect("valid regex")
});

/// `SegmentTimeline` `<S t d r>` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEntry {
    pub t: Option<u64>,
    pub d: u64,
    pub r: i64,
}

/// `SegmentTemplate`; unset fields inherit from the enclosing level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentTemplate {
    pub media: Option<String>,
    pub initialization: Option<String>,
    pub timescale: Option<u64>,
    pub start_number: Option<u64>,
    pub duration: Option<u64>,
    pub presentation_time_offset: Option<u64>,
    pub timeline: Vec<TimelineEntry>,
}

impl SegmentTemplate {
    /// `self` with gaps filled from `parent`.
    fn inherit(&self, parent: &SegmentTemplate) -> SegmentTemplate {
        SegmentTemplate {
            media: self.media.clone().or_else(|| parent.media.clone()),
            initialization: self.initialization.clone().or_else(|| parent.initialization.clone()),
            timescale: self.timescale.or(parent.timescale),
            start_number: self.start_number.or(parent.start_number),
            duration: self.duration.or(parent.duration),
            presentation_time_offset: self.presentation_time_offset.or(parent.presentation_time_offset),
            timeline: if self.timeline.is_empty() {
                parent.timeline.clone()
            } else {
                self.timeline.clone()
            },
        }
    }
}

/// Explicit `SegmentList`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentList {
    pub timescale: Option<u64>,
    pub duration: Option<u64>,
    pub initialization: Option<String>,
    pub media: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentProtection {
    pub scheme: String,
    pub default_kid: Option<String>,
    pub license_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Representation {
    pub id: String,
    pub bandwidth: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<String>,
    pub codecs: Option<String>,
    pub mime_type: Option<String>,
    pub base_url: Option<String>,
    pub template: Option<SegmentTemplate>,
    pub list: Option<SegmentList>,
    pub protection: Vec<ContentProtection>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdaptationSet {
    pub content_type: Option<String>,
    pub mime_type: Option<String>,
    pub lang: Option<String>,
    pub codecs: Option<String>,
    pub base_url: Option<String>,
    pub template: Option<SegmentTemplate>,
    pub list: Option<SegmentList>,
    pub protection: Vec<ContentProtection>,
    pub representations: Vec<Representation>,
}

/// Track type of an adaptation set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
    Other,
}

impl AdaptationSet {
    pub fn kind(&self) -> TrackKind {
        let hints = [
            self.content_type.as_deref(),
            self.mime_type.as_deref(),
            self.representations.first().and_then(|r| r.mime_type.as_deref()),
        ];
        for hint in hints.into_iter().flatten() {
            if hint.starts_with("video") {
                return TrackKind::Video;
            }
            if hint.starts_with("audio") {
                return TrackKind::Audio;
            }
            if hint.starts_with("text") || hint.starts_with("image") || hint.starts_with("application") {
                return TrackKind::Other;
            }
        }
        TrackKind::Other
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Period {
    pub id: Option<String>,
    /// Offset from availability start, in seconds.
    pub start: f64,
    pub duration: Option<f64>,
    pub base_url: Option<String>,
    pub template: Option<SegmentTemplate>,
    pub adaptation_sets: Vec<AdaptationSet>,
}

/// Parsed DASH manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mpd {
    pub dynamic: bool,
    pub availability_start: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub base_url: Option<String>,
    pub periods: Vec<Period>,
}

/// A representation together with the levels it inherits from.
#[derive(Debug, Clone, Copy)]
pub struct Track<'a> {
    pub period: &'a Period,
    pub set: &'a AdaptationSet,
    pub rep: &'a Representation,
}

/// The video and audio tracks exposed to HLS players.
#[derive(Debug, Clone, Copy, Default)]
pub struct Selection<'a> {
    pub video: Option<Track<'a>>,
    pub audio: Option<Track<'a>>,
}

/// ClearKey-relevant protection found in the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MpdProtection {
    pub kids: Vec<[u8; KEY_LEN]>,
    pub license_url: Option<String>,
    pub clearkey: bool,
}

impl MpdProtection {
    pub fn is_protected(&self) -> bool {
        !self.kids.is_empty() || self.clearkey
    }
}

/// One media segment of a synthesized playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub url: String,
    pub duration: f64,
    pub number: u64,
    pub program_date_time: Option<DateTime<Utc>>,
}

/// Addressing of one representation after template expansion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentPlan {
    pub init: Option<String>,
    pub segments: Vec<Segment>,
}

impl SegmentPlan {
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }
}

impl Mpd {
    pub fn parse(xml: &str) -> Result<Self> {
        MpdBuilder::default().parse(xml)
    }

    /// The period exposed to players: the newest for live, the first for VOD.
    pub fn active_period(&self) -> Option<&Period> {
        if self.dynamic {
            self.periods.last()
        } else {
            self.periods.first()
        }
    }

    /// Highest-bandwidth video and audio representation of the active period.
    pub fn select(&self) -> Selection<'_> {
        let mut selection = Selection::default();
        let Some(period) = self.active_period() else {
            return selection;
        };
        for set in &period.adaptation_sets {
            let slot = match set.kind() {
                TrackKind::Video => &mut selection.video,
                TrackKind::Audio => &mut selection.audio,
                TrackKind::Other => continue,
            };
            for rep in &set.representations {
                if slot.map_or(true, |best| rep.bandwidth > best.rep.bandwidth) {
                    *slot = Some(Track { period, set, rep });
                }
            }
        }
        selection
    }

    /// Representation by id in the active period.
    pub fn track(&self, rep_id: &str) -> Option<Track<'_>> {
        let period = self.active_period()?;
        period.adaptation_sets.iter().find_map(|set| {
            set.representations
                .iter()
                .find(|rep| rep.id == rep_id)
                .map(|rep| Track { period, set, rep })
        })
    }

    /// Key ids and ClearKey license URL declared anywhere in the manifest.
    pub fn protection(&self) -> MpdProtection {
        let mut out = MpdProtection::default();
        let all = self.periods.iter().flat_map(|p| &p.adaptation_sets).flat_map(|set| {
            set.protection
                .iter()
                .chain(set.representations.iter().flat_map(|r| &r.protection))
        });
        for cp in all {
            if let Some(kid) = cp.default_kid.as_deref().and_then(|k| decode_16("KID", k).ok()) {
                if !out.kids.contains(&kid) {
                    out.kids.push(kid);
                }
            }
            if cp.scheme.eq_ignore_ascii_case(CLEARKEY_SCHEME) {
                out.clearkey = true;
                if out.license_url.is_none() {
                    out.license_url = cp.license_url.clone();
                }
            }
        }
        out
    }

    /// Seconds covered by a period, when known.
    fn period_duration(&self, period: &Period) -> Option<f64> {
        period.duration.or_else(|| {
            let index = self.periods.iter().position(|p| std::ptr::eq(p, period))?;
            match self.periods.get(index + 1) {
                Some(next) => Some(next.start - period.start),
                None => self.duration.map(|total| total - period.start),
            }
        })
    }

    /// Expand a representation's addressing into concrete segment URLs.
    pub fn plan(&self, track: Track<'_>, manifest_url: &Url, now: DateTime<Utc>) -> Result<SegmentPlan> {
        let base = self.base_for(track, manifest_url);
        let Track { period, set, rep } = track;
        let period_secs = self.period_duration(period);
        let period_start = self
            .availability_start
            .map(|ast| ast + secs(period.start));

        let template = [&rep.template, &set.template, &period.template]
            .into_iter()
            .flatten()
            .fold(None::<SegmentTemplate>, |acc, level| {
                Some(match acc {
                    Some(child) => child.inherit(level),
                    None => level.clone(),
                })
            });

        if let Some(template) = template.filter(|t| t.media.is_some()) {
            return self.plan_template(&template, rep, &base, period_secs, period_start, now);
        }

        if let Some(list) = rep.list.as_ref().or(set.list.as_ref()) {
            let timescale = list.timescale.unwrap_or(1).max(1);
            let duration = match list.duration {
                Some(d) => d as f64 / timescale as f64,
                None => period_secs.unwrap_or(0.0) / list.media.len().max(1) as f64,
            };
            let segments = list
                .media
                .iter()
                .enumerate()
                .map(|(i, media)| Segment {
                    url: join(&base, media),
                    duration,
                    number: i as u64 + 1,
                    program_date_time: None,
                })
                .collect();
            return Ok(SegmentPlan {
                init: list.initialization.as_deref().map(|i| join(&base, i)),
                segments,
            });
        }

        // SegmentBase or bare BaseURL: the whole file is one segment.
        Ok(SegmentPlan {
            init: None,
            segments: vec![Segment {
                url: base.to_string(),
                duration: period_secs.unwrap_or(0.0),
                number: 1,
                program_date_time: None,
            }],
        })
    }

    fn plan_template(
        &self,
        template: &SegmentTemplate,
        rep: &Representation,
        base: &Url,
        period_secs: Option<f64>,
        period_start: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<SegmentPlan> {
        let media = template.media.as_deref().unwrap_or_default();
        let timescale = template.timescale.unwrap_or(1).max(1);
        let start_number = template.start_number.unwrap_or(1);
        let pto = template.presentation_time_offset.unwrap_or(0);
        let to_secs = |ticks: u64| ticks as f64 / timescale as f64;
        let pdt = |ticks: u64| {
            if !self.dynamic {
                return None;
            }
            period_start.map(|start| start + secs(to_secs(ticks.saturating_sub(pto))))
        };

        let mut segments = Vec::new();
        let overflow = || ProxyError::rewrite("SegmentTimeline time overflows");
        if !template.timeline.is_empty() {
            let period_end = period_secs.map(|s| pto + (s * timescale as f64) as u64);
            let mut time = 0u64;
            let mut number = start_number;
            for (i, entry) in template.timeline.iter().enumerate() {
                if let Some(t) = entry.t {
                    time = t;
                }
                if entry.d == 0 {
                    return Err(ProxyError::rewrite("SegmentTimeline entry with zero duration"));
                }
                let repeats = if entry.r >= 0 {
                    entry.r as u64 + 1
                } else {
                    // Negative repeat runs to the next entry's start or the period end.
                    let until = template
                        .timeline
                        .get(i + 1)
                        .and_then(|next| next.t)
                        .or(period_end);
                    until.map_or(1, |end| end.saturating_sub(time).div_ceil(entry.d).max(1))
                };
                let total = (segments.len() as u64).saturating_add(repeats);
                if total > MAX_SEGMENTS {
                    return Err(too_many_segments(total));
                }
                for _ in 0..repeats {
                    segments.push(Segment {
                        url: join(base, &expand_template(media, rep, Some(number), Some(time))),
                        duration: to_secs(entry.d),
                        number,
                        program_date_time: pdt(time),
                    });
                    time = time.checked_add(entry.d).ok_or_else(overflow)?;
                    number = number.checked_add(1).ok_or_else(overflow)?;
                }
            }
        } else if let Some(duration) = template.duration.filter(|d| *d > 0) {
            let seg_secs = to_secs(duration);
            let (first, count) = match (self.dynamic, period_start) {
                (true, Some(start)) => {
                    let elapsed = (now - start).num_milliseconds() as f64 / 1000.0;
                    let available = (elapsed / seg_secs).floor().max(0.0) as u64;
                    let window = (LIVE_WINDOW_SECS / seg_secs).ceil() as u64 + LIVE_HOLD_BACK as u64;
                    let first = available.saturating_sub(window);
                    (first, available - first)
                }
                _ => {
                    let total = period_secs.ok_or_else(|| {
                        ProxyError::rewrite("cannot count segments: no period or presentation duration")
                    })?;
                    (0, (total / seg_secs).ceil() as u64)
                }
            };
            if count > MAX_SEGMENTS {
                return Err(too_many_segments(count));
            }
            for index in first..first + count {
                let number = start_number.checked_add(index).ok_or_else(overflow)?;
                let time = index
                    .checked_mul(duration)
                    .and_then(|t| t.checked_add(pto))
                    .ok_or_else(overflow)?;
                segments.push(Segment {
                    url: join(base, &expand_template(media, rep, Some(number), Some(time))),
                    duration: seg_secs,
                    number,
                    program_date_time: pdt(time),
                });
            }
        } else {
            return Err(ProxyError::rewrite(format!(
                "representation '{}' has a SegmentTemplate without timeline or duration",
                rep.id
            )));
        }

        Ok(SegmentPlan {
            init: template
                .initialization
                .as_deref()
                .map(|init| join(base, &expand_template(init, rep, None, None))),
            segments,
        })
    }

    fn base_for(&self, track: Track<'_>, manifest_url: &Url) -> Url {
        [
            self.base_url.as_deref(),
            track.period.base_url.as_deref(),
            track.set.base_url.as_deref(),
            track.rep.base_url.as_deref(),
        ]
        .into_iter()
        .flatten()
        .fold(manifest_url.clone(), |base, next| base.join(next).unwrap_or(base))
    }

    /// Master playlist: one video variant plus its audio rendition.
    pub fn master_playlist(&self, manifest_url: &Url, ctx: &RewriteContext) -> Result<String> {
        ctx.check_depth()?;
        let selection = self.select();
        let target = manifest_url.as_str();

        let mut lines = vec![
            "#EXTM3U".to_string(),
            "#EXT-X-VERSION:6".to_string(),
            "#EXT-X-INDEPENDENT-SEGMENTS".to_string(),
        ];

        let (primary, audio_group) = match (selection.video, selection.audio) {
            (Some(video), Some(audio)) => {
                let lang = audio.set.lang.as_deref().unwrap_or("und");
                lines.push(format!(
                    "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"audio\",NAME=\"{lang}\",LANGUAGE=\"{lang}\",DEFAULT=YES,AUTOSELECT=YES,URI=\"{}\"",
                    ctx.representation_link(target, &audio.rep.id)
                ));
                (video, Some(audio))
            }
            (Some(track), None) | (None, Some(track)) => (track, None),
            (None, None) => return Err(ProxyError::rewrite("MPD has no playable video or audio representation")),
        };

        let bandwidth = primary.rep.bandwidth + audio_group.map_or(0, |a| a.rep.bandwidth);
        let mut inf = vec![format!("BANDWIDTH={bandwidth}")];
        if let (Some(w), Some(h)) = (primary.rep.width, primary.rep.height) {
            inf.push(format!("RESOLUTION={w}x{h}"));
        }
        if let Some(rate) = primary.rep.frame_rate.as_deref().and_then(frame_rate) {
            inf.push(format!("FRAME-RATE={rate:.3}"));
        }
        let codecs: Vec<&str> = [Some(primary), audio_group]
            .into_iter()
            .flatten()
            .filter_map(|t| t.rep.codecs.as_deref().or(t.set.codecs.as_deref()))
            .collect();
        if !codecs.is_empty() {
            inf.push(format!("CODECS=\"{}\"", codecs.join(",")));
        }
        if audio_group.is_some() {
            inf.push("AUDIO=\"audio\"".to_string());
        }
        lines.push(format!("#EXT-X-STREAM-INF:{}", inf.join(",")));
        lines.push(ctx.representation_link(target, &primary.rep.id));

        Ok(lines.join("\n") + "\n")
    }

    /// Media playlist for one representation.
    pub fn media_playlist(
        &self,
        rep_id: &str,
        manifest_url: &Url,
        ctx: &RewriteContext,
        now: DateTime<Utc>,
    ) -> Result<String> {
        ctx.check_depth()?;
        let track = self
            .track(rep_id)
            .ok_or_else(|| ProxyError::rewrite(format!("representation '{rep_id}' not found in MPD")))?;
        let mut plan = self.plan(track, manifest_url, now)?;

        if self.dynamic {
            apply_live_window(&mut plan.segments);
        }

        let target = plan
            .segments
            .iter()
            .map(|s| s.duration)
            .fold(0.0_f64, f64::max)
            .ceil()
            .max(1.0) as u64;
        let first_number = plan.segments.first().map_or(0, |s| s.number);

        let mut lines = vec![
            "#EXTM3U".to_string(),
            "#EXT-X-VERSION:6".to_string(),
            format!("#EXT-X-TARGETDURATION:{target}"),
            format!("#EXT-X-MEDIA-SEQUENCE:{first_number}"),
            "#EXT-X-INDEPENDENT-SEGMENTS".to_string(),
        ];
        if !self.dynamic {
            lines.push("#EXT-X-PLAYLIST-TYPE:VOD".to_string());
        }

        let server_side = ctx.decrypts_server_side();
        if ctx.drm.is_some() && ctx.client_decrypt {
            lines.push(format!(
                "#EXT-X-KEY:METHOD=SAMPLE-AES-CTR,URI=\"{}\",KEYFORMAT=\"identity\"",
                ctx.key_link("")
            ));
        }
        if let Some(init) = plan.init.as_deref() {
            let uri = if server_side {
                ctx.decrypt_init_link(init)
            } else {
                ctx.segment_link(init)
            };
            lines.push(format!("#EXT-X-MAP:URI=\"{uri}\""));
        }

        for segment in &plan.segments {
            if let Some(pdt) = segment.program_date_time {
                lines.push(format!(
                    "#EXT-X-PROGRAM-DATE-TIME:{}",
                    pdt.format("%Y-%m-%dT%H:%M:%S%.3fZ")
                ));
            }
            lines.push(format!("#EXTINF:{:.5},", segment.duration));
            lines.push(if server_side {
                ctx.decrypt_segment_link(&segment.url, plan.init.as_deref())
            } else {
                ctx.segment_link(&segment.url)
            });
        }

        if !self.dynamic {
            lines.push("#EXT-X-ENDLIST".to_string());
        }
        Ok(lines.join("\n") + "\n")
    }
}

/// Keep the last [`LIVE_WINDOW_SECS`] of segments, then drop the newest
/// [`LIVE_HOLD_BACK`].
fn apply_live_window(segments: &mut Vec<Segment>) {
    let mut covered = 0.0;
    let mut keep_from = segments.len();
    while keep_from > 0 && covered < LIVE_WINDOW_SECS {
        keep_from -= 1;
        covered += segments[keep_from].duration;
    }
    segments.drain(..keep_from);
    if segments.len() > LIVE_HOLD_BACK {
        segments.truncate(segments.len() - LIVE_HOLD_BACK);
    }
}

/// Expand `$RepresentationID$`, `$Number$`, `$Time$`, `$Bandwidth$` (with
/// optional `%0Nd` width) and `$$`.
pub fn expand_template(template: &str, rep: &Representation, number: Option<u64>, time: Option<u64>) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;
    while let Some(open) = rest.find('$') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('$') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let token = &after[..close];
        let (name, format) = token.split_once('%').unwrap_or((token, ""));
        let value = match name {
            "" => Some("$".to_string()),
            "RepresentationID" => Some(rep.id.clone()),
            "Number" => number.map(|n| pad(n, format)),
            "Time" => time.map(|t| pad(t, format)),
            "Bandwidth" => Some(pad(rep.bandwidth, format)),
            _ => None,
        };
        match value {
            Some(value) => out.push_str(&value),
            None => {
                out.push('$');
                out.push_str(token);
                out.push('$');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

fn pad(value: u64, format: &str) -> String {
    let width = format
        .strip_suffix('d')
        .and_then(|w| w.trim_start_matches('0').parse::<usize>().ok())
        .unwrap_or(0);
    format!("{value:0width$}")
}

fn frame_rate(raw: &str) -> Option<f64> {
    match raw.split_once('/') {
        Some((n, d)) => {
            let d: f64 = d.parse().ok()?;
            (d > 0.0).then(|| n.parse::<f64>().ok().map(|n| n / d)).flatten()
        }
        None => raw.parse().ok(),
    }
}

fn join(base: &Url, link: &str) -> String {
    base.join(link.trim()).map_or_else(|_| link.to_string(), String::from)
}

fn secs(seconds: f64) -> ChronoDuration {
    ChronoDuration::milliseconds((seconds * 1000.0).round() as i64)
}

/// ISO 8601 duration (`PT1H2M3.5S`, `P1DT2H`) in seconds.
pub fn parse_duration(text: &str) -> Option<f64> {
    let caps = ISO_DURATION.captures(text.trim())?;
    let part = |i: usize, scale: f64| {
        caps.get(i)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map_or(0.0, |v| v * scale)
    };
    Some(part(1, 86_400.0) + part(2, 3600.0) + part(3, 60.0) + part(4, 1.0))
}

fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(text.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

/// Incremental MPD model builder driven by quick-xml events.
#[derive(Default)]
struct MpdBuilder {
    mpd: Mpd,
    seen_root: bool,
    period: Option<Period>,
    set: Option<AdaptationSet>,
    rep: Option<Representation>,
    template: Option<SegmentTemplate>,
    list: Option<SegmentList>,
    protection: Option<ContentProtection>,
    text: String,
}

impl MpdBuilder {
    fn parse(mut self, xml: &str) -> Result<Mpd> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) => self.open(e)?,
                Ok(Event::Empty(ref e)) => {
                    self.open(e)?;
                    self.close(e.local_name().as_ref());
                }
                Ok(Event::End(ref e)) => self.close(e.local_name().as_ref()),
                Ok(Event::Text(ref e)) => {
                    let text = e
                        .unescape()
                        .map_err(|err| ProxyError::rewrite(format!("invalid MPD text: {err}")))?;
                    self.text.push_str(&text);
                }
                Ok(Event::CData(ref e)) => self.text.push_str(&String::from_utf8_lossy(e)),
                Ok(Event::Eof) => break,
                Err(err) => {
                    return Err(ProxyError::rewrite(format!(
                        "invalid MPD XML at byte {}: {err}",
                        reader.buffer_position()
                    )))
                }
                _ => {}
            }
        }

        if !self.seen_root {
            return Err(ProxyError::rewrite("body is not a DASH manifest (no <MPD> root)"));
        }
        Ok(self.mpd)
    }

    fn open(&mut self, e: &BytesStart<'_>) -> Result<()> {
        let attrs = attributes(e)?;
        let get = |name: &str| attrs.get(name).cloned();
        let number = |name: &str| attrs.get(name).and_then(|v| v.trim().parse::<u64>().ok());
        self.text.clear();

        match e.local_name().as_ref() {
            b"MPD" => {
                self.seen_root = true;
                self.mpd.dynamic = get("type").is_some_and(|t| t.eq_ignore_ascii_case("dynamic"));
                self.mpd.availability_start = get("availabilityStartTime").as_deref().and_then(parse_datetime);
                self.mpd.duration = get("mediaPresentationDuration").as_deref().and_then(parse_duration);
            }
            b"Period" => {
                self.period = Some(Period {
                    id: get("id"),
                    start: get("start").as_deref().and_then(parse_duration).unwrap_or(0.0),
                    duration: get("duration").as_deref().and_then(parse_duration),
                    ..Period::default()
                });
            }
            b"AdaptationSet" => {
                self.set = Some(AdaptationSet {
                    content_type: get("contentType"),
                    mime_type: get("mimeType"),
                    lang: get("lang"),
                    codecs: get("codecs"),
                    ..AdaptationSet::default()
                });
            }
            b"Representation" => {
                self.rep = Some(Representation {
                    id: get("id").unwrap_or_default(),
                    bandwidth: number("bandwidth").unwrap_or(0),
                    width: number("width").and_then(|w| u32::try_from(w).ok()),
                    height: number("height").and_then(|h| u32::try_from(h).ok()),
                    frame_rate: get("frameRate"),
                    codecs: get("codecs"),
                    mime_type: get("mimeType"),
                    ..Representation::default()
                });
            }
            b"SegmentTemplate" => {
                self.template = Some(SegmentTemplate {
                    media: get("media"),
                    initialization: get("initialization"),
                    timescale: number("timescale"),
                    start_number: number("startNumber"),
                    duration: number("duration"),
                    presentation_time_offset: number("presentationTimeOffset"),
                    timeline: Vec::new(),
                });
            }
            b"S" => {
                if let (Some(template), Some(d)) = (self.template.as_mut(), number("d")) {
                    template.timeline.push(TimelineEntry {
                        t: number("t"),
                        d,
                        r: attrs.get("r").and_then(|r| r.trim().parse().ok()).unwrap_or(0),
                    });
                }
            }
            b"SegmentList" => {
                self.list = Some(SegmentList {
                    timescale: number("timescale"),
                    duration: number("duration"),
                    ..SegmentList::default()
                });
            }
            b"Initialization" => {
                if let (Some(list), Some(source)) = (self.list.as_mut(), get("sourceURL")) {
                    list.initialization = Some(source);
                }
            }
            b"SegmentURL" => {
                if let (Some(list), Some(media)) = (self.list.as_mut(), get("media")) {
                    list.media.push(media);
                }
            }
            b"ContentProtection" => {
                self.protection = Some(ContentProtection {
                    scheme: get("schemeIdUri").unwrap_or_default().to_ascii_lowercase(),
                    default_kid: get("default_KID"),
                    license_url: None,
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, name: &[u8]) {
        match name {
            b"BaseURL" => {
                let text = std::mem::take(&mut self.text).trim().to_string();
                if text.is_empty() {
                    return;
                }
                let slot = if let Some(rep) = self.rep.as_mut() {
                    &mut rep.base_url
                } else if let Some(set) = self.set.as_mut() {
                    &mut set.base_url
                } else if let Some(period) = self.period.as_mut() {
                    &mut period.base_url
                } else {
                    &mut self.mpd.base_url
                };
                if slot.is_none() {
                    *slot = Some(text);
                }
            }
            b"Laurl" | b"laurl" => {
                let text = std::mem::take(&mut self.text).trim().to_string();
                if let Some(cp) = self.protection.as_mut().filter(|_| !text.is_empty()) {
                    cp.license_url = Some(text);
                }
            }
            b"SegmentTemplate" => {
                let Some(template) = self.template.take() else { return };
                if let Some(rep) = self.rep.as_mut() {
                    rep.template = Some(template);
                } else if let Some(set) = self.set.as_mut() {
                    set.template = Some(template);
                } else if let Some(period) = self.period.as_mut() {
                    period.template = Some(template);
                }
            }
            b"SegmentList" => {
                let Some(list) = self.list.take() else { return };
                if let Some(rep) = self.rep.as_mut() {
                    rep.list = Some(list);
                } else if let Some(set) = self.set.as_mut() {
                    set.list = Some(list);
                }
            }
            b"ContentProtection" => {
                let Some(cp) = self.protection.take() else { return };
                if let Some(rep) = self.rep.as_mut() {
                    rep.protection.push(cp);
                } else if let Some(set) = self.set.as_mut() {
                    set.protection.push(cp);
                }
            }
            b"Representation" => {
                if let (Some(rep), Some(set)) = (self.rep.take(), self.set.as_mut()) {
                    set.representations.push(rep);
                }
            }
            b"AdaptationSet" => {
                if let (Some(set), Some(period)) = (self.set.take(), self.period.as_mut()) {
                    period.adaptation_sets.push(set);
                }
            }
            b"Period" => {
                if let Some(period) = self.period.take() {
                    self.mpd.periods.push(period);
                }
            }
            _ => {}
        }
    }
}

/// Attributes keyed by local name, values unescaped.
fn attributes(e: &BytesStart<'_>) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    for attr in e.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| ProxyError::rewrite(format!("invalid MPD attribute '{key}': {err}")))?;
        out.insert(key, value.into_owned());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::DrmDescriptor;
    use crate::manifest::links::{ProxyLinks, RouteState};

    const VOD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" xmlns:cenc="urn:mpeg:cenc:2013" xmlns:dashif="https://dashif.org/CPS"
     type="static" mediaPresentationDuration="PT0M20.000S" minBufferTime="PT2S">
  <BaseURL>https://cdn.example/vod/</BaseURL>
  <Period id="p0">
    <AdaptationSet contentType="video" mimeType="video/mp4" codecs="avc1.64001f">
      <ContentProtection schemeIdUri="urn:mpeg:dash:mp4protection:2011" value="cenc"
          cenc:default_KID="eb676abb-cb34-5e96-bbcf-616630f1a3da"/>
      <ContentProtection schemeIdUri="urn:uuid:E2719D58-A985-B3C9-781A-B030AF78D30E">
        <dashif:Laurl>https://license.example/clearkey?a=1&amp;b=2</dashif:Laurl>
      </ContentProtection>
      <SegmentTemplate timescale="90000" initialization="$RepresentationID$/init.mp4"
          media="$RepresentationID$/seg-$Number%05d$.m4s" startNumber="1">
        <SegmentTimeline>
          <S t="0" d="360000" r="3"/>
          <S d="180000"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="v480" bandwidth="1200000" width="854" height="480" frameRate="25"/>
      <Representation id="v720" bandwidth="3000000" width="1280" height="720" frameRate="30000/1001"/>
      <Representation id="v720b" bandwidth="3000000" width="1280" height="720"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio" lang="en" mimeType="audio/mp4">
      <SegmentTemplate timescale="48000" duration="96000" initialization="audio/init.mp4"
          media="audio/$Time$.m4s"/>
      <Representation id="a128" bandwidth="128000" codecs="mp4a.40.2"/>
      <Representation id="a64" bandwidth="64000" codecs="mp4a.40.5"/>
    </AdaptationSet>
    <AdaptationSet contentType="text" mimeType="text/vtt">
      <Representation id="sub" bandwidth="9999999"><BaseURL>subs.vtt</BaseURL></Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

    const LIVE: &str = r#"<MPD type="dynamic" availabilityStartTime="2024-01-01T00:00:00Z" minimumUpdatePeriod="PT2S">
  <Period start="PT0S">
    <AdaptationSet mimeType="video/mp4">
      <SegmentTemplate timescale="1" duration="2" startNumber="100" media="live/$Number$.m4s" initialization="live/init.mp4"/>
      <Representation id="v" bandwidth="1000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    fn url() -> Url {
        Url::parse("https://origin.example/path/manifest.mpd").unwrap()
    }

    fn ctx() -> RewriteContext {
        RewriteContext::new(ProxyLinks::new("http://proxy.local", None), 3)
    }

    fn now() -> DateTime<Utc> {
        parse_datetime("2024-01-01T01:00:00Z").unwrap()
    }

    fn target_of(link: &str) -> RouteState {
        RouteState::from_query(link.split_once('?').unwrap().1).unwrap()
    }

    #[test]
    fn test_parse_model() {
        let mpd = Mpd::parse(VOD).unwrap();
        assert!(!mpd.dynamic);
        assert_eq!(mpd.duration, Some(20.0));
        assert_eq!(mpd.base_url.as_deref(), Some("https://cdn.example/vod/"));
        let period = &mpd.periods[0];
        assert_eq!(period.adaptation_sets.len(), 3);
        let video = &period.adaptation_sets[0];
        assert_eq!(video.kind(), TrackKind::Video);
        assert_eq!(video.representations.len(), 3);
        assert_eq!(video.template.as_ref().unwrap().timeline.len(), 2);
        assert_eq!(period.adaptation_sets[2].kind(), TrackKind::Other);
    }

    #[test]
    fn test_selection_highest_bandwidth_first_declared() {
        let mpd = Mpd::parse(VOD).unwrap();
        let selection = mpd.select();
        assert_eq!(selection.video.unwrap().rep.id, "v720");
        assert_eq!(selection.audio.unwrap().rep.id, "a128");
    }

    #[test]
    fn test_protection() {
        let protection = Mpd::parse(VOD).unwrap().protection();
        assert!(protection.clearkey);
        assert_eq!(hex::encode(protection.kids[0]), "eb676abbcb345e96bbcf616630f1a3da");
        assert_eq!(
            protection.license_url.as_deref(),
            Some("https://license.example/clearkey?a=1&b=2")
        );
    }

    #[test]
    fn test_timeline_count_and_duration() {
        let mpd = Mpd::parse(VOD).unwrap();
        let plan = mpd.plan(mpd.track("v720").unwrap(), &url(), now()).unwrap();
        assert_eq!(plan.segments.len(), 5);
        assert!((plan.total_duration() - 18.0).abs() < 1e-6);
        assert_eq!(plan.init.as_deref(), Some("https://cdn.example/vod/v720/init.mp4"));
        assert_eq!(plan.segments[0].url, "https://cdn.example/vod/v720/seg-00001.m4s");
        assert_eq!(plan.segments[4].number, 5);
    }

    #[test]
    fn test_fixed_duration_uses_presentation_length() {
        let mpd = Mpd::parse(VOD).unwrap();
        let plan = mpd.plan(mpd.track("a128").unwrap(), &url(), now()).unwrap();
        assert_eq!(plan.segments.len(), 10);
        assert!((plan.total_duration() - 20.0).abs() < 1e-6);
        assert_eq!(plan.segments[1].url, "https://cdn.example/vod/audio/96000.m4s");
    }

    #[test]
    fn test_master_playlist() {
        let mpd = Mpd::parse(VOD).unwrap();
        let out = mpd.master_playlist(&url(), &ctx()).unwrap();
        let media = out.lines().find(|l| l.starts_with("#EXT-X-MEDIA:")).unwrap();
        assert!(media.contains("LANGUAGE=\"en\""));
        let inf = out.lines().find(|l| l.starts_with("#EXT-X-STREAM-INF:")).unwrap();
        assert!(inf.contains("BANDWIDTH=3128000"));
        assert!(inf.contains("RESOLUTION=1280x720"));
        assert!(inf.contains("FRAME-RATE=29.970"));
        assert!(inf.contains("CODECS=\"avc1.64001f,mp4a.40.2\""));

        let variant = out.lines().last().unwrap();
        let state = target_of(variant);
        assert_eq!(state.rep_id.as_deref(), Some("v720"));
        assert_eq!(state.depth, Some(1));
        assert_eq!(state.url.as_deref(), Some(url().as_str()));
    }

    #[test]
    fn test_vod_media_playlist() {
        let mpd = Mpd::parse(VOD).unwrap();
        let out = mpd.media_playlist("v720", &url(), &ctx(), now()).unwrap();
        assert!(out.contains("#EXT-X-TARGETDURATION:4\n"));
        assert!(out.contains("#EXT-X-PLAYLIST-TYPE:VOD\n"));
        assert!(out.trim_end().ends_with("#EXT-X-ENDLIST"));
        assert_eq!(out.matches("#EXTINF:4.00000,").count(), 4);
        assert_eq!(out.matches("#EXTINF:2.00000,").count(), 1);
        assert!(out.contains("#EXT-X-MAP:URI=\"http://proxy.local/proxy/stream?url="));
        assert!(!out.contains("#EXT-X-KEY"));
        assert!(!out.contains("PROGRAM-DATE-TIME"));
    }

    #[test]
    fn test_drm_routes_through_decrypt() {
        let drm = DrmDescriptor::from_clearkey(
            "eb676abbcb345e96bbcf616630f1a3da:100b6c20940f779a4589152b57d2dacb",
        )
        .unwrap();
        let mpd = Mpd::parse(VOD).unwrap();
        let ctx = ctx().with_drm(Some(drm));
        let out = mpd.media_playlist("v720", &url(), &ctx, now()).unwrap();
        assert!(out.contains("#EXT-X-MAP:URI=\"http://proxy.local/decrypt/init.mp4?url="));
        let segment = out.lines().find(|l| l.contains("/decrypt/segment.mp4")).unwrap();
        let state = target_of(segment);
        assert_eq!(state.init_url.as_deref(), Some("https://cdn.example/vod/v720/init.mp4"));
        assert!(state.drm.is_some());
        assert!(!out.contains("#EXT-X-KEY"));

        let mut client = ctx.clone();
        client.client_decrypt = true;
        let out = mpd.media_playlist("v720", &url(), &client, now()).unwrap();
        assert!(out.contains("#EXT-X-KEY:METHOD=SAMPLE-AES-CTR,URI=\"http://proxy.local/key?clearkey="));
        assert!(!out.contains("/decrypt/"));
    }

    #[test]
    fn test_live_window_and_hold_back() {
        let mpd = Mpd::parse(LIVE).unwrap();
        let out = mpd.media_playlist("v", &url(), &ctx(), now()).unwrap();
        let count = out.matches("#EXTINF:").count();
        // 90 segments cover the 180 s window; three are held back.
        assert_eq!(count, 87);
        assert!(!out.contains("ENDLIST"));
        assert!(!out.contains("PLAYLIST-TYPE"));
        assert_eq!(out.matches("#EXT-X-PROGRAM-DATE-TIME:").count(), count);
        // 3600 s elapsed at 2 s each: 1800 published, numbered from 100.
        assert!(out.contains("#EXT-X-MEDIA-SEQUENCE:1810\n"));
        assert!(out.contains("#EXT-X-PROGRAM-DATE-TIME:2024-01-01T00:57:00.000Z"));
    }

    #[test]
    fn test_unknown_representation() {
        let mpd = Mpd::parse(VOD).unwrap();
        let err = mpd.media_playlist("nope", &url(), &ctx(), now()).unwrap_err();
        assert_eq!(err.category(), "rewrite_error");
    }

    fn single_rep(duration: &str, template: &str) -> String {
        format!(
            r#"<MPD type="static" mediaPresentationDuration="{duration}">
  <Period>
    <AdaptationSet mimeType="video/mp4">
      {template}
      <Representation id="v" bandwidth="1000"/>
    </AdaptationSet>
  </Period>
</MPD>"#
        )
    }

    #[test]
    fn test_segment_expansion_is_bounded() {
        let huge_repeat = single_rep(
            "PT10S",
            r#"<SegmentTemplate timescale="1" media="s-$Number$.m4s"><SegmentTimeline><S t="0" d="1" r="4000000000"/></SegmentTimeline></SegmentTemplate>"#,
        );
        let tiny_duration = single_rep(
            "P1D",
            r#"<SegmentTemplate timescale="1000" duration="1" media="s-$Number$.m4s"/>"#,
        );
        let open_repeat = single_rep(
            "P1D",
            r#"<SegmentTemplate timescale="1000" media="s-$Time$.m4s"><SegmentTimeline><S t="0" d="1" r="-1"/></SegmentTimeline></SegmentTemplate>"#,
        );
        for xml in [huge_repeat, tiny_duration, open_repeat] {
            let mpd = Mpd::parse(&xml).unwrap();
            let err = mpd.media_playlist("v", &url(), &ctx(), now()).unwrap_err();
            assert_eq!(err.category(), "rewrite_error");
            assert!(err.to_string().contains("segments"), "{err}");
        }

        let fine = single_rep(
            "PT10S",
            r#"<SegmentTemplate timescale="1" media="s-$Number$.m4s"><SegmentTimeline><S t="0" d="1" r="9"/></SegmentTimeline></SegmentTemplate>"#,
        );
        let out = Mpd::parse(&fine).unwrap().media_playlist("v", &url(), &ctx(), now()).unwrap();
        assert_eq!(out.lines().filter(|l| l.starts_with("#EXTINF")).count(), 10);
    }

    #[test]
    fn test_not_an_mpd() {
        assert!(Mpd::parse("<html><body/></html>").is_err());
        assert!(Mpd::parse("<MPD><Period></MPD>").is_err());
    }

    #[test]
    fn test_expand_template() {
        let rep = Representation {
            id: "v1".into(),
            bandwidth: 800,
            ..Representation::default()
        };
        assert_eq!(
            expand_template("$RepresentationID$/$Bandwidth$/$Number%06d$-$Time$.m4s?x=$$", &rep, Some(7), Some(90)),
            "v1/800/000007-90.m4s?x=$"
        );
        assert_eq!(expand_template("init-$Unknown$.mp4", &rep, None, None), "init-$Unknown$.mp4");
    }

    #[test]
    fn test_iso_duration() {
        assert_eq!(parse_duration("PT1H2M3.5S"), Some(3723.5));
        assert_eq!(parse_duration("P1DT1S"), Some(86_401.0));
        assert_eq!(parse_duration("PT0S"), Some(0.0));
        assert_eq!(parse_duration("1 hour"), None);
    }
}
