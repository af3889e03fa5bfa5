//! CENC (`cenc` scheme, AES-128-CTR) decryption of fragmented MP4.
//!
//! The init segment is rewritten into a clear one (`encv`/`enca` become the
//! original format from `frma`, `sinf` and `pssh` are dropped) and remembers
//! each track's default KID and IV size. Media segments lose their
//! `senc`/`saiz`/`saio` boxes, `trun` data offsets and `sidx` sizes shrink
//! by the removed bytes, and every protected sample in `mdat` is decrypted
//! in place.
//!
//! A key whose KID is not in the descriptor is rejected before touching any
//! sample. For AVC/HEVC tracks with whole-sample encryption the decrypted
//! NAL length framing is checked, so a wrong key fails instead of producing
//! garbage. Subsample-encrypted video keeps its framing in the clear and
//! audio has none, so a wrong key there is not detected.

use std::collections::HashMap;

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use tracing::debug;

use super::mp4::{self, malformed, FourCc};
use super::{DrmDescriptor, KEY_LEN};
use crate::error::{ProxyError, Result};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// PIFF sample encryption box (`uuid` type).
const PIFF_SENC_UUID: [u8; 16] = [
    0xa2, 0x39, 0x4f, 0x52, 0x5a, 0x9b, 0x4f, 0x14, 0xa2, 0x44, 0x6c, 0x42, 0x7c, 0x64, 0x8d, 0xf4,
];

/// Header bytes before child boxes in visual/audio sample entries.
const VISUAL_ENTRY_FIXED: usize = 78;
const AUDIO_ENTRY_FIXED: usize = 28;

const SENC_HAS_SUBSAMPLES: u32 = 0x2;

#[derive(Debug, Clone)]
struct Protection {
    kid: [u8; KEY_LEN],
    iv_size: u8,
    constant_iv: Option<Vec<u8>>,
    original_format: FourCc,
}

#[derive(Debug, Clone, Default)]
struct TrackInfo {
    protection: Option<Protection>,
    default_sample_size: u32,
    /// NAL length prefix width for AVC/HEVC tracks.
    nal_length_size: Option<u8>,
}

#[derive(Debug, Clone)]
struct SampleCrypto {
    iv: [u8; 16],
    /// `(clear, encrypted)` byte runs; empty means the whole sample.
    subsamples: Vec<(u16, u32)>,
}

#[derive(Debug, Clone)]
struct TrafPlan {
    track_id: u32,
    /// Explicit `tfhd` base data offset, in input segment coordinates.
    base_offset: Option<u64>,
    data_offset: Option<i64>,
    sample_sizes: Vec<u32>,
    crypto: Vec<SampleCrypto>,
}

#[derive(Debug)]
struct MoofPlan {
    start: usize,
    rewritten: Vec<u8>,
    removed: usize,
    trafs: Vec<TrafPlan>,
}

/// Decryptor bound to one init segment and key set.
#[derive(Debug, Clone)]
pub struct CencDecryptor {
    tracks: HashMap<u32, TrackInfo>,
    keys: HashMap<u32, [u8; KEY_LEN]>,
    clear_init: Vec<u8>,
}

/// Clear version of an encrypted init segment.
pub fn decrypt_init(init: &[u8], drm: &DrmDescriptor) -> Result<Vec<u8>> {
    Ok(CencDecryptor::new(init, drm)?.clear_init)
}

/// Decrypt one media segment given its init segment.
pub fn decrypt_segment(init: &[u8], segment: &[u8], drm: &DrmDescriptor) -> Result<Vec<u8>> {
    CencDecryptor::new(init, drm)?.decrypt_segment(segment)
}

impl CencDecryptor {
    pub fn new(init: &[u8], drm: &DrmDescriptor) -> Result<Self> {
        let mut walker = InitWalker::default();
        let clear_init = walker.rewrite(init)?;

        let mut keys = HashMap::new();
        for (track_id, info) in &walker.tracks {
            let Some(protection) = &info.protection else {
                continue;
            };
            let key = if protection.kid == [0; KEY_LEN] && drm.keys.len() == 1 {
                drm.keys[0].key
            } else {
                *drm.key_for(&protection.kid).ok_or_else(|| {
                    ProxyError::decryption(format!(
                        "no key for KID {} (track {track_id})",
                        hex::encode(protection.kid)
                    ))
                })?
            };
            keys.insert(*track_id, key);
        }
        debug!(
            tracks = walker.tracks.len(),
            protected = keys.len(),
            "parsed CENC init segment"
        );

        Ok(Self {
            tracks: walker.tracks,
            keys,
            clear_init,
        })
    }

    pub fn clear_init(&self) -> &[u8] {
        &self.clear_init
    }

    /// `true` if any track in the init segment is protected.
    pub fn is_protected(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Decrypt a media segment (`styp`/`sidx`/`moof`/`mdat`...).
    pub fn decrypt_segment(&self, segment: &[u8]) -> Result<Vec<u8>> {
        let top = mp4::parse_all(segment)?;

        let mut plans = Vec::new();
        let mut pos = 0;
        let mut removed_before = 0;
        for b in &top {
            if b.is(b"moof") {
                let plan = self.plan_moof(b.payload, pos, removed_before)?;
                removed_before += plan.removed;
                plans.push(plan);
            }
            pos += b.raw.len();
        }
        let total_removed: usize = plans.iter().map(|p| p.removed).sum();

        let mut out = Vec::with_capacity(segment.len());
        let mut plans = plans.into_iter();
        let mut current: Option<MoofPlan> = None;
        let mut pos = 0;
        for b in &top {
            match &b.kind {
                b"sidx" => {
                    let payload = patch_sidx(b.payload, total_removed)?;
                    mp4::write_box(&mut out, b"sidx", &payload)?;
                }
                b"moof" => {
                    let plan = plans.next().ok_or_else(|| malformed("moof plan missing"))?;
                    mp4::write_box(&mut out, b"moof", &plan.rewritten)?;
                    current = Some(plan);
                }
                b"mdat" => {
                    let header_len = b.raw.len() - b.payload.len();
                    let payload = match current.take() {
                        Some(plan) => self.decrypt_mdat(&plan, b.payload, pos + header_len)?,
                        None => b.payload.to_vec(),
                    };
                    write_box_with_header(&mut out, b"mdat", &payload, header_len)?;
                }
                _ => out.extend_from_slice(b.raw),
            }
            pos += b.raw.len();
        }
        Ok(out)
    }

    fn plan_moof(&self, payload: &[u8], start: usize, removed_before: usize) -> Result<MoofPlan> {
        let children = mp4::parse_all(payload)?;

        let mut removed = 0;
        for traf in children.iter().filter(|c| c.is(b"traf")) {
            for child in mp4::boxes(traf.payload) {
                let child = child?;
                if is_sample_aux_box(&child.kind, child.payload) {
                    removed += child.raw.len();
                }
            }
        }

        let mut rewritten = Vec::with_capacity(payload.len());
        let mut trafs = Vec::new();
        for child in &children {
            if child.is(b"traf") {
                let (traf, plan) = self.rewrite_traf(child.payload, removed, removed_before)?;
                mp4::write_box(&mut rewritten, b"traf", &traf)?;
                trafs.push(plan);
            } else {
                rewritten.extend_from_slice(child.raw);
            }
        }
        Ok(MoofPlan {
            start,
            rewritten,
            removed,
            trafs,
        })
    }

    /// Output sample data sits `removed_before + removed` bytes earlier than
    /// in the input. Without an explicit base the `trun` offset is relative
    /// to this moof, which itself moved by `removed_before`, so only
    /// `removed` is taken off. An explicit base is absolute and stays put;
    /// the `trun` offset takes the whole shift, or the base does when there
    /// is no `trun` offset.
    fn rewrite_traf(&self, payload: &[u8], removed: usize, removed_before: usize) -> Result<(Vec<u8>, TrafPlan)> {
        let trun_has_offset = match mp4::find(payload, b"trun")? {
            Some(trun) => mp4::full_box_header(trun.payload)?.1 & 0x01 != 0,
            None => false,
        };
        let cumulative = removed + removed_before;
        let mut trun_shift = i64::try_from(removed).map_err(|_| malformed("moof too large"))?;
        let mut out = Vec::with_capacity(payload.len());
        let mut plan = TrafPlan {
            track_id: 0,
            base_offset: None,
            data_offset: None,
            sample_sizes: Vec::new(),
            crypto: Vec::new(),
        };
        let mut default_size = None;

        for child in mp4::boxes(payload) {
            let child = child?;
            match &child.kind {
                b"tfhd" => {
                    let mut data = child.payload.to_vec();
                    let (_, flags) = mp4::full_box_header(&data)?;
                    plan.track_id = mp4::read_u32(&data, 4)?;
                    let mut at = 8;
                    if flags & 0x01 != 0 {
                        let base = mp4::read_u64(&data, at)?;
                        plan.base_offset = Some(base);
                        if trun_has_offset {
                            trun_shift = i64::try_from(cumulative).map_err(|_| malformed("moof too large"))?;
                        } else {
                            let shifted = base
                                .checked_sub(cumulative as u64)
                                .ok_or_else(|| malformed("tfhd base data offset points before the samples"))?;
                            data[at..at + 8].copy_from_slice(&shifted.to_be_bytes());
                        }
                        at += 8;
                    }
                    if flags & 0x02 != 0 {
                        at += 4;
                    }
                    if flags & 0x08 != 0 {
                        at += 4;
                    }
                    if flags & 0x10 != 0 {
                        default_size = Some(mp4::read_u32(&data, at)?);
                    }
                    mp4::write_box(&mut out, b"tfhd", &data)?;
                }
                b"trun" => {
                    let (data, offset, sizes) = rewrite_trun(child.payload, trun_shift)?;
                    if plan.data_offset.is_none() {
                        plan.data_offset = offset;
                    }
                    let fallback = default_size.unwrap_or_else(|| {
                        self.tracks
                            .get(&plan.track_id)
                            .map_or(0, |t| t.default_sample_size)
                    });
                    plan.sample_sizes
                        .extend(sizes.into_iter().map(|s| s.unwrap_or(fallback)));
                    mp4::write_box(&mut out, b"trun", &data)?;
                }
                kind if is_sample_aux_box(kind, child.payload) => {
                    let senc = if child.is(b"uuid") {
                        &child.payload[16..]
                    } else if child.is(b"senc") {
                        child.payload
                    } else {
                        continue;
                    };
                    let protection = self
                        .tracks
                        .get(&plan.track_id)
                        .and_then(|t| t.protection.as_ref());
                    if let Some(protection) = protection {
                        plan.crypto = parse_senc(senc, protection)?;
                    }
                }
                _ => out.extend_from_slice(child.raw),
            }
        }
        Ok((out, plan))
    }

    fn decrypt_mdat(&self, plan: &MoofPlan, payload: &[u8], payload_pos: usize) -> Result<Vec<u8>> {
        let mut data = payload.to_vec();
        let mut cursor = 0usize;

        for traf in &plan.trafs {
            let mut at = match (traf.base_offset, traf.data_offset) {
                (None, None) => cursor,
                (base, offset) => {
                    let origin = match base {
                        Some(base) => i64::try_from(base).map_err(|_| malformed("tfhd base data offset out of range"))?,
                        None => i64::try_from(plan.start).map_err(|_| malformed("moof offset out of range"))?,
                    };
                    let payload_pos =
                        i64::try_from(payload_pos).map_err(|_| malformed("mdat offset out of range"))?;
                    usize::try_from(origin + offset.unwrap_or(0) - payload_pos)
                        .map_err(|_| malformed("sample data offset points before mdat"))?
                }
            };

            let key = self.keys.get(&traf.track_id);
            let info = self.tracks.get(&traf.track_id);
            for (index, size) in traf.sample_sizes.iter().enumerate() {
                let size = *size as usize;
                let sample = data
                    .get_mut(at..at + size)
                    .ok_or_else(|| malformed("sample extends past mdat"))?;
                if let Some(key) = key {
                    let crypto = traf.crypto.get(index).ok_or_else(|| {
                        malformed(format!("no senc entry for sample {index}"))
                    })?;
                    decrypt_sample(sample, key, crypto)?;
                    if crypto.subsamples.is_empty() {
                        if let Some(width) = info.and_then(|t| t.nal_length_size) {
                            check_nal_framing(sample, width)?;
                        }
                    }
                }
                at += size;
            }
            cursor = at;
        }
        Ok(data)
    }
}

#[derive(Default)]
struct InitWalker {
    tracks: HashMap<u32, TrackInfo>,
    current: u32,
}

impl InitWalker {
    fn rewrite(&mut self, buf: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(buf.len());
        for b in mp4::boxes(buf) {
            let b = b?;
            match &b.kind {
                b"pssh" => {}
                b"moov" | b"trak" | b"mdia" | b"minf" | b"stbl" | b"mvex" => {
                    let inner = self.rewrite(b.payload)?;
                    mp4::write_box(&mut out, &b.kind, &inner)?;
                }
                b"tkhd" => {
                    let (version, _) = mp4::full_box_header(b.payload)?;
                    let at = if version == 1 { 20 } else { 12 };
                    self.current = mp4::read_u32(b.payload, at)?;
                    self.tracks.entry(self.current).or_default();
                    out.extend_from_slice(b.raw);
                }
                b"trex" => {
                    let track_id = mp4::read_u32(b.payload, 4)?;
                    let size = mp4::read_u32(b.payload, 16)?;
                    self.tracks.entry(track_id).or_default().default_sample_size = size;
                    out.extend_from_slice(b.raw);
                }
                b"stsd" => {
                    let inner = self.rewrite_stsd(b.payload)?;
                    mp4::write_box(&mut out, b"stsd", &inner)?;
                }
                _ => out.extend_from_slice(b.raw),
            }
        }
        Ok(out)
    }

    fn rewrite_stsd(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let header = payload.get(..8).ok_or_else(|| malformed("short stsd"))?;
        let mut out = header.to_vec();
        for entry in mp4::boxes(&payload[8..]) {
            let entry = entry?;
            let fixed = match &entry.kind {
                b"encv" => VISUAL_ENTRY_FIXED,
                b"enca" => AUDIO_ENTRY_FIXED,
                _ => {
                    out.extend_from_slice(entry.raw);
                    continue;
                }
            };
            self.rewrite_protected_entry(entry.payload, fixed, &mut out)?;
        }
        Ok(out)
    }

    fn rewrite_protected_entry(&mut self, payload: &[u8], fixed: usize, out: &mut Vec<u8>) -> Result<()> {
        let head = payload
            .get(..fixed)
            .ok_or_else(|| malformed("short protected sample entry"))?;
        let mut body = head.to_vec();
        let mut protection = None;
        let mut nal_length_size = None;

        for child in mp4::boxes(&payload[fixed..]) {
            let child = child?;
            match &child.kind {
                b"sinf" => protection = Some(parse_sinf(child.payload)?),
                b"avcC" => {
                    nal_length_size = Some((mp4::read_u8(child.payload, 4)? & 0x3) + 1);
                    body.extend_from_slice(child.raw);
                }
                b"hvcC" => {
                    nal_length_size = Some((mp4::read_u8(child.payload, 21)? & 0x3) + 1);
                    body.extend_from_slice(child.raw);
                }
                _ => body.extend_from_slice(child.raw),
            }
        }

        let protection =
            protection.ok_or_else(|| malformed("encrypted sample entry without sinf"))?;
        mp4::write_box(out, &protection.original_format, &body)?;

        let track = self.tracks.entry(self.current).or_default();
        track.nal_length_size = nal_length_size;
        track.protection = Some(protection);
        Ok(())
    }
}

fn parse_sinf(payload: &[u8]) -> Result<Protection> {
    let mut original_format = None;
    let mut tenc = None;
    for child in mp4::boxes(payload) {
        let child = child?;
        match &child.kind {
            b"frma" => original_format = Some(mp4::read_array::<4>(child.payload, 0)?),
            b"schm" => {
                let scheme = mp4::read_array::<4>(child.payload, 4)?;
                if &scheme != b"cenc" {
                    return Err(ProxyError::decryption(format!(
                        "unsupported protection scheme '{}'",
                        String::from_utf8_lossy(&scheme)
                    )));
                }
            }
            b"schi" => tenc = mp4::find(child.payload, b"tenc")?.map(|b| b.payload),
            _ => {}
        }
    }

    let original_format = original_format.ok_or_else(|| malformed("sinf without frma"))?;
    let tenc = tenc.ok_or_else(|| malformed("sinf without tenc"))?;
    let is_protected = mp4::read_u8(tenc, 6)? != 0;
    let iv_size = mp4::read_u8(tenc, 7)?;
    let kid = mp4::read_array::<KEY_LEN>(tenc, 8)?;
    let constant_iv = if is_protected && iv_size == 0 {
        let len = mp4::read_u8(tenc, 24)? as usize;
        Some(
            tenc.get(25..25 + len)
                .ok_or_else(|| malformed("short constant IV"))?
                .to_vec(),
        )
    } else {
        None
    };

    Ok(Protection {
        kid,
        iv_size,
        constant_iv,
        original_format,
    })
}

fn is_sample_aux_box(kind: &FourCc, payload: &[u8]) -> bool {
    match kind {
        b"senc" | b"saiz" | b"saio" => true,
        b"uuid" => payload.get(..16) == Some(&PIFF_SENC_UUID[..]),
        _ => false,
    }
}

/// Returns the patched trun payload, its original data offset and the
/// per-sample sizes (`None` where the default applies).
fn rewrite_trun(payload: &[u8], removed: i64) -> Result<(Vec<u8>, Option<i64>, Vec<Option<u32>>)> {
    let mut data = payload.to_vec();
    let (_, flags) = mp4::full_box_header(&data)?;
    let count = mp4::read_u32(&data, 4)? as usize;
    let mut at = 8;

    let mut offset = None;
    if flags & 0x01 != 0 {
        let original = i64::from(mp4::read_u32(&data, at)? as i32);
        let patched = i32::try_from(original - removed)
            .map_err(|_| malformed("trun data offset out of range"))?;
        data[at..at + 4].copy_from_slice(&patched.to_be_bytes());
        offset = Some(original);
        at += 4;
    }
    if flags & 0x04 != 0 {
        at += 4;
    }

    let mut sizes = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        if flags & 0x100 != 0 {
            at += 4;
        }
        if flags & 0x200 != 0 {
            sizes.push(Some(mp4::read_u32(&data, at)?));
            at += 4;
        } else {
            sizes.push(None);
        }
        if flags & 0x400 != 0 {
            at += 4;
        }
        if flags & 0x800 != 0 {
            at += 4;
        }
    }
    if at > data.len() {
        return Err(malformed("trun shorter than its sample count"));
    }
    Ok((data, offset, sizes))
}

fn parse_senc(payload: &[u8], protection: &Protection) -> Result<Vec<SampleCrypto>> {
    let (_, flags) = mp4::full_box_header(payload)?;
    let count = mp4::read_u32(payload, 4)? as usize;
    let iv_size = protection.iv_size as usize;
    if !matches!(iv_size, 0 | 8 | 16) {
        return Err(malformed(format!("invalid per-sample IV size {iv_size}")));
    }

    let mut at = 8;
    let mut samples = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let mut iv = [0u8; 16];
        if iv_size > 0 {
            let raw = payload
                .get(at..at + iv_size)
                .ok_or_else(|| malformed("senc IV truncated"))?;
            iv[..iv_size].copy_from_slice(raw);
            at += iv_size;
        } else if let Some(constant) = &protection.constant_iv {
            let len = constant.len().min(16);
            iv[..len].copy_from_slice(&constant[..len]);
        }

        let mut subsamples = Vec::new();
        if flags & SENC_HAS_SUBSAMPLES != 0 {
            let entries = mp4::read_u16(payload, at)?;
            at += 2;
            for _ in 0..entries {
                let clear = mp4::read_u16(payload, at)?;
                let encrypted = mp4::read_u32(payload, at + 2)?;
                subsamples.push((clear, encrypted));
                at += 6;
            }
        }
        samples.push(SampleCrypto { iv, subsamples });
    }
    Ok(samples)
}

fn decrypt_sample(sample: &mut [u8], key: &[u8; KEY_LEN], crypto: &SampleCrypto) -> Result<()> {
    let mut cipher = Aes128Ctr::new_from_slices(key, &crypto.iv)
        .map_err(|e| ProxyError::decryption(format!("cipher init: {e}")))?;

    if crypto.subsamples.is_empty() {
        cipher.apply_keystream(sample);
        return Ok(());
    }

    let mut at = 0usize;
    for (clear, encrypted) in &crypto.subsamples {
        at += usize::from(*clear);
        let end = at + *encrypted as usize;
        let run = sample
            .get_mut(at..end)
            .ok_or_else(|| malformed("subsample runs exceed sample size"))?;
        cipher.apply_keystream(run);
        at = end;
    }
    Ok(())
}

/// Length-prefixed NAL units must tile the sample exactly.
fn check_nal_framing(sample: &[u8], width: u8) -> Result<()> {
    let width = usize::from(width);
    let mut at = 0usize;
    while at < sample.len() {
        let prefix = sample
            .get(at..at + width)
            .ok_or_else(|| wrong_key("truncated NAL length"))?;
        let len = prefix.iter().fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
        if len == 0 || at + width + len > sample.len() {
            return Err(wrong_key("NAL length does not fit sample"));
        }
        at += width + len;
    }
    Ok(())
}

fn wrong_key(detail: &str) -> ProxyError {
    ProxyError::decryption(format!(
        "decrypted sample is not valid media ({detail}); the key does not match"
    ))
}

fn patch_sidx(payload: &[u8], removed: usize) -> Result<Vec<u8>> {
    let mut data = payload.to_vec();
    if removed == 0 {
        return Ok(data);
    }
    let (version, _) = mp4::full_box_header(&data)?;
    let refs_at = if version == 0 { 4 + 8 + 8 } else { 4 + 8 + 16 };
    let count = mp4::read_u16(&data, refs_at + 2)?;
    if count == 0 {
        return Ok(data);
    }
    let first = refs_at + 4;
    let word = mp4::read_u32(&data, first)?;
    let size = word & 0x7FFF_FFFF;
    let removed = u32::try_from(removed).map_err(|_| malformed("sidx adjustment too large"))?;
    let patched = (word & 0x8000_0000) | size.saturating_sub(removed);
    data[first..first + 4].copy_from_slice(&patched.to_be_bytes());
    Ok(data)
}

fn write_box_with_header(out: &mut Vec<u8>, kind: &FourCc, payload: &[u8], header_len: usize) -> Result<()> {
    if header_len == 16 {
        out.extend_from_slice(&1u32.to_be_bytes());
        out.extend_from_slice(kind);
        out.extend_from_slice(&(payload.len() as u64 + 16).to_be_bytes());
        out.extend_from_slice(payload);
        Ok(())
    } else {
        mp4::write_box(out, kind, payload)
    }
}
