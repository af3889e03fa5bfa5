//! Minimal ISO-BMFF box reader/writer.
//!
//! Only what CENC rewriting needs: iterate sibling boxes (32/64-bit and
//! to-end sizes), read big-endian fields with bounds checks, and re-emit
//! boxes with recomputed sizes.

use crate::error::{ProxyError, Result};

/// A box header type, e.g. `*b"moov"`.
pub type FourCc = [u8; 4];

/// One box borrowed from a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mp4Box<'a> {
    pub kind: FourCc,
    /// Bytes after the header.
    pub payload: &'a [u8],
    /// The whole box including its header.
    pub raw: &'a [u8],
}

impl Mp4Box<'_> {
    pub fn is(&self, kind: &FourCc) -> bool {
        &self.kind == kind
    }

    pub fn kind_str(&self) -> String {
        String::from_utf8_lossy(&self.kind).into_owned()
    }
}

/// Iterator over sibling boxes.
pub struct BoxIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

/// Iterate the boxes laid out back to back in `buf`.
pub fn boxes(buf: &[u8]) -> BoxIter<'_> {
    BoxIter { buf, pos: 0 }
}

impl<'a> Iterator for BoxIter<'a> {
    type Item = Result<Mp4Box<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let item = read_box(self.buf, self.pos);
        match &item {
            Ok(b) => self.pos += b.raw.len(),
            Err(_) => self.pos = self.buf.len(),
        }
        Some(item)
    }
}

fn read_box(buf: &[u8], start: usize) -> Result<Mp4Box<'_>> {
    let size32 = read_u32(buf, start)?;
    let kind: FourCc = buf
        .get(start + 4..start + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| malformed("truncated box header"))?;

    let (size, header_len) = match size32 {
        0 => (buf.len() - start, 8),
        1 => {
            let large = read_u64(buf, start + 8)?;
            let large = usize::try_from(large).map_err(|_| malformed("box too large"))?;
            (large, 16)
        }
        n => (n as usize, 8),
    };
    if size < header_len || start + size > buf.len() {
        return Err(malformed(format!(
            "box '{}' size {size} exceeds buffer",
            String::from_utf8_lossy(&kind)
        )));
    }
    Ok(Mp4Box {
        kind,
        payload: &buf[start + header_len..start + size],
        raw: &buf[start..start + size],
    })
}

/// Collect all sibling boxes, failing on the first malformed one.
pub fn parse_all(buf: &[u8]) -> Result<Vec<Mp4Box<'_>>> {
    boxes(buf).collect()
}

/// First child of `kind` among `buf`'s boxes.
pub fn find<'a>(buf: &'a [u8], kind: &FourCc) -> Result<Option<Mp4Box<'a>>> {
    for b in boxes(buf) {
        let b = b?;
        if b.is(kind) {
            return Ok(Some(b));
        }
    }
    Ok(None)
}

/// Append a box with a 32-bit size header.
pub fn write_box(out: &mut Vec<u8>, kind: &FourCc, payload: &[u8]) -> Result<()> {
    let size = u32::try_from(payload.len() + 8).map_err(|_| malformed("box exceeds 4 GiB"))?;
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(payload);
    Ok(())
}

/// `(version, flags)` of a full box payload.
pub fn full_box_header(payload: &[u8]) -> Result<(u8, u32)> {
    let word = read_u32(payload, 0)?;
    Ok(((word >> 24) as u8, word & 0x00FF_FFFF))
}

pub fn read_u8(buf: &[u8], at: usize) -> Result<u8> {
    buf.get(at).copied().ok_or_else(|| malformed("unexpected end of box"))
}

pub fn read_u16(buf: &[u8], at: usize) -> Result<u16> {
    Ok(u16::from_be_bytes(read_array(buf, at)?))
}

pub fn read_u32(buf: &[u8], at: usize) -> Result<u32> {
    Ok(u32::from_be_bytes(read_array(buf, at)?))
}

pub fn read_u64(buf: &[u8], at: usize) -> Result<u64> {
    Ok(u64::from_be_bytes(read_array(buf, at)?))
}

pub fn read_array<const N: usize>(buf: &[u8], at: usize) -> Result<[u8; N]> {
    buf.get(at..at + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| malformed("unexpected end of box"))
}

pub fn malformed(msg: impl Into<String>) -> ProxyError {
    ProxyError::Decryption(format!("malformed MP4: {}", msg.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iterates_siblings() {
        let mut buf = Vec::new();
        write_box(&mut buf, b"ftyp", b"isom").unwrap();
        write_box(&mut buf, b"free", &[]).unwrap();
        let all = parse_all(&buf).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].is(b"ftyp"));
        assert_eq!(all[0].payload, b"isom");
        assert_eq!(all[1].raw.len(), 8);
    }

    #[test]
    fn test_large_size_box() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(b"mdat");
        buf.extend_from_slice(&20u64.to_be_bytes());
        buf.extend_from_slice(&[9, 8, 7, 6]);
        let b = find(&buf, b"mdat").unwrap().unwrap();
        assert_eq!(b.payload, &[9, 8, 7, 6]);
    }

    #[test]
    fn test_size_zero_runs_to_end() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(b"mdat");
        buf.extend_from_slice(&[1, 2, 3]);
        let b = parse_all(&buf).unwrap()[0];
        assert_eq!(b.payload, &[1, 2, 3]);
    }

    #[test]
    fn test_truncated_box_is_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&64u32.to_be_bytes());
        buf.extend_from_slice(b"moov");
        assert!(parse_all(&buf).is_err());
        assert!(parse_all(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_full_box_header() {
        let (version, flags) = full_box_header(&[1, 0, 0x02, 0x01]).unwrap();
        assert_eq!(version, 1);
        assert_eq!(flags, 0x201);
    }
}
