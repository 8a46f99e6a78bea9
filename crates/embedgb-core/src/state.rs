//! Save-state container.
//!
//! A blob starts with the magic `GBST`, a little-endian `u16` version and a
//! `u16` flag word, followed by sections. Each section is a little-endian
//! `u32` byte length and that many payload bytes. Components write their own
//! sections through [`Section`] and read them back through [`SectionReader`];
//! a section that is too short or has bytes left over after loading is
//! rejected, which is how size mismatches between versions are caught.

use crate::error::{CoreError, Result};
use crate::host::{SCREEN_HEIGHT, SCREEN_WIDTH};

pub const MAGIC: &[u8; 4] = b"GBST";
pub const VERSION: u16 = 1;

/// Flag bit: the blob was written by a CGB session.
pub const FLAG_CGB: u16 = 0x0001;
/// Flag bit: the cartridge carries an MBC3 real-time clock.
pub const FLAG_RTC: u16 = 0x0002;

/// Bytes per thumbnail row (1 bit per pixel, MSB first).
pub const THUMBNAIL_STRIDE: usize = SCREEN_WIDTH.div_ceil(8);
/// Total thumbnail size in bytes.
pub const THUMBNAIL_LEN: usize = THUMBNAIL_STRIDE * SCREEN_HEIGHT;

const HEADER_LEN: usize = 8;

/// Append-only section payload builder.
#[derive(Default)]
pub struct Section {
    buf: Vec<u8>,
}

impl Section {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.u8(v as u8)
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn f32(&mut self, v: f32) -> &mut Self {
        self.u32(v.to_bits())
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Builds a complete save-state blob.
pub struct StateWriter {
    out: Vec<u8>,
}

impl StateWriter {
    pub fn new(flags: u16) -> Self {
        let mut out = Vec::with_capacity(0x12000);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        Self { out }
    }

    /// Run `fill` against a fresh section and append it with its length prefix.
    pub fn section(&mut self, fill: impl FnOnce(&mut Section)) {
        let mut section = Section::new();
        fill(&mut section);
        self.out
            .extend_from_slice(&(section.buf.len() as u32).to_le_bytes());
        self.out.extend_from_slice(&section.buf);
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }
}

/// Walks the sections of a blob after validating its header.
pub struct StateReader<'a> {
    data: &'a [u8],
    pos: usize,
    flags: u16,
}

impl<'a> StateReader<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < HEADER_LEN || &data[..4] != MAGIC {
            return Err(CoreError::SaveStateIncompatible("missing GBST tag"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != VERSION {
            return Err(CoreError::SaveStateIncompatible("unsupported version"));
        }
        let flags = u16::from_le_bytes([data[6], data[7]]);
        Ok(Self {
            data,
            pos: HEADER_LEN,
            flags,
        })
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn next_section(&mut self) -> Result<SectionReader<'a>> {
        let len_bytes = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or(CoreError::SaveStateIncompatible("missing section"))?;
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
            as usize;
        let start = self.pos + 4;
        let body = self
            .data
            .get(start..start + len)
            .ok_or(CoreError::SaveStateIncompatible("section overruns blob"))?;
        self.pos = start + len;
        Ok(SectionReader { data: body, pos: 0 })
    }

    /// Fails if bytes remain after the last expected section.
    pub fn finish(self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(CoreError::SaveStateIncompatible("trailing data"));
        }
        Ok(())
    }
}

pub struct SectionReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SectionReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let out = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or(CoreError::SaveStateIncompatible("section too short"))?;
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.u32()?))
    }

    pub fn bytes_into(&mut self, dst: &mut [u8]) -> Result<()> {
        let src = self.take(dst.len())?;
        dst.copy_from_slice(src);
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Fails unless the whole section was consumed.
    pub fn finish(self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(CoreError::SaveStateIncompatible("section size mismatch"));
        }
        Ok(())
    }
}

/// Ordered-dither a frame of 2-bit shades (0 = lightest) into the 1-bit
/// thumbnail stored in save states. A set bit is a light pixel.
pub fn dither_thumbnail(shades: &[u8]) -> [u8; THUMBNAIL_LEN] {
    const PATTERNS: [u8; 5] = [!0x00, !0x44, !0xAA, !0xDD, !0xFF];

    let mut out = [0u8; THUMBNAIL_LEN];
    for y in 0..SCREEN_HEIGHT {
        let row = &shades[y * SCREEN_WIDTH..(y + 1) * SCREEN_WIDTH];
        for x in 0..SCREEN_WIDTH {
            let p0 = row[x] & 3;
            let p1 = row[x ^ 1] & 3;

            let mut level = p0;
            if level >= 2 {
                level += 1;
            }
            if level == 1 && p1 >= 2 {
                level += 1;
            }
            if level == 3 && p1 < 2 {
                level -= 1;
            }

            let mut pattern = PATTERNS[level as usize];
            if y % 2 == 1 {
                pattern = if level == 2 {
                    pattern.rotate_right(1)
                } else {
                    pattern.rotate_right(2)
                };
            }
            let bit = (pattern >> (x % 8)) & 1;
            out[y * THUMBNAIL_STRIDE + x / 8] |= bit << (7 - (x % 8));
        }
    }
    out
}

/// Extract the thumbnail from a save-state blob without loading it.
///
/// The thumbnail is always the final section.
pub fn read_thumbnail(data: &[u8]) -> Result<[u8; THUMBNAIL_LEN]> {
    let mut reader = StateReader::new(data)?;
    let mut last = None;
    while reader.pos < reader.data.len() {
        last = Some(reader.next_section()?);
    }
    let mut section = last.ok_or(CoreError::SaveStateIncompatible("no sections"))?;
    let mut out = [0u8; THUMBNAIL_LEN];
    section.bytes_into(&mut out)?;
    section.finish()?;
    Ok(out)
}
