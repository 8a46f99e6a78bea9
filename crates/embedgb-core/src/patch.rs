//! Soft-patching of ROM images before they are parsed.
//!
//! IPS, UPS and BPS are recognized by their magic. UPS and BPS carry CRC32s
//! of the source, the target and the patch itself; any mismatch rejects the
//! patch. Every format works on a scratch copy, so a rejected patch leaves
//! the ROM as it was.

use std::path::Path;

use log::{debug, warn};

use crate::error::{CoreError, Result};

const IPS_MAGIC: &[u8; 5] = b"PATCH";
const IPS_EOF: u32 = 0x45_4F_46;
const UPS_MAGIC: &[u8; 4] = b"UPS1";
const BPS_MAGIC: &[u8; 4] = b"BPS1";

/// Source, target and patch CRC32s that end a UPS or BPS file.
const FOOTER_LEN: usize = 12;

/// Largest image a UPS or BPS patch may produce.
const MAX_TARGET_LEN: usize = 16 << 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchFormat {
    Ips,
    Ups,
    Bps,
}

impl PatchFormat {
    /// Format from a file extension, case-insensitively; for hosts listing a
    /// patch directory.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        match ext.to_ascii_lowercase().as_str() {
            "ips" => Some(Self::Ips),
            "ups" => Some(Self::Ups),
            "bps" => Some(Self::Bps),
            _ => None,
        }
    }

    /// Format from the patch's leading magic.
    pub fn detect(patch: &[u8]) -> Option<Self> {
        if patch.starts_with(IPS_MAGIC) {
            Some(Self::Ips)
        } else if patch.starts_with(UPS_MAGIC) {
            Some(Self::Ups)
        } else if patch.starts_with(BPS_MAGIC) {
            Some(Self::Bps)
        } else {
            None
        }
    }
}

/// Apply one IPS patch in place. On error `rom` is left untouched.
pub fn apply_ips(rom: &mut Vec<u8>, ips: &[u8]) -> Result<()> {
    let mut out = rom.clone();
    let mut cur = Cursor::new(ips);

    if cur.take(IPS_MAGIC.len())? != IPS_MAGIC {
        return Err(CoreError::InvalidPatch("missing PATCH header"));
    }

    let mut records = 0usize;
    loop {
        let offset = cur.be(3)? as usize;
        if offset == IPS_EOF as usize {
            // An optional 3-byte size after EOF truncates the image.
            if cur.remaining() == 3 {
                let size = cur.be(3)? as usize;
                if size < out.len() {
                    out.truncate(size);
                }
            }
            break;
        }

        let mut len = cur.be(2)? as usize;
        let rle = len == 0;
        if rle {
            len = cur.be(2)? as usize;
        }
        if offset + len > out.len() {
            out.resize(offset + len, 0);
        }
        if rle {
            let fill = cur.u8()?;
            out[offset..offset + len].fill(fill);
        } else {
            let bytes = cur.take(len)?;
            out[offset..offset + len].copy_from_slice(bytes);
        }
        records += 1;
    }

    debug!("IPS patch applied: {records} records, {} bytes", out.len());
    *rom = out;
    Ok(())
}

/// Split a UPS/BPS file into its body and footer CRCs after checking the
/// magic and the patch's own CRC.
fn checked_body<'a>(patch: &'a [u8], magic: &[u8; 4]) -> Result<(&'a [u8], Footer)> {
    if patch.len() < magic.len() + FOOTER_LEN || !patch.starts_with(magic) {
        return Err(CoreError::InvalidPatch("missing header"));
    }
    let (body, footer) = patch.split_at(patch.len() - FOOTER_LEN);
    let footer = Footer::parse(footer);
    if crc32fast::hash(&patch[..patch.len() - 4]) != footer.patch {
        return Err(CoreError::InvalidPatch("patch checksum mismatch"));
    }
    Ok((&body[magic.len()..], footer))
}

struct Footer {
    source: u32,
    target: u32,
    patch: u32,
}

impl Footer {
    fn parse(bytes: &[u8]) -> Self {
        let word = |i: usize| {
            u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
        };
        Self {
            source: word(0),
            target: word(4),
            patch: word(8),
        }
    }
}

fn target_len(len: u64) -> Result<usize> {
    usize::try_from(len)
        .ok()
        .filter(|&len| len <= MAX_TARGET_LEN)
        .ok_or(CoreError::InvalidPatch("target size out of range"))
}

/// Apply one UPS patch in place. On error `rom` is left untouched.
///
/// A ROM longer than the patch's source size is treated as an overdump and
/// only its leading bytes are checked.
pub fn apply_ups(rom: &mut Vec<u8>, ups: &[u8]) -> Result<()> {
    let (body, footer) = checked_body(ups, UPS_MAGIC)?;
    let mut cur = Cursor::new(body);

    let source_len = cur.vlq()?;
    let target_len = target_len(cur.vlq()?)?;
    let source_len = usize::try_from(source_len)
        .ok()
        .filter(|&len| len <= rom.len())
        .ok_or(CoreError::InvalidPatch("ROM is smaller than the patch source"))?;
    if source_len < rom.len() {
        warn!(
            "UPS patch expects {source_len} bytes, ROM has {}; checking the prefix",
            rom.len()
        );
    }
    if crc32fast::hash(&rom[..source_len]) != footer.source {
        return Err(CoreError::InvalidPatch("patch is for a different ROM"));
    }

    let mut out = vec![0u8; target_len];
    let keep = rom.len().min(target_len);
    out[..keep].copy_from_slice(&rom[..keep]);

    let mut pos = 0usize;
    while cur.remaining() > 0 {
        let skip = usize::try_from(cur.vlq()?)
            .map_err(|_| CoreError::InvalidPatch("offset out of range"))?;
        pos = pos.saturating_add(skip);
        while cur.remaining() > 0 {
            let xor = cur.u8()?;
            if xor == 0 {
                pos = pos.saturating_add(1);
                break;
            }
            let byte = out
                .get_mut(pos)
                .ok_or(CoreError::InvalidPatch("write past the target"))?;
            *byte ^= xor;
            pos += 1;
        }
    }

    if crc32fast::hash(&out) != footer.target {
        return Err(CoreError::InvalidPatch("patched ROM checksum mismatch"));
    }
    debug!("UPS patch applied: {} -> {} bytes", rom.len(), out.len());
    *rom = out;
    Ok(())
}

/// Apply one BPS patch in place. On error `rom` is left untouched.
pub fn apply_bps(rom: &mut Vec<u8>, bps: &[u8]) -> Result<()> {
    let (body, footer) = checked_body(bps, BPS_MAGIC)?;
    let mut cur = Cursor::new(body);

    let source_len = cur.vlq()?;
    let target_len = target_len(cur.vlq()?)?;
    let metadata_len = usize::try_from(cur.vlq()?)
        .map_err(|_| CoreError::InvalidPatch("metadata out of range"))?;
    cur.take(metadata_len)?;
    if source_len != rom.len() as u64 {
        return Err(CoreError::InvalidPatch("ROM size differs from the patch source"));
    }
    if crc32fast::hash(rom) != footer.source {
        return Err(CoreError::InvalidPatch("patch is for a different ROM"));
    }

    let source = rom.as_slice();
    let mut out = Vec::with_capacity(target_len);
    let mut source_rel = 0i64;
    let mut target_rel = 0i64;
    let out_of_bounds = CoreError::InvalidPatch("copy out of bounds");

    while cur.remaining() > 0 {
        let data = cur.vlq()?;
        let len = usize::try_from((data >> 2) + 1).map_err(|_| out_of_bounds.clone())?;
        if out.len() + len > target_len {
            return Err(out_of_bounds);
        }
        match data & 3 {
            // SourceRead
            0 => {
                let start = out.len();
                let chunk = source
                    .get(start..start + len)
                    .ok_or(out_of_bounds.clone())?;
                out.extend_from_slice(chunk);
            }
            // TargetRead
            1 => out.extend_from_slice(cur.take(len)?),
            // SourceCopy
            2 => {
                source_rel = source_rel.saturating_add(cur.signed_vlq()?);
                let start = usize::try_from(source_rel).map_err(|_| out_of_bounds.clone())?;
                let chunk = source
                    .get(start..start + len)
                    .ok_or(out_of_bounds.clone())?;
                out.extend_from_slice(chunk);
                source_rel += len as i64;
            }
            // TargetCopy; the ranges may overlap, so bytes go one at a time.
            _ => {
                target_rel = target_rel.saturating_add(cur.signed_vlq()?);
                let mut from = usize::try_from(target_rel).map_err(|_| out_of_bounds.clone())?;
                if from >= out.len() {
                    return Err(out_of_bounds);
                }
                for _ in 0..len {
                    let byte = out[from];
                    out.push(byte);
                    from += 1;
                }
                target_rel += len as i64;
            }
        }
    }

    if out.len() != target_len || crc32fast::hash(&out) != footer.target {
        return Err(CoreError::InvalidPatch("patched ROM checksum mismatch"));
    }
    debug!("BPS patch applied: {} -> {} bytes", rom.len(), out.len());
    *rom = out;
    Ok(())
}

/// Apply one patch of any supported format, chosen by its magic.
pub fn apply_patch(rom: &mut Vec<u8>, patch: &[u8]) -> Result<()> {
    match PatchFormat::detect(patch) {
        Some(PatchFormat::Ips) => apply_ips(rom, patch),
        Some(PatchFormat::Ups) => apply_ups(rom, patch),
        Some(PatchFormat::Bps) => apply_bps(rom, patch),
        None => Err(CoreError::InvalidPatch("unknown patch format")),
    }
}

/// Apply patches in order; stops at the first one that is rejected.
pub fn apply_patches<'a>(
    rom: &mut Vec<u8>,
    patches: impl IntoIterator<Item = &'a [u8]>,
) -> Result<()> {
    for patch in patches {
        apply_patch(rom, patch)?;
    }
    Ok(())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(CoreError::InvalidPatch("truncated record"))?;
        let out = self
            .data
            .get(self.pos..end)
            .ok_or(CoreError::InvalidPatch("truncated record"))?;
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn be(&mut self, n: usize) -> Result<u32> {
        Ok(self
            .take(n)?
            .iter()
            .fold(0u32, |acc, &b| (acc << 8) | b as u32))
    }

    /// UPS/BPS variable-length number: seven bits per byte, little end
    /// first, the high bit set on the last byte, each continuation adding
    /// one to the next place.
    fn vlq(&mut self) -> Result<u64> {
        let overflow = CoreError::InvalidPatch("number too large");
        let mut value = 0u64;
        let mut shift = 1u64;
        loop {
            let byte = self.u8()?;
            value = ((byte & 0x7F) as u64)
                .checked_mul(shift)
                .and_then(|part| value.checked_add(part))
                .ok_or(overflow.clone())?;
            if byte & 0x80 != 0 {
                return Ok(value);
            }
            shift = shift.checked_mul(0x80).ok_or(overflow.clone())?;
            value = value.checked_add(shift).ok_or(overflow.clone())?;
        }
    }

    /// BPS relative offset: magnitude in the upper bits, sign in bit 0.
    fn signed_vlq(&mut self) -> Result<i64> {
        let raw = self.vlq()?;
        let magnitude = (raw >> 1) as i64;
        Ok(if raw & 1 != 0 { -magnitude } else { magnitude })
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}
