mod common;

use std::fs;

use common::{RomBuilder, run_frames, session};
use embedgb_core::{
    Model,
    cartridge::header_checksum,
    load_cartridge,
    patch::{PatchFormat, apply_patches},
};
use tempfile::tempdir;

fn ips_record(offset: u32, bytes: &[u8]) -> Vec<u8> {
    let mut rec = offset.to_be_bytes()[1..].to_vec();
    rec.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    rec.extend_from_slice(bytes);
    rec
}

#[test]
fn patches_from_disk_apply_in_order_before_parsing() {
    let dir = tempdir().unwrap();
    let mut rom = RomBuilder::rom_only()
        .title("ORIGINAL")
        .program(&[0x06, 0x01, 0x18, 0xFE])
        .image();

    // First patch retitles the game and fixes the checksum; the second
    // changes the loaded constant the first one would otherwise leave.
    let mut retitled = rom.clone();
    retitled[0x0134..0x013C].copy_from_slice(b"PATCHED!");
    let checksum = header_checksum(&retitled);

    let mut first = b"PATCH".to_vec();
    first.extend(ips_record(0x0134, b"PATCHED!"));
    first.extend(ips_record(0x014D, &[checksum]));
    first.extend(ips_record(0x0151, &[0x10]));
    first.extend_from_slice(b"EOF");
    let mut second = b"PATCH".to_vec();
    second.extend(ips_record(0x0151, &[0x2A]));
    second.extend_from_slice(b"EOF");

    let first_path = dir.path().join("1.ips");
    let second_path = dir.path().join("2.ips");
    fs::write(&first_path, &first).unwrap();
    fs::write(&second_path, &second).unwrap();

    let patches = [fs::read(&first_path).unwrap(), fs::read(&second_path).unwrap()];
    apply_patches(&mut rom, patches.iter().map(Vec::as_slice)).unwrap();

    let cart = load_cartridge(rom).unwrap();
    assert_eq!(cart.title(), "PATCHED!");
    let mut s = session(cart, Model::Dmg);
    run_frames(&mut s, 1);
    assert_eq!(s.gameboy().cpu.b, 0x2A);
}

#[test]
fn bad_patch_in_a_chain_stops_it() {
    let original = RomBuilder::rom_only().image();
    let mut rom = original.clone();
    let mut good = b"PATCH".to_vec();
    good.extend(ips_record(0x0200, &[1, 2, 3]));
    good.extend_from_slice(b"EOF");
    let bad = b"NOPE".to_vec();

    let result = apply_patches(&mut rom, [good.as_slice(), bad.as_slice()]);
    assert!(result.is_err());
    // The first patch already landed; the malformed one changed nothing.
    assert_eq!(&rom[0x0200..0x0203], &[1, 2, 3]);
    assert_eq!(rom.len(), original.len());
}

fn vlq(mut n: u64, out: &mut Vec<u8>) {
    loop {
        let x = (n & 0x7F) as u8;
        n >>= 7;
        if n == 0 {
            out.push(0x80 | x);
            return;
        }
        out.push(x);
        n -= 1;
    }
}

fn seal(mut body: Vec<u8>, source: &[u8], target: &[u8]) -> Vec<u8> {
    body.extend_from_slice(&crc32fast::hash(source).to_le_bytes());
    body.extend_from_slice(&crc32fast::hash(target).to_le_bytes());
    let crc = crc32fast::hash(&body);
    body.extend_from_slice(&crc.to_le_bytes());
    body
}

/// UPS patch changing one contiguous run of bytes at `offset`.
fn ups_hunk(source: &[u8], offset: usize, bytes: &[u8]) -> Vec<u8> {
    let mut target = source.to_vec();
    target[offset..offset + bytes.len()].copy_from_slice(bytes);
    let mut body = b"UPS1".to_vec();
    vlq(source.len() as u64, &mut body);
    vlq(target.len() as u64, &mut body);
    vlq(offset as u64, &mut body);
    for (i, b) in bytes.iter().enumerate() {
        body.push(source[offset + i] ^ b);
    }
    body.push(0);
    seal(body, source, &target)
}

#[test]
fn patch_directory_mixes_formats() {
    let dir = tempdir().unwrap();
    let rom = RomBuilder::rom_only()
        .program(&[0x06, 0x01, 0x0E, 0x01, 0x18, 0xFE])
        .image();

    // UPS sets B; BPS then rewrites the whole image with C changed, copying
    // everything else from its source.
    let ups = ups_hunk(&rom, 0x0151, &[0x5A]);
    let mut after_ups = rom.clone();
    after_ups[0x0151] = 0x5A;
    let mut target = after_ups.clone();
    target[0x0153] = 0xA5;

    let mut bps = b"BPS1".to_vec();
    vlq(after_ups.len() as u64, &mut bps);
    vlq(target.len() as u64, &mut bps);
    vlq(0, &mut bps);
    vlq(((0x0153 - 1) << 2) as u64, &mut bps); // SourceRead up to C's operand
    vlq(1, &mut bps); // TargetRead 1
    bps.push(0xA5);
    let rest = target.len() - 0x0154;
    vlq((((rest - 1) << 2) | 2) as u64, &mut bps); // SourceCopy the rest
    vlq((0x0154 << 1) as u64, &mut bps);
    let bps = seal(bps, &after_ups, &target);

    fs::write(dir.path().join("1-ups.UPS"), &ups).unwrap();
    fs::write(dir.path().join("2-bps.bps"), &bps).unwrap();
    fs::write(dir.path().join("readme.txt"), b"not a patch").unwrap();

    let mut paths: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| PatchFormat::from_path(path).is_some())
        .collect();
    paths.sort();
    assert_eq!(paths.len(), 2);
    let patches: Vec<Vec<u8>> = paths.iter().map(|p| fs::read(p).unwrap()).collect();

    let mut patched = rom.clone();
    apply_patches(&mut patched, patches.iter().map(Vec::as_slice)).unwrap();
    assert_eq!(patched, target);

    let mut s = session(load_cartridge(patched).unwrap(), Model::Dmg);
    run_frames(&mut s, 1);
    assert_eq!(s.gameboy().cpu.b, 0x5A);
    assert_eq!(s.gameboy().cpu.c, 0xA5);
}

#[test]
fn ups_for_another_rom_is_refused() {
    let rom = RomBuilder::rom_only().title("ONE").image();
    let other = RomBuilder::rom_only().title("TWO").image();
    let ups = ups_hunk(&other, 0x0200, &[1, 2, 3]);

    let mut patched = rom.clone();
    assert!(apply_patches(&mut patched, [ups.as_slice()]).is_err());
    assert_eq!(patched, rom);
}
