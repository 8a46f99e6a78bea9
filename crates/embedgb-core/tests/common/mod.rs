#![allow(dead_code)]

use std::ops::Range;

use embedgb_core::{
    Cartridge, Host, Model, PixelFormat, Session, cartridge::header_checksum, host::SCREEN_WIDTH,
    load_cartridge,
};

pub const ROM_BANK_SIZE: usize = 0x4000;
/// Where [`RomBuilder::program`] places code; 0x0100 jumps here.
pub const PROGRAM_START: u16 = 0x0150;
pub const FRAME_DT: f64 = 1.0 / 60.0;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Synthesizes cartridge images with a valid header.
pub struct RomBuilder {
    rom: Vec<u8>,
}

impl RomBuilder {
    /// `rom_code` is header byte 0x0148 (32 KiB << n), `ram_code` 0x0149.
    pub fn new(cart_type: u8, rom_code: u8, ram_code: u8) -> Self {
        let mut rom = vec![0u8; (2 * ROM_BANK_SIZE) << rom_code];
        rom[0x0147] = cart_type;
        rom[0x0148] = rom_code;
        rom[0x0149] = ram_code;
        Self { rom }
    }

    /// Plain 32 KiB ROM without a mapper.
    pub fn rom_only() -> Self {
        Self::new(0x00, 0x00, 0x00)
    }

    pub fn title(mut self, title: &str) -> Self {
        let bytes = title.as_bytes();
        let len = bytes.len().min(15);
        self.rom[0x0134..0x0134 + len].copy_from_slice(&bytes[..len]);
        self
    }

    pub fn cgb_flag(mut self, flag: u8) -> Self {
        self.rom[0x0143] = flag;
        self
    }

    /// Every byte of bank `n` becomes `n`, except the header area of bank 0.
    pub fn fill_banks_with_index(mut self) -> Self {
        let header: Vec<u8> = self.rom[0x0100..0x0150].to_vec();
        for (bank, chunk) in self.rom.chunks_mut(ROM_BANK_SIZE).enumerate() {
            chunk.fill(bank as u8);
        }
        self.rom[0x0100..0x0150].copy_from_slice(&header);
        self
    }

    pub fn bytes_at(mut self, addr: usize, bytes: &[u8]) -> Self {
        self.rom[addr..addr + bytes.len()].copy_from_slice(bytes);
        self
    }

    /// Entry point `NOP; JP 0x0150` and `code` at 0x0150.
    pub fn program(self, code: &[u8]) -> Self {
        self.bytes_at(0x0100, &[0x00, 0xC3, 0x50, 0x01])
            .bytes_at(PROGRAM_START as usize, code)
    }

    pub fn image(mut self) -> Vec<u8> {
        self.rom[0x014D] = header_checksum(&self.rom);
        self.rom
    }

    pub fn build(self) -> Cartridge {
        load_cartridge(self.image()).expect("synthesized cartridge parses")
    }
}

/// Records every scanline callback.
#[derive(Default)]
pub struct RecordingHost {
    pub lines: Vec<u8>,
    pub last_line: Option<[u16; SCREEN_WIDTH]>,
    pub format: Option<PixelFormat>,
    pub now: u64,
}

impl Host for RecordingHost {
    fn scanline_ready(&mut self, ly: u8, pixels: &[u16; SCREEN_WIDTH], format: PixelFormat) {
        self.lines.push(ly);
        self.last_line = Some(*pixels);
        self.format = Some(format);
    }

    fn unix_time(&self) -> u64 {
        self.now
    }
}

pub fn session(cart: Cartridge, model: Model) -> Session<RecordingHost> {
    init_logger();
    Session::new(cart, None, None, model, RecordingHost::default()).expect("session starts")
}

pub fn run_frames<H: Host>(session: &mut Session<H>, frames: usize) {
    for _ in 0..frames {
        session.tick(FRAME_DT).expect("tick succeeds");
    }
}

/// Byte range of the `index`-th section payload in a save-state blob.
pub fn state_section(blob: &[u8], index: usize) -> Range<usize> {
    let mut pos = 8;
    for i in 0.. {
        let len = u32::from_le_bytes(blob[pos..pos + 4].try_into().unwrap()) as usize;
        if i == index {
            return pos + 4..pos + 4 + len;
        }
        pos += 4 + len;
    }
    unreachable!()
}
