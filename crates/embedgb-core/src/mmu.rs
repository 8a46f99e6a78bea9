use log::{debug, info};

use crate::{
    apu::Apu,
    cartridge::BootRom,
    error::{CoreError, Result},
    hardware::Model,
    host::Host,
    interrupts,
    joypad::Joypad,
    mbc::Mbc,
    ppu::Ppu,
    state::{Section, SectionReader},
    timer::Timer,
};

const WRAM_BANK_SIZE: usize = 0x1000;
const HRAM_SIZE: usize = 0x7F;

/// OAM DMA: 160 bytes, one per M-cycle, after a two M-cycle start delay.
const OAM_DMA_BYTES: u32 = 0xA0;
const OAM_DMA_CYCLES: u32 = OAM_DMA_BYTES * 4;
const OAM_DMA_START_DELAY: u32 = 8;

/// CPU cycles the CPU is held for per 16-byte VRAM DMA block.
const HDMA_BLOCK_STALL: u32 = 32;
const HDMA_BLOCK_STALL_DOUBLE: u32 = 64;
/// A general-purpose DMA of all 0x80 blocks.
const MAX_STALL: u32 = 0x80 * HDMA_BLOCK_STALL_DOUBLE;

// Post-boot DIV phases.
const DMG_BOOT_DIV: u16 = 0xABCC;
const CGB_BOOT_DIV: u16 = 0x1EA0;

/// Transfer mode for CGB VRAM DMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DmaMode {
    /// General DMA (immediate)
    Gdma,
    /// HBlank DMA
    Hdma,
}

#[derive(Debug, Clone)]
struct HdmaState {
    src: u16,
    /// Destination in VRAM (0x8000 | (dst & 0x1FF0))
    dst: u16,
    /// Remaining 0x10-byte blocks
    blocks: u8,
    mode: DmaMode,
    active: bool,
    /// The previous transfer was cancelled through FF55
    cancelled: bool,
}

#[derive(Debug, Clone, Default)]
struct OamDma {
    source: u16,
    /// CPU cycles left in the running transfer.
    remaining: u32,
    pending: Option<u16>,
    pending_delay: u32,
}

/// The bus: address decoding plus the components that own I/O registers.
#[derive(Clone)]
pub struct Mmu {
    pub mbc: Mbc,
    boot_rom: Option<BootRom>,
    boot_mapped: bool,
    pub wram: Box<[[u8; WRAM_BANK_SIZE]; 8]>,
    wram_bank: usize,
    pub hram: [u8; HRAM_SIZE],
    pub if_reg: u8,
    pub ie_reg: u8,
    pub ppu: Ppu,
    pub apu: Apu,
    pub timer: Timer,
    pub joypad: Joypad,
    hdma: HdmaState,
    pub key1: u8,
    oam_dma: OamDma,
    /// CPU cycles owed to VRAM DMA; paid by the next CPU step.
    stall_cycles: u32,
    /// CGB registers and banking are decoded.
    cgb: bool,
    model: Model,
}

impl Mmu {
    /// `cgb` enables CGB features; `model` is the console being emulated,
    /// which may be a CGB running a DMG cartridge in compatibility mode.
    pub fn new(mbc: Mbc, model: Model, cgb: bool, sample_rate: u32) -> Self {
        Self {
            mbc,
            boot_rom: None,
            boot_mapped: false,
            wram: Box::new([[0; WRAM_BANK_SIZE]; 8]),
            wram_bank: 1,
            hram: [0; HRAM_SIZE],
            if_reg: 0,
            ie_reg: 0,
            ppu: Ppu::new(cgb, model.is_cgb()),
            apu: Apu::new(model.is_cgb(), sample_rate),
            timer: Timer::new(),
            joypad: Joypad::new(),
            hdma: HdmaState {
                src: 0,
                dst: Self::sanitize_vram_dma_dest(0),
                blocks: 0,
                mode: DmaMode::Gdma,
                active: false,
                cancelled: false,
            },
            key1: 0,
            oam_dma: OamDma::default(),
            stall_cycles: 0,
            cgb,
            model,
        }
    }

    /// I/O state as the boot ROM hands over to the cartridge.
    pub fn apply_boot_state(&mut self) {
        self.timer = Timer::with_div(if self.model.is_cgb() {
            CGB_BOOT_DIV
        } else {
            DMG_BOOT_DIV
        });
        self.if_reg = interrupts::VBLANK;
        self.ppu.apply_boot_state();
        self.apu.apply_boot_state();
        self.boot_mapped = false;
    }

    /// Map a boot ROM over the cartridge until FF50 is written.
    pub fn map_boot_rom(&mut self, boot: BootRom) {
        self.boot_rom = Some(boot);
        self.boot_mapped = true;
    }

    pub fn boot_rom_mapped(&self) -> bool {
        self.boot_mapped
    }

    pub fn cgb(&self) -> bool {
        self.cgb
    }

    pub fn model(&self) -> Model {
        self.model
    }

    pub fn double_speed(&self) -> bool {
        self.key1 & 0x80 != 0
    }

    /// KEY1 bit 0 armed: the next STOP switches speed.
    pub fn speed_switch_armed(&self) -> bool {
        self.cgb && self.key1 & 0x01 != 0
    }

    /// Toggle CPU speed and reset the divider, as STOP does with KEY1 armed.
    pub fn switch_speed(&mut self) {
        self.key1 = (self.key1 ^ 0x80) & 0x80;
        self.timer.reset_div(&mut self.if_reg);
        info!(
            "CPU switched to {} speed",
            if self.double_speed() { "double" } else { "normal" }
        );
    }

    pub fn oam_dma_active(&self) -> bool {
        self.oam_dma.remaining > 0
    }

    /// Read as the CPU sees it.
    pub fn read(&self, addr: u16) -> u8 {
        if self.oam_dma_active() && !(0xFF80..=0xFFFE).contains(&addr) {
            return 0xFF;
        }
        match addr {
            0x8000..=0x9FFF => {
                if self.ppu.vram_accessible() {
                    self.ppu.read_vram(addr)
                } else {
                    0xFF
                }
            }
            0xFE00..=0xFE9F => {
                if self.ppu.oam_accessible() {
                    self.ppu.oam[(addr - 0xFE00) as usize]
                } else {
                    0xFF
                }
            }
            _ => self.read_unlocked(addr),
        }
    }

    /// Read without PPU or DMA bus locking, as the DMA engines see memory.
    fn read_unlocked(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x08FF if self.boot_mapped => self
                .boot_rom
                .as_ref()
                .and_then(|b| b.read(addr))
                .unwrap_or_else(|| self.mbc.read_rom(addr)),
            0x0000..=0x7FFF => self.mbc.read_rom(addr),
            0x8000..=0x9FFF => self.ppu.read_vram(addr),
            0xA000..=0xBFFF => self.mbc.read_ram(addr),
            0xC000..=0xCFFF => self.wram[0][(addr - 0xC000) as usize],
            0xD000..=0xDFFF => self.wram[self.wram_bank][(addr - 0xD000) as usize],
            0xE000..=0xEFFF => self.wram[0][(addr - 0xE000) as usize],
            0xF000..=0xFDFF => self.wram[self.wram_bank][(addr - 0xF000) as usize],
            0xFE00..=0xFE9F => self.ppu.oam[(addr - 0xFE00) as usize],
            0xFEA0..=0xFEFF => 0xFF,
            0xFF00 => self.joypad.read(),
            0xFF04..=0xFF07 => self.timer.read(addr),
            0xFF0F => interrupts::read_if(self.if_reg),
            0xFF10..=0xFF3F => self.apu.read_reg(addr),
            0xFF40..=0xFF4B | 0xFF4F | 0xFF68..=0xFF6C => self.ppu.read_reg(addr),
            0xFF4D if self.cgb => (self.key1 & 0x81) | 0x7E,
            0xFF51..=0xFF55 if self.cgb => self.read_hdma(addr),
            0xFF70 if self.cgb => 0xF8 | self.wram_bank as u8,
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize],
            0xFFFF => self.ie_reg,
            _ => 0xFF,
        }
    }

    fn read_hdma(&self, addr: u16) -> u8 {
        match addr {
            0xFF55 => {
                if self.hdma.active {
                    // Busy: bit 7 clear, remaining blocks minus one.
                    self.hdma.blocks.saturating_sub(1) & 0x7F
                } else if self.hdma.cancelled {
                    0x80
                } else {
                    0xFF
                }
            }
            // Source and destination registers are write-only.
            _ => 0xFF,
        }
    }

    /// Write as the CPU sees it.
    pub fn write(&mut self, addr: u16, val: u8) {
        if self.oam_dma_active() && addr < 0xFF00 {
            return;
        }
        match addr {
            0x0000..=0x7FFF => self.mbc.write_rom(addr, val),
            0x8000..=0x9FFF => {
                if self.ppu.vram_accessible() {
                    self.ppu.write_vram(addr, val);
                }
            }
            0xA000..=0xBFFF => self.mbc.write_ram(addr, val),
            0xC000..=0xCFFF => self.wram[0][(addr - 0xC000) as usize] = val,
            0xD000..=0xDFFF => self.wram[self.wram_bank][(addr - 0xD000) as usize] = val,
            0xE000..=0xEFFF => self.wram[0][(addr - 0xE000) as usize] = val,
            0xF000..=0xFDFF => self.wram[self.wram_bank][(addr - 0xF000) as usize] = val,
            0xFE00..=0xFE9F => {
                if self.ppu.oam_accessible() {
                    self.ppu.oam[(addr - 0xFE00) as usize] = val;
                }
            }
            0xFEA0..=0xFEFF => {}
            0xFF00 => self.joypad.write(val, &mut self.if_reg),
            0xFF04..=0xFF07 => self.timer.write(addr, val, &mut self.if_reg),
            0xFF0F => self.if_reg = val & interrupts::MASK,
            0xFF10..=0xFF3F => self.apu.write_reg(addr, val),
            0xFF40 => {
                let lcd_was_on = self.ppu.lcd_enabled();
                self.ppu.write_reg(addr, val, &mut self.if_reg);
                if lcd_was_on && !self.ppu.lcd_enabled() {
                    self.complete_active_hdma();
                }
            }
            0xFF46 => {
                self.ppu.write_reg(addr, val, &mut self.if_reg);
                let src = (val as u16) << 8;
                self.oam_dma.pending = Some(src);
                self.oam_dma.pending_delay = OAM_DMA_START_DELAY;
            }
            0xFF41..=0xFF4B | 0xFF4F | 0xFF68..=0xFF6C => {
                self.ppu.write_reg(addr, val, &mut self.if_reg)
            }
            0xFF4D if self.cgb => self.key1 = (self.key1 & 0x80) | (val & 0x01),
            0xFF50 if val != 0 => {
                if self.boot_mapped {
                    debug!("Boot ROM unmapped");
                }
                self.boot_mapped = false;
            }
            0xFF51..=0xFF55 if self.cgb => self.write_hdma(addr, val),
            0xFF70 if self.cgb => {
                let bank = (val & 0x07) as usize;
                self.wram_bank = if bank == 0 { 1 } else { bank };
            }
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize] = val,
            0xFFFF => self.ie_reg = val & interrupts::MASK,
            _ => {}
        }
    }

    fn write_hdma(&mut self, addr: u16, val: u8) {
        match addr {
            0xFF51 if !self.hdma.active => {
                self.hdma.src = (val as u16) << 8 | (self.hdma.src & 0x00FF);
            }
            0xFF52 if !self.hdma.active => {
                self.hdma.src = (self.hdma.src & 0xFF00) | (val & 0xF0) as u16;
            }
            0xFF53 if !self.hdma.active => {
                let raw = (((val & 0x1F) as u16) << 8) | (self.hdma.dst & 0x00F0);
                self.hdma.dst = Self::sanitize_vram_dma_dest(raw);
            }
            0xFF54 if !self.hdma.active => {
                let raw = (self.hdma.dst & 0x1F00) | (val as u16 & 0x00F0);
                self.hdma.dst = Self::sanitize_vram_dma_dest(raw);
            }
            0xFF55 => {
                let blocks = (val & 0x7F) + 1;
                if self.hdma.active && val & 0x80 == 0 {
                    self.hdma.active = false;
                    self.hdma.cancelled = true;
                    debug!("HDMA cancelled with {} blocks left", self.hdma.blocks);
                } else if val & 0x80 == 0 {
                    debug!(
                        "GDMA {:04X} -> {:04X}, {} blocks",
                        self.hdma.src, self.hdma.dst, blocks
                    );
                    self.start_gdma(blocks);
                } else {
                    debug!(
                        "HDMA {:04X} -> {:04X}, {} blocks",
                        self.hdma.src, self.hdma.dst, blocks
                    );
                    self.hdma.mode = DmaMode::Hdma;
                    self.hdma.blocks = blocks;
                    self.hdma.active = true;
                    self.hdma.cancelled = false;
                    if !self.ppu.lcd_enabled() || self.ppu.mode() == crate::ppu::Mode::HBlank {
                        self.perform_hdma_block();
                    }
                }
            }
            _ => {}
        }
    }

    #[inline]
    fn sanitize_vram_dma_dest(addr: u16) -> u16 {
        0x8000 | (addr & 0x1FF0)
    }

    fn hdma_block_stall(&self) -> u32 {
        if self.double_speed() {
            HDMA_BLOCK_STALL_DOUBLE
        } else {
            HDMA_BLOCK_STALL
        }
    }

    fn start_gdma(&mut self, blocks: u8) {
        self.hdma.mode = DmaMode::Gdma;
        self.hdma.active = false;
        self.hdma.cancelled = false;
        for _ in 0..blocks {
            self.copy_hdma_block();
        }
        self.hdma.blocks = 0;
        self.stall_cycles += blocks as u32 * self.hdma_block_stall();
    }

    fn copy_hdma_block(&mut self) {
        for _ in 0..0x10 {
            let byte = self.read_unlocked(self.hdma.src);
            self.ppu.write_vram(self.hdma.dst, byte);
            self.hdma.src = self.hdma.src.wrapping_add(1);
            self.hdma.dst = 0x8000 | (self.hdma.dst.wrapping_add(1) & 0x1FFF);
        }
    }

    fn perform_hdma_block(&mut self) {
        if !(self.hdma.active && self.hdma.mode == DmaMode::Hdma) {
            return;
        }
        self.copy_hdma_block();
        self.hdma.blocks = self.hdma.blocks.saturating_sub(1);
        if self.hdma.blocks == 0 {
            self.hdma.active = false;
        }
        self.stall_cycles += self.hdma_block_stall();
    }

    fn complete_active_hdma(&mut self) {
        while self.hdma.active && self.hdma.mode == DmaMode::Hdma {
            self.perform_hdma_block();
        }
    }

    /// Take the CPU cycles owed to VRAM DMA.
    pub fn take_stall(&mut self) -> u32 {
        std::mem::take(&mut self.stall_cycles)
    }

    fn oam_dma_step(&mut self, mut cycles: u32) {
        if self.oam_dma.pending_delay > 0 {
            let run = cycles.min(self.oam_dma.pending_delay);
            self.oam_dma.pending_delay -= run;
            cycles -= run;
            if self.oam_dma.pending_delay == 0
                && let Some(src) = self.oam_dma.pending.take()
            {
                debug!("OAM DMA from {src:04X}");
                self.oam_dma.source = src;
                self.oam_dma.remaining = OAM_DMA_CYCLES;
            }
        }
        if self.oam_dma.remaining == 0 || cycles == 0 {
            return;
        }

        let start = OAM_DMA_CYCLES - self.oam_dma.remaining;
        let run = cycles.min(self.oam_dma.remaining);
        let end = start + run;
        // Byte n is copied on cycle 4n of the transfer.
        for idx in start.div_ceil(4)..end.div_ceil(4).min(OAM_DMA_BYTES) {
            let src = self.oam_dma.source.wrapping_add(idx as u16);
            let src = if src >= 0xE000 {
                src.wrapping_sub(0x2000)
            } else {
                src
            };
            self.ppu.oam[idx as usize] = self.read_unlocked(src);
        }
        self.oam_dma.remaining -= run;
    }

    /// Advance everything clocked alongside the CPU by `cycles` CPU T-cycles.
    /// Returns the single-speed dots that elapsed.
    pub fn advance(&mut self, cycles: u32, host: &mut dyn Host) -> u32 {
        let dots = if self.double_speed() {
            cycles / 2
        } else {
            cycles
        };
        self.timer.step(cycles, &mut self.if_reg);
        let events = self.ppu.step(dots, &mut self.if_reg, host);
        for _ in 0..events.hblanks {
            self.perform_hdma_block();
        }
        self.apu.step(dots);
        self.oam_dma_step(cycles);
        self.mbc.step_rtc(dots);
        dots
    }

    /// WRAM, HRAM, bus-side DMA engines, KEY1 and the joypad.
    pub fn save_memory(&self, s: &mut Section) {
        for bank in self.wram.iter() {
            s.bytes(bank);
        }
        s.u8(self.wram_bank as u8)
            .bytes(&self.hram)
            .bool(self.boot_mapped)
            .u16(self.oam_dma.source)
            .u32(self.oam_dma.remaining)
            .bool(self.oam_dma.pending.is_some())
            .u16(self.oam_dma.pending.unwrap_or(0))
            .u32(self.oam_dma.pending_delay)
            .u16(self.hdma.src)
            .u16(self.hdma.dst)
            .u8(self.hdma.blocks)
            .bool(self.hdma.mode == DmaMode::Hdma)
            .bool(self.hdma.active)
            .bool(self.hdma.cancelled)
            .u8(self.key1)
            .u32(self.stall_cycles);
        self.joypad.save_state(s);
    }

    pub fn load_memory(&mut self, r: &mut SectionReader) -> Result<()> {
        for bank in self.wram.iter_mut() {
            r.bytes_into(bank)?;
        }
        let bank = (r.u8()? & 0x07) as usize;
        self.wram_bank = bank.max(1);
        r.bytes_into(&mut self.hram)?;
        let boot_mapped = r.bool()?;
        if boot_mapped && self.boot_rom.is_none() {
            return Err(CoreError::SaveStateIncompatible(
                "state needs a boot ROM that is not loaded",
            ));
        }
        self.boot_mapped = boot_mapped;
        self.oam_dma.source = r.u16()?;
        self.oam_dma.remaining = r.u32()?.min(OAM_DMA_CYCLES);
        let has_pending = r.bool()?;
        let pending = r.u16()?;
        self.oam_dma.pending = has_pending.then_some(pending);
        self.oam_dma.pending_delay = r.u32()?.min(OAM_DMA_START_DELAY);
        self.hdma.src = r.u16()?;
        self.hdma.dst = Self::sanitize_vram_dma_dest(r.u16()?);
        self.hdma.blocks = r.u8()?.min(0x80);
        self.hdma.mode = if r.bool()? {
            DmaMode::Hdma
        } else {
            DmaMode::Gdma
        };
        self.hdma.active = r.bool()?;
        self.hdma.cancelled = r.bool()?;
        self.key1 = r.u8()? & 0x81;
        self.stall_cycles = r.u32()?.min(MAX_STALL);
        self.joypad.load_state(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::{header_checksum, load_cartridge};
    use crate::host::NullHost;

    fn mmu(model: Model) -> Mmu {
        let mut rom = vec![0u8; 0x8000];
        rom[0x0143] = if model.is_cgb() { 0x80 } else { 0x00 };
        rom[0x0147] = 0x01;
        rom[0x014D] = header_checksum(&rom);
        let cart = load_cartridge(rom).unwrap();
        let cgb = cart.runs_in_cgb_mode(model);
        let mut mmu = Mmu::new(Mbc::new(&cart, 0), model, cgb, 44_100);
        mmu.apply_boot_state();
        mmu
    }

    #[test]
    fn echo_ram_mirrors_wram() {
        let mut mmu = mmu(Model::Dmg);
        mmu.write(0xC123, 0x42);
        assert_eq!(mmu.read(0xE123), 0x42);
        mmu.write(0xFDFF, 0x24);
        assert_eq!(mmu.read(0xDDFF), 0x24);
        assert_eq!(mmu.read(0xFEA0), 0xFF);
    }

    #[test]
    fn interrupt_registers_keep_five_bits() {
        let mut mmu = mmu(Model::Dmg);
        mmu.write(0xFFFF, 0xFF);
        assert_eq!(mmu.ie_reg, interrupts::MASK);
        mmu.write(0xFF0F, 0xFF);
        assert_eq!(mmu.if_reg, interrupts::MASK);
    }

    #[test]
    fn oam_dma_blocks_bus_and_copies() {
        let mut mmu = mmu(Model::Dmg);
        for i in 0..0xA0u16 {
            mmu.write(0xC000 + i, i as u8);
        }
        mmu.write(0xFF80, 0x99);
        // LCD off so OAM reads are not locked by the PPU afterwards.
        mmu.write(0xFF40, 0x00);
        mmu.write(0xFF46, 0xC0);
        mmu.advance(OAM_DMA_START_DELAY, &mut NullHost);
        assert!(mmu.oam_dma_active());
        assert_eq!(mmu.read(0xC000), 0xFF);
        assert_eq!(mmu.read(0xFF80), 0x99);
        mmu.write(0xC000, 0x55);
        mmu.advance(OAM_DMA_CYCLES, &mut NullHost);
        assert!(!mmu.oam_dma_active());
        assert_eq!(mmu.read(0xC000), 0x00, "write during DMA was dropped");
        assert_eq!(mmu.read(0xFE00), 0x00);
        assert_eq!(mmu.read(0xFE9F), 0x9F);
    }

    #[test]
    fn cgb_wram_banks() {
        let mut mmu = mmu(Model::Cgb);
        mmu.write(0xFF70, 0x03);
        mmu.write(0xD000, 0x33);
        mmu.write(0xFF70, 0x00);
        assert_eq!(mmu.read(0xFF70), 0xF9);
        assert_eq!(mmu.read(0xD000), 0x00);
        mmu.write(0xFF70, 0x03);
        assert_eq!(mmu.read(0xD000), 0x33);
    }

    #[test]
    fn dmg_ignores_cgb_registers() {
        let mut mmu = mmu(Model::Dmg);
        mmu.write(0xFF70, 0x03);
        assert_eq!(mmu.read(0xFF70), 0xFF);
        assert_eq!(mmu.read(0xFF4D), 0xFF);
    }

    #[test]
    fn gdma_copies_and_stalls() {
        let mut mmu = mmu(Model::Cgb);
        mmu.write(0xFF40, 0x00);
        for i in 0..0x20u16 {
            mmu.write(0xC000 + i, 0xA0 + i as u8);
        }
        mmu.write(0xFF51, 0xC0);
        mmu.write(0xFF52, 0x00);
        mmu.write(0xFF53, 0x00);
        mmu.write(0xFF54, 0x10);
        mmu.write(0xFF55, 0x01);
        assert_eq!(mmu.read(0x8010), 0xA0);
        assert_eq!(mmu.read(0x802F), 0xBF);
        assert_eq!(mmu.read(0xFF55), 0xFF);
        assert_eq!(mmu.take_stall(), 2 * HDMA_BLOCK_STALL);
        assert_eq!(mmu.take_stall(), 0);
    }

    #[test]
    fn hdma_moves_one_block_per_hblank() {
        let mut mmu = mmu(Model::Cgb);
        mmu.write(0xFF51, 0xC0);
        mmu.write(0xFF52, 0x00);
        mmu.write(0xFF53, 0x00);
        mmu.write(0xFF54, 0x00);
        mmu.write(0xFF55, 0x82);
        assert_eq!(mmu.read(0xFF55), 0x02);
        mmu.advance(456, &mut NullHost);
        assert_eq!(mmu.read(0xFF55), 0x01);
        mmu.write(0xFF55, 0x00);
        assert_eq!(mmu.read(0xFF55), 0x80);
    }

    #[test]
    fn double_speed_halves_dots() {
        let mut mmu = mmu(Model::Cgb);
        mmu.write(0xFF4D, 0x01);
        assert!(mmu.speed_switch_armed());
        mmu.switch_speed();
        assert!(mmu.double_speed());
        assert_eq!(mmu.read(0xFF4D), 0xFE);
        assert_eq!(mmu.advance(8, &mut NullHost), 4);
    }
}
