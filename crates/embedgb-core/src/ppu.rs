use log::warn;
#[cfg(feature = "ppu-trace")]
use log::trace;

use crate::error::{CoreError, Result};
use crate::host::{Host, PixelFormat, SCREEN_HEIGHT, SCREEN_WIDTH};
use crate::interrupts;
use crate::state::{Section, SectionReader};

// Dot counts per line and per mode
const LINE_DOTS: u32 = 456;
const MODE2_DOTS: u32 = 80;
const MODE3_MIN_DOTS: u32 = 172;
const MODE3_MAX_DOTS: u32 = 289;
const SPRITE_PENALTY_DOTS: u32 = 6;
const WINDOW_PENALTY_DOTS: u32 = 6;

const LAST_LINE: u8 = 153;

const MAX_SPRITES_PER_LINE: usize = 10;
const TOTAL_SPRITES: usize = 40;

const VRAM_BANK_SIZE: usize = 0x2000;
const OAM_SIZE: usize = 0xA0;
const PAL_RAM_SIZE: usize = 0x40;
const PAL_INDEX_MASK: u8 = 0x3F;
const PAL_UNUSED_BIT: u8 = 0x40;
const PAL_AUTO_INCREMENT_BIT: u8 = 0x80;

const WINDOW_X_MAX: u8 = 166;

const BG_MAP_0_BASE: usize = 0x1800;
const BG_MAP_1_BASE: usize = 0x1C00;
const TILE_DATA_0_BASE: usize = 0x0000;
const TILE_DATA_1_BASE: usize = 0x0800;

const SHADE_FRAME_LEN: usize = SCREEN_WIDTH * SCREEN_HEIGHT;

/// LCD mode as reported in STAT bits 0-1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    HBlank = 0,
    VBlank = 1,
    OamScan = 2,
    Transfer = 3,
}

impl Mode {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Mode::HBlank,
            1 => Mode::VBlank,
            2 => Mode::OamScan,
            _ => Mode::Transfer,
        }
    }
}

#[derive(Copy, Clone, Default, Debug)]
struct Sprite {
    x: i16,
    y: i16,
    tile: u8,
    flags: u8,
    oam_index: u8,
}

/// What happened during one [`Ppu::step`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PpuEvents {
    /// H-blank entries; each one lets an H-blank HDMA move a block.
    pub hblanks: u32,
    /// Whether line 144 (V-blank) was reached.
    pub vblank: bool,
}

#[derive(Clone)]
pub struct Ppu {
    pub vram: [[u8; VRAM_BANK_SIZE]; 2],
    vram_bank: usize,
    pub oam: [u8; OAM_SIZE],

    /// CGB features (attributes, palette RAM, VBK) are decoded.
    cgb: bool,
    /// Output is BGR555 (CGB model, including DMG compatibility).
    color_output: bool,

    lcdc: u8,
    stat: u8,
    scy: u8,
    scx: u8,
    ly: u8,
    lyc: u8,
    lyc_eq_ly: bool,
    pub dma: u8,
    bgp: u8,
    obp0: u8,
    obp1: u8,
    wy: u8,
    wx: u8,

    win_line_counter: u8,
    /// WY matched LY at some line of this frame.
    wy_triggered: bool,

    bgpi: u8,
    bgpd: [u8; PAL_RAM_SIZE],
    obpi: u8,
    obpd: [u8; PAL_RAM_SIZE],
    opri: u8,

    mode: Mode,
    mode_clock: u32,
    mode3_dots: u32,
    stat_irq_line: bool,

    line: [u16; SCREEN_WIDTH],
    line_priority: [bool; SCREEN_WIDTH],
    line_color_zero: [bool; SCREEN_WIDTH],
    line_sprites: [Sprite; MAX_SPRITES_PER_LINE],
    sprite_count: usize,
    /// Last completed frame as shades 0..=3, used for save-state thumbnails.
    shade_frame: Box<[u8; SHADE_FRAME_LEN]>,
    frames: u64,
}

impl Ppu {
    pub fn new(cgb: bool, color_output: bool) -> Self {
        Self {
            vram: [[0; VRAM_BANK_SIZE]; 2],
            vram_bank: 0,
            oam: [0; OAM_SIZE],
            cgb,
            color_output,
            lcdc: 0,
            stat: 0,
            scy: 0,
            scx: 0,
            ly: 0,
            lyc: 0,
            lyc_eq_ly: false,
            dma: 0xFF,
            bgp: 0,
            obp0: 0,
            obp1: 0,
            wy: 0,
            wx: 0,
            win_line_counter: 0,
            wy_triggered: false,
            bgpi: PAL_UNUSED_BIT,
            bgpd: [0xFF; PAL_RAM_SIZE],
            obpi: PAL_UNUSED_BIT,
            obpd: [0xFF; PAL_RAM_SIZE],
            opri: if cgb { 0 } else { 1 },
            mode: Mode::HBlank,
            mode_clock: 0,
            mode3_dots: MODE3_MIN_DOTS,
            stat_irq_line: false,
            line: [0; SCREEN_WIDTH],
            line_priority: [false; SCREEN_WIDTH],
            line_color_zero: [false; SCREEN_WIDTH],
            line_sprites: [Sprite::default(); MAX_SPRITES_PER_LINE],
            sprite_count: 0,
            shade_frame: Box::new([0; SHADE_FRAME_LEN]),
            frames: 0,
        }
    }

    /// Registers as the boot ROM leaves them: LCD on at the top of a frame.
    pub fn apply_boot_state(&mut self) {
        self.lcdc = 0x91;
        self.stat = 0x80;
        self.bgp = 0xFC;
        self.ly = 0;
        self.mode = Mode::OamScan;
        self.mode_clock = 0;
        self.lyc_eq_ly = self.ly == self.lyc;
        self.stat_irq_line = false;
        if self.color_output && !self.cgb {
            self.apply_dmg_compatibility_palettes();
        }
    }

    /// Palettes the CGB boot ROM installs for a cartridge without CGB support.
    pub fn apply_dmg_compatibility_palettes(&mut self) {
        const OBJ_PAL: [u16; 4] = [0x7FFF, 0x421F, 0x1CF2, 0x0000];
        const BG_PAL: [u16; 4] = [0x7FFF, 0x1BEF, 0x6180, 0x0000];

        Self::write_palette(&mut self.obpd[0..8], OBJ_PAL);
        Self::write_palette(&mut self.obpd[8..16], OBJ_PAL);
        Self::write_palette(&mut self.bgpd[0..8], BG_PAL);
        self.bgp = 0xE4;
        self.obp0 = 0xD0;
        self.obp1 = 0xE0;
    }

    fn write_palette(slice: &mut [u8], pal: [u16; 4]) {
        for (i, &c) in pal.iter().enumerate() {
            slice[i * 2] = (c & 0xFF) as u8;
            slice[i * 2 + 1] = (c >> 8) as u8;
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn ly(&self) -> u8 {
        self.ly
    }

    pub fn lcd_enabled(&self) -> bool {
        self.lcdc & 0x80 != 0
    }

    /// Completed frames since power on.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn shade_frame(&self) -> &[u8; SHADE_FRAME_LEN] {
        &self.shade_frame
    }

    pub fn pixel_format(&self) -> PixelFormat {
        if self.color_output {
            PixelFormat::Bgr555
        } else {
            PixelFormat::Shade2Bit
        }
    }

    pub fn vram_accessible(&self) -> bool {
        !self.lcd_enabled() || self.mode != Mode::Transfer
    }

    pub fn oam_accessible(&self) -> bool {
        !self.lcd_enabled() || matches!(self.mode, Mode::HBlank | Mode::VBlank)
    }

    pub fn read_vram(&self, addr: u16) -> u8 {
        self.vram[self.vram_bank][(addr & 0x1FFF) as usize]
    }

    pub fn write_vram(&mut self, addr: u16, val: u8) {
        self.vram[self.vram_bank][(addr & 0x1FFF) as usize] = val;
    }

    fn palette_word(ram: &[u8; PAL_RAM_SIZE], palette: usize, color: u8) -> u16 {
        let off = palette * 8 + color as usize * 2;
        (ram[off] as u16 | (ram[off + 1] as u16) << 8) & 0x7FFF
    }

    fn sanitize_palette_index(value: u8) -> u8 {
        (value & (PAL_AUTO_INCREMENT_BIT | PAL_INDEX_MASK)) | PAL_UNUSED_BIT
    }

    fn step_palette_index(index: &mut u8) {
        if *index & PAL_AUTO_INCREMENT_BIT != 0 {
            let next = (*index & PAL_INDEX_MASK).wrapping_add(1) & PAL_INDEX_MASK;
            *index = PAL_AUTO_INCREMENT_BIT | PAL_UNUSED_BIT | next;
        }
    }

    pub fn read_reg(&self, addr: u16) -> u8 {
        match addr {
            0xFF40 => self.lcdc,
            0xFF41 => {
                0x80 | (self.stat & 0x78)
                    | if self.lyc_eq_ly { 0x04 } else { 0 }
                    | self.mode as u8
            }
            0xFF42 => self.scy,
            0xFF43 => self.scx,
            0xFF44 => self.ly,
            0xFF45 => self.lyc,
            0xFF46 => self.dma,
            0xFF47 => self.bgp,
            0xFF48 => self.obp0,
            0xFF49 => self.obp1,
            0xFF4A => self.wy,
            0xFF4B => self.wx,
            0xFF4F if self.cgb => 0xFE | self.vram_bank as u8,
            0xFF68 if self.cgb => self.bgpi,
            0xFF69 if self.cgb => self.bgpd[(self.bgpi & PAL_INDEX_MASK) as usize],
            0xFF6A if self.cgb => self.obpi,
            0xFF6B if self.cgb => self.obpd[(self.obpi & PAL_INDEX_MASK) as usize],
            0xFF6C if self.cgb => 0xFE | self.opri,
            _ => 0xFF,
        }
    }

    pub fn write_reg(&mut self, addr: u16, val: u8, if_reg: &mut u8) {
        match addr {
            0xFF40 => {
                let was_on = self.lcd_enabled();
                self.lcdc = val;
                if was_on && !self.lcd_enabled() {
                    if self.mode != Mode::VBlank {
                        warn!("LCD switched off outside V-blank (LY={})", self.ly);
                    }
                    self.mode = Mode::HBlank;
                    self.mode_clock = 0;
                    self.ly = 0;
                    self.win_line_counter = 0;
                    self.wy_triggered = false;
                    self.stat_irq_line = false;
                } else if !was_on && self.lcd_enabled() {
                    self.ly = 0;
                    self.mode_clock = 0;
                    self.enter_oam_scan();
                    self.update_lyc_compare();
                    self.update_stat_irq(if_reg);
                }
            }
            0xFF41 => {
                self.stat = (self.stat & 0x07) | (val & 0x78);
                self.update_stat_irq(if_reg);
            }
            0xFF42 => self.scy = val,
            0xFF43 => self.scx = val,
            0xFF44 => {}
            0xFF45 => {
                self.lyc = val;
                self.update_lyc_compare();
                self.update_stat_irq(if_reg);
            }
            0xFF46 => self.dma = val,
            0xFF47 => self.bgp = val,
            0xFF48 => self.obp0 = val,
            0xFF49 => self.obp1 = val,
            0xFF4A => self.wy = val,
            0xFF4B => self.wx = val,
            0xFF4F if self.cgb => self.vram_bank = (val & 0x01) as usize,
            0xFF68 if self.cgb => self.bgpi = Self::sanitize_palette_index(val),
            0xFF69 if self.cgb => {
                self.bgpd[(self.bgpi & PAL_INDEX_MASK) as usize] = val;
                Self::step_palette_index(&mut self.bgpi);
            }
            0xFF6A if self.cgb => self.obpi = Self::sanitize_palette_index(val),
            0xFF6B if self.cgb => {
                self.obpd[(self.obpi & PAL_INDEX_MASK) as usize] = val;
                Self::step_palette_index(&mut self.obpi);
            }
            0xFF6C if self.cgb => self.opri = val & 0x01,
            _ => {}
        }
    }

    fn update_lyc_compare(&mut self) {
        if self.lcd_enabled() {
            self.lyc_eq_ly = self.ly == self.lyc;
        }
    }

    /// STAT fires on the rising edge of the OR of every enabled source.
    fn update_stat_irq(&mut self, if_reg: &mut u8) {
        if !self.lcd_enabled() {
            self.stat_irq_line = false;
            return;
        }
        let coincidence = self.lyc_eq_ly && self.stat & 0x40 != 0;
        let mode_source = match self.mode {
            Mode::HBlank => self.stat & 0x08 != 0,
            Mode::VBlank => self.stat & 0x10 != 0,
            Mode::OamScan => self.stat & 0x20 != 0,
            Mode::Transfer => false,
        };
        let line = coincidence || mode_source;
        if line && !self.stat_irq_line {
            *if_reg |= interrupts::LCD_STAT;
        }
        self.stat_irq_line = line;
    }

    fn enter_oam_scan(&mut self) {
        if self.ly == self.wy {
            self.wy_triggered = true;
        }
        self.mode = Mode::OamScan;
    }

    /// Pick up to ten sprites overlapping LY, in drawing priority order.
    fn oam_scan(&mut self) {
        let height: i16 = if self.lcdc & 0x04 != 0 { 16 } else { 8 };
        self.sprite_count = 0;
        for i in 0..TOTAL_SPRITES {
            if self.sprite_count >= MAX_SPRITES_PER_LINE {
                break;
            }
            let base = i * 4;
            let y = self.oam[base] as i16 - 16;
            let ly = self.ly as i16;
            if ly >= y && ly < y + height {
                self.line_sprites[self.sprite_count] = Sprite {
                    x: self.oam[base + 1] as i16 - 8,
                    y,
                    tile: self.oam[base + 2],
                    flags: self.oam[base + 3],
                    oam_index: i as u8,
                };
                self.sprite_count += 1;
            }
        }
        let sprites = &mut self.line_sprites[..self.sprite_count];
        if self.cgb && self.opri & 0x01 == 0 {
            sprites.sort_by_key(|s| s.oam_index);
        } else {
            sprites.sort_by_key(|s| (s.x, s.oam_index));
        }
    }

    fn window_on_line(&self) -> bool {
        self.lcdc & 0x20 != 0 && self.wy_triggered && self.wx <= WINDOW_X_MAX
    }

    fn transfer_length(&self) -> u32 {
        let mut dots = MODE3_MIN_DOTS + (self.scx & 7) as u32;
        if self.lcdc & 0x02 != 0 {
            dots += SPRITE_PENALTY_DOTS * self.sprite_count as u32;
        }
        if self.window_on_line() {
            dots += WINDOW_PENALTY_DOTS;
        }
        dots.min(MODE3_MAX_DOTS)
    }

    #[inline(always)]
    fn dmg_shade(palette: u8, color_id: u8) -> u8 {
        (palette >> (color_id * 2)) & 0x03
    }

    fn bg_pixel(&self, palette: usize, color_id: u8) -> u16 {
        if self.cgb {
            Self::palette_word(&self.bgpd, palette, color_id)
        } else if self.color_output {
            Self::palette_word(&self.bgpd, 0, Self::dmg_shade(self.bgp, color_id))
        } else {
            Self::dmg_shade(self.bgp, color_id) as u16
        }
    }

    fn obj_pixel(&self, flags: u8, color_id: u8) -> u16 {
        if self.cgb {
            return Self::palette_word(&self.obpd, (flags & 0x07) as usize, color_id);
        }
        let (palette, reg) = if flags & 0x10 != 0 {
            (1, self.obp1)
        } else {
            (0, self.obp0)
        };
        let shade = Self::dmg_shade(reg, color_id);
        if self.color_output {
            Self::palette_word(&self.obpd, palette, shade)
        } else {
            shade as u16
        }
    }

    /// Fetch one background/window pixel: `(color_id, palette, priority)`.
    fn tile_pixel(&self, map_base: usize, px: usize, py: usize) -> (u8, usize, bool) {
        let map_idx = map_base + (py / 8) * 32 + (px / 8);
        let tile_index = self.vram[0][map_idx];
        let tile_addr = if self.lcdc & 0x10 != 0 {
            TILE_DATA_0_BASE + tile_index as usize * 16
        } else {
            TILE_DATA_1_BASE + ((tile_index as i8 as i16 + 128) as usize) * 16
        };
        let mut bit = 7 - (px % 8);
        let mut row = py % 8;
        let (mut palette, mut bank, mut priority) = (0usize, 0usize, false);
        if self.cgb {
            let attr = self.vram[1][map_idx];
            palette = (attr & 0x07) as usize;
            bank = ((attr >> 3) & 0x01) as usize;
            if attr & 0x20 != 0 {
                bit = px % 8;
            }
            if attr & 0x40 != 0 {
                row = 7 - row;
            }
            priority = attr & 0x80 != 0;
        }
        let lo = self.vram[bank][tile_addr + row * 2];
        let hi = self.vram[bank][tile_addr + row * 2 + 1];
        let color_id = ((hi >> bit) & 1) << 1 | ((lo >> bit) & 1);
        (color_id, palette, priority)
    }

    fn render_scanline(&mut self) {
        let ly = self.ly as usize;
        // CGB mode: LCDC bit 0 is BG master priority rather than BG enable.
        let bg_enabled = self.cgb || self.lcdc & 0x01 != 0;
        let master_priority = !self.cgb || self.lcdc & 0x01 != 0;

        let blank = self.bg_pixel(0, 0);
        self.line.fill(blank);
        self.line_color_zero.fill(true);
        self.line_priority.fill(false);

        if bg_enabled {
            let map = if self.lcdc & 0x08 != 0 {
                BG_MAP_1_BASE
            } else {
                BG_MAP_0_BASE
            };
            let py = (ly + self.scy as usize) & 0xFF;
            for x in 0..SCREEN_WIDTH {
                let px = (x + self.scx as usize) & 0xFF;
                let (color_id, palette, priority) = self.tile_pixel(map, px, py);
                self.line[x] = self.bg_pixel(palette, color_id);
                self.line_color_zero[x] = color_id == 0;
                self.line_priority[x] = priority;
            }

            if self.window_on_line() {
                let map = if self.lcdc & 0x40 != 0 {
                    BG_MAP_1_BASE
                } else {
                    BG_MAP_0_BASE
                };
                let start = self.wx as i16 - 7;
                let wy = self.win_line_counter as usize;
                let first = start.max(0) as usize;
                for x in first..SCREEN_WIDTH {
                    let wx = (x as i16 - start) as usize;
                    let (color_id, palette, priority) = self.tile_pixel(map, wx, wy);
                    self.line[x] = self.bg_pixel(palette, color_id);
                    self.line_color_zero[x] = color_id == 0;
                    self.line_priority[x] = priority;
                }
                self.win_line_counter = self.win_line_counter.wrapping_add(1);
            }
        }

        if self.lcdc & 0x02 != 0 {
            let height: i16 = if self.lcdc & 0x04 != 0 { 16 } else { 8 };
            let mut claimed = [false; SCREEN_WIDTH];
            for i in 0..self.sprite_count {
                let s = self.line_sprites[i];
                let tile = if height == 16 { s.tile & 0xFE } else { s.tile };
                let mut row = self.ly as i16 - s.y;
                if !(0..height).contains(&row) {
                    continue;
                }
                if s.flags & 0x40 != 0 {
                    row = height - 1 - row;
                }
                let bank = if self.cgb {
                    ((s.flags >> 3) & 0x01) as usize
                } else {
                    0
                };
                let addr = tile as usize * 16 + row as usize * 2;
                let lo = self.vram[bank][addr];
                let hi = self.vram[bank][addr + 1];
                for px in 0..8u8 {
                    let sx = s.x + px as i16;
                    if !(0..SCREEN_WIDTH as i16).contains(&sx) {
                        continue;
                    }
                    let sx = sx as usize;
                    let bit = if s.flags & 0x20 != 0 { px } else { 7 - px };
                    let color_id = ((hi >> bit) & 1) << 1 | ((lo >> bit) & 1);
                    if color_id == 0 || claimed[sx] {
                        continue;
                    }
                    // The highest-priority opaque sprite owns the pixel even
                    // when the background then hides it.
                    claimed[sx] = true;
                    let bg_zero = !bg_enabled || self.line_color_zero[sx];
                    if master_priority && !bg_zero {
                        if s.flags & 0x80 != 0 || (self.cgb && self.line_priority[sx]) {
                            continue;
                        }
                    }
                    self.line[sx] = self.obj_pixel(s.flags, color_id);
                }
            }
        }

        let shades = &mut self.shade_frame[ly * SCREEN_WIDTH..(ly + 1) * SCREEN_WIDTH];
        if self.color_output {
            for (dst, &c) in shades.iter_mut().zip(self.line.iter()) {
                *dst = bgr555_shade(c);
            }
        } else {
            for (dst, &c) in shades.iter_mut().zip(self.line.iter()) {
                *dst = c as u8;
            }
        }
    }

    fn mode_length(&self) -> u32 {
        match self.mode {
            Mode::OamScan => MODE2_DOTS,
            Mode::Transfer => self.mode3_dots,
            Mode::HBlank => LINE_DOTS - MODE2_DOTS - self.mode3_dots,
            Mode::VBlank => LINE_DOTS,
        }
    }

    /// Advance by `dots` (single-speed T-cycles).
    pub fn step(&mut self, dots: u32, if_reg: &mut u8, host: &mut dyn Host) -> PpuEvents {
        let mut events = PpuEvents::default();
        if !self.lcd_enabled() {
            return events;
        }

        let mut remaining = dots;
        while remaining > 0 {
            let length = self.mode_length();
            let run = remaining.min(length.saturating_sub(self.mode_clock));
            self.mode_clock += run;
            remaining -= run;
            if self.mode_clock < length {
                break;
            }
            self.mode_clock = 0;

            match self.mode {
                Mode::OamScan => {
                    self.oam_scan();
                    self.mode3_dots = self.transfer_length();
                    self.mode = Mode::Transfer;
                }
                Mode::Transfer => {
                    self.render_scanline();
                    host.scanline_ready(self.ly, &self.line, self.pixel_format());
                    self.mode = Mode::HBlank;
                    events.hblanks += 1;
                }
                Mode::HBlank => {
                    self.ly += 1;
                    if self.ly as usize == SCREEN_HEIGHT {
                        self.mode = Mode::VBlank;
                        *if_reg |= interrupts::VBLANK;
                        self.frames = self.frames.wrapping_add(1);
                        events.vblank = true;
                    } else {
                        self.enter_oam_scan();
                    }
                }
                Mode::VBlank => {
                    if self.ly == LAST_LINE {
                        self.ly = 0;
                        self.win_line_counter = 0;
                        self.wy_triggered = false;
                        self.enter_oam_scan();
                    } else {
                        self.ly += 1;
                    }
                }
            }
            #[cfg(feature = "ppu-trace")]
            trace!("PPU LY={} mode={:?}", self.ly, self.mode);

            self.update_lyc_compare();
            self.update_stat_irq(if_reg);
        }
        events
    }

    pub fn save_state(&self, s: &mut Section) {
        s.bytes(&self.vram[0])
            .bytes(&self.vram[1])
            .bytes(&self.oam)
            .u8(self.vram_bank as u8)
            .u8(self.lcdc)
            .u8(self.stat)
            .u8(self.scy)
            .u8(self.scx)
            .u8(self.ly)
            .u8(self.lyc)
            .bool(self.lyc_eq_ly)
            .u8(self.dma)
            .u8(self.bgp)
            .u8(self.obp0)
            .u8(self.obp1)
            .u8(self.wy)
            .u8(self.wx)
            .u8(self.win_line_counter)
            .bool(self.wy_triggered)
            .u8(self.bgpi)
            .bytes(&self.bgpd)
            .u8(self.obpi)
            .bytes(&self.obpd)
            .u8(self.opri)
            .u8(self.mode as u8)
            .u32(self.mode_clock)
            .u32(self.mode3_dots)
            .bool(self.stat_irq_line)
            .u64(self.frames)
            .u8(self.sprite_count as u8);
        for sprite in &self.line_sprites {
            s.u16(sprite.x as u16)
                .u16(sprite.y as u16)
                .u8(sprite.tile)
                .u8(sprite.flags)
                .u8(sprite.oam_index);
        }
        // Shades packed four per byte.
        for chunk in self.shade_frame.chunks(4) {
            let packed = chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &v)| acc | (v & 3) << (i * 2));
            s.u8(packed);
        }
    }

    pub fn load_state(&mut self, r: &mut SectionReader) -> Result<()> {
        r.bytes_into(&mut self.vram[0])?;
        r.bytes_into(&mut self.vram[1])?;
        r.bytes_into(&mut self.oam)?;
        self.vram_bank = (r.u8()? & 0x01) as usize;
        self.lcdc = r.u8()?;
        self.stat = r.u8()?;
        self.scy = r.u8()?;
        self.scx = r.u8()?;
        self.ly = r.u8()?;
        self.lyc = r.u8()?;
        self.lyc_eq_ly = r.bool()?;
        self.dma = r.u8()?;
        self.bgp = r.u8()?;
        self.obp0 = r.u8()?;
        self.obp1 = r.u8()?;
        self.wy = r.u8()?;
        self.wx = r.u8()?;
        self.win_line_counter = r.u8()?;
        self.wy_triggered = r.bool()?;
        self.bgpi = r.u8()?;
        r.bytes_into(&mut self.bgpd)?;
        self.obpi = r.u8()?;
        r.bytes_into(&mut self.obpd)?;
        self.opri = r.u8()? & 0x01;
        self.mode = Mode::from_bits(r.u8()?);
        self.mode_clock = r.u32()?;
        self.mode3_dots = r.u32()?.clamp(MODE3_MIN_DOTS, MODE3_MAX_DOTS);
        self.stat_irq_line = r.bool()?;
        self.frames = r.u64()?;
        self.sprite_count = r.u8()? as usize;
        if self.ly > LAST_LINE || self.mode_clock >= self.mode_length() {
            return Err(CoreError::SaveStateIncompatible("PPU position out of range"));
        }
        if (self.ly as usize >= SCREEN_HEIGHT) != (self.mode == Mode::VBlank) {
            return Err(CoreError::SaveStateIncompatible("PPU mode does not match LY"));
        }
        if self.sprite_count > MAX_SPRITES_PER_LINE {
            return Err(CoreError::SaveStateIncompatible("sprite count out of range"));
        }
        for sprite in self.line_sprites.iter_mut() {
            sprite.x = r.u16()? as i16;
            sprite.y = r.u16()? as i16;
            sprite.tile = r.u8()?;
            sprite.flags = r.u8()?;
            sprite.oam_index = r.u8()?;
        }
        for chunk in self.shade_frame.chunks_mut(4) {
            let packed = r.u8()?;
            for (i, v) in chunk.iter_mut().enumerate() {
                *v = (packed >> (i * 2)) & 3;
            }
        }
        Ok(())
    }
}

/// Rough luminance of a BGR555 color mapped onto four DMG shades.
fn bgr555_shade(color: u16) -> u8 {
    let r = (color & 0x1F) as u32;
    let g = ((color >> 5) & 0x1F) as u32;
    let b = ((color >> 10) & 0x1F) as u32;
    let luma = (r * 3 + g * 6 + b) / 10; // 0..=31
    3 - (luma * 4 / 32) as u8
}
