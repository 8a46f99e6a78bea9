//! Memory bank controllers and external RAM.

use std::sync::Arc;

use log::debug;

use crate::cartridge::{Cartridge, Mapper};
use crate::error::{CoreError, Result};
use crate::rtc::{RTC_TAIL_LEN, Rtc};
use crate::state::{Section, SectionReader};

const ROM_BANK_SIZE: usize = 0x4000;
const RAM_BANK_SIZE: usize = 0x2000;

#[derive(Debug, Clone)]
enum MbcState {
    NoMbc,
    Mbc1 {
        /// BANK1: low five bits, never 0.
        rom_bank: u8,
        /// BANK2: two bits feeding ROM bits 5-6 or the RAM bank.
        bank2: u8,
        mode: bool,
        ram_enable: bool,
    },
    Mbc2 {
        rom_bank: u8,
        ram_enable: bool,
    },
    Mbc3 {
        rom_bank: u8,
        /// 0x00-0x03 RAM bank, 0x08-0x0C RTC register.
        select: u8,
        ram_enable: bool,
        rtc: Option<Rtc>,
    },
    Mbc5 {
        rom_bank: u16,
        ram_bank: u8,
        ram_enable: bool,
        rumble: bool,
    },
}

/// Cartridge bus: the banked ROM view, external RAM and optional RTC.
#[derive(Debug, Clone)]
pub struct Mbc {
    rom: Arc<[u8]>,
    rom_banks: usize,
    ram: Vec<u8>,
    state: MbcState,
    rumble_cart: bool,
    /// Set by RAM or RTC writes; drained once per host tick.
    ram_written: bool,
}

impl Mbc {
    /// `now` seeds the RTC anchor for timer cartridges.
    pub fn new(cart: &Cartridge, now: u64) -> Self {
        let state = match cart.mapper() {
            Mapper::NoMbc => MbcState::NoMbc,
            Mapper::Mbc1 => MbcState::Mbc1 {
                rom_bank: 1,
                bank2: 0,
                mode: false,
                ram_enable: false,
            },
            Mapper::Mbc2 => MbcState::Mbc2 {
                rom_bank: 1,
                ram_enable: false,
            },
            Mapper::Mbc3 => MbcState::Mbc3 {
                rom_bank: 1,
                select: 0,
                ram_enable: false,
                rtc: cart.features().timer.then(|| Rtc::new(now)),
            },
            Mapper::Mbc5 => MbcState::Mbc5 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
                rumble: false,
            },
        };
        Self {
            rom: Arc::clone(cart.rom()),
            rom_banks: cart.rom_banks(),
            ram: vec![0; cart.ram_size()],
            state,
            rumble_cart: cart.features().rumble,
            ram_written: false,
        }
    }

    fn rom_byte(&self, bank: usize, addr: u16) -> u8 {
        let bank = bank % self.rom_banks;
        let offset = bank * ROM_BANK_SIZE + (addr as usize & (ROM_BANK_SIZE - 1));
        self.rom.get(offset).copied().unwrap_or(0xFF)
    }

    /// ROM bank currently visible at 0x0000-0x3FFF.
    pub fn low_bank(&self) -> usize {
        match &self.state {
            MbcState::Mbc1 {
                bank2, mode: true, ..
            } => ((*bank2 as usize) << 5) % self.rom_banks,
            _ => 0,
        }
    }

    /// ROM bank currently visible at 0x4000-0x7FFF.
    pub fn high_bank(&self) -> usize {
        let bank = match &self.state {
            MbcState::NoMbc => 1,
            MbcState::Mbc1 {
                rom_bank, bank2, ..
            } => ((*bank2 as usize) << 5) | *rom_bank as usize,
            MbcState::Mbc2 { rom_bank, .. } | MbcState::Mbc3 { rom_bank, .. } => {
                *rom_bank as usize
            }
            MbcState::Mbc5 { rom_bank, .. } => *rom_bank as usize,
        };
        bank % self.rom_banks
    }

    pub fn read_rom(&self, addr: u16) -> u8 {
        if addr < 0x4000 {
            self.rom_byte(self.low_bank(), addr)
        } else {
            self.rom_byte(self.high_bank(), addr)
        }
    }

    /// Writes into 0x0000-0x7FFF program the controller.
    pub fn write_rom(&mut self, addr: u16, val: u8) {
        match &mut self.state {
            MbcState::NoMbc => {}
            MbcState::Mbc1 {
                rom_bank,
                bank2,
                mode,
                ram_enable,
            } => match addr {
                0x0000..=0x1FFF => *ram_enable = val & 0x0F == 0x0A,
                0x2000..=0x3FFF => *rom_bank = (val & 0x1F).max(1),
                0x4000..=0x5FFF => *bank2 = val & 0x03,
                _ => *mode = val & 0x01 != 0,
            },
            MbcState::Mbc2 {
                rom_bank,
                ram_enable,
            } => {
                if addr < 0x4000 {
                    // Address bit 8 selects RAMG or ROMB.
                    if addr & 0x0100 == 0 {
                        *ram_enable = val & 0x0F == 0x0A;
                    } else {
                        *rom_bank = (val & 0x0F).max(1);
                    }
                }
            }
            MbcState::Mbc3 {
                rom_bank,
                select,
                ram_enable,
                rtc,
            } => match addr {
                0x0000..=0x1FFF => *ram_enable = val & 0x0F == 0x0A,
                0x2000..=0x3FFF => *rom_bank = (val & 0x7F).max(1),
                0x4000..=0x5FFF => *select = val,
                _ => {
                    if let Some(rtc) = rtc {
                        rtc.write_latch(val);
                    }
                }
            },
            MbcState::Mbc5 {
                rom_bank,
                ram_bank,
                ram_enable,
                rumble,
            } => match addr {
                0x0000..=0x1FFF => *ram_enable = val == 0x0A,
                0x2000..=0x2FFF => *rom_bank = (*rom_bank & 0x100) | val as u16,
                0x3000..=0x3FFF => *rom_bank = (*rom_bank & 0xFF) | (((val & 0x01) as u16) << 8),
                0x4000..=0x5FFF => {
                    if self.rumble_cart {
                        *rumble = val & 0x08 != 0;
                        *ram_bank = val & 0x07;
                    } else {
                        *ram_bank = val & 0x0F;
                    }
                }
                _ => {}
            },
        }
        if (0x2000..0x6000).contains(&addr) {
            debug!(
                "MBC write {addr:#06X}={val:#04X}: banks {:#04X}/{:#04X}",
                self.low_bank(),
                self.high_bank()
            );
        }
    }

    fn ram_offset(&self, bank: usize, addr: u16) -> Option<usize> {
        if self.ram.is_empty() {
            return None;
        }
        Some((bank * RAM_BANK_SIZE + (addr as usize - 0xA000)) % self.ram.len())
    }

    /// RAM bank in use, or `None` when the window is disabled.
    fn ram_target(&self) -> Option<usize> {
        match &self.state {
            MbcState::NoMbc => Some(0),
            MbcState::Mbc1 {
                ram_enable,
                bank2,
                mode,
                ..
            } => ram_enable.then_some(if *mode { *bank2 as usize } else { 0 }),
            MbcState::Mbc2 { ram_enable, .. } => ram_enable.then_some(0),
            MbcState::Mbc3 {
                ram_enable, select, ..
            } => (*ram_enable && *select <= 0x03).then_some(*select as usize),
            MbcState::Mbc5 {
                ram_enable,
                ram_bank,
                ..
            } => ram_enable.then_some(*ram_bank as usize),
        }
    }

    pub fn read_ram(&self, addr: u16) -> u8 {
        match &self.state {
            MbcState::Mbc3 {
                ram_enable: true,
                select: select @ 0x08..=0x0C,
                rtc,
                ..
            } => rtc.as_ref().map(|r| r.read(*select)).unwrap_or(0xFF),
            MbcState::Mbc2 {
                ram_enable: true, ..
            } => {
                let idx = (addr as usize - 0xA000) & 0x01FF;
                0xF0 | (self.ram[idx] & 0x0F)
            }
            _ => self
                .ram_target()
                .and_then(|bank| self.ram_offset(bank, addr))
                .map(|idx| self.ram[idx])
                .unwrap_or(0xFF),
        }
    }

    pub fn write_ram(&mut self, addr: u16, val: u8) {
        if let MbcState::Mbc3 {
            ram_enable: true,
            select: select @ 0x08..=0x0C,
            rtc: Some(rtc),
            ..
        } = &mut self.state
        {
            rtc.write(*select, val);
            self.ram_written = true;
            return;
        }
        if let MbcState::Mbc2 {
            ram_enable: true, ..
        } = self.state
        {
            let idx = (addr as usize - 0xA000) & 0x01FF;
            self.ram[idx] = val & 0x0F;
            self.ram_written = true;
            return;
        }
        if let Some(idx) = self
            .ram_target()
            .and_then(|bank| self.ram_offset(bank, addr))
        {
            self.ram[idx] = val;
            self.ram_written = true;
        }
    }

    /// Advance the RTC by emulated wall-time cycles.
    pub fn step_rtc(&mut self, cycles: u32) {
        if let Some(rtc) = self.rtc_mut() {
            rtc.step(cycles);
        }
    }

    fn rtc_mut(&mut self) -> Option<&mut Rtc> {
        match &mut self.state {
            MbcState::Mbc3 { rtc: Some(rtc), .. } => Some(rtc),
            _ => None,
        }
    }

    pub fn rtc(&self) -> Option<&Rtc> {
        match &self.state {
            MbcState::Mbc3 { rtc: Some(rtc), .. } => Some(rtc),
            _ => None,
        }
    }

    /// Set the clock of a timer cartridge; false if there is none.
    pub fn set_rtc(&mut self, days: u16, hours: u8, minutes: u8, seconds: u8, now: u64) -> bool {
        match self.rtc_mut() {
            Some(rtc) => {
                rtc.set_time(days, hours, minutes, seconds, now);
                self.ram_written = true;
                true
            }
            None => false,
        }
    }

    /// Controller registers back to power-on. RAM and the clock are kept.
    pub fn reset(&mut self, cart: &Cartridge) {
        let rtc = self.rtc().cloned();
        let ram = std::mem::take(&mut self.ram);
        let ram_written = self.ram_written;
        *self = Mbc::new(cart, 0);
        self.ram = ram;
        self.ram_written = ram_written;
        if let (Some(old), Some(new)) = (rtc, self.rtc_mut()) {
            *new = old;
        }
    }

    pub fn has_rtc(&self) -> bool {
        self.rtc().is_some()
    }

    /// Whether the rumble motor is currently driven.
    pub fn rumble_active(&self) -> bool {
        matches!(self.state, MbcState::Mbc5 { rumble: true, .. })
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    /// Returns and clears the written-since-last-check flag.
    pub fn take_ram_written(&mut self) -> bool {
        std::mem::take(&mut self.ram_written)
    }

    /// Battery image: external RAM, then the RTC tail on timer cartridges.
    /// The RTC anchor moves to `now`.
    pub fn battery_image(&mut self, now: u64) -> Vec<u8> {
        let mut out = self.ram.clone();
        if let Some(rtc) = self.rtc_mut() {
            rtc.set_anchor(now);
            out.extend_from_slice(&rtc.to_tail());
        }
        out
    }

    /// Install a battery image. Timer cartridges accept the image with or
    /// without an RTC tail; with one, the clock is caught up to `now`.
    pub fn load_battery_image(&mut self, data: &[u8], now: u64) -> Result<()> {
        let ram_len = self.ram.len();
        let with_tail = self.has_rtc() && data.len() == ram_len + RTC_TAIL_LEN;
        if data.len() != ram_len && !with_tail {
            let expected = if self.has_rtc() {
                ram_len + RTC_TAIL_LEN
            } else {
                ram_len
            };
            return Err(CoreError::SaveRamSizeMismatch {
                expected,
                actual: data.len(),
            });
        }

        self.ram.copy_from_slice(&data[..ram_len]);
        if let Some(rtc) = self.rtc_mut() {
            if with_tail {
                let mut tail = [0u8; RTC_TAIL_LEN];
                tail.copy_from_slice(&data[ram_len..]);
                rtc.load_tail(&tail);
                rtc.catch_up(now);
            } else {
                rtc.set_anchor(now);
            }
        }
        Ok(())
    }

    pub fn save_state(&self, s: &mut Section) {
        match &self.state {
            MbcState::NoMbc => {
                s.u8(0);
            }
            MbcState::Mbc1 {
                rom_bank,
                bank2,
                mode,
                ram_enable,
            } => {
                s.u8(1).u8(*rom_bank).u8(*bank2).bool(*mode).bool(*ram_enable);
            }
            MbcState::Mbc2 {
                rom_bank,
                ram_enable,
            } => {
                s.u8(2).u8(*rom_bank).bool(*ram_enable);
            }
            MbcState::Mbc3 {
                rom_bank,
                select,
                ram_enable,
                rtc,
            } => {
                s.u8(3).u8(*rom_bank).u8(*select).bool(*ram_enable);
                if let Some(rtc) = rtc {
                    rtc.save_state(s);
                }
            }
            MbcState::Mbc5 {
                rom_bank,
                ram_bank,
                ram_enable,
                rumble,
            } => {
                s.u8(5)
                    .u16(*rom_bank)
                    .u8(*ram_bank)
                    .bool(*ram_enable)
                    .bool(*rumble);
            }
        }
    }

    pub fn load_state(&mut self, r: &mut SectionReader) -> Result<()> {
        let tag = r.u8()?;
        match (&mut self.state, tag) {
            (MbcState::NoMbc, 0) => {}
            (
                MbcState::Mbc1 {
                    rom_bank,
                    bank2,
                    mode,
                    ram_enable,
                },
                1,
            ) => {
                *rom_bank = (r.u8()? & 0x1F).max(1);
                *bank2 = r.u8()? & 0x03;
                *mode = r.bool()?;
                *ram_enable = r.bool()?;
            }
            (
                MbcState::Mbc2 {
                    rom_bank,
                    ram_enable,
                },
                2,
            ) => {
                *rom_bank = (r.u8()? & 0x0F).max(1);
                *ram_enable = r.bool()?;
            }
            (
                MbcState::Mbc3 {
                    rom_bank,
                    select,
                    ram_enable,
                    rtc,
                },
                3,
            ) => {
                *rom_bank = (r.u8()? & 0x7F).max(1);
                *select = r.u8()?;
                *ram_enable = r.bool()?;
                if let Some(rtc) = rtc {
                    rtc.load_state(r)?;
                }
            }
            (
                MbcState::Mbc5 {
                    rom_bank,
                    ram_bank,
                    ram_enable,
                    rumble,
                },
                5,
            ) => {
                *rom_bank = r.u16()? & 0x1FF;
                *ram_bank = r.u8()? & 0x0F;
                *ram_enable = r.bool()?;
                *rumble = r.bool()?;
            }
            _ => return Err(CoreError::SaveStateIncompatible("mapper mismatch")),
        }
        Ok(())
    }

    pub fn save_ram_state(&self, s: &mut Section) {
        s.bytes(&self.ram);
    }

    pub fn load_ram_state(&mut self, r: &mut SectionReader) -> Result<()> {
        if r.remaining() != self.ram.len() {
            return Err(CoreError::SaveStateIncompatible("external RAM size"));
        }
        r.bytes_into(&mut self.ram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::{header_checksum, load_cartridge};

    fn banked_cart(cart_type: u8, rom_code: u8, ram_code: u8) -> Cartridge {
        let banks = 2usize << rom_code;
        let mut rom = vec![0u8; banks * ROM_BANK_SIZE];
        for (bank, chunk) in rom.chunks_mut(ROM_BANK_SIZE).enumerate() {
            chunk.fill(bank as u8);
        }
        rom[0x0100..0x0150].fill(0);
        rom[0x0147] = cart_type;
        rom[0x0148] = rom_code;
        rom[0x0149] = ram_code;
        rom[0x014D] = header_checksum(&rom);
        load_cartridge(rom).unwrap()
    }

    #[test]
    fn reset_keeps_ram_and_clock() {
        let cart = banked_cart(0x10, 0x04, 0x02);
        let mut mbc = Mbc::new(&cart, 0);
        mbc.write_rom(0x0000, 0x0A);
        mbc.write_rom(0x2000, 0x05);
        mbc.write_ram(0xA000, 0x99);
        assert!(mbc.set_rtc(3, 4, 5, 6, 100));

        mbc.reset(&cart);
        assert_eq!(mbc.read_rom(0x4000), 1);
        assert_eq!(mbc.read_ram(0xA000), 0xFF, "RAM disabled again");
        assert_eq!(mbc.ram()[0], 0x99);
        assert_eq!(mbc.rtc().unwrap().anchor(), 100);

        mbc.write_rom(0x0000, 0x0A);
        mbc.write_rom(0x6000, 0x00);
        mbc.write_rom(0x6000, 0x01);
        mbc.write_rom(0x4000, 0x0A);
        assert_eq!(mbc.read_ram(0xA000), 4);

        let mut plain = Mbc::new(&banked_cart(0x01, 0x00, 0x00), 0);
        assert!(!plain.set_rtc(0, 0, 0, 0, 0));
    }

    #[test]
    fn mbc1_zero_bank_maps_to_one() {
        let mut mbc = Mbc::new(&banked_cart(0x01, 0x04, 0x00), 0);
        mbc.write_rom(0x2000, 0x00);
        assert_eq!(mbc.read_rom(0x4000), 1);
        mbc.write_rom(0x2000, 0x20); // only low five bits count
        assert_eq!(mbc.read_rom(0x4000), 1);
        mbc.write_rom(0x2000, 0x1F);
        assert_eq!(mbc.read_rom(0x4000), 0x1F);
    }

    #[test]
    fn mbc1_ram_banking_needs_mode_one() {
        let mut mbc = Mbc::new(&banked_cart(0x03, 0x00, 0x03), 0);
        assert_eq!(mbc.read_ram(0xA000), 0xFF, "disabled RAM reads open bus");
        mbc.write_rom(0x0000, 0x0A);
        mbc.write_rom(0x4000, 0x02);
        mbc.write_ram(0xA000, 0x11);
        mbc.write_rom(0x6000, 0x01);
        assert_eq!(mbc.read_ram(0xA000), 0x00);
        mbc.write_ram(0xA000, 0x22);
        mbc.write_rom(0x6000, 0x00);
        assert_eq!(mbc.read_ram(0xA000), 0x11);
        assert!(mbc.take_ram_written());
        assert!(!mbc.take_ram_written());
    }

    #[test]
    fn mbc2_nibble_ram_and_rom_select() {
        let mut mbc = Mbc::new(&banked_cart(0x06, 0x03, 0x00), 0);
        mbc.write_rom(0x2100, 0x05);
        assert_eq!(mbc.read_rom(0x4000), 5);
        mbc.write_rom(0x0000, 0x0A);
        mbc.write_ram(0xA000, 0xAB);
        assert_eq!(mbc.read_ram(0xA000), 0xFB);
        assert_eq!(mbc.read_ram(0xA200), 0xFB, "512 nibbles mirror");
    }

    #[test]
    fn mbc3_rtc_window() {
        let mut mbc = Mbc::new(&banked_cart(0x10, 0x00, 0x03), 0);
        mbc.write_rom(0x0000, 0x0A);
        mbc.write_rom(0x4000, 0x08);
        mbc.write_ram(0xA000, 42);
        mbc.write_rom(0x6000, 0x00);
        mbc.write_rom(0x6000, 0x01);
        assert_eq!(mbc.read_ram(0xA000), 42);
        mbc.write_rom(0x4000, 0x00);
        mbc.write_ram(0xA000, 7);
        assert_eq!(mbc.read_ram(0xA000), 7);
    }

    #[test]
    fn mbc5_nine_bit_bank_and_bank_zero() {
        let mut mbc = Mbc::new(&banked_cart(0x19, 0x08, 0x00), 0);
        mbc.write_rom(0x2000, 0x00);
        assert_eq!(mbc.read_rom(0x4000), 0);
        mbc.write_rom(0x2000, 0x05);
        mbc.write_rom(0x3000, 0x01);
        assert_eq!(mbc.high_bank(), 0x105);
        assert_eq!(mbc.read_rom(0x4000), 0x05);
    }

    #[test]
    fn mbc5_rumble_bit_is_not_a_ram_bank() {
        let mut mbc = Mbc::new(&banked_cart(0x1E, 0x00, 0x03), 0);
        mbc.write_rom(0x0000, 0x0A);
        mbc.write_rom(0x4000, 0x09);
        assert!(mbc.rumble_active());
        mbc.write_ram(0xA000, 0x5A);
        mbc.write_rom(0x4000, 0x01);
        assert!(!mbc.rumble_active());
        assert_eq!(mbc.read_ram(0xA000), 0x5A);
    }

    #[test]
    fn battery_image_sizes() {
        let mut mbc = Mbc::new(&banked_cart(0x10, 0x00, 0x02), 0);
        let image = mbc.battery_image(1234);
        assert_eq!(image.len(), 0x2000 + RTC_TAIL_LEN);
        assert!(mbc.load_battery_image(&image, 1234).is_ok());
        assert!(mbc.load_battery_image(&image[..0x2000], 1234).is_ok());
        assert_eq!(
            mbc.load_battery_image(&image[..100], 1234),
            Err(CoreError::SaveRamSizeMismatch {
                expected: 0x2000 + RTC_TAIL_LEN,
                actual: 100
            })
        );
    }
}
