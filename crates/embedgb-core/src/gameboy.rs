use log::info;

use crate::{
    cartridge::{BootRom, Cartridge},
    cpu::Cpu,
    error::{CoreError, Result},
    hardware::Model,
    host::Host,
    mbc::Mbc,
    mmu::Mmu,
    state::{self, StateReader, StateWriter},
};

/// Longest single step: a full-length GDMA stall in double speed.
const MAX_OVERSHOOT: u32 = 0x80 * 64;

/// CPU and bus wired into one machine. Cloning snapshots the whole emulated
/// state, which is how save-state loads stay atomic.
#[derive(Clone)]
pub struct GameBoy {
    pub cpu: Cpu,
    pub mmu: Mmu,
    model: Model,
    /// Dots already run past the previous [`GameBoy::run_for`] budget.
    overshoot: u32,
}

impl GameBoy {
    /// Build a machine for `cart`. Without a boot ROM the post-boot register
    /// and I/O state is installed directly and execution starts at 0x0100.
    pub fn new(
        cart: &Cartridge,
        model: Model,
        boot_rom: Option<BootRom>,
        sample_rate: u32,
        now: u64,
    ) -> Result<Self> {
        let cgb = cart.runs_in_cgb_mode(model);
        let mut mmu = Mmu::new(Mbc::new(cart, now), model, cgb, sample_rate);
        let cpu = match boot_rom {
            Some(boot) => {
                if boot.model() != model {
                    return Err(CoreError::BootRomSize(boot.model().boot_rom_len()));
                }
                if model.is_cgb() && !cgb {
                    mmu.ppu.apply_dmg_compatibility_palettes();
                }
                mmu.map_boot_rom(boot);
                info!("Starting from boot ROM ({model:?})");
                Cpu::power_on()
            }
            None => {
                mmu.apply_boot_state();
                Cpu::post_boot(model)
            }
        };
        Ok(Self {
            cpu,
            mmu,
            model,
            overshoot: 0,
        })
    }

    pub fn model(&self) -> Model {
        self.model
    }

    /// Execute one instruction (or pay outstanding VRAM DMA stall) and
    /// advance the rest of the machine with it. Returns elapsed dots, the
    /// 4.194304 MHz unit independent of CPU speed.
    pub fn step(&mut self, host: &mut dyn Host) -> Result<u32> {
        let stall = self.mmu.take_stall();
        if stall > 0 {
            return Ok(self.mmu.advance(stall, host));
        }
        let cycles = self.cpu.step(&mut self.mmu)?;
        Ok(self.mmu.advance(cycles, host))
    }

    /// Run whole instructions until `dots` have elapsed. The last instruction
    /// may overrun; the overrun is deducted from the next call.
    pub fn run_for(&mut self, dots: u32, host: &mut dyn Host) -> Result<()> {
        let mut remaining = dots as i64 - self.overshoot as i64;
        while remaining > 0 {
            match self.step(host) {
                Ok(elapsed) => remaining -= elapsed as i64,
                Err(err) => {
                    self.overshoot = 0;
                    return Err(err);
                }
            }
        }
        self.overshoot = remaining.unsigned_abs() as u32;
        Ok(())
    }

    fn state_flags(&self) -> u16 {
        let mut flags = 0;
        if self.model.is_cgb() {
            flags |= state::FLAG_CGB;
        }
        if self.mmu.mbc.has_rtc() {
            flags |= state::FLAG_RTC;
        }
        flags
    }

    /// Serialize everything except the immutable cartridge ROM.
    pub fn save_state(&self) -> Vec<u8> {
        let mut w = StateWriter::new(self.state_flags());
        w.section(|s| self.mmu.mbc.save_state(s));
        w.section(|s| self.mmu.mbc.save_ram_state(s));
        w.section(|s| {
            self.cpu.save_state(s);
            s.u32(self.overshoot);
        });
        w.section(|s| self.mmu.ppu.save_state(s));
        w.section(|s| self.mmu.timer.save_state(s));
        w.section(|s| self.mmu.apu.save_state(s));
        w.section(|s| {
            s.u8(self.mmu.if_reg).u8(self.mmu.ie_reg);
        });
        w.section(|s| self.mmu.save_memory(s));
        w.section(|s| {
            s.bytes(&state::dither_thumbnail(self.mmu.ppu.shade_frame()));
        });
        w.finish()
    }

    /// Load a blob written by [`GameBoy::save_state`]. On error `self` may be
    /// partially overwritten; callers load into a clone.
    pub fn load_state(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = StateReader::new(data)?;
        if reader.flags() != self.state_flags() {
            return Err(CoreError::SaveStateIncompatible(
                "model or cartridge features differ",
            ));
        }

        let mut s = reader.next_section()?;
        self.mmu.mbc.load_state(&mut s)?;
        s.finish()?;

        let mut s = reader.next_section()?;
        self.mmu.mbc.load_ram_state(&mut s)?;
        s.finish()?;

        let mut s = reader.next_section()?;
        self.cpu.load_state(&mut s)?;
        self.overshoot = s.u32()?.min(MAX_OVERSHOOT);
        s.finish()?;

        let mut s = reader.next_section()?;
        self.mmu.ppu.load_state(&mut s)?;
        s.finish()?;

        let mut s = reader.next_section()?;
        self.mmu.timer.load_state(&mut s)?;
        s.finish()?;

        let mut s = reader.next_section()?;
        self.mmu.apu.load_state(&mut s)?;
        s.finish()?;

        let mut s = reader.next_section()?;
        self.mmu.if_reg = s.u8()? & crate::interrupts::MASK;
        self.mmu.ie_reg = s.u8()? & crate::interrupts::MASK;
        s.finish()?;

        let mut s = reader.next_section()?;
        self.mmu.load_memory(&mut s)?;
        s.finish()?;

        // Thumbnail: validated for size, not restored.
        let mut s = reader.next_section()?;
        let mut thumb = [0u8; state::THUMBNAIL_LEN];
        s.bytes_into(&mut thumb)?;
        s.finish()?;

        reader.finish()
    }
}
