use crate::error::Result;
use crate::interrupts;
use crate::state::{Section, SectionReader};

/// T-cycles between a TIMA overflow and the TMA reload.
const RELOAD_DELAY: u8 = 3;

/// DIV/TIMA/TMA/TAC block.
///
/// TIMA is clocked by the falling edge of `selected divider bit AND enable`,
/// so writes to DIV or TAC can produce an extra increment.
#[derive(Clone, Debug)]
pub struct Timer {
    /// Free-running 16-bit counter; DIV is the upper byte.
    pub div: u16,
    pub tima: u8,
    pub tma: u8,
    pub tac: u8,
    last_signal: bool,
    /// TMA value before a write in the current cycle.
    tma_latch: Option<u8>,
    /// Reload value waiting out the overflow window.
    pending_reload: Option<u8>,
    reload_delay: u8,
    /// Set during the cycle in which the reload lands.
    reloading: bool,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            div: 0,
            tima: 0,
            tma: 0,
            tac: 0,
            last_signal: false,
            tma_latch: None,
            pending_reload: None,
            reload_delay: 0,
            reloading: false,
        }
    }

    /// Counter value the boot ROM leaves behind.
    pub fn with_div(div: u16) -> Self {
        Self {
            div,
            ..Self::new()
        }
    }

    pub fn read(&self, addr: u16) -> u8 {
        match addr {
            0xFF04 => (self.div >> 8) as u8,
            0xFF05 => self.tima,
            0xFF06 => self.tma,
            0xFF07 => self.tac | 0xF8,
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, addr: u16, val: u8, if_reg: &mut u8) {
        match addr {
            0xFF04 => self.reset_div(if_reg),
            0xFF05 => {
                // The reload cycle itself wins over the CPU write.
                if self.reloading || (self.pending_reload.is_some() && self.reload_delay == 0) {
                    return;
                }
                self.tima = val;
                if self.pending_reload.is_some() {
                    self.pending_reload = None;
                    self.reload_delay = 0;
                }
            }
            0xFF06 => {
                self.tma_latch = Some(self.tma);
                self.tma = val;
                if self.pending_reload.is_some() {
                    self.pending_reload = Some(val);
                }
                if self.reloading {
                    self.tima = val;
                }
            }
            0xFF07 => {
                let before = Self::signal(self.div, self.tac);
                self.tac = val & 0x07;
                let after = Self::signal(self.div, self.tac);
                if before && !after {
                    let old_tma = self.tma_latch.take();
                    self.increment(old_tma);
                }
                self.last_signal = after;
            }
            _ => {}
        }
    }

    /// Advance by `cycles` CPU T-cycles, raising the timer interrupt when a
    /// reload lands.
    pub fn step(&mut self, cycles: u32, if_reg: &mut u8) {
        for _ in 0..cycles {
            self.advance_reload(if_reg);
            let old_tma = self.tma_latch.take();
            self.div = self.div.wrapping_add(1);
            self.clock_edge(old_tma);
        }
    }

    /// DIV write: the counter restarts from zero.
    pub fn reset_div(&mut self, if_reg: &mut u8) {
        self.advance_reload(if_reg);
        self.div = 0;
        let old_tma = self.tma_latch.take();
        self.clock_edge(old_tma);
    }

    fn advance_reload(&mut self, if_reg: &mut u8) {
        self.reloading = false;
        let Some(val) = self.pending_reload else {
            return;
        };
        if self.reload_delay == 0 {
            self.tima = val;
            *if_reg |= interrupts::TIMER;
            self.pending_reload = None;
            self.reloading = true;
        } else {
            self.reload_delay -= 1;
        }
    }

    fn clock_edge(&mut self, old_tma: Option<u8>) {
        let now = Self::signal(self.div, self.tac);
        if self.last_signal && !now {
            self.increment(old_tma);
        }
        self.last_signal = now;
    }

    fn increment(&mut self, old_tma: Option<u8>) {
        if self.tima == 0xFF {
            // TIMA reads 0 until the reload lands.
            self.tima = 0;
            self.pending_reload = Some(old_tma.unwrap_or(self.tma));
            self.reload_delay = RELOAD_DELAY;
        } else {
            self.tima += 1;
        }
    }

    fn signal(div: u16, tac: u8) -> bool {
        if tac & 0x04 == 0 {
            return false;
        }
        let bit = match tac & 0x03 {
            0x00 => 9,
            0x01 => 3,
            0x02 => 5,
            _ => 7,
        };
        (div >> bit) & 1 != 0
    }

    pub fn save_state(&self, s: &mut Section) {
        s.u16(self.div)
            .u8(self.tima)
            .u8(self.tma)
            .u8(self.tac)
            .bool(self.last_signal)
            .bool(self.pending_reload.is_some())
            .u8(self.pending_reload.unwrap_or(0))
            .u8(self.reload_delay)
            .bool(self.reloading);
    }

    pub fn load_state(&mut self, r: &mut SectionReader) -> Result<()> {
        self.div = r.u16()?;
        self.tima = r.u8()?;
        self.tma = r.u8()?;
        self.tac = r.u8()? & 0x07;
        self.last_signal = r.bool()?;
        let has_reload = r.bool()?;
        let reload = r.u8()?;
        self.pending_reload = has_reload.then_some(reload);
        self.reload_delay = r.u8()?;
        self.reloading = r.bool()?;
        self.tma_latch = None;
        Ok(())
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn div_counts_every_256_cycles() {
        let mut t = Timer::new();
        let mut if_reg = 0;
        t.step(255, &mut if_reg);
        assert_eq!(t.read(0xFF04), 0);
        t.step(1, &mut if_reg);
        assert_eq!(t.read(0xFF04), 1);
        t.write(0xFF04, 0x55, &mut if_reg);
        assert_eq!(t.read(0xFF04), 0);
    }

    #[test]
    fn div_reset_on_high_bit_ticks_tima() {
        let mut t = Timer::new();
        let mut if_reg = 0;
        t.write(0xFF07, 0x05, &mut if_reg); // 262144 Hz, bit 3
        t.step(8, &mut if_reg); // bit 3 now set
        let before = t.tima;
        t.write(0xFF04, 0, &mut if_reg);
        assert_eq!(t.tima, before + 1);
    }

    #[test]
    fn overflow_holds_zero_then_reloads() {
        let mut t = Timer::new();
        let mut if_reg = 0;
        t.write(0xFF06, 0xAB, &mut if_reg);
        t.write(0xFF07, 0x05, &mut if_reg);
        t.tima = 0xFF;
        t.step(16, &mut if_reg); // falling edge of bit 3
        assert_eq!(t.tima, 0);
        assert_eq!(if_reg, 0);
        t.step(3, &mut if_reg);
        assert_eq!(t.tima, 0);
        t.step(1, &mut if_reg);
        assert_eq!(t.tima, 0xAB);
        assert_eq!(if_reg & interrupts::TIMER, interrupts::TIMER);
    }

    #[test]
    fn tima_write_in_window_cancels_reload() {
        let mut t = Timer::new();
        let mut if_reg = 0;
        t.write(0xFF07, 0x05, &mut if_reg);
        t.tima = 0xFF;
        t.step(16, &mut if_reg);
        t.write(0xFF05, 0x10, &mut if_reg);
        t.step(8, &mut if_reg);
        assert_eq!(t.tima, 0x10);
        assert_eq!(if_reg, 0);
    }

    #[test]
    fn tma_write_in_window_feeds_reload() {
        let mut t = Timer::new();
        let mut if_reg = 0;
        t.write(0xFF06, 0x11, &mut if_reg);
        t.write(0xFF07, 0x05, &mut if_reg);
        t.tima = 0xFF;
        t.step(16, &mut if_reg);
        t.write(0xFF06, 0x22, &mut if_reg);
        t.step(4, &mut if_reg);
        assert_eq!(t.tima, 0x22);
    }
}
