//! MBC3 real-time clock.
//!
//! The live counters advance with emulated time while the session runs. The
//! wall-clock anchor records when the counters were last persisted, so a
//! battery save loaded later can be caught up by the real time that passed.

use log::warn;

use crate::error::Result;
use crate::hardware::CLOCK_HZ;
use crate::state::{Section, SectionReader};

/// Size of the RTC block appended to battery saves.
pub const RTC_TAIL_LEN: usize = 48;

/// Largest wall-clock gap applied on catch-up.
pub const MAX_CATCH_UP_SECONDS: u64 = 1 << 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RtcRegisters {
    seconds: u8,
    minutes: u8,
    hours: u8,
    days: u16,
    halt: bool,
    carry: bool,
}

impl RtcRegisters {
    /// DH register: day bit 8, halt bit 6, day-carry bit 7.
    fn dh(&self) -> u8 {
        let mut out = ((self.days >> 8) as u8) & 0x01;
        if self.halt {
            out |= 0x40;
        }
        if self.carry {
            out |= 0x80;
        }
        out
    }

    fn read(&self, reg: u8) -> u8 {
        match reg {
            0x08 => self.seconds & 0x3F,
            0x09 => self.minutes & 0x3F,
            0x0A => self.hours & 0x1F,
            0x0B => (self.days & 0xFF) as u8,
            0x0C => self.dh() | 0x3E,
            _ => 0xFF,
        }
    }

    fn set_dh(&mut self, value: u8) {
        self.days = (self.days & 0x00FF) | (((value & 0x01) as u16) << 8);
        self.halt = value & 0x40 != 0;
        self.carry = value & 0x80 != 0;
    }

    fn to_words(self) -> [u32; 5] {
        [
            self.seconds as u32,
            self.minutes as u32,
            self.hours as u32,
            (self.days & 0xFF) as u32,
            self.dh() as u32,
        ]
    }

    fn from_words(words: [u32; 5]) -> Self {
        let mut regs = Self {
            seconds: (words[0] & 0x3F) as u8,
            minutes: (words[1] & 0x3F) as u8,
            hours: (words[2] & 0x1F) as u8,
            days: (words[3] & 0xFF) as u16,
            ..Self::default()
        };
        regs.set_dh(words[4] as u8);
        regs
    }
}

#[derive(Debug, Clone)]
pub struct Rtc {
    regs: RtcRegisters,
    latched: RtcRegisters,
    /// Unix seconds at which `regs` were last synchronized with the wall clock.
    anchor: u64,
    subsecond_cycles: u32,
    last_latch_write: u8,
}

impl Rtc {
    pub fn new(anchor: u64) -> Self {
        Self {
            regs: RtcRegisters::default(),
            latched: RtcRegisters::default(),
            anchor,
            subsecond_cycles: 0,
            last_latch_write: 0xFF,
        }
    }

    /// Write to 0x6000-0x7FFF. A 0 followed by a 1 copies the live counters
    /// into the latched set.
    pub fn write_latch(&mut self, value: u8) {
        if self.last_latch_write == 0x00 && value == 0x01 {
            self.latched = self.regs;
        }
        self.last_latch_write = value;
    }

    /// Read through the A000 window; always the latched copy.
    pub fn read(&self, reg: u8) -> u8 {
        self.latched.read(reg)
    }

    pub fn write(&mut self, reg: u8, value: u8) {
        match reg {
            0x08 => {
                self.regs.seconds = value & 0x3F;
                self.subsecond_cycles = 0;
            }
            0x09 => self.regs.minutes = value & 0x3F,
            0x0A => self.regs.hours = value & 0x1F,
            0x0B => self.regs.days = (self.regs.days & 0x0100) | value as u16,
            0x0C => self.regs.set_dh(value),
            _ => {}
        }
    }

    /// Set the live counters from the host, for a clock with no saved state.
    /// Halt is kept and the day carry cleared.
    pub fn set_time(&mut self, days: u16, hours: u8, minutes: u8, seconds: u8, now: u64) {
        self.regs.days = days & 0x01FF;
        self.regs.hours = hours.min(23);
        self.regs.minutes = minutes.min(59);
        self.regs.seconds = seconds.min(59);
        self.regs.carry = false;
        self.subsecond_cycles = 0;
        self.anchor = now;
    }

    /// Advance by emulated wall-time cycles (single-speed dots).
    pub fn step(&mut self, cycles: u32) {
        if self.regs.halt {
            return;
        }
        let total = self.subsecond_cycles as u64 + cycles as u64;
        self.subsecond_cycles = (total % CLOCK_HZ as u64) as u32;
        let seconds = total / CLOCK_HZ as u64;
        if seconds > 0 {
            self.advance_seconds(seconds);
        }
    }

    /// Apply the real time elapsed since the anchor, then move the anchor to
    /// `now`. A clock that went backwards advances nothing.
    pub fn catch_up(&mut self, now: u64) {
        let mut delta = now.saturating_sub(self.anchor);
        if delta > MAX_CATCH_UP_SECONDS {
            warn!("RTC catch-up of {delta}s clamped to {MAX_CATCH_UP_SECONDS}s");
            delta = MAX_CATCH_UP_SECONDS;
        }
        if !self.regs.halt && delta > 0 {
            self.advance_seconds(delta);
        }
        self.anchor = now;
    }

    pub fn anchor(&self) -> u64 {
        self.anchor
    }

    pub fn set_anchor(&mut self, now: u64) {
        self.anchor = now;
    }

    fn advance_seconds(&mut self, mut seconds: u64) {
        // Whole days first so a large catch-up stays cheap.
        const DAY: u64 = 86_400;
        if self.regs.seconds <= 59 && self.regs.minutes <= 59 && self.regs.hours <= 23 {
            let total_days = self.regs.days as u64 + seconds / DAY;
            if total_days > 0x01FF {
                self.regs.carry = true;
            }
            self.regs.days = (total_days & 0x01FF) as u16;
            seconds %= DAY;
        }
        while seconds > 0 {
            let until_minute = self.seconds_until_minute_tick();
            if seconds < until_minute {
                self.regs.seconds = ((self.regs.seconds as u64 + seconds) & 0x3F) as u8;
                return;
            }
            seconds -= until_minute;
            self.regs.seconds = 0;
            self.minute_tick();
        }
    }

    /// Out-of-range seconds count up to 63, wrap to 0 and only then tick the
    /// minute on the following roll-over.
    fn seconds_until_minute_tick(&self) -> u64 {
        let sec = self.regs.seconds as u64;
        if sec <= 59 { 60 - sec } else { (64 - sec) + 60 }
    }

    fn minute_tick(&mut self) {
        if self.regs.minutes == 59 {
            self.regs.minutes = 0;
            self.hour_tick();
        } else {
            self.regs.minutes = (self.regs.minutes + 1) & 0x3F;
        }
    }

    fn hour_tick(&mut self) {
        if self.regs.hours == 23 {
            self.regs.hours = 0;
            self.day_tick();
        } else {
            self.regs.hours = (self.regs.hours + 1) & 0x1F;
        }
    }

    fn day_tick(&mut self) {
        if self.regs.days >= 0x01FF {
            self.regs.days = 0;
            self.regs.carry = true;
        } else {
            self.regs.days += 1;
        }
    }

    /// Battery-save tail: live then latched s/m/h/dl/dh as `u32` LE words,
    /// followed by the anchor as `u64` LE.
    pub fn to_tail(&self) -> [u8; RTC_TAIL_LEN] {
        let mut out = [0u8; RTC_TAIL_LEN];
        let words = self.regs.to_words().into_iter().chain(self.latched.to_words());
        for (i, word) in words.enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        out[40..48].copy_from_slice(&self.anchor.to_le_bytes());
        out
    }

    pub fn load_tail(&mut self, tail: &[u8; RTC_TAIL_LEN]) {
        let word = |i: usize| {
            u32::from_le_bytes([tail[i * 4], tail[i * 4 + 1], tail[i * 4 + 2], tail[i * 4 + 3]])
        };
        self.regs = RtcRegisters::from_words([word(0), word(1), word(2), word(3), word(4)]);
        self.latched = RtcRegisters::from_words([word(5), word(6), word(7), word(8), word(9)]);
        let mut anchor = [0u8; 8];
        anchor.copy_from_slice(&tail[40..48]);
        self.anchor = u64::from_le_bytes(anchor);
        self.subsecond_cycles = 0;
    }

    pub fn save_state(&self, s: &mut Section) {
        s.bytes(&self.to_tail())
            .u32(self.subsecond_cycles)
            .u8(self.last_latch_write);
    }

    pub fn load_state(&mut self, r: &mut SectionReader) -> Result<()> {
        let mut tail = [0u8; RTC_TAIL_LEN];
        r.bytes_into(&mut tail)?;
        self.load_tail(&tail);
        self.subsecond_cycles = r.u32()? % CLOCK_HZ;
        self.last_latch_write = r.u8()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_through_invalid_values() {
        let mut rtc = Rtc::new(0);
        rtc.regs.seconds = 59;
        rtc.regs.minutes = 60;
        rtc.advance_seconds(1);
        assert_eq!(rtc.regs.seconds, 0);
        assert_eq!(rtc.regs.minutes, 61);

        rtc.regs.seconds = 63;
        rtc.regs.minutes = 5;
        rtc.advance_seconds(1);
        assert_eq!(rtc.regs.seconds, 0);
        assert_eq!(rtc.regs.minutes, 5);
    }

    #[test]
    fn day_overflow_sets_carry() {
        let mut rtc = Rtc::new(0);
        rtc.regs.seconds = 59;
        rtc.regs.minutes = 59;
        rtc.regs.hours = 23;
        rtc.regs.days = 0x01FF;
        rtc.advance_seconds(1);
        assert_eq!(rtc.regs.days, 0);
        assert!(rtc.regs.carry);
    }

    #[test]
    fn halt_freezes_emulated_time_and_catch_up() {
        let mut rtc = Rtc::new(100);
        rtc.write(0x0C, 0x40);
        rtc.step(CLOCK_HZ * 3);
        rtc.catch_up(200);
        assert_eq!(rtc.regs.seconds, 0);
        assert_eq!(rtc.anchor(), 200);

        rtc.write(0x0C, 0x00);
        rtc.step(CLOCK_HZ - 1);
        assert_eq!(rtc.regs.seconds, 0);
        rtc.step(1);
        assert_eq!(rtc.regs.seconds, 1);
    }

    #[test]
    fn latch_requires_zero_then_one() {
        let mut rtc = Rtc::new(0);
        rtc.write(0x08, 30);
        assert_eq!(rtc.read(0x08), 0);
        rtc.write_latch(0x01);
        assert_eq!(rtc.read(0x08), 0);
        rtc.write_latch(0x00);
        rtc.write_latch(0x01);
        assert_eq!(rtc.read(0x08), 30);
        rtc.write(0x08, 45);
        assert_eq!(rtc.read(0x08), 30, "reads stay on the latched copy");
    }

    #[test]
    fn catch_up_is_bounded_and_carries_days() {
        let mut rtc = Rtc::new(0);
        rtc.catch_up(3 * 86_400 + 3_661);
        assert_eq!(
            (rtc.regs.days, rtc.regs.hours, rtc.regs.minutes, rtc.regs.seconds),
            (3, 1, 1, 1)
        );

        let mut far = Rtc::new(0);
        far.catch_up(u64::MAX);
        assert!(far.regs.carry);
        assert_eq!(far.anchor(), u64::MAX);
    }

    #[test]
    fn tail_roundtrip_keeps_latched_copy() {
        let mut rtc = Rtc::new(1_700_000_000);
        rtc.write(0x0A, 13);
        rtc.write(0x0B, 0x2A);
        rtc.write(0x0C, 0x81);
        rtc.write_latch(0);
        rtc.write_latch(1);
        rtc.write(0x0A, 14);
        let tail = rtc.to_tail();

        let mut other = Rtc::new(0);
        other.load_tail(&tail);
        assert_eq!(other.regs, rtc.regs);
        assert_eq!(other.latched, rtc.latched);
        assert_eq!(other.anchor(), 1_700_000_000);
        assert_eq!(other.read(0x0A), 13);
        assert_eq!(other.read(0x0C) & 0xC1, 0x81);
    }
}
