#[cfg(feature = "apu-trace")]
use log::trace;

use crate::error::{CoreError, Result};
use crate::hardware::CLOCK_HZ;
use crate::state::{Section, SectionReader};

#[cfg(feature = "apu-trace")]
macro_rules! apu_trace {
    ($($arg:tt)*) => {
        trace!($($arg)*);
    };
}
#[cfg(not(feature = "apu-trace"))]
macro_rules! apu_trace {
    ($($arg:tt)*) => {};
}

// 512 Hz frame sequencer tick, in single-speed dots
const FRAME_SEQUENCER_PERIOD: u32 = 8192;
const VOLUME_FACTOR: i32 = 64;
const DC_FILTER_R: f32 = 0.999;

const MIN_SAMPLE_RATE: u32 = 8_000;
const MAX_SAMPLE_RATE: u32 = 192_000;
/// Longest run of dots averaged into one output sample.
const MAX_SAMPLE_DOTS: u32 = CLOCK_HZ.div_ceil(MIN_SAMPLE_RATE);
/// Largest magnitude [`Apu::mix`] can return on one side.
const MAX_MIX: i64 = 4 * 15 * 8 * VOLUME_FACTOR as i64 / 2;

const NR14: usize = 0x04;
const NR_COUNT: usize = 0x16;

const DUTY_TABLE: [[u8; 8]; 4] = [
    [0, 0, 0, 0, 0, 0, 0, 1], // 12.5%
    [1, 0, 0, 0, 0, 0, 0, 1], // 25%
    [1, 0, 0, 0, 0, 1, 1, 1], // 50%
    [0, 1, 1, 1, 1, 1, 1, 0], // 75%
];

#[derive(Default, Clone, Copy)]
struct Envelope {
    initial: u8,
    period: u8,
    add: bool,
    volume: u8,
    timer: u8,
}

impl Envelope {
    fn clock(&mut self) {
        if self.period == 0 {
            return;
        }
        if self.timer > 0 {
            self.timer -= 1;
        }
        if self.timer == 0 {
            self.timer = self.period;
            if self.add && self.volume < 15 {
                self.volume += 1;
            } else if !self.add && self.volume > 0 {
                self.volume -= 1;
            }
        }
    }

    fn write(&mut self, val: u8) {
        self.initial = val >> 4;
        self.period = val & 0x07;
        self.add = val & 0x08 != 0;
    }

    fn trigger(&mut self) {
        self.volume = self.initial;
        self.timer = self.period;
    }

    fn save(&self, s: &mut Section) {
        s.u8(self.initial)
            .u8(self.period)
            .bool(self.add)
            .u8(self.volume)
            .u8(self.timer);
    }

    fn load(&mut self, r: &mut SectionReader) -> Result<()> {
        self.initial = r.u8()? & 0x0F;
        self.period = r.u8()? & 0x07;
        self.add = r.bool()?;
        self.volume = r.u8()? & 0x0F;
        self.timer = r.u8()? & 0x07;
        Ok(())
    }
}

// Channel 1 frequency sweep.
#[derive(Default, Clone)]
struct Sweep {
    period: u8,
    negate: bool,
    shift: u8,
    timer: u8,
    shadow: u16,
    enabled: bool,
    /// A subtraction was computed since the last trigger; clearing the negate
    /// bit afterwards silences the channel.
    neg_used: bool,
}

impl Sweep {
    fn calculate(&mut self) -> u16 {
        let delta = self.shadow >> self.shift;
        if self.negate {
            self.neg_used = true;
            self.shadow.wrapping_sub(delta)
        } else {
            self.shadow.wrapping_add(delta)
        }
    }

    /// Returns true when the write disables the channel.
    fn write(&mut self, val: u8) -> bool {
        let was_negate = self.negate;
        self.period = (val >> 4) & 0x07;
        self.negate = val & 0x08 != 0;
        self.shift = val & 0x07;
        was_negate && !self.negate && self.neg_used
    }

    fn reload_timer(&mut self) {
        self.timer = if self.period == 0 { 8 } else { self.period };
    }
}

#[derive(Default, Clone)]
struct SquareChannel {
    enabled: bool,
    dac_enabled: bool,
    length: u16,
    length_enable: bool,
    duty: u8,
    duty_pos: u8,
    frequency: u16,
    timer: u32,
    envelope: Envelope,
    sweep: Option<Sweep>,
}

impl SquareChannel {
    fn new(with_sweep: bool) -> Self {
        Self {
            sweep: with_sweep.then(Sweep::default),
            ..Default::default()
        }
    }

    fn period(&self) -> u32 {
        (2048 - self.frequency as u32) * 4
    }

    fn step(&mut self, mut dots: u32) {
        if !self.enabled {
            return;
        }
        while self.timer <= dots {
            dots -= self.timer;
            self.timer = self.period();
            self.duty_pos = (self.duty_pos + 1) & 7;
        }
        self.timer -= dots;
    }

    fn output(&self) -> u8 {
        if !self.enabled {
            return 0;
        }
        DUTY_TABLE[self.duty as usize][self.duty_pos as usize] * self.envelope.volume
    }

    fn clock_length(&mut self) {
        if self.length_enable && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.enabled = false;
            }
        }
    }

    fn clock_sweep(&mut self) {
        let Some(sweep) = self.sweep.as_mut() else {
            return;
        };
        if sweep.timer > 0 {
            sweep.timer -= 1;
        }
        if sweep.timer != 0 {
            return;
        }
        sweep.reload_timer();
        if !sweep.enabled || sweep.period == 0 {
            return;
        }
        let new_freq = sweep.calculate();
        if new_freq > 2047 {
            self.enabled = false;
        } else if sweep.shift != 0 {
            sweep.shadow = new_freq;
            self.frequency = new_freq;
            // Second overflow check with the new shadow value.
            if sweep.calculate() > 2047 {
                self.enabled = false;
            }
        }
    }

    fn trigger(&mut self) {
        self.enabled = self.dac_enabled;
        self.timer = self.period();
        self.envelope.trigger();
        if let Some(sweep) = self.sweep.as_mut() {
            sweep.shadow = self.frequency;
            sweep.neg_used = false;
            sweep.reload_timer();
            sweep.enabled = sweep.period != 0 || sweep.shift != 0;
            if sweep.shift != 0 && sweep.calculate() > 2047 {
                self.enabled = false;
            }
        }
    }

    fn save(&self, s: &mut Section) {
        s.bool(self.enabled)
            .bool(self.dac_enabled)
            .u16(self.length)
            .bool(self.length_enable)
            .u8(self.duty)
            .u8(self.duty_pos)
            .u16(self.frequency)
            .u32(self.timer);
        self.envelope.save(s);
        if let Some(sw) = &self.sweep {
            s.u8(sw.period)
                .bool(sw.negate)
                .u8(sw.shift)
                .u8(sw.timer)
                .u16(sw.shadow)
                .bool(sw.enabled)
                .bool(sw.neg_used);
        }
    }

    fn load(&mut self, r: &mut SectionReader) -> Result<()> {
        self.enabled = r.bool()?;
        self.dac_enabled = r.bool()?;
        self.length = r.u16()?.min(64);
        self.length_enable = r.bool()?;
        self.duty = r.u8()? & 0x03;
        self.duty_pos = r.u8()? & 0x07;
        self.frequency = r.u16()? & 0x07FF;
        self.timer = r.u32()?.min(self.period());
        self.envelope.load(r)?;
        if let Some(sw) = self.sweep.as_mut() {
            sw.period = r.u8()? & 0x07;
            sw.negate = r.bool()?;
            sw.shift = r.u8()? & 0x07;
            sw.timer = r.u8()? & 0x0F;
            sw.shadow = r.u16()? & 0x0FFF;
            sw.enabled = r.bool()?;
            sw.neg_used = r.bool()?;
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
struct WaveChannel {
    enabled: bool,
    dac_enabled: bool,
    length: u16,
    length_enable: bool,
    volume_code: u8,
    position: u8,
    sample_buffer: u8,
    frequency: u16,
    timer: u32,
}

impl WaveChannel {
    fn period(&self) -> u32 {
        (2048 - self.frequency as u32) * 2
    }

    fn step(&mut self, mut dots: u32, wave_ram: &[u8; 0x10]) {
        if !self.enabled {
            return;
        }
        while self.timer <= dots {
            dots -= self.timer;
            self.timer = self.period();
            self.position = (self.position + 1) & 0x1F;
            let byte = wave_ram[(self.position / 2) as usize];
            self.sample_buffer = if self.position & 1 == 0 {
                byte >> 4
            } else {
                byte & 0x0F
            };
        }
        self.timer -= dots;
    }

    fn output(&self) -> u8 {
        if !self.enabled {
            return 0;
        }
        match self.volume_code {
            1 => self.sample_buffer,
            2 => self.sample_buffer >> 1,
            3 => self.sample_buffer >> 2,
            _ => 0,
        }
    }

    fn clock_length(&mut self) {
        if self.length_enable && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.enabled = false;
            }
        }
    }

    fn trigger(&mut self) {
        self.enabled = self.dac_enabled;
        self.position = 0;
        // The first sample played is the stale buffer; the timer gets a few
        // extra dots before the first fetch.
        self.timer = self.period() + 6;
    }

    fn save(&self, s: &mut Section) {
        s.bool(self.enabled)
            .bool(self.dac_enabled)
            .u16(self.length)
            .bool(self.length_enable)
            .u8(self.volume_code)
            .u8(self.position)
            .u8(self.sample_buffer)
            .u16(self.frequency)
            .u32(self.timer);
    }

    fn load(&mut self, r: &mut SectionReader) -> Result<()> {
        self.enabled = r.bool()?;
        self.dac_enabled = r.bool()?;
        self.length = r.u16()?.min(256);
        self.length_enable = r.bool()?;
        self.volume_code = r.u8()? & 0x03;
        self.position = r.u8()? & 0x1F;
        self.sample_buffer = r.u8()? & 0x0F;
        self.frequency = r.u16()? & 0x07FF;
        self.timer = r.u32()?.min(self.period() + 6);
        Ok(())
    }
}

#[derive(Default, Clone)]
struct NoiseChannel {
    enabled: bool,
    dac_enabled: bool,
    length: u16,
    length_enable: bool,
    envelope: Envelope,
    clock_shift: u8,
    divisor: u8,
    width7: bool,
    lfsr: u16,
    timer: u32,
}

impl NoiseChannel {
    fn period(&self) -> u32 {
        let r = match self.divisor {
            0 => 8,
            d => d as u32 * 16,
        };
        r << self.clock_shift
    }

    fn step(&mut self, mut dots: u32) {
        if !self.enabled {
            return;
        }
        while self.timer <= dots {
            dots -= self.timer;
            self.timer = self.period();
            let bit = (self.lfsr & 1) ^ ((self.lfsr >> 1) & 1);
            self.lfsr >>= 1;
            self.lfsr |= bit << 14;
            if self.width7 {
                self.lfsr = (self.lfsr & !0x40) | (bit << 6);
            }
        }
        self.timer -= dots;
    }

    fn output(&self) -> u8 {
        if !self.enabled || self.lfsr & 1 != 0 {
            return 0;
        }
        self.envelope.volume
    }

    fn clock_length(&mut self) {
        if self.length_enable && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.enabled = false;
            }
        }
    }

    fn trigger(&mut self) {
        self.enabled = self.dac_enabled;
        self.lfsr = 0x7FFF;
        self.timer = self.period();
        self.envelope.trigger();
    }

    fn save(&self, s: &mut Section) {
        s.bool(self.enabled)
            .bool(self.dac_enabled)
            .u16(self.length)
            .bool(self.length_enable);
        self.envelope.save(s);
        s.u8(self.clock_shift)
            .u8(self.divisor)
            .bool(self.width7)
            .u16(self.lfsr)
            .u32(self.timer);
    }

    fn load(&mut self, r: &mut SectionReader) -> Result<()> {
        self.enabled = r.bool()?;
        self.dac_enabled = r.bool()?;
        self.length = r.u16()?.min(64);
        self.length_enable = r.bool()?;
        self.envelope.load(r)?;
        self.clock_shift = r.u8()? & 0x0F;
        self.divisor = r.u8()? & 0x07;
        self.width7 = r.bool()?;
        self.lfsr = r.u16()? & 0x7FFF;
        self.timer = r.u32()?.min(self.period());
        Ok(())
    }
}

#[derive(Clone)]
pub struct Apu {
    ch1: SquareChannel,
    ch2: SquareChannel,
    ch3: WaveChannel,
    ch4: NoiseChannel,
    wave_ram: [u8; 0x10],
    /// Raw NR10..NR51 as last written.
    regs: [u8; NR_COUNT],
    nr50: u8,
    nr51: u8,
    powered: bool,
    cgb: bool,

    /// Next frame sequencer step to run (0..=7).
    sequencer_step: u8,
    sequencer_countdown: u32,

    sample_rate: u32,
    /// Fractional resampler position, in units of `1 / CLOCK_HZ` samples.
    sample_phase: u32,
    acc_left: i64,
    acc_right: i64,
    acc_dots: u32,
    hp_prev_input_left: f32,
    hp_prev_output_left: f32,
    hp_prev_input_right: f32,
    hp_prev_output_right: f32,

    /// Mixed frames produced since the last drain.
    samples: Vec<(i16, i16)>,
}

impl Apu {
    pub fn new(cgb: bool, sample_rate: u32) -> Self {
        let sample_rate = sample_rate.clamp(MIN_SAMPLE_RATE, MAX_SAMPLE_RATE);
        Self {
            ch1: SquareChannel::new(true),
            ch2: SquareChannel::new(false),
            ch3: WaveChannel::default(),
            ch4: NoiseChannel::default(),
            wave_ram: [0; 0x10],
            regs: [0; NR_COUNT],
            nr50: 0,
            nr51: 0,
            powered: false,
            cgb,
            sequencer_step: 0,
            sequencer_countdown: FRAME_SEQUENCER_PERIOD,
            sample_rate,
            sample_phase: 0,
            acc_left: 0,
            acc_right: 0,
            acc_dots: 0,
            hp_prev_input_left: 0.0,
            hp_prev_output_left: 0.0,
            hp_prev_input_right: 0.0,
            hp_prev_output_right: 0.0,
            // About a tenth of a second of headroom between drains.
            samples: Vec::with_capacity(sample_rate as usize / 10 + 16),
        }
    }

    /// Register state the boot ROM leaves behind: powered, panned, channel 1
    /// finished its chime with the envelope at zero.
    pub fn apply_boot_state(&mut self) {
        self.write_nr52(0x80);
        self.write_reg(0xFF10, 0x80);
        self.write_reg(0xFF11, 0x80);
        self.write_reg(0xFF12, 0xF3);
        self.write_reg(0xFF24, 0x77);
        self.write_reg(0xFF25, 0xF3);
        self.regs[NR14] = 0x87;
        self.ch1.enabled = !self.cgb;
        self.ch1.length = 0;
        self.ch1.envelope.volume = 0;
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Hand the mixed frames to the caller, oldest first.
    pub fn drain_samples(&mut self) -> std::vec::Drain<'_, (i16, i16)> {
        self.samples.drain(..)
    }

    fn read_mask(addr: u16) -> u8 {
        match addr {
            0xFF10 => 0x80,
            0xFF11 | 0xFF16 => 0x3F,
            0xFF13 | 0xFF18 | 0xFF1B | 0xFF1D | 0xFF20 => 0xFF,
            0xFF14 | 0xFF19 | 0xFF1E | 0xFF23 => 0xBF,
            0xFF1A => 0x7F,
            0xFF1C => 0x9F,
            0xFF12 | 0xFF17 | 0xFF21 | 0xFF22 | 0xFF24 | 0xFF25 => 0x00,
            _ => 0xFF,
        }
    }

    pub fn read_reg(&self, addr: u16) -> u8 {
        match addr {
            0xFF26 => {
                let mut val = 0x70;
                if self.powered {
                    val |= 0x80;
                }
                if self.ch1.enabled {
                    val |= 0x01;
                }
                if self.ch2.enabled {
                    val |= 0x02;
                }
                if self.ch3.enabled {
                    val |= 0x04;
                }
                if self.ch4.enabled {
                    val |= 0x08;
                }
                val
            }
            0xFF30..=0xFF3F => {
                if self.ch3.enabled {
                    if self.cgb {
                        0xFF
                    } else {
                        self.wave_ram[(self.ch3.position / 2) as usize]
                    }
                } else {
                    self.wave_ram[(addr - 0xFF30) as usize]
                }
            }
            0xFF10..=0xFF25 => self.regs[(addr - 0xFF10) as usize] | Self::read_mask(addr),
            _ => 0xFF,
        }
    }

    pub fn write_reg(&mut self, addr: u16, val: u8) {
        if let 0xFF30..=0xFF3F = addr {
            let idx = if self.ch3.enabled {
                (self.ch3.position / 2) as usize
            } else {
                (addr - 0xFF30) as usize
            };
            self.wave_ram[idx] = val;
            return;
        }
        if addr == 0xFF26 {
            self.write_nr52(val);
            return;
        }
        if !(0xFF10..=0xFF25).contains(&addr) {
            return;
        }
        if !self.powered {
            // Only the length counters stay writable while powered off.
            match addr {
                0xFF11 => self.ch1.length = 64 - (val & 0x3F) as u16,
                0xFF16 => self.ch2.length = 64 - (val & 0x3F) as u16,
                0xFF1B => self.ch3.length = 256 - val as u16,
                0xFF20 => self.ch4.length = 64 - (val & 0x3F) as u16,
                _ => {}
            }
            return;
        }

        self.regs[(addr - 0xFF10) as usize] = val;
        match addr {
            0xFF10 => {
                if let Some(sweep) = self.ch1.sweep.as_mut() {
                    if sweep.write(val) {
                        self.ch1.enabled = false;
                    }
                }
            }
            0xFF11 => {
                self.ch1.duty = val >> 6;
                self.ch1.length = 64 - (val & 0x3F) as u16;
            }
            0xFF12 => {
                self.ch1.envelope.write(val);
                self.ch1.dac_enabled = val & 0xF8 != 0;
                if !self.ch1.dac_enabled {
                    self.ch1.enabled = false;
                }
            }
            0xFF13 => self.ch1.frequency = (self.ch1.frequency & 0x700) | val as u16,
            0xFF14 => {
                self.ch1.frequency = (self.ch1.frequency & 0xFF) | (((val & 0x07) as u16) << 8);
                let trigger = val & 0x80 != 0;
                let extra = self.length_enable_edge(self.ch1.length_enable, val);
                self.ch1.length_enable = val & 0x40 != 0;
                if extra {
                    self.ch1.clock_length();
                }
                if trigger {
                    if self.ch1.length == 0 {
                        self.ch1.length = self.reload_length(64, self.ch1.length_enable);
                    }
                    self.ch1.trigger();
                    apu_trace!("APU ch1 trigger freq={:#05X}", self.ch1.frequency);
                }
            }
            0xFF16 => {
                self.ch2.duty = val >> 6;
                self.ch2.length = 64 - (val & 0x3F) as u16;
            }
            0xFF17 => {
                self.ch2.envelope.write(val);
                self.ch2.dac_enabled = val & 0xF8 != 0;
                if !self.ch2.dac_enabled {
                    self.ch2.enabled = false;
                }
            }
            0xFF18 => self.ch2.frequency = (self.ch2.frequency & 0x700) | val as u16,
            0xFF19 => {
                self.ch2.frequency = (self.ch2.frequency & 0xFF) | (((val & 0x07) as u16) << 8);
                let extra = self.length_enable_edge(self.ch2.length_enable, val);
                self.ch2.length_enable = val & 0x40 != 0;
                if extra {
                    self.ch2.clock_length();
                }
                if val & 0x80 != 0 {
                    if self.ch2.length == 0 {
                        self.ch2.length = self.reload_length(64, self.ch2.length_enable);
                    }
                    self.ch2.trigger();
                    apu_trace!("APU ch2 trigger freq={:#05X}", self.ch2.frequency);
                }
            }
            0xFF1A => {
                self.ch3.dac_enabled = val & 0x80 != 0;
                if !self.ch3.dac_enabled {
                    self.ch3.enabled = false;
                }
            }
            0xFF1B => self.ch3.length = 256 - val as u16,
            0xFF1C => self.ch3.volume_code = (val >> 5) & 0x03,
            0xFF1D => self.ch3.frequency = (self.ch3.frequency & 0x700) | val as u16,
            0xFF1E => {
                self.ch3.frequency = (self.ch3.frequency & 0xFF) | (((val & 0x07) as u16) << 8);
                let extra = self.length_enable_edge(self.ch3.length_enable, val);
                self.ch3.length_enable = val & 0x40 != 0;
                if extra {
                    self.ch3.clock_length();
                }
                if val & 0x80 != 0 {
                    if self.ch3.length == 0 {
                        self.ch3.length = self.reload_length(256, self.ch3.length_enable);
                    }
                    self.ch3.trigger();
                    apu_trace!("APU ch3 trigger freq={:#05X}", self.ch3.frequency);
                }
            }
            0xFF20 => self.ch4.length = 64 - (val & 0x3F) as u16,
            0xFF21 => {
                self.ch4.envelope.write(val);
                self.ch4.dac_enabled = val & 0xF8 != 0;
                if !self.ch4.dac_enabled {
                    self.ch4.enabled = false;
                }
            }
            0xFF22 => {
                self.ch4.clock_shift = val >> 4;
                self.ch4.width7 = val & 0x08 != 0;
                self.ch4.divisor = val & 0x07;
            }
            0xFF23 => {
                let extra = self.length_enable_edge(self.ch4.length_enable, val);
                self.ch4.length_enable = val & 0x40 != 0;
                if extra {
                    self.ch4.clock_length();
                }
                if val & 0x80 != 0 {
                    if self.ch4.length == 0 {
                        self.ch4.length = self.reload_length(64, self.ch4.length_enable);
                    }
                    self.ch4.trigger();
                    apu_trace!("APU ch4 trigger div={} shift={}", self.ch4.divisor, self.ch4.clock_shift);
                }
            }
            0xFF24 => self.nr50 = val,
            0xFF25 => self.nr51 = val,
            _ => {}
        }
    }

    /// Enabling the length counter while the sequencer's next step will not
    /// clock lengths gives the counter one extra clock immediately.
    fn length_enable_edge(&self, was_enabled: bool, val: u8) -> bool {
        !was_enabled && val & 0x40 != 0 && self.sequencer_step & 1 == 1
    }

    fn reload_length(&self, full: u16, length_enable: bool) -> u16 {
        if length_enable && self.sequencer_step & 1 == 1 {
            full - 1
        } else {
            full
        }
    }

    fn write_nr52(&mut self, val: u8) {
        let on = val & 0x80 != 0;
        if self.powered && !on {
            self.power_off();
        } else if !self.powered && on {
            self.powered = true;
            self.sequencer_step = 0;
            self.sequencer_countdown = FRAME_SEQUENCER_PERIOD;
            self.ch1.duty_pos = 0;
            self.ch2.duty_pos = 0;
            self.ch3.sample_buffer = 0;
        }
    }

    fn power_off(&mut self) {
        // DMG keeps its length counters across a power cycle.
        let lengths = [
            self.ch1.length,
            self.ch2.length,
            self.ch3.length,
            self.ch4.length,
        ];
        self.ch1 = SquareChannel::new(true);
        self.ch2 = SquareChannel::new(false);
        self.ch3 = WaveChannel::default();
        self.ch4 = NoiseChannel::default();
        if !self.cgb {
            self.ch1.length = lengths[0];
            self.ch2.length = lengths[1];
            self.ch3.length = lengths[2];
            self.ch4.length = lengths[3];
        }
        self.regs.fill(0);
        self.nr50 = 0;
        self.nr51 = 0;
        self.powered = false;
    }

    fn clock_frame_sequencer(&mut self) {
        let step = self.sequencer_step;
        self.sequencer_step = (step + 1) & 7;
        if step & 1 == 0 {
            self.ch1.clock_length();
            self.ch2.clock_length();
            self.ch3.clock_length();
            self.ch4.clock_length();
        }
        if step == 2 || step == 6 {
            self.ch1.clock_sweep();
            self.mirror_ch1_frequency();
        }
        if step == 7 {
            self.ch1.envelope.clock();
            self.ch2.envelope.clock();
            self.ch4.envelope.clock();
        }
    }

    /// Sweep updates show through NR13/NR14.
    fn mirror_ch1_frequency(&mut self) {
        let freq = self.ch1.frequency;
        self.regs[NR14 - 1] = (freq & 0xFF) as u8;
        self.regs[NR14] = (self.regs[NR14] & !0x07) | ((freq >> 8) as u8 & 0x07);
    }

    /// Advance by `dots` single-speed T-cycles.
    pub fn step(&mut self, dots: u32) {
        let mut remaining = dots;
        while remaining > 0 {
            let to_sample = (CLOCK_HZ - self.sample_phase)
                .div_ceil(self.sample_rate)
                .max(1);
            let mut run = remaining.min(to_sample);
            if self.powered {
                run = run.min(self.sequencer_countdown);
            }

            let (left, right) = self.mix();
            self.acc_left += left as i64 * run as i64;
            self.acc_right += right as i64 * run as i64;
            self.acc_dots += run;

            if self.powered {
                self.ch1.step(run);
                self.ch2.step(run);
                self.ch3.step(run, &self.wave_ram);
                self.ch4.step(run);
                self.sequencer_countdown -= run;
                if self.sequencer_countdown == 0 {
                    self.sequencer_countdown = FRAME_SEQUENCER_PERIOD;
                    self.clock_frame_sequencer();
                }
            }

            self.sample_phase += run * self.sample_rate;
            if self.sample_phase >= CLOCK_HZ {
                self.sample_phase -= CLOCK_HZ;
                self.emit_sample();
            }
            remaining -= run;
        }
    }

    fn emit_sample(&mut self) {
        let n = self.acc_dots.max(1) as i64;
        let left = (self.acc_left / n) as i16;
        let right = (self.acc_right / n) as i16;
        self.acc_left = 0;
        self.acc_right = 0;
        self.acc_dots = 0;
        let frame = self.dc_block(left, right);
        self.samples.push(frame);
    }

    /// Digital channel outputs through the DACs, panning and master volume.
    fn mix(&self) -> (i32, i32) {
        if !self.powered {
            return (0, 0);
        }
        let dac = |enabled: bool, out: u8| -> i32 {
            if enabled { out as i32 * 2 - 15 } else { 0 }
        };
        let chans = [
            dac(self.ch1.dac_enabled, self.ch1.output()),
            dac(self.ch2.dac_enabled, self.ch2.output()),
            dac(self.ch3.dac_enabled, self.ch3.output()),
            dac(self.ch4.dac_enabled, self.ch4.output()),
        ];

        let mut left = 0i32;
        let mut right = 0i32;
        for (i, &c) in chans.iter().enumerate() {
            if self.nr51 & (0x10 << i) != 0 {
                left += c;
            }
            if self.nr51 & (0x01 << i) != 0 {
                right += c;
            }
        }

        let left_vol = ((self.nr50 >> 4) & 0x07) as i32 + 1;
        let right_vol = (self.nr50 & 0x07) as i32 + 1;
        (
            left * left_vol * VOLUME_FACTOR / 2,
            right * right_vol * VOLUME_FACTOR / 2,
        )
    }

    fn dc_block(&mut self, left: i16, right: i16) -> (i16, i16) {
        let left_in = left as f32;
        let right_in = right as f32;
        let left_out = left_in - self.hp_prev_input_left + DC_FILTER_R * self.hp_prev_output_left;
        let right_out =
            right_in - self.hp_prev_input_right + DC_FILTER_R * self.hp_prev_output_right;
        self.hp_prev_input_left = left_in;
        self.hp_prev_output_left = left_out;
        self.hp_prev_input_right = right_in;
        self.hp_prev_output_right = right_out;
        (
            left_out.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16,
            right_out.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16,
        )
    }

    pub fn save_state(&self, s: &mut Section) {
        self.ch1.save(s);
        self.ch2.save(s);
        self.ch3.save(s);
        self.ch4.save(s);
        s.bytes(&self.wave_ram)
            .bytes(&self.regs)
            .u8(self.nr50)
            .u8(self.nr51)
            .bool(self.powered)
            .u8(self.sequencer_step)
            .u32(self.sequencer_countdown)
            .u32(self.sample_phase)
            .u64(self.acc_left as u64)
            .u64(self.acc_right as u64)
            .u32(self.acc_dots)
            .f32(self.hp_prev_input_left)
            .f32(self.hp_prev_output_left)
            .f32(self.hp_prev_input_right)
            .f32(self.hp_prev_output_right);
    }

    /// The resampler phase is only meaningful at the saved sample rate; a
    /// session with a different rate restarts it.
    pub fn load_state(&mut self, r: &mut SectionReader) -> Result<()> {
        self.ch1.load(r)?;
        self.ch2.load(r)?;
        self.ch3.load(r)?;
        self.ch4.load(r)?;
        r.bytes_into(&mut self.wave_ram)?;
        r.bytes_into(&mut self.regs)?;
        self.nr50 = r.u8()?;
        self.nr51 = r.u8()?;
        self.powered = r.bool()?;
        self.sequencer_step = r.u8()? & 7;
        self.sequencer_countdown = r.u32()?.clamp(1, FRAME_SEQUENCER_PERIOD);
        self.sample_phase = r.u32()? % CLOCK_HZ;
        let acc_left = r.u64()? as i64;
        let acc_right = r.u64()? as i64;
        self.acc_dots = r.u32()?;
        if self.acc_dots > MAX_SAMPLE_DOTS {
            return Err(CoreError::SaveStateIncompatible("resampler out of range"));
        }
        let bound = self.acc_dots as i64 * MAX_MIX;
        self.acc_left = acc_left.clamp(-bound, bound);
        self.acc_right = acc_right.clamp(-bound, bound);
        self.hp_prev_input_left = r.f32()?;
        self.hp_prev_output_left = r.f32()?;
        self.hp_prev_input_right = r.f32()?;
        self.hp_prev_output_right = r.f32()?;
        self.samples.clear();
        Ok(())
    }
}
