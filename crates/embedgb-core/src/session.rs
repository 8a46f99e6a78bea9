//! Frame driver: converts host frame deltas into emulated cycles and owns the
//! persistence and audio surfaces the host talks to.

use log::{info, warn};

use crate::{
    audio_queue::{AudioConsumer, AudioProducer, audio_queue},
    cartridge::{Cartridge, CgbSupport},
    config::SessionConfig,
    error::{CoreError, Result},
    gameboy::GameBoy,
    hardware::{CLOCK_HZ, CYCLES_PER_FRAME, Model},
    host::Host,
};

/// One running game. The host drives it with [`Session::tick`] once per host
/// frame and receives scanlines through its [`Host`] implementation.
pub struct Session<H: Host> {
    gb: GameBoy,
    cart: Cartridge,
    host: H,
    config: SessionConfig,
    buttons: u8,
    failure: Option<CoreError>,
    audio_tx: AudioProducer,
    audio_rx: AudioConsumer,
    next_drop_warning: u64,
    battery_dirty: bool,
    frames: u64,
    last_ppu_frames: u64,
    /// Emulated dots since the last cartridge RAM write.
    dots_since_ram_write: u64,
}

impl<H: Host> Session<H> {
    /// Start a session with default settings for `model`.
    ///
    /// `save_ram` is a battery image as produced by
    /// [`Session::serialize_save_ram`]; `save_state` a blob from
    /// [`Session::serialize_state`], applied after the battery image.
    pub fn new(
        cart: Cartridge,
        save_ram: Option<&[u8]>,
        save_state: Option<&[u8]>,
        model: Model,
        host: H,
    ) -> Result<Self> {
        Self::with_config(cart, save_ram, save_state, SessionConfig::with_model(model), host)
    }

    pub fn with_config(
        cart: Cartridge,
        save_ram: Option<&[u8]>,
        save_state: Option<&[u8]>,
        config: SessionConfig,
        host: H,
    ) -> Result<Self> {
        let model = config.model;
        if cart.cgb_support() == CgbSupport::Only && !model.is_cgb() {
            warn!("'{}' is CGB-only; running it on a DMG model", cart.title());
        }

        let now = host.unix_time();
        let mut gb = GameBoy::new(
            &cart,
            model,
            config.boot_rom.clone(),
            config.sample_rate,
            now,
        )?;
        if let Some(data) = save_ram {
            gb.mmu.mbc.load_battery_image(data, now)?;
        }
        if let Some(data) = save_state {
            gb.load_state(data)?;
        }

        let (audio_tx, audio_rx) = audio_queue(config.audio_capacity_frames());
        info!(
            "Session started: '{}' on {:?} ({} Hz audio, {} frame ring)",
            cart.title(),
            model,
            gb.mmu.apu.sample_rate(),
            audio_tx.capacity_frames()
        );

        let last_ppu_frames = gb.mmu.ppu.frames();
        Ok(Self {
            gb,
            cart,
            host,
            config,
            buttons: 0,
            failure: None,
            audio_tx,
            audio_rx,
            next_drop_warning: 1,
            battery_dirty: false,
            frames: 0,
            last_ppu_frames,
            dots_since_ram_write: 0,
        })
    }

    /// Button mask for the next tick; see [`crate::joypad::buttons`].
    pub fn set_buttons(&mut self, mask: u8) {
        self.buttons = mask;
    }

    fn budget(&self, dt: f64) -> u32 {
        let ceiling = (self.config.max_catch_up.max(0.0) as f64 * CYCLES_PER_FRAME as f64) as u32;
        let cycles = (dt * CLOCK_HZ as f64).round();
        if cycles.is_nan() || cycles <= 0.0 {
            0
        } else {
            (cycles.min(ceiling as f64)) as u32
        }
    }

    /// Advance emulation by `dt_seconds` of host time.
    ///
    /// A run-time failure stops the session: this tick and every later one
    /// return the same error.
    pub fn tick(&mut self, dt_seconds: f64) -> Result<()> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }

        let mmu = &mut self.gb.mmu;
        mmu.joypad.set_buttons(self.buttons, &mut mmu.if_reg);

        let budget = self.budget(dt_seconds);
        let result = self.gb.run_for(budget, &mut self.host);

        self.push_audio();
        self.update_persistence_flags(budget);

        if let Err(err) = result {
            warn!("Session stopped: {err}");
            self.failure = Some(err.clone());
            return Err(err);
        }
        Ok(())
    }

    fn push_audio(&mut self) {
        for (left, right) in self.gb.mmu.apu.drain_samples() {
            self.audio_tx.push_stereo(left, right);
        }
        let dropped = self.audio_tx.dropped();
        if dropped >= self.next_drop_warning {
            warn!("Audio ring overflow: {dropped} frames dropped so far");
            self.next_drop_warning = dropped.saturating_mul(2);
        }
    }

    /// Counts emulated time rather than V-blanks so an idle save still comes
    /// due while the game keeps the LCD off.
    fn update_persistence_flags(&mut self, dots: u32) {
        let ppu_frames = self.gb.mmu.ppu.frames();
        let elapsed = ppu_frames.wrapping_sub(self.last_ppu_frames);
        self.last_ppu_frames = ppu_frames;
        self.frames += elapsed;

        if self.gb.mmu.mbc.take_ram_written() {
            self.dots_since_ram_write = 0;
            if self.cart.features().battery {
                self.battery_dirty = true;
            }
        } else {
            self.dots_since_ram_write += dots as u64;
        }
    }

    /// Power-cycle the console. Cartridge RAM and the clock are kept; a
    /// stopped session runs again.
    pub fn reset(&mut self) -> Result<()> {
        let now = self.host.unix_time();
        let mut gb = GameBoy::new(
            &self.cart,
            self.config.model,
            self.config.boot_rom.clone(),
            self.config.sample_rate,
            now,
        )?;
        std::mem::swap(&mut gb.mmu.mbc, &mut self.gb.mmu.mbc);
        gb.mmu.mbc.reset(&self.cart);
        self.gb = gb;
        self.failure = None;
        self.last_ppu_frames = self.gb.mmu.ppu.frames();
        info!("Session reset: '{}'", self.cart.title());
        Ok(())
    }

    /// Seed the cartridge clock, for a timer cartridge started without a
    /// battery image. Returns false if the cartridge has no clock.
    pub fn set_rtc(&mut self, days: u16, hours: u8, minutes: u8, seconds: u8) -> bool {
        let now = self.host.unix_time();
        self.gb
            .mmu
            .mbc
            .set_rtc(days, hours, minutes, seconds, now)
    }

    /// Battery image for the host to store. Clears the dirty flag.
    pub fn serialize_save_ram(&mut self) -> Vec<u8> {
        self.battery_dirty = false;
        let now = self.host.unix_time();
        self.gb.mmu.mbc.battery_image(now)
    }

    /// Replace cartridge RAM (and RTC) with a battery image. On error the
    /// running state is unchanged.
    pub fn load_save_ram(&mut self, data: &[u8]) -> Result<()> {
        let now = self.host.unix_time();
        self.gb.mmu.mbc.load_battery_image(data, now)?;
        self.battery_dirty = false;
        Ok(())
    }

    pub fn serialize_state(&self) -> Vec<u8> {
        self.gb.save_state()
    }

    /// Replace the whole machine state. On error the running state is
    /// unchanged.
    pub fn load_state(&mut self, data: &[u8]) -> Result<()> {
        let mut next = self.gb.clone();
        next.load_state(data)?;
        self.gb = next;
        self.last_ppu_frames = self.gb.mmu.ppu.frames();
        info!("Save state loaded ({} bytes)", data.len());
        Ok(())
    }

    /// Cartridge RAM was written since the last [`Session::serialize_save_ram`].
    pub fn battery_dirty(&self) -> bool {
        self.battery_dirty
    }

    /// Dirty and quiet for at least the configured number of frames of
    /// emulated time.
    pub fn should_flush_save_ram(&self) -> bool {
        let idle = self.config.idle_save_frames as u64 * CYCLES_PER_FRAME as u64;
        self.battery_dirty && self.dots_since_ram_write >= idle
    }

    /// Fill `out` with interleaved stereo samples; returns how many were
    /// written.
    pub fn audio_pull(&self, out: &mut [i16]) -> usize {
        self.audio_rx.pop_interleaved(out)
    }

    /// Consumer for a host audio thread.
    pub fn audio_reader(&self) -> AudioConsumer {
        self.audio_rx.clone()
    }

    pub fn rumble(&self) -> bool {
        self.gb.mmu.mbc.rumble_active()
    }

    /// Frames completed since the session started.
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    pub fn cartridge(&self) -> &Cartridge {
        &self.cart
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn gameboy(&self) -> &GameBoy {
        &self.gb
    }

    /// The error that stopped the session, if any.
    pub fn failure(&self) -> Option<&CoreError> {
        self.failure.as_ref()
    }
}
