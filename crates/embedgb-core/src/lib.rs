//! Embeddable Game Boy / Game Boy Color emulation core.
//!
//! A host loads a cartridge, builds a [`session::Session`] around its own
//! [`host::Host`] implementation and calls [`session::Session::tick`] once per
//! host frame. Video arrives scanline by scanline through the host callback,
//! audio through a lock-free ring the host drains from any thread, and
//! persistence through opaque battery-save and save-state byte blobs.

/// Audio Processing Unit (APU) emulation.
pub mod apu;

/// Lock-free stereo ring buffer between the core and a host audio thread.
pub mod audio_queue;

/// Cartridge header parsing and boot ROM images.
pub mod cartridge;

/// Session settings.
pub mod config;

/// LR35902 CPU core.
pub mod cpu;

/// Error type shared by every fallible operation.
pub mod error;

/// CPU and bus wired into a single machine.
pub mod gameboy;

/// Console models and clock constants.
pub mod hardware;

/// Callbacks the core makes into the host.
pub mod host;

/// Interrupt flag bits, priority and vectors.
pub mod interrupts;

/// Joypad input register and interrupt on press.
pub mod joypad;

/// Memory bank controllers and external RAM.
pub mod mbc;

/// Memory map, OAM DMA and CGB VRAM DMA.
pub mod mmu;

/// IPS, UPS and BPS soft patches.
pub mod patch;

/// Pixel Processing Unit (PPU) emulation.
pub mod ppu;

/// MBC3 real-time clock.
pub mod rtc;

/// Frame driver and the host-facing session API.
pub mod session;

/// Save-state container format.
pub mod state;

/// Divider/timer unit.
pub mod timer;

pub use cartridge::{BootRom, Cartridge, load_boot_rom, load_cartridge};
pub use config::SessionConfig;
pub use error::{CoreError, Result};
pub use hardware::Model;
pub use host::{Host, NullHost, PixelFormat};
pub use joypad::buttons;
pub use session::Session;
