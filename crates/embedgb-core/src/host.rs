use std::time::{SystemTime, UNIX_EPOCH};

/// Screen width in pixels.
pub const SCREEN_WIDTH: usize = 160;
/// Screen height in pixels.
pub const SCREEN_HEIGHT: usize = 144;

/// Meaning of the values handed to [`Host::scanline_ready`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// DMG shades 0..=3 after BGP/OBP mapping (0 = lightest).
    Shade2Bit,
    /// CGB colors as 15-bit BGR555 (`0bbbbbgggggrrrrr`).
    Bgr555,
}

/// Callbacks the core invokes while it runs.
///
/// The host supplies one implementation when building a
/// [`Session`](crate::session::Session). Callbacks run on the thread calling
/// `tick` and must not re-enter the session.
pub trait Host {
    /// A scanline finished pixel transfer. `ly` increases strictly within a
    /// frame and every visible line is delivered once per frame while the LCD
    /// is on.
    fn scanline_ready(&mut self, ly: u8, pixels: &[u16; SCREEN_WIDTH], format: PixelFormat);

    /// Wall clock in whole seconds since the Unix epoch, used to catch the
    /// cartridge RTC up after a battery save is loaded.
    fn unix_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Host that discards video output. Useful for headless runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl Host for NullHost {
    fn scanline_ready(&mut self, _ly: u8, _pixels: &[u16; SCREEN_WIDTH], _format: PixelFormat) {}
}
