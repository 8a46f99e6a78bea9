/// V-blank request bit in IF/IE.
pub const VBLANK: u8 = 0x01;
/// LCD STAT request bit.
pub const LCD_STAT: u8 = 0x02;
/// Timer overflow request bit.
pub const TIMER: u8 = 0x04;
/// Serial transfer request bit. Nothing in the core raises it.
pub const SERIAL: u8 = 0x08;
/// Joypad press request bit.
pub const JOYPAD: u8 = 0x10;

/// Mask of the five implemented request lines.
pub const MASK: u8 = 0x1F;

/// Highest-priority pending interrupt as `(bit, vector)`.
///
/// Priority follows bit order: the lowest set bit of `pending` wins.
#[inline]
pub fn next_interrupt(pending: u8) -> Option<(u8, u16)> {
    let pending = pending & MASK;
    if pending == 0 {
        return None;
    }
    let index = pending.trailing_zeros() as u16;
    Some((1 << index, 0x0040 + index * 8))
}

/// IF as read by the CPU: the unused upper bits read back as 1.
#[inline]
pub fn read_if(if_reg: u8) -> u8 {
    if_reg | 0xE0
}
