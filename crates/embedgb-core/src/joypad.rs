use crate::error::Result;
use crate::interrupts;
use crate::state::{Section, SectionReader};

/// Button bits accepted by [`Joypad::set_buttons`], set = pressed.
pub mod buttons {
    pub const RIGHT: u8 = 0x01;
    pub const LEFT: u8 = 0x02;
    pub const UP: u8 = 0x04;
    pub const DOWN: u8 = 0x08;
    pub const A: u8 = 0x10;
    pub const B: u8 = 0x20;
    pub const SELECT: u8 = 0x40;
    pub const START: u8 = 0x80;
}

const SELECT_DIRECTIONS: u8 = 0x10;
const SELECT_BUTTONS: u8 = 0x20;

/// P1/JOYP register and the 8-button snapshot behind it.
#[derive(Clone, Debug)]
pub struct Joypad {
    /// Selection bits 4-5 as last written (active low).
    select: u8,
    /// Pressed buttons, bit layout of [`buttons`].
    pressed: u8,
}

impl Joypad {
    pub fn new() -> Self {
        Self {
            select: 0x30,
            pressed: 0,
        }
    }

    /// Low nibble of P1 for the current selection, active low.
    fn lines(&self) -> u8 {
        let mut low = 0x0F;
        if self.select & SELECT_DIRECTIONS == 0 {
            low &= !(self.pressed & 0x0F);
        }
        if self.select & SELECT_BUTTONS == 0 {
            low &= !(self.pressed >> 4);
        }
        low
    }

    pub fn read(&self) -> u8 {
        0xC0 | self.select | self.lines()
    }

    pub fn write(&mut self, val: u8, if_reg: &mut u8) {
        let before = self.lines();
        self.select = val & 0x30;
        self.raise_on_press(before, if_reg);
    }

    /// Replace the pressed-button snapshot.
    pub fn set_buttons(&mut self, mask: u8, if_reg: &mut u8) {
        let before = self.lines();
        self.pressed = mask;
        self.raise_on_press(before, if_reg);
    }

    pub fn pressed(&self) -> u8 {
        self.pressed
    }

    fn raise_on_press(&self, before: u8, if_reg: &mut u8) {
        // Any selected line going 1 -> 0.
        if before & !self.lines() & 0x0F != 0 {
            *if_reg |= interrupts::JOYPAD;
        }
    }

    pub fn save_state(&self, s: &mut Section) {
        s.u8(self.select).u8(self.pressed);
    }

    pub fn load_state(&mut self, r: &mut SectionReader) -> Result<()> {
        self.select = r.u8()? & 0x30;
        self.pressed = r.u8()?;
        Ok(())
    }
}

impl Default for Joypad {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::buttons::*;
    use super::*;

    #[test]
    fn matrix_reads_active_low() {
        let mut pad = Joypad::new();
        let mut if_reg = 0;
        pad.set_buttons(RIGHT | A, &mut if_reg);

        pad.write(0x20, &mut if_reg); // directions
        assert_eq!(pad.read() & 0x0F, 0x0E);
        pad.write(0x10, &mut if_reg); // buttons
        assert_eq!(pad.read() & 0x0F, 0x0E);
        pad.write(0x30, &mut if_reg);
        assert_eq!(pad.read(), 0xFF);
    }

    #[test]
    fn press_on_selected_line_raises_irq() {
        let mut pad = Joypad::new();
        let mut if_reg = 0;
        pad.write(0x10, &mut if_reg);
        pad.set_buttons(UP, &mut if_reg);
        assert_eq!(if_reg, 0, "directions are not selected");

        pad.set_buttons(UP | START, &mut if_reg);
        assert_eq!(if_reg & interrupts::JOYPAD, interrupts::JOYPAD);

        if_reg = 0;
        pad.set_buttons(UP, &mut if_reg);
        assert_eq!(if_reg, 0, "releases do not interrupt");

        // Selecting a group that already has a held button is a 1 -> 0 edge too.
        pad.write(0x20, &mut if_reg);
        assert_eq!(if_reg & interrupts::JOYPAD, interrupts::JOYPAD);
    }
}
