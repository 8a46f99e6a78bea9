#[cfg(feature = "cpu-trace")]
use log::trace;

use crate::{
    error::{CoreError, Result},
    hardware::Model,
    interrupts,
    mmu::Mmu,
    state::{Section, SectionReader},
};

const FLAG_Z: u8 = 0x80; // Zero
const FLAG_N: u8 = 0x40; // Subtract
const FLAG_H: u8 = 0x20; // Half Carry
const FLAG_C: u8 = 0x10; // Carry

// Register values after the boot ROM has run.
const BOOT_PC: u16 = 0x0100;
const BOOT_SP: u16 = 0xFFFE;

const DMG_BOOT_A: u8 = 0x01;
const DMG_BOOT_F: u8 = 0xB0;
const DMG_BOOT_B: u8 = 0x00;
const DMG_BOOT_C: u8 = 0x13;
const DMG_BOOT_D: u8 = 0x00;
const DMG_BOOT_E: u8 = 0xD8;
const DMG_BOOT_H: u8 = 0x01;
const DMG_BOOT_L: u8 = 0x4D;

const CGB_BOOT_A: u8 = 0x11;
const CGB_BOOT_F: u8 = 0x80;
const CGB_BOOT_B: u8 = 0x00;
const CGB_BOOT_C: u8 = 0x00;
const CGB_BOOT_D: u8 = 0x00;
const CGB_BOOT_E: u8 = 0x08;
const CGB_BOOT_H: u8 = 0x00;
const CGB_BOOT_L: u8 = 0x7C;

const CYCLES_PER_M_CYCLE: u32 = 4;

const ILLEGAL_OPCODES: [u8; 11] = [
    0xD3, 0xDB, 0xDD, 0xE3, 0xE4, 0xEB, 0xEC, 0xED, 0xF4, 0xFC, 0xFD,
];

/// SM83 core. Executes one instruction per [`Cpu::step`]; bus accesses take
/// effect immediately and the elapsed cycles are returned for the caller to
/// advance the rest of the machine.
#[derive(Debug, Clone, Default)]
pub struct Cpu {
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub pc: u16,
    pub sp: u16,
    pub ime: bool,
    pub halted: bool,
    pub stopped: bool,
    halt_bug: bool,
    ime_enable_delay: u8,
    /// T-cycles spent by the step in progress.
    cycles: u32,
}

impl Cpu {
    /// Registers as the boot ROM leaves them for a cartridge entry at 0x0100.
    pub fn post_boot(model: Model) -> Self {
        let (a, f, b, c, d, e, h, l) = match model {
            Model::Dmg => (
                DMG_BOOT_A, DMG_BOOT_F, DMG_BOOT_B, DMG_BOOT_C, DMG_BOOT_D, DMG_BOOT_E,
                DMG_BOOT_H, DMG_BOOT_L,
            ),
            Model::Cgb => (
                CGB_BOOT_A, CGB_BOOT_F, CGB_BOOT_B, CGB_BOOT_C, CGB_BOOT_D, CGB_BOOT_E,
                CGB_BOOT_H, CGB_BOOT_L,
            ),
        };
        Self {
            a,
            f,
            b,
            c,
            d,
            e,
            h,
            l,
            pc: BOOT_PC,
            sp: BOOT_SP,
            ..Self::default()
        }
    }

    /// Power-on state, with a boot ROM mapped at 0x0000.
    pub fn power_on() -> Self {
        Self::default()
    }

    fn get_bc(&self) -> u16 {
        ((self.b as u16) << 8) | self.c as u16
    }

    fn set_bc(&mut self, val: u16) {
        self.b = (val >> 8) as u8;
        self.c = val as u8;
    }

    fn get_de(&self) -> u16 {
        ((self.d as u16) << 8) | self.e as u16
    }

    fn set_de(&mut self, val: u16) {
        self.d = (val >> 8) as u8;
        self.e = val as u8;
    }

    pub fn get_hl(&self) -> u16 {
        ((self.h as u16) << 8) | self.l as u16
    }

    fn set_hl(&mut self, val: u16) {
        self.h = (val >> 8) as u8;
        self.l = val as u8;
    }

    fn get_af(&self) -> u16 {
        ((self.a as u16) << 8) | (self.f & 0xF0) as u16
    }

    fn set_af(&mut self, val: u16) {
        self.a = (val >> 8) as u8;
        self.f = val as u8 & 0xF0;
    }

    #[inline]
    fn tick(&mut self, m_cycles: u32) {
        self.cycles += m_cycles * CYCLES_PER_M_CYCLE;
    }

    fn fetch8(&mut self, mmu: &Mmu) -> u8 {
        let val = self.read8(mmu, self.pc);
        self.pc = self.pc.wrapping_add(1);
        val
    }

    fn fetch16(&mut self, mmu: &Mmu) -> u16 {
        let lo = self.fetch8(mmu) as u16;
        let hi = self.fetch8(mmu) as u16;
        (hi << 8) | lo
    }

    fn read8(&mut self, mmu: &Mmu, addr: u16) -> u8 {
        self.tick(1);
        mmu.read(addr)
    }

    fn write8(&mut self, mmu: &mut Mmu, addr: u16, val: u8) {
        self.tick(1);
        mmu.write(addr, val);
    }

    fn push_stack(&mut self, mmu: &mut Mmu, val: u16) {
        self.sp = self.sp.wrapping_sub(1);
        self.write8(mmu, self.sp, (val >> 8) as u8);
        self.sp = self.sp.wrapping_sub(1);
        self.write8(mmu, self.sp, val as u8);
    }

    fn pop_stack(&mut self, mmu: &Mmu) -> u16 {
        let lo = self.read8(mmu, self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        let hi = self.read8(mmu, self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        (hi << 8) | lo
    }

    fn read_reg(&mut self, mmu: &Mmu, index: u8) -> u8 {
        match index & 0x07 {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => self.h,
            5 => self.l,
            6 => self.read8(mmu, self.get_hl()),
            _ => self.a,
        }
    }

    fn write_reg(&mut self, mmu: &mut Mmu, index: u8, val: u8) {
        match index & 0x07 {
            0 => self.b = val,
            1 => self.c = val,
            2 => self.d = val,
            3 => self.e = val,
            4 => self.h = val,
            5 => self.l = val,
            6 => {
                let addr = self.get_hl();
                self.write8(mmu, addr, val);
            }
            _ => self.a = val,
        }
    }

    /// BC, DE, HL, SP by the two-bit field of 0x01/0x03/0x09/0x0B-style opcodes.
    fn read_rr(&self, index: u8) -> u16 {
        match index & 0x03 {
            0 => self.get_bc(),
            1 => self.get_de(),
            2 => self.get_hl(),
            _ => self.sp,
        }
    }

    fn write_rr(&mut self, index: u8, val: u16) {
        match index & 0x03 {
            0 => self.set_bc(val),
            1 => self.set_de(val),
            2 => self.set_hl(val),
            _ => self.sp = val,
        }
    }

    fn condition(&self, cc: u8) -> bool {
        match cc & 0x03 {
            0 => self.f & FLAG_Z == 0,
            1 => self.f & FLAG_Z != 0,
            2 => self.f & FLAG_C == 0,
            _ => self.f & FLAG_C != 0,
        }
    }

    /// ADD ADC SUB SBC AND XOR OR CP, selected by bits 3-5 of the opcode.
    fn alu(&mut self, op: u8, val: u8) {
        let a = self.a;
        let carry_in = ((self.f & FLAG_C) != 0) as u8;
        match op & 0x07 {
            0 | 1 => {
                let c = if op & 0x07 == 1 { carry_in } else { 0 };
                let res = a as u16 + val as u16 + c as u16;
                self.f = if res as u8 == 0 { FLAG_Z } else { 0 }
                    | if (a & 0x0F) + (val & 0x0F) + c > 0x0F {
                        FLAG_H
                    } else {
                        0
                    }
                    | if res > 0xFF { FLAG_C } else { 0 };
                self.a = res as u8;
            }
            2 | 3 | 7 => {
                let c = if op & 0x07 == 3 { carry_in } else { 0 };
                let res = a.wrapping_sub(val).wrapping_sub(c);
                self.f = FLAG_N
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if (a & 0x0F) < (val & 0x0F) + c {
                        FLAG_H
                    } else {
                        0
                    }
                    | if (a as u16) < val as u16 + c as u16 {
                        FLAG_C
                    } else {
                        0
                    };
                if op & 0x07 != 7 {
                    self.a = res;
                }
            }
            4 => {
                self.a &= val;
                self.f = if self.a == 0 { FLAG_Z } else { 0 } | FLAG_H;
            }
            5 => {
                self.a ^= val;
                self.f = if self.a == 0 { FLAG_Z } else { 0 };
            }
            _ => {
                self.a |= val;
                self.f = if self.a == 0 { FLAG_Z } else { 0 };
            }
        }
    }

    fn inc8(&mut self, val: u8) -> u8 {
        let res = val.wrapping_add(1);
        self.f = (self.f & FLAG_C)
            | if res == 0 { FLAG_Z } else { 0 }
            | if val & 0x0F == 0x0F { FLAG_H } else { 0 };
        res
    }

    fn dec8(&mut self, val: u8) -> u8 {
        let res = val.wrapping_sub(1);
        self.f = (self.f & FLAG_C)
            | FLAG_N
            | if res == 0 { FLAG_Z } else { 0 }
            | if val & 0x0F == 0 { FLAG_H } else { 0 };
        res
    }

    fn add_hl(&mut self, val: u16) {
        let hl = self.get_hl();
        self.f = (self.f & FLAG_Z)
            | if (hl & 0x0FFF) + (val & 0x0FFF) > 0x0FFF {
                FLAG_H
            } else {
                0
            }
            | if hl as u32 + val as u32 > 0xFFFF {
                FLAG_C
            } else {
                0
            };
        self.set_hl(hl.wrapping_add(val));
    }

    /// SP plus a signed immediate; flags come from the unsigned low byte add.
    fn sp_offset(&mut self, offset: u8) -> u16 {
        let val = offset as i8 as i16 as u16;
        let sp = self.sp;
        self.f = if (sp & 0x0F) + (val & 0x0F) > 0x0F {
            FLAG_H
        } else {
            0
        } | if (sp & 0xFF) + (val & 0xFF) > 0xFF {
            FLAG_C
        } else {
            0
        };
        sp.wrapping_add(val)
    }

    fn daa(&mut self) {
        let mut correction = 0u8;
        let mut carry = false;
        if self.f & FLAG_H != 0 || (self.f & FLAG_N == 0 && (self.a & 0x0F) > 9) {
            correction |= 0x06;
        }
        if self.f & FLAG_C != 0 || (self.f & FLAG_N == 0 && self.a > 0x99) {
            correction |= 0x60;
            carry = true;
        }
        if self.f & FLAG_N == 0 {
            self.a = self.a.wrapping_add(correction);
        } else {
            self.a = self.a.wrapping_sub(correction);
        }
        self.f = if self.a == 0 { FLAG_Z } else { 0 }
            | (self.f & FLAG_N)
            | if carry { FLAG_C } else { 0 };
    }

    /// Rotates and shifts of the CB table, bits 3-5 selecting the operation.
    fn shift_op(&mut self, op: u8, val: u8) -> u8 {
        let carry_in = ((self.f & FLAG_C) != 0) as u8;
        let (res, carry) = match op & 0x07 {
            0 => (val.rotate_left(1), val & 0x80 != 0),
            1 => (val.rotate_right(1), val & 0x01 != 0),
            2 => ((val << 1) | carry_in, val & 0x80 != 0),
            3 => ((val >> 1) | (carry_in << 7), val & 0x01 != 0),
            4 => (val << 1, val & 0x80 != 0),
            5 => ((val >> 1) | (val & 0x80), val & 0x01 != 0),
            6 => (val.rotate_left(4), false),
            _ => (val >> 1, val & 0x01 != 0),
        };
        self.f = if res == 0 { FLAG_Z } else { 0 } | if carry { FLAG_C } else { 0 };
        res
    }

    fn handle_cb(&mut self, mmu: &mut Mmu) {
        let opcode = self.fetch8(mmu);
        let r = opcode & 0x07;
        let bit = (opcode >> 3) & 0x07;
        let val = self.read_reg(mmu, r);
        match opcode {
            0x00..=0x3F => {
                let res = self.shift_op(bit, val);
                self.write_reg(mmu, r, res);
            }
            0x40..=0x7F => {
                // BIT only reads; (HL) costs 12 cycles.
                let zero = if val & (1 << bit) == 0 { FLAG_Z } else { 0 };
                self.f = (self.f & FLAG_C) | FLAG_H | zero;
            }
            0x80..=0xBF => self.write_reg(mmu, r, val & !(1 << bit)),
            _ => self.write_reg(mmu, r, val | (1 << bit)),
        }
    }

    /// Five M-cycles: two idle, two pushes, one to load the vector.
    fn dispatch_interrupt(&mut self, mmu: &mut Mmu, bit: u8, vector: u16) {
        self.ime = false;
        mmu.if_reg &= !bit;
        self.tick(2);
        let pc = self.pc;
        self.push_stack(mmu, pc);
        self.tick(1);
        self.pc = vector;
    }

    /// Run one instruction (or one interrupt dispatch, or one idle M-cycle
    /// while halted or stopped) and return the CPU T-cycles it took.
    pub fn step(&mut self, mmu: &mut Mmu) -> Result<u32> {
        self.cycles = 0;

        if self.stopped {
            if mmu.joypad.pressed() != 0 {
                self.stopped = false;
            }
            self.tick(1);
            return Ok(self.cycles);
        }

        let pending = mmu.if_reg & mmu.ie_reg & interrupts::MASK;
        if self.halted {
            if pending == 0 {
                self.tick(1);
                return Ok(self.cycles);
            }
            self.halted = false;
            self.tick(1);
        }

        if self.ime
            && let Some((bit, vector)) = interrupts::next_interrupt(pending)
        {
            self.dispatch_interrupt(mmu, bit, vector);
            return Ok(self.cycles);
        }

        let enable_after = self.ime_enable_delay == 1;
        let opcode_pc = self.pc;
        let opcode = if self.halt_bug {
            self.halt_bug = false;
            self.read8(mmu, self.pc)
        } else {
            self.fetch8(mmu)
        };

        #[cfg(feature = "cpu-trace")]
        trace!(
            "{opcode_pc:04X}: {opcode:02X} A={:02X} F={:02X} BC={:04X} DE={:04X} HL={:04X} SP={:04X}",
            self.a,
            self.f,
            self.get_bc(),
            self.get_de(),
            self.get_hl(),
            self.sp
        );

        self.execute(opcode, opcode_pc, mmu)?;

        if enable_after && self.ime_enable_delay > 0 {
            self.ime = true;
        }
        if self.ime_enable_delay > 0 {
            self.ime_enable_delay -= 1;
        }
        Ok(self.cycles)
    }

    fn execute(&mut self, opcode: u8, opcode_pc: u16, mmu: &mut Mmu) -> Result<()> {
        match opcode {
            0x00 => {}
            0x01 | 0x11 | 0x21 | 0x31 => {
                let val = self.fetch16(mmu);
                self.write_rr(opcode >> 4, val);
            }
            0x02 => {
                let addr = self.get_bc();
                self.write8(mmu, addr, self.a);
            }
            0x12 => {
                let addr = self.get_de();
                self.write8(mmu, addr, self.a);
            }
            0x22 | 0x32 => {
                let hl = self.get_hl();
                self.write8(mmu, hl, self.a);
                self.set_hl(if opcode == 0x22 {
                    hl.wrapping_add(1)
                } else {
                    hl.wrapping_sub(1)
                });
            }
            0x03 | 0x13 | 0x23 | 0x33 => {
                let val = self.read_rr(opcode >> 4).wrapping_add(1);
                self.write_rr(opcode >> 4, val);
                self.tick(1);
            }
            0x0B | 0x1B | 0x2B | 0x3B => {
                let val = self.read_rr(opcode >> 4).wrapping_sub(1);
                self.write_rr(opcode >> 4, val);
                self.tick(1);
            }
            0x09 | 0x19 | 0x29 | 0x39 => {
                let val = self.read_rr(opcode >> 4);
                self.add_hl(val);
                self.tick(1);
            }
            op @ (0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C) => {
                let r = op >> 3;
                let val = self.read_reg(mmu, r);
                let res = self.inc8(val);
                self.write_reg(mmu, r, res);
            }
            op @ (0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D) => {
                let r = op >> 3;
                let val = self.read_reg(mmu, r);
                let res = self.dec8(val);
                self.write_reg(mmu, r, res);
            }
            op @ (0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E) => {
                let val = self.fetch8(mmu);
                self.write_reg(mmu, op >> 3, val);
            }
            0x07 | 0x0F | 0x17 | 0x1F => {
                // RLCA RRCA RLA RRA always clear Z.
                let val = self.a;
                self.a = self.shift_op(opcode >> 3, val);
                self.f &= FLAG_C;
            }
            0x08 => {
                let addr = self.fetch16(mmu);
                self.write8(mmu, addr, self.sp as u8);
                self.write8(mmu, addr.wrapping_add(1), (self.sp >> 8) as u8);
            }
            0x0A => {
                let addr = self.get_bc();
                self.a = self.read8(mmu, addr);
            }
            0x1A => {
                let addr = self.get_de();
                self.a = self.read8(mmu, addr);
            }
            0x2A | 0x3A => {
                let hl = self.get_hl();
                self.a = self.read8(mmu, hl);
                self.set_hl(if opcode == 0x2A {
                    hl.wrapping_add(1)
                } else {
                    hl.wrapping_sub(1)
                });
            }
            0x10 => {
                // STOP
                let _ = self.fetch8(mmu);
                if mmu.speed_switch_armed() {
                    mmu.switch_speed();
                } else {
                    mmu.timer.reset_div(&mut mmu.if_reg);
                    self.stopped = true;
                }
            }
            0x18 => {
                let offset = self.fetch8(mmu) as i8;
                self.pc = self.pc.wrapping_add(offset as u16);
                self.tick(1);
            }
            0x20 | 0x28 | 0x30 | 0x38 => {
                let offset = self.fetch8(mmu) as i8;
                if self.condition(opcode >> 3) {
                    self.pc = self.pc.wrapping_add(offset as u16);
                    self.tick(1);
                }
            }
            0x27 => self.daa(),
            0x2F => {
                self.a = !self.a;
                self.f = (self.f & (FLAG_Z | FLAG_C)) | FLAG_N | FLAG_H;
            }
            0x37 => self.f = (self.f & FLAG_Z) | FLAG_C,
            0x3F => self.f = (self.f & FLAG_Z) | ((self.f & FLAG_C) ^ FLAG_C),
            0x76 => {
                let pending = mmu.if_reg & mmu.ie_reg & interrupts::MASK;
                if self.ime || self.ime_enable_delay > 0 || pending == 0 {
                    self.halted = true;
                } else {
                    // HALT with IME clear and an interrupt pending does not
                    // halt; the next opcode byte is read twice.
                    self.halt_bug = true;
                }
            }
            0x40..=0x7F => {
                let val = self.read_reg(mmu, opcode);
                self.write_reg(mmu, opcode >> 3, val);
            }
            0x80..=0xBF => {
                let val = self.read_reg(mmu, opcode);
                self.alu(opcode >> 3, val);
            }
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let val = self.fetch8(mmu);
                self.alu(opcode >> 3, val);
            }
            0xC0 | 0xC8 | 0xD0 | 0xD8 => {
                self.tick(1);
                if self.condition(opcode >> 3) {
                    self.pc = self.pop_stack(mmu);
                    self.tick(1);
                }
            }
            0xC9 | 0xD9 => {
                self.pc = self.pop_stack(mmu);
                self.tick(1);
                if opcode == 0xD9 {
                    self.ime = true;
                }
            }
            0xC1 | 0xD1 | 0xE1 => {
                let val = self.pop_stack(mmu);
                self.write_rr((opcode >> 4) & 0x03, val);
            }
            0xF1 => {
                let val = self.pop_stack(mmu);
                self.set_af(val);
            }
            0xC5 | 0xD5 | 0xE5 | 0xF5 => {
                let val = match opcode {
                    0xC5 => self.get_bc(),
                    0xD5 => self.get_de(),
                    0xE5 => self.get_hl(),
                    _ => self.get_af(),
                };
                self.tick(1);
                self.push_stack(mmu, val);
            }
            0xC2 | 0xCA | 0xD2 | 0xDA => {
                let addr = self.fetch16(mmu);
                if self.condition(opcode >> 3) {
                    self.pc = addr;
                    self.tick(1);
                }
            }
            0xC3 => {
                self.pc = self.fetch16(mmu);
                self.tick(1);
            }
            0xE9 => self.pc = self.get_hl(),
            0xC4 | 0xCC | 0xD4 | 0xDC => {
                let addr = self.fetch16(mmu);
                if self.condition(opcode >> 3) {
                    self.tick(1);
                    let ret = self.pc;
                    self.push_stack(mmu, ret);
                    self.pc = addr;
                }
            }
            0xCD => {
                let addr = self.fetch16(mmu);
                self.tick(1);
                let ret = self.pc;
                self.push_stack(mmu, ret);
                self.pc = addr;
            }
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                self.tick(1);
                let ret = self.pc;
                self.push_stack(mmu, ret);
                self.pc = (opcode & 0x38) as u16;
            }
            0xCB => self.handle_cb(mmu),
            0xE0 => {
                let offset = self.fetch8(mmu);
                self.write8(mmu, 0xFF00 | offset as u16, self.a);
            }
            0xF0 => {
                let offset = self.fetch8(mmu);
                self.a = self.read8(mmu, 0xFF00 | offset as u16);
            }
            0xE2 => self.write8(mmu, 0xFF00 | self.c as u16, self.a),
            0xF2 => self.a = self.read8(mmu, 0xFF00 | self.c as u16),
            0xEA => {
                let addr = self.fetch16(mmu);
                self.write8(mmu, addr, self.a);
            }
            0xFA => {
                let addr = self.fetch16(mmu);
                self.a = self.read8(mmu, addr);
            }
            0xE8 => {
                let offset = self.fetch8(mmu);
                self.sp = self.sp_offset(offset);
                self.tick(2);
            }
            0xF8 => {
                let offset = self.fetch8(mmu);
                let res = self.sp_offset(offset);
                self.set_hl(res);
                self.tick(1);
            }
            0xF9 => {
                self.sp = self.get_hl();
                self.tick(1);
            }
            0xF3 => {
                self.ime = false;
                self.ime_enable_delay = 0;
            }
            0xFB => {
                if !self.ime {
                    self.ime_enable_delay = 2;
                }
            }
            _ => {
                debug_assert!(ILLEGAL_OPCODES.contains(&opcode));
                return Err(CoreError::IllegalInstruction {
                    opcode,
                    pc: opcode_pc,
                });
            }
        }
        Ok(())
    }

    pub fn save_state(&self, s: &mut Section) {
        s.u8(self.a)
            .u8(self.f)
            .u8(self.b)
            .u8(self.c)
            .u8(self.d)
            .u8(self.e)
            .u8(self.h)
            .u8(self.l)
            .u16(self.pc)
            .u16(self.sp)
            .bool(self.ime)
            .bool(self.halted)
            .bool(self.stopped)
            .bool(self.halt_bug)
            .u8(self.ime_enable_delay);
    }

    pub fn load_state(&mut self, r: &mut SectionReader) -> Result<()> {
        self.a = r.u8()?;
        self.f = r.u8()? & 0xF0;
        self.b = r.u8()?;
        self.c = r.u8()?;
        self.d = r.u8()?;
        self.e = r.u8()?;
        self.h = r.u8()?;
        self.l = r.u8()?;
        self.pc = r.u16()?;
        self.sp = r.u16()?;
        self.ime = r.bool()?;
        self.halted = r.bool()?;
        self.stopped = r.bool()?;
        self.halt_bug = r.bool()?;
        self.ime_enable_delay = r.u8()?.min(2);
        Ok(())
    }
}
