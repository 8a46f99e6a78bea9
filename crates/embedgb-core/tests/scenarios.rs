mod common;

use common::{FRAME_DT, RomBuilder, run_frames, session};
use embedgb_core::{Model, cartridge::header_checksum, mbc::Mbc};

/// Budget of one 1/60 s tick: round(4194304 / 60).
const TICK_CYCLES: u32 = 69_905;

#[test]
fn nop_loop_advances_pc_and_cycles_ly() {
    // 0x7F (LD A,A) in the title makes the header checksum 0x68 (LD L,B), so
    // every byte the CPU meets is a 4-cycle no-op that leaves A alone.
    let rom = RomBuilder::rom_only()
        .bytes_at(0x0134, &[0x7F])
        .bytes_at(0x7FFD, &[0xC3, 0x50, 0x01]);
    let image = rom.image();
    assert_eq!(header_checksum(&image), 0x68);
    let cart = embedgb_core::load_cartridge(image).unwrap();
    let mut s = session(cart, Model::Dmg);

    s.tick(FRAME_DT).unwrap();
    let cpu = &s.gameboy().cpu;
    assert_eq!(cpu.pc, 0x0100 + TICK_CYCLES.div_ceil(4) as u16);
    assert_eq!(cpu.a, 0x01, "post-boot A is untouched");

    run_frames(&mut s, 59);
    let cpu = &s.gameboy().cpu;
    assert_eq!(cpu.a, 0x01);
    assert!(!cpu.ime);
    assert_eq!(cpu.sp, 0xFFFE, "no interrupt was dispatched");

    let lines = &s.host().lines;
    let frames: Vec<&[u8]> = lines.chunks(144).collect();
    assert!((59..=60).contains(&frames.len()), "{} frames", frames.len());
    for frame in frames.iter().filter(|f| f.len() == 144) {
        assert!(frame.iter().copied().eq(0..144));
    }
    assert!((59..=60).contains(&s.frame_count()));
}

#[test]
fn daa_after_subtract_clear_half_carry_set() {
    // LD BC,0x9A20; PUSH BC; POP AF (A=0x9A, H=1); DAA; JR -2
    let cart = RomBuilder::rom_only()
        .program(&[0x01, 0x20, 0x9A, 0xC5, 0xF1, 0x27, 0x18, 0xFE])
        .build();
    let mut s = session(cart, Model::Dmg);
    s.tick(FRAME_DT).unwrap();
    let cpu = &s.gameboy().cpu;
    assert_eq!(cpu.a, 0x00);
    assert_eq!(cpu.f & 0x80, 0x80, "Z");
    assert_eq!(cpu.f & 0x10, 0x10, "C");
    assert_eq!(cpu.f & 0x60, 0x00, "N and H clear");
}

#[test]
fn halt_bug_executes_following_byte_twice() {
    // LD A,4; LDH (IE),A; LDH (IF),A; XOR A; HALT; INC A; INC A; JR -2
    let cart = RomBuilder::rom_only()
        .program(&[
            0x3E, 0x04, 0xE0, 0xFF, 0xE0, 0x0F, 0xAF, 0x76, 0x3C, 0x3C, 0x18, 0xFE,
        ])
        .build();
    let mut s = session(cart, Model::Dmg);
    s.tick(FRAME_DT).unwrap();
    let cpu = &s.gameboy().cpu;
    assert_eq!(cpu.a, 3);
    assert!(!cpu.halted);
}

#[test]
fn mbc1_mode1_maps_bank_0x20_low() {
    let cart = RomBuilder::new(0x01, 0x05, 0x00)
        .fill_banks_with_index()
        .build();
    let mut mbc = Mbc::new(&cart, 0);
    mbc.write_rom(0x6000, 0x01);
    mbc.write_rom(0x2000, 0x00);
    mbc.write_rom(0x4000, 0x01);
    assert_eq!(mbc.read_rom(0x0000), 0x20);
    assert_eq!(mbc.read_rom(0x3FFF), 0x20);
    assert_eq!(mbc.read_rom(0x4000), 0x21);

    mbc.write_rom(0x6000, 0x00);
    assert_eq!(mbc.read_rom(0x0000), 0x00);
}

#[test]
fn timer_4096hz_with_tma_fe_overflows_every_two_ticks() {
    #[rustfmt::skip]
    let program = [
        0x3E, 0xFE,       // LD A,0xFE
        0xE0, 0x06,       // LDH (TMA),A
        0xE0, 0x05,       // LDH (TIMA),A
        0x11, 0x00, 0x00, // LD DE,0
        0xAF,             // XOR A
        0xE0, 0x0F,       // LDH (IF),A
        0x3E, 0x04,       // LD A,0x04
        0xE0, 0x07,       // LDH (TAC),A
        // loop:
        0xF0, 0x0F,       // LDH A,(IF)
        0xCB, 0x57,       // BIT 2,A
        0x28, 0xFA,       // JR Z,loop
        0xAF,             // XOR A
        0xE0, 0x0F,       // LDH (IF),A
        0x13,             // INC DE
        0x18, 0xF4,       // JR loop
    ];
    let cart = RomBuilder::rom_only().program(&program).build();
    let mut s = session(cart, Model::Dmg);
    run_frames(&mut s, 60);

    let cpu = &s.gameboy().cpu;
    let overflows = ((cpu.d as u32) << 8) | cpu.e as u32;
    // 4096 Hz / 2 increments per overflow over one second.
    assert!((2046..=2049).contains(&overflows), "{overflows} overflows");
}

#[test]
fn vblank_interrupt_at_sixty_hertz() {
    #[rustfmt::skip]
    let program = [
        0x3E, 0x80, // LD A,0x80
        0xE0, 0x40, // LDH (LCDC),A
        0x3E, 0x01, // LD A,1
        0xE0, 0xFF, // LDH (IE),A
        0xAF,       // XOR A
        0xE0, 0x0F, // LDH (IF),A
        0x06, 0x00, // LD B,0
        0xFB,       // EI
        // loop:
        0x76,       // HALT
        0x18, 0xFD, // JR loop
    ];
    let cart = RomBuilder::rom_only()
        // VBlank vector: INC B; RETI
        .bytes_at(0x0040, &[0x04, 0xD9])
        .program(&program)
        .build();
    let mut s = session(cart, Model::Dmg);
    run_frames(&mut s, 60);
    let b = s.gameboy().cpu.b;
    assert!((59..=61).contains(&b), "{b} VBlank interrupts");
}

/// Arms KEY1, then either executes STOP (`switch`) or skips it, and counts
/// 4096 Hz timer overflows into 0xFF90 from an interrupt handler.
fn timer_overflows_per_second(switch: bool) -> (u8, u8, u8) {
    #[rustfmt::skip]
    let program = [
        0x3E, 0x01,       // LD A,0x01
        0xE0, 0x4D,       // LDH (KEY1),A
        if switch { 0x10 } else { 0x00 }, 0x00, // STOP or NOP
        0xF0, 0x04,       // LDH A,(DIV)
        0xE0, 0x91,       // LDH (0x91),A
        0x21, 0x90, 0xFF, // LD HL,0xFF90
        0xAF,             // XOR A
        0x77,             // LD (HL),A
        0xE0, 0x05,       // LDH (TIMA),A
        0xE0, 0x06,       // LDH (TMA),A
        0xE0, 0x0F,       // LDH (IF),A
        0x3E, 0x04,       // LD A,0x04
        0xE0, 0xFF,       // LDH (IE),A
        0xE0, 0x07,       // LDH (TAC),A
        0xFB,             // EI
        0x18, 0xFE,       // JR -2
    ];
    let cart = RomBuilder::rom_only()
        .cgb_flag(0x80)
        .bytes_at(0x0050, &[0x34, 0xD9]) // INC (HL); RETI
        .program(&program)
        .build();
    let mut s = session(cart, Model::Cgb);
    run_frames(&mut s, 60);
    let mmu = &s.gameboy().mmu;
    (mmu.read(0xFF90), mmu.read(0xFF91), mmu.read(0xFF4D))
}

#[test]
fn stop_with_key1_armed_doubles_cpu_speed() {
    let (fast, div_after_switch, key1) = timer_overflows_per_second(true);
    assert_eq!(key1 & 0x81, 0x80, "double speed, switch disarmed");
    assert_eq!(div_after_switch, 0, "STOP resets DIV");
    assert!((31..=33).contains(&fast), "{fast} overflows in double speed");

    let (slow, _, key1) = timer_overflows_per_second(false);
    assert_eq!(key1 & 0x81, 0x01, "still armed, normal speed");
    assert!((15..=17).contains(&slow), "{slow} overflows in normal speed");
}
