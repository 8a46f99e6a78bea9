mod common;

use common::{
    FRAME_DT, PROGRAM_START, RecordingHost, RomBuilder, init_logger, run_frames, session,
};
use embedgb_core::{
    CoreError, Model, PixelFormat, Session, SessionConfig, buttons, hardware::CYCLES_PER_FRAME,
    load_boot_rom,
};

/// Spin forever.
const SPIN: [u8; 2] = [0x18, 0xFE];

#[test]
fn illegal_opcode_stops_the_session() {
    let cart = RomBuilder::rom_only().program(&[0x00, 0xD3]).build();
    let mut s = session(cart, Model::Dmg);
    let expected = CoreError::IllegalInstruction {
        opcode: 0xD3,
        pc: PROGRAM_START + 1,
    };
    assert_eq!(s.tick(FRAME_DT), Err(expected.clone()));
    assert_eq!(s.failure(), Some(&expected));

    let frozen = s.serialize_state();
    assert_eq!(s.tick(FRAME_DT), Err(expected));
    assert_eq!(s.serialize_state(), frozen);
}

#[test]
fn non_positive_and_nan_deltas_do_nothing() {
    let cart = RomBuilder::rom_only().program(&SPIN).build();
    let mut s = session(cart, Model::Dmg);
    run_frames(&mut s, 1);
    let before = s.serialize_state();
    for dt in [0.0, -1.0, f64::NAN, f64::NEG_INFINITY] {
        s.tick(dt).unwrap();
    }
    assert_eq!(s.serialize_state(), before);
}

#[test]
fn long_delta_is_clamped_to_catch_up_budget() {
    let cart = RomBuilder::rom_only().program(&SPIN).build();
    let mut s = session(cart, Model::Dmg);
    s.tick(30.0).unwrap();
    let lines = s.host().lines.len();
    let max_lines = (1.5 * CYCLES_PER_FRAME as f64 / 456.0).ceil() as usize + 1;
    assert!(lines <= max_lines, "{lines} scanlines after a clamped tick");
    assert!(s.frame_count() <= 2);
}

#[test]
fn buttons_reach_p1_and_raise_joypad_interrupt() {
    #[rustfmt::skip]
    let program = [
        0x3E, 0x10, // LD A,0x10 (select action buttons)
        0xE0, 0x00, // LDH (P1),A
        0xAF,       // XOR A
        0xE0, 0x0F, // LDH (IF),A
        0x18, 0xFE, // JR -2
    ];
    let cart = RomBuilder::rom_only().program(&program).build();
    let mut s = session(cart, Model::Dmg);
    run_frames(&mut s, 1);
    assert_eq!(s.gameboy().mmu.read(0xFF00) & 0x0F, 0x0F);

    s.set_buttons(buttons::A | buttons::START | buttons::LEFT);
    run_frames(&mut s, 1);
    let mmu = &s.gameboy().mmu;
    // A is bit 0, Start bit 3; directions are not selected.
    assert_eq!(mmu.read(0xFF00) & 0x0F, 0b0110);
    assert_ne!(mmu.if_reg & embedgb_core::interrupts::JOYPAD, 0);
}

#[test]
fn stop_waits_for_a_button() {
    #[rustfmt::skip]
    let program = [
        0x10, 0x00, // STOP
        0x06, 0x55, // LD B,0x55
        0x18, 0xFE, // JR -2
    ];
    let cart = RomBuilder::rom_only().program(&program).build();
    let mut s = session(cart, Model::Dmg);
    run_frames(&mut s, 3);
    assert!(s.gameboy().cpu.stopped);
    assert_ne!(s.gameboy().cpu.b, 0x55);

    s.set_buttons(buttons::B);
    run_frames(&mut s, 1);
    assert!(!s.gameboy().cpu.stopped);
    assert_eq!(s.gameboy().cpu.b, 0x55);
}

#[test]
fn audio_arrives_at_the_configured_rate() {
    init_logger();
    let cart = RomBuilder::rom_only().program(&SPIN).build();
    let config = SessionConfig {
        sample_rate: 48_000,
        ..SessionConfig::with_model(Model::Dmg)
    };
    let mut s = Session::with_config(cart, None, None, config, RecordingHost::default()).unwrap();
    let reader = s.audio_reader();
    let mut out = vec![0i16; 4096];
    let mut samples = 0;
    for _ in 0..60 {
        s.tick(FRAME_DT).unwrap();
        samples += reader.pop_interleaved(&mut out[..1000]);
        samples += s.audio_pull(&mut out);
    }
    let frames = samples / 2;
    assert!(
        (47_900..=48_100).contains(&frames),
        "{frames} frames for one emulated second"
    );
    assert_eq!(s.audio_pull(&mut out), 0);
}

#[test]
fn cgb_session_reports_rgb555() {
    let cart = RomBuilder::rom_only().cgb_flag(0x80).program(&SPIN).build();
    let mut s = session(cart, Model::Cgb);
    run_frames(&mut s, 1);
    assert_eq!(s.host().format, Some(PixelFormat::Bgr555));
    assert_eq!(s.gameboy().cpu.a, 0x11);
    assert_eq!(s.config().model, Model::Cgb);
}

#[test]
fn dmg_session_reports_shades() {
    let cart = RomBuilder::rom_only().program(&SPIN).build();
    let mut s = session(cart, Model::Dmg);
    run_frames(&mut s, 1);
    assert_eq!(s.host().format, Some(PixelFormat::Shade2Bit));
    assert!(s.host().last_line.unwrap().iter().all(|&px| px < 4));
}

/// Minimal DMG boot program: set SP, unmap itself at 0x00FC and fall into
/// the cartridge at 0x0100.
fn tiny_boot_rom() -> Vec<u8> {
    let mut boot = vec![0u8; 0x100];
    boot[..6].copy_from_slice(&[
        0x31, 0xFE, 0xFF, // LD SP,0xFFFE
        0xC3, 0xFC, 0x00, // JP 0x00FC
    ]);
    boot[0xFC..].copy_from_slice(&[
        0x3E, 0x01, // LD A,1
        0xE0, 0x50, // LDH (0x50),A
    ]);
    boot
}

#[test]
fn boot_rom_hands_over_to_the_cartridge() {
    init_logger();
    let cart = RomBuilder::rom_only()
        .program(&[0x06, 0x77, 0x18, 0xFE])
        .build();
    let config = SessionConfig {
        boot_rom: Some(load_boot_rom(tiny_boot_rom()).unwrap()),
        ..SessionConfig::with_model(Model::Dmg)
    };
    let mut s = Session::with_config(cart, None, None, config, RecordingHost::default()).unwrap();
    assert!(s.gameboy().mmu.boot_rom_mapped());
    assert_eq!(s.gameboy().mmu.read(0x0000), 0x31);

    run_frames(&mut s, 1);
    let gb = s.gameboy();
    assert!(!gb.mmu.boot_rom_mapped());
    assert_eq!(gb.mmu.read(0x0000), 0x00);
    assert_eq!(gb.cpu.b, 0x77);
}

#[test]
fn boot_rom_for_another_model_is_rejected() {
    init_logger();
    let cart = RomBuilder::rom_only().program(&SPIN).build();
    let config = SessionConfig {
        boot_rom: Some(load_boot_rom(tiny_boot_rom()).unwrap()),
        ..SessionConfig::with_model(Model::Cgb)
    };
    let err = Session::with_config(cart, None, None, config, RecordingHost::default())
        .err()
        .unwrap();
    assert_eq!(err, CoreError::BootRomSize(0x100));
    assert_eq!(
        load_boot_rom(vec![0u8; 300]).err(),
        Some(CoreError::BootRomSize(300))
    );
}

#[test]
fn reset_restarts_the_game_and_keeps_battery_ram() {
    #[rustfmt::skip]
    let program = [
        0x3E, 0x0A,       // LD A,0x0A
        0xEA, 0x00, 0x00, // LD (0x0000),A
        0xFA, 0x00, 0xA0, // LD A,(0xA000)
        0x3C,             // INC A
        0xEA, 0x00, 0xA0, // LD (0xA000),A
        0x06, 0x33,       // LD B,0x33
        0x18, 0xFE,       // JR -2
    ];
    // MBC1 + RAM + Battery
    let cart = RomBuilder::new(0x03, 0x00, 0x02).program(&program).build();
    let mut s = session(cart, Model::Dmg);
    run_frames(&mut s, 2);
    assert_eq!(s.gameboy().mmu.mbc.ram()[0], 1);
    assert_eq!(s.gameboy().cpu.b, 0x33);

    s.reset().unwrap();
    let gb = s.gameboy();
    assert_eq!(gb.cpu.pc, 0x0100);
    assert_eq!((gb.cpu.a, gb.cpu.b, gb.cpu.sp), (0x01, 0x00, 0xFFFE));
    assert_eq!(gb.mmu.mbc.ram()[0], 1);

    // The program runs again from the top and sees the kept RAM.
    run_frames(&mut s, 1);
    assert_eq!(s.gameboy().mmu.mbc.ram()[0], 2);
    assert!(s.battery_dirty());
}

#[test]
fn reset_clears_a_stopped_session() {
    let cart = RomBuilder::rom_only().program(&[0x00, 0xD3]).build();
    let mut s = session(cart, Model::Dmg);
    assert!(s.tick(FRAME_DT).is_err());
    s.reset().unwrap();
    assert_eq!(s.failure(), None);
    assert_eq!(s.gameboy().cpu.pc, 0x0100);
}

#[test]
fn host_seeds_the_cartridge_clock() {
    // MBC3 + Timer + Battery, no RAM
    let cart = RomBuilder::new(0x0F, 0x00, 0x00).program(&SPIN).build();
    let mut s = session(cart, Model::Dmg);
    assert!(s.set_rtc(300, 23, 59, 58));
    run_frames(&mut s, 1);
    assert!(s.battery_dirty());

    let mut mbc = s.gameboy().mmu.mbc.clone();
    mbc.write_rom(0x0000, 0x0A);
    mbc.write_rom(0x6000, 0x00);
    mbc.write_rom(0x6000, 0x01);
    let mut read_reg = |reg: u8| {
        mbc.write_rom(0x4000, reg);
        mbc.read_ram(0xA000)
    };
    assert_eq!(read_reg(0x08), 58);
    assert_eq!(read_reg(0x09), 59);
    assert_eq!(read_reg(0x0A), 23);
    assert_eq!(read_reg(0x0B), (300 & 0xFF) as u8);
    assert_eq!(read_reg(0x0C) & 0x01, 1);

    let plain = RomBuilder::rom_only().program(&SPIN).build();
    let mut s = session(plain, Model::Dmg);
    assert!(!s.set_rtc(0, 0, 0, 0));
}
