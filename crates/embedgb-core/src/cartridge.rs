use std::sync::Arc;

use log::{info, warn};

use crate::error::{CoreError, Result};
use crate::hardware::Model;

const HEADER_END: usize = 0x0150;
const ROM_BANK_SIZE: usize = 0x4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapper {
    NoMbc,
    Mbc1,
    Mbc2,
    Mbc3,
    Mbc5,
}

/// Optional hardware on the cartridge board.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    pub battery: bool,
    pub timer: bool,
    pub rumble: bool,
}

/// Header byte 0x0143.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgbSupport {
    None,
    /// 0x80: runs on both models.
    Dual,
    /// 0xC0: CGB only.
    Only,
}

/// Immutable cartridge image plus what the header declares about it.
///
/// The ROM bytes are reference counted so a host can keep sharing them
/// read-only after the session has started.
#[derive(Debug, Clone)]
pub struct Cartridge {
    rom: Arc<[u8]>,
    title: String,
    cart_type: u8,
    mapper: Mapper,
    features: Features,
    rom_banks: usize,
    ram_size: usize,
    cgb: CgbSupport,
    header_checksum: u8,
}

/// Parse a raw ROM image. Apply soft patches before calling this.
pub fn load_cartridge(bytes: impl Into<Vec<u8>>) -> Result<Cartridge> {
    Cartridge::from_bytes(bytes.into())
}

impl Cartridge {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() < HEADER_END {
            return Err(CoreError::InvalidHeader("image shorter than the header"));
        }

        let header = Header::parse(&data);
        let expected = header.computed_checksum();
        if expected != header.checksum() {
            return Err(CoreError::InvalidHeader("header checksum mismatch"));
        }

        let cart_type = header.cart_type();
        let (mapper, features) = Header::decode_type(cart_type)?;
        let rom_banks = header.rom_banks()?;
        let ram_size = if mapper == Mapper::Mbc2 {
            0x200
        } else {
            header.ram_size()?
        };

        if data.len() != rom_banks * ROM_BANK_SIZE {
            warn!(
                "ROM is {} bytes but the header declares {}",
                data.len(),
                rom_banks * ROM_BANK_SIZE
            );
        }

        let cart = Self {
            title: header.title(),
            cgb: header.cgb_support(),
            header_checksum: expected,
            cart_type,
            mapper,
            features,
            rom_banks,
            ram_size,
            rom: data.into(),
        };
        info!(
            "Loaded ROM: {} (type {:#04X}, {:?}, {} banks, {} bytes RAM, CGB {:?})",
            cart.title, cart.cart_type, cart.mapper, cart.rom_banks, cart.ram_size, cart.cgb
        );
        Ok(cart)
    }

    pub fn rom(&self) -> &Arc<[u8]> {
        &self.rom
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn cart_type(&self) -> u8 {
        self.cart_type
    }

    pub fn mapper(&self) -> Mapper {
        self.mapper
    }

    pub fn features(&self) -> Features {
        self.features
    }

    /// Declared number of 16 KiB ROM banks.
    pub fn rom_banks(&self) -> usize {
        self.rom_banks
    }

    /// Declared external RAM size in bytes (512 for MBC2's built-in RAM).
    pub fn ram_size(&self) -> usize {
        self.ram_size
    }

    pub fn cgb_support(&self) -> CgbSupport {
        self.cgb
    }

    pub fn header_checksum(&self) -> u8 {
        self.header_checksum
    }

    /// Whether a session of `model` runs this cartridge with CGB features.
    pub fn runs_in_cgb_mode(&self, model: Model) -> bool {
        model.is_cgb() && self.cgb != CgbSupport::None
    }
}

struct Header<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> {
    fn parse(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn title(&self) -> String {
        let mut raw = &self.data[0x0134..0x0144];
        // On color-aware carts the last title byte is the CGB flag.
        if raw[15] & 0x80 != 0 {
            raw = &raw[..15];
        }
        if let Some(pos) = raw.iter().position(|&b| b == 0) {
            raw = &raw[..pos];
        }
        String::from_utf8_lossy(raw).trim().to_string()
    }

    fn cgb_support(&self) -> CgbSupport {
        match self.data[0x0143] {
            0xC0 => CgbSupport::Only,
            0x80 => CgbSupport::Dual,
            _ => CgbSupport::None,
        }
    }

    fn cart_type(&self) -> u8 {
        self.data[0x0147]
    }

    fn checksum(&self) -> u8 {
        self.data[0x014D]
    }

    fn computed_checksum(&self) -> u8 {
        header_checksum(self.data)
    }

    fn decode_type(cart_type: u8) -> Result<(Mapper, Features)> {
        let mapper = match cart_type {
            0x00 | 0x08 | 0x09 => Mapper::NoMbc,
            0x01..=0x03 => Mapper::Mbc1,
            0x05 | 0x06 => Mapper::Mbc2,
            0x0F..=0x13 => Mapper::Mbc3,
            0x19..=0x1E => Mapper::Mbc5,
            other => return Err(CoreError::UnsupportedMapper(other)),
        };
        let features = Features {
            battery: matches!(
                cart_type,
                0x03 | 0x06 | 0x09 | 0x0F | 0x10 | 0x13 | 0x1B | 0x1E
            ),
            timer: matches!(cart_type, 0x0F | 0x10),
            rumble: matches!(cart_type, 0x1C..=0x1E),
        };
        Ok((mapper, features))
    }

    fn rom_banks(&self) -> Result<usize> {
        match self.data[0x0148] {
            code @ 0x00..=0x08 => Ok(2 << code),
            _ => Err(CoreError::InvalidHeader("unknown ROM size code")),
        }
    }

    fn ram_size(&self) -> Result<usize> {
        match self.data[0x0149] {
            0x00 => Ok(0),
            0x01 => Ok(0x800),
            0x02 => Ok(0x2000),
            0x03 => Ok(0x8000),
            0x04 => Ok(0x20000),
            0x05 => Ok(0x10000),
            _ => Err(CoreError::InvalidHeader("unknown RAM size code")),
        }
    }
}

/// Header checksum over 0x0134..=0x014C as the boot ROM computes it.
///
/// `rom` must be at least 0x014D bytes long.
pub fn header_checksum(rom: &[u8]) -> u8 {
    rom[0x0134..=0x014C]
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_sub(b).wrapping_sub(1))
}

/// Validated boot ROM image.
#[derive(Debug, Clone)]
pub struct BootRom {
    data: Arc<[u8]>,
    model: Model,
}

/// Accept a 256-byte DMG or 2304-byte CGB boot ROM.
pub fn load_boot_rom(bytes: impl Into<Vec<u8>>) -> Result<BootRom> {
    BootRom::new(bytes.into())
}

impl BootRom {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        let model = match data.len() {
            0x100 => Model::Dmg,
            0x900 => Model::Cgb,
            other => return Err(CoreError::BootRomSize(other)),
        };
        Ok(Self {
            data: data.into(),
            model,
        })
    }

    pub fn model(&self) -> Model {
        self.model
    }

    /// Byte mapped at `addr`, or `None` where the cartridge shows through
    /// (0x0100-0x01FF on CGB, everything past the image).
    pub fn read(&self, addr: u16) -> Option<u8> {
        let addr = addr as usize;
        if (0x100..0x200).contains(&addr) {
            return None;
        }
        self.data.get(addr).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rom_with(cart_type: u8, rom_code: u8, ram_code: u8) -> Vec<u8> {
        let mut rom = vec![0u8; 0x8000];
        rom[0x0134..0x0139].copy_from_slice(b"TESTS");
        rom[0x0147] = cart_type;
        rom[0x0148] = rom_code;
        rom[0x0149] = ram_code;
        rom[0x014D] = header_checksum(&rom);
        rom
    }

    #[test]
    fn parses_header_fields() {
        let cart = load_cartridge(rom_with(0x10, 0x00, 0x03)).unwrap();
        assert_eq!(cart.title(), "TESTS");
        assert_eq!(cart.mapper(), Mapper::Mbc3);
        assert_eq!(
            cart.features(),
            Features {
                battery: true,
                timer: true,
                rumble: false
            }
        );
        assert_eq!(cart.rom_banks(), 2);
        assert_eq!(cart.ram_size(), 0x8000);
        assert_eq!(cart.cgb_support(), CgbSupport::None);
    }

    #[test]
    fn cgb_flag_is_not_part_of_title() {
        let mut rom = rom_with(0x00, 0x00, 0x00);
        rom[0x0134..0x0143].copy_from_slice(b"FIFTEEN-CHARS!!");
        rom[0x0143] = 0xC0;
        rom[0x014D] = header_checksum(&rom);
        let cart = load_cartridge(rom).unwrap();
        assert_eq!(cart.title(), "FIFTEEN-CHARS!!");
        assert_eq!(cart.cgb_support(), CgbSupport::Only);
        assert!(cart.runs_in_cgb_mode(Model::Cgb));
        assert!(!cart.runs_in_cgb_mode(Model::Dmg));
    }

    #[test]
    fn mbc2_ram_is_internal() {
        let cart = load_cartridge(rom_with(0x06, 0x00, 0x00)).unwrap();
        assert_eq!(cart.ram_size(), 0x200);
        assert!(cart.features().battery);
    }

    #[test]
    fn rejects_bad_headers() {
        let mut rom = rom_with(0x01, 0x00, 0x00);
        rom[0x014D] ^= 0xFF;
        assert_eq!(
            load_cartridge(rom).err(),
            Some(CoreError::InvalidHeader("header checksum mismatch"))
        );
        assert_eq!(
            load_cartridge(rom_with(0x22, 0x00, 0x00)).err(),
            Some(CoreError::UnsupportedMapper(0x22))
        );
        assert!(matches!(
            load_cartridge(rom_with(0x00, 0x00, 0x07)),
            Err(CoreError::InvalidHeader(_))
        ));
        assert!(matches!(
            load_cartridge(vec![0u8; 0x100]),
            Err(CoreError::InvalidHeader(_))
        ));
    }

    #[test]
    fn boot_rom_sizes() {
        assert_eq!(load_boot_rom(vec![0; 0x100]).unwrap().model(), Model::Dmg);
        let cgb = load_boot_rom(vec![0xAA; 0x900]).unwrap();
        assert_eq!(cgb.model(), Model::Cgb);
        assert_eq!(cgb.read(0x00FF), Some(0xAA));
        assert_eq!(cgb.read(0x0150), None);
        assert_eq!(cgb.read(0x0200), Some(0xAA));
        assert_eq!(cgb.read(0x0900), None);
        assert_eq!(load_boot_rom(vec![0; 0x200]).err(), Some(CoreError::BootRomSize(0x200)));
    }
}
