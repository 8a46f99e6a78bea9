/// Master clock of both models in single-speed mode, in T-cycles per second.
pub const CLOCK_HZ: u32 = 4_194_304;

/// T-cycles (dots) in one full LCD frame: 154 lines of 456 dots.
pub const CYCLES_PER_FRAME: u32 = 70_224;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Console model the session emulates.
///
/// The model decides the post-boot register values, which boot ROM size is
/// accepted, whether CGB-only registers are decoded and how wave RAM behaves
/// while channel 3 is playing.
pub enum Model {
    #[default]
    Dmg,
    Cgb,
}

impl Model {
    #[inline]
    pub const fn is_cgb(self) -> bool {
        matches!(self, Model::Cgb)
    }

    /// Boot ROM size this model maps.
    #[inline]
    pub const fn boot_rom_len(self) -> usize {
        match self {
            Model::Dmg => 0x100,
            Model::Cgb => 0x900,
        }
    }
}
