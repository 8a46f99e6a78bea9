use thiserror::Error;

/// Errors surfaced to the host.
///
/// Construction-time failures are returned from the `load_*` functions and
/// [`Session::new`](crate::session::Session::new). A failure inside
/// [`Session::tick`](crate::session::Session::tick) stops the session; the same
/// error is returned again by every later tick.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("unsupported cartridge type {0:#04X}")]
    UnsupportedMapper(u8),

    #[error("invalid cartridge header: {0}")]
    InvalidHeader(&'static str),

    #[error("illegal instruction {opcode:#04X} at {pc:#06X}")]
    IllegalInstruction { opcode: u8, pc: u16 },

    #[error("save RAM is {actual} bytes, cartridge expects {expected}")]
    SaveRamSizeMismatch { expected: usize, actual: usize },

    #[error("incompatible save state: {0}")]
    SaveStateIncompatible(&'static str),

    #[error("boot ROM must be 256 (DMG) or 2304 (CGB) bytes, got {0}")]
    BootRomSize(usize),

    #[error("patch rejected: {0}")]
    InvalidPatch(&'static str),
}

pub type Result<T> = std::result::Result<T, CoreError>;
