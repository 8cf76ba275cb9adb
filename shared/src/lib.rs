/*!
# Shared Types and Utilities

This crate contains the chip-level types shared between the read-out
components of the FE-I4 pixel detector control system.

## Core Types

- [`ChipDescription`] - Immutable register and command description of a chip
- [`Command`] - Bit-exact command buffer sent over the serial command link
- [`Encoder`] - Translates register and command names into [`Command`]s
- [`RegisterFile`] - Current global and pixel register values
- [`PixelMatrix`] - 80 x 336 pixel matrix, [`PixelMask`] for boolean masks

## Modules

- [`chip`] - Chip description loading and validation
- [`command`] - Command bit vectors
- [`encoder`] - Template evaluation, global and pixel register writes
- [`registers`] - Register values and restore points
- [`mask`] - Pixel matrices and interleaved injection masks
- [`error`] - Common error types
*/

pub mod chip;
pub mod command;
pub mod encoder;
pub mod error;
pub mod mask;
pub mod registers;

// Re-export commonly used types
pub use chip::{ChipDescription, CommandTemplate, FieldDef, GlobalRegister, Part, PixelRegister};
pub use command::{Command, CommandBits};
pub use encoder::{Encoder, FieldValue, Params};
pub use error::{ChipError, Result};
pub use mask::{make_pixel_mask, PixelMask, PixelMatrix};
pub use registers::{RegisterFile, RestorePoint};

/// Version information for the shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol constants
pub mod protocol {
    /// Number of pixel columns
    pub const COLUMNS: usize = 80;

    /// Number of pixel rows
    pub const ROWS: usize = 336;

    /// Number of double columns (pairs of adjacent columns)
    pub const DOUBLE_COLUMNS: usize = COLUMNS / 2;

    /// Bits shifted into one double column by a front-end write
    pub const PIXEL_DATA_BITS: usize = 2 * ROWS;

    /// Width of a global register address word
    pub const GLOBAL_WORD_BITS: usize = 16;

    /// Maximum width of a pixel register
    pub const MAX_PIXEL_REGISTER_BITS: usize = 8;

    /// Colpr_Mode: only the double column in Colpr_Addr is addressed
    pub const COLPR_MODE_SINGLE: u64 = 0;

    /// Colpr_Mode: all double columns are addressed at once
    pub const COLPR_MODE_ALL: u64 = 3;

    /// RunMode field value entering run mode
    pub const RUN_MODE: u64 = 0b111000;

    /// RunMode field value entering configuration mode
    pub const CONF_MODE: u64 = 0b000111;

    /// Built-in FE-I4B chip description
    pub const DEFAULT_DESCRIPTION: &str = include_str!("../data/fei4b.toml");
}
