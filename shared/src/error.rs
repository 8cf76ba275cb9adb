/*!
Common error types for the chip description and command encoder.
*/

use thiserror::Error;

/// Common result type used throughout the shared library
pub type Result<T> = std::result::Result<T, ChipError>;

/// Errors raised while loading a chip description or building commands.
///
/// All of these are construction-time errors: they are returned at the call
/// site before anything is sent to the hardware.
#[derive(Error, Debug)]
pub enum ChipError {
    /// Name not present in the chip description
    #[error("Unknown name: {0}")]
    UnknownName(String),

    /// A parameterized field of a command template was not supplied
    #[error("Missing parameter {field} for command {command}")]
    MissingParameter { command: String, field: String },

    /// Value does not fit into the target bit width
    #[error("Value {value} out of range for {name} ({bits} bits)")]
    OutOfRange { name: String, value: u64, bits: usize },

    /// Encoded bit length differs from the declared length
    #[error("Command {name} encoded to {actual} bits, declared {expected}")]
    LengthMismatch { name: String, expected: usize, actual: usize },

    /// Two global registers claim the same bits
    #[error("Global registers {0} and {1} overlap")]
    Overlap(String, String),

    /// Joint pixel writes are only possible for 1-bit registers
    #[error("Joint write requested for multi-bit pixel register {0}")]
    JointMultiBit(String),

    /// Jointly written pixel registers must carry identical contents
    #[error("Joint write of pixel registers {0} and {1} with different contents")]
    JointMismatch(String, String),

    /// Pixel register differs between double columns but a broadcast write was requested
    #[error("Pixel register {0} is not uniform across double columns")]
    NotUniform(String),

    /// Write to a read-only register
    #[error("Register {0} is read-only")]
    ReadOnly(String),

    /// Double column index outside 0..40
    #[error("Double column {0} out of range")]
    DoubleColumnOutOfRange(usize),

    /// Mask construction parameters are inconsistent
    #[error("Invalid mask: {0}")]
    InvalidMask(String),

    /// Structural problem in the chip description
    #[error("Invalid chip description: {0}")]
    InvalidDescription(String),

    /// I/O errors (loading a description file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("Failed to parse chip description: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ChipError {
    /// Create a new unknown name error
    pub fn unknown(name: impl Into<String>) -> Self {
        Self::UnknownName(name.into())
    }

    /// Create a new invalid description error
    pub fn invalid_description(msg: impl Into<String>) -> Self {
        Self::InvalidDescription(msg.into())
    }

    /// Create a new out-of-range error
    pub fn out_of_range(name: impl Into<String>, value: u64, bits: usize) -> Self {
        Self::OutOfRange {
            name: name.into(),
            value,
            bits,
        }
    }
}
