/*!
Command bit vectors.

A [`Command`] is the unit sent over the serial command link: an immutable,
MSB-first bit vector whose length was checked against the declared template
length when it was built.
*/

use bitvec::prelude::*;
use std::fmt;

use crate::error::{ChipError, Result};

/// Bit storage used for all command buffers
pub type CommandBits = BitVec<u8, Msb0>;

/// Immutable command buffer with a checked length
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    bits: CommandBits,
}

impl Command {
    /// Wrap `bits`, failing unless the length equals `declared_len`
    pub fn new(name: impl Into<String>, bits: CommandBits, declared_len: usize) -> Result<Self> {
        let name = name.into();
        if bits.len() != declared_len {
            return Err(ChipError::LengthMismatch {
                name,
                expected: declared_len,
                actual: bits.len(),
            });
        }
        Ok(Self { name, bits })
    }

    /// A run of `len` zero bits, used as delay between commands
    pub fn zeros(len: usize) -> Self {
        Self {
            name: String::from("zeros"),
            bits: BitVec::repeat(false, len),
        }
    }

    /// Parse a string of '0'/'1' characters
    pub fn from_bit_str(name: impl Into<String>, bit_str: &str) -> Result<Self> {
        let name = name.into();
        let bits = parse_bit_str(bit_str)
            .ok_or_else(|| ChipError::invalid_description(format!("{name}: invalid bit string")))?;
        let len = bits.len();
        Self::new(name, bits, len)
    }

    /// Template name this command was built from
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bits(&self) -> &BitSlice<u8, Msb0> {
        &self.bits
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Concatenate commands into one contiguous bit stream
    pub fn join(commands: &[Command]) -> CommandBits {
        let total = commands.iter().map(Command::len).sum();
        let mut bits = CommandBits::with_capacity(total);
        for command in commands {
            bits.extend_from_bitslice(&command.bits);
        }
        bits
    }

    /// Pack the bits MSB-first into bytes, zero padded at the end
    pub fn to_bytes(&self) -> Vec<u8> {
        pack_bits(&self.bits)
    }

    /// Render as a string of '0'/'1' characters
    pub fn to_bit_string(&self) -> String {
        self.bits
            .iter()
            .by_vals()
            .map(|bit| if bit { '1' } else { '0' })
            .collect()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}] 0x{}", self.name, self.len(), hex::encode(self.to_bytes()))
    }
}

/// Pack a bit slice MSB-first into bytes
pub fn pack_bits(bits: &BitSlice<u8, Msb0>) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (i, bit) in bits.iter().by_vals().enumerate() {
        if bit {
            bytes[i / 8] |= 0x80 >> (i % 8);
        }
    }
    bytes
}

/// Unpack the first `len` bits (MSB-first) of `bytes`
pub fn unpack_bits(bytes: &[u8], len: usize) -> CommandBits {
    let mut bits = CommandBits::from_slice(bytes);
    bits.truncate(len.min(bits.len()));
    bits
}

/// Parse a string of '0'/'1' characters, `None` on any other character
pub fn parse_bit_str(bit_str: &str) -> Option<CommandBits> {
    bit_str
        .chars()
        .map(|c| match c {
            '0' => Some(false),
            '1' => Some(true),
            _ => None,
        })
        .collect()
}
