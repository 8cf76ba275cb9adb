/*!
Declarative chip description.

The description is loaded once from a TOML data file and validated into an
immutable name -> definition map: global registers, pixel registers,
template fields and command templates. Templates are kept as a small tagged
AST ([`Part`]) that the [`crate::Encoder`] evaluates recursively.
*/

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::path::Path;
use tracing::debug;

use crate::command::{parse_bit_str, CommandBits};
use crate::error::{ChipError, Result};
use crate::protocol::{GLOBAL_WORD_BITS, MAX_PIXEL_REGISTER_BITS};

/// Global (configuration) register definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalRegister {
    pub name: String,
    /// First 16-bit address word occupied by the register
    pub address: usize,
    /// Bit offset (from the LSB) inside the first address word
    pub offset: usize,
    pub bitlength: usize,
    #[serde(default)]
    pub default: u64,
    /// Register bits are stored reversed on the chip
    #[serde(default)]
    pub littleendian: bool,
    #[serde(default)]
    pub readonly: bool,
}

impl GlobalRegister {
    /// Absolute bit position of the register LSB
    pub fn first_bit(&self) -> usize {
        self.address * GLOBAL_WORD_BITS + self.offset
    }

    /// Address words touched by this register
    pub fn addresses(&self) -> RangeInclusive<usize> {
        let first = self.first_bit();
        let last = first + self.bitlength - 1;
        (first / GLOBAL_WORD_BITS)..=(last / GLOBAL_WORD_BITS)
    }

    pub fn max_value(&self) -> u64 {
        max_value(self.bitlength)
    }

    /// Write `value` into the address words, honoring the bit orientation
    pub fn insert_into(&self, words: &mut [u16], value: u64) {
        let chip_value = if self.littleendian {
            reverse_bits(value, self.bitlength)
        } else {
            value
        };
        for i in 0..self.bitlength {
            let position = self.first_bit() + i;
            let (word, bit) = (position / GLOBAL_WORD_BITS, position % GLOBAL_WORD_BITS);
            if (chip_value >> i) & 1 == 1 {
                words[word] |= 1 << bit;
            } else {
                words[word] &= !(1 << bit);
            }
        }
    }

    /// Read the register value back out of the address words
    pub fn extract_from(&self, words: &[u16]) -> u64 {
        let mut chip_value = 0u64;
        for i in 0..self.bitlength {
            let position = self.first_bit() + i;
            let (word, bit) = (position / GLOBAL_WORD_BITS, position % GLOBAL_WORD_BITS);
            if (words[word] >> bit) & 1 == 1 {
                chip_value |= 1 << i;
            }
        }
        if self.littleendian {
            reverse_bits(chip_value, self.bitlength)
        } else {
            chip_value
        }
    }
}

/// Pixel register definition. Storage is one value per pixel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRegister {
    pub name: String,
    /// Strobe index of the register's first bit plane
    pub address: usize,
    pub bitlength: usize,
    #[serde(default)]
    pub default: u8,
    #[serde(default)]
    pub littleendian: bool,
}

impl PixelRegister {
    pub fn is_boolean(&self) -> bool {
        self.bitlength == 1
    }

    pub fn max_value(&self) -> u8 {
        max_value(self.bitlength) as u8
    }

    /// Value bit carried by the bit plane at strobe `address + plane`
    pub fn plane_bit(&self, plane: usize) -> usize {
        if self.littleendian {
            plane
        } else {
            self.bitlength - 1 - plane
        }
    }
}

/// Parameter slot of a command template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub bitlength: usize,
    /// Integers are packed LSB first
    #[serde(default)]
    pub littleendian: bool,
}

/// One element of a template composition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Literal(CommandBits),
    Template(String),
    Field(String),
}

/// Command template: declared bit length plus ordered composition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub name: String,
    pub bitlength: usize,
    pub parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawPart {
    Literal(String),
    Template(String),
    Field(String),
}

#[derive(Debug, Deserialize)]
struct RawTemplate {
    name: String,
    bitlength: usize,
    parts: Vec<RawPart>,
}

#[derive(Debug, Deserialize)]
struct RawDescription {
    name: String,
    #[serde(default)]
    chip_id: u8,
    global_registers: Vec<GlobalRegister>,
    pixel_registers: Vec<PixelRegister>,
    fields: Vec<FieldDef>,
    commands: Vec<RawTemplate>,
}

/// Validated, immutable chip description
#[derive(Debug, Clone)]
pub struct ChipDescription {
    name: String,
    chip_id: u8,
    global_registers: Vec<GlobalRegister>,
    global_index: HashMap<String, usize>,
    pixel_registers: Vec<PixelRegister>,
    pixel_index: HashMap<String, usize>,
    fields: HashMap<String, FieldDef>,
    templates: HashMap<String, CommandTemplate>,
    address_words: usize,
}

impl ChipDescription {
    /// The built-in FE-I4B description
    pub fn fei4b() -> Result<Self> {
        Self::from_toml_str(crate::protocol::DEFAULT_DESCRIPTION)
    }

    /// Load a description from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML description
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: RawDescription = toml::from_str(content)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawDescription) -> Result<Self> {
        let mut names = HashSet::new();

        let mut global_index = HashMap::new();
        for (i, reg) in raw.global_registers.iter().enumerate() {
            if !names.insert(reg.name.clone()) {
                return Err(ChipError::invalid_description(format!("duplicate register {}", reg.name)));
            }
            if reg.bitlength == 0 || reg.bitlength > 64 {
                return Err(ChipError::invalid_description(format!(
                    "register {} has invalid bitlength {}",
                    reg.name, reg.bitlength
                )));
            }
            if reg.default > reg.max_value() {
                return Err(ChipError::out_of_range(&reg.name, reg.default, reg.bitlength));
            }
            global_index.insert(reg.name.clone(), i);
        }

        // Bit ranges must be disjoint
        let mut by_position: Vec<&GlobalRegister> = raw.global_registers.iter().collect();
        by_position.sort_by_key(|reg| reg.first_bit());
        for pair in by_position.windows(2) {
            if pair[0].first_bit() + pair[0].bitlength > pair[1].first_bit() {
                return Err(ChipError::Overlap(pair[0].name.clone(), pair[1].name.clone()));
            }
        }
        let address_words = raw
            .global_registers
            .iter()
            .map(|reg| reg.addresses().end() + 1)
            .max()
            .unwrap_or(0);

        let strobe_width = raw
            .global_registers
            .iter()
            .find(|reg| reg.name == "Pixel_Strobes")
            .map(|reg| reg.bitlength);
        let mut pixel_index = HashMap::new();
        for (i, reg) in raw.pixel_registers.iter().enumerate() {
            if !names.insert(reg.name.clone()) {
                return Err(ChipError::invalid_description(format!("duplicate register {}", reg.name)));
            }
            if reg.bitlength == 0 || reg.bitlength > MAX_PIXEL_REGISTER_BITS {
                return Err(ChipError::invalid_description(format!(
                    "pixel register {} has invalid bitlength {}",
                    reg.name, reg.bitlength
                )));
            }
            if reg.default > reg.max_value() {
                return Err(ChipError::out_of_range(&reg.name, reg.default as u64, reg.bitlength));
            }
            if let Some(width) = strobe_width {
                if reg.address + reg.bitlength > width {
                    return Err(ChipError::invalid_description(format!(
                        "pixel register {} strobes exceed Pixel_Strobes",
                        reg.name
                    )));
                }
            }
            pixel_index.insert(reg.name.clone(), i);
        }

        let mut fields = HashMap::new();
        for field in raw.fields {
            if field.bitlength == 0 {
                return Err(ChipError::invalid_description(format!("field {} has zero length", field.name)));
            }
            fields.insert(field.name.clone(), field);
        }

        let mut templates = HashMap::new();
        for raw_template in raw.commands {
            let parts = raw_template
                .parts
                .into_iter()
                .map(|part| match part {
                    RawPart::Literal(bits) => parse_bit_str(&bits).map(Part::Literal).ok_or_else(|| {
                        ChipError::invalid_description(format!(
                            "command {} has invalid literal {bits:?}",
                            raw_template.name
                        ))
                    }),
                    RawPart::Template(name) => Ok(Part::Template(name)),
                    RawPart::Field(name) => Ok(Part::Field(name)),
                })
                .collect::<Result<Vec<_>>>()?;
            let template = CommandTemplate {
                name: raw_template.name.clone(),
                bitlength: raw_template.bitlength,
                parts,
            };
            if templates.insert(raw_template.name.clone(), template).is_some() {
                return Err(ChipError::invalid_description(format!(
                    "duplicate command {}",
                    raw_template.name
                )));
            }
        }

        let description = Self {
            name: raw.name,
            chip_id: raw.chip_id,
            global_registers: raw.global_registers,
            global_index,
            pixel_registers: raw.pixel_registers,
            pixel_index,
            fields,
            templates,
            address_words,
        };

        for template in description.templates.values() {
            let length = description.static_length(template, &mut Vec::new())?;
            if length != template.bitlength {
                return Err(ChipError::LengthMismatch {
                    name: template.name.clone(),
                    expected: template.bitlength,
                    actual: length,
                });
            }
        }

        debug!(
            "Loaded chip description {}: {} global registers, {} pixel registers, {} commands",
            description.name,
            description.global_registers.len(),
            description.pixel_registers.len(),
            description.templates.len()
        );

        Ok(description)
    }

    /// Length of a template, rejecting unknown references and cycles
    fn static_length<'a>(&'a self, template: &'a CommandTemplate, stack: &mut Vec<&'a str>) -> Result<usize> {
        if stack.contains(&template.name.as_str()) {
            return Err(ChipError::invalid_description(format!(
                "command {} is recursive",
                template.name
            )));
        }
        stack.push(&template.name);
        let mut length = 0;
        for part in &template.parts {
            length += match part {
                Part::Literal(bits) => bits.len(),
                Part::Template(name) => self.static_length(self.template(name)?, stack)?,
                Part::Field(name) => self.field(name)?.bitlength,
            };
        }
        stack.pop();
        Ok(length)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Chip ID the description was written for (8 = broadcast)
    pub fn chip_id(&self) -> u8 {
        self.chip_id
    }

    /// Number of 16-bit address words covered by the global registers
    pub fn address_words(&self) -> usize {
        self.address_words
    }

    pub fn global_registers(&self) -> &[GlobalRegister] {
        &self.global_registers
    }

    pub fn global_register(&self, name: &str) -> Result<&GlobalRegister> {
        self.global_register_index(name).map(|i| &self.global_registers[i])
    }

    pub fn global_register_index(&self, name: &str) -> Result<usize> {
        self.global_index.get(name).copied().ok_or_else(|| ChipError::unknown(name))
    }

    /// Global registers with at least one bit in `address`
    pub fn registers_at_address(&self, address: usize) -> impl Iterator<Item = &GlobalRegister> {
        self.global_registers
            .iter()
            .filter(move |reg| reg.addresses().contains(&address))
    }

    pub fn pixel_registers(&self) -> &[PixelRegister] {
        &self.pixel_registers
    }

    pub fn pixel_register(&self, name: &str) -> Result<&PixelRegister> {
        self.pixel_register_index(name).map(|i| &self.pixel_registers[i])
    }

    pub fn pixel_register_index(&self, name: &str) -> Result<usize> {
        self.pixel_index.get(name).copied().ok_or_else(|| ChipError::unknown(name))
    }

    pub fn field(&self, name: &str) -> Result<&FieldDef> {
        self.fields.get(name).ok_or_else(|| ChipError::unknown(name))
    }

    pub fn template(&self, name: &str) -> Result<&CommandTemplate> {
        self.templates.get(name).ok_or_else(|| ChipError::unknown(name))
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }
}

/// Largest value representable in `bits` bits
pub fn max_value(bits: usize) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Reverse the lowest `width` bits of `value`
pub fn reverse_bits(value: u64, width: usize) -> u64 {
    if width == 0 {
        return 0;
    }
    value.reverse_bits() >> (64 - width)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
name = "test"
chip_id = 3

[[global_registers]]
name = "A"
address = 1
offset = 0
bitlength = 8

[[global_registers]]
name = "B"
address = 1
offset = 8
bitlength = 8
littleendian = true

[[pixel_registers]]
name = "Enable"
address = 0
bitlength = 1

[[fields]]
name = "ChipID"
bitlength = 4

[[commands]]
name = "Head"
bitlength = 3
parts = [{ literal = "101" }]

[[commands]]
name = "Cmd"
bitlength = 7
parts = [{ template = "Head" }, { field = "ChipID" }]
"#;

    #[test]
    fn test_builtin_description_loads() {
        let description = ChipDescription::fei4b().unwrap();
        assert_eq!(description.name(), "FE-I4B");
        assert_eq!(description.template("WrFrontEnd").unwrap().bitlength, 695);
        assert_eq!(description.pixel_register("TDAC").unwrap().bitlength, 5);
        assert_eq!(description.address_words(), 36);
        assert!(description.global_register("Chip_SN").unwrap().readonly);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, MINIMAL.as_bytes()).unwrap();

        let description = ChipDescription::load_from_file(file.path()).unwrap();
        assert_eq!(description.name(), "test");
        assert_eq!(description.chip_id(), 3);

        let err = ChipDescription::load_from_file("/nonexistent/chip.toml").unwrap_err();
        assert!(matches!(err, ChipError::Io(_)));
    }

    #[test]
    fn test_multi_word_register_addresses() {
        let description = ChipDescription::fei4b().unwrap();
        let reg = description.global_register("DisableColumnCnfg").unwrap();
        assert_eq!(reg.addresses(), 23..=25);
        let at_25: Vec<_> = description.registers_at_address(25).map(|r| r.name.as_str()).collect();
        assert_eq!(at_25, vec!["DisableColumnCnfg", "TrigLat"]);
    }

    #[test]
    fn test_insert_extract_littleendian() {
        let description = ChipDescription::from_toml_str(MINIMAL).unwrap();
        let b = description.global_register("B").unwrap();
        let mut words = vec![0u16; description.address_words()];
        b.insert_into(&mut words, 0b0000_0001);
        assert_eq!(words[1], 0b1000_0000_0000_0000);
        assert_eq!(b.extract_from(&words), 1);
    }

    #[test]
    fn test_overlap_rejected() {
        let overlapping = MINIMAL.replace("offset = 8", "offset = 7");
        let err = ChipDescription::from_toml_str(&overlapping).unwrap_err();
        assert!(matches!(err, ChipError::Overlap(_, _)));
    }

    #[test]
    fn test_declared_length_checked() {
        let wrong = MINIMAL.replace("bitlength = 7", "bitlength = 8");
        let err = ChipDescription::from_toml_str(&wrong).unwrap_err();
        assert!(matches!(err, ChipError::LengthMismatch { expected: 8, actual: 7, .. }));
    }

    #[test]
    fn test_recursive_template_rejected() {
        let recursive = MINIMAL.replace(r#"{ literal = "101" }"#, r#"{ template = "Cmd" }"#);
        assert!(matches!(
            ChipDescription::from_toml_str(&recursive),
            Err(ChipError::InvalidDescription(_))
        ));
    }

    #[test]
    fn test_reverse_bits() {
        assert_eq!(reverse_bits(0b001, 3), 0b100);
        assert_eq!(reverse_bits(0b1101, 4), 0b1011);
        assert_eq!(max_value(10), 1023);
    }
}
