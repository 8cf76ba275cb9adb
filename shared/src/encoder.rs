/*!
Command encoder.

Turns symbolic register and command names into bit-exact [`Command`]s using
the templates of a [`ChipDescription`]:

- [`Encoder::build`] evaluates a template AST with caller supplied field values
- [`Encoder::encode_global_write`] merges registers sharing an address word
  into one `WrRegister` per address, ascending
- [`Encoder::encode_pixel_write`] shifts pixel register bit planes into the
  double column shift registers with `WrFrontEnd` and latches them
*/

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::trace;

use crate::chip::{ChipDescription, CommandTemplate, FieldDef, Part, PixelRegister};
use crate::command::{Command, CommandBits};
use crate::error::{ChipError, Result};
use crate::mask::PixelMatrix;
use crate::protocol::{COLPR_MODE_ALL, COLPR_MODE_SINGLE, CONF_MODE, DOUBLE_COLUMNS, PIXEL_DATA_BITS, ROWS, RUN_MODE};
use crate::registers::RegisterFile;

/// Global registers driving the pixel shift register logic
const PIXEL_CONTROL_REGISTERS: [&str; 7] = [
    "Pixel_Strobes",
    "Latch_En",
    "S0",
    "S1",
    "SR_Clr",
    "Colpr_Mode",
    "Colpr_Addr",
];

/// Value supplied for a template field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(u64),
    Bits(CommandBits),
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        Self::Int(value)
    }
}

impl From<CommandBits> for FieldValue {
    fn from(bits: CommandBits) -> Self {
        Self::Bits(bits)
    }
}

/// Field values keyed by field name
pub type Params = BTreeMap<String, FieldValue>;

/// Translates names into commands for one chip
#[derive(Debug, Clone)]
pub struct Encoder {
    description: Arc<ChipDescription>,
    chip_id: u8,
}

impl Encoder {
    /// Encoder addressing the chip ID stored in the description
    pub fn new(description: Arc<ChipDescription>) -> Self {
        let chip_id = description.chip_id();
        Self { description, chip_id }
    }

    pub fn with_chip_id(mut self, chip_id: u8) -> Self {
        self.chip_id = chip_id;
        self
    }

    pub fn description(&self) -> &Arc<ChipDescription> {
        &self.description
    }

    pub fn chip_id(&self) -> u8 {
        self.chip_id
    }

    /// Evaluate a template. Every field it references must be in `params`.
    pub fn build(&self, name: &str, params: &Params) -> Result<Command> {
        let template = self.description.template(name)?;
        let mut bits = CommandBits::with_capacity(template.bitlength);
        self.evaluate(template, params, &mut bits)?;
        Command::new(name, bits, template.bitlength)
    }

    fn evaluate(&self, template: &CommandTemplate, params: &Params, out: &mut CommandBits) -> Result<()> {
        for part in &template.parts {
            match part {
                Part::Literal(bits) => out.extend_from_bitslice(bits),
                Part::Template(name) => {
                    let sub = self.description.template(name)?;
                    self.evaluate(sub, params, out)?;
                }
                Part::Field(name) => {
                    let field = self.description.field(name)?;
                    let value = params.get(name).ok_or_else(|| ChipError::MissingParameter {
                        command: template.name.clone(),
                        field: name.clone(),
                    })?;
                    pack_field(field, value, out)?;
                }
            }
        }
        Ok(())
    }

    /// Build a template with `ChipID` filled in
    fn chip_command(&self, name: &str, fields: Vec<(&str, FieldValue)>) -> Result<Command> {
        let mut params = Params::new();
        params.insert(String::from("ChipID"), FieldValue::Int(self.chip_id as u64));
        for (field, value) in fields {
            params.insert(field.to_string(), value);
        }
        self.build(name, &params)
    }

    pub fn lv1(&self) -> Result<Command> {
        self.build("LV1", &Params::new())
    }

    pub fn cal(&self) -> Result<Command> {
        self.build("CAL", &Params::new())
    }

    pub fn bcr(&self) -> Result<Command> {
        self.build("BCR", &Params::new())
    }

    pub fn ecr(&self) -> Result<Command> {
        self.build("ECR", &Params::new())
    }

    pub fn global_reset(&self) -> Result<Command> {
        self.chip_command("GlobalReset", vec![])
    }

    pub fn global_pulse(&self, width: u64) -> Result<Command> {
        self.chip_command("GlobalPulse", vec![("Width", FieldValue::Int(width))])
    }

    pub fn run_mode(&self) -> Result<Command> {
        self.chip_command("RunMode", vec![("Mode", FieldValue::Int(RUN_MODE))])
    }

    pub fn conf_mode(&self) -> Result<Command> {
        self.chip_command("RunMode", vec![("Mode", FieldValue::Int(CONF_MODE))])
    }

    pub fn zeros(&self, length: usize) -> Command {
        Command::zeros(length)
    }

    /// `WrRegister` for one address word
    pub fn write_register_word(&self, address: usize, data: u16) -> Result<Command> {
        self.chip_command(
            "WrRegister",
            vec![
                ("Address", FieldValue::Int(address as u64)),
                ("GlobalData", FieldValue::Int(data as u64)),
            ],
        )
    }

    /// One `WrRegister` per address word touched by `names`, ascending by
    /// address. Each word carries every register stored in it, so the result
    /// does not depend on the order of `names`.
    pub fn encode_global_write<I, S>(&self, registers: &RegisterFile, names: I) -> Result<Vec<Command>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut addresses = BTreeSet::new();
        for name in names {
            let reg = self.description.global_register(name.as_ref())?;
            if reg.readonly {
                return Err(ChipError::ReadOnly(reg.name.clone()));
            }
            addresses.extend(reg.addresses());
        }
        self.write_words(&registers.address_words(), &addresses)
    }

    /// [`Encoder::encode_global_write`] for every writable register
    pub fn encode_global_write_all(&self, registers: &RegisterFile) -> Result<Vec<Command>> {
        let names = self
            .description
            .global_registers()
            .iter()
            .filter(|reg| !reg.readonly)
            .map(|reg| reg.name.clone())
            .collect::<Vec<_>>();
        self.encode_global_write(registers, names)
    }

    /// One `RdRegister` per address word touched by `names`, ascending
    pub fn encode_global_read<I, S>(&self, names: I) -> Result<Vec<Command>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut addresses = BTreeSet::new();
        for name in names {
            addresses.extend(self.description.global_register(name.as_ref())?.addresses());
        }
        addresses
            .into_iter()
            .map(|address| self.chip_command("RdRegister", vec![("Address", FieldValue::Int(address as u64))]))
            .collect()
    }

    fn write_words(&self, words: &[u16], addresses: &BTreeSet<usize>) -> Result<Vec<Command>> {
        addresses
            .iter()
            .map(|&address| self.write_register_word(address, words[address]))
            .collect()
    }

    /// Write pixel registers into the selected double columns.
    ///
    /// With `joint`, all (boolean) registers are strobed together and must
    /// hold identical contents. Otherwise every bit plane of every register
    /// is written separately. Per bit plane and double column a `Colpr_Addr`
    /// write is followed by `WrFrontEnd` and a latching `GlobalPulse`.
    pub fn encode_pixel_write<I, S>(
        &self,
        registers: &RegisterFile,
        names: I,
        double_columns: &[usize],
        joint: bool,
    ) -> Result<Vec<Command>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if let Some(&dc) = double_columns.iter().find(|&&dc| dc >= DOUBLE_COLUMNS) {
            return Err(ChipError::DoubleColumnOutOfRange(dc));
        }
        let planes = self.bit_planes(registers, names, joint)?;
        self.encode_planes(registers, &planes, double_columns, COLPR_MODE_SINGLE)
    }

    /// Write pixel registers into all double columns at once (`Colpr_Mode` = 3).
    ///
    /// Only valid when every double column holds the same pattern.
    pub fn encode_pixel_write_broadcast<I, S>(&self, registers: &RegisterFile, names: I, joint: bool) -> Result<Vec<Command>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let planes = self.bit_planes(registers, names, joint)?;
        for plane in &planes {
            if !registers.pixel_values(&plane.register)?.is_uniform_across_double_columns() {
                return Err(ChipError::NotUniform(plane.register.clone()));
            }
        }
        self.encode_planes(registers, &planes, &[0], COLPR_MODE_ALL)
    }

    fn bit_planes<I, S>(&self, registers: &RegisterFile, names: I, joint: bool) -> Result<Vec<BitPlane>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let regs = names
            .into_iter()
            .map(|name| self.description.pixel_register(name.as_ref()))
            .collect::<Result<Vec<&PixelRegister>>>()?;

        if joint {
            if let Some(reg) = regs.iter().find(|reg| !reg.is_boolean()) {
                return Err(ChipError::JointMultiBit(reg.name.clone()));
            }
            let Some(first) = regs.first() else {
                return Ok(Vec::new());
            };
            let reference = registers.pixel_values(&first.name)?;
            let mut strobes = 0u64;
            for reg in &regs {
                if registers.pixel_values(&reg.name)? != reference {
                    return Err(ChipError::JointMismatch(first.name.clone(), reg.name.clone()));
                }
                strobes |= 1 << reg.address;
            }
            return Ok(vec![BitPlane {
                register: first.name.clone(),
                value_bit: 0,
                strobes,
            }]);
        }

        Ok(regs
            .iter()
            .flat_map(|reg| {
                (0..reg.bitlength).map(move |plane| BitPlane {
                    register: reg.name.clone(),
                    value_bit: reg.plane_bit(plane),
                    strobes: 1 << (reg.address + plane),
                })
            })
            .collect())
    }

    fn encode_planes(
        &self,
        registers: &RegisterFile,
        planes: &[BitPlane],
        double_columns: &[usize],
        colpr_mode: u64,
    ) -> Result<Vec<Command>> {
        if planes.is_empty() || double_columns.is_empty() {
            return Ok(Vec::new());
        }

        let description = &self.description;
        let strobes_reg = description.global_register("Pixel_Strobes")?;
        let latch_reg = description.global_register("Latch_En")?;
        let s0_reg = description.global_register("S0")?;
        let s1_reg = description.global_register("S1")?;
        let sr_clr_reg = description.global_register("SR_Clr")?;
        let mode_reg = description.global_register("Colpr_Mode")?;
        let addr_reg = description.global_register("Colpr_Addr")?;
        let control_addresses = PIXEL_CONTROL_REGISTERS
            .iter()
            .map(|name| description.global_register(name).map(|reg| reg.addresses()))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect::<BTreeSet<usize>>();
        let column_addresses = addr_reg.addresses().collect::<BTreeSet<usize>>();

        let original = registers.address_words();
        let mut words = original.clone();
        s0_reg.insert_into(&mut words, 0);
        s1_reg.insert_into(&mut words, 0);
        sr_clr_reg.insert_into(&mut words, 0);
        latch_reg.insert_into(&mut words, 1);
        mode_reg.insert_into(&mut words, colpr_mode);

        let mut commands = Vec::new();
        for plane in planes {
            let values = registers.pixel_values(&plane.register)?;
            strobes_reg.insert_into(&mut words, plane.strobes);
            commands.extend(self.write_words(&words, &control_addresses)?);
            for &dc in double_columns {
                addr_reg.insert_into(&mut words, dc as u64);
                commands.extend(self.write_words(&words, &column_addresses)?);
                let data = double_column_bits(values, dc, plane.value_bit);
                commands.push(self.chip_command("WrFrontEnd", vec![("PixelData", FieldValue::Bits(data))])?);
                commands.push(self.global_pulse(0)?);
            }
        }
        // leave the control registers as the register file describes them
        commands.extend(self.write_words(&original, &control_addresses)?);

        trace!(
            "Encoded {} bit plane(s) for {} double column(s) into {} commands",
            planes.len(),
            double_columns.len(),
            commands.len()
        );
        Ok(commands)
    }
}

/// One strobe selection written with one set of WrFrontEnd commands
#[derive(Debug)]
struct BitPlane {
    register: String,
    value_bit: usize,
    strobes: u64,
}

/// Shift register contents of a double column for one value bit:
/// the even column top to bottom, then the odd column bottom to top.
pub fn double_column_bits(values: &PixelMatrix<u8>, dc: usize, value_bit: usize) -> CommandBits {
    let mut bits = CommandBits::with_capacity(PIXEL_DATA_BITS);
    let (first, second) = (2 * dc, 2 * dc + 1);
    bits.extend((0..ROWS).map(|row| (values.get(first, row) >> value_bit) & 1 == 1));
    bits.extend((0..ROWS).rev().map(|row| (values.get(second, row) >> value_bit) & 1 == 1));
    bits
}

fn pack_field(field: &FieldDef, value: &FieldValue, out: &mut CommandBits) -> Result<()> {
    match value {
        FieldValue::Int(value) => {
            let value = *value;
            if field.bitlength < 64 && value >> field.bitlength != 0 {
                return Err(ChipError::out_of_range(&field.name, value, field.bitlength));
            }
            for i in 0..field.bitlength {
                let bit = if field.littleendian { i } else { field.bitlength - 1 - i };
                out.push(bit < 64 && (value >> bit) & 1 == 1);
            }
        }
        FieldValue::Bits(bits) => {
            if bits.len() != field.bitlength {
                return Err(ChipError::LengthMismatch {
                    name: field.name.clone(),
                    expected: field.bitlength,
                    actual: bits.len(),
                });
            }
            out.extend_from_bitslice(bits);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::make_pixel_mask;

    fn setup() -> (Encoder, RegisterFile) {
        let description = Arc::new(ChipDescription::fei4b().unwrap());
        (Encoder::new(description.clone()), RegisterFile::new(description))
    }

    fn params(pairs: &[(&str, u64)]) -> Params {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), FieldValue::Int(*value)))
            .collect()
    }

    #[test]
    fn test_build_matches_declared_length() {
        let (encoder, _) = setup();
        let command = encoder
            .build("WrRegister", &params(&[("ChipID", 8), ("Address", 22), ("GlobalData", 0xABCD)]))
            .unwrap();
        assert_eq!(command.len(), 39);
        assert_eq!(
            command.to_bit_string(),
            format!("101101000{}{}{}{}", "0010", "1000", "010110", "1010101111001101")
        );
        assert_eq!(encoder.lv1().unwrap().to_bit_string(), "11101");
    }

    #[test]
    fn test_missing_parameter_fails() {
        let (encoder, _) = setup();
        let err = encoder
            .build("WrRegister", &params(&[("ChipID", 8), ("Address", 1)]))
            .unwrap_err();
        assert!(matches!(err, ChipError::MissingParameter { ref field, .. } if field == "GlobalData"));
    }

    #[test]
    fn test_out_of_range_parameter_fails() {
        let (encoder, _) = setup();
        let err = encoder
            .build("RdRegister", &params(&[("ChipID", 16), ("Address", 1)]))
            .unwrap_err();
        assert!(matches!(err, ChipError::OutOfRange { bits: 4, .. }));
        assert!(matches!(encoder.build("Nope", &Params::new()), Err(ChipError::UnknownName(_))));
    }

    #[test]
    fn test_global_write_is_order_independent() {
        let (encoder, mut regs) = setup();
        regs.set_global_value("Vthin_AltFine", 77).unwrap();
        regs.set_global_value("PlsrDAC", 512).unwrap();
        regs.set_global_value("TrigLat", 200).unwrap();
        let forward = encoder
            .encode_global_write(&regs, ["Vthin_AltFine", "PlsrDAC", "TrigLat", "Vthin_AltCoarse"])
            .unwrap();
        let backward = encoder
            .encode_global_write(&regs, ["Vthin_AltCoarse", "TrigLat", "PlsrDAC", "Vthin_AltFine"])
            .unwrap();
        assert_eq!(forward, backward);
        // Vthin_* share address 20, PlsrDAC is at 21, TrigLat at 25
        assert_eq!(forward.len(), 3);
        let addresses: Vec<String> = forward.iter().map(|c| c.to_bit_string()[17..23].to_string()).collect();
        assert_eq!(addresses, vec!["010100", "010101", "011001"]);
    }

    #[test]
    fn test_global_write_all_and_readonly() {
        let (encoder, regs) = setup();
        let all = encoder.encode_global_write_all(&regs).unwrap();
        // every address except the read-only serial number word and unused ones
        assert_eq!(all.len(), 30);
        assert!(matches!(
            encoder.encode_global_write(&regs, ["Chip_SN"]),
            Err(ChipError::ReadOnly(_))
        ));
        assert_eq!(encoder.encode_global_read(["DisableColumnCnfg"]).unwrap().len(), 3);
    }

    #[test]
    fn test_joint_write_rejects_multi_bit() {
        let (encoder, regs) = setup();
        let err = encoder
            .encode_pixel_write(&regs, ["Enable", "TDAC"], &[0], true)
            .unwrap_err();
        assert!(matches!(err, ChipError::JointMultiBit(ref name) if name == "TDAC"));
    }

    #[test]
    fn test_joint_write_requires_equal_contents() {
        let (encoder, mut regs) = setup();
        regs.set_pixel_mask("Enable", &make_pixel_mask(3, 0).unwrap()).unwrap();
        assert!(matches!(
            encoder.encode_pixel_write(&regs, ["Enable", "C_High"], &[0], true),
            Err(ChipError::JointMismatch(_, _))
        ));
        regs.set_pixel_mask("C_High", &make_pixel_mask(3, 0).unwrap()).unwrap();
        let commands = encoder
            .encode_pixel_write(&regs, ["Enable", "C_High"], &[0, 1], true)
            .unwrap();
        // 3 control words, then per DC: Colpr_Addr, WrFrontEnd, GlobalPulse, then 3 restoring words
        assert_eq!(commands.len(), 3 + 2 * 3 + 3);
        assert_eq!(commands.iter().filter(|c| c.name() == "WrFrontEnd").count(), 2);
    }

    #[test]
    fn test_pixel_write_bit_planes() {
        let (encoder, regs) = setup();
        let commands = encoder.encode_pixel_write(&regs, ["TDAC"], &[0, 5, 39], false).unwrap();
        assert_eq!(commands.iter().filter(|c| c.name() == "WrFrontEnd").count(), 5 * 3);
        assert!(matches!(
            encoder.encode_pixel_write(&regs, ["TDAC"], &[40], false),
            Err(ChipError::DoubleColumnOutOfRange(40))
        ));
    }

    #[test]
    fn test_double_column_bit_order() {
        let mut values = PixelMatrix::<u8>::filled(0);
        values.set(2, 0, 1);
        values.set(3, 0, 1);
        let bits = double_column_bits(&values, 1, 0);
        assert_eq!(bits.len(), PIXEL_DATA_BITS);
        assert!(bits[0]);
        assert!(bits[PIXEL_DATA_BITS - 1]);
        assert_eq!(bits.count_ones(), 2);
    }

    #[test]
    fn test_broadcast_requires_uniform_pattern() {
        let (encoder, mut regs) = setup();
        regs.set_pixel_mask("Enable", &make_pixel_mask(4, 1).unwrap()).unwrap();
        let commands = encoder.encode_pixel_write_broadcast(&regs, ["Enable"], true).unwrap();
        assert_eq!(commands.iter().filter(|c| c.name() == "WrFrontEnd").count(), 1);

        let mut values = PixelMatrix::<u8>::filled(0);
        values.set(10, 10, 1);
        regs.set_pixel_values("Enable", values).unwrap();
        assert!(matches!(
            encoder.encode_pixel_write_broadcast(&regs, ["Enable"], true),
            Err(ChipError::NotUniform(_))
        ));
    }
}
