/*!
Register values and restore points.

[`RegisterFile`] holds the current value of every global and pixel register
of one chip. A [`RestorePoint`] is a plain value copy of those values, so
later writes can never leak into a snapshot.
*/

use std::sync::Arc;

use crate::chip::ChipDescription;
use crate::error::{ChipError, Result};
use crate::mask::{PixelMask, PixelMatrix};

/// Named deep copy of all register values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePoint {
    name: String,
    global: Vec<u64>,
    pixel: Vec<PixelMatrix<u8>>,
}

impl RestorePoint {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Current register values of one chip
#[derive(Debug, Clone)]
pub struct RegisterFile {
    description: Arc<ChipDescription>,
    global: Vec<u64>,
    pixel: Vec<PixelMatrix<u8>>,
}

impl RegisterFile {
    /// Register file initialised with the description defaults
    pub fn new(description: Arc<ChipDescription>) -> Self {
        let global = description.global_registers().iter().map(|reg| reg.default).collect();
        let pixel = description
            .pixel_registers()
            .iter()
            .map(|reg| PixelMatrix::filled(reg.default))
            .collect();
        Self {
            description,
            global,
            pixel,
        }
    }

    pub fn description(&self) -> &Arc<ChipDescription> {
        &self.description
    }

    pub fn global_value(&self, name: &str) -> Result<u64> {
        let index = self.description.global_register_index(name)?;
        Ok(self.global[index])
    }

    /// Set a writable global register, range checked
    pub fn set_global_value(&mut self, name: &str, value: u64) -> Result<()> {
        let index = self.description.global_register_index(name)?;
        let reg = &self.description.global_registers()[index];
        if reg.readonly {
            return Err(ChipError::ReadOnly(name.to_string()));
        }
        if value > reg.max_value() {
            return Err(ChipError::out_of_range(name, value, reg.bitlength));
        }
        self.global[index] = value;
        Ok(())
    }

    pub fn pixel_values(&self, name: &str) -> Result<&PixelMatrix<u8>> {
        let index = self.description.pixel_register_index(name)?;
        Ok(&self.pixel[index])
    }

    /// Replace a pixel register matrix, range checked per pixel
    pub fn set_pixel_values(&mut self, name: &str, values: PixelMatrix<u8>) -> Result<()> {
        let index = self.description.pixel_register_index(name)?;
        let reg = &self.description.pixel_registers()[index];
        if let Some((_, _, value)) = values.iter().find(|(_, _, value)| *value > reg.max_value()) {
            return Err(ChipError::out_of_range(name, value as u64, reg.bitlength));
        }
        self.pixel[index] = values;
        Ok(())
    }

    /// Write a boolean mask (0/1) into a pixel register
    pub fn set_pixel_mask(&mut self, name: &str, mask: &PixelMask) -> Result<()> {
        self.set_pixel_values(name, mask.to_values())
    }

    /// Set every pixel of a register to `value`
    pub fn fill_pixel_values(&mut self, name: &str, value: u8) -> Result<()> {
        self.set_pixel_values(name, PixelMatrix::filled(value))
    }

    /// Current contents of all address words, merged from every register
    pub fn address_words(&self) -> Vec<u16> {
        let mut words = vec![0u16; self.description.address_words()];
        for (reg, &value) in self.description.global_registers().iter().zip(&self.global) {
            reg.insert_into(&mut words, value);
        }
        words
    }

    /// Value copy of all registers
    pub fn create_restore_point(&self, name: impl Into<String>) -> RestorePoint {
        RestorePoint {
            name: name.into(),
            global: self.global.clone(),
            pixel: self.pixel.clone(),
        }
    }

    /// Swap the values of `point` back in, consuming it
    pub fn restore(&mut self, point: RestorePoint) {
        self.global = point.global;
        self.pixel = point.pixel;
    }

    /// Names of pixel registers whose contents differ from `point`
    pub fn changed_pixel_registers(&self, point: &RestorePoint) -> Vec<String> {
        self.description
            .pixel_registers()
            .iter()
            .zip(self.pixel.iter().zip(&point.pixel))
            .filter(|(_, (current, saved))| current != saved)
            .map(|(reg, _)| reg.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::make_pixel_mask;

    fn registers() -> RegisterFile {
        RegisterFile::new(Arc::new(ChipDescription::fei4b().unwrap()))
    }

    #[test]
    fn test_defaults_and_range_checks() {
        let mut regs = registers();
        assert_eq!(regs.global_value("PlsrDAC").unwrap(), 300);
        assert!(regs.set_global_value("PlsrDAC", 1023).is_ok());
        assert!(matches!(
            regs.set_global_value("PlsrDAC", 1024),
            Err(ChipError::OutOfRange { .. })
        ));
        assert!(matches!(regs.set_global_value("Chip_SN", 1), Err(ChipError::ReadOnly(_))));
        assert!(matches!(regs.global_value("Nope"), Err(ChipError::UnknownName(_))));
        assert!(regs.fill_pixel_values("TDAC", 32).is_err());
    }

    #[test]
    fn test_restore_point_is_not_aliased() {
        let mut regs = registers();
        let point = regs.create_restore_point("before");
        regs.set_global_value("Vthin_AltFine", 42).unwrap();
        regs.set_pixel_mask("Enable", &make_pixel_mask(3, 0).unwrap()).unwrap();
        assert_eq!(regs.changed_pixel_registers(&point), vec!["Enable".to_string()]);

        regs.restore(point);
        assert_eq!(regs.global_value("Vthin_AltFine").unwrap(), 150);
        assert!(regs.pixel_values("Enable").unwrap().iter().all(|(_, _, v)| v == 1));
    }

    #[test]
    fn test_address_words_merge_registers() {
        let mut regs = registers();
        regs.set_global_value("Colpr_Mode", 3).unwrap();
        regs.set_global_value("Colpr_Addr", 0b000001).unwrap();
        let words = regs.address_words();
        // both registers are littleendian: Colpr_Mode 0b11 stays, Colpr_Addr 1 -> 0b100000 at offset 2
        assert_eq!(words[22], (0b11 << 8) | (0b100000 << 2));
    }
}
