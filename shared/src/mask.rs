/*!
Pixel matrices and injection masks.

Matrices are stored column-major (`[col][row]`), 0-based, 80 columns by
336 rows. [`make_pixel_mask`] builds the interleaved masks used during charge
injection: with `steps` groups every pixel is enabled in exactly one shift.
*/

use std::ops::Range;

use crate::error::{ChipError, Result};
use crate::protocol::{COLUMNS, ROWS};

/// Fixed-size 80 x 336 pixel matrix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelMatrix<T> {
    data: Vec<T>,
}

/// Boolean pixel matrix
pub type PixelMask = PixelMatrix<bool>;

impl<T: Copy> PixelMatrix<T> {
    /// Matrix with every pixel set to `value`
    pub fn filled(value: T) -> Self {
        Self {
            data: vec![value; COLUMNS * ROWS],
        }
    }

    pub fn get(&self, col: usize, row: usize) -> T {
        self.data[col * ROWS + row]
    }

    pub fn set(&mut self, col: usize, row: usize, value: T) {
        self.data[col * ROWS + row] = value;
    }

    /// All rows of one column
    pub fn column(&self, col: usize) -> &[T] {
        &self.data[col * ROWS..(col + 1) * ROWS]
    }

    /// Iterate over `(col, row, value)`
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        self.data
            .iter()
            .enumerate()
            .map(|(i, &value)| (i / ROWS, i % ROWS, value))
    }

    pub fn map<U: Copy>(&self, f: impl Fn(T) -> U) -> PixelMatrix<U> {
        PixelMatrix {
            data: self.data.iter().map(|&value| f(value)).collect(),
        }
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
}

impl<T: Copy + Default> Default for PixelMatrix<T> {
    fn default() -> Self {
        Self::filled(T::default())
    }
}

impl<T: Copy + PartialEq> PixelMatrix<T> {
    /// True if both columns of every double column equal those of double column 0
    pub fn is_uniform_across_double_columns(&self) -> bool {
        (2..COLUMNS).all(|col| self.column(col) == self.column(col % 2))
    }
}

impl PixelMask {
    /// Number of set pixels
    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&value| value).count()
    }

    pub fn invert(&self) -> Self {
        self.map(|value| !value)
    }

    pub fn and(&self, other: &Self) -> Self {
        Self {
            data: self.data.iter().zip(&other.data).map(|(a, b)| *a && *b).collect(),
        }
    }

    pub fn or(&self, other: &Self) -> Self {
        Self {
            data: self.data.iter().zip(&other.data).map(|(a, b)| *a || *b).collect(),
        }
    }

    /// Register values (0/1) for writing the mask into a pixel register
    pub fn to_values(&self) -> PixelMatrix<u8> {
        self.map(u8::from)
    }
}

/// Interleaved injection mask for one shift out of `steps`.
///
/// Even columns start at row `shift`, odd columns at `(steps / 2 + shift) % steps`,
/// so neighbouring columns are never enabled on adjacent rows.
pub fn make_pixel_mask(steps: usize, shift: usize) -> Result<PixelMask> {
    make_pixel_mask_with(steps, shift, None, None)
}

/// [`make_pixel_mask`] restricted to `enable_columns` and intersected with `mask`
pub fn make_pixel_mask_with(
    steps: usize,
    shift: usize,
    enable_columns: Option<&[usize]>,
    mask: Option<&PixelMask>,
) -> Result<PixelMask> {
    if steps == 0 || steps > ROWS {
        return Err(ChipError::InvalidMask(format!("mask steps {steps} not in 1..={ROWS}")));
    }
    if shift >= steps {
        return Err(ChipError::InvalidMask(format!("shift {shift} not below {steps} steps")));
    }

    let mut result = PixelMask::filled(false);
    let even_start = shift % steps;
    let odd_start = (steps / 2 + shift) % steps;
    for col in 0..COLUMNS {
        if let Some(columns) = enable_columns {
            if !columns.contains(&col) {
                continue;
            }
        }
        let start = if col % 2 == 0 { even_start } else { odd_start };
        for row in (start..ROWS).step_by(steps) {
            result.set(col, row, true);
        }
    }

    Ok(match mask {
        Some(mask) => result.and(mask),
        None => result,
    })
}

/// Mask with a rectangular region set
pub fn make_box_pixel_mask(columns: Range<usize>, rows: Range<usize>) -> PixelMask {
    let mut mask = PixelMask::filled(false);
    for col in columns.start..columns.end.min(COLUMNS) {
        for row in rows.start..rows.end.min(ROWS) {
            mask.set(col, row, true);
        }
    }
    mask
}

/// Double column a pixel column belongs to
pub fn double_column_of(col: usize) -> usize {
    col / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partition(steps: usize) {
        let mut hits = PixelMatrix::<u8>::filled(0);
        for shift in 0..steps {
            let mask = make_pixel_mask(steps, shift).unwrap();
            for (col, row, set) in mask.iter() {
                if set {
                    hits.set(col, row, hits.get(col, row) + 1);
                }
            }
        }
        assert!(hits.iter().all(|(_, _, count)| count == 1), "steps = {steps}");
    }

    #[test]
    fn test_masks_cover_every_pixel_once() {
        for steps in [1, 2, 3, 4, 5, 6, 7, 8, 12, 26, 336] {
            assert_partition(steps);
        }
    }

    #[test]
    fn test_column_parity_offset() {
        let mask = make_pixel_mask(4, 1).unwrap();
        // even column starts at the shift, odd column is offset by steps / 2
        assert!(mask.get(0, 1) && mask.get(0, 5) && !mask.get(0, 2));
        assert!(mask.get(1, 3) && mask.get(1, 7) && !mask.get(1, 1));
    }

    #[test]
    fn test_invalid_steps_rejected() {
        assert!(make_pixel_mask(0, 0).is_err());
        assert!(make_pixel_mask(3, 3).is_err());
    }

    #[test]
    fn test_caller_mask_intersection() {
        let allowed = make_box_pixel_mask(0..2, 0..10);
        let mask = make_pixel_mask_with(3, 0, None, Some(&allowed)).unwrap();
        assert_eq!(mask.count(), 4 + 3);
        assert!(!mask.get(2, 0));
    }

    #[test]
    fn test_uniform_across_double_columns() {
        assert!(make_pixel_mask(3, 2).unwrap().is_uniform_across_double_columns());
        let box_mask = make_box_pixel_mask(4..6, 0..ROWS);
        assert!(!box_mask.is_uniform_across_double_columns());
        assert_eq!(double_column_of(79), 39);
    }
}
