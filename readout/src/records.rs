/*!
FE-I4 data record words as they appear in the FIFO.

Each FIFO word carries one 24-bit front-end record in its low bits. Records
starting with `11101` are headers, anything else is a hit record
`column(7) row(9) tot1(4) tot2(4)` with 1-based column and row.
*/

pub const DATA_HEADER: u32 = 0xE9;
pub const ADDRESS_RECORD: u32 = 0xEA;
pub const VALUE_RECORD: u32 = 0xEC;
pub const SERVICE_RECORD: u32 = 0xEF;

const RECORD_MASK: u32 = 0x00FF_FFFF;

/// ToT code of a pixel that saw no second hit
pub const NO_HIT_TOT: u8 = 0xF;

/// Decoded front-end record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    DataHeader { lv1_id: u8, bcid: u16 },
    Hit { column: u8, row: u16, tot1: u8, tot2: u8 },
    Address { global: bool, address: u16 },
    Value(u16),
    Service { code: u8, count: u16 },
    Unknown(u32),
}

pub fn data_header(lv1_id: u32, bcid: u32) -> u32 {
    (DATA_HEADER << 16) | ((lv1_id & 0x1F) << 10) | (bcid & 0x3FF)
}

/// Hit record for a 0-based pixel position
pub fn hit(col: usize, row: usize, tot1: u8, tot2: u8) -> u32 {
    (((col as u32 + 1) & 0x7F) << 17) | (((row as u32 + 1) & 0x1FF) << 8) | ((tot1 as u32 & 0xF) << 4) | (tot2 as u32 & 0xF)
}

pub fn address_record(address: u16) -> u32 {
    (ADDRESS_RECORD << 16) | (address as u32 & 0x7FFF)
}

pub fn value_record(value: u16) -> u32 {
    (VALUE_RECORD << 16) | value as u32
}

pub fn decode(word: u32) -> Record {
    let record = word & RECORD_MASK;
    let header = record >> 16;
    match header {
        DATA_HEADER => Record::DataHeader {
            lv1_id: ((record >> 10) & 0x1F) as u8,
            bcid: (record & 0x3FF) as u16,
        },
        ADDRESS_RECORD => Record::Address {
            global: record & 0x8000 == 0,
            address: (record & 0x7FFF) as u16,
        },
        VALUE_RECORD => Record::Value((record & 0xFFFF) as u16),
        SERVICE_RECORD => Record::Service {
            code: ((record >> 10) & 0x3F) as u8,
            count: (record & 0x3FF) as u16,
        },
        _ if header >> 3 == 0b11101 => Record::Unknown(record),
        _ => {
            let column = (record >> 17) as u8;
            let row = ((record >> 8) & 0x1FF) as u16;
            if column == 0 || row == 0 {
                return Record::Unknown(record);
            }
            Record::Hit {
                column,
                row,
                tot1: ((record >> 4) & 0xF) as u8,
                tot2: (record & 0xF) as u8,
            }
        }
    }
}

/// Number of hit records in `words`
pub fn count_hits(words: &[u32]) -> usize {
    words
        .iter()
        .filter(|&&word| matches!(decode(word), Record::Hit { .. }))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_records() {
        assert_eq!(decode(data_header(3, 700)), Record::DataHeader { lv1_id: 3, bcid: 700 });
        assert_eq!(
            decode(hit(79, 335, 6, NO_HIT_TOT)),
            Record::Hit { column: 80, row: 336, tot1: 6, tot2: 0xF }
        );
        assert_eq!(decode(address_record(22)), Record::Address { global: true, address: 22 });
        assert_eq!(decode(value_record(0xBEEF)), Record::Value(0xBEEF));
        assert_eq!(count_hits(&[data_header(0, 0), hit(0, 0, 1, 15), hit(1, 1, 1, 15)]), 2);
    }
}
