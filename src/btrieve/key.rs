use std::cmp::Ordering;

use bitflags::bitflags;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Key attribute mask as stored in the legacy key definition block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct KeyAttributes: u16 {
        const DUPLICATES       = 0x0001;
        const MODIFIABLE       = 0x0002;
        const OLD_STYLE_BINARY = 0x0004;
        const NULL_ALL_SEGMENTS = 0x0008;
        const SEGMENTED_KEY    = 0x0010;
        const NUMBERED_ACS     = 0x0020;
        const DESCENDING       = 0x0040;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize, Deserialize)]
pub enum KeyDataType {
    String = 0,
    Integer = 1,
    Float = 2,
    Date = 3,
    Time = 4,
    Decimal = 5,
    Money = 6,
    Logical = 7,
    Numeric = 8,
    Bfloat = 9,
    Lstring = 10,
    Zstring = 11,
    UnsignedBinary = 14,
    AutoInc = 15,
}

impl KeyDataType {
    /// String-family keys compare bytewise with trailing NULs stripped.
    pub fn is_string(self) -> bool {
        matches!(self, KeyDataType::String | KeyDataType::Lstring | KeyDataType::Zstring)
    }
}

/// One segment of a key: where in the record it lives and how it compares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDefinition {
    pub number: u16,
    /// Byte offset into the record (the on-disk definition stores a 1-based
    /// position).
    pub offset: u16,
    pub length: u16,
    pub data_type: KeyDataType,
    pub attributes: KeyAttributes,
}

impl KeyDefinition {
    pub fn allows_duplicates(&self) -> bool {
        self.attributes.contains(KeyAttributes::DUPLICATES)
    }

    pub fn is_segmented(&self) -> bool {
        self.attributes.contains(KeyAttributes::SEGMENTED_KEY)
    }
}

/// A complete key: one or more ordered segments sharing a key number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrieveKey {
    pub segments: Vec<KeyDefinition>,
}

impl BtrieveKey {
    pub fn new(first: KeyDefinition) -> Self {
        Self { segments: vec![first] }
    }

    pub fn number(&self) -> u16 {
        self.segments[0].number
    }

    pub fn data_type(&self) -> KeyDataType {
        self.segments[0].data_type
    }

    pub fn offset(&self) -> u16 {
        self.segments[0].offset
    }

    pub fn total_length(&self) -> u16 {
        self.segments.iter().map(|s| s.length).sum()
    }

    /// Key bytes of a record. `length` is normally `total_length()` but may
    /// be wider when a caller queried with an oversized key buffer; the
    /// widened slice deliberately runs past the declared key into the
    /// neighboring struct fields.
    pub fn extract(&self, record: &[u8], length: u16) -> Vec<u8> {
        if self.segments.len() == 1 || length != self.total_length() {
            let start = (self.offset() as usize).min(record.len());
            let end = (start + length as usize).min(record.len());
            let mut key = record[start..end].to_vec();
            key.resize(length as usize, 0);
            return key;
        }
        let mut key = Vec::with_capacity(length as usize);
        for segment in &self.segments {
            let start = (segment.offset as usize).min(record.len());
            let end = (start + segment.length as usize).min(record.len());
            key.extend_from_slice(&record[start..end]);
        }
        key.resize(length as usize, 0);
        key
    }
}

/// Unsigned little-endian value of a 2- or 4-byte numeric key. Zero-length
/// keys read as zero. Signed ordering would arguably be more correct for
/// `Integer` keys, but the legacy engine compared unsigned and modules
/// depend on it.
pub fn numeric_value(bytes: &[u8]) -> u64 {
    match bytes.len() {
        0 => 0,
        2 => u16::from_le_bytes([bytes[0], bytes[1]]) as u64,
        4 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64,
        _ => {
            let mut value = 0u64;
            for (i, &b) in bytes.iter().take(8).enumerate() {
                value |= (b as u64) << (8 * i);
            }
            value
        }
    }
}

fn strip_trailing_nuls(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Ordering of two key values under the key's data type.
pub fn compare_key_values(data_type: KeyDataType, a: &[u8], b: &[u8]) -> Ordering {
    if data_type.is_string() {
        strip_trailing_nuls(a).cmp(strip_trailing_nuls(b))
    } else if matches!(a.len(), 2 | 4) && a.len() == b.len() {
        numeric_value(a).cmp(&numeric_value(b))
    } else {
        a.cmp(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zstring_key(offset: u16, length: u16) -> BtrieveKey {
        BtrieveKey::new(KeyDefinition {
            number: 0,
            offset,
            length,
            data_type: KeyDataType::Zstring,
            attributes: KeyAttributes::DUPLICATES,
        })
    }

    #[test]
    fn extract_pads_to_requested_length() {
        let key = zstring_key(2, 8);
        let record = b"xxABCDEFGHyy";
        assert_eq!(key.extract(record, 8), b"ABCDEFGH");
        assert_eq!(key.extract(record, 10), b"ABCDEFGHyy");
        assert_eq!(key.extract(b"xxAB", 8), b"AB\0\0\0\0\0\0");
    }

    #[test]
    fn string_comparison_strips_trailing_nuls() {
        assert_eq!(
            compare_key_values(KeyDataType::Zstring, b"ABC\0\0", b"ABC"),
            Ordering::Equal
        );
        assert_eq!(
            compare_key_values(KeyDataType::Zstring, b"ABD", b"ABC\0"),
            Ordering::Greater
        );
    }

    #[test]
    fn numeric_comparison_is_unsigned_little_endian() {
        // 0xFFFF (65535) > 0x0001 even though it is -1 signed.
        assert_eq!(
            compare_key_values(KeyDataType::Integer, &[0xFF, 0xFF], &[0x01, 0x00]),
            Ordering::Greater
        );
        assert_eq!(
            compare_key_values(
                KeyDataType::Integer,
                &0x0001_0000u32.to_le_bytes(),
                &0x0000_FFFFu32.to_le_bytes()
            ),
            Ordering::Greater
        );
    }

    #[test]
    fn zero_length_keys_read_as_zero() {
        assert_eq!(numeric_value(&[]), 0);
    }

    #[test]
    fn multi_segment_extraction_concatenates() {
        let mut key = zstring_key(0, 2);
        key.segments.push(KeyDefinition {
            number: 0,
            offset: 4,
            length: 2,
            data_type: KeyDataType::Zstring,
            attributes: KeyAttributes::SEGMENTED_KEY,
        });
        assert_eq!(key.extract(b"ABxxCDyy", 4), b"ABCD");
    }
}
