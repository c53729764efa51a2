use std::fmt;

use serde::{Deserialize, Serialize};

/// A 16-bit `segment:offset` pair, the only pointer shape guest code ever
/// sees. Offset arithmetic wraps at 64 KiB; segment arithmetic never wraps
/// (a wrapping segment is a corrupted pointer, not a valid address).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FarPtr {
    pub segment: u16,
    pub offset: u16,
}

impl FarPtr {
    pub const NULL: FarPtr = FarPtr { segment: 0, offset: 0 };

    /// Size of the serialized wire form.
    pub const SIZE: u16 = 4;

    pub const fn new(segment: u16, offset: u16) -> Self {
        Self { segment, offset }
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        self.segment == 0 && self.offset == 0
    }

    /// Wire form used on the guest stack and in guest structs:
    /// offset first, then segment, both little-endian.
    pub fn to_bytes(self) -> [u8; 4] {
        let off = self.offset.to_le_bytes();
        let seg = self.segment.to_le_bytes();
        [off[0], off[1], seg[0], seg[1]]
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            offset: u16::from_le_bytes([bytes[0], bytes[1]]),
            segment: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }

    /// Same segment, offset advanced with wrap-around.
    #[inline]
    pub fn offset_add(self, n: u16) -> Self {
        Self {
            segment: self.segment,
            offset: self.offset.wrapping_add(n),
        }
    }
}

impl fmt::Display for FarPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.segment, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_is_offset_then_segment() {
        let ptr = FarPtr::new(0x1234, 0xABCD);
        assert_eq!(ptr.to_bytes(), [0xCD, 0xAB, 0x34, 0x12]);
        assert_eq!(FarPtr::from_bytes(&ptr.to_bytes()), ptr);
    }

    #[test]
    fn null_requires_both_fields_zero() {
        assert!(FarPtr::new(0, 0).is_null());
        assert!(!FarPtr::new(0, 1).is_null());
        assert!(!FarPtr::new(1, 0).is_null());
    }

    #[test]
    fn offset_arithmetic_wraps() {
        let ptr = FarPtr::new(0x2000, 0xFFFE);
        assert_eq!(ptr.offset_add(4).offset, 0x0002);
        assert_eq!(ptr.offset_add(4).segment, 0x2000);
    }
}
