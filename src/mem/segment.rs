use bitflags::bitflags;

pub const SEGMENT_SIZE: usize = 1 << u16::BITS;

bitflags! {
    /// NE segment-table flags the loader hands through. Only `CODE` changes
    /// core behavior (it triggers instruction decoding); the rest are kept
    /// for diagnostics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u16 {
        const CODE      = 0x0001;
        const DATA      = 0x0002;
        const MOVEABLE  = 0x0010;
        const SHAREABLE = 0x0020;
        const PRELOAD   = 0x0040;
        const HAS_RELOC = 0x0100;
    }
}

/// One relocation patched by the loader before the segment reaches the core.
/// Carried through untouched so diagnostic tooling can show where imports
/// landed.
#[derive(Debug, Clone)]
pub struct RelocationRecord {
    pub source_type: u8,
    pub flags: u8,
    pub offset: u16,
    pub target_segment: u16,
    pub target_offset: u16,
}

/// A code or data segment as delivered by the NE loader: ordinal, raw bytes
/// and flags. Exactly one backing buffer per ordinal, never more than 64 KiB.
#[derive(Debug, Clone)]
pub struct Segment {
    pub ordinal: u16,
    pub data: Vec<u8>,
    pub flags: SegmentFlags,
    pub relocations: Vec<RelocationRecord>,
}

impl Segment {
    pub fn new(ordinal: u16, data: Vec<u8>, flags: SegmentFlags) -> Self {
        debug_assert!(data.len() <= SEGMENT_SIZE, "segment {ordinal} exceeds 64 KiB");
        Self {
            ordinal,
            data,
            flags,
            relocations: Vec::new(),
        }
    }

    pub fn code(ordinal: u16, data: Vec<u8>) -> Self {
        Self::new(ordinal, data, SegmentFlags::CODE)
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        self.flags.contains(SegmentFlags::CODE)
    }
}
