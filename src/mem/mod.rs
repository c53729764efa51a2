pub mod allocator;
pub mod farptr;
pub mod realmode;
pub mod segment;
pub mod segmented;

use std::collections::HashMap;

use log::warn;
use thiserror::Error;

pub use farptr::FarPtr;
pub use realmode::RealModeMemory;
pub use segment::{Segment, SegmentFlags, SEGMENT_SIZE};
pub use segmented::SegmentedMemory;

use crate::cpu::decoder::Instruction;

/// Segment reserved for handle-bearing pseudo-pointers (big memory blocks).
pub const BIG_BLOCK_SEGMENT: u16 = 0xFFFF;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("segmentation fault at {segment:04X}:{offset:04X}")]
    SegmentationFault { segment: u16, offset: u16 },
    #[error("no NUL terminator before end of segment at {0}")]
    MalformedCString(FarPtr),
    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(u16),
    #[error("free of null pointer")]
    FreeNull,
    #[error("free of pointer with no live allocation: {0}")]
    BadFree(FarPtr),
    #[error("segment {0:04X} already present")]
    DuplicateSegment(u16),
    #[error("not a big memory block pointer: {0}")]
    NotABigBlock(FarPtr),
    #[error("big block index {index} out of range (quantity {quantity})")]
    BigBlockIndex { index: u16, quantity: u16 },
}

impl MemoryError {
    pub(crate) fn segfault(segment: u16, offset: u16) -> Self {
        MemoryError::SegmentationFault { segment, offset }
    }
}

/// Named host-API allocations and big-block handles. Shared verbatim by both
/// memory variants; lives for the whole guest lifetime.
#[derive(Debug, Default)]
pub struct VariableDirectory {
    variables: HashMap<String, FarPtr>,
    big_blocks: Vec<Vec<FarPtr>>,
}

impl VariableDirectory {
    pub fn get(&self, name: &str) -> Option<FarPtr> {
        self.variables.get(name).copied()
    }

    pub fn insert(&mut self, name: &str, ptr: FarPtr) {
        self.variables.insert(name.to_owned(), ptr);
    }

    pub fn add_big_block(&mut self, elements: Vec<FarPtr>) -> u16 {
        self.big_blocks.push(elements);
        (self.big_blocks.len() - 1) as u16
    }

    pub fn big_block(&self, handle: u16) -> Option<&[FarPtr]> {
        self.big_blocks.get(handle as usize).map(Vec::as_slice)
    }
}

/// The contract both memory models implement. The CPU, the host-API layer
/// and the Btrieve shims all talk to guest memory exclusively through this
/// trait, so a module can run under either model unchanged.
pub trait MemoryCore {
    /// Register a loader-provided segment. Code segments are decoded into
    /// the instruction cache as a side effect.
    fn add_segment(&mut self, segment: Segment) -> Result<(), MemoryError>;

    fn has_segment(&self, segment: u16) -> bool;

    /// Cached decoded instruction whose first byte sits at `seg:ip`.
    fn get_instruction(&self, segment: u16, ip: u16) -> Option<Instruction>;

    /// Re-decode a short window at `seg:ip` and replace the cache entry.
    /// Used when linear decoding ran through embedded data and left the
    /// cache misaligned.
    fn recompile(&mut self, segment: u16, ip: u16) -> Result<Instruction, MemoryError>;

    fn get_byte(&self, segment: u16, offset: u16) -> Result<u8, MemoryError>;
    fn get_word(&self, segment: u16, offset: u16) -> Result<u16, MemoryError>;
    fn get_dword(&self, segment: u16, offset: u16) -> Result<u32, MemoryError>;

    fn set_byte(&mut self, segment: u16, offset: u16, value: u8) -> Result<(), MemoryError>;
    fn set_word(&mut self, segment: u16, offset: u16, value: u16) -> Result<(), MemoryError>;
    fn set_dword(&mut self, segment: u16, offset: u16, value: u32) -> Result<(), MemoryError>;

    fn get_array(&self, segment: u16, offset: u16, len: u16) -> Result<&[u8], MemoryError>;

    /// Copy `data` into guest memory, truncating to what fits the segment.
    fn set_array(&mut self, segment: u16, offset: u16, data: &[u8]) -> Result<(), MemoryError>;

    /// Bytes up to and including the first NUL (excluded iff `strip_null`).
    fn get_string(&self, segment: u16, offset: u16, strip_null: bool) -> Result<&[u8], MemoryError>;

    fn fill(&mut self, segment: u16, offset: u16, count: u16, value: u8) -> Result<(), MemoryError>;

    /// Zeroed allocation from the guest heap. Size 0 is valid and returns a
    /// distinct non-null pointer.
    fn malloc(&mut self, size: u16) -> Result<FarPtr, MemoryError>;

    fn free(&mut self, ptr: FarPtr) -> Result<(), MemoryError>;

    fn variables(&self) -> &VariableDirectory;
    fn variables_mut(&mut self) -> &mut VariableDirectory;

    /// Far pointer in guest wire form (offset word, then segment word).
    fn get_farptr(&self, segment: u16, offset: u16) -> Result<FarPtr, MemoryError> {
        let raw = self.get_dword(segment, offset)?;
        Ok(FarPtr::new((raw >> 16) as u16, raw as u16))
    }

    fn set_farptr(&mut self, segment: u16, offset: u16, ptr: FarPtr) -> Result<(), MemoryError> {
        self.set_dword(segment, offset, (ptr.segment as u32) << 16 | ptr.offset as u32)
    }

    /// Host-API scratch allocation registered under `name`. Re-allocating an
    /// existing name returns the prior pointer. With `declare_pointer`, a
    /// 4-byte variable `*name` holding the wire form of `name`'s pointer is
    /// allocated alongside.
    fn allocate_variable(
        &mut self,
        name: &str,
        size: u16,
        declare_pointer: bool,
    ) -> Result<FarPtr, MemoryError> {
        if let Some(existing) = self.variables().get(name) {
            warn!("variable {name} already allocated at {existing}, returning existing pointer");
            return Ok(existing);
        }
        let ptr = self.malloc(size)?;
        self.variables_mut().insert(name, ptr);
        if declare_pointer {
            let pointer_name = format!("*{name}");
            let pointer = self.malloc(FarPtr::SIZE)?;
            self.set_farptr(pointer.segment, pointer.offset, ptr)?;
            self.variables_mut().insert(&pointer_name, pointer);
        }
        Ok(ptr)
    }

    fn get_variable_pointer(&self, name: &str) -> Option<FarPtr> {
        self.variables().get(name)
    }

    /// `quantity` elements of `size` bytes each, addressed through a
    /// `(0xFFFF, handle)` pseudo-pointer.
    fn allocate_big_block(&mut self, quantity: u16, size: u16) -> Result<FarPtr, MemoryError> {
        let mut elements = Vec::with_capacity(quantity as usize);
        for index in 0..quantity {
            let name = format!("!BIGBLK{}:{index}", self.variables().big_blocks.len());
            let ptr = self.allocate_variable(&name, size, false)?;
            elements.push(ptr);
        }
        let handle = self.variables_mut().add_big_block(elements);
        Ok(FarPtr::new(BIG_BLOCK_SEGMENT, handle))
    }

    fn get_big_block(&self, ptr: FarPtr, index: u16) -> Result<FarPtr, MemoryError> {
        if ptr.segment != BIG_BLOCK_SEGMENT {
            return Err(MemoryError::NotABigBlock(ptr));
        }
        let block = self
            .variables()
            .big_block(ptr.offset)
            .ok_or(MemoryError::NotABigBlock(ptr))?;
        block
            .get(index as usize)
            .copied()
            .ok_or(MemoryError::BigBlockIndex { index, quantity: block.len() as u16 })
    }
}

/// Shared `get_string` scan over a borrowed segment slice.
pub(crate) fn scan_cstring(
    data: &[u8],
    segment: u16,
    offset: u16,
    strip_null: bool,
) -> Result<&[u8], MemoryError> {
    match data.iter().position(|&b| b == 0) {
        Some(nul) => Ok(&data[..nul + usize::from(!strip_null)]),
        None => Err(MemoryError::MalformedCString(FarPtr::new(segment, offset))),
    }
}
