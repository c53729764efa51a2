//! The flat memory model: one 1 MiB image addressed as `segment*16 + offset`,
//! for modules that assume real-mode pointer arithmetic holds.

use std::collections::HashMap;

use log::warn;

use crate::cpu::decoder::{self, Instruction, RECOMPILE_WINDOW};
use crate::mem::allocator::HeapAllocator;
use crate::mem::segment::{Segment, SEGMENT_SIZE};
use crate::mem::{scan_cstring, FarPtr, MemoryCore, MemoryError, VariableDirectory};

pub const MEMORY_SIZE: usize = 1 << 20;

/// All heap allocations surface as pointers in this segment; the allocator
/// covers its full 64 KiB window (physical 0x10000..0x20000).
pub const HEAP_SEGMENT: u16 = 0x1000;

pub struct RealModeMemory {
    mem: Box<[u8]>,
    caches: HashMap<u16, HashMap<u16, Instruction>>,
    /// Initialized byte count of each added segment, bounding recompilation.
    code_lengths: HashMap<u16, usize>,
    heap: HeapAllocator,
    directory: VariableDirectory,
}

#[inline]
fn phys(segment: u16, offset: u16) -> usize {
    (((segment as usize) << 4) + offset as usize) & (MEMORY_SIZE - 1)
}

impl Default for RealModeMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl RealModeMemory {
    pub fn new() -> Self {
        Self {
            mem: vec![0u8; MEMORY_SIZE].into_boxed_slice(),
            caches: HashMap::new(),
            code_lengths: HashMap::new(),
            heap: HeapAllocator::new(0, SEGMENT_SIZE as u32),
            directory: VariableDirectory::default(),
        }
    }

    fn span(&self, segment: u16, offset: u16, len: usize) -> Result<&[u8], MemoryError> {
        let start = phys(segment, offset);
        let end = start + len;
        if end > MEMORY_SIZE {
            return Err(MemoryError::segfault(segment, offset));
        }
        Ok(&self.mem[start..end])
    }

    fn span_mut(&mut self, segment: u16, offset: u16, len: usize) -> Result<&mut [u8], MemoryError> {
        let start = phys(segment, offset);
        let end = start + len;
        if end > MEMORY_SIZE {
            return Err(MemoryError::segfault(segment, offset));
        }
        Ok(&mut self.mem[start..end])
    }

    /// End of the 64 KiB window seen through `segment`, capped at the top of
    /// the address space.
    fn window_end(segment: u16) -> usize {
        (phys(segment, 0) + SEGMENT_SIZE).min(MEMORY_SIZE)
    }
}

impl MemoryCore for RealModeMemory {
    fn add_segment(&mut self, segment: Segment) -> Result<(), MemoryError> {
        if self.code_lengths.contains_key(&segment.ordinal) {
            return Err(MemoryError::DuplicateSegment(segment.ordinal));
        }
        let base = phys(segment.ordinal, 0);
        if base + segment.data.len() > MEMORY_SIZE {
            return Err(MemoryError::segfault(segment.ordinal, 0));
        }
        self.mem[base..base + segment.data.len()].copy_from_slice(&segment.data);
        if segment.is_code() {
            self.caches.insert(segment.ordinal, decoder::decode_segment(&segment.data));
        }
        self.code_lengths.insert(segment.ordinal, segment.data.len());
        Ok(())
    }

    /// Every segment value addresses real memory in this model.
    fn has_segment(&self, _segment: u16) -> bool {
        true
    }

    fn get_instruction(&self, segment: u16, ip: u16) -> Option<Instruction> {
        self.caches.get(&segment)?.get(&ip).copied()
    }

    fn recompile(&mut self, segment: u16, ip: u16) -> Result<Instruction, MemoryError> {
        let start = phys(segment, ip);
        let limit = match self.code_lengths.get(&segment) {
            Some(len) => (phys(segment, 0) + len).min(MEMORY_SIZE),
            None => Self::window_end(segment),
        };
        if start >= limit {
            return Err(MemoryError::segfault(segment, ip));
        }
        let end = (start + RECOMPILE_WINDOW).min(limit);
        let instruction = decoder::decode(&self.mem[start..end], ip);
        self.caches.entry(segment).or_default().insert(ip, instruction);
        Ok(instruction)
    }

    fn get_byte(&self, segment: u16, offset: u16) -> Result<u8, MemoryError> {
        Ok(self.mem[phys(segment, offset)])
    }

    fn get_word(&self, segment: u16, offset: u16) -> Result<u16, MemoryError> {
        let bytes = self.span(segment, offset, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn get_dword(&self, segment: u16, offset: u16) -> Result<u32, MemoryError> {
        let bytes = self.span(segment, offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn set_byte(&mut self, segment: u16, offset: u16, value: u8) -> Result<(), MemoryError> {
        self.mem[phys(segment, offset)] = value;
        Ok(())
    }

    fn set_word(&mut self, segment: u16, offset: u16, value: u16) -> Result<(), MemoryError> {
        self.span_mut(segment, offset, 2)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn set_dword(&mut self, segment: u16, offset: u16, value: u32) -> Result<(), MemoryError> {
        self.span_mut(segment, offset, 4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn get_array(&self, segment: u16, offset: u16, len: u16) -> Result<&[u8], MemoryError> {
        self.span(segment, offset, len as usize)
    }

    fn set_array(&mut self, segment: u16, offset: u16, data: &[u8]) -> Result<(), MemoryError> {
        let start = phys(segment, offset);
        let fit = data.len().min(MEMORY_SIZE - start);
        self.mem[start..start + fit].copy_from_slice(&data[..fit]);
        Ok(())
    }

    fn get_string(&self, segment: u16, offset: u16, strip_null: bool) -> Result<&[u8], MemoryError> {
        let start = phys(segment, offset);
        let end = Self::window_end(segment);
        if start >= end {
            return Err(MemoryError::segfault(segment, offset));
        }
        scan_cstring(&self.mem[start..end], segment, offset, strip_null)
    }

    fn fill(&mut self, segment: u16, offset: u16, count: u16, value: u8) -> Result<(), MemoryError> {
        self.span_mut(segment, offset, count as usize)?.fill(value);
        Ok(())
    }

    fn malloc(&mut self, size: u16) -> Result<FarPtr, MemoryError> {
        let offset = self.heap.allocate(size).ok_or(MemoryError::OutOfMemory(size))?;
        if size > 0 {
            self.fill(HEAP_SEGMENT, offset, size, 0)?;
        }
        Ok(FarPtr::new(HEAP_SEGMENT, offset))
    }

    fn free(&mut self, ptr: FarPtr) -> Result<(), MemoryError> {
        if ptr.is_null() {
            return Err(MemoryError::FreeNull);
        }
        if ptr.segment != HEAP_SEGMENT {
            warn!("free of pointer outside the heap window: {ptr}, ignoring");
            return Ok(());
        }
        match self.heap.release(ptr.offset) {
            Some(_) => Ok(()),
            None => Err(MemoryError::BadFree(ptr)),
        }
    }

    fn variables(&self) -> &VariableDirectory {
        &self.directory
    }

    fn variables_mut(&mut self) -> &mut VariableDirectory {
        &mut self.directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::segment::SegmentFlags;

    #[test]
    fn scalar_round_trips_are_little_endian() {
        let mut mem = RealModeMemory::new();
        mem.set_dword(0x3000, 0x10, 0x0102_0304).unwrap();
        assert_eq!(mem.get_byte(0x3000, 0x10).unwrap(), 0x04);
        assert_eq!(mem.get_byte(0x3000, 0x13).unwrap(), 0x01);
        assert_eq!(mem.get_word(0x3000, 0x10).unwrap(), 0x0304);
        assert_eq!(mem.get_dword(0x3000, 0x10).unwrap(), 0x0102_0304);
    }

    #[test]
    fn overlapping_segments_alias_the_same_bytes() {
        let mut mem = RealModeMemory::new();
        mem.set_byte(0x3000, 0x10, 0x5A).unwrap();
        assert_eq!(mem.get_byte(0x3001, 0x00).unwrap(), 0x5A);
        assert_eq!(mem.get_byte(0x2FFF, 0x20).unwrap(), 0x5A);
    }

    #[test]
    fn get_string_scans_the_segment_window() {
        let mut mem = RealModeMemory::new();
        mem.set_array(0x3000, 0x10, b"NAME\0rest").unwrap();
        assert_eq!(mem.get_string(0x3000, 0x10, true).unwrap(), b"NAME");
        assert_eq!(mem.get_string(0x3000, 0x10, false).unwrap(), b"NAME\0");
    }

    #[test]
    fn malloc_lives_in_the_heap_window() {
        let mut mem = RealModeMemory::new();
        let ptr = mem.malloc(32).unwrap();
        assert_eq!(ptr.segment, HEAP_SEGMENT);
        assert!(mem.get_array(ptr.segment, ptr.offset, 32).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn heap_exhaustion_is_out_of_memory() {
        let mut mem = RealModeMemory::new();
        mem.malloc(0xFFFF).unwrap();
        assert!(matches!(mem.malloc(2), Err(MemoryError::OutOfMemory(2))));
    }

    #[test]
    fn malloc_free_restores_capacity() {
        let mut mem = RealModeMemory::new();
        let a = mem.malloc(0x1000).unwrap();
        mem.free(a).unwrap();
        // The whole window is free again.
        let big = mem.malloc(0xFFFF).unwrap();
        assert_eq!(big.segment, HEAP_SEGMENT);
    }

    #[test]
    fn free_outside_heap_window_is_ignored() {
        let mut mem = RealModeMemory::new();
        mem.free(FarPtr::new(0x3000, 0x10)).unwrap();
        assert!(matches!(mem.free(FarPtr::NULL), Err(MemoryError::FreeNull)));
    }

    #[test]
    fn add_segment_places_data_at_linear_address() {
        let mut mem = RealModeMemory::new();
        mem.add_segment(Segment::new(0x0800, b"DATA".to_vec(), SegmentFlags::DATA)).unwrap();
        assert_eq!(mem.get_array(0x0800, 0, 4).unwrap(), b"DATA");
        assert_eq!(mem.get_byte(0x0000, 0x8000).unwrap(), b'D');
    }

    #[test]
    fn code_segments_decode_and_recompile() {
        let mut mem = RealModeMemory::new();
        // MOV AX,1; RET
        mem.add_segment(Segment::code(0x0800, vec![0xB8, 0x01, 0x00, 0xC3])).unwrap();
        assert_eq!(mem.get_instruction(0x0800, 0).unwrap().len, 3);
        assert!(mem.get_instruction(0x0800, 3).is_some());
        let recompiled = mem.recompile(0x0800, 1).unwrap();
        assert_eq!(recompiled.ip, 1);
    }

    #[test]
    fn named_variables_work_over_the_flat_image() {
        let mut mem = RealModeMemory::new();
        let var = mem.allocate_variable("GLOBAL", 6, true).unwrap();
        let pointer = mem.get_variable_pointer("*GLOBAL").unwrap();
        assert_eq!(mem.get_farptr(pointer.segment, pointer.offset).unwrap(), var);
    }
}
