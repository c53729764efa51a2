//! Core of a DOS/16-bit emulator for MajorBBS / Worldgroup door modules:
//! a 16-bit x86 interpreter with x87 support, the segmented and real-mode
//! guest memory models behind one contract, and the Btrieve ISAM engine
//! modules use for persistence. Front-ends (Telnet, session host, the
//! host-API shim layer) live in sibling crates and drive this one through
//! `Cpu::tick`, `MemoryCore` and `BtrieveProcessor`.

pub mod btrieve;
pub mod cpu;
pub mod host;
pub mod mem;
pub mod utils;

pub use btrieve::{BtrieveError, BtrieveFile, BtrieveOperation, BtrieveProcessor};
pub use cpu::{Cpu, CpuFault, Tick};
pub use host::HostCall;
pub use mem::{FarPtr, MemoryCore, MemoryError, RealModeMemory, Segment, SegmentedMemory};
