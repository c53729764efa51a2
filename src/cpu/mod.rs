pub mod decoder;
pub mod fpu;
pub mod instructions;
pub mod registers;

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use crate::cpu::decoder::Instruction;
use crate::cpu::fpu::{Fpu, StackFault};
use crate::cpu::registers::{RegisterSnapshot, Registers};
use crate::host::HostCall;
use crate::mem::{MemoryCore, MemoryError};

#[derive(Debug, Clone, Copy)]
pub enum CpuFlag {
    Carry = 0,
    Parity = 2,
    AuxCarry = 4,
    Zero = 6,
    Sign = 7,
    Trap = 8,
    Interrupt = 9,
    Directional = 10,
    Overflow = 11,
}

/// Everything the host needs to log a dead guest: where it died, what bytes
/// it was chewing on, and the register file at that moment.
#[derive(Debug, Clone)]
pub struct FaultContext {
    pub cs: u16,
    pub ip: u16,
    pub opcode: Vec<u8>,
    pub registers: RegisterSnapshot,
}

impl fmt::Display for FaultContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X} [", self.cs, self.ip)?;
        for (i, byte) in self.opcode.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        write!(f, "] {}", self.registers)
    }
}

#[derive(Debug, Error)]
pub enum CpuFault {
    #[error("undefined opcode at {0}")]
    Decode(FaultContext),
    #[error("memory fault at {0}: {1}")]
    Memory(FaultContext, MemoryError),
    #[error("integer divide fault at {0}")]
    Divide(FaultContext),
    #[error("x87 stack {1:?} at {0}")]
    FpuStack(FaultContext, StackFault),
}

/// Raw fault raised inside the executor; `tick` attaches the context.
#[derive(Debug)]
pub enum ExecError {
    Decode,
    Memory(MemoryError),
    Divide,
    Fpu(StackFault),
}

impl From<MemoryError> for ExecError {
    fn from(err: MemoryError) -> Self {
        ExecError::Memory(err)
    }
}

impl From<StackFault> for ExecError {
    fn from(fault: StackFault) -> Self {
        ExecError::Fpu(fault)
    }
}

/// Result of one `tick`.
#[derive(Debug)]
pub enum Tick {
    /// A whole instruction executed.
    Executed,
    /// A far call landed in an imported segment; the host must dispatch
    /// `(segment, ordinal)` and may mutate registers before the next tick.
    HostCall(HostCall),
    /// The CPU is halted (HLT, or the host set the halt flag) and will not
    /// execute until `resume()`.
    Halted,
}

/// Control disposition decided by the executor.
pub(crate) enum Flow {
    Continue,
    HostCall(HostCall),
    Halt,
}

pub struct Cpu {
    pub registers: Registers,
    pub fpu: Fpu,
    pub flags: u16,
    halted: bool,
    imported: BTreeSet<u16>,
    /// Set while the host services a far call; the next tick pops the
    /// return pointer the call pushed.
    pending_host_return: bool,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            registers: Registers::new(),
            fpu: Fpu::default(),
            flags: 0,
            halted: false,
            imported: BTreeSet::new(),
            pending_host_return: false,
        }
    }

    /// Mark a segment ordinal as belonging to the host API; far calls into
    /// it yield `Tick::HostCall` instead of transferring control.
    pub fn register_import(&mut self, segment: u16) {
        self.imported.insert(segment);
    }

    pub fn is_imported(&self, segment: u16) -> bool {
        self.imported.contains(&segment)
    }

    /// Host-requested stop (e.g. a blocking host API). The current tick is
    /// already complete when the host gets to see state, so this simply
    /// refuses future ticks.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn resume(&mut self) {
        self.halted = false;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    #[inline(always)]
    pub fn set_flag(&mut self, flag: CpuFlag) {
        self.flags |= 1u16 << (flag as u8);
    }

    #[inline(always)]
    pub fn unset_flag(&mut self, flag: CpuFlag) {
        self.flags &= !(1u16 << (flag as u8));
    }

    #[inline(always)]
    pub fn update_flag(&mut self, flag: CpuFlag, active: bool) {
        if active {
            self.set_flag(flag);
        } else {
            self.unset_flag(flag);
        }
    }

    #[inline(always)]
    pub fn check_flag(&self, flag: CpuFlag) -> bool {
        (self.flags & 1u16 << (flag as u8)) != 0
    }

    pub(crate) fn push_word(&mut self, mem: &mut dyn MemoryCore, value: u16) -> Result<(), ExecError> {
        let sp = self.registers.sp.operation(2, u16::wrapping_sub);
        mem.set_word(self.registers.ss, sp, value)?;
        Ok(())
    }

    pub(crate) fn pop_word(&mut self, mem: &mut dyn MemoryCore) -> Result<u16, ExecError> {
        let sp = self.registers.sp.word();
        let value = mem.get_word(self.registers.ss, sp)?;
        self.registers.sp.set(sp.wrapping_add(2));
        Ok(value)
    }

    /// Execute one instruction. Faults carry full context; the host should
    /// log them and tear down the guest context.
    pub fn tick(&mut self, mem: &mut dyn MemoryCore) -> Result<Tick, CpuFault> {
        if self.halted {
            return Ok(Tick::Halted);
        }

        if self.pending_host_return {
            self.pending_host_return = false;
            let cs = self.registers.cs;
            let ip = self.registers.ip.word();
            let ret_ip = self.pop_word(mem).map_err(|e| self.contextualize(e, mem, cs, ip, 0))?;
            let ret_cs = self.pop_word(mem).map_err(|e| self.contextualize(e, mem, cs, ip, 0))?;
            self.registers.ip.set(ret_ip);
            self.registers.cs = ret_cs;
        }

        let cs = self.registers.cs;
        let ip = self.registers.ip.word();
        let instruction = match mem.get_instruction(cs, ip) {
            Some(cached) => cached,
            None => mem
                .recompile(cs, ip)
                .map_err(|e| self.contextualize(ExecError::Memory(e), mem, cs, ip, 0))?,
        };

        // Fall-through IP; control transfers overwrite it during execution.
        self.registers.ip.set(ip.wrapping_add(instruction.len as u16));

        match instructions::execute(self, mem, &instruction) {
            Ok(Flow::Continue) => Ok(Tick::Executed),
            Ok(Flow::HostCall(call)) => {
                self.pending_host_return = true;
                Ok(Tick::HostCall(call))
            }
            Ok(Flow::Halt) => {
                self.halted = true;
                Ok(Tick::Halted)
            }
            Err(err) => Err(self.contextualize(err, mem, cs, ip, instruction.len)),
        }
    }

    fn contextualize(
        &self,
        err: ExecError,
        mem: &dyn MemoryCore,
        cs: u16,
        ip: u16,
        len: u8,
    ) -> CpuFault {
        let opcode = mem
            .get_array(cs, ip, len.max(1) as u16)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        let context = FaultContext {
            cs,
            ip,
            opcode,
            registers: self.registers.snapshot(),
        };
        match err {
            ExecError::Decode => CpuFault::Decode(context),
            ExecError::Memory(e) => CpuFault::Memory(context, e),
            ExecError::Divide => CpuFault::Divide(context),
            ExecError::Fpu(fault) => CpuFault::FpuStack(context, fault),
        }
    }

    /// Far target resolution for CALL/JMP: imported segments yield to the
    /// host with the ordinal taken from the low word of the target offset.
    pub(crate) fn far_transfer(&self, segment: u16, offset: u16) -> Option<HostCall> {
        if self.is_imported(segment) {
            Some(HostCall { segment, ordinal: offset })
        } else {
            None
        }
    }
}

/// Dumps the decoded form of `instruction` the way the fault log renders
/// raw bytes, for debugger front-ends.
pub fn describe_instruction(instruction: &Instruction) -> String {
    format!(
        "{:04X}: {:?} {:?}, {:?} ({} bytes)",
        instruction.ip, instruction.op, instruction.dst, instruction.src, instruction.len
    )
}
