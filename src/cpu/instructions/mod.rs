mod alu;
mod control;
mod fpu_ops;
mod shift;
mod string;


use crate::cpu::decoder::{AddrBase, Instruction, MemRef, Op, Operand, SegName, Width};
use crate::cpu::CpuFlag::*;
use crate::cpu::{Cpu, ExecError, Flow};
use crate::mem::MemoryCore;
use crate::utils::number::{extend_sign, extend_sign_byte_dword, extend_sign_word_dword};

/// Effective address of a memory operand: resolved segment value plus
/// 16-bit offset, honoring the instruction's segment override.
pub(super) fn effective_address(cpu: &Cpu, instruction: &Instruction, mem_ref: &MemRef) -> (u16, u16) {
    let seg_name = instruction.seg_override.unwrap_or_else(|| mem_ref.default_segment());
    let segment = cpu.registers.read_seg(seg_name);
    let regs = &cpu.registers;
    let base = match mem_ref.base {
        AddrBase::BxSi => regs.bx.word().wrapping_add(regs.si.word()),
        AddrBase::BxDi => regs.bx.word().wrapping_add(regs.di.word()),
        AddrBase::BpSi => regs.bp.word().wrapping_add(regs.si.word()),
        AddrBase::BpDi => regs.bp.word().wrapping_add(regs.di.word()),
        AddrBase::Si => regs.si.word(),
        AddrBase::Di => regs.di.word(),
        AddrBase::Bp => regs.bp.word(),
        AddrBase::Bx => regs.bx.word(),
        AddrBase::Disp => 0,
    };
    (segment, base.wrapping_add(mem_ref.disp))
}

/// Width an operand reads or writes at.
pub(super) fn operand_width(op: Operand, fallback: Width) -> Width {
    match op {
        Operand::Reg8(_) => Width::Byte,
        Operand::Reg16(_) | Operand::Seg(_) => Width::Word,
        Operand::Reg32(_) => Width::Dword,
        Operand::Mem(_, w) => w,
        _ => fallback,
    }
}

pub(super) fn read_operand(
    cpu: &mut Cpu,
    mem: &mut dyn MemoryCore,
    instruction: &Instruction,
    op: Operand,
) -> Result<u32, ExecError> {
    match op {
        Operand::Reg8(r) => Ok(cpu.registers.read_reg_byte(r) as u32),
        Operand::Reg16(r) => Ok(cpu.registers.read_reg_word(r) as u32),
        Operand::Reg32(r) => Ok(cpu.registers.read_reg_dword(r)),
        Operand::Seg(s) => Ok(cpu.registers.read_seg(s) as u32),
        Operand::Imm(v) => Ok(v),
        Operand::Mem(m, width) => {
            let (segment, offset) = effective_address(cpu, instruction, &m);
            Ok(match width {
                Width::Byte => mem.get_byte(segment, offset)? as u32,
                Width::Word => mem.get_word(segment, offset)? as u32,
                Width::Dword | Width::Qword => mem.get_dword(segment, offset)?,
            })
        }
        Operand::None | Operand::St(_) | Operand::FarImm { .. } => Err(ExecError::Decode),
    }
}

pub(super) fn write_operand(
    cpu: &mut Cpu,
    mem: &mut dyn MemoryCore,
    instruction: &Instruction,
    op: Operand,
    value: u32,
) -> Result<(), ExecError> {
    match op {
        Operand::Reg8(r) => cpu.registers.write_reg_byte(r, value as u8),
        Operand::Reg16(r) => cpu.registers.write_reg_word(r, value as u16),
        Operand::Reg32(r) => cpu.registers.write_reg_dword(r, value),
        Operand::Seg(s) => cpu.registers.write_seg(s, value as u16),
        Operand::Mem(m, width) => {
            let (segment, offset) = effective_address(cpu, instruction, &m);
            match width {
                Width::Byte => mem.set_byte(segment, offset, value as u8)?,
                Width::Word => mem.set_word(segment, offset, value as u16)?,
                Width::Dword | Width::Qword => mem.set_dword(segment, offset, value)?,
            }
        }
        _ => return Err(ExecError::Decode),
    }
    Ok(())
}

#[inline]
fn sign_bit(width: Width) -> u32 {
    match width {
        Width::Byte => 0x80,
        Width::Word => 0x8000,
        _ => 0x8000_0000,
    }
}

/// OF/CF supplied by the caller, ZF/SF/PF derived from the result. PF only
/// ever looks at the low byte, as on real hardware.
pub(super) fn update_arithmetic_flags(cpu: &mut Cpu, width: Width, res: u32, overflow: bool, carry: bool) {
    cpu.update_flag(Overflow, overflow);
    cpu.update_flag(Carry, carry);
    cpu.update_flag(Zero, res == 0);
    cpu.update_flag(Sign, res & sign_bit(width) != 0);
    cpu.update_flag(Parity, (res as u8).count_ones() & 1 == 0);
}

pub(super) fn update_logical_flags(cpu: &mut Cpu, width: Width, res: u32) {
    cpu.unset_flag(Overflow);
    cpu.unset_flag(Carry);
    cpu.update_flag(Zero, res == 0);
    cpu.update_flag(Sign, res & sign_bit(width) != 0);
    cpu.update_flag(Parity, (res as u8).count_ones() & 1 == 0);
}

pub(crate) fn execute(
    cpu: &mut Cpu,
    mem: &mut dyn MemoryCore,
    instruction: &Instruction,
) -> Result<Flow, ExecError> {
    match instruction.op {
        Op::Invalid => Err(ExecError::Decode),
        Op::Nop => Ok(Flow::Continue),
        Op::Hlt => Ok(Flow::Halt),

        Op::Mov => {
            let value = read_operand(cpu, mem, instruction, instruction.src)?;
            write_operand(cpu, mem, instruction, instruction.dst, value)?;
            Ok(Flow::Continue)
        }
        Op::Movsx => {
            let value = read_operand(cpu, mem, instruction, instruction.src)?;
            let extended = match (operand_width(instruction.src, Width::Byte), instruction.dst) {
                (Width::Byte, Operand::Reg16(_)) => extend_sign(value as u8) as u32,
                (Width::Byte, _) => extend_sign_byte_dword(value as u8),
                (_, Operand::Reg16(_)) => value & 0xFFFF,
                _ => extend_sign_word_dword(value as u16),
            };
            write_operand(cpu, mem, instruction, instruction.dst, extended)?;
            Ok(Flow::Continue)
        }
        Op::Movzx => {
            let value = read_operand(cpu, mem, instruction, instruction.src)?;
            write_operand(cpu, mem, instruction, instruction.dst, value)?;
            Ok(Flow::Continue)
        }
        Op::Xchg => {
            let a = read_operand(cpu, mem, instruction, instruction.dst)?;
            let b = read_operand(cpu, mem, instruction, instruction.src)?;
            write_operand(cpu, mem, instruction, instruction.dst, b)?;
            write_operand(cpu, mem, instruction, instruction.src, a)?;
            Ok(Flow::Continue)
        }
        Op::Lea => {
            let Operand::Mem(m, _) = instruction.src else {
                return Err(ExecError::Decode);
            };
            let (_, offset) = effective_address(cpu, instruction, &m);
            write_operand(cpu, mem, instruction, instruction.dst, offset as u32)?;
            Ok(Flow::Continue)
        }
        Op::Les | Op::Lds => {
            let Operand::Mem(m, _) = instruction.src else {
                return Err(ExecError::Decode);
            };
            let (segment, offset) = effective_address(cpu, instruction, &m);
            let pointer = mem.get_farptr(segment, offset)?;
            write_operand(cpu, mem, instruction, instruction.dst, pointer.offset as u32)?;
            let seg_reg = if instruction.op == Op::Les { SegName::Es } else { SegName::Ds };
            cpu.registers.write_seg(seg_reg, pointer.segment);
            Ok(Flow::Continue)
        }
        Op::Xlat => {
            let table = cpu.registers.bx.word().wrapping_add(cpu.registers.ax.low() as u16);
            let seg_name = instruction.seg_override.unwrap_or(SegName::Ds);
            let segment = cpu.registers.read_seg(seg_name);
            let value = mem.get_byte(segment, table)?;
            cpu.registers.ax.set_low(value);
            Ok(Flow::Continue)
        }

        Op::Add | Op::Adc | Op::Sub | Op::Sbb | Op::Cmp | Op::And | Op::Or | Op::Xor | Op::Test => {
            alu::binary(cpu, mem, instruction)
        }
        Op::Inc | Op::Dec => alu::inc_dec(cpu, mem, instruction),
        Op::Neg | Op::Not => alu::neg_not(cpu, mem, instruction),
        Op::Mul | Op::Imul => alu::mul(cpu, mem, instruction),
        Op::Imul3 => alu::imul3(cpu, mem, instruction),
        Op::Div | Op::Idiv => alu::div(cpu, mem, instruction),

        Op::Shl | Op::Shr | Op::Sar | Op::Rol | Op::Ror | Op::Rcl | Op::Rcr => {
            shift::execute(cpu, mem, instruction)
        }

        Op::Cbw => {
            let extended = extend_sign(cpu.registers.ax.low());
            cpu.registers.ax.set(extended);
            Ok(Flow::Continue)
        }
        Op::Cwd => {
            // DX:AX := sign-extended AX; flags untouched.
            let dx = if cpu.registers.ax.word() & 0x8000 != 0 { 0xFFFF } else { 0x0000 };
            cpu.registers.dx.set(dx);
            Ok(Flow::Continue)
        }

        Op::Clc => {
            cpu.unset_flag(Carry);
            Ok(Flow::Continue)
        }
        Op::Stc => {
            cpu.set_flag(Carry);
            Ok(Flow::Continue)
        }
        Op::Cmc => {
            let carry = cpu.check_flag(Carry);
            cpu.update_flag(Carry, !carry);
            Ok(Flow::Continue)
        }
        Op::Cld => {
            cpu.unset_flag(Directional);
            Ok(Flow::Continue)
        }
        Op::Std => {
            cpu.set_flag(Directional);
            Ok(Flow::Continue)
        }
        Op::Cli => {
            cpu.unset_flag(Interrupt);
            Ok(Flow::Continue)
        }
        Op::Sti => {
            cpu.set_flag(Interrupt);
            Ok(Flow::Continue)
        }

        Op::Push
        | Op::Pop
        | Op::Pusha
        | Op::Popa
        | Op::Pushf
        | Op::Popf
        | Op::Sahf
        | Op::Lahf
        | Op::Call
        | Op::CallFar
        | Op::Ret
        | Op::Retf
        | Op::Jmp
        | Op::JmpFar
        | Op::Jcc(_)
        | Op::Jcxz
        | Op::Loop
        | Op::Loope
        | Op::Loopne
        | Op::Enter
        | Op::Leave => control::execute(cpu, mem, instruction),

        Op::Movs | Op::Cmps | Op::Stos | Op::Lods | Op::Scas => {
            string::execute(cpu, mem, instruction)
        }

        _ => fpu_ops::execute(cpu, mem, instruction),
    }
}
