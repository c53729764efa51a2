use crate::cpu::decoder::{Instruction, Op, Rep, SegName, Width};
use crate::cpu::registers::Register;
use crate::cpu::CpuFlag::*;
use crate::cpu::{Cpu, ExecError, Flow};
use crate::mem::MemoryCore;
use crate::utils::number::SpecialOps;

use super::update_arithmetic_flags;

/// Source side honors the segment override; the destination is always ES:DI.
fn source_segment(cpu: &Cpu, instruction: &Instruction) -> u16 {
    let name = instruction.seg_override.unwrap_or(SegName::Ds);
    cpu.registers.read_seg(name)
}

#[inline]
fn advance(cpu: &mut Cpu, reg: fn(&mut Cpu) -> &mut Register, step: u16) {
    let dir = cpu.check_flag(Directional);
    let op = if dir { u16::wrapping_sub } else { u16::wrapping_add };
    reg(cpu).operation(step, op);
}

fn si(cpu: &mut Cpu) -> &mut Register {
    &mut cpu.registers.si
}

fn di(cpu: &mut Cpu) -> &mut Register {
    &mut cpu.registers.di
}

/// The REP families run to completion inside one tick; a tick is a whole
/// instruction, prefix included.
pub(super) fn execute(
    cpu: &mut Cpu,
    mem: &mut dyn MemoryCore,
    instruction: &Instruction,
) -> Result<Flow, ExecError> {
    let word = instruction.width == Width::Word;
    let step: u16 = if word { 2 } else { 1 };
    let rep = instruction.rep;

    loop {
        if rep.is_some() && cpu.registers.cx.word() == 0 {
            break;
        }

        let mut compared = false;
        match instruction.op {
            Op::Movs => {
                let src_seg = source_segment(cpu, instruction);
                let src_off = cpu.registers.si.word();
                let dst_off = cpu.registers.di.word();
                if word {
                    let value = mem.get_word(src_seg, src_off)?;
                    mem.set_word(cpu.registers.es, dst_off, value)?;
                } else {
                    let value = mem.get_byte(src_seg, src_off)?;
                    mem.set_byte(cpu.registers.es, dst_off, value)?;
                }
                advance(cpu, si, step);
                advance(cpu, di, step);
            }
            Op::Stos => {
                let dst_off = cpu.registers.di.word();
                if word {
                    mem.set_word(cpu.registers.es, dst_off, cpu.registers.ax.word())?;
                } else {
                    mem.set_byte(cpu.registers.es, dst_off, cpu.registers.ax.low())?;
                }
                advance(cpu, di, step);
            }
            Op::Lods => {
                let src_seg = source_segment(cpu, instruction);
                let src_off = cpu.registers.si.word();
                if word {
                    let value = mem.get_word(src_seg, src_off)?;
                    cpu.registers.ax.set(value);
                } else {
                    let value = mem.get_byte(src_seg, src_off)?;
                    cpu.registers.ax.set_low(value);
                }
                advance(cpu, si, step);
            }
            Op::Cmps => {
                let src_seg = source_segment(cpu, instruction);
                let src_off = cpu.registers.si.word();
                let dst_off = cpu.registers.di.word();
                if word {
                    let a = mem.get_word(src_seg, src_off)?;
                    let b = mem.get_word(cpu.registers.es, dst_off)?;
                    let (res, overflow, carry) = a.oc_sub(b);
                    update_arithmetic_flags(cpu, Width::Word, res as u32, overflow, carry);
                } else {
                    let a = mem.get_byte(src_seg, src_off)?;
                    let b = mem.get_byte(cpu.registers.es, dst_off)?;
                    let (res, overflow, carry) = a.oc_sub(b);
                    update_arithmetic_flags(cpu, Width::Byte, res as u32, overflow, carry);
                }
                advance(cpu, si, step);
                advance(cpu, di, step);
                compared = true;
            }
            Op::Scas => {
                let dst_off = cpu.registers.di.word();
                if word {
                    let b = mem.get_word(cpu.registers.es, dst_off)?;
                    let (res, overflow, carry) = cpu.registers.ax.word().oc_sub(b);
                    update_arithmetic_flags(cpu, Width::Word, res as u32, overflow, carry);
                } else {
                    let b = mem.get_byte(cpu.registers.es, dst_off)?;
                    let (res, overflow, carry) = cpu.registers.ax.low().oc_sub(b);
                    update_arithmetic_flags(cpu, Width::Byte, res as u32, overflow, carry);
                }
                advance(cpu, di, step);
                compared = true;
            }
            _ => return Err(ExecError::Decode),
        }

        let Some(rep) = rep else { break };
        cpu.registers.cx.operation(1, u16::wrapping_sub);
        if compared {
            let want_zero = rep == Rep::Eq;
            if cpu.check_flag(Zero) != want_zero {
                break;
            }
        }
    }
    Ok(Flow::Continue)
}
