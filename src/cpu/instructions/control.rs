use crate::cpu::decoder::{Instruction, Op, Operand};
use crate::cpu::CpuFlag::*;
use crate::cpu::{Cpu, ExecError, Flow};
use crate::mem::MemoryCore;

use super::{effective_address, read_operand, write_operand};

/// SAHF/LAHF move only the 8086-defined bits of the low flag byte.
const LOW_FLAG_MASK: u16 = 0b1101_0101;

fn condition(cpu: &Cpu, cc: u8) -> bool {
    let base = match cc >> 1 {
        0 => cpu.check_flag(Overflow),
        1 => cpu.check_flag(Carry),
        2 => cpu.check_flag(Zero),
        3 => cpu.check_flag(Carry) || cpu.check_flag(Zero),
        4 => cpu.check_flag(Sign),
        5 => cpu.check_flag(Parity),
        6 => cpu.check_flag(Sign) != cpu.check_flag(Overflow),
        _ => cpu.check_flag(Zero) || (cpu.check_flag(Sign) != cpu.check_flag(Overflow)),
    };
    base != (cc & 1 == 1)
}

#[inline]
fn relative_jump(cpu: &mut Cpu, rel: u16) {
    let ip = cpu.registers.ip.word();
    cpu.registers.ip.set(ip.wrapping_add(rel));
}

/// Far target of the instruction: either the immediate ptr16:16 or an
/// m16:16 in memory.
fn far_target(
    cpu: &mut Cpu,
    mem: &mut dyn MemoryCore,
    instruction: &Instruction,
) -> Result<(u16, u16), ExecError> {
    match instruction.dst {
        Operand::FarImm { segment, offset } => Ok((segment, offset)),
        Operand::Mem(m, _) => {
            let (seg, off) = effective_address(cpu, instruction, &m);
            let pointer = mem.get_farptr(seg, off)?;
            Ok((pointer.segment, pointer.offset))
        }
        _ => Err(ExecError::Decode),
    }
}

pub(super) fn execute(
    cpu: &mut Cpu,
    mem: &mut dyn MemoryCore,
    instruction: &Instruction,
) -> Result<Flow, ExecError> {
    match instruction.op {
        Op::Push => {
            let value = read_operand(cpu, mem, instruction, instruction.dst)? as u16;
            cpu.push_word(mem, value)?;
        }
        Op::Pop => {
            let value = cpu.pop_word(mem)?;
            write_operand(cpu, mem, instruction, instruction.dst, value as u32)?;
        }
        Op::Pusha => {
            let sp = cpu.registers.sp.word();
            let regs = [
                cpu.registers.ax.word(),
                cpu.registers.cx.word(),
                cpu.registers.dx.word(),
                cpu.registers.bx.word(),
                sp,
                cpu.registers.bp.word(),
                cpu.registers.si.word(),
                cpu.registers.di.word(),
            ];
            for value in regs {
                cpu.push_word(mem, value)?;
            }
        }
        Op::Popa => {
            let di = cpu.pop_word(mem)?;
            let si = cpu.pop_word(mem)?;
            let bp = cpu.pop_word(mem)?;
            let _sp = cpu.pop_word(mem)?;
            let bx = cpu.pop_word(mem)?;
            let dx = cpu.pop_word(mem)?;
            let cx = cpu.pop_word(mem)?;
            let ax = cpu.pop_word(mem)?;
            cpu.registers.di.set(di);
            cpu.registers.si.set(si);
            cpu.registers.bp.set(bp);
            cpu.registers.bx.set(bx);
            cpu.registers.dx.set(dx);
            cpu.registers.cx.set(cx);
            cpu.registers.ax.set(ax);
        }
        Op::Pushf => {
            let flags = cpu.flags;
            cpu.push_word(mem, flags)?;
        }
        Op::Popf => {
            cpu.flags = cpu.pop_word(mem)?;
        }
        Op::Sahf => {
            let ah = cpu.registers.ax.high() as u16;
            cpu.flags = (cpu.flags & !LOW_FLAG_MASK) | (ah & LOW_FLAG_MASK);
        }
        Op::Lahf => {
            cpu.registers.ax.set_high((cpu.flags & LOW_FLAG_MASK) as u8 | 0x02);
        }

        Op::Call => {
            let target = match instruction.dst {
                Operand::None => {
                    // CALL rel16: relative to the already-advanced IP.
                    let rel = read_operand(cpu, mem, instruction, instruction.src)? as u16;
                    cpu.registers.ip.word().wrapping_add(rel)
                }
                _ => read_operand(cpu, mem, instruction, instruction.dst)? as u16,
            };
            let ret = cpu.registers.ip.word();
            cpu.push_word(mem, ret)?;
            cpu.registers.ip.set(target);
        }
        Op::CallFar => {
            let (segment, offset) = far_target(cpu, mem, instruction)?;
            let cs = cpu.registers.cs;
            let ip = cpu.registers.ip.word();
            cpu.push_word(mem, cs)?;
            cpu.push_word(mem, ip)?;
            if let Some(call) = cpu.far_transfer(segment, offset) {
                // SS:SP now addresses the return far pointer, exactly what
                // the host-API argument readers expect.
                return Ok(Flow::HostCall(call));
            }
            cpu.registers.cs = segment;
            cpu.registers.ip.set(offset);
        }
        Op::Ret => {
            let ip = cpu.pop_word(mem)?;
            cpu.registers.ip.set(ip);
            if let Operand::Imm(cleanup) = instruction.src {
                cpu.registers.sp.operation(cleanup as u16, u16::wrapping_add);
            }
        }
        Op::Retf => {
            let ip = cpu.pop_word(mem)?;
            let cs = cpu.pop_word(mem)?;
            cpu.registers.ip.set(ip);
            cpu.registers.cs = cs;
            if let Operand::Imm(cleanup) = instruction.src {
                cpu.registers.sp.operation(cleanup as u16, u16::wrapping_add);
            }
        }
        Op::Jmp => {
            let target = match instruction.dst {
                Operand::None => {
                    let rel = read_operand(cpu, mem, instruction, instruction.src)? as u16;
                    cpu.registers.ip.word().wrapping_add(rel)
                }
                _ => read_operand(cpu, mem, instruction, instruction.dst)? as u16,
            };
            cpu.registers.ip.set(target);
        }
        Op::JmpFar => {
            let (segment, offset) = far_target(cpu, mem, instruction)?;
            cpu.registers.cs = segment;
            cpu.registers.ip.set(offset);
        }
        Op::Jcc(cc) => {
            let rel = read_operand(cpu, mem, instruction, instruction.src)? as u16;
            if condition(cpu, cc) {
                relative_jump(cpu, rel);
            }
        }
        Op::Jcxz => {
            let rel = read_operand(cpu, mem, instruction, instruction.src)? as u16;
            if cpu.registers.cx.word() == 0 {
                relative_jump(cpu, rel);
            }
        }
        Op::Loop | Op::Loope | Op::Loopne => {
            let rel = read_operand(cpu, mem, instruction, instruction.src)? as u16;
            let cx = cpu.registers.cx.operation(1, u16::wrapping_sub);
            let zf = cpu.check_flag(Zero);
            let taken = cx != 0
                && match instruction.op {
                    Op::Loope => zf,
                    Op::Loopne => !zf,
                    _ => true,
                };
            if taken {
                relative_jump(cpu, rel);
            }
        }
        Op::Enter => {
            let locals = read_operand(cpu, mem, instruction, instruction.dst)? as u16;
            let level = (read_operand(cpu, mem, instruction, instruction.src)? as u16) & 0x1F;
            let bp = cpu.registers.bp.word();
            cpu.push_word(mem, bp)?;
            let frame = cpu.registers.sp.word();
            for i in 1..level {
                let outer = mem.get_word(cpu.registers.ss, bp.wrapping_sub(i * 2))?;
                cpu.push_word(mem, outer)?;
            }
            if level > 0 {
                cpu.push_word(mem, frame)?;
            }
            cpu.registers.bp.set(frame);
            let sp = cpu.registers.sp.word();
            cpu.registers.sp.set(sp.wrapping_sub(locals));
        }
        Op::Leave => {
            let bp = cpu.registers.bp.word();
            cpu.registers.sp.set(bp);
            let saved = cpu.pop_word(mem)?;
            cpu.registers.bp.set(saved);
        }
        _ => return Err(ExecError::Decode),
    }
    Ok(Flow::Continue)
}
