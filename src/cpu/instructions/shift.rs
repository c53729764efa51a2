use crate::cpu::decoder::{Instruction, Op, Width};
use crate::cpu::CpuFlag::*;
use crate::cpu::{Cpu, ExecError, Flow};
use crate::mem::MemoryCore;
use crate::utils::number::SpecialOps;

use super::{operand_width, read_operand, write_operand};

#[inline]
fn bits(width: Width) -> u32 {
    match width {
        Width::Byte => 8,
        Width::Word => 16,
        _ => 32,
    }
}

#[inline]
fn mask(width: Width, value: u32) -> u32 {
    match width {
        Width::Byte => value & 0xFF,
        Width::Word => value & 0xFFFF,
        _ => value,
    }
}

#[inline]
fn msb(width: Width, value: u32) -> bool {
    value & (1 << (bits(width) - 1)) != 0
}

fn result_flags(cpu: &mut Cpu, width: Width, res: u32) {
    cpu.update_flag(Zero, res == 0);
    cpu.update_flag(Sign, msb(width, res));
    cpu.update_flag(Parity, (res as u8).count_ones() & 1 == 0);
}

pub(super) fn execute(
    cpu: &mut Cpu,
    mem: &mut dyn MemoryCore,
    instruction: &Instruction,
) -> Result<Flow, ExecError> {
    let width = operand_width(instruction.dst, instruction.width);
    let value = read_operand(cpu, mem, instruction, instruction.dst)?;
    // 186+ masks the count to 5 bits.
    let count = read_operand(cpu, mem, instruction, instruction.src)? & 0x1F;
    if count == 0 {
        return Ok(Flow::Continue);
    }
    let n = bits(width);

    let res = match instruction.op {
        Op::Shl => {
            let res = mask(width, value.wrapping_shl(count));
            let carry = count <= n && value & (1u32.wrapping_shl(n - count)) != 0;
            cpu.update_flag(Carry, carry);
            if count == 1 {
                cpu.update_flag(Overflow, carry != msb(width, res));
            }
            result_flags(cpu, width, res);
            res
        }
        Op::Shr => {
            let res = mask(width, value.wrapping_shr(count));
            cpu.update_flag(Carry, value & (1u32.wrapping_shl(count - 1)) != 0);
            if count == 1 {
                cpu.update_flag(Overflow, msb(width, value));
            }
            result_flags(cpu, width, res);
            res
        }
        Op::Sar => {
            let res = match width {
                Width::Byte => ((value as u8 as i8) >> count.min(7)) as u8 as u32,
                Width::Word => ((value as u16 as i16) >> count.min(15)) as u16 as u32,
                _ => ((value as i32) >> count.min(31)) as u32,
            };
            cpu.update_flag(Carry, value.wrapping_shr((count - 1).min(n - 1)) & 1 != 0);
            if count == 1 {
                cpu.unset_flag(Overflow);
            }
            result_flags(cpu, width, res);
            res
        }
        Op::Rol => {
            let count = count % n;
            let res = mask(width, value.wrapping_shl(count) | value.wrapping_shr((n - count) % n));
            cpu.update_flag(Carry, res & 1 != 0);
            if count == 1 {
                cpu.update_flag(Overflow, (res & 1 != 0) != msb(width, res));
            }
            res
        }
        Op::Ror => {
            let count = count % n;
            let res = mask(width, value.wrapping_shr(count) | value.wrapping_shl((n - count) % n));
            cpu.update_flag(Carry, msb(width, res));
            if count == 1 {
                cpu.update_flag(Overflow, msb(width, res) != (res & (1 << (n - 2)) != 0));
            }
            res
        }
        Op::Rcl => {
            let carry = cpu.check_flag(Carry);
            let (res, carry_out) = match width {
                Width::Byte => {
                    let (r, c) = (value as u8).rotate_carry_left(count, carry);
                    (r as u32, c)
                }
                Width::Word => {
                    let (r, c) = (value as u16).rotate_carry_left(count, carry);
                    (r as u32, c)
                }
                _ => value.rotate_carry_left(count, carry),
            };
            cpu.update_flag(Carry, carry_out);
            if count == 1 {
                cpu.update_flag(Overflow, carry_out != msb(width, res));
            }
            res
        }
        Op::Rcr => {
            let carry = cpu.check_flag(Carry);
            if count == 1 {
                cpu.update_flag(Overflow, carry != msb(width, value));
            }
            let (res, carry_out) = match width {
                Width::Byte => {
                    let (r, c) = (value as u8).rotate_carry_right(count, carry);
                    (r as u32, c)
                }
                Width::Word => {
                    let (r, c) = (value as u16).rotate_carry_right(count, carry);
                    (r as u32, c)
                }
                _ => value.rotate_carry_right(count, carry),
            };
            cpu.update_flag(Carry, carry_out);
            res
        }
        _ => return Err(ExecError::Decode),
    };

    write_operand(cpu, mem, instruction, instruction.dst, res)?;
    Ok(Flow::Continue)
}
