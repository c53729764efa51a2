use crate::cpu::decoder::{Instruction, Op, Operand, Width};
use crate::cpu::{Cpu, ExecError, Flow};
use crate::mem::MemoryCore;

use super::effective_address;

/// Load a floating or integer memory operand as f64.
fn load_mem(
    cpu: &mut Cpu,
    mem: &mut dyn MemoryCore,
    instruction: &Instruction,
    op: Operand,
    integer: bool,
) -> Result<f64, ExecError> {
    let Operand::Mem(m, width) = op else {
        return Err(ExecError::Decode);
    };
    let (segment, offset) = effective_address(cpu, instruction, &m);
    Ok(match (width, integer) {
        (Width::Word, true) => mem.get_word(segment, offset)? as i16 as f64,
        (Width::Dword, true) => mem.get_dword(segment, offset)? as i32 as f64,
        (Width::Qword, true) => {
            let lo = mem.get_dword(segment, offset)? as u64;
            let hi = mem.get_dword(segment, offset.wrapping_add(4))? as u64;
            ((hi << 32) | lo) as i64 as f64
        }
        (Width::Dword, false) => f32::from_bits(mem.get_dword(segment, offset)?) as f64,
        (Width::Qword, false) => {
            let lo = mem.get_dword(segment, offset)? as u64;
            let hi = mem.get_dword(segment, offset.wrapping_add(4))? as u64;
            f64::from_bits((hi << 32) | lo)
        }
        _ => return Err(ExecError::Decode),
    })
}

fn store_mem(
    cpu: &mut Cpu,
    mem: &mut dyn MemoryCore,
    instruction: &Instruction,
    op: Operand,
    value: f64,
    integer: bool,
) -> Result<(), ExecError> {
    let Operand::Mem(m, width) = op else {
        return Err(ExecError::Decode);
    };
    let (segment, offset) = effective_address(cpu, instruction, &m);
    match (width, integer) {
        (Width::Word, true) => mem.set_word(segment, offset, round_to_int(value) as i16 as u16)?,
        (Width::Dword, true) => mem.set_dword(segment, offset, round_to_int(value) as i32 as u32)?,
        (Width::Qword, true) => {
            let bits = round_to_int(value) as u64;
            mem.set_dword(segment, offset, bits as u32)?;
            mem.set_dword(segment, offset.wrapping_add(4), (bits >> 32) as u32)?;
        }
        (Width::Dword, false) => mem.set_dword(segment, offset, (value as f32).to_bits())?,
        (Width::Qword, false) => {
            let bits = value.to_bits();
            mem.set_dword(segment, offset, bits as u32)?;
            mem.set_dword(segment, offset.wrapping_add(4), (bits >> 32) as u32)?;
        }
        _ => return Err(ExecError::Decode),
    }
    Ok(())
}

/// Round-to-nearest-even, the default x87 rounding mode. Out-of-range
/// conversions saturate through the `as` cast at the call site.
fn round_to_int(value: f64) -> i64 {
    let floor = value.floor();
    let diff = value - floor;
    let rounded = if diff > 0.5 {
        floor + 1.0
    } else if diff < 0.5 {
        floor
    } else if (floor as i64) % 2 == 0 {
        floor
    } else {
        floor + 1.0
    };
    rounded as i64
}

/// Source value for the arithmetic families: ST(i) or a memory operand.
fn arith_source(
    cpu: &mut Cpu,
    mem: &mut dyn MemoryCore,
    instruction: &Instruction,
    integer: bool,
) -> Result<f64, ExecError> {
    match instruction.src {
        Operand::St(i) => Ok(cpu.fpu.st(i)?),
        Operand::Mem(..) => load_mem(cpu, mem, instruction, instruction.src, integer),
        _ => Err(ExecError::Decode),
    }
}

/// Destination slot of the arithmetic families; ST(0) when unspecified.
fn dest_slot(instruction: &Instruction) -> u8 {
    match instruction.dst {
        Operand::St(i) => i,
        _ => 0,
    }
}

pub(super) fn execute(
    cpu: &mut Cpu,
    mem: &mut dyn MemoryCore,
    instruction: &Instruction,
) -> Result<Flow, ExecError> {
    match instruction.op {
        Op::Fld => {
            let value = match instruction.src {
                Operand::St(i) => cpu.fpu.st(i)?,
                _ => load_mem(cpu, mem, instruction, instruction.src, false)?,
            };
            cpu.fpu.push(value)?;
        }
        Op::Fild => {
            let value = load_mem(cpu, mem, instruction, instruction.src, true)?;
            cpu.fpu.push(value)?;
        }
        Op::Fst | Op::Fstp => {
            let value = cpu.fpu.st(0)?;
            match instruction.dst {
                Operand::St(i) => cpu.fpu.set_st(i, value),
                _ => store_mem(cpu, mem, instruction, instruction.dst, value, false)?,
            }
            if instruction.op == Op::Fstp {
                cpu.fpu.pop()?;
            }
        }
        Op::Fist | Op::Fistp => {
            let value = cpu.fpu.st(0)?;
            store_mem(cpu, mem, instruction, instruction.dst, value, true)?;
            if instruction.op == Op::Fistp {
                cpu.fpu.pop()?;
            }
        }
        Op::Fld1 => cpu.fpu.push(1.0)?,
        Op::Fldz => cpu.fpu.push(0.0)?,
        Op::Fldpi => cpu.fpu.push(std::f64::consts::PI)?,

        Op::Fadd | Op::Fiadd => {
            let operand = arith_source(cpu, mem, instruction, instruction.op == Op::Fiadd)?;
            let slot = dest_slot(instruction);
            let current = cpu.fpu.st(slot)?;
            cpu.fpu.set_st(slot, current + operand);
        }
        Op::Fmul | Op::Fimul => {
            let operand = arith_source(cpu, mem, instruction, instruction.op == Op::Fimul)?;
            let slot = dest_slot(instruction);
            let current = cpu.fpu.st(slot)?;
            cpu.fpu.set_st(slot, current * operand);
        }
        Op::Fsub | Op::Fisub => {
            let operand = arith_source(cpu, mem, instruction, instruction.op == Op::Fisub)?;
            let slot = dest_slot(instruction);
            let current = cpu.fpu.st(slot)?;
            cpu.fpu.set_st(slot, current - operand);
        }
        Op::Fsubr | Op::Fisubr => {
            let operand = arith_source(cpu, mem, instruction, instruction.op == Op::Fisubr)?;
            let slot = dest_slot(instruction);
            let current = cpu.fpu.st(slot)?;
            cpu.fpu.set_st(slot, operand - current);
        }
        Op::Fdiv | Op::Fidiv => {
            let operand = arith_source(cpu, mem, instruction, instruction.op == Op::Fidiv)?;
            let slot = dest_slot(instruction);
            let current = cpu.fpu.st(slot)?;
            cpu.fpu.set_st(slot, current / operand);
        }
        Op::Fdivr | Op::Fidivr => {
            let operand = arith_source(cpu, mem, instruction, instruction.op == Op::Fidivr)?;
            let slot = dest_slot(instruction);
            let current = cpu.fpu.st(slot)?;
            cpu.fpu.set_st(slot, operand / current);
        }

        // The P forms fold ST(0) into ST(i), then pop.
        Op::Faddp | Op::Fmulp | Op::Fsubp | Op::Fsubrp | Op::Fdivp | Op::Fdivrp => {
            let slot = dest_slot(instruction);
            let st0 = cpu.fpu.st(0)?;
            let sti = cpu.fpu.st(slot)?;
            let result = match instruction.op {
                Op::Faddp => sti + st0,
                Op::Fmulp => sti * st0,
                Op::Fsubp => sti - st0,
                Op::Fsubrp => st0 - sti,
                Op::Fdivp => sti / st0,
                _ => st0 / sti,
            };
            cpu.fpu.set_st(slot, result);
            cpu.fpu.pop()?;
        }

        Op::Fcom | Op::Fcomp | Op::Ficom | Op::Ficomp => {
            let integer = matches!(instruction.op, Op::Ficom | Op::Ficomp);
            let operand = arith_source(cpu, mem, instruction, integer)?;
            let st0 = cpu.fpu.st(0)?;
            cpu.fpu.compare(st0, operand);
            if matches!(instruction.op, Op::Fcomp | Op::Ficomp) {
                cpu.fpu.pop()?;
            }
        }
        Op::Fcompp => {
            let st0 = cpu.fpu.st(0)?;
            let st1 = cpu.fpu.st(1)?;
            cpu.fpu.compare(st0, st1);
            cpu.fpu.pop()?;
            cpu.fpu.pop()?;
        }
        Op::Ftst => {
            let st0 = cpu.fpu.st(0)?;
            cpu.fpu.compare(st0, 0.0);
        }

        Op::Fxch => {
            let Operand::St(i) = instruction.src else {
                return Err(ExecError::Decode);
            };
            cpu.fpu.exchange(i)?;
        }
        Op::Fchs => {
            let st0 = cpu.fpu.st(0)?;
            cpu.fpu.set_st(0, -st0);
        }
        Op::Fabs => {
            let st0 = cpu.fpu.st(0)?;
            cpu.fpu.set_st(0, st0.abs());
        }
        Op::Fsqrt => {
            let st0 = cpu.fpu.st(0)?;
            cpu.fpu.set_st(0, st0.sqrt());
        }
        Op::Frndint => {
            let st0 = cpu.fpu.st(0)?;
            cpu.fpu.set_st(0, round_to_int(st0) as f64);
        }
        Op::Ffree => {
            let Operand::St(i) = instruction.dst else {
                return Err(ExecError::Decode);
            };
            cpu.fpu.free(i);
        }

        Op::Fldcw => {
            let Operand::Mem(m, _) = instruction.src else {
                return Err(ExecError::Decode);
            };
            let (segment, offset) = effective_address(cpu, instruction, &m);
            cpu.fpu.control = mem.get_word(segment, offset)?;
        }
        Op::Fnstcw => {
            let Operand::Mem(m, _) = instruction.dst else {
                return Err(ExecError::Decode);
            };
            let (segment, offset) = effective_address(cpu, instruction, &m);
            let control = cpu.fpu.control;
            mem.set_word(segment, offset, control)?;
        }
        Op::Fnstsw => {
            let status = cpu.fpu.status_word();
            cpu.registers.ax.set(status);
        }
        Op::Fninit => cpu.fpu.reset(),
        Op::Fnclex => cpu.fpu.clear_exceptions(),

        _ => return Err(ExecError::Decode),
    }
    Ok(Flow::Continue)
}
