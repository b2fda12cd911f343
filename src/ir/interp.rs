// This module is a small reference interpreter for the IR, used to check that allocation
// preserves meaning: a function is run before and after allocation and the observable
// behaviour (values pushed, value returned) must match. Machine state models the IA-32
// register file with 8-bit views merging into their 32-bit registers, XMM registers as
// 64-bit patterns, the flags as the outcome of the last comparison or arithmetic result,
// stack slots, and virtual operands as an abstract environment. Reading anything that
// was never written, or was destroyed by a call, is an error, which is how values carried
// through a call in a caller-saved register show up. Calls are opaque: they clobber the
// caller-saved registers and, in the two-operand form, return a value derived from the
// target in EAX.

//! Reference interpreter.

use super::{Function, Inst, Location, OpndId};
use crate::core::constraint::OpndSize;
use crate::core::register_file::{RegKind, RegName, EAX};
use crate::ia32::calling_convention::Cdecl;
use hashbrown::HashMap;
use thiserror::Error;

/// Default bound on executed instructions.
pub const DEFAULT_STEP_LIMIT: usize = 100_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterpError {
    #[error("Step limit of {0} instructions exceeded")]
    StepLimit(usize),

    #[error("Read of undefined {operand} in '{inst}'")]
    Undefined { operand: String, inst: String },

    #[error("Cannot interpret '{0}'")]
    Unsupported(String),
}

/// Observable behaviour of one run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Outcome {
    /// Values passed to `push`, in order.
    pub trace: Vec<i64>,
    /// Value returned through EAX by `ret eax`.
    pub ret: Option<i64>,
}

/// Result of the opaque call to `target`.
pub fn call_result(target: u64) -> u32 {
    (target as u32).wrapping_mul(7).wrapping_add(3)
}

struct Machine<'f> {
    func: &'f Function,
    gp: [Option<u32>; 8],
    xmm: [Option<u64>; 8],
    flags: Option<i64>,
    slots: Vec<Option<u64>>,
    vars: HashMap<OpndId, u64>,
    outcome: Outcome,
    current: usize,
}

enum Flow {
    Next,
    Jump(usize),
    Return,
}

/// Run `func` from its first block.
pub fn run(func: &Function) -> Result<Outcome, InterpError> {
    run_with_limit(func, DEFAULT_STEP_LIMIT)
}

pub fn run_with_limit(func: &Function, limit: usize) -> Result<Outcome, InterpError> {
    let mut m = Machine {
        func,
        gp: [None; 8],
        xmm: [None; 8],
        flags: None,
        slots: vec![None; func.slots.len()],
        vars: HashMap::new(),
        outcome: Outcome::default(),
        current: 0,
    };
    // The stack and frame pointers are always defined.
    m.gp[4] = Some(0x1000);
    m.gp[5] = Some(0x1000);

    let mut steps = 0;
    let mut block = 0;
    'blocks: while block < func.blocks.len() {
        for &inst in &func.blocks[block].insts {
            steps += 1;
            if steps > limit {
                return Err(InterpError::StepLimit(limit));
            }
            match m.step(inst)? {
                Flow::Next => {}
                Flow::Jump(target) => {
                    block = target;
                    continue 'blocks;
                }
                Flow::Return => return Ok(m.outcome),
            }
        }
        // Fall through.
        block += 1;
    }
    Ok(m.outcome)
}

fn sign_extend(value: u64, size: OpndSize) -> i64 {
    match size {
        OpndSize::S8 => value as u8 as i8 as i64,
        OpndSize::S16 => value as u16 as i16 as i64,
        OpndSize::S64 | OpndSize::S128 => value as i64,
        _ => value as u32 as i32 as i64,
    }
}

impl Machine<'_> {
    fn undefined(&self, opnd: OpndId) -> InterpError {
        InterpError::Undefined {
            operand: self.func.operand_to_string(opnd),
            inst: self.func.inst_to_string(self.current),
        }
    }

    fn unsupported(&self) -> InterpError {
        InterpError::Unsupported(self.func.inst_to_string(self.current))
    }

    fn read(&self, opnd: OpndId) -> Result<u64, InterpError> {
        let operand = &self.func.operands[opnd];
        let size = operand.size();
        let value = match operand.loc {
            Location::None => self.vars.get(&opnd).copied(),
            Location::Imm(v) => Some(v as u64),
            Location::Mem(slot) => self.slots[slot],
            Location::Reg(reg) => self.read_reg(reg),
        };
        value
            .map(|v| v & size.value_mask())
            .ok_or_else(|| self.undefined(opnd))
    }

    fn read_reg(&self, reg: RegName) -> Option<u64> {
        let i = reg.index as usize;
        match reg.kind {
            RegKind::Gp => self.gp[i].map(u64::from),
            RegKind::Xmm => self.xmm[i],
            RegKind::Status => self.flags.map(|f| f as u64),
        }
    }

    fn write(&mut self, opnd: OpndId, value: u64) {
        let operand = &self.func.operands[opnd];
        let size = operand.size();
        let value = value & size.value_mask();
        match operand.loc {
            Location::None => {
                self.vars.insert(opnd, value);
            }
            Location::Imm(_) => {}
            Location::Mem(slot) => {
                let old = self.slots[slot].unwrap_or(0);
                self.slots[slot] = Some((old & !size.value_mask()) | value);
            }
            Location::Reg(reg) => {
                let i = reg.index as usize;
                match reg.kind {
                    RegKind::Gp => {
                        let old = self.gp[i].unwrap_or(0) as u64;
                        self.gp[i] = Some(((old & !size.value_mask()) | value) as u32);
                    }
                    RegKind::Xmm => self.xmm[i] = Some(value),
                    RegKind::Status => self.flags = Some(value as i64),
                }
            }
        }
    }

    fn set_flags(&mut self, result: i64) {
        self.flags = Some(result.signum());
    }

    fn step(&mut self, id: usize) -> Result<Flow, InterpError> {
        self.current = id;
        let func = self.func;
        let inst = &func.insts[id];
        let ops = &inst.opnds;
        let size = ops
            .first()
            .map(|&o| func.operands[o].size())
            .unwrap_or(OpndSize::S32);

        match inst.mnemonic() {
            "mov" | "movss" | "movsd" => {
                let v = self.read(ops[1])?;
                self.write(ops[0], v);
            }
            mn @ ("add" | "sub" | "and" | "or" | "xor" | "imul" | "shl" | "shr" | "sar") => {
                let a = self.read(ops[0])?;
                let b = self.read(ops[1])?;
                let count = (b & 31) as u32;
                let r = match mn {
                    "add" => a.wrapping_add(b),
                    "sub" => a.wrapping_sub(b),
                    "and" => a & b,
                    "or" => a | b,
                    "xor" => a ^ b,
                    "imul" => (sign_extend(a, size).wrapping_mul(sign_extend(b, size))) as u64,
                    "shl" => a.wrapping_shl(count),
                    "shr" => (a & size.value_mask()).wrapping_shr(count),
                    _ => (sign_extend(a, size) >> count) as u64,
                };
                let r = r & size.value_mask();
                self.write(ops[0], r);
                self.set_flags(sign_extend(r, size));
            }
            "cmp" => {
                let a = sign_extend(self.read(ops[1])?, func.operands[ops[1]].size());
                let b = sign_extend(self.read(ops[2])?, func.operands[ops[1]].size());
                self.write(ops[0], a.cmp(&b) as i64 as u64);
            }
            "test" => {
                let a = self.read(ops[1])?;
                let b = self.read(ops[2])?;
                self.write(ops[0], u64::from(a & b != 0));
            }
            "set" => {
                let holds = self.condition(inst)?;
                self.write(ops[1], u64::from(holds));
            }
            "cmov" => {
                let holds = self.condition(inst)?;
                let v = self.read(ops[2])?;
                if holds {
                    self.write(ops[1], v);
                } else {
                    // The destination is read even when not written.
                    self.read(ops[1])?;
                }
            }
            "j" => {
                if self.condition(inst)? {
                    return Ok(Flow::Jump(inst.targets[0]));
                }
            }
            "jmp" => match inst.targets.first() {
                Some(&target) => return Ok(Flow::Jump(target)),
                None => return Err(self.unsupported()),
            },
            "call" => {
                let target_pos = inst.group().target.unwrap_or(0);
                let target = self.read(ops[target_pos])?;
                let clobbers = Cdecl::caller_saved();
                for (kind, index) in clobbers.iter() {
                    let i = index as usize;
                    match kind {
                        RegKind::Gp => self.gp[i] = None,
                        RegKind::Xmm => self.xmm[i] = None,
                        RegKind::Status => self.flags = None,
                    }
                }
                if ops.len() == 2 {
                    self.gp[EAX as usize] = Some(call_result(target));
                }
            }
            "ret" => {
                if let Some(&value) = ops.first() {
                    let v = self.read(value)?;
                    self.outcome.ret = Some(sign_extend(v, OpndSize::S32));
                }
                return Ok(Flow::Return);
            }
            "push" => {
                let v = self.read(ops[0])?;
                let width = func.operands[ops[0]].size();
                self.outcome.trace.push(sign_extend(v, width));
            }
            mn @ ("addss" | "addsd" | "subsd" | "mulsd") => {
                let a = self.read(ops[0])?;
                let b = self.read(ops[1])?;
                let r = if mn == "addss" {
                    let r = f32::from_bits(a as u32) + f32::from_bits(b as u32);
                    r.to_bits() as u64
                } else {
                    let (x, y) = (f64::from_bits(a), f64::from_bits(b));
                    let r = match mn {
                        "addsd" => x + y,
                        "subsd" => x - y,
                        _ => x * y,
                    };
                    r.to_bits()
                };
                self.write(ops[0], r);
            }
            "cvtsi2sd" => {
                let v = sign_extend(self.read(ops[1])?, OpndSize::S32);
                self.write(ops[0], (v as f64).to_bits());
            }
            "cvttsd2si" => {
                let v = f64::from_bits(self.read(ops[1])?);
                self.write(ops[0], v as i32 as u32 as u64);
            }
            _ => return Err(self.unsupported()),
        }
        Ok(Flow::Next)
    }

    fn condition(&self, inst: &Inst) -> Result<bool, InterpError> {
        let flags = self.read(inst.opnds[0])?;
        let cond = inst
            .cond
            .ok_or_else(|| self.unsupported())?;
        Ok(cond.holds(flags as u32 as i32 as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_ir::parse_function;

    #[test]
    fn test_arithmetic_and_branches() {
        let func = parse_function(
            r#"
            func sum {
            entry:
                mov %i:i32, $4
                mov %s:i32, $0
            head:
                add %s, %i
                sub %i, $1
                cmp %f:flags, %i, $0
                j.ne %f, ^head
            exit:
                push %s
                mov eax, %s
                ret eax
            }
            "#,
        )
        .unwrap();
        let outcome = run(&func).unwrap();
        assert_eq!(outcome.trace, vec![10]);
        assert_eq!(outcome.ret, Some(10));
    }

    #[test]
    fn test_byte_registers_merge() {
        let func = parse_function(
            r#"
            func bytes {
            entry:
                mov eax, $0x1234
                mov al, $-1
                push eax
                cmp %f:flags, eax, $0
                set.g %f, bl
                push ebx
                ret
            }
            "#,
        )
        .unwrap();
        // ebx was never written in full, so only the low byte is known.
        let outcome = run(&func).unwrap();
        assert_eq!(outcome.trace, vec![0x12ff, 1]);
    }

    #[test]
    fn test_call_clobbers_caller_saved() {
        let func = parse_function(
            r#"
            func clobber {
            entry:
                mov ecx, $5
                mov ebx, $6
                call eax, $10
                push eax
                push ebx
                push ecx
                ret
            }
            "#,
        )
        .unwrap();
        let err = run(&func).unwrap_err();
        assert!(matches!(err, InterpError::Undefined { ref operand, .. } if operand == "ecx"));

        let partial = parse_function(
            "func p {\nentry:\n  mov ebx, $6\n  call eax, $10\n  push eax\n  push ebx\n  ret\n}\n",
        )
        .unwrap();
        assert_eq!(run(&partial).unwrap().trace, vec![73, 6]);
    }

    #[test]
    fn test_undefined_virtual_and_step_limit() {
        let func = parse_function("func u {\nentry:\n  push %x:i32\n  ret\n}\n").unwrap();
        assert!(matches!(run(&func), Err(InterpError::Undefined { .. })));

        let spin = parse_function("func s {\nentry:\n  jmp ^entry\n}\n").unwrap();
        assert_eq!(run_with_limit(&spin, 50), Err(InterpError::StepLimit(50)));
    }

    #[test]
    fn test_float_ops() {
        let func = parse_function(
            r#"
            func fp {
            entry:
                mov %n:i32, $3
                cvtsi2sd %x:f64, %n
                mulsd %x, %x
                cvttsd2si %r:i32, %x
                push %r
                ret
            }
            "#,
        )
        .unwrap();
        assert_eq!(run(&func).unwrap().trace, vec![9]);
    }
}
