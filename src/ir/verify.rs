// Post-allocation checks over a fully placed Function. Every operand must have a location,
// every instruction must match an encodable form of its opcode group, two values may not
// occupy the same physical register while both are live, values may not be carried through
// a call in a register the call clobbers, and a home slot may only be used by the operand
// it belongs to. Register conflicts are found with a backward scan per block over liveness
// recomputed on the allocated code, so the checks do not trust any allocator bookkeeping.
// Implicit definitions count: an arithmetic instruction writes the flags whether or not
// they appear as an operand.

//! Post-allocation verifier.

use super::{Function, InstId, Liveness, Location, OpndId};
use crate::core::constraint::OpndSize;
use crate::core::register_file::{RegKind, RegName};
use hashbrown::HashSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Virtual operand {operand} remains in '{inst}'")]
    Virtual { operand: String, inst: String },

    #[error("'{inst}' matches no encodable form")]
    Unencodable { inst: String },

    #[error("'{inst}' writes {reg} while it still holds {live}")]
    Conflict {
        inst: String,
        reg: String,
        live: String,
    },

    #[error("{operand} is carried through '{inst}' in clobbered {reg}")]
    CallClobber {
        inst: String,
        operand: String,
        reg: String,
    },

    #[error("Slot s{slot} belongs to {owner} but holds {operand}")]
    SlotShared {
        slot: usize,
        owner: String,
        operand: String,
    },
}

/// Check every property of allocated code, returning the first violation.
pub fn verify(func: &Function) -> Result<(), VerifyError> {
    check_placement(func)?;
    check_slots(func)?;
    check_registers(func)
}

/// No virtual operands remain and every instruction is encodable.
pub fn check_placement(func: &Function) -> Result<(), VerifyError> {
    for block in &func.blocks {
        for &id in &block.insts {
            let inst = &func.insts[id];
            if let Some(&opnd) = inst.opnds.iter().find(|&&o| func.operands[o].is_virtual()) {
                return Err(VerifyError::Virtual {
                    operand: func.operand_to_string(opnd),
                    inst: func.inst_to_string(id),
                });
            }
            let actual: Vec<_> = inst.opnds.iter().map(|&o| func.placement(o)).collect();
            if !inst.group().match_form(&actual) {
                return Err(VerifyError::Unencodable {
                    inst: func.inst_to_string(id),
                });
            }
        }
    }
    Ok(())
}

fn check_slots(func: &Function) -> Result<(), VerifyError> {
    for (opnd, operand) in func.operands.iter().enumerate() {
        let Location::Mem(slot) = operand.loc else { continue };
        if let Some(owner) = func.slots[slot].owner {
            if func.root(opnd) != owner {
                return Err(VerifyError::SlotShared {
                    slot,
                    owner: func.operands[owner].name.clone(),
                    operand: operand.name.clone(),
                });
            }
        }
    }
    Ok(())
}

fn same_register(a: RegName, b: RegName) -> bool {
    a.kind == b.kind && a.index == b.index
}

/// Registers named directly in the input may alias on purpose (`mov al, ..`
/// into a live `eax`).
fn both_input(func: &Function, def: Option<OpndId>, other: OpndId) -> bool {
    def.is_some_and(|d| func.operands[d].origin.is_none()) && func.operands[other].origin.is_none()
}

/// Registers no two live values share, and no value survives a clobber.
pub fn check_registers(func: &Function) -> Result<(), VerifyError> {
    let liveness = Liveness::compute(func);
    for (b, block) in func.blocks.iter().enumerate() {
        let mut live: HashSet<OpndId> = liveness.live_out(b).clone();
        for &id in block.insts.iter().rev() {
            check_inst(func, id, &live)?;
            let inst = &func.insts[id];
            for (pos, &opnd) in inst.opnds.iter().enumerate() {
                if inst.role(pos).is_pure_def() {
                    live.remove(&opnd);
                }
            }
            for (pos, &opnd) in inst.opnds.iter().enumerate() {
                if inst.role(pos).is_use() && Liveness::tracked(func, opnd) {
                    live.insert(opnd);
                }
            }
        }
    }
    Ok(())
}

/// `live` holds the operands live after `id`.
fn check_inst(func: &Function, id: InstId, live: &HashSet<OpndId>) -> Result<(), VerifyError> {
    let inst = &func.insts[id];
    let group = inst.group();

    let mut written: Vec<(RegName, Option<OpndId>)> = Vec::new();
    for (pos, &opnd) in inst.opnds.iter().enumerate() {
        if let (true, Some(reg)) = (inst.role(pos).is_def(), func.operands[opnd].reg()) {
            written.push((reg, Some(opnd)));
        }
    }
    for (kind, index) in group.implicit_defs.iter() {
        written.push((RegName::new(kind, OpndSize::Any, index), None));
    }

    for &other in live {
        let Some(held) = func.operands[other].reg() else { continue };
        if let Some((reg, _)) = written.iter().find(|(reg, def)| {
            same_register(*reg, held) && *def != Some(other) && !both_input(func, *def, other)
        }) {
            return Err(VerifyError::Conflict {
                inst: func.inst_to_string(id),
                reg: if reg.kind == RegKind::Status { "flags".to_string() } else { held.to_string() },
                live: func.operand_to_string(other),
            });
        }
        if group.clobbers.contains(held) {
            return Err(VerifyError::CallClobber {
                inst: func.inst_to_string(id),
                operand: func.operand_to_string(other),
                reg: held.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::register_file::EAX;
    use crate::test_ir::parse_function;

    #[test]
    fn test_clean_code_verifies() {
        let func = parse_function(
            r#"
            func ok {
            entry:
                mov eax, $1
                mov ebx, $2
                call $100
                push ebx
                mov [s0:i32], ebx
                add [s0:i32], $3
                ret
            }
            "#,
        )
        .unwrap();
        assert_eq!(verify(&func), Ok(()));
    }

    #[test]
    fn test_virtual_and_unencodable() {
        let func = parse_function("func v {\nentry:\n  push %a:i32\n  ret\n}\n").unwrap();
        assert!(matches!(verify(&func), Err(VerifyError::Virtual { .. })));

        let func = parse_function("func m {\nentry:\n  mov [s0:i32], [s1:i32]\n  ret\n}\n").unwrap();
        assert!(matches!(verify(&func), Err(VerifyError::Unencodable { .. })));
    }

    #[test]
    fn test_register_conflict() {
        let mut func = parse_function(
            r#"
            func c {
            entry:
                mov %a:i32, $1
                mov %b:i8, $2
                push %a
                ret
            }
            "#,
        )
        .unwrap();
        let a = func.insts[0].opnds[0];
        let b = func.insts[1].opnds[0];
        let ra = func.split_operand(a, Location::Reg(RegName::gp32(EAX)));
        let rb = func.split_operand(b, Location::Reg(RegName::new(RegKind::Gp, OpndSize::S8, EAX)));
        for inst in &mut func.insts {
            for o in &mut inst.opnds {
                if *o == a {
                    *o = ra;
                } else if *o == b {
                    *o = rb;
                }
            }
        }
        let err = verify(&func).unwrap_err();
        assert!(matches!(err, VerifyError::Conflict { ref reg, .. } if reg == "eax"));

        // The same aliasing written by hand is taken as intended.
        let func = parse_function("func h {\nentry:\n  mov eax, $1\n  mov al, $2\n  push eax\n  ret\n}\n").unwrap();
        assert_eq!(verify(&func), Ok(()));
    }

    #[test]
    fn test_flags_clobbered_by_arithmetic() {
        let func = parse_function(
            r#"
            func f {
            entry:
                cmp flags, ebx, $0
                add ecx, $1
                j.e flags, ^out
            out:
                ret
            }
            "#,
        )
        .unwrap();
        let err = verify(&func).unwrap_err();
        assert!(matches!(err, VerifyError::Conflict { ref reg, .. } if reg == "flags"));
    }

    #[test]
    fn test_value_through_call_in_caller_saved() {
        let func = parse_function(
            r#"
            func p3 {
            entry:
                mov ecx, $1
                call $100
                push ecx
                ret
            }
            "#,
        )
        .unwrap();
        assert!(matches!(verify(&func), Err(VerifyError::CallClobber { .. })));
    }
}
