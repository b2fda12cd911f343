// This module lowers an allocated Function to 32-bit IA-32 machine code using the iced-x86
// code assembler. Ia32Encoder wraps a CodeAssembler in 32-bit mode and converts register
// names, stack slots and immediates into iced operands; every IR opcode group maps onto
// the assembler method of the same instruction, with the flags operand left implicit.
// Blocks get labels on demand so forward and backward branches resolve when the code is
// assembled. The emitted frame follows the cdecl layout in FunctionFrame: EBP-based, the
// callee-saved registers the function writes pushed after EBP, stack slots below them.
// Since `push` moves ESP inside the body, the epilogue restores ESP from EBP. Operands
// that are still virtual cannot be encoded and are reported as UnplacedOperand.

//! IA-32 machine code emission using iced-x86.

use super::calling_convention::{Cdecl, FunctionFrame};
use crate::core::constraint::OpndSize;
use crate::core::error::{AllocError, AllocResult};
use crate::core::register_file::{RegKind, RegName};
use crate::ia32::opcodes::Cond;
use crate::ir::{Function, InstId, Location, OpndId};
use bumpalo::Bump;
use hashbrown::HashMap;
use iced_x86::code_asm::*;
use iced_x86::IcedError;

/// Base address the code is assembled for.
pub const CODE_BASE: u64 = 0x1000;

/// An operand in assembler form.
#[derive(Clone, Copy)]
enum Op {
    R8(AsmRegister8),
    R32(AsmRegister32),
    X(AsmRegisterXmm),
    M(AsmMemoryOperand),
    I(i32),
    Flags,
}

fn emit_error(e: IcedError) -> AllocError {
    AllocError::Emit {
        reason: e.to_string(),
    }
}

/// Dispatch a two-operand integer instruction over the operand shapes IA-32 encodes.
macro_rules! alu {
    ($asm:expr, $method:ident, $dst:expr, $src:expr) => {
        match ($dst, $src) {
            (Op::R32(d), Op::R32(s)) => $asm.$method(d, s),
            (Op::R32(d), Op::M(s)) => $asm.$method(d, s),
            (Op::M(d), Op::R32(s)) => $asm.$method(d, s),
            (Op::R32(d), Op::I(s)) => $asm.$method(d, s),
            (Op::M(d), Op::I(s)) => $asm.$method(d, s),
            (Op::R8(d), Op::R8(s)) => $asm.$method(d, s),
            (Op::R8(d), Op::M(s)) => $asm.$method(d, s),
            (Op::M(d), Op::R8(s)) => $asm.$method(d, s),
            (Op::R8(d), Op::I(s)) => $asm.$method(d, s),
            _ => return Err(Shape),
        }
    };
}

/// Dispatch a scalar SSE instruction.
macro_rules! sse {
    ($asm:expr, $method:ident, $dst:expr, $src:expr) => {
        match ($dst, $src) {
            (Op::X(d), Op::X(s)) => $asm.$method(d, s),
            (Op::X(d), Op::M(s)) => $asm.$method(d, s),
            _ => return Err(Shape),
        }
    };
}

/// Operand combination with no encoding.
struct Shape;

pub struct Ia32Encoder {
    /// Code assembler for generating instructions.
    assembler: CodeAssembler,
    /// Labels for basic blocks, created on first reference.
    block_labels: HashMap<usize, CodeLabel>,
}

impl Ia32Encoder {
    pub fn new() -> AllocResult<Self> {
        let assembler = CodeAssembler::new(32).map_err(emit_error)?;
        Ok(Self {
            assembler,
            block_labels: HashMap::new(),
        })
    }

    fn gp32(index: u8) -> AllocResult<AsmRegister32> {
        const GP32_REGS: [AsmRegister32; 8] = [eax, ecx, edx, ebx, esp, ebp, esi, edi];
        GP32_REGS.get(index as usize).copied().ok_or_else(|| AllocError::Emit {
            reason: format!("no 32-bit register {}", index),
        })
    }

    fn gp8(index: u8) -> AllocResult<AsmRegister8> {
        const GP8_REGS: [AsmRegister8; 4] = [al, cl, dl, bl];
        GP8_REGS.get(index as usize).copied().ok_or_else(|| AllocError::Emit {
            reason: format!("no 8-bit view of register {}", index),
        })
    }

    fn xmm(index: u8) -> AllocResult<AsmRegisterXmm> {
        const XMM_REGS: [AsmRegisterXmm; 8] = [xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7];
        XMM_REGS.get(index as usize).copied().ok_or_else(|| AllocError::Emit {
            reason: format!("no register xmm{}", index),
        })
    }

    fn register(reg: RegName) -> AllocResult<Op> {
        Ok(match (reg.kind, reg.size) {
            (RegKind::Gp, OpndSize::S8) => Op::R8(Self::gp8(reg.index)?),
            (RegKind::Gp, _) => Op::R32(Self::gp32(reg.index)?),
            (RegKind::Xmm, _) => Op::X(Self::xmm(reg.index)?),
            (RegKind::Status, _) => Op::Flags,
        })
    }

    fn operand(func: &Function, frame: &FunctionFrame<'_>, opnd: OpndId) -> AllocResult<Op> {
        let operand = &func.operands[opnd];
        match operand.loc {
            Location::None => Err(AllocError::UnplacedOperand {
                operand: func.operand_to_string(opnd),
            }),
            Location::Reg(reg) => Self::register(reg),
            Location::Imm(value) => i32::try_from(value)
                .map(Op::I)
                .map_err(|_| AllocError::Emit {
                    reason: format!("immediate {} does not fit 32 bits", value),
                }),
            Location::Mem(slot) => {
                let offset = frame.slot_offsets[slot];
                Ok(Op::M(match operand.size() {
                    OpndSize::S8 => byte_ptr(ebp + offset),
                    OpndSize::S64 => qword_ptr(ebp + offset),
                    _ => dword_ptr(ebp + offset),
                }))
            }
        }
    }

    /// Create or get a label for a basic block.
    fn label(&mut self, block: usize) -> CodeLabel {
        if let Some(&label) = self.block_labels.get(&block) {
            label
        } else {
            let label = self.assembler.create_label();
            self.block_labels.insert(block, label);
            label
        }
    }

    /// Place a label for a basic block at the current position.
    pub fn place_label_for_block(&mut self, block: usize) -> AllocResult<()> {
        let mut label = self.label(block);
        self.assembler.set_label(&mut label).map_err(emit_error)?;
        // An empty block shares its address with the next one.
        self.assembler.zero_bytes().map_err(emit_error)
    }

    pub fn emit_prologue(&mut self, frame: &FunctionFrame<'_>) -> AllocResult<()> {
        self.assembler.push(ebp).map_err(emit_error)?;
        self.assembler.mov(ebp, esp).map_err(emit_error)?;
        for reg in frame.saved_registers.iter() {
            self.assembler.push(Self::gp32(reg.index)?).map_err(emit_error)?;
        }
        if frame.frame_size > 0 {
            self.assembler
                .sub(esp, frame.frame_size as i32)
                .map_err(emit_error)?;
        }
        Ok(())
    }

    pub fn emit_epilogue(&mut self, frame: &FunctionFrame<'_>) -> AllocResult<()> {
        let saved = frame.saved_registers.len() as i32 * 4;
        self.assembler
            .lea(esp, dword_ptr(ebp - saved))
            .map_err(emit_error)?;
        for reg in frame.saved_registers.iter().rev() {
            self.assembler.pop(Self::gp32(reg.index)?).map_err(emit_error)?;
        }
        self.assembler.pop(ebp).map_err(emit_error)?;
        self.assembler.ret().map_err(emit_error)
    }

    fn jcc(&mut self, cond: Cond, target: usize) -> AllocResult<()> {
        let label = self.label(target);
        let a = &mut self.assembler;
        let result = match cond {
            Cond::E => a.je(label),
            Cond::NE => a.jne(label),
            Cond::L => a.jl(label),
            Cond::G => a.jg(label),
            Cond::LE => a.jle(label),
            Cond::GE => a.jge(label),
        };
        result.map_err(emit_error)
    }

    /// Emit one allocated instruction.
    pub fn emit_inst(
        &mut self,
        func: &Function,
        frame: &FunctionFrame<'_>,
        id: InstId,
    ) -> AllocResult<()> {
        let inst = &func.insts[id];
        let ops = inst
            .opnds
            .iter()
            .map(|&o| Self::operand(func, frame, o))
            .collect::<AllocResult<Vec<Op>>>()?;

        match inst.mnemonic() {
            "j" => {
                let cond = inst.cond.ok_or_else(|| Self::unencodable(func, id))?;
                self.jcc(cond, inst.targets[0])
            }
            "jmp" if !inst.targets.is_empty() => {
                let label = self.label(inst.targets[0]);
                self.assembler.jmp(label).map_err(emit_error)
            }
            "ret" => self.emit_epilogue(frame),
            _ => match self.encode(inst.mnemonic(), inst.cond, inst.group().target, &ops) {
                Ok(result) => result.map_err(emit_error),
                Err(Shape) => Err(Self::unencodable(func, id)),
            },
        }
    }

    fn unencodable(func: &Function, id: InstId) -> AllocError {
        AllocError::Unencodable {
            inst: func.inst_to_string(id),
        }
    }

    /// Straight-line instructions; the flags operand stays implicit.
    fn encode(
        &mut self,
        mnemonic: &str,
        cond: Option<Cond>,
        target: Option<usize>,
        ops: &[Op],
    ) -> Result<Result<(), IcedError>, Shape> {
        let a = &mut self.assembler;
        Ok(match mnemonic {
            "mov" => alu!(a, mov, ops[0], ops[1]),
            "add" => alu!(a, add, ops[0], ops[1]),
            "sub" => alu!(a, sub, ops[0], ops[1]),
            "and" => alu!(a, and, ops[0], ops[1]),
            "or" => alu!(a, or, ops[0], ops[1]),
            "xor" => alu!(a, xor, ops[0], ops[1]),
            "cmp" => alu!(a, cmp, ops[1], ops[2]),
            "test" => match (ops[1], ops[2]) {
                (Op::R32(d), Op::R32(s)) => a.test(d, s),
                (Op::M(d), Op::R32(s)) => a.test(d, s),
                (Op::R32(d), Op::I(s)) => a.test(d, s),
                (Op::M(d), Op::I(s)) => a.test(d, s),
                (Op::R8(d), Op::R8(s)) => a.test(d, s),
                (Op::M(d), Op::R8(s)) => a.test(d, s),
                _ => return Err(Shape),
            },
            "imul" => match (ops[0], ops[1]) {
                (Op::R32(d), Op::R32(s)) => a.imul_2(d, s),
                (Op::R32(d), Op::M(s)) => a.imul_2(d, s),
                _ => return Err(Shape),
            },
            "shl" => match (ops[0], ops[1]) {
                (Op::R32(d), Op::R8(s)) => a.shl(d, s),
                (Op::M(d), Op::R8(s)) => a.shl(d, s),
                (Op::R32(d), Op::I(s)) => a.shl(d, s),
                (Op::M(d), Op::I(s)) => a.shl(d, s),
                _ => return Err(Shape),
            },
            "shr" => match (ops[0], ops[1]) {
                (Op::R32(d), Op::R8(s)) => a.shr(d, s),
                (Op::M(d), Op::R8(s)) => a.shr(d, s),
                (Op::R32(d), Op::I(s)) => a.shr(d, s),
                (Op::M(d), Op::I(s)) => a.shr(d, s),
                _ => return Err(Shape),
            },
            "sar" => match (ops[0], ops[1]) {
                (Op::R32(d), Op::R8(s)) => a.sar(d, s),
                (Op::M(d), Op::R8(s)) => a.sar(d, s),
                (Op::R32(d), Op::I(s)) => a.sar(d, s),
                (Op::M(d), Op::I(s)) => a.sar(d, s),
                _ => return Err(Shape),
            },
            "set" => match (cond, ops[1]) {
                (Some(Cond::E), Op::R8(d)) => a.sete(d),
                (Some(Cond::NE), Op::R8(d)) => a.setne(d),
                (Some(Cond::L), Op::R8(d)) => a.setl(d),
                (Some(Cond::G), Op::R8(d)) => a.setg(d),
                (Some(Cond::LE), Op::R8(d)) => a.setle(d),
                (Some(Cond::GE), Op::R8(d)) => a.setge(d),
                (Some(Cond::E), Op::M(d)) => a.sete(d),
                (Some(Cond::NE), Op::M(d)) => a.setne(d),
                (Some(Cond::L), Op::M(d)) => a.setl(d),
                (Some(Cond::G), Op::M(d)) => a.setg(d),
                (Some(Cond::LE), Op::M(d)) => a.setle(d),
                (Some(Cond::GE), Op::M(d)) => a.setge(d),
                _ => return Err(Shape),
            },
            "cmov" => match (cond, ops[1], ops[2]) {
                (Some(Cond::E), Op::R32(d), Op::R32(s)) => a.cmove(d, s),
                (Some(Cond::NE), Op::R32(d), Op::R32(s)) => a.cmovne(d, s),
                (Some(Cond::L), Op::R32(d), Op::R32(s)) => a.cmovl(d, s),
                (Some(Cond::G), Op::R32(d), Op::R32(s)) => a.cmovg(d, s),
                (Some(Cond::LE), Op::R32(d), Op::R32(s)) => a.cmovle(d, s),
                (Some(Cond::GE), Op::R32(d), Op::R32(s)) => a.cmovge(d, s),
                (Some(Cond::E), Op::R32(d), Op::M(s)) => a.cmove(d, s),
                (Some(Cond::NE), Op::R32(d), Op::M(s)) => a.cmovne(d, s),
                (Some(Cond::L), Op::R32(d), Op::M(s)) => a.cmovl(d, s),
                (Some(Cond::G), Op::R32(d), Op::M(s)) => a.cmovg(d, s),
                (Some(Cond::LE), Op::R32(d), Op::M(s)) => a.cmovle(d, s),
                (Some(Cond::GE), Op::R32(d), Op::M(s)) => a.cmovge(d, s),
                _ => return Err(Shape),
            },
            "jmp" => match ops.first() {
                Some(Op::R32(r)) => a.jmp(*r),
                Some(Op::M(m)) => a.jmp(*m),
                _ => return Err(Shape),
            },
            "call" => match ops.get(target.unwrap_or(0)) {
                Some(Op::R32(r)) => a.call(*r),
                Some(Op::M(m)) => a.call(*m),
                Some(Op::I(addr)) => a.call(*addr as u32 as u64),
                _ => return Err(Shape),
            },
            "push" => match ops[0] {
                Op::R32(r) => a.push(r),
                Op::M(m) => a.push(m),
                Op::I(v) => a.push(v),
                _ => return Err(Shape),
            },
            "movss" => match (ops[0], ops[1]) {
                (Op::X(d), Op::X(s)) => a.movss(d, s),
                (Op::X(d), Op::M(s)) => a.movss(d, s),
                (Op::M(d), Op::X(s)) => a.movss(d, s),
                _ => return Err(Shape),
            },
            "movsd" => match (ops[0], ops[1]) {
                (Op::X(d), Op::X(s)) => a.movsd_2(d, s),
                (Op::X(d), Op::M(s)) => a.movsd_2(d, s),
                (Op::M(d), Op::X(s)) => a.movsd_2(d, s),
                _ => return Err(Shape),
            },
            "addss" => sse!(a, addss, ops[0], ops[1]),
            "addsd" => sse!(a, addsd, ops[0], ops[1]),
            "subsd" => sse!(a, subsd, ops[0], ops[1]),
            "mulsd" => sse!(a, mulsd, ops[0], ops[1]),
            "cvtsi2sd" => match (ops[0], ops[1]) {
                (Op::X(d), Op::R32(s)) => a.cvtsi2sd(d, s),
                (Op::X(d), Op::M(s)) => a.cvtsi2sd(d, s),
                _ => return Err(Shape),
            },
            "cvttsd2si" => match (ops[0], ops[1]) {
                (Op::R32(d), Op::X(s)) => a.cvttsd2si(d, s),
                (Op::R32(d), Op::M(s)) => a.cvttsd2si(d, s),
                _ => return Err(Shape),
            },
            _ => return Err(Shape),
        })
    }

    /// Assemble everything emitted so far.
    pub fn finalize(mut self) -> AllocResult<Vec<u8>> {
        self.assembler.assemble(CODE_BASE).map_err(emit_error)
    }
}

/// Callee-saved registers the function writes.
fn written_callee_saved(func: &Function) -> Vec<RegName> {
    let callee_saved = Cdecl::callee_saved();
    let mut regs: Vec<RegName> = Vec::new();
    for block in &func.blocks {
        for &id in &block.insts {
            let inst = &func.insts[id];
            for (pos, &opnd) in inst.opnds.iter().enumerate() {
                let Some(reg) = func.operands[opnd].reg() else { continue };
                let full = RegName::gp32(reg.index);
                if reg.kind == RegKind::Gp
                    && inst.role(pos).is_def()
                    && callee_saved.contains(full)
                    && !regs.contains(&full)
                {
                    regs.push(full);
                }
            }
        }
    }
    regs.sort_by_key(|r| r.index);
    regs
}

/// Lower an allocated function to machine code.
pub fn emit_function(func: &Function, arena: &Bump) -> AllocResult<Vec<u8>> {
    let mut frame = FunctionFrame::new(arena);
    for reg in written_callee_saved(func) {
        frame.add_saved_register(reg);
    }
    for slot in &func.slots {
        frame.allocate_slot(slot.size.bytes());
    }
    frame.calculate_frame_size();
    log::debug!(
        "emitting {}: {} saved registers, {} byte frame",
        func.name,
        frame.saved_registers.len(),
        frame.frame_size
    );

    let mut encoder = Ia32Encoder::new()?;
    encoder.emit_prologue(&frame)?;
    for (b, block) in func.blocks.iter().enumerate() {
        encoder.place_label_for_block(b)?;
        for &inst in &block.insts {
            encoder.emit_inst(func, &frame, inst)?;
        }
    }
    // Falling off the last block returns.
    let ends_in_terminator = func
        .blocks
        .last()
        .and_then(|_| func.terminator(func.blocks.len() - 1))
        .is_some();
    if !ends_in_terminator {
        encoder.emit_epilogue(&frame)?;
    }
    encoder.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_ir::parse_function;
    use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic};

    fn decode(code: &[u8]) -> Vec<Instruction> {
        let mut decoder = Decoder::with_ip(32, code, CODE_BASE, DecoderOptions::NONE);
        let mut out = Vec::new();
        while decoder.can_decode() {
            out.push(decoder.decode());
        }
        out
    }

    #[test]
    fn test_emit_allocated_function() {
        let func = parse_function(
            r#"
            func e {
            entry:
                mov eax, $1
                mov [s0:i32], eax
                mov ebx, [s0:i32]
                add ebx, $2
                cmp flags, ebx, $3
                j.e flags, ^done
            body:
                push ebx
                call $0x2000
            done:
                ret
            }
            "#,
        )
        .unwrap();
        let arena = Bump::new();
        let code = emit_function(&func, &arena).unwrap();
        let mnemonics: Vec<Mnemonic> = decode(&code).iter().map(|i| i.mnemonic()).collect();

        // push ebp; mov ebp, esp; push ebx; sub esp, 4
        assert_eq!(
            &mnemonics[..4],
            &[Mnemonic::Push, Mnemonic::Mov, Mnemonic::Push, Mnemonic::Sub]
        );
        assert!(mnemonics.contains(&Mnemonic::Je));
        assert!(mnemonics.contains(&Mnemonic::Call));
        assert_eq!(mnemonics.last(), Some(&Mnemonic::Ret));
        assert_eq!(mnemonics.iter().filter(|&&m| m == Mnemonic::Pop).count(), 2);
    }

    #[test]
    fn test_emit_sse_and_bytes() {
        let func = parse_function(
            r#"
            func f {
            entry:
                movsd xmm0, [s0:f64]
                mulsd xmm0, xmm0
                cvttsd2si ecx, xmm0
                cmp flags, ecx, $0
                set.g flags, dl
                mov [s1:i8], dl
                ret
            }
            "#,
        )
        .unwrap();
        let arena = Bump::new();
        let code = emit_function(&func, &arena).unwrap();
        let mnemonics: Vec<Mnemonic> = decode(&code).iter().map(|i| i.mnemonic()).collect();
        assert!(mnemonics.contains(&Mnemonic::Movsd));
        assert!(mnemonics.contains(&Mnemonic::Mulsd));
        assert!(mnemonics.contains(&Mnemonic::Cvttsd2si));
        assert!(mnemonics.contains(&Mnemonic::Setg));
    }

    #[test]
    fn test_virtual_operand_is_rejected() {
        let func = parse_function("func v {\nentry:\n  push %a:i32\n  ret\n}\n").unwrap();
        let arena = Bump::new();
        assert!(matches!(
            emit_function(&func, &arena),
            Err(AllocError::UnplacedOperand { .. })
        ));
    }
}
