// This module implements the IA-32 cdecl calling convention as far as register allocation
// and code emission need it. A call clobbers EAX, ECX and EDX, every XMM register and the
// flags; EBX, ESI, EDI and EBP are preserved by the callee and results come back in EAX.
// The allocator reads the caller-saved set through the opcode table (every `call` group
// records it as its clobber mask) and keeps values that live across a call in callee-saved
// registers or in memory. FunctionFrame lays out the emitted stack frame: callee-saved
// registers the allocated function writes are pushed after the frame pointer, and stack
// slots are packed below them at negative EBP offsets with natural alignment.

//! IA-32 cdecl calling convention.

use crate::core::register_file::{RegKind, RegMasks, RegName, EAX, EBP, EBX, ECX, EDI, EDX, ESI};
use bumpalo::{collections::Vec as BumpVec, Bump};

/// Information about a calling convention.
#[derive(Debug, Clone)]
pub struct CCInfo {
    /// Registers that must be preserved by callee.
    pub callee_saved_regs: RegMasks,
    /// Registers a call may overwrite.
    pub caller_saved_regs: RegMasks,
    /// Where integer results are returned.
    pub ret_reg: RegName,
}

/// The cdecl convention.
pub struct Cdecl;

impl Cdecl {
    pub fn info() -> CCInfo {
        CCInfo {
            callee_saved_regs: Self::callee_saved(),
            caller_saved_regs: Self::caller_saved(),
            ret_reg: RegName::gp32(EAX),
        }
    }

    pub fn caller_saved() -> RegMasks {
        let mut regs = RegMasks::new();
        for id in [EAX, ECX, EDX] {
            regs.set(RegName::gp32(id));
        }
        regs.set_mask(RegKind::Xmm, RegKind::Xmm.full_mask());
        regs.set(RegName::FLAGS);
        regs
    }

    pub fn callee_saved() -> RegMasks {
        let mut regs = RegMasks::new();
        for id in [EBX, ESI, EDI, EBP] {
            regs.set(RegName::gp32(id));
        }
        regs
    }
}

/// Stack frame of an emitted function.
///
/// Layout below the return address: saved EBP at `[ebp]`, then the saved
/// callee-saved registers, then stack slots.
#[derive(Debug)]
pub struct FunctionFrame<'a> {
    /// Callee-saved registers that need to be preserved, in push order.
    pub saved_registers: BumpVec<'a, RegName>,
    /// EBP-relative offset of each stack slot.
    pub slot_offsets: BumpVec<'a, i32>,
    /// Bytes reserved below the saved registers.
    pub frame_size: u32,
    offset: i32,
}

impl<'a> FunctionFrame<'a> {
    pub fn new(arena: &'a Bump) -> Self {
        Self {
            saved_registers: BumpVec::new_in(arena),
            slot_offsets: BumpVec::new_in(arena),
            frame_size: 0,
            offset: 0,
        }
    }

    /// Add a callee-saved register that needs preservation.
    pub fn add_saved_register(&mut self, reg: RegName) {
        let reg = RegName::gp32(reg.index);
        if reg.index != EBP && !self.saved_registers.contains(&reg) {
            debug_assert!(self.slot_offsets.is_empty());
            self.saved_registers.push(reg);
            self.offset -= 4;
        }
    }

    /// Allocate the next stack slot and return its offset.
    pub fn allocate_slot(&mut self, size: u32) -> i32 {
        let align = size.clamp(1, 8) as i32;
        self.offset -= size as i32;
        self.offset &= !(align - 1);
        self.slot_offsets.push(self.offset);
        self.offset
    }

    /// Final frame size, rounded to keep ESP 4-byte aligned.
    pub fn calculate_frame_size(&mut self) {
        let saved = self.saved_registers.len() as i32 * 4;
        let locals = (-self.offset - saved).max(0) as u32;
        self.frame_size = locals.div_ceil(4) * 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constraint::OpndSize;

    #[test]
    fn test_caller_and_callee_saved_are_disjoint() {
        let info = Cdecl::info();
        let mut both = info.caller_saved_regs;
        both.intersect(&info.callee_saved_regs);
        assert!(both.is_empty());
        assert!(info.caller_saved_regs.contains(RegName::FLAGS));
        assert!(info.caller_saved_regs.contains(RegName::xmm(5)));
        assert!(info.callee_saved_regs.contains(RegName::gp32(ESI)));
        assert_eq!(info.ret_reg.to_string(), "eax");
    }

    #[test]
    fn test_frame_layout() {
        let arena = Bump::new();
        let mut frame = FunctionFrame::new(&arena);
        frame.add_saved_register(RegName::gp32(EBX));
        frame.add_saved_register(RegName::new(RegKind::Gp, OpndSize::S8, EBX));
        frame.add_saved_register(RegName::gp32(EBP));
        assert_eq!(frame.saved_registers.len(), 1);

        assert_eq!(frame.allocate_slot(4), -8);
        assert_eq!(frame.allocate_slot(1), -9);
        assert_eq!(frame.allocate_slot(8), -24);
        frame.calculate_frame_size();
        assert_eq!(frame.frame_size, 20);
    }
}
