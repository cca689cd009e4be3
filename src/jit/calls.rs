//! Call compilation.
//!
//! The hot path builds the outgoing frame header, guards the callee value
//! against the call cache slot, and calls straight through the slot's hot
//! target (the callee entry once linked). Guard failures enter the frame
//! themselves and call through the slot's slow target, which walks the
//! pre-link -> lazy-link -> generic trampoline progression.

use crate::error::CompileError;
use crate::vm::bytecode::{FRAME_HEADER_WORDS, frame};
use crate::vm::heap::layout as cell;

use super::compiler::{AnchorKind, JitCompiler, SlowCases, regs};
use super::ic::layout as ic;
use super::x86_64::Cond;

impl JitCompiler<'_> {
    fn call_operands(&self) -> Result<(u32, u32, u32, u32), CompileError> {
        let dst = self.operand(1);
        let func = self.operand(2);
        let argc = self.operand(3);
        let shift = self.operand(4);
        if (shift as usize) < FRAME_HEADER_WORDS
            || shift as usize + argc as usize > self.unit.num_regs
        {
            return Err(self.err("call frame overlaps its caller"));
        }
        Ok((dst, func, argc, shift))
    }

    pub(crate) fn emit_call(&mut self) -> Result<(), CompileError> {
        let (dst, func, argc, shift) = self.call_operands()?;
        self.emit_get_vreg(func, regs::T0)?;
        let site = self.new_call_site();

        // Outgoing frame header. The scope slot is written after the guard
        // because it is loaded out of the (then known) callee cell; the
        // slow path reconstructs the rest.
        let mut asm = self.asm();
        asm.lea(regs::SCRATCH2, regs::FRAME, shift as i32 * 8);
        asm.mov_mr(regs::SCRATCH2, frame::CALLER_FRAME * 8, regs::FRAME);
        asm.mov_mr(regs::SCRATCH2, frame::CALLEE * 8, regs::T0);
        asm.mov_mi32(regs::SCRATCH2, frame::ARG_COUNT * 8, argc as i32);

        self.emit_ic_anchor(AnchorKind::Call(site));
        self.asm()
            .cmp_rm(regs::T0, regs::SCRATCH, ic::CALL_CALLEE);
        let j = self.emit_branch(Cond::Ne);
        self.add_slow_case(j);

        let mut asm = self.asm();
        asm.mov_rm(regs::T1, regs::T0, cell::W2);
        asm.mov_mr(regs::SCRATCH2, frame::SCOPE_CHAIN * 8, regs::T1);
        asm.mov_rr(regs::FRAME, regs::SCRATCH2);
        asm.call_m(regs::SCRATCH, ic::CALL_HOT);
        self.note_call_return();
        // The callee's return sequence restored our frame pointer.
        self.kill_cached_result();
        self.emit_exception_check();
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_slow_call(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        let (dst, _func, _argc, shift) = self.call_operands()?;
        let site = self.next_call_site();
        self.link_slow_case(iter);
        // The guard left the frame un-entered; do that, then let the
        // linking trampolines take it from here.
        self.asm().lea(regs::FRAME, regs::FRAME, shift as i32 * 8);
        self.emit_ic_anchor(AnchorKind::Call(site));
        self.asm().call_m(regs::SCRATCH, ic::CALL_SLOW);
        self.note_call_return();
        self.kill_cached_result();
        self.emit_exception_check();
        self.emit_put_vreg(dst)
    }
}
