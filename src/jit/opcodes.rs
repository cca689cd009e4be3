//! Emitters for moves, branches, loops, switches, returns and the
//! miscellaneous value opcodes. Arithmetic lives in `arith`, property
//! access in `access`, calls in `calls`.

use crate::error::CompileError;
use crate::vm::bytecode::frame;
use crate::vm::heap::{kind, layout as cell};
use crate::vm::value::tags;
use crate::vm::vm::ctx_off;

use super::compiler::{JitCompiler, SlowCases, StubArg, regs};
use super::stubs::StubId;
use super::x86_64::{Cond, Reg};

impl JitCompiler<'_> {
    // ==================== shared pieces ====================

    /// Branch to the slow case unless `reg` holds a tagged integer.
    pub(crate) fn emit_guard_int(&mut self, reg: Reg) {
        self.asm().test_ri32(reg, 1);
        let j = self.emit_branch(Cond::E);
        self.add_slow_case(j);
    }

    /// Branch to the slow case unless both registers hold tagged integers.
    /// A single AND-test covers both, so this is one guard record.
    pub(crate) fn emit_guard_ints(&mut self, a: Reg, b: Reg, scratch: Reg) {
        self.asm().mov_rr(scratch, a);
        self.asm().and_rr(scratch, b);
        self.asm().test_ri32(scratch, 1);
        let j = self.emit_branch(Cond::E);
        self.add_slow_case(j);
    }

    /// Branch to the slow case unless `reg` holds a cell pointer.
    pub(crate) fn emit_guard_cell(&mut self, reg: Reg) {
        self.asm().test_ri32(reg, 7);
        let j = self.emit_branch(Cond::Ne);
        self.add_slow_case(j);
    }

    /// Materialize the current flags as a boolean value in rax.
    pub(crate) fn emit_tag_bool(&mut self, cond: Cond) {
        let mut asm = self.asm();
        asm.setcc(cond, regs::T0);
        asm.movzx_r64_r8(regs::T0, regs::T0);
        asm.shl_ri(regs::T0, 3);
        asm.or_ri32(regs::T0, tags::FALSE as i32);
    }

    /// Fully runtime-delegated binary opcode: `dst = stub(a, b)`.
    pub(crate) fn emit_binary_stub_op(&mut self, stub: StubId) -> Result<(), CompileError> {
        let dst = self.operand(1);
        let (a, b) = (self.operand(2), self.operand(3));
        self.emit_stub_call(stub, &[StubArg::Vreg(a), StubArg::Vreg(b)])?;
        self.emit_exception_check();
        self.emit_put_vreg(dst)
    }

    /// A comparison operand usable as a tagged imm32, if constant.
    pub(crate) fn const_tagged_int(&self, operand: u32) -> Option<i32> {
        let c = self.constant_int(operand)?;
        let tagged = c.checked_mul(2)?.checked_add(1)?;
        i32::try_from(tagged).ok()
    }

    // ==================== moves ====================

    pub(crate) fn emit_enter(&mut self) -> Result<(), CompileError> {
        // Zap locals so stale frame contents never masquerade as values.
        for i in self.unit.arity..self.unit.num_vars {
            self.asm()
                .mov_mi32(regs::FRAME, i as i32 * 8, tags::UNDEFINED as i32);
        }
        Ok(())
    }

    pub(crate) fn emit_mov(&mut self) -> Result<(), CompileError> {
        let (dst, src) = (self.operand(1), self.operand(2));
        if dst as usize >= self.unit.num_regs {
            return Err(self.err("store to non-register operand"));
        }
        if self.is_constant(src) {
            let v = self
                .unit
                .constant(src)
                .ok_or_else(|| self.err("constant operand out of range"))?;
            let bits = v.0 as i64;
            if (i32::MIN as i64..=i32::MAX as i64).contains(&bits) {
                self.asm()
                    .mov_mi32(regs::FRAME, Self::frame_disp(dst), bits as i32);
            } else {
                self.mov_value(regs::SCRATCH2, v.0);
                self.asm()
                    .mov_mr(regs::FRAME, Self::frame_disp(dst), regs::SCRATCH2);
            }
            if self.cached_result() == Some(dst) {
                self.kill_cached_result();
            }
        } else if self.cached_result() == Some(src) || self.cached_result() == Some(dst) {
            self.emit_get_vreg(src, regs::T0)?;
            self.emit_put_vreg(dst)?;
        } else {
            // Copy through scratch; rax keeps whatever mapping it had.
            self.asm()
                .mov_rm(regs::SCRATCH2, regs::FRAME, Self::frame_disp(src));
            self.asm()
                .mov_mr(regs::FRAME, Self::frame_disp(dst), regs::SCRATCH2);
        }
        Ok(())
    }

    // ==================== equality / logic ====================

    pub(crate) fn emit_eq(&mut self) -> Result<(), CompileError> {
        self.emit_int_compare_value(Cond::E)
    }

    pub(crate) fn emit_neq(&mut self) -> Result<(), CompileError> {
        self.emit_int_compare_value(Cond::Ne)
    }

    pub(crate) fn emit_strict_eq(&mut self) -> Result<(), CompileError> {
        self.emit_int_compare_value(Cond::E)
    }

    pub(crate) fn emit_nstrict_eq(&mut self) -> Result<(), CompileError> {
        self.emit_int_compare_value(Cond::Ne)
    }

    fn emit_int_compare_value(&mut self, cond: Cond) -> Result<(), CompileError> {
        let dst = self.operand(1);
        self.emit_get_vreg(self.operand(2), regs::T0)?;
        self.emit_get_vreg(self.operand(3), regs::T1)?;
        self.emit_guard_ints(regs::T0, regs::T1, regs::T2);
        self.asm().cmp_rr(regs::T0, regs::T1);
        self.emit_tag_bool(cond);
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_slow_eq(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        self.emit_slow_compare_value(iter, StubId::Eq)
    }

    pub(crate) fn emit_slow_neq(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        self.emit_slow_compare_value(iter, StubId::Neq)
    }

    pub(crate) fn emit_slow_strict_eq(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        self.emit_slow_compare_value(iter, StubId::StrictEq)
    }

    pub(crate) fn emit_slow_nstrict_eq(
        &mut self,
        iter: &mut SlowCases,
    ) -> Result<(), CompileError> {
        self.emit_slow_compare_value(iter, StubId::NStrictEq)
    }

    fn emit_slow_compare_value(
        &mut self,
        iter: &mut SlowCases,
        stub: StubId,
    ) -> Result<(), CompileError> {
        let dst = self.operand(1);
        let (a, b) = (self.operand(2), self.operand(3));
        self.link_slow_case(iter);
        self.emit_stub_call(stub, &[StubArg::Vreg(a), StubArg::Vreg(b)])?;
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_less(&mut self) -> Result<(), CompileError> {
        self.emit_binary_stub_op(StubId::Less)
    }

    pub(crate) fn emit_less_eq(&mut self) -> Result<(), CompileError> {
        self.emit_binary_stub_op(StubId::LessEq)
    }

    pub(crate) fn emit_div(&mut self) -> Result<(), CompileError> {
        self.emit_binary_stub_op(StubId::Div)
    }

    pub(crate) fn emit_not(&mut self) -> Result<(), CompileError> {
        let (dst, src) = (self.operand(1), self.operand(2));
        self.emit_get_vreg(src, regs::T0)?;
        self.asm().mov_rr(regs::SCRATCH2, regs::T0);
        self.asm()
            .and_ri32(regs::SCRATCH2, tags::BOOL_MASK as i32);
        self.asm().cmp_ri32(regs::SCRATCH2, tags::FALSE as i32);
        let j = self.emit_branch(Cond::Ne);
        self.add_slow_case(j);
        self.asm().xor_ri32(regs::T0, tags::BOOL_PAYLOAD as i32);
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_slow_not(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        let (dst, src) = (self.operand(1), self.operand(2));
        self.link_slow_case(iter);
        self.emit_stub_call(StubId::Truthy, &[StubArg::Vreg(src)])?;
        self.asm().xor_ri32(regs::T0, tags::BOOL_PAYLOAD as i32);
        self.emit_put_vreg(dst)
    }

    // ==================== branches ====================

    pub(crate) fn emit_jmp_op(&mut self) -> Result<(), CompileError> {
        let target = self.jump_target(1);
        let j = self.emit_jump();
        self.add_jump(j, target);
        Ok(())
    }

    /// Shared fast path for `JTrue` / `LoopIfTrue`: integers and booleans
    /// branch inline, anything else is a slow case.
    pub(crate) fn emit_jtrue(&mut self) -> Result<(), CompileError> {
        let target = self.jump_target(2);
        self.emit_get_vreg(self.operand(1), regs::T0)?;

        self.asm().cmp_ri32(regs::T0, 1); // integer zero
        let is_zero = self.emit_branch(Cond::E);
        self.asm().test_ri32(regs::T0, 1);
        let j = self.emit_branch(Cond::Ne); // any other integer
        self.add_jump(j, target);

        self.asm().cmp_ri32(regs::T0, tags::TRUE as i32);
        let j = self.emit_branch(Cond::E);
        self.add_jump(j, target);
        self.asm().cmp_ri32(regs::T0, tags::FALSE as i32);
        let j = self.emit_branch(Cond::Ne);
        self.add_slow_case(j);

        self.link_here(is_zero);
        Ok(())
    }

    pub(crate) fn emit_slow_jtrue(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        let target = self.jump_target(2);
        self.link_slow_case(iter);
        self.emit_stub_call(StubId::Truthy, &[StubArg::Vreg(self.operand(1))])?;
        self.asm().test_ri32(regs::T0, tags::BOOL_PAYLOAD as i32);
        let j = self.emit_branch(Cond::Ne);
        self.add_jump(j, target);
        Ok(())
    }

    pub(crate) fn emit_jfalse(&mut self) -> Result<(), CompileError> {
        let target = self.jump_target(2);
        self.emit_get_vreg(self.operand(1), regs::T0)?;

        self.asm().cmp_ri32(regs::T0, 1);
        let j = self.emit_branch(Cond::E); // integer zero jumps
        self.add_jump(j, target);
        self.asm().test_ri32(regs::T0, 1);
        let is_nonzero_int = self.emit_branch(Cond::Ne);

        self.asm().cmp_ri32(regs::T0, tags::FALSE as i32);
        let j = self.emit_branch(Cond::E);
        self.add_jump(j, target);
        self.asm().cmp_ri32(regs::T0, tags::TRUE as i32);
        let j = self.emit_branch(Cond::Ne);
        self.add_slow_case(j);

        self.link_here(is_nonzero_int);
        Ok(())
    }

    pub(crate) fn emit_slow_jfalse(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        let target = self.jump_target(2);
        self.link_slow_case(iter);
        self.emit_stub_call(StubId::Truthy, &[StubArg::Vreg(self.operand(1))])?;
        self.asm().test_ri32(regs::T0, tags::BOOL_PAYLOAD as i32);
        let j = self.emit_branch(Cond::E); // inverted
        self.add_jump(j, target);
        Ok(())
    }

    /// Compare-and-branch body shared by `JNless` and the counted loops:
    /// with a constant rhs only the lhs tag is checked.
    fn emit_compare_branch(&mut self, taken: Cond) -> Result<(), CompileError> {
        let (a, b) = (self.operand(1), self.operand(2));
        let target = self.jump_target(3);
        if let Some(imm) = self.const_tagged_int(b) {
            self.emit_get_vreg(a, regs::T0)?;
            self.emit_guard_int(regs::T0);
            self.asm().cmp_ri32(regs::T0, imm);
            let j = self.emit_branch(taken);
            self.add_jump(j, target);
        } else {
            self.emit_get_vreg(a, regs::T0)?;
            self.emit_get_vreg(b, regs::T1)?;
            self.emit_guard_int(regs::T0);
            self.emit_guard_int(regs::T1);
            self.asm().cmp_rr(regs::T0, regs::T1);
            let j = self.emit_branch(taken);
            self.add_jump(j, target);
        }
        Ok(())
    }

    /// The matching slow path: one guard to relink for the constant shape,
    /// two for the dynamic shape, then a generic compare and branch on the
    /// boolean payload.
    fn emit_slow_compare_branch(
        &mut self,
        iter: &mut SlowCases,
        jump_if_true: bool,
        stub: StubId,
    ) -> Result<(), CompileError> {
        let b = self.operand(2);
        let target = self.jump_target(3);
        self.link_slow_case(iter);
        if self.const_tagged_int(b).is_none() {
            self.link_slow_case(iter);
        }
        self.emit_stub_call(stub, &[StubArg::Vreg(self.operand(1)), StubArg::Vreg(b)])?;
        self.emit_exception_check();
        self.asm().test_ri32(regs::T0, tags::BOOL_PAYLOAD as i32);
        let j = self.emit_branch(if jump_if_true { Cond::Ne } else { Cond::E });
        self.add_jump(j, target);
        Ok(())
    }

    pub(crate) fn emit_jnless(&mut self) -> Result<(), CompileError> {
        self.emit_compare_branch(Cond::Ge)
    }

    pub(crate) fn emit_slow_jnless(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        self.emit_slow_compare_branch(iter, false, StubId::Less)
    }

    // ==================== loop-back edges ====================

    pub(crate) fn emit_loop(&mut self) -> Result<(), CompileError> {
        self.emit_preempt_check()?;
        let target = self.jump_target(1);
        let j = self.emit_jump();
        self.add_jump(j, target);
        Ok(())
    }

    pub(crate) fn emit_loop_if_true(&mut self) -> Result<(), CompileError> {
        self.emit_preempt_check()?;
        self.emit_jtrue()
    }

    pub(crate) fn emit_loop_if_less(&mut self) -> Result<(), CompileError> {
        self.emit_preempt_check()?;
        self.emit_compare_branch(Cond::L)
    }

    pub(crate) fn emit_slow_loop_if_less(
        &mut self,
        iter: &mut SlowCases,
    ) -> Result<(), CompileError> {
        self.emit_slow_compare_branch(iter, true, StubId::Less)
    }

    pub(crate) fn emit_loop_if_less_eq(&mut self) -> Result<(), CompileError> {
        self.emit_preempt_check()?;
        self.emit_compare_branch(Cond::Le)
    }

    pub(crate) fn emit_slow_loop_if_less_eq(
        &mut self,
        iter: &mut SlowCases,
    ) -> Result<(), CompileError> {
        self.emit_slow_compare_branch(iter, true, StubId::LessEq)
    }

    // ==================== switch / returns ====================

    pub(crate) fn emit_switch_imm(&mut self) -> Result<(), CompileError> {
        let table_index = self.operand(1) as usize;
        let scrutinee = self.operand(3);
        self.record_switch(table_index);
        self.emit_stub_call(
            StubId::SwitchImm,
            &[StubArg::Vreg(scrutinee), StubArg::Imm(table_index as i64)],
        )?;
        self.asm().jmp_r(regs::T0);
        Ok(())
    }

    pub(crate) fn emit_ret(&mut self) -> Result<(), CompileError> {
        self.emit_get_vreg(self.operand(1), regs::T0)?;
        let mut asm = self.asm();
        asm.mov_rm(regs::SCRATCH2, regs::FRAME, frame::RETURN_PC * 8);
        asm.mov_rm(regs::FRAME, regs::FRAME, frame::CALLER_FRAME * 8);
        asm.jmp_r(regs::SCRATCH2);
        self.kill_cached_result();
        Ok(())
    }

    pub(crate) fn emit_end(&mut self) -> Result<(), CompileError> {
        // Program-level exit; same return sequence, the host entry thunk is
        // the caller.
        self.emit_ret()
    }

    // ==================== scopes / globals-adjacent ====================

    pub(crate) fn emit_get_scoped(&mut self) -> Result<(), CompileError> {
        let dst = self.operand(1);
        let (skip, slot) = (self.operand(2), self.operand(3));
        if skip > 0xFF || slot > 0xFFFF {
            return Err(self.err("scoped-variable operand out of range"));
        }
        self.asm()
            .mov_rm(regs::T0, regs::FRAME, frame::SCOPE_CHAIN * 8);
        for _ in 0..skip {
            self.asm().mov_rm(regs::T0, regs::T0, cell::W1);
        }
        self.asm().mov_rm(regs::T0, regs::T0, cell::W0);
        self.asm().mov_rm(regs::T0, regs::T0, slot as i32 * 8);
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_put_scoped(&mut self) -> Result<(), CompileError> {
        let (skip, slot) = (self.operand(1), self.operand(2));
        let src = self.operand(3);
        if skip > 0xFF || slot > 0xFFFF {
            return Err(self.err("scoped-variable operand out of range"));
        }
        self.emit_get_vreg(src, regs::T1)?;
        self.asm()
            .mov_rm(regs::T0, regs::FRAME, frame::SCOPE_CHAIN * 8);
        for _ in 0..skip {
            self.asm().mov_rm(regs::T0, regs::T0, cell::W1);
        }
        self.asm().mov_rm(regs::T0, regs::T0, cell::W0);
        self.asm().mov_mr(regs::T0, slot as i32 * 8, regs::T1);
        self.kill_cached_result();
        Ok(())
    }

    pub(crate) fn emit_resolve(&mut self) -> Result<(), CompileError> {
        let (dst, sym) = (self.operand(1), self.operand(2));
        self.emit_stub_call(StubId::Resolve, &[StubArg::Imm(sym as i64)])?;
        self.emit_exception_check();
        self.emit_put_vreg(dst)
    }

    // ==================== allocation / type queries ====================

    pub(crate) fn emit_new_object(&mut self) -> Result<(), CompileError> {
        let dst = self.operand(1);
        self.emit_stub_call(StubId::NewObject, &[])?;
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_new_array(&mut self) -> Result<(), CompileError> {
        let (dst, len) = (self.operand(1), self.operand(2));
        self.emit_stub_call(StubId::NewArray, &[StubArg::Vreg(len)])?;
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_type_of(&mut self) -> Result<(), CompileError> {
        let (dst, src) = (self.operand(1), self.operand(2));
        self.emit_stub_call(StubId::TypeOf, &[StubArg::Vreg(src)])?;
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_to_number(&mut self) -> Result<(), CompileError> {
        let (dst, src) = (self.operand(1), self.operand(2));
        self.emit_get_vreg(src, regs::T0)?;
        self.asm().test_ri32(regs::T0, 1);
        let is_int = self.emit_branch(Cond::Ne);
        self.emit_guard_cell(regs::T0);
        self.asm().mov_rm32(regs::SCRATCH2, regs::T0, cell::KIND);
        self.asm().cmp_ri32(regs::SCRATCH2, kind::NUMBER as i32);
        let j = self.emit_branch(Cond::Ne);
        self.add_slow_case(j);
        self.link_here(is_int);
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_slow_to_number(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        let (dst, src) = (self.operand(1), self.operand(2));
        self.link_slow_case(iter);
        self.link_slow_case(iter);
        self.emit_stub_call(StubId::ToNumber, &[StubArg::Vreg(src)])?;
        self.emit_exception_check();
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_instance_of(&mut self) -> Result<(), CompileError> {
        let dst = self.operand(1);
        let (value, base, proto) = (self.operand(2), self.operand(3), self.operand(4));
        self.emit_get_vreg(value, regs::T0)?;
        self.emit_get_vreg(base, regs::T2)?;
        self.emit_get_vreg(proto, regs::T1)?;

        // All three must be cells, and value and base must be objects.
        self.asm().mov_rr(regs::SCRATCH2, regs::T0);
        self.asm().or_rr(regs::SCRATCH2, regs::T2);
        self.asm().or_rr(regs::SCRATCH2, regs::T1);
        self.asm().test_ri32(regs::SCRATCH2, 7);
        let j = self.emit_branch(Cond::Ne);
        self.add_slow_case(j);
        self.asm().mov_rm32(regs::SCRATCH2, regs::T0, cell::KIND);
        self.asm().cmp_ri32(regs::SCRATCH2, kind::OBJECT as i32);
        let j = self.emit_branch(Cond::Ne);
        self.add_slow_case(j);
        self.asm().mov_rm32(regs::SCRATCH2, regs::T2, cell::KIND);
        self.asm().cmp_ri32(regs::SCRATCH2, kind::OBJECT as i32);
        let j = self.emit_branch(Cond::Ne);
        self.add_slow_case(j);

        // Walk the prototype chain; the end of the chain or any link that
        // is not an object cell is a miss.
        self.asm().mov_rm(regs::SCRATCH2, regs::T0, cell::W2);
        let loop_start = self.buf.len();
        self.asm().cmp_rr(regs::SCRATCH2, regs::T1);
        let found = self.emit_branch(Cond::E);
        self.asm().test_ri32(regs::SCRATCH2, 7);
        let miss_non_cell = self.emit_branch(Cond::Ne);
        self.asm().test_rr(regs::SCRATCH2, regs::SCRATCH2);
        let miss_empty = self.emit_branch(Cond::E);
        self.asm().mov_rm32(regs::SCRATCH, regs::SCRATCH2, cell::KIND);
        self.asm().cmp_ri32(regs::SCRATCH, kind::OBJECT as i32);
        let miss_kind = self.emit_branch(Cond::Ne);
        self.asm().mov_rm(regs::SCRATCH2, regs::SCRATCH2, cell::W2);
        let back = self.emit_jump();
        self.link_to(back, loop_start);

        self.link_here(miss_non_cell);
        self.link_here(miss_empty);
        self.link_here(miss_kind);
        self.asm().mov_ri32(regs::T0, tags::FALSE as i32);
        let done = self.emit_jump();
        self.link_here(found);
        self.asm().mov_ri32(regs::T0, tags::TRUE as i32);
        self.link_here(done);
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_slow_instance_of(
        &mut self,
        iter: &mut SlowCases,
    ) -> Result<(), CompileError> {
        let dst = self.operand(1);
        let (value, base, proto) = (self.operand(2), self.operand(3), self.operand(4));
        self.link_slow_case(iter);
        self.link_slow_case(iter);
        self.link_slow_case(iter);
        self.emit_stub_call(
            StubId::InstanceOf,
            &[
                StubArg::Vreg(value),
                StubArg::Vreg(base),
                StubArg::Vreg(proto),
            ],
        )?;
        self.emit_exception_check();
        self.emit_put_vreg(dst)
    }

    // ==================== exceptions ====================

    pub(crate) fn emit_throw(&mut self) -> Result<(), CompileError> {
        let src = self.operand(1);
        self.emit_stub_call(StubId::Throw, &[StubArg::Vreg(src)])?;
        // The exception is unconditionally pending now; the check routes
        // straight to the unwind tail.
        self.emit_exception_check();
        Ok(())
    }

    pub(crate) fn emit_catch(&mut self) -> Result<(), CompileError> {
        let dst = self.operand(1);
        // Entered from the unwind machinery; re-establish the frame from
        // the context before touching anything else.
        self.asm().mov_rm(regs::FRAME, regs::CTX, ctx_off::FRAME);
        self.kill_cached_result();
        self.emit_stub_call(StubId::Catch, &[])?;
        self.emit_put_vreg(dst)
    }
}
