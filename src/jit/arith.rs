//! Arithmetic fast/slow specialization.
//!
//! Binary add/sub/mul pick among three shapes at compile time: a
//! constant-folded operand (the constant side needs no tag check), both
//! operands dynamic (tag-checked, overflow-checked native op), or full
//! fallback when the static type hints rule the numeric fast path out.
//! Overflow always routes to the slow case, which lands on the shared
//! numeric semantics and promotes to a heap number; results never wrap.
//!
//! Tagged-integer identities used throughout, with `T(n) = 2n + 1`:
//!
//! - `T(a) + 2c        = T(a + c)`
//! - `T(a) - T(b) + 1  = T(a - b)`
//! - `T(a) ^ 2c        = T(a ^ c)`
//! - `T(a) & T(b)      = T(a & b)`, same for `|`

use crate::error::CompileError;
use crate::vm::bytecode::{TypeHint, unpack_hints};
use crate::vm::value::Value;

use super::compiler::{JitCompiler, SlowCases, StubArg, regs};
use super::stubs::StubId;
use super::x86_64::Cond;

/// Tagged bits for integer one, used by the inc/dec slow paths.
const ONE: i64 = 0b11;

impl JitCompiler<'_> {
    fn hints_rule_out_fast_path(&self) -> bool {
        let (a, b) = unpack_hints(self.operand(4));
        a == TypeHint::NotNumber || b == TypeHint::NotNumber
    }

    /// `2c` as an imm32, when the operand is a constant integer small
    /// enough to fold into the instruction.
    fn const_delta(&self, operand: u32) -> Option<i32> {
        let c = self.constant_int(operand)?;
        i32::try_from(c.checked_mul(2)?).ok()
    }

    fn const_i32(&self, operand: u32) -> Option<i32> {
        i32::try_from(self.constant_int(operand)?).ok()
    }

    /// Relink one group of arithmetic guards and call the shared numeric
    /// semantics.
    fn emit_slow_binary(
        &mut self,
        iter: &mut SlowCases,
        guards: usize,
        stub: StubId,
    ) -> Result<(), CompileError> {
        let dst = self.operand(1);
        let (a, b) = (self.operand(2), self.operand(3));
        for _ in 0..guards {
            self.link_slow_case(iter);
        }
        self.emit_stub_call(stub, &[StubArg::Vreg(a), StubArg::Vreg(b)])?;
        self.emit_exception_check();
        self.emit_put_vreg(dst)
    }

    // ==================== add / sub ====================

    pub(crate) fn emit_add(&mut self) -> Result<(), CompileError> {
        if self.hints_rule_out_fast_path() {
            return self.emit_binary_stub_op(StubId::Add);
        }
        let dst = self.operand(1);
        let (a, b) = (self.operand(2), self.operand(3));
        if let Some(delta) = self.const_delta(b) {
            self.emit_get_vreg(a, regs::T0)?;
            self.emit_guard_int(regs::T0);
            self.asm().add_ri32(regs::T0, delta);
        } else if let Some(delta) = self.const_delta(a) {
            self.emit_get_vreg(b, regs::T0)?;
            self.emit_guard_int(regs::T0);
            self.asm().add_ri32(regs::T0, delta);
        } else {
            self.emit_get_vreg(a, regs::T0)?;
            self.emit_get_vreg(b, regs::T1)?;
            self.emit_guard_ints(regs::T0, regs::T1, regs::T2);
            self.asm().sub_ri32(regs::T0, 1);
            self.asm().add_rr(regs::T0, regs::T1);
        }
        let j = self.emit_branch(Cond::O);
        self.add_slow_case(j);
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_slow_add(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        self.emit_slow_binary(iter, 2, StubId::Add)
    }

    pub(crate) fn emit_sub(&mut self) -> Result<(), CompileError> {
        if self.hints_rule_out_fast_path() {
            return self.emit_binary_stub_op(StubId::Sub);
        }
        let dst = self.operand(1);
        let (a, b) = (self.operand(2), self.operand(3));
        if let Some(delta) = self.const_delta(b) {
            self.emit_get_vreg(a, regs::T0)?;
            self.emit_guard_int(regs::T0);
            self.asm().sub_ri32(regs::T0, delta);
            let j = self.emit_branch(Cond::O);
            self.add_slow_case(j);
        } else {
            self.emit_get_vreg(a, regs::T0)?;
            self.emit_get_vreg(b, regs::T1)?;
            self.emit_guard_ints(regs::T0, regs::T1, regs::T2);
            self.asm().sub_rr(regs::T0, regs::T1);
            let j = self.emit_branch(Cond::O);
            self.add_slow_case(j);
            self.asm().or_ri32(regs::T0, 1);
        }
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_slow_sub(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        self.emit_slow_binary(iter, 2, StubId::Sub)
    }

    // ==================== mul ====================

    pub(crate) fn emit_mul(&mut self) -> Result<(), CompileError> {
        if self.hints_rule_out_fast_path() {
            return self.emit_binary_stub_op(StubId::Mul);
        }
        let dst = self.operand(1);
        let (a, b) = (self.operand(2), self.operand(3));
        let const_side = self
            .const_i32(b)
            .map(|c| (a, c))
            .or_else(|| self.const_i32(a).map(|c| (b, c)));
        if let Some((dynamic, c)) = const_side {
            self.emit_get_vreg(dynamic, regs::T0)?;
            self.emit_guard_int(regs::T0);
            self.asm().sar_ri(regs::T0, 1);
            let mut asm = self.asm();
            asm.imul_rri32(regs::T0, regs::T0, c);
        } else {
            self.emit_get_vreg(a, regs::T0)?;
            self.emit_get_vreg(b, regs::T1)?;
            self.emit_guard_ints(regs::T0, regs::T1, regs::T2);
            self.asm().sar_ri(regs::T0, 1);
            self.asm().sar_ri(regs::T1, 1);
            self.asm().imul_rr(regs::T0, regs::T1);
        }
        let j = self.emit_branch(Cond::O);
        self.add_slow_case(j);
        // Retagging can overflow the 63-bit payload on its own.
        self.asm().add_rr(regs::T0, regs::T0);
        let j = self.emit_branch(Cond::O);
        self.add_slow_case(j);
        self.asm().or_ri32(regs::T0, 1);
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_slow_mul(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        self.emit_slow_binary(iter, 3, StubId::Mul)
    }

    // ==================== mod ====================

    pub(crate) fn emit_mod(&mut self) -> Result<(), CompileError> {
        if self.hints_rule_out_fast_path() {
            return self.emit_binary_stub_op(StubId::Mod);
        }
        let dst = self.operand(1);
        let (a, b) = (self.operand(2), self.operand(3));
        self.emit_get_vreg(a, regs::T0)?;
        self.emit_get_vreg(b, regs::T2)?;
        self.emit_guard_ints(regs::T0, regs::T2, regs::SCRATCH2);
        // Zero divisor and -1 (overflow trap for the minimum integer) both
        // take the slow path.
        self.asm().cmp_ri32(regs::T2, Value::int(0).0 as i32);
        let j = self.emit_branch(Cond::E);
        self.add_slow_case(j);
        self.asm().cmp_ri32(regs::T2, Value::int(-1).0 as u32 as i32);
        let j = self.emit_branch(Cond::E);
        self.add_slow_case(j);
        let mut asm = self.asm();
        asm.sar_ri(regs::T0, 1);
        asm.sar_ri(regs::T2, 1);
        asm.cqo();
        asm.idiv(regs::T2);
        // Remainder lands in rdx; retag cannot overflow.
        asm.add_rr(regs::T1, regs::T1);
        asm.or_ri32(regs::T1, 1);
        asm.mov_rr(regs::T0, regs::T1);
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_slow_mod(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        self.emit_slow_binary(iter, 3, StubId::Mod)
    }

    // ==================== unary ====================

    pub(crate) fn emit_neg(&mut self) -> Result<(), CompileError> {
        let (dst, src) = (self.operand(1), self.operand(2));
        self.emit_get_vreg(src, regs::T0)?;
        self.emit_guard_int(regs::T0);
        // -T(n) + 2 = T(-n); the +2 overflows for the minimum payload.
        self.asm().neg(regs::T0);
        self.asm().add_ri32(regs::T0, 2);
        let j = self.emit_branch(Cond::O);
        self.add_slow_case(j);
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_slow_neg(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        let (dst, src) = (self.operand(1), self.operand(2));
        self.link_slow_case(iter);
        self.link_slow_case(iter);
        self.emit_stub_call(StubId::Neg, &[StubArg::Vreg(src)])?;
        self.emit_exception_check();
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_pre_inc(&mut self) -> Result<(), CompileError> {
        let r = self.operand(1);
        self.emit_get_vreg(r, regs::T0)?;
        self.emit_guard_int(regs::T0);
        self.asm().add_ri32(regs::T0, 2);
        let j = self.emit_branch(Cond::O);
        self.add_slow_case(j);
        self.emit_put_vreg(r)
    }

    pub(crate) fn emit_slow_pre_inc(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        let r = self.operand(1);
        self.link_slow_case(iter);
        self.link_slow_case(iter);
        self.emit_stub_call(StubId::Add, &[StubArg::Vreg(r), StubArg::Imm(ONE)])?;
        self.emit_exception_check();
        self.emit_put_vreg(r)
    }

    pub(crate) fn emit_pre_dec(&mut self) -> Result<(), CompileError> {
        let r = self.operand(1);
        self.emit_get_vreg(r, regs::T0)?;
        self.emit_guard_int(regs::T0);
        self.asm().sub_ri32(regs::T0, 2);
        let j = self.emit_branch(Cond::O);
        self.add_slow_case(j);
        self.emit_put_vreg(r)
    }

    pub(crate) fn emit_slow_pre_dec(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        let r = self.operand(1);
        self.link_slow_case(iter);
        self.link_slow_case(iter);
        self.emit_stub_call(StubId::Sub, &[StubArg::Vreg(r), StubArg::Imm(ONE)])?;
        self.emit_exception_check();
        self.emit_put_vreg(r)
    }

    // ==================== bitwise ====================

    pub(crate) fn emit_bit_and(&mut self) -> Result<(), CompileError> {
        let dst = self.operand(1);
        let (a, b) = (self.operand(2), self.operand(3));
        let const_side = self
            .const_tagged_int(b)
            .map(|c| (a, c))
            .or_else(|| self.const_tagged_int(a).map(|c| (b, c)));
        if let Some((dynamic, tagged)) = const_side {
            self.emit_get_vreg(dynamic, regs::T0)?;
            self.emit_guard_int(regs::T0);
            self.asm().and_ri32(regs::T0, tagged);
        } else {
            self.emit_get_vreg(a, regs::T0)?;
            self.emit_get_vreg(b, regs::T1)?;
            self.emit_guard_ints(regs::T0, regs::T1, regs::T2);
            self.asm().and_rr(regs::T0, regs::T1);
        }
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_slow_bit_and(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        self.emit_slow_binary(iter, 1, StubId::BitAnd)
    }

    pub(crate) fn emit_bit_or(&mut self) -> Result<(), CompileError> {
        let dst = self.operand(1);
        let (a, b) = (self.operand(2), self.operand(3));
        let const_side = self
            .const_tagged_int(b)
            .map(|c| (a, c))
            .or_else(|| self.const_tagged_int(a).map(|c| (b, c)));
        if let Some((dynamic, tagged)) = const_side {
            self.emit_get_vreg(dynamic, regs::T0)?;
            self.emit_guard_int(regs::T0);
            self.asm().or_ri32(regs::T0, tagged);
        } else {
            self.emit_get_vreg(a, regs::T0)?;
            self.emit_get_vreg(b, regs::T1)?;
            self.emit_guard_ints(regs::T0, regs::T1, regs::T2);
            self.asm().or_rr(regs::T0, regs::T1);
        }
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_slow_bit_or(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        self.emit_slow_binary(iter, 1, StubId::BitOr)
    }

    pub(crate) fn emit_bit_xor(&mut self) -> Result<(), CompileError> {
        let dst = self.operand(1);
        let (a, b) = (self.operand(2), self.operand(3));
        let const_side = self
            .const_delta(b)
            .map(|c| (a, c))
            .or_else(|| self.const_delta(a).map(|c| (b, c)));
        if let Some((dynamic, delta)) = const_side {
            self.emit_get_vreg(dynamic, regs::T0)?;
            self.emit_guard_int(regs::T0);
            self.asm().xor_ri32(regs::T0, delta);
        } else {
            self.emit_get_vreg(a, regs::T0)?;
            self.emit_get_vreg(b, regs::T1)?;
            self.emit_guard_ints(regs::T0, regs::T1, regs::T2);
            self.asm().xor_rr(regs::T0, regs::T1);
            self.asm().or_ri32(regs::T0, 1);
        }
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_slow_bit_xor(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        self.emit_slow_binary(iter, 1, StubId::BitXor)
    }

    pub(crate) fn emit_bit_not(&mut self) -> Result<(), CompileError> {
        let (dst, src) = (self.operand(1), self.operand(2));
        self.emit_get_vreg(src, regs::T0)?;
        self.emit_guard_int(regs::T0);
        // Flipping everything but the tag bit is exactly T(!n).
        self.asm().xor_ri32(regs::T0, -2);
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_slow_bit_not(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        let (dst, src) = (self.operand(1), self.operand(2));
        self.link_slow_case(iter);
        self.emit_stub_call(StubId::BitNot, &[StubArg::Vreg(src)])?;
        self.emit_exception_check();
        self.emit_put_vreg(dst)
    }

    // ==================== shifts ====================

    pub(crate) fn emit_lsh(&mut self) -> Result<(), CompileError> {
        let dst = self.operand(1);
        let (a, b) = (self.operand(2), self.operand(3));
        if let Some(c) = self.constant_int(b) {
            self.emit_get_vreg(a, regs::T0)?;
            self.emit_guard_int(regs::T0);
            self.asm().mov_ri32(regs::T2, (c as u32 & 63) as i32);
        } else {
            self.emit_get_vreg(a, regs::T0)?;
            self.emit_get_vreg(b, regs::T2)?;
            self.emit_guard_ints(regs::T0, regs::T2, regs::SCRATCH2);
            self.asm().sar_ri(regs::T2, 1);
        }
        self.asm().sar_ri(regs::T0, 1);
        // Shift in scratch, then verify nothing fell off the top and the
        // result still fits the 63-bit payload.
        self.asm().mov_rr(regs::SCRATCH2, regs::T0);
        self.asm().shl_cl(regs::SCRATCH2);
        self.asm().mov_rr(regs::T3, regs::SCRATCH2);
        self.asm().sar_cl(regs::T3);
        self.asm().cmp_rr(regs::T3, regs::T0);
        let j = self.emit_branch(Cond::Ne);
        self.add_slow_case(j);
        self.asm().mov_rr(regs::T3, regs::SCRATCH2);
        self.asm().shl_ri(regs::T3, 1);
        self.asm().sar_ri(regs::T3, 1);
        self.asm().cmp_rr(regs::T3, regs::SCRATCH2);
        let j = self.emit_branch(Cond::Ne);
        self.add_slow_case(j);
        let mut asm = self.asm();
        asm.mov_rr(regs::T0, regs::SCRATCH2);
        asm.add_rr(regs::T0, regs::T0);
        asm.or_ri32(regs::T0, 1);
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_slow_lsh(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        self.emit_slow_binary(iter, 3, StubId::Lsh)
    }

    pub(crate) fn emit_rsh(&mut self) -> Result<(), CompileError> {
        let dst = self.operand(1);
        let (a, b) = (self.operand(2), self.operand(3));
        if let Some(c) = self.constant_int(b) {
            self.emit_get_vreg(a, regs::T0)?;
            self.emit_guard_int(regs::T0);
            self.asm().sar_ri(regs::T0, 1);
            self.asm().sar_ri(regs::T0, (c as u32 & 63) as u8);
        } else {
            self.emit_get_vreg(a, regs::T0)?;
            self.emit_get_vreg(b, regs::T2)?;
            self.emit_guard_ints(regs::T0, regs::T2, regs::SCRATCH2);
            self.asm().sar_ri(regs::T0, 1);
            self.asm().sar_ri(regs::T2, 1);
            self.asm().sar_cl(regs::T0);
        }
        // Arithmetic right shifts only shrink; retag cannot overflow.
        self.asm().add_rr(regs::T0, regs::T0);
        self.asm().or_ri32(regs::T0, 1);
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_slow_rsh(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        self.emit_slow_binary(iter, 1, StubId::Rsh)
    }
}
