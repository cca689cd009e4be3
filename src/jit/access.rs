//! Property, element and global access.
//!
//! Named accesses are shape-guarded through a property cache slot: the
//! guard word packs (expected shape, slot index), so a hit costs one load,
//! one 32-bit compare and an indexed load or store. Element accesses have
//! a dense-array fast path with explicit bounds and hole checks. Global
//! accesses reuse the property machinery against the baked-in global
//! object.

use crate::error::CompileError;
use crate::vm::heap::{kind, layout as cell};

use super::compiler::{AnchorKind, JitCompiler, SlowCases, StubArg, regs};
use super::ic::layout as ic;
use super::stubs::StubId;
use super::x86_64::Cond;

impl JitCompiler<'_> {
    /// Guard the shape of the object in `T0` against the cache slot whose
    /// index is `site`, leaving the cached slot index in r10. One slow
    /// case.
    fn emit_shape_guard(&mut self, site: usize) {
        self.emit_ic_anchor(AnchorKind::Prop(site));
        self.asm()
            .mov_rm(regs::SCRATCH2, regs::SCRATCH, ic::PROP_WORD);
        self.asm().mov_rm32(regs::T1, regs::T0, cell::SHAPE);
        self.asm().cmp_rr32(regs::T1, regs::SCRATCH2);
        let j = self.emit_branch(Cond::Ne);
        self.add_slow_case(j);
        self.asm().shr_ri(regs::SCRATCH2, 32);
    }

    pub(crate) fn emit_get_prop(&mut self) -> Result<(), CompileError> {
        let (dst, base, sym) = (self.operand(1), self.operand(2), self.operand(3));
        self.emit_get_vreg(base, regs::T0)?;
        self.emit_guard_cell(regs::T0);
        let site = self.new_prop_site(sym);
        self.emit_shape_guard(site);
        self.asm().mov_rm(regs::T2, regs::T0, cell::W0);
        self.asm().mov_rm_sib8(regs::T0, regs::T2, regs::SCRATCH2);
        // A deleted property leaves an empty slot behind.
        self.asm().test_rr(regs::T0, regs::T0);
        let j = self.emit_branch(Cond::E);
        self.add_slow_case(j);
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_slow_get_prop(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        let (dst, base) = (self.operand(1), self.operand(2));
        let site = self.next_prop_site();
        self.link_slow_case(iter);
        self.link_slow_case(iter);
        self.link_slow_case(iter);
        self.emit_stub_call(
            StubId::GetProp,
            &[StubArg::Vreg(base), StubArg::PropIc(site)],
        )?;
        self.emit_exception_check();
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_put_prop(&mut self) -> Result<(), CompileError> {
        let (base, sym, src) = (self.operand(1), self.operand(2), self.operand(3));
        self.emit_get_vreg(base, regs::T0)?;
        self.emit_guard_cell(regs::T0);
        let site = self.new_prop_site(sym);
        self.emit_shape_guard(site);
        // Cached stores are plain replacements; shape transitions always
        // go through the runtime.
        self.emit_get_vreg(src, regs::T1)?;
        self.asm().mov_rm(regs::T2, regs::T0, cell::W0);
        self.asm().mov_mr_sib8(regs::T2, regs::SCRATCH2, regs::T1);
        Ok(())
    }

    pub(crate) fn emit_slow_put_prop(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        let (base, src) = (self.operand(1), self.operand(3));
        let site = self.next_prop_site();
        self.link_slow_case(iter);
        self.link_slow_case(iter);
        self.emit_stub_call(
            StubId::PutProp,
            &[
                StubArg::Vreg(base),
                StubArg::Vreg(src),
                StubArg::PropIc(site),
            ],
        )?;
        self.emit_exception_check();
        Ok(())
    }

    pub(crate) fn emit_del_prop(&mut self) -> Result<(), CompileError> {
        let (dst, base, sym) = (self.operand(1), self.operand(2), self.operand(3));
        self.emit_stub_call(
            StubId::DelProp,
            &[StubArg::Vreg(base), StubArg::Imm(sym as i64)],
        )?;
        self.emit_exception_check();
        self.emit_put_vreg(dst)
    }

    // ==================== elements ====================

    pub(crate) fn emit_get_index(&mut self) -> Result<(), CompileError> {
        let (dst, base, index) = (self.operand(1), self.operand(2), self.operand(3));
        self.emit_get_vreg(base, regs::T0)?;
        self.emit_get_vreg(index, regs::T1)?;
        self.emit_guard_int(regs::T1);
        self.emit_guard_cell(regs::T0);
        self.asm().mov_rm32(regs::SCRATCH2, regs::T0, cell::KIND);
        self.asm().cmp_ri32(regs::SCRATCH2, kind::ARRAY as i32);
        let j = self.emit_branch(Cond::Ne);
        self.add_slow_case(j);
        self.asm().sar_ri(regs::T1, 1);
        // Unsigned compare rejects negative indices along with too-large
        // ones.
        self.asm().cmp_rm(regs::T1, regs::T0, cell::W1);
        let j = self.emit_branch(Cond::Ae);
        self.add_slow_case(j);
        self.asm().mov_rm(regs::T2, regs::T0, cell::W0);
        self.asm().mov_rm_sib8(regs::T0, regs::T2, regs::T1);
        self.asm().test_rr(regs::T0, regs::T0);
        let j = self.emit_branch(Cond::E);
        self.add_slow_case(j);
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_slow_get_index(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        let (dst, base, index) = (self.operand(1), self.operand(2), self.operand(3));
        for _ in 0..5 {
            self.link_slow_case(iter);
        }
        self.emit_stub_call(
            StubId::GetIndex,
            &[StubArg::Vreg(base), StubArg::Vreg(index)],
        )?;
        self.emit_exception_check();
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_put_index(&mut self) -> Result<(), CompileError> {
        let (base, index, src) = (self.operand(1), self.operand(2), self.operand(3));
        self.emit_get_vreg(base, regs::T0)?;
        self.emit_get_vreg(index, regs::T1)?;
        self.emit_guard_int(regs::T1);
        self.emit_guard_cell(regs::T0);
        self.asm().mov_rm32(regs::SCRATCH2, regs::T0, cell::KIND);
        self.asm().cmp_ri32(regs::SCRATCH2, kind::ARRAY as i32);
        let j = self.emit_branch(Cond::Ne);
        self.add_slow_case(j);
        self.asm().sar_ri(regs::T1, 1);
        // In-bounds stores only; growth is the runtime's business.
        self.asm().cmp_rm(regs::T1, regs::T0, cell::W1);
        let j = self.emit_branch(Cond::Ae);
        self.add_slow_case(j);
        self.emit_get_vreg(src, regs::T2)?;
        self.asm().mov_rm(regs::SCRATCH2, regs::T0, cell::W0);
        self.asm().mov_mr_sib8(regs::SCRATCH2, regs::T1, regs::T2);
        Ok(())
    }

    pub(crate) fn emit_slow_put_index(&mut self, iter: &mut SlowCases) -> Result<(), CompileError> {
        let (base, index, src) = (self.operand(1), self.operand(2), self.operand(3));
        for _ in 0..4 {
            self.link_slow_case(iter);
        }
        self.emit_stub_call(
            StubId::PutIndex,
            &[
                StubArg::Vreg(base),
                StubArg::Vreg(index),
                StubArg::Vreg(src),
            ],
        )?;
        self.emit_exception_check();
        Ok(())
    }

    // ==================== globals ====================

    pub(crate) fn emit_get_global(&mut self) -> Result<(), CompileError> {
        let (dst, sym) = (self.operand(1), self.operand(2));
        let site = self.new_prop_site(sym);
        let global = self.global;
        self.mov_value(regs::T0, global);
        self.kill_cached_result();
        self.emit_shape_guard(site);
        self.asm().mov_rm(regs::T2, regs::T0, cell::W0);
        self.asm().mov_rm_sib8(regs::T0, regs::T2, regs::SCRATCH2);
        self.asm().test_rr(regs::T0, regs::T0);
        let j = self.emit_branch(Cond::E);
        self.add_slow_case(j);
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_slow_get_global(
        &mut self,
        iter: &mut SlowCases,
    ) -> Result<(), CompileError> {
        let dst = self.operand(1);
        let site = self.next_prop_site();
        self.link_slow_case(iter);
        self.link_slow_case(iter);
        self.emit_stub_call(StubId::GetGlobal, &[StubArg::PropIc(site)])?;
        self.emit_exception_check();
        self.emit_put_vreg(dst)
    }

    pub(crate) fn emit_put_global(&mut self) -> Result<(), CompileError> {
        let (sym, src) = (self.operand(1), self.operand(2));
        let site = self.new_prop_site(sym);
        let global = self.global;
        self.mov_value(regs::T0, global);
        self.kill_cached_result();
        self.emit_shape_guard(site);
        self.emit_get_vreg(src, regs::T1)?;
        self.asm().mov_rm(regs::T2, regs::T0, cell::W0);
        self.asm().mov_mr_sib8(regs::T2, regs::SCRATCH2, regs::T1);
        Ok(())
    }

    pub(crate) fn emit_slow_put_global(
        &mut self,
        iter: &mut SlowCases,
    ) -> Result<(), CompileError> {
        let src = self.operand(2);
        let site = self.next_prop_site();
        self.link_slow_case(iter);
        self.emit_stub_call(
            StubId::PutGlobal,
            &[StubArg::Vreg(src), StubArg::PropIc(site)],
        )?;
        self.emit_exception_check();
        Ok(())
    }
}
