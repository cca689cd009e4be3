//! The baseline compiler: one linear main pass over the bytecode, an
//! ordered slow-case pass, a link pass for intra-function jumps, then the
//! patch step (`patch::finalize`) once the code has a final address.
//!
//! Per-opcode emitters live in `opcodes`, `arith`, `access` and `calls`;
//! they are wired up through the opcode table at the bottom of this file.

use std::mem;

use crate::error::CompileError;
use crate::vm::bytecode::{CodeUnit, FRAME_HEADER_WORDS, Op, frame};
use crate::vm::shapes::Sym;
use crate::vm::value::tags;
use crate::vm::vm::ctx_off;

use super::codebuf::CodeBuffer;
use super::memory::ExecutablePool;
use super::patch::{self, CompiledCode};
use super::stubs::StubId;
use super::thunks::TrampolineSet;
use super::x86_64::{Asm, Cond, Reg};

/// Register conventions for compiled code.
///
/// - r12: execution context (callee-saved)
/// - r13: frame pointer, register 0 of the active frame (callee-saved)
/// - r14: preemption countdown (callee-saved)
/// - rax/rdx/rcx/rsi: temporaries, rax doubling as the cached-result and
///   return-value register
/// - r10/r11: scratch, r11 carrying inline-cache slot addresses
pub mod regs {
    use super::Reg;

    pub const CTX: Reg = Reg::R12;
    pub const FRAME: Reg = Reg::R13;
    pub const PREEMPT: Reg = Reg::R14;

    pub const T0: Reg = Reg::Rax;
    pub const T1: Reg = Reg::Rdx;
    pub const T2: Reg = Reg::Rcx;
    pub const T3: Reg = Reg::Rsi;
    pub const SCRATCH: Reg = Reg::R11;
    pub const SCRATCH2: Reg = Reg::R10;
}

/// Everything external the compiler needs: where the global object lives,
/// where executable memory comes from, and the trampolines new call sites
/// start out pointing at.
pub struct CompileEnv<'a> {
    pub global: u64,
    pub pool: &'a ExecutablePool,
    pub trampolines: &'a TrampolineSet,
}

/// A native-offset slot awaiting a rel32 patch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JumpRef(pub usize);

/// One label per bytecode offset: the native offset it resolved to, and
/// whether anything jumps here. The used flag gates the cached-result
/// flush at that label.
pub(crate) struct Label {
    pub offset: usize,
    pub used: bool,
}

const UNBOUND: usize = usize::MAX;

pub(crate) struct JumpRecord {
    from: JumpRef,
    target: usize,
}

/// One guard-failure branch recorded by the main pass, tagged with the
/// opcode that emitted it. The slow-case pass consumes these strictly in
/// order, one group per opcode.
pub(crate) struct SlowCaseEntry {
    from: JumpRef,
    bc: usize,
}

/// Iterator state for the slow-case pass.
pub(crate) struct SlowCases {
    entries: Vec<SlowCaseEntry>,
    pos: usize,
}

impl SlowCases {
    fn peek_bc(&self) -> Option<usize> {
        self.entries.get(self.pos).map(|e| e.bc)
    }

    fn last_bc(&self) -> Option<usize> {
        self.pos.checked_sub(1).map(|i| self.entries[i].bc)
    }

    fn next(&mut self) -> Option<&SlowCaseEntry> {
        let e = self.entries.get(self.pos)?;
        self.pos += 1;
        Some(e)
    }
}

/// Deferred call to a runtime stub; the absolute address is only known at
/// patch time.
pub(crate) struct CallRecord {
    pub imm_at: usize,
    pub stub: StubId,
}

/// Deferred absolute reference to an inline-cache slot.
pub(crate) enum AnchorKind {
    Prop(usize),
    Call(usize),
}

pub(crate) struct AnchorRecord {
    pub imm_at: usize,
    pub kind: AnchorKind,
}

/// Compile-time half of a property-access inline cache site.
pub(crate) struct PropSite {
    pub sym: Sym,
    pub bc: u32,
    pub hot_begin: usize,
    pub cold_begin: usize,
}

/// Compile-time half of a call inline cache site.
pub(crate) struct CallSiteInfo {
    pub bc: u32,
    pub hot_begin: usize,
    pub cold_begin: usize,
}

pub(crate) struct SwitchRecord {
    pub table_index: usize,
    pub bc: usize,
}

/// Argument to a runtime-stub call.
pub(crate) enum StubArg {
    Vreg(u32),
    Imm(i64),
    PropIc(usize),
    CallIc(usize),
}

/// One compiler instance per function-body compile; produces exactly one
/// finalized code object and is then discarded.
pub struct JitCompiler<'a> {
    pub(crate) unit: &'a CodeUnit,
    pub(crate) global: u64,
    pub(crate) buf: CodeBuffer,
    pub(crate) labels: Vec<Label>,
    pub(crate) jumps: Vec<JumpRecord>,
    pub(crate) slow_cases: Vec<SlowCaseEntry>,
    pub(crate) exception_jumps: Vec<JumpRef>,
    pub(crate) calls: Vec<CallRecord>,
    pub(crate) call_returns: Vec<(usize, u32)>,
    pub(crate) anchors: Vec<AnchorRecord>,
    pub(crate) prop_sites: Vec<PropSite>,
    pub(crate) call_sites: Vec<CallSiteInfo>,
    pub(crate) switches: Vec<SwitchRecord>,
    pub(crate) prop_site_cursor: usize,
    pub(crate) call_site_cursor: usize,
    pub(crate) rf_branch: Option<JumpRef>,
    pub(crate) after_rf_check: usize,
    /// Virtual register whose value is live in rax, if any.
    pub(crate) cached_result: Option<u32>,
    /// Bytecode offset of the opcode being compiled.
    pub(crate) bc: usize,
}

/// Compile one function body.
pub fn compile(
    unit: &CodeUnit,
    env: &CompileEnv,
) -> Result<std::sync::Arc<CompiledCode>, CompileError> {
    let _span = tracing::debug_span!("compile", unit = %unit.name).entered();
    let mut c = JitCompiler::new(unit, env);
    c.scan_jump_targets()?;
    c.emit_prologue();
    c.main_pass()?;
    c.slow_case_pass()?;
    c.emit_register_file_tail()?;
    c.emit_exception_tail()?;
    c.link_pass()?;
    let code = patch::finalize(c, env)?;
    tracing::debug!(
        unit = %unit.name,
        bytes = code.code_size(),
        "compiled"
    );
    Ok(code)
}

impl<'a> JitCompiler<'a> {
    fn new(unit: &'a CodeUnit, env: &CompileEnv) -> Self {
        let mut labels = Vec::with_capacity(unit.code.len() + 1);
        labels.resize_with(unit.code.len() + 1, || Label {
            offset: UNBOUND,
            used: false,
        });
        JitCompiler {
            unit,
            global: env.global,
            buf: CodeBuffer::with_capacity(unit.code.len() * 24 + 256),
            labels,
            jumps: Vec::new(),
            slow_cases: Vec::new(),
            exception_jumps: Vec::new(),
            calls: Vec::new(),
            call_returns: Vec::new(),
            anchors: Vec::new(),
            prop_sites: Vec::new(),
            call_sites: Vec::new(),
            switches: Vec::new(),
            prop_site_cursor: 0,
            call_site_cursor: 0,
            rf_branch: None,
            after_rf_check: 0,
            cached_result: None,
            bc: 0,
        }
    }

    // ==================== bytecode access ====================

    pub(crate) fn operand(&self, k: usize) -> u32 {
        self.unit.code[self.bc + k]
    }

    pub(crate) fn operand_i32(&self, k: usize) -> i32 {
        self.operand(k) as i32
    }

    /// Bytecode offset a relative-jump operand resolves to.
    pub(crate) fn jump_target(&self, k: usize) -> usize {
        (self.bc as i64 + self.operand_i32(k) as i64) as usize
    }

    pub(crate) fn err(&self, reason: impl Into<String>) -> CompileError {
        CompileError::MalformedBytecode {
            unit: self.unit.name.clone(),
            offset: self.bc,
            reason: reason.into(),
        }
    }

    pub(crate) fn is_constant(&self, operand: u32) -> bool {
        self.unit.is_constant(operand)
    }

    /// The operand as a compile-time integer constant, if it is one.
    pub(crate) fn constant_int(&self, operand: u32) -> Option<i64> {
        self.unit.constant_int(operand)
    }

    // ==================== emission helpers ====================

    pub(crate) fn asm(&mut self) -> Asm<'_> {
        Asm::new(&mut self.buf)
    }

    /// Load an immediate value word, using the short form when it fits.
    pub(crate) fn mov_value(&mut self, dst: Reg, bits: u64) {
        let s = bits as i64;
        if (i32::MIN as i64..=i32::MAX as i64).contains(&s) {
            self.asm().mov_ri32(dst, s as i32);
        } else {
            self.asm().mov_ri64(dst, bits);
        }
    }

    pub(crate) fn frame_disp(operand: u32) -> i32 {
        operand as i32 * 8
    }

    /// Load a virtual register (or constant) into `dst`.
    ///
    /// The cached-result mapping is one-shot: a load that can reuse rax
    /// does, and any load kills the mapping, so every path into the next
    /// opcode agrees on the register state.
    pub(crate) fn emit_get_vreg(&mut self, operand: u32, dst: Reg) -> Result<(), CompileError> {
        if self.is_constant(operand) {
            let v = self
                .unit
                .constant(operand)
                .ok_or_else(|| self.err("constant operand out of range"))?;
            self.mov_value(dst, v.0);
            self.kill_cached_result();
            return Ok(());
        }
        if operand as usize >= self.unit.num_regs {
            return Err(self.err("register operand out of range"));
        }
        // Reuse is restricted to temporaries, which are single-use.
        if self.cached_result == Some(operand) && operand as usize >= self.unit.num_vars {
            if dst != regs::T0 {
                self.asm().mov_rr(dst, regs::T0);
            }
            self.kill_cached_result();
            return Ok(());
        }
        self.asm().mov_rm(dst, regs::FRAME, Self::frame_disp(operand));
        self.kill_cached_result();
        Ok(())
    }

    /// Store rax into a virtual register and remember the mapping.
    pub(crate) fn emit_put_vreg(&mut self, operand: u32) -> Result<(), CompileError> {
        if operand as usize >= self.unit.num_regs {
            return Err(self.err("store to non-register operand"));
        }
        self.asm()
            .mov_mr(regs::FRAME, Self::frame_disp(operand), regs::T0);
        self.cached_result = Some(operand);
        Ok(())
    }

    pub(crate) fn kill_cached_result(&mut self) {
        self.cached_result = None;
    }

    pub(crate) fn cached_result(&self) -> Option<u32> {
        self.cached_result
    }

    pub(crate) fn record_switch(&mut self, table_index: usize) {
        self.switches.push(SwitchRecord {
            table_index,
            bc: self.bc,
        });
    }

    /// Record the native return offset of a call site for the
    /// call-return-offset table.
    pub(crate) fn note_call_return(&mut self) {
        self.call_returns.push((self.buf.len(), self.bc as u32));
    }

    pub(crate) fn emit_jump(&mut self) -> JumpRef {
        JumpRef(self.asm().jmp_rel32(0))
    }

    pub(crate) fn emit_branch(&mut self, cond: Cond) -> JumpRef {
        JumpRef(self.asm().jcc_rel32(cond, 0))
    }

    /// Bind a forward reference to the current position.
    pub(crate) fn link_here(&mut self, j: JumpRef) {
        let here = self.buf.len();
        self.buf.link_rel32(j.0, here);
    }

    pub(crate) fn link_to(&mut self, j: JumpRef, target: usize) {
        self.buf.link_rel32(j.0, target);
    }

    /// Defer a jump to a bytecode offset; resolved by the link pass.
    pub(crate) fn add_jump(&mut self, j: JumpRef, target: usize) {
        self.jumps.push(JumpRecord { from: j, target });
    }

    /// Queue a guard-failure branch for the slow-case pass.
    pub(crate) fn add_slow_case(&mut self, j: JumpRef) {
        self.slow_cases.push(SlowCaseEntry { from: j, bc: self.bc });
    }

    /// Bind the next slow-case record of the current opcode's group to the
    /// current position. Order mismatches are fatal.
    pub(crate) fn link_slow_case(&mut self, iter: &mut SlowCases) {
        let here = self.buf.len();
        let e = iter.next().expect("slow-case queue exhausted early");
        assert_eq!(e.bc, self.bc, "slow-case record belongs to another opcode");
        self.buf.link_rel32(e.from.0, here);
    }

    // ==================== stub calls ====================

    /// Call a runtime stub under the fixed convention: frame published to
    /// the context, ctx + up to three arguments in registers, result in
    /// rax, frame reloaded afterwards.
    pub(crate) fn emit_stub_call(
        &mut self,
        stub: StubId,
        args: &[StubArg],
    ) -> Result<(), CompileError> {
        const ARG_REGS: [Reg; 3] = [Reg::Rsi, Reg::Rdx, Reg::Rcx];
        assert!(args.len() <= ARG_REGS.len());

        self.asm().mov_mr(regs::CTX, ctx_off::FRAME, regs::FRAME);
        for (i, arg) in args.iter().enumerate() {
            let reg = ARG_REGS[i];
            match arg {
                StubArg::Vreg(o) => self.emit_get_vreg(*o, reg)?,
                StubArg::Imm(v) => self.mov_value(reg, *v as u64),
                StubArg::PropIc(index) => {
                    let imm_at = self.asm().mov_ri64(reg, 0);
                    self.anchors.push(AnchorRecord {
                        imm_at,
                        kind: AnchorKind::Prop(*index),
                    });
                }
                StubArg::CallIc(index) => {
                    let imm_at = self.asm().mov_ri64(reg, 0);
                    self.anchors.push(AnchorRecord {
                        imm_at,
                        kind: AnchorKind::Call(*index),
                    });
                }
            }
        }
        self.asm().mov_rr(Reg::Rdi, regs::CTX);
        let imm_at = self.asm().mov_ri64(regs::SCRATCH, 0);
        self.asm().call_r(regs::SCRATCH);
        self.calls.push(CallRecord { imm_at, stub });
        self.call_returns.push((self.buf.len(), self.bc as u32));
        self.asm().mov_rm(regs::FRAME, regs::CTX, ctx_off::FRAME);
        self.kill_cached_result();
        Ok(())
    }

    /// Test the exception slot right after a call that can throw; on a hit
    /// record the faulting offset and leave for the unwind tail.
    pub(crate) fn emit_exception_check(&mut self) {
        self.asm().cmp_mi8(regs::CTX, ctx_off::EXCEPTION, 0);
        let ok = self.emit_branch(Cond::E);
        let bc = self.bc as i32;
        self.asm()
            .mov_mi32(regs::CTX, ctx_off::FAULT_OFFSET, bc);
        let j = self.emit_jump();
        self.exception_jumps.push(j);
        self.link_here(ok);
    }

    /// Decrement-and-branch preemption poll; emitted before every
    /// loop-back edge.
    pub(crate) fn emit_preempt_check(&mut self) -> Result<(), CompileError> {
        self.asm().sub_ri32(regs::PREEMPT, 1);
        let ok = self.emit_branch(Cond::Ne);
        self.emit_stub_call(StubId::Preempt, &[])?;
        self.asm().mov_rr(regs::PREEMPT, regs::T0);
        self.emit_exception_check();
        self.link_here(ok);
        self.kill_cached_result();
        Ok(())
    }

    // ==================== inline-cache sites ====================

    pub(crate) fn new_prop_site(&mut self, sym: Sym) -> usize {
        self.prop_sites.push(PropSite {
            sym,
            bc: self.bc as u32,
            hot_begin: self.buf.len(),
            cold_begin: 0,
        });
        self.prop_sites.len() - 1
    }

    /// The slow-case pass re-visits property sites in exactly main-pass
    /// order; mismatches are fatal.
    pub(crate) fn next_prop_site(&mut self) -> usize {
        let index = self.prop_site_cursor;
        self.prop_site_cursor += 1;
        assert_eq!(
            self.prop_sites[index].bc, self.bc as u32,
            "property-site order diverged between passes"
        );
        self.prop_sites[index].cold_begin = self.buf.len();
        index
    }

    pub(crate) fn new_call_site(&mut self) -> usize {
        self.call_sites.push(CallSiteInfo {
            bc: self.bc as u32,
            hot_begin: self.buf.len(),
            cold_begin: 0,
        });
        self.call_sites.len() - 1
    }

    pub(crate) fn next_call_site(&mut self) -> usize {
        let index = self.call_site_cursor;
        self.call_site_cursor += 1;
        assert_eq!(
            self.call_sites[index].bc, self.bc as u32,
            "call-site order diverged between passes"
        );
        self.call_sites[index].cold_begin = self.buf.len();
        index
    }

    /// Load an inline-cache slot's (patch-time) address into r11.
    pub(crate) fn emit_ic_anchor(&mut self, kind: AnchorKind) {
        let imm_at = self.asm().mov_ri64(regs::SCRATCH, 0);
        self.anchors.push(AnchorRecord { imm_at, kind });
    }

    // ==================== passes ====================

    /// Pre-scan: validate the instruction stream and mark every jump
    /// target's label as used, so the main pass flushes register state at
    /// merge points.
    fn scan_jump_targets(&mut self) -> Result<(), CompileError> {
        if self.unit.num_regs > (i32::MAX as usize) / 16 {
            return Err(self.err("register count out of range"));
        }
        let len = self.unit.code.len();
        let mut bc = 0;
        while bc < len {
            self.bc = bc;
            let op = Op::from_word(self.unit.code[bc])
                .ok_or_else(|| self.err("unknown opcode"))?;
            if bc + op.length() > len {
                return Err(self.err("truncated instruction"));
            }
            let mut targets: Vec<usize> = Vec::new();
            match op {
                Op::Jmp | Op::Loop => targets.push(self.jump_target(1)),
                Op::JTrue | Op::JFalse | Op::LoopIfTrue => targets.push(self.jump_target(2)),
                Op::JNless | Op::LoopIfLess | Op::LoopIfLessEq => {
                    targets.push(self.jump_target(3))
                }
                Op::SwitchImm => {
                    let table_index = self.operand(1) as usize;
                    let table = self
                        .unit
                        .switch_tables
                        .get(table_index)
                        .ok_or_else(|| self.err("switch table index out of range"))?;
                    targets.push(self.jump_target(2));
                    for &offset in &table.offsets {
                        if offset != 0 {
                            targets.push((bc as i64 + offset as i64) as usize);
                        }
                    }
                }
                _ => {}
            }
            for t in targets {
                if t >= len {
                    return Err(self.err("jump target out of range"));
                }
                self.labels[t].used = true;
            }
            bc += op.length();
        }
        for h in &self.unit.handlers {
            let t = h.target as usize;
            if t >= len {
                self.bc = 0;
                return Err(self.err("exception handler target out of range"));
            }
            self.labels[t].used = true;
        }
        Ok(())
    }

    /// Function prologue: capture the return address into the frame header
    /// and bound-check the frame against the register file.
    fn emit_prologue(&mut self) {
        let num_regs = self.unit.num_regs as i32;
        let mut asm = self.asm();
        asm.pop(regs::SCRATCH2);
        asm.mov_mr(regs::FRAME, frame::RETURN_PC * 8, regs::SCRATCH2);
        asm.lea(regs::SCRATCH2, regs::FRAME, num_regs * 8);
        asm.cmp_rm(regs::SCRATCH2, regs::CTX, ctx_off::RF_END);
        let b = self.emit_branch(Cond::A);
        self.rf_branch = Some(b);
        self.after_rf_check = self.buf.len();
    }

    /// Walk the bytecode once, binding one label per opcode and emitting
    /// its fast path (or full stub delegation). Advancement is always by
    /// the length of the opcode actually compiled.
    fn main_pass(&mut self) -> Result<(), CompileError> {
        let len = self.unit.code.len();
        self.bc = 0;
        while self.bc < len {
            let op = Op::from_word(self.unit.code[self.bc]).unwrap();
            if self.labels[self.bc].used {
                self.kill_cached_result();
            }
            self.labels[self.bc].offset = self.buf.len();
            let entry = opcode_entry(op);
            (entry.emit)(self)?;
            self.bc += op.length();
        }
        self.labels[len].offset = self.buf.len();
        Ok(())
    }

    /// Consume the slow-case queue strictly in recorded order. Each group
    /// maps 1:1 to one opcode; the asserts below are the ordering
    /// invariant and fire rather than let inconsistent code escape.
    fn slow_case_pass(&mut self) -> Result<(), CompileError> {
        let mut iter = SlowCases {
            entries: mem::take(&mut self.slow_cases),
            pos: 0,
        };
        while let Some(bc) = iter.peek_bc() {
            self.bc = bc;
            self.kill_cached_result();
            let op = Op::from_word(self.unit.code[bc]).unwrap();
            let slow = opcode_entry(op)
                .slow
                .unwrap_or_else(|| panic!("{} has no slow path", op.name()));
            slow(self, &mut iter)?;
            assert_ne!(
                iter.peek_bc(),
                Some(bc),
                "not enough guards consumed in slow-case codegen for {}",
                op.name()
            );
            assert_eq!(
                iter.last_bc(),
                Some(bc),
                "too many guards consumed in slow-case codegen for {}",
                op.name()
            );
            // Rejoin the hot path at the following opcode.
            self.bc += op.length();
            let j = self.emit_jump();
            self.add_jump(j, self.bc);
        }
        assert!(
            self.slow_cases.is_empty(),
            "slow-path code may not queue new slow cases"
        );
        assert_eq!(
            self.prop_site_cursor,
            self.prop_sites.len(),
            "property-access sites left unfinished by the slow-case pass"
        );
        assert_eq!(
            self.call_site_cursor,
            self.call_sites.len(),
            "call sites left unfinished by the slow-case pass"
        );
        Ok(())
    }

    /// Out-of-line landing pad for the prologue's bound check: ask the
    /// grow-or-fail stub, then resume at the function head (reached only
    /// if growth ever becomes possible).
    fn emit_register_file_tail(&mut self) -> Result<(), CompileError> {
        self.bc = 0;
        let b = self.rf_branch.take().expect("prologue not emitted");
        self.link_here(b);
        let num_regs = self.unit.num_regs as i64;
        self.emit_stub_call(StubId::RegisterFileCheck, &[StubArg::Imm(num_regs)])?;
        self.emit_exception_check();
        let j = self.emit_jump();
        let target = self.after_rf_check;
        self.link_to(j, target);
        Ok(())
    }

    /// Shared per-function unwind path: ask the runtime for a handler in
    /// this frame; jump to it, or return to the caller with the exception
    /// still pending.
    fn emit_exception_tail(&mut self) -> Result<(), CompileError> {
        self.bc = 0;
        let at = self.buf.len();
        for j in mem::take(&mut self.exception_jumps) {
            self.link_to(j, at);
        }
        self.emit_stub_call(StubId::Unwind, &[])?;
        self.asm().test_rr(regs::T0, regs::T0);
        let no_handler = self.emit_branch(Cond::E);
        self.asm().jmp_r(regs::T0);
        self.link_here(no_handler);
        let mut asm = self.asm();
        asm.mov_rm(regs::SCRATCH2, regs::FRAME, frame::RETURN_PC * 8);
        asm.mov_rm(regs::FRAME, regs::FRAME, frame::CALLER_FRAME * 8);
        asm.mov_ri32(regs::T0, tags::UNDEFINED as i32);
        asm.jmp_r(regs::SCRATCH2);
        // The unwind stub's own exception check would recurse; the jump
        // list must be fully drained here.
        assert!(self.exception_jumps.is_empty());
        Ok(())
    }

    /// Resolve every deferred intra-function jump against the label table.
    /// Calls and cache anchors stay deferred for the patch step.
    fn link_pass(&mut self) -> Result<(), CompileError> {
        for rec in mem::take(&mut self.jumps) {
            let label = &self.labels[rec.target];
            if label.offset == UNBOUND {
                self.bc = rec.target;
                return Err(self.err("jump into the middle of an instruction"));
            }
            self.buf.link_rel32(rec.from.0, label.offset);
        }
        Ok(())
    }

}

// The prologue and call emitters hardcode the five header slots.
const _: () = assert!(FRAME_HEADER_WORDS == 5);

type EmitFn<'a> = fn(&mut JitCompiler<'a>) -> Result<(), CompileError>;
type SlowFn<'a> = fn(&mut JitCompiler<'a>, &mut SlowCases) -> Result<(), CompileError>;

pub(crate) struct OpcodeEntry<'a> {
    pub emit: EmitFn<'a>,
    pub slow: Option<SlowFn<'a>>,
}

macro_rules! opcode_table {
    ($($op:ident => $emit:ident $(, slow: $slow:ident)?;)*) => {
        fn opcode_entry<'a>(op: Op) -> OpcodeEntry<'a> {
            match op {
                $(Op::$op => OpcodeEntry {
                    emit: JitCompiler::$emit,
                    slow: opcode_table!(@slow $($slow)?),
                },)*
            }
        }
    };
    (@slow $slow:ident) => { Some(JitCompiler::$slow as SlowFn<'a>) };
    (@slow) => { None };
}

opcode_table! {
    Enter => emit_enter;
    Mov => emit_mov;
    Add => emit_add, slow: emit_slow_add;
    Sub => emit_sub, slow: emit_slow_sub;
    Mul => emit_mul, slow: emit_slow_mul;
    Div => emit_div;
    Mod => emit_mod, slow: emit_slow_mod;
    Neg => emit_neg, slow: emit_slow_neg;
    PreInc => emit_pre_inc, slow: emit_slow_pre_inc;
    PreDec => emit_pre_dec, slow: emit_slow_pre_dec;
    BitAnd => emit_bit_and, slow: emit_slow_bit_and;
    BitOr => emit_bit_or, slow: emit_slow_bit_or;
    BitXor => emit_bit_xor, slow: emit_slow_bit_xor;
    BitNot => emit_bit_not, slow: emit_slow_bit_not;
    Lsh => emit_lsh, slow: emit_slow_lsh;
    Rsh => emit_rsh, slow: emit_slow_rsh;
    Eq => emit_eq, slow: emit_slow_eq;
    Neq => emit_neq, slow: emit_slow_neq;
    StrictEq => emit_strict_eq, slow: emit_slow_strict_eq;
    NStrictEq => emit_nstrict_eq, slow: emit_slow_nstrict_eq;
    Less => emit_less;
    LessEq => emit_less_eq;
    Not => emit_not, slow: emit_slow_not;
    Jmp => emit_jmp_op;
    JTrue => emit_jtrue, slow: emit_slow_jtrue;
    JFalse => emit_jfalse, slow: emit_slow_jfalse;
    JNless => emit_jnless, slow: emit_slow_jnless;
    Loop => emit_loop;
    LoopIfTrue => emit_loop_if_true, slow: emit_slow_jtrue;
    LoopIfLess => emit_loop_if_less, slow: emit_slow_loop_if_less;
    LoopIfLessEq => emit_loop_if_less_eq, slow: emit_slow_loop_if_less_eq;
    SwitchImm => emit_switch_imm;
    Ret => emit_ret;
    End => emit_end;
    GetProp => emit_get_prop, slow: emit_slow_get_prop;
    PutProp => emit_put_prop, slow: emit_slow_put_prop;
    DelProp => emit_del_prop;
    GetIndex => emit_get_index, slow: emit_slow_get_index;
    PutIndex => emit_put_index, slow: emit_slow_put_index;
    GetGlobal => emit_get_global, slow: emit_slow_get_global;
    PutGlobal => emit_put_global, slow: emit_slow_put_global;
    GetScoped => emit_get_scoped;
    PutScoped => emit_put_scoped;
    Resolve => emit_resolve;
    NewObject => emit_new_object;
    NewArray => emit_new_array;
    TypeOf => emit_type_of;
    InstanceOf => emit_instance_of, slow: emit_slow_instance_of;
    ToNumber => emit_to_number, slow: emit_slow_to_number;
    Call => emit_call, slow: emit_slow_call;
    Throw => emit_throw;
    Catch => emit_catch;
}
