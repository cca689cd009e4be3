//! Shared trampolines.
//!
//! One set per VM, generated once into pooled executable memory:
//!
//! - **host entry**: adapts the Rust calling convention to the compiled
//!   register convention and back,
//! - **pre-link / lazy-link / virtual call**: the three stages of call-site
//!   linking, entered through a call cache slot's slow target,
//! - **native-call thunk**: adapts a compiled call into the native-function
//!   convention and checks the exception slot on return.
//!
//! Call trampolines are entered by `call [ic + slow_target]` with the
//! callee frame already active and the cache-slot address in the scratch
//! register; they delegate the linking decision to a runtime stub and then
//! jump to whatever entry it returns.

use crate::error::CompileError;
use crate::vm::bytecode::frame;
use crate::vm::heap::layout as cell;
use crate::vm::value::tags;
use crate::vm::vm::{ExecContext, ctx_off};

use super::codebuf::CodeBuffer;
use super::compiler::regs;
use super::memory::{ExecutableAlloc, ExecutablePool};
use super::stubs::{StubId, stub_addr};
use super::x86_64::{Asm, Cond, Reg};

/// Host-entry signature: `(entry, ctx, frame) -> result bits`.
pub type EnterFn = unsafe extern "C" fn(u64, *mut ExecContext, *mut u64) -> u64;

pub struct TrampolineSet {
    alloc: ExecutableAlloc,
    enter: usize,
    prelink: usize,
    lazy_link: usize,
    virtual_call: usize,
    native_thunk: usize,
}

impl TrampolineSet {
    pub fn generate(pool: &ExecutablePool) -> Result<Self, CompileError> {
        let mut buf = CodeBuffer::with_capacity(512);

        let enter = emit_enter_thunk(&mut buf);
        let prelink = emit_call_trampoline(&mut buf, StubId::CallPrelink);
        let lazy_link = emit_call_trampoline(&mut buf, StubId::CallLazyLink);
        let virtual_call = emit_call_trampoline(&mut buf, StubId::CallVirtual);
        let native_thunk = emit_native_thunk(&mut buf);

        let code = buf.into_code();
        let mut alloc = pool.acquire(code.len())?;
        alloc.memory_mut().write(0, &code)?;
        alloc.memory_mut().make_executable()?;
        tracing::debug!(bytes = code.len(), "trampolines generated");

        Ok(TrampolineSet {
            alloc,
            enter,
            prelink,
            lazy_link,
            virtual_call,
            native_thunk,
        })
    }

    fn addr(&self, offset: usize) -> u64 {
        self.alloc.as_ptr() as u64 + offset as u64
    }

    pub fn enter_fn(&self) -> EnterFn {
        unsafe { std::mem::transmute(self.addr(self.enter) as usize) }
    }

    pub fn prelink_addr(&self) -> u64 {
        self.addr(self.prelink)
    }

    pub fn lazy_link_addr(&self) -> u64 {
        self.addr(self.lazy_link)
    }

    pub fn virtual_call_addr(&self) -> u64 {
        self.addr(self.virtual_call)
    }

    pub fn native_thunk_addr(&self) -> u64 {
        self.addr(self.native_thunk)
    }
}

/// Save the host's callee-saved registers, install the compiled register
/// convention, and call into compiled code.
fn emit_enter_thunk(buf: &mut CodeBuffer) -> usize {
    buf.align(16);
    let at = buf.len();
    let mut asm = Asm::new(buf);
    asm.push(Reg::Rbp);
    asm.push(Reg::Rbx);
    asm.push(Reg::R12);
    asm.push(Reg::R13);
    asm.push(Reg::R14);
    asm.mov_rr(regs::CTX, Reg::Rsi);
    asm.mov_rr(regs::FRAME, Reg::Rdx);
    asm.mov_rm(regs::PREEMPT, regs::CTX, ctx_off::PREEMPT_INTERVAL);
    asm.call_r(Reg::Rdi);
    asm.pop(Reg::R14);
    asm.pop(Reg::R13);
    asm.pop(Reg::R12);
    asm.pop(Reg::Rbx);
    asm.pop(Reg::Rbp);
    asm.ret();
    at
}

/// The shared call-linking shape; only the consulted stub differs.
fn emit_call_trampoline(buf: &mut CodeBuffer, stub: StubId) -> usize {
    buf.align(16);
    let at = buf.len();
    let mut asm = Asm::new(buf);
    // Publish the (already entered) callee frame and ask the stub where to
    // go. The cache-slot address rides in the scratch register.
    asm.mov_mr(regs::CTX, ctx_off::FRAME, regs::FRAME);
    asm.mov_rr(Reg::Rdi, regs::CTX);
    asm.mov_rr(Reg::Rsi, regs::SCRATCH);
    asm.sub_ri32(Reg::Rsp, 8);
    asm.mov_ri64(regs::SCRATCH, stub_addr(stub));
    asm.call_r(regs::SCRATCH);
    asm.add_ri32(Reg::Rsp, 8);
    // The stub may have reframed (arity adaption).
    asm.mov_rm(regs::FRAME, regs::CTX, ctx_off::FRAME);
    asm.test_rr(Reg::Rax, Reg::Rax);
    let fail = asm.jcc_rel32(Cond::E, 0);
    asm.jmp_r(Reg::Rax);
    // Exception: leave the callee frame and return into the call site,
    // whose check-after-call picks the exception up.
    let fail_target = buf.len();
    let mut asm = Asm::new(buf);
    asm.mov_rm(regs::FRAME, regs::FRAME, frame::CALLER_FRAME * 8);
    asm.mov_ri32(Reg::Rax, tags::UNDEFINED as i32);
    asm.ret();
    buf.link_rel32(fail, fail_target);
    at
}

/// Adapt a compiled call into the native-function convention.
fn emit_native_thunk(buf: &mut CodeBuffer) -> usize {
    buf.align(16);
    let at = buf.len();
    let mut asm = Asm::new(buf);
    // Entered like a compiled function: return address on the stack.
    asm.pop(regs::SCRATCH2);
    asm.mov_mr(regs::FRAME, frame::RETURN_PC * 8, regs::SCRATCH2);
    asm.mov_mr(regs::CTX, ctx_off::FRAME, regs::FRAME);
    // Fetch the native entry out of the callee cell and marshal
    // (ctx, frame, callee).
    asm.mov_rm(Reg::Rdx, regs::FRAME, frame::CALLEE * 8);
    asm.mov_rm(regs::SCRATCH, Reg::Rdx, cell::W0);
    asm.mov_rr(Reg::Rdi, regs::CTX);
    asm.mov_rr(Reg::Rsi, regs::FRAME);
    asm.call_r(regs::SCRATCH);
    // Decide between normal return and unwind.
    asm.cmp_mi8(regs::CTX, ctx_off::EXCEPTION, 0);
    let unwound = asm.jcc_rel32(Cond::Ne, 0);
    asm.mov_rm(regs::SCRATCH2, regs::FRAME, frame::RETURN_PC * 8);
    asm.mov_rm(regs::FRAME, regs::FRAME, frame::CALLER_FRAME * 8);
    asm.jmp_r(regs::SCRATCH2);
    let unwound_target = buf.len();
    let mut asm = Asm::new(buf);
    asm.mov_rm(regs::SCRATCH2, regs::FRAME, frame::RETURN_PC * 8);
    asm.mov_rm(regs::FRAME, regs::FRAME, frame::CALLER_FRAME * 8);
    asm.mov_ri32(Reg::Rax, tags::UNDEFINED as i32);
    asm.jmp_r(regs::SCRATCH2);
    buf.link_rel32(unwound, unwound_target);
    at
}
