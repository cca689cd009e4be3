//! Runtime stubs called from generated code.
//!
//! Fixed calling convention: `extern "C" fn(ctx, a, b, c) -> u64`. The
//! caller publishes its frame pointer to `ctx.frame` before the call and
//! reloads it afterwards; stubs that reframe (arity fixups) write the new
//! frame back. Stubs never unwind through generated code: they record the
//! thrown value in `ctx.exception` and return, and the call site's
//! exception check routes control to the unwind path.

use crate::vm::bytecode::frame;
use crate::vm::heap::{CellExt, CompileState, kind};
use crate::vm::ops::{self, Thrown};
use crate::vm::value::Value;
use crate::vm::vm::ExecContext;

use super::ic::{CallCacheSlot, PropertyCacheSlot, STATE_MONO, STATE_UNINIT};
use super::patch::CompiledCode;

/// The stub calling convention.
pub type Stub = unsafe extern "C" fn(*mut ExecContext, u64, u64, u64) -> u64;

/// Identifies a runtime stub in a deferred call record; resolved to an
/// absolute address by the patch step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubId {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Lsh,
    Rsh,
    Eq,
    Neq,
    StrictEq,
    NStrictEq,
    Less,
    LessEq,
    Truthy,
    TypeOf,
    ToNumber,
    InstanceOf,
    GetProp,
    PutProp,
    DelProp,
    GetIndex,
    PutIndex,
    GetGlobal,
    PutGlobal,
    Resolve,
    NewObject,
    NewArray,
    Preempt,
    RegisterFileCheck,
    SwitchImm,
    Unwind,
    Catch,
    Throw,
    CallPrelink,
    CallLazyLink,
    CallVirtual,
}

/// Absolute address of a stub's entry point.
pub fn stub_addr(id: StubId) -> u64 {
    let f: Stub = match id {
        StubId::Add => stub_add,
        StubId::Sub => stub_sub,
        StubId::Mul => stub_mul,
        StubId::Div => stub_div,
        StubId::Mod => stub_mod,
        StubId::Neg => stub_neg,
        StubId::BitAnd => stub_bit_and,
        StubId::BitOr => stub_bit_or,
        StubId::BitXor => stub_bit_xor,
        StubId::BitNot => stub_bit_not,
        StubId::Lsh => stub_lsh,
        StubId::Rsh => stub_rsh,
        StubId::Eq => stub_eq,
        StubId::Neq => stub_neq,
        StubId::StrictEq => stub_strict_eq,
        StubId::NStrictEq => stub_nstrict_eq,
        StubId::Less => stub_less,
        StubId::LessEq => stub_less_eq,
        StubId::Truthy => stub_truthy,
        StubId::TypeOf => stub_type_of,
        StubId::ToNumber => stub_to_number,
        StubId::InstanceOf => stub_instance_of,
        StubId::GetProp => stub_get_prop,
        StubId::PutProp => stub_put_prop,
        StubId::DelProp => stub_del_prop,
        StubId::GetIndex => stub_get_index,
        StubId::PutIndex => stub_put_index,
        StubId::GetGlobal => stub_get_global,
        StubId::PutGlobal => stub_put_global,
        StubId::Resolve => stub_resolve,
        StubId::NewObject => stub_new_object,
        StubId::NewArray => stub_new_array,
        StubId::Preempt => stub_preempt,
        StubId::RegisterFileCheck => stub_register_file_check,
        StubId::SwitchImm => stub_switch_imm,
        StubId::Unwind => stub_unwind,
        StubId::Catch => stub_catch,
        StubId::Throw => stub_throw,
        StubId::CallPrelink => stub_call_prelink,
        StubId::CallLazyLink => stub_call_lazylink,
        StubId::CallVirtual => stub_call_virtual,
    };
    f as usize as u64
}

fn raise(ctx: &mut ExecContext, t: Thrown) -> u64 {
    ctx.exception = t.0.0;
    0
}

macro_rules! binary_stub {
    ($name:ident, $op:path) => {
        unsafe extern "C" fn $name(ctx: *mut ExecContext, a: u64, b: u64, _c: u64) -> u64 {
            let ctx = unsafe { &mut *ctx };
            let vm = unsafe { &mut *ctx.vm };
            match $op(vm, Value(a), Value(b)) {
                Ok(v) => v.0,
                Err(t) => raise(ctx, t),
            }
        }
    };
}

macro_rules! unary_stub {
    ($name:ident, $op:path) => {
        unsafe extern "C" fn $name(ctx: *mut ExecContext, a: u64, _b: u64, _c: u64) -> u64 {
            let ctx = unsafe { &mut *ctx };
            let vm = unsafe { &mut *ctx.vm };
            match $op(vm, Value(a)) {
                Ok(v) => v.0,
                Err(t) => raise(ctx, t),
            }
        }
    };
}

macro_rules! compare_stub {
    ($name:ident, $op:path) => {
        unsafe extern "C" fn $name(ctx: *mut ExecContext, a: u64, b: u64, _c: u64) -> u64 {
            let ctx = unsafe { &mut *ctx };
            let vm = unsafe { &mut *ctx.vm };
            match $op(vm, Value(a), Value(b)) {
                Ok(hit) => Value::bool(hit).0,
                Err(t) => raise(ctx, t),
            }
        }
    };
}

binary_stub!(stub_add, ops::add);
binary_stub!(stub_sub, ops::sub);
binary_stub!(stub_mul, ops::mul);
binary_stub!(stub_div, ops::div);
binary_stub!(stub_mod, ops::rem);
binary_stub!(stub_bit_and, ops::bit_and);
binary_stub!(stub_bit_or, ops::bit_or);
binary_stub!(stub_bit_xor, ops::bit_xor);
binary_stub!(stub_lsh, ops::lsh);
binary_stub!(stub_rsh, ops::rsh);
unary_stub!(stub_neg, ops::neg);
unary_stub!(stub_bit_not, ops::bit_not);
unary_stub!(stub_to_number, ops::to_number);
compare_stub!(stub_less, ops::less);
compare_stub!(stub_less_eq, ops::less_eq);

unsafe extern "C" fn stub_eq(_ctx: *mut ExecContext, a: u64, b: u64, _c: u64) -> u64 {
    Value::bool(ops::loose_eq(Value(a), Value(b))).0
}

unsafe extern "C" fn stub_neq(_ctx: *mut ExecContext, a: u64, b: u64, _c: u64) -> u64 {
    Value::bool(!ops::loose_eq(Value(a), Value(b))).0
}

unsafe extern "C" fn stub_strict_eq(_ctx: *mut ExecContext, a: u64, b: u64, _c: u64) -> u64 {
    Value::bool(ops::strict_eq(Value(a), Value(b))).0
}

unsafe extern "C" fn stub_nstrict_eq(_ctx: *mut ExecContext, a: u64, b: u64, _c: u64) -> u64 {
    Value::bool(!ops::strict_eq(Value(a), Value(b))).0
}

unsafe extern "C" fn stub_truthy(_ctx: *mut ExecContext, a: u64, _b: u64, _c: u64) -> u64 {
    Value::bool(Value(a).is_truthy()).0
}

unsafe extern "C" fn stub_type_of(ctx: *mut ExecContext, a: u64, _b: u64, _c: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    let vm = unsafe { &mut *ctx.vm };
    ops::type_of(vm, Value(a)).0
}

unsafe extern "C" fn stub_instance_of(ctx: *mut ExecContext, a: u64, b: u64, c: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    let vm = unsafe { &mut *ctx.vm };
    match ops::instance_of(vm, Value(a), Value(b), Value(c)) {
        Ok(hit) => Value::bool(hit).0,
        Err(t) => raise(ctx, t),
    }
}

unsafe extern "C" fn stub_get_prop(ctx: *mut ExecContext, base: u64, ic: u64, _c: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    let vm = unsafe { &mut *ctx.vm };
    let ic = unsafe { &*(ic as *const PropertyCacheSlot) };
    match ops::get_prop_for_cache(vm, Value(base), ic.sym()) {
        Ok((v, own)) => {
            if let Some((shape, slot)) = own {
                ic.note_hit(shape, slot);
            }
            v.0
        }
        Err(t) => raise(ctx, t),
    }
}

unsafe extern "C" fn stub_put_prop(ctx: *mut ExecContext, base: u64, value: u64, ic: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    let vm = unsafe { &mut *ctx.vm };
    let ic = unsafe { &*(ic as *const PropertyCacheSlot) };
    match ops::put_prop(vm, Value(base), ic.sym(), Value(value)) {
        Ok(Some((shape, slot))) => {
            ic.note_hit(shape, slot);
            Value::UNDEFINED.0
        }
        Ok(None) => Value::UNDEFINED.0,
        Err(t) => raise(ctx, t),
    }
}

unsafe extern "C" fn stub_del_prop(ctx: *mut ExecContext, base: u64, sym: u64, _c: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    let vm = unsafe { &mut *ctx.vm };
    match ops::del_prop(vm, Value(base), sym as u32) {
        Ok(v) => v.0,
        Err(t) => raise(ctx, t),
    }
}

binary_stub!(stub_get_index, ops::get_index);

unsafe extern "C" fn stub_put_index(ctx: *mut ExecContext, base: u64, index: u64, value: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    let vm = unsafe { &mut *ctx.vm };
    match ops::put_index(vm, Value(base), Value(index), Value(value)) {
        Ok(v) => v.0,
        Err(t) => raise(ctx, t),
    }
}

unsafe extern "C" fn stub_get_global(ctx: *mut ExecContext, ic: u64, _b: u64, _c: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    let vm = unsafe { &mut *ctx.vm };
    let global = vm.global;
    unsafe { stub_get_prop(ctx, global.0, ic, 0) }
}

unsafe extern "C" fn stub_put_global(ctx: *mut ExecContext, value: u64, ic: u64, _c: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    let vm = unsafe { &mut *ctx.vm };
    let global = vm.global;
    unsafe { stub_put_prop(ctx, global.0, value, ic) }
}

unsafe extern "C" fn stub_resolve(ctx: *mut ExecContext, sym: u64, _b: u64, _c: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    let vm = unsafe { &mut *ctx.vm };
    let global = vm.global;
    match ops::get_prop(vm, global, sym as u32) {
        Ok(v) if !v.is_undefined() => v.0,
        Ok(_) => {
            let name = vm.symbols.name(sym as u32).to_string();
            let msg = format!("unresolved identifier: {name}");
            let t = Thrown(vm.intern_string(&msg));
            raise(ctx, t)
        }
        Err(t) => raise(ctx, t),
    }
}

unsafe extern "C" fn stub_new_object(ctx: *mut ExecContext, _a: u64, _b: u64, _c: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    let vm = unsafe { &mut *ctx.vm };
    vm.new_object().0
}

unsafe extern "C" fn stub_new_array(ctx: *mut ExecContext, len: u64, _b: u64, _c: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    let vm = unsafe { &mut *ctx.vm };
    let len = Value(len);
    let len = if len.is_int() { len.as_int().max(0) as usize } else { 0 };
    vm.heap.alloc_array(len).0
}

/// Cooperative preemption poll. Returns the refill value for the countdown
/// register; a pending cancellation raises an exception the following
/// check observes.
unsafe extern "C" fn stub_preempt(ctx: *mut ExecContext, _a: u64, _b: u64, _c: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    ctx.preempt_ticks += 1;
    if ctx.cancel != 0 {
        let vm = unsafe { &mut *ctx.vm };
        ctx.exception = vm.intern_string("execution cancelled").0;
    }
    ctx.preempt_interval.max(1)
}

/// The register file cannot grow, so "grow or fail" resolves to a
/// script-visible exception.
unsafe extern "C" fn stub_register_file_check(
    ctx: *mut ExecContext,
    _num_regs: u64,
    _b: u64,
    _c: u64,
) -> u64 {
    let ctx = unsafe { &mut *ctx };
    let vm = unsafe { &mut *ctx.vm };
    let t = Thrown(vm.intern_string("call stack exhausted"));
    raise(ctx, t)
}

/// Compiled code of the function owning `frame`.
unsafe fn frame_code(frame: *mut u64) -> Option<std::sync::Arc<CompiledCode>> {
    let callee = Value(unsafe { *frame.offset(frame::CALLEE as isize) });
    if !callee.is_cell() {
        return None;
    }
    let cell = unsafe { &*callee.as_cell() };
    match &cell.ext {
        CellExt::Function {
            state: CompileState::Compiled(code),
            ..
        } => Some(std::sync::Arc::clone(code)),
        _ => None,
    }
}

unsafe extern "C" fn stub_switch_imm(
    ctx: *mut ExecContext,
    scrutinee: u64,
    table_index: u64,
    _c: u64,
) -> u64 {
    let ctx = unsafe { &mut *ctx };
    let code = unsafe { frame_code(ctx.frame) }.expect("switch outside compiled frame");
    code.switch_target(table_index as usize, Value(scrutinee))
}

/// Find the handler for the in-flight exception in the current frame.
/// Returns the handler's native address, or zero to keep unwinding into
/// the caller.
unsafe extern "C" fn stub_unwind(ctx: *mut ExecContext, _a: u64, _b: u64, _c: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    let frame = ctx.frame;
    let callee = Value(unsafe { *frame.offset(frame::CALLEE as isize) });
    let Some(code) = (unsafe { frame_code(frame) }) else {
        return 0;
    };
    let cell = unsafe { &*callee.as_cell() };
    let CellExt::Function { unit, .. } = &cell.ext else {
        return 0;
    };
    let offset = ctx.fault_offset as u32;
    match unit.handler_for(offset) {
        Some(h) => {
            tracing::trace!(offset, target = h.target, "unwinding to handler");
            code.native_addr_of(h.target)
        }
        None => {
            tracing::trace!(offset, "no handler, propagating to caller");
            0
        }
    }
}

unsafe extern "C" fn stub_catch(ctx: *mut ExecContext, _a: u64, _b: u64, _c: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    std::mem::take(&mut ctx.exception)
}

unsafe extern "C" fn stub_throw(ctx: *mut ExecContext, value: u64, _b: u64, _c: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    ctx.exception = if value == 0 { Value::UNDEFINED.0 } else { value };
    0
}

// ==================== call linking ====================

/// Write the pieces of the callee frame the guarded fast path skipped:
/// the scope chain, and undefined fill for missing arguments.
unsafe fn prepare_callee_frame(ctx: &mut ExecContext, callee: Value) {
    if !callee.is_cell() {
        return;
    }
    let frame = ctx.frame;
    let cell = unsafe { &*callee.as_cell() };
    unsafe {
        *frame.offset(frame::SCOPE_CHAIN as isize) = cell.w2;
    }
    if cell.kind == kind::FUNCTION {
        let argc = unsafe { *frame.offset(frame::ARG_COUNT as isize) } as usize;
        let arity = cell.w1 as usize;
        for i in argc..arity {
            let slot = unsafe { frame.add(i) };
            // Never write past the register file; the callee's own bound
            // check raises before it could read these.
            if slot >= ctx.rf_end {
                break;
            }
            unsafe { *slot = Value::UNDEFINED.0 };
        }
    }
}

/// Entry address for a callee: its compiled entry, or the native-call
/// thunk for natively-implemented functions.
unsafe fn callee_entry(ctx: &mut ExecContext, callee: Value) -> Result<u64, Thrown> {
    let vm = unsafe { &mut *ctx.vm };
    if !callee.is_cell() {
        return Err(vm.type_error("value is not callable"));
    }
    let cell = unsafe { &*callee.as_cell() };
    match cell.kind {
        kind::NATIVE => Ok(vm.jit.as_ref().unwrap().trampolines.native_thunk_addr()),
        kind::FUNCTION => match crate::jit::ensure_compiled(vm, callee) {
            Ok(entry) => Ok(entry as u64),
            Err(e) => {
                let msg = format!("compilation failed: {e}");
                Err(Thrown(vm.intern_string(&msg)))
            }
        },
        _ => Err(vm.type_error("value is not callable")),
    }
}

unsafe fn call_dispatch(
    ctx: *mut ExecContext,
    ic: u64,
    mode: CallMode,
) -> u64 {
    let ctx = unsafe { &mut *ctx };
    let ic = unsafe { &*(ic as *const CallCacheSlot) };
    let callee = Value(unsafe { *ctx.frame.offset(frame::CALLEE as isize) });
    unsafe { prepare_callee_frame(ctx, callee) };
    let entry = match unsafe { callee_entry(ctx, callee) } {
        Ok(e) => e,
        Err(t) => return raise(ctx, t),
    };
    let vm = unsafe { &mut *ctx.vm };
    let tramps = &vm.jit.as_ref().unwrap().trampolines;
    match mode {
        CallMode::Prelink => {
            // First call through this site: the callee now has code, but
            // linking is deferred one call so hot startup paths do not pin
            // one-shot callees.
            ic.set_slow_target(tramps.lazy_link_addr());
        }
        CallMode::LazyLink => {
            let argc = unsafe { *ctx.frame.offset(frame::ARG_COUNT as isize) };
            let cell = unsafe { &*callee.as_cell() };
            let arity_matches = cell.kind == kind::NATIVE || argc == cell.w1;
            if ic.state() == STATE_UNINIT && arity_matches {
                ic.link_monomorphic(callee.0, entry, tramps.virtual_call_addr());
            } else {
                // Not linkable (arity adaption needed); dispatch
                // generically from now on.
                ic.set_slow_target(tramps.virtual_call_addr());
            }
        }
        CallMode::Virtual => {
            if ic.state() == STATE_MONO && ic.cached_callee() != callee.0 {
                ic.go_megamorphic();
            }
        }
    }
    entry
}

#[derive(Clone, Copy)]
enum CallMode {
    Prelink,
    LazyLink,
    Virtual,
}

unsafe extern "C" fn stub_call_prelink(ctx: *mut ExecContext, ic: u64, _b: u64, _c: u64) -> u64 {
    unsafe { call_dispatch(ctx, ic, CallMode::Prelink) }
}

unsafe extern "C" fn stub_call_lazylink(ctx: *mut ExecContext, ic: u64, _b: u64, _c: u64) -> u64 {
    unsafe { call_dispatch(ctx, ic, CallMode::LazyLink) }
}

unsafe extern "C" fn stub_call_virtual(ctx: *mut ExecContext, ic: u64, _b: u64, _c: u64) -> u64 {
    unsafe { call_dispatch(ctx, ic, CallMode::Virtual) }
}
