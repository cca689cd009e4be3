//! The virtual machine runtime: heap, globals, register file, and the
//! execution context shared with generated code.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::error::VmError;
use crate::vm::bytecode::{CodeUnit, FRAME_HEADER_WORDS, frame};
use crate::vm::heap::{Heap, kind};
use crate::vm::ops::{self, Thrown};
use crate::vm::shapes::{ShapeTable, Sym, SymbolTable};
use crate::vm::value::Value;
use crate::vm::interp;

/// Per-execution state addressed by generated code at fixed offsets.
///
/// The JIT publishes the live frame pointer here around every runtime-stub
/// call and reloads it afterwards; stubs signal exceptions by storing the
/// thrown value into `exception`, and every throwing call site tests that
/// slot immediately after the call returns.
#[repr(C)]
pub struct ExecContext {
    /// Current frame pointer (register 0 of the active frame).
    pub frame: *mut u64,
    /// Thrown value bits; zero means no exception in flight.
    pub exception: u64,
    /// Bytecode offset of the site that observed the exception.
    pub fault_offset: u64,
    /// One-past-the-end of the register file.
    pub rf_end: *mut u64,
    /// Loop-back edges between preemption polls.
    pub preempt_interval: u64,
    /// Nonzero requests cooperative cancellation.
    pub cancel: u64,
    /// Number of preemption polls taken.
    pub preempt_ticks: u64,
    /// Owning VM; opaque to generated code.
    pub vm: *mut VmCore,
}

/// Field offsets into [`ExecContext`] for the code generator.
pub mod ctx_off {
    use super::ExecContext;
    use std::mem::offset_of;

    pub const FRAME: i32 = offset_of!(ExecContext, frame) as i32;
    pub const EXCEPTION: i32 = offset_of!(ExecContext, exception) as i32;
    pub const FAULT_OFFSET: i32 = offset_of!(ExecContext, fault_offset) as i32;
    pub const RF_END: i32 = offset_of!(ExecContext, rf_end) as i32;
    pub const PREEMPT_INTERVAL: i32 = offset_of!(ExecContext, preempt_interval) as i32;
}

/// Everything the runtime owns besides the execution context.
pub struct VmCore {
    pub config: RuntimeConfig,
    pub heap: Heap,
    pub shapes: ShapeTable,
    pub symbols: SymbolTable,
    /// The global object.
    pub global: Value,
    /// Root of the default scope chain.
    pub root_scope: Value,
    register_file: Box<[u64]>,
    string_cache: HashMap<String, Value>,
    #[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
    pub jit: Option<crate::jit::JitRuntime>,
}

impl VmCore {
    fn new(config: RuntimeConfig) -> Self {
        let words = config.register_file_words.max(FRAME_HEADER_WORDS + 1);
        let mut core = VmCore {
            config,
            heap: Heap::new(),
            shapes: ShapeTable::new(),
            symbols: SymbolTable::new(),
            global: Value::UNDEFINED,
            root_scope: Value::UNDEFINED,
            register_file: vec![0u64; words].into_boxed_slice(),
            string_cache: HashMap::new(),
            #[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
            jit: None,
        };
        core.global = core.heap.alloc_object(ShapeTable::ROOT, Value::NULL);
        core.root_scope = core.heap.alloc_scope(Value::NULL, 0);
        core
    }

    pub fn rf_base(&mut self) -> *mut u64 {
        self.register_file.as_mut_ptr()
    }

    pub fn rf_end(&mut self) -> *mut u64 {
        unsafe { self.register_file.as_mut_ptr().add(self.register_file.len()) }
    }

    /// Interned string cell for `s`.
    pub fn intern_string(&mut self, s: &str) -> Value {
        if let Some(&v) = self.string_cache.get(s) {
            return v;
        }
        let v = self.heap.alloc_string(s);
        self.string_cache.insert(s.to_string(), v);
        v
    }

    /// Build a thrown type error.
    pub fn type_error(&mut self, msg: &str) -> Thrown {
        Thrown(self.intern_string(msg))
    }

    pub fn new_object(&mut self) -> Value {
        self.heap.alloc_object(ShapeTable::ROOT, Value::NULL)
    }

    pub fn new_object_with_proto(&mut self, proto: Value) -> Value {
        self.heap.alloc_object(ShapeTable::ROOT, proto)
    }

    /// Lay out the entry frame for `callee` at the bottom of the register
    /// file and return its frame pointer. Writes are clamped to the file;
    /// an undersized file is caught by the callee's own bound check.
    pub fn build_entry_frame(&mut self, callee: Value, args: &[Value]) -> *mut u64 {
        let scope = if callee.is_cell() {
            Value(unsafe { (*callee.as_cell()).w2 })
        } else {
            self.root_scope
        };
        let capacity = self.register_file.len() - FRAME_HEADER_WORDS;
        unsafe {
            let base = self.rf_base().add(FRAME_HEADER_WORDS);
            *base.offset(frame::RETURN_PC as isize) = 0;
            *base.offset(frame::CALLER_FRAME as isize) = 0;
            *base.offset(frame::CALLEE as isize) = callee.0;
            *base.offset(frame::ARG_COUNT as isize) = args.len() as u64;
            *base.offset(frame::SCOPE_CHAIN as isize) = scope.0;
            for (i, a) in args.iter().take(capacity).enumerate() {
                *base.add(i) = a.0;
            }
            // Missing arguments read as undefined.
            let arity = if callee.is_cell()
                && (*callee.as_cell()).kind == kind::FUNCTION
            {
                (*callee.as_cell()).w1 as usize
            } else {
                0
            };
            for i in args.len()..arity.min(capacity) {
                *base.add(i) = Value::UNDEFINED.0;
            }
            base
        }
    }
}

/// The embedding-facing VM handle.
pub struct VmRuntime {
    inner: Box<VmInner>,
}

struct VmInner {
    core: VmCore,
    ctx: ExecContext,
}

impl VmRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        let preempt = config.preempt_interval.max(1) as u64;
        let mut inner = Box::new(VmInner {
            core: VmCore::new(config),
            ctx: ExecContext {
                frame: std::ptr::null_mut(),
                exception: 0,
                fault_offset: 0,
                rf_end: std::ptr::null_mut(),
                preempt_interval: preempt,
                cancel: 0,
                preempt_ticks: 0,
                vm: std::ptr::null_mut(),
            },
        });
        inner.ctx.vm = &mut inner.core;
        inner.ctx.rf_end = inner.core.rf_end();
        VmRuntime { inner }
    }

    pub fn core_mut(&mut self) -> &mut VmCore {
        &mut self.inner.core
    }

    pub fn ctx_mut(&mut self) -> &mut ExecContext {
        &mut self.inner.ctx
    }

    pub fn intern(&mut self, name: &str) -> Sym {
        self.inner.core.symbols.intern(name)
    }

    /// Wrap a code unit into a callable function value closing over the
    /// root scope.
    pub fn make_function(&mut self, unit: CodeUnit) -> Value {
        let scope = self.inner.core.root_scope;
        self.make_closure(unit, scope)
    }

    /// Wrap a code unit into a callable function closing over `scope`.
    pub fn make_closure(&mut self, unit: CodeUnit, scope: Value) -> Value {
        self.inner.core.heap.alloc_function(Arc::new(unit), scope)
    }

    pub fn root_scope(&self) -> Value {
        self.inner.core.root_scope
    }

    /// Allocate a scope-chain node with `slots` variables.
    pub fn new_scope(&mut self, parent: Value, slots: usize) -> Value {
        self.inner.core.heap.alloc_scope(parent, slots)
    }

    pub fn scope_slot(&self, scope: Value, slot: usize) -> Value {
        let cell = unsafe { &*scope.as_cell() };
        unsafe { *(cell.w0 as *const Value).add(slot) }
    }

    pub fn set_scope_slot(&mut self, scope: Value, slot: usize, v: Value) {
        let cell = unsafe { &*scope.as_cell() };
        unsafe { *(cell.w0 as *mut Value).add(slot) = v }
    }

    /// Render a value for test assertions and diagnostics.
    pub fn describe(&self, v: Value) -> String {
        ops::describe(v)
    }

    /// The finalized code object behind a compiled function, if any:
    /// entry point, exception-handler table, call-return offsets and the
    /// inline-cache site tables.
    #[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
    pub fn compiled(&self, f: Value) -> Option<Arc<crate::jit::patch::CompiledCode>> {
        use crate::vm::heap::{CellExt, CompileState};
        if !f.is_cell() {
            return None;
        }
        let cell = unsafe { &*f.as_cell() };
        match &cell.ext {
            CellExt::Function {
                state: CompileState::Compiled(code),
                ..
            } => Some(Arc::clone(code)),
            _ => None,
        }
    }

    pub fn register_native(
        &mut self,
        name: &str,
        arity: usize,
        f: crate::vm::heap::NativeFn,
    ) -> Value {
        let v = self.inner.core.heap.alloc_native(f, name, arity);
        self.set_global(name, v);
        v
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        let core = &mut self.inner.core;
        let sym = core.symbols.intern(name);
        let global = core.global;
        ops::put_prop(core, global, sym, value).expect("global object store cannot fail");
    }

    pub fn get_global(&mut self, name: &str) -> Value {
        let core = &mut self.inner.core;
        let sym = core.symbols.intern(name);
        let global = core.global;
        ops::get_prop(core, global, sym).expect("global object load cannot fail")
    }

    /// Request cooperative cancellation; takes effect at the next
    /// preemption poll.
    pub fn cancel(&mut self) {
        self.inner.ctx.cancel = 1;
    }

    pub fn clear_cancel(&mut self) {
        self.inner.ctx.cancel = 0;
    }

    /// Number of preemption polls taken so far.
    pub fn preempt_ticks(&self) -> u64 {
        self.inner.ctx.preempt_ticks
    }

    /// Call a function value with the given arguments.
    pub fn call(&mut self, f: Value, args: &[Value]) -> Result<Value, VmError> {
        if !f.is_cell() {
            return Err(VmError::NotCallable);
        }
        let k = unsafe { (*f.as_cell()).kind };
        match k {
            kind::FUNCTION => {
                if self.inner.core.config.jit_enabled() {
                    self.call_jit(f, args)
                } else {
                    self.call_interp(f, args)
                }
            }
            kind::NATIVE => self.call_native(f, args),
            _ => Err(VmError::NotCallable),
        }
    }

    fn call_interp(&mut self, f: Value, args: &[Value]) -> Result<Value, VmError> {
        let inner = &mut *self.inner;
        match interp::call_function(&mut inner.core, &mut inner.ctx, f, args) {
            Ok(v) => Ok(v),
            Err(thrown) => Err(self.uncaught(thrown.0)),
        }
    }

    fn call_native(&mut self, f: Value, args: &[Value]) -> Result<Value, VmError> {
        // No Rust borrow of the VM may be live while foreign code runs;
        // it reaches the VM through the context's raw pointer.
        let (ctx_ptr, frame, func) = {
            let inner = &mut *self.inner;
            let frame = inner.core.build_entry_frame(f, args);
            inner.ctx.frame = frame;
            inner.ctx.exception = 0;
            let func = unsafe { (*f.as_cell()).w0 };
            let func: crate::vm::heap::NativeFn =
                unsafe { std::mem::transmute(func as usize) };
            (&raw mut inner.ctx, frame, func)
        };
        let ret = unsafe { func(ctx_ptr, frame, f.0) };
        if self.inner.ctx.exception != 0 {
            let thrown = Value(std::mem::take(&mut self.inner.ctx.exception));
            return Err(self.uncaught(thrown));
        }
        Ok(Value(ret))
    }

    #[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
    fn call_jit(&mut self, f: Value, args: &[Value]) -> Result<Value, VmError> {
        // Generated code re-enters the VM through the context's raw vm
        // pointer, so no Rust borrow may be live across the enter call.
        let (enter, entry, ctx_ptr, frame) = {
            let inner = &mut *self.inner;
            if inner.core.jit.is_none() {
                inner.core.jit = Some(crate::jit::JitRuntime::new(&inner.core.config)?);
            }
            let entry = crate::jit::ensure_compiled(&mut inner.core, f)?;
            let frame = inner.core.build_entry_frame(f, args);
            inner.ctx.frame = frame;
            inner.ctx.exception = 0;
            inner.ctx.fault_offset = 0;
            inner.ctx.rf_end = inner.core.rf_end();
            let enter = inner.core.jit.as_ref().unwrap().trampolines.enter_fn();
            (enter, entry, &raw mut inner.ctx, frame)
        };
        let ret = unsafe { enter(entry as u64, ctx_ptr, frame) };
        if self.inner.ctx.exception != 0 {
            let thrown = Value(std::mem::take(&mut self.inner.ctx.exception));
            return Err(self.uncaught(thrown));
        }
        Ok(Value(ret))
    }

    #[cfg(not(all(feature = "jit", target_arch = "x86_64", unix)))]
    fn call_jit(&mut self, f: Value, args: &[Value]) -> Result<Value, VmError> {
        self.call_interp(f, args)
    }

    fn uncaught(&mut self, value: Value) -> VmError {
        if self.inner.ctx.cancel != 0 {
            return VmError::Cancelled;
        }
        VmError::Uncaught {
            value,
            message: ops::describe(value),
        }
    }
}
