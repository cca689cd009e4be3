//! JIT compilation infrastructure.
//!
//! - executable memory allocation and pooling
//! - a code buffer and x86-64 instruction encoding
//! - the two-pass baseline compiler with link and patch steps
//! - inline-cache slots and the shared trampolines that drive call linking
//!
//! The instruction encoder, code buffer and cache slots build everywhere;
//! code generation and execution are x86-64/unix only. Builds without the
//! `jit` feature, or on other targets, run the interpreter.

pub mod codebuf;
pub mod ic;
pub mod x86_64;

#[cfg(all(target_arch = "x86_64", unix))]
pub mod access;
#[cfg(all(target_arch = "x86_64", unix))]
pub mod arith;
#[cfg(all(target_arch = "x86_64", unix))]
pub mod calls;
#[cfg(all(target_arch = "x86_64", unix))]
pub mod compiler;
#[cfg(all(target_arch = "x86_64", unix))]
pub mod memory;
#[cfg(all(target_arch = "x86_64", unix))]
pub mod opcodes;
#[cfg(all(target_arch = "x86_64", unix))]
pub mod patch;
#[cfg(all(target_arch = "x86_64", unix))]
pub mod stubs;
#[cfg(all(target_arch = "x86_64", unix))]
pub mod thunks;

#[cfg(all(target_arch = "x86_64", unix))]
pub use runtime::{JitRuntime, ensure_compiled};

#[cfg(all(target_arch = "x86_64", unix))]
mod runtime {
    use std::sync::Arc;

    use crate::config::RuntimeConfig;
    use crate::error::CompileError;
    use crate::vm::heap::{CellExt, CompileState};
    use crate::vm::value::Value;
    use crate::vm::vm::VmCore;

    use super::compiler::{self, CompileEnv};
    use super::memory::ExecutablePool;
    use super::thunks::TrampolineSet;

    /// Shared JIT state owned by one VM: the executable pool and the
    /// trampoline set.
    pub struct JitRuntime {
        pub pool: ExecutablePool,
        pub trampolines: TrampolineSet,
    }

    impl JitRuntime {
        pub fn new(config: &RuntimeConfig) -> Result<Self, CompileError> {
            let pool = ExecutablePool::new(config.pool_chunk_bytes);
            let trampolines = TrampolineSet::generate(&pool)?;
            Ok(JitRuntime { pool, trampolines })
        }
    }

    /// Get a function's native entry point, compiling it on first demand.
    /// Drives the per-function {uncompiled, compiling, compiled} machine;
    /// compilation is synchronous and runs to completion before anything
    /// can execute the result.
    pub fn ensure_compiled(core: &mut VmCore, f: Value) -> Result<*const u8, CompileError> {
        let cell = unsafe { &mut *f.as_cell() };
        let CellExt::Function { unit, state } = &mut cell.ext else {
            unreachable!("ensure_compiled on a non-function cell");
        };
        match state {
            CompileState::Compiled(code) => return Ok(code.entry()),
            CompileState::Compiling => {
                unreachable!("re-entered compilation of `{}`", unit.name)
            }
            CompileState::Uncompiled => {}
        }
        *state = CompileState::Compiling;
        let unit = Arc::clone(unit);
        let jit = core.jit.as_ref().expect("JIT runtime not initialized");
        let env = CompileEnv {
            global: core.global.0,
            pool: &jit.pool,
            trampolines: &jit.trampolines,
        };
        let result = compiler::compile(&unit, &env);
        let CellExt::Function { state, .. } = &mut cell.ext else {
            unreachable!();
        };
        match result {
            Ok(code) => {
                let entry = code.entry();
                cell.w0 = entry as u64;
                *state = CompileState::Compiled(code);
                Ok(entry)
            }
            Err(e) => {
                *state = CompileState::Uncompiled;
                Err(e)
            }
        }
    }
}
