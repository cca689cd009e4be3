//! magpie - a baseline JIT compiler for a dynamically-typed register VM.
//!
//! Bytecode goes in, self-contained executable code comes out: one linear
//! main pass emitting guarded fast paths, an ordered slow-case pass, a link
//! pass for intra-function jumps, and a patch/finalize step that resolves
//! absolute references once the code reaches executable memory. Call sites
//! and property accesses specialize themselves at runtime through inline
//! caches and a small set of shared trampolines.

pub mod config;
pub mod error;
#[cfg(feature = "jit")]
pub mod jit;
pub mod vm;

pub use config::{JitMode, RuntimeConfig};
pub use error::{CompileError, VmError};
pub use vm::{CodeUnit, Op, UnitBuilder, Value, VmRuntime};
