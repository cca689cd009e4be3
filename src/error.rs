//! Error types.

use crate::vm::value::Value;

/// A failure to compile one function body. Compilation is all-or-nothing:
/// on error nothing was published and the caller may fall back to the
/// interpreter.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("malformed bytecode in `{unit}` at offset {offset}: {reason}")]
    MalformedBytecode {
        unit: String,
        offset: usize,
        reason: String,
    },
    #[error("executable memory exhausted")]
    OutOfExecutableMemory,
    #[error("the JIT does not support this target")]
    UnsupportedTarget,
}

/// Runtime failure surfaced to the host.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// An uncaught script exception. Carries the thrown value and a
    /// human-readable rendering of it.
    #[error("uncaught exception: {message}")]
    Uncaught { value: Value, message: String },
    #[error("execution cancelled")]
    Cancelled,
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("value is not callable")]
    NotCallable,
}
