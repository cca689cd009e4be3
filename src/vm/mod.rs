//! The virtual machine: values, bytecode, heap, shared semantics, and the
//! reference interpreter the JIT is measured against.

pub mod bytecode;
pub mod heap;
pub mod interp;
pub mod ops;
pub mod shapes;
pub mod value;
#[allow(clippy::module_inception)]
pub mod vm;

pub use bytecode::{CodeUnit, Op, UnitBuilder};
pub use value::Value;
pub use vm::{ExecContext, VmCore, VmRuntime};
