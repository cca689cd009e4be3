//! Heap cells and the arena that owns them.
//!
//! Cells have a fixed `#[repr(C)]` head so generated code can guard on kind
//! and shape and reach the hot payload words at constant offsets. The
//! Rust-only `ext` tail owns the backing storage; helpers that grow storage
//! are responsible for refreshing the raw payload words.
//!
//! There is no garbage collector here: cells live as long as the arena.
//! Collection belongs to the embedding runtime, which this crate treats as
//! an external collaborator.

use std::sync::Arc;

use crate::vm::bytecode::CodeUnit;
use crate::vm::shapes::{SHAPE_NON_OBJECT, ShapeId};
use crate::vm::value::Value;

#[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
use crate::jit::patch::CompiledCode;

/// Cell kind tags, readable from generated code at offset 0.
pub mod kind {
    pub const OBJECT: u32 = 1;
    pub const ARRAY: u32 = 2;
    pub const FUNCTION: u32 = 3;
    pub const NATIVE: u32 = 4;
    pub const NUMBER: u32 = 5;
    pub const STRING: u32 = 6;
    pub const SCOPE: u32 = 7;
}

/// Byte offsets into [`Cell`] used by the code generator. Checked against
/// the real layout in tests.
pub mod layout {
    pub const KIND: i32 = 0;
    pub const SHAPE: i32 = 4;
    pub const W0: i32 = 8;
    pub const W1: i32 = 16;
    pub const W2: i32 = 24;
}

/// Native function ABI: `(ctx, callee_frame, callee_value) -> value bits`.
/// Arguments live in the callee frame; the count is in its header.
pub type NativeFn =
    unsafe extern "C" fn(*mut crate::vm::vm::ExecContext, *mut u64, u64) -> u64;

/// Per-function compile state; the trampolines' 3-state call machine.
pub enum CompileState {
    Uncompiled,
    Compiling,
    #[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
    Compiled(Arc<CompiledCode>),
}

/// Rust-owned cell payloads. Raw mirror words in the cell head must be
/// refreshed whenever backing storage is touched.
pub enum CellExt {
    None,
    /// Property slots; `w0` mirrors `storage.as_ptr()`.
    Object { storage: Vec<Value> },
    /// Dense elements; `w0` mirrors the pointer, `w1` the length.
    Array { storage: Vec<Value> },
    Function {
        unit: Arc<CodeUnit>,
        state: CompileState,
    },
    Native { name: String },
    Str(String),
    /// Scope-chain node; `w0` mirrors the slot pointer, `w1` the parent
    /// scope value.
    Scope { storage: Vec<Value> },
}

/// A heap cell. Head layout (offsets in [`layout`]):
///
/// | kind     | payload w0      | payload w1   | payload w2     |
/// |----------|-----------------|--------------|----------------|
/// | object   | slot ptr        | slot count   | prototype      |
/// | array    | element ptr     | length       | -              |
/// | function | native entry/0  | arity        | captured scope |
/// | native   | fn ptr          | arity        | -              |
/// | number   | f64 bits        | -            | -              |
/// | string   | -               | length       | -              |
/// | scope    | slot ptr        | parent scope | -              |
#[repr(C)]
pub struct Cell {
    pub kind: u32,
    pub shape: u32,
    pub w0: u64,
    pub w1: u64,
    pub w2: u64,
    pub ext: CellExt,
}

impl Cell {
    pub fn number_value(&self) -> f64 {
        debug_assert_eq!(self.kind, kind::NUMBER);
        f64::from_bits(self.w0)
    }

    pub fn str_value(&self) -> &str {
        match &self.ext {
            CellExt::Str(s) => s,
            _ => unreachable!("str_value on non-string cell"),
        }
    }
}

/// Bump arena of boxed cells. Boxing keeps cell addresses stable, which the
/// generated code depends on.
#[derive(Default)]
pub struct Heap {
    cells: Vec<Box<Cell>>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, cell: Cell) -> *mut Cell {
        self.cells.push(Box::new(cell));
        let ptr: *mut Cell = &mut **self.cells.last_mut().unwrap();
        debug_assert!(ptr as usize & 7 == 0);
        ptr
    }

    pub fn alloc_object(&mut self, shape: ShapeId, proto: Value) -> Value {
        let ptr = self.push(Cell {
            kind: kind::OBJECT,
            shape,
            w0: 0,
            w1: 0,
            w2: proto.0,
            ext: CellExt::Object {
                storage: Vec::new(),
            },
        });
        unsafe { refresh_object_words(ptr) };
        Value::cell(ptr)
    }

    pub fn alloc_array(&mut self, len: usize) -> Value {
        let ptr = self.push(Cell {
            kind: kind::ARRAY,
            shape: SHAPE_NON_OBJECT,
            w0: 0,
            w1: 0,
            w2: 0,
            ext: CellExt::Array {
                storage: vec![Value::EMPTY; len],
            },
        });
        unsafe { refresh_array_words(ptr) };
        Value::cell(ptr)
    }

    pub fn alloc_number(&mut self, value: f64) -> Value {
        let ptr = self.push(Cell {
            kind: kind::NUMBER,
            shape: SHAPE_NON_OBJECT,
            w0: value.to_bits(),
            w1: 0,
            w2: 0,
            ext: CellExt::None,
        });
        Value::cell(ptr)
    }

    pub fn alloc_string(&mut self, s: &str) -> Value {
        let ptr = self.push(Cell {
            kind: kind::STRING,
            shape: SHAPE_NON_OBJECT,
            w0: 0,
            w1: s.len() as u64,
            w2: 0,
            ext: CellExt::Str(s.to_string()),
        });
        Value::cell(ptr)
    }

    pub fn alloc_function(&mut self, unit: Arc<CodeUnit>, scope: Value) -> Value {
        let arity = unit.arity as u64;
        let ptr = self.push(Cell {
            kind: kind::FUNCTION,
            shape: SHAPE_NON_OBJECT,
            w0: 0,
            w1: arity,
            w2: scope.0,
            ext: CellExt::Function {
                unit,
                state: CompileState::Uncompiled,
            },
        });
        Value::cell(ptr)
    }

    pub fn alloc_native(&mut self, f: NativeFn, name: &str, arity: usize) -> Value {
        let ptr = self.push(Cell {
            kind: kind::NATIVE,
            shape: SHAPE_NON_OBJECT,
            w0: f as usize as u64,
            w1: arity as u64,
            w2: 0,
            ext: CellExt::Native {
                name: name.to_string(),
            },
        });
        Value::cell(ptr)
    }

    pub fn alloc_scope(&mut self, parent: Value, slots: usize) -> Value {
        let ptr = self.push(Cell {
            kind: kind::SCOPE,
            shape: SHAPE_NON_OBJECT,
            w0: 0,
            w1: parent.0,
            w2: 0,
            ext: CellExt::Scope {
                storage: vec![Value::UNDEFINED; slots],
            },
        });
        unsafe { refresh_scope_words(ptr) };
        Value::cell(ptr)
    }
}

/// Re-mirror an object's storage pointer and slot count into its head.
///
/// # Safety
/// `cell` must point to a live object cell in the arena.
pub unsafe fn refresh_object_words(cell: *mut Cell) {
    let c = unsafe { &mut *cell };
    if let CellExt::Object { storage } = &mut c.ext {
        c.w0 = storage.as_mut_ptr() as u64;
        c.w1 = storage.len() as u64;
    }
}

/// Re-mirror an array's element pointer and length into its head.
///
/// # Safety
/// `cell` must point to a live array cell in the arena.
pub unsafe fn refresh_array_words(cell: *mut Cell) {
    let c = unsafe { &mut *cell };
    if let CellExt::Array { storage } = &mut c.ext {
        c.w0 = storage.as_mut_ptr() as u64;
        c.w1 = storage.len() as u64;
    }
}

/// Re-mirror a scope node's slot pointer into its head.
///
/// # Safety
/// `cell` must point to a live scope cell in the arena.
pub unsafe fn refresh_scope_words(cell: *mut Cell) {
    let c = unsafe { &mut *cell };
    if let CellExt::Scope { storage } = &mut c.ext {
        c.w0 = storage.as_mut_ptr() as u64;
    }
}

/// Append a property slot to an object, returning its index.
///
/// # Safety
/// `cell` must point to a live object cell in the arena.
pub unsafe fn object_push_slot(cell: *mut Cell, value: Value) -> u32 {
    let c = unsafe { &mut *cell };
    let CellExt::Object { storage } = &mut c.ext else {
        unreachable!("object_push_slot on non-object cell");
    };
    storage.push(value);
    let slot = (storage.len() - 1) as u32;
    unsafe { refresh_object_words(cell) };
    slot
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_layout_offsets() {
        assert_eq!(offset_of!(Cell, kind), layout::KIND as usize);
        assert_eq!(offset_of!(Cell, shape), layout::SHAPE as usize);
        assert_eq!(offset_of!(Cell, w0), layout::W0 as usize);
        assert_eq!(offset_of!(Cell, w1), layout::W1 as usize);
        assert_eq!(offset_of!(Cell, w2), layout::W2 as usize);
    }

    #[test]
    fn test_object_words_track_storage() {
        let mut heap = Heap::new();
        let obj = heap.alloc_object(0, Value::NULL);
        let cell = obj.as_cell();
        unsafe {
            let s0 = object_push_slot(cell, Value::int(1));
            let s1 = object_push_slot(cell, Value::int(2));
            assert_eq!((s0, s1), (0, 1));
            let c = &*cell;
            assert_eq!(c.w1, 2);
            let slots = c.w0 as *const Value;
            assert_eq!((*slots.add(1)).as_int(), 2);
        }
    }

    #[test]
    fn test_array_words() {
        let mut heap = Heap::new();
        let arr = heap.alloc_array(3);
        let cell = arr.as_cell();
        unsafe {
            assert_eq!((*cell).kind, kind::ARRAY);
            assert_eq!((*cell).w1, 3);
            assert!((*cell).w0 != 0);
        }
    }
}
