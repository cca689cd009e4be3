//! Value semantics shared by the interpreter and the JIT's runtime stubs.
//!
//! Keeping one implementation here is what makes "slow path equals
//! interpreter" hold by construction: every fast-path bailout lands on the
//! same functions the interpreter runs.

use crate::vm::heap::{self, CellExt, kind};
use crate::vm::shapes::Sym;
use crate::vm::value::Value;
use crate::vm::vm::VmCore;

/// A thrown script value in flight.
#[derive(Debug, Clone, Copy)]
pub struct Thrown(pub Value);

pub type OpResult = Result<Value, Thrown>;

/// Numeric view of a value, when it has one.
fn as_number(v: Value) -> Option<f64> {
    if v.is_int() {
        return Some(v.as_int() as f64);
    }
    if v.is_cell() {
        let cell = unsafe { &*v.as_cell() };
        if cell.kind == kind::NUMBER {
            return Some(cell.number_value());
        }
    }
    None
}

fn as_str(v: Value) -> Option<&'static str> {
    if v.is_cell() {
        let cell = unsafe { &*v.as_cell() };
        if cell.kind == kind::STRING {
            // Arena cells are never freed while the VM is live.
            return Some(unsafe { std::mem::transmute::<&str, &'static str>(cell.str_value()) });
        }
    }
    None
}

/// Produce a numeric result: a tagged int when integral and in range,
/// otherwise a heap number.
pub fn make_number(vm: &mut VmCore, n: f64) -> Value {
    if n.fract() == 0.0 && !n.is_nan() && Value::fits_int(n as i64) && (n as i64) as f64 == n {
        Value::int(n as i64)
    } else {
        vm.heap.alloc_number(n)
    }
}

pub fn add(vm: &mut VmCore, a: Value, b: Value) -> OpResult {
    // Both-int shortcut keeps integral results integral past the 53-bit
    // range where f64 arithmetic would round.
    if a.is_int() && b.is_int() {
        let sum = a.as_int() + b.as_int();
        if Value::fits_int(sum) {
            return Ok(Value::int(sum));
        }
        return Ok(vm.heap.alloc_number(sum as f64));
    }
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return Ok(make_number(vm, x + y));
    }
    if let Some(s) = as_str(a) {
        if let Some(t) = as_str(b) {
            let joined = format!("{s}{t}");
            return Ok(vm.heap.alloc_string(&joined));
        }
    }
    Err(vm.type_error("invalid operands to +"))
}

pub fn sub(vm: &mut VmCore, a: Value, b: Value) -> OpResult {
    if a.is_int() && b.is_int() {
        let d = a.as_int() - b.as_int();
        if Value::fits_int(d) {
            return Ok(Value::int(d));
        }
        return Ok(vm.heap.alloc_number(d as f64));
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => Ok(make_number(vm, x - y)),
        _ => Err(vm.type_error("invalid operands to -")),
    }
}

pub fn mul(vm: &mut VmCore, a: Value, b: Value) -> OpResult {
    if a.is_int() && b.is_int() {
        if let Some(p) = a.as_int().checked_mul(b.as_int()) {
            if Value::fits_int(p) {
                return Ok(Value::int(p));
            }
        }
        return Ok(make_number(vm, a.as_int() as f64 * b.as_int() as f64));
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => Ok(make_number(vm, x * y)),
        _ => Err(vm.type_error("invalid operands to *")),
    }
}

pub fn div(vm: &mut VmCore, a: Value, b: Value) -> OpResult {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => Ok(make_number(vm, x / y)),
        _ => Err(vm.type_error("invalid operands to /")),
    }
}

pub fn rem(vm: &mut VmCore, a: Value, b: Value) -> OpResult {
    if a.is_int() && b.is_int() {
        let d = b.as_int();
        if d != 0 && d != -1 {
            return Ok(Value::int(a.as_int() % d));
        }
        if d == -1 {
            return Ok(Value::int(0));
        }
        // n % 0 falls through to the float path and yields NaN.
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => Ok(make_number(vm, x % y)),
        _ => Err(vm.type_error("invalid operands to %")),
    }
}

pub fn neg(vm: &mut VmCore, a: Value) -> OpResult {
    match as_number(a) {
        Some(x) => Ok(make_number(vm, -x)),
        None => Err(vm.type_error("invalid operand to unary -")),
    }
}

/// Integral view used by the bitwise/shift operators.
fn as_int64(vm: &mut VmCore, v: Value, what: &str) -> Result<i64, Thrown> {
    if v.is_int() {
        return Ok(v.as_int());
    }
    match as_number(v) {
        Some(n) if n.fract() == 0.0 => Ok(n as i64),
        _ => Err(vm.type_error(what)),
    }
}

pub fn bit_and(vm: &mut VmCore, a: Value, b: Value) -> OpResult {
    let (x, y) = (
        as_int64(vm, a, "invalid operands to &")?,
        as_int64(vm, b, "invalid operands to &")?,
    );
    Ok(Value::int(x & y))
}

pub fn bit_or(vm: &mut VmCore, a: Value, b: Value) -> OpResult {
    let (x, y) = (
        as_int64(vm, a, "invalid operands to |")?,
        as_int64(vm, b, "invalid operands to |")?,
    );
    Ok(Value::int(x | y))
}

pub fn bit_xor(vm: &mut VmCore, a: Value, b: Value) -> OpResult {
    let (x, y) = (
        as_int64(vm, a, "invalid operands to ^")?,
        as_int64(vm, b, "invalid operands to ^")?,
    );
    Ok(Value::int(x ^ y))
}

pub fn bit_not(vm: &mut VmCore, a: Value) -> OpResult {
    let x = as_int64(vm, a, "invalid operand to ~")?;
    Ok(Value::int(!x))
}

pub fn lsh(vm: &mut VmCore, a: Value, b: Value) -> OpResult {
    let x = as_int64(vm, a, "invalid operands to <<")?;
    let s = as_int64(vm, b, "invalid operands to <<")? as u32 & 63;
    let shifted = x << s;
    if Value::fits_int(shifted) && (shifted >> s) == x {
        Ok(Value::int(shifted))
    } else {
        Ok(make_number(vm, (x as f64) * (s as f64).exp2()))
    }
}

pub fn rsh(vm: &mut VmCore, a: Value, b: Value) -> OpResult {
    let x = as_int64(vm, a, "invalid operands to >>")?;
    let s = as_int64(vm, b, "invalid operands to >>")? as u32 & 63;
    Ok(Value::int(x >> s))
}

/// Strict equality: numeric values compare numerically, strings by content,
/// everything else by identity.
pub fn strict_eq(a: Value, b: Value) -> bool {
    if a == b {
        // Identical words. NaN cells are identical-by-cell, which we accept
        // as equal under this VM's semantics.
        return true;
    }
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x == y;
    }
    if let (Some(s), Some(t)) = (as_str(a), as_str(b)) {
        return s == t;
    }
    false
}

/// Loose equality: strict equality plus `null == undefined`.
pub fn loose_eq(a: Value, b: Value) -> bool {
    if (a.is_null() || a.is_undefined()) && (b.is_null() || b.is_undefined()) {
        return true;
    }
    strict_eq(a, b)
}

pub fn less(vm: &mut VmCore, a: Value, b: Value) -> Result<bool, Thrown> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return Ok(x < y);
    }
    if let (Some(s), Some(t)) = (as_str(a), as_str(b)) {
        return Ok(s < t);
    }
    Err(vm.type_error("invalid operands to <"))
}

pub fn less_eq(vm: &mut VmCore, a: Value, b: Value) -> Result<bool, Thrown> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return Ok(x <= y);
    }
    if let (Some(s), Some(t)) = (as_str(a), as_str(b)) {
        return Ok(s <= t);
    }
    Err(vm.type_error("invalid operands to <="))
}

pub fn type_of(vm: &mut VmCore, v: Value) -> Value {
    let name = if v.is_int() {
        "number"
    } else if v.is_bool() {
        "boolean"
    } else if v.is_undefined() {
        "undefined"
    } else if v.is_null() {
        "object"
    } else if v.is_cell() {
        match unsafe { (*v.as_cell()).kind } {
            kind::NUMBER => "number",
            kind::STRING => "string",
            kind::FUNCTION | kind::NATIVE => "function",
            _ => "object",
        }
    } else {
        "undefined"
    };
    vm.intern_string(name)
}

pub fn to_number(vm: &mut VmCore, v: Value) -> OpResult {
    if v.is_int() {
        return Ok(v);
    }
    if let Some(n) = as_number(v) {
        let _ = n;
        return Ok(v);
    }
    if v.is_bool() {
        return Ok(Value::int(v.as_bool() as i64));
    }
    if v.is_null() {
        return Ok(Value::int(0));
    }
    Err(vm.type_error("cannot convert value to a number"))
}

pub fn instance_of(vm: &mut VmCore, value: Value, base: Value, proto: Value) -> Result<bool, Thrown> {
    if !base.is_cell() {
        return Err(vm.type_error("right-hand side of instanceof is not an object"));
    }
    if !value.is_cell() || !proto.is_cell() {
        return Ok(false);
    }
    let mut cur = unsafe { Value((*value.as_cell()).w2) };
    loop {
        if !cur.is_cell() {
            return Ok(false);
        }
        if cur == proto {
            return Ok(true);
        }
        let cell = unsafe { &*cur.as_cell() };
        if cell.kind != kind::OBJECT {
            return Ok(false);
        }
        cur = Value(cell.w2);
    }
}

/// Generic property load: own slot, then the prototype chain. A slot holding
/// the empty marker counts as deleted.
pub fn get_prop(vm: &mut VmCore, base: Value, sym: Sym) -> OpResult {
    if !base.is_cell() {
        return Err(vm.type_error("cannot read property of non-object"));
    }
    let mut cur = base;
    loop {
        let cell = unsafe { &*cur.as_cell() };
        if cell.kind == kind::OBJECT {
            if let Some(slot) = vm.shapes.lookup(cell.shape, sym) {
                let v = unsafe { *(cell.w0 as *const Value).add(slot as usize) };
                if !v.is_empty() {
                    return Ok(v);
                }
            }
            let proto = Value(cell.w2);
            if proto.is_cell() {
                cur = proto;
                continue;
            }
        }
        return Ok(Value::UNDEFINED);
    }
}

/// Property lookup result for inline-cache recording: the base object's own
/// shape and slot when the access hit an own property.
pub fn get_prop_for_cache(
    vm: &mut VmCore,
    base: Value,
    sym: Sym,
) -> Result<(Value, Option<(u32, u32)>), Thrown> {
    if base.is_cell() {
        let cell = unsafe { &*base.as_cell() };
        if cell.kind == kind::OBJECT {
            if let Some(slot) = vm.shapes.lookup(cell.shape, sym) {
                let v = unsafe { *(cell.w0 as *const Value).add(slot as usize) };
                if !v.is_empty() {
                    return Ok((v, Some((cell.shape, slot))));
                }
            }
        }
    }
    get_prop(vm, base, sym).map(|v| (v, None))
}

/// Generic property store. Returns the own (shape, slot) when the store was
/// a plain replacement, for inline-cache recording; transitions are never
/// cached.
pub fn put_prop(
    vm: &mut VmCore,
    base: Value,
    sym: Sym,
    value: Value,
) -> Result<Option<(u32, u32)>, Thrown> {
    if !base.is_cell() {
        return Err(vm.type_error("cannot set property of non-object"));
    }
    let cell_ptr = base.as_cell();
    let cell = unsafe { &mut *cell_ptr };
    if cell.kind != kind::OBJECT {
        return Err(vm.type_error("cannot set property of non-object"));
    }
    if let Some(slot) = vm.shapes.lookup(cell.shape, sym) {
        let was_empty = unsafe { (*(cell.w0 as *const Value).add(slot as usize)).is_empty() };
        unsafe { *(cell.w0 as *mut Value).add(slot as usize) = value };
        // Resurrecting a deleted slot is not a cacheable replacement.
        return Ok(if was_empty { None } else { Some((cell.shape, slot)) });
    }
    let (next_shape, slot) = vm.shapes.transition(cell.shape, sym);
    let pushed = unsafe { heap::object_push_slot(cell_ptr, value) };
    debug_assert_eq!(pushed, slot);
    cell.shape = next_shape;
    Ok(None)
}

/// Deletion marks the slot empty; shape-preserving, so caches stay valid
/// for the surviving properties.
pub fn del_prop(vm: &mut VmCore, base: Value, sym: Sym) -> OpResult {
    if !base.is_cell() {
        return Err(vm.type_error("cannot delete property of non-object"));
    }
    let cell = unsafe { &mut *base.as_cell() };
    if cell.kind != kind::OBJECT {
        return Err(vm.type_error("cannot delete property of non-object"));
    }
    match vm.shapes.lookup(cell.shape, sym) {
        Some(slot) => {
            let p = unsafe { (cell.w0 as *mut Value).add(slot as usize) };
            let existed = unsafe { !(*p).is_empty() };
            unsafe { *p = Value::EMPTY };
            Ok(Value::bool(existed))
        }
        None => Ok(Value::FALSE),
    }
}

pub fn get_index(vm: &mut VmCore, base: Value, index: Value) -> OpResult {
    if !base.is_cell() || unsafe { (*base.as_cell()).kind } != kind::ARRAY {
        return Err(vm.type_error("cannot index non-array"));
    }
    if !index.is_int() {
        return Err(vm.type_error("array index must be an integer"));
    }
    let cell = unsafe { &*base.as_cell() };
    let i = index.as_int();
    if i < 0 || i as u64 >= cell.w1 {
        return Ok(Value::UNDEFINED);
    }
    let v = unsafe { *(cell.w0 as *const Value).add(i as usize) };
    Ok(if v.is_empty() { Value::UNDEFINED } else { v })
}

pub fn put_index(vm: &mut VmCore, base: Value, index: Value, value: Value) -> OpResult {
    if !base.is_cell() || unsafe { (*base.as_cell()).kind } != kind::ARRAY {
        return Err(vm.type_error("cannot index non-array"));
    }
    if !index.is_int() {
        return Err(vm.type_error("array index must be an integer"));
    }
    let i = index.as_int();
    if i < 0 {
        return Err(vm.type_error("negative array index"));
    }
    let cell_ptr = base.as_cell();
    let cell = unsafe { &mut *cell_ptr };
    let CellExt::Array { storage } = &mut cell.ext else {
        unreachable!("array cell without array storage");
    };
    if (i as usize) >= storage.len() {
        storage.resize(i as usize + 1, Value::EMPTY);
    }
    storage[i as usize] = value;
    unsafe { heap::refresh_array_words(cell_ptr) };
    Ok(Value::UNDEFINED)
}

/// Render a value for diagnostics.
pub fn describe(v: Value) -> String {
    if v.is_int() {
        return v.as_int().to_string();
    }
    if v.is_bool() {
        return v.as_bool().to_string();
    }
    if v.is_null() {
        return "null".into();
    }
    if v.is_undefined() {
        return "undefined".into();
    }
    if v.is_cell() {
        let cell = unsafe { &*v.as_cell() };
        return match cell.kind {
            kind::NUMBER => cell.number_value().to_string(),
            kind::STRING => cell.str_value().to_string(),
            kind::ARRAY => format!("[array of {}]", cell.w1),
            kind::FUNCTION | kind::NATIVE => "[function]".into(),
            _ => "[object]".into(),
        };
    }
    "[empty]".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::vm::vm::VmRuntime;

    fn vm() -> VmRuntime {
        VmRuntime::new(RuntimeConfig::default())
    }

    #[test]
    fn test_add_overflow_promotes() {
        let mut rt = vm();
        let core = rt.core_mut();
        let max = Value::int(crate::vm::value::INT_MAX);
        let r = add(core, max, Value::int(1)).unwrap();
        assert!(!r.is_int());
        let cell = unsafe { &*r.as_cell() };
        assert_eq!(cell.number_value(), (crate::vm::value::INT_MAX as f64) + 1.0);
    }

    #[test]
    fn test_string_concat() {
        let mut rt = vm();
        let core = rt.core_mut();
        let a = core.heap.alloc_string("foo");
        let b = core.heap.alloc_string("bar");
        let r = add(core, a, b).unwrap();
        assert_eq!(describe(r), "foobar");
    }

    #[test]
    fn test_strict_eq_numeric() {
        let mut rt = vm();
        let core = rt.core_mut();
        let half = core.heap.alloc_number(2.0);
        assert!(strict_eq(Value::int(2), half));
        assert!(!strict_eq(Value::int(2), Value::int(3)));
        assert!(!strict_eq(Value::NULL, Value::UNDEFINED));
        assert!(loose_eq(Value::NULL, Value::UNDEFINED));
    }

    #[test]
    fn test_prop_round_trip_and_delete() {
        let mut rt = vm();
        let core = rt.core_mut();
        let obj = core.new_object();
        let sym = core.symbols.intern("x");
        assert!(put_prop(core, obj, sym, Value::int(5)).unwrap().is_none());
        assert_eq!(get_prop(core, obj, sym).unwrap(), Value::int(5));
        // Second store to the same slot is a cacheable replacement.
        assert!(put_prop(core, obj, sym, Value::int(6)).unwrap().is_some());
        assert_eq!(del_prop(core, obj, sym).unwrap(), Value::TRUE);
        assert_eq!(get_prop(core, obj, sym).unwrap(), Value::UNDEFINED);
        assert_eq!(del_prop(core, obj, sym).unwrap(), Value::FALSE);
    }

    #[test]
    fn test_proto_chain_lookup() {
        let mut rt = vm();
        let core = rt.core_mut();
        let proto = core.new_object();
        let sym = core.symbols.intern("m");
        put_prop(core, proto, sym, Value::int(1)).unwrap();
        let obj = core.new_object_with_proto(proto);
        assert_eq!(get_prop(core, obj, sym).unwrap(), Value::int(1));
        assert!(instance_of(core, obj, proto, proto).unwrap());
    }

    #[test]
    fn test_array_indexing() {
        let mut rt = vm();
        let core = rt.core_mut();
        let arr = core.heap.alloc_array(2);
        put_index(core, arr, Value::int(0), Value::int(9)).unwrap();
        assert_eq!(get_index(core, arr, Value::int(0)).unwrap(), Value::int(9));
        // Hole reads as undefined.
        assert_eq!(get_index(core, arr, Value::int(1)).unwrap(), Value::UNDEFINED);
        // Out-of-bounds store grows.
        put_index(core, arr, Value::int(4), Value::int(7)).unwrap();
        assert_eq!(get_index(core, arr, Value::int(4)).unwrap(), Value::int(7));
    }
}
