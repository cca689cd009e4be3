//! Call-site linking and inline-cache behavior of compiled code: the
//! uninitialized -> monomorphic -> megamorphic progression, its one-way
//! nature, and the trampoline handoff at call sites. These inspect the
//! live cache slots, so they only run where code generation does.

#![cfg(all(feature = "jit", target_arch = "x86_64", unix))]

use magpie::jit::ic::{STATE_MEGA, STATE_MONO, STATE_UNINIT};
use magpie::vm::bytecode::{Op, TypeHint, UnitBuilder, pack_hints};
use magpie::{JitMode, RuntimeConfig, Value, VmRuntime};

fn vm() -> VmRuntime {
    VmRuntime::new(RuntimeConfig {
        jit_mode: JitMode::On,
        ..RuntimeConfig::default()
    })
}

/// caller(g) = g(5)
fn indirect_call_unit() -> magpie::CodeUnit {
    let mut b = UnitBuilder::new("caller", 1, 1, 16);
    let five = b.const_int(5);
    b.emit(Op::Enter, &[]);
    b.emit(Op::Mov, &[8, five]);
    b.emit(Op::Call, &[1, 0, 1, 8]);
    b.emit(Op::Ret, &[1]);
    b.finish()
}

/// f(x) = x + k
fn add_k_unit(k: i64) -> magpie::CodeUnit {
    let mut b = UnitBuilder::new("addk", 1, 1, 8);
    let k = b.const_int(k);
    b.emit(Op::Enter, &[]);
    b.emit(Op::Add, &[1, 0, k, pack_hints(TypeHint::Unknown, TypeHint::Int)]);
    b.emit(Op::Ret, &[1]);
    b.finish()
}

#[test]
fn test_call_site_links_monomorphic_then_sticks() {
    let mut vm = vm();
    let caller = vm.make_function(indirect_call_unit());
    let f1 = vm.make_function(add_k_unit(1));

    // First call compiles the callee but defers linking.
    assert_eq!(vm.call(caller, &[f1]).unwrap(), Value::int(6));
    let code = vm.compiled(caller).unwrap();
    assert_eq!(code.call_cache_count(), 1);
    assert_eq!(code.call_cache(0).state(), STATE_UNINIT);

    // Second call through the same site links it to the callee.
    assert_eq!(vm.call(caller, &[f1]).unwrap(), Value::int(6));
    assert_eq!(code.call_cache(0).state(), STATE_MONO);
    assert_eq!(code.call_cache(0).cached_callee(), f1.0);

    // Repeat calls with the same callee never re-patch the site.
    for _ in 0..10 {
        assert_eq!(vm.call(caller, &[f1]).unwrap(), Value::int(6));
    }
    assert_eq!(code.call_cache(0).state(), STATE_MONO);
    assert_eq!(code.call_cache(0).cached_callee(), f1.0);
}

#[test]
fn test_call_site_megamorphic_transition_is_one_way() {
    let mut vm = vm();
    let caller = vm.make_function(indirect_call_unit());
    let f1 = vm.make_function(add_k_unit(1));
    let f2 = vm.make_function(add_k_unit(2));

    vm.call(caller, &[f1]).unwrap();
    vm.call(caller, &[f1]).unwrap();
    let code = vm.compiled(caller).unwrap();
    assert_eq!(code.call_cache(0).state(), STATE_MONO);

    // A second distinct callee repoints the site at generic dispatch.
    assert_eq!(vm.call(caller, &[f2]).unwrap(), Value::int(7));
    assert_eq!(code.call_cache(0).state(), STATE_MEGA);
    assert_eq!(code.call_cache(0).cached_callee(), 0);

    // Re-observing the original callee does not revert the cache, and
    // dispatch stays correct.
    assert_eq!(vm.call(caller, &[f1]).unwrap(), Value::int(6));
    assert_eq!(code.call_cache(0).state(), STATE_MEGA);
    assert_eq!(vm.call(caller, &[f2]).unwrap(), Value::int(7));
}

#[test]
fn test_property_cache_specializes_per_shape() {
    let mut vm = vm();
    let x = vm.intern("x");
    let y = vm.intern("y");
    let mut b = UnitBuilder::new("getx", 1, 1, 8);
    b.emit(Op::Enter, &[]);
    b.emit(Op::GetProp, &[1, 0, x]);
    b.emit(Op::Ret, &[1]);
    let getter = vm.make_function(b.finish());

    // Shape {x}.
    let o1 = vm.core_mut().new_object();
    let o2 = vm.core_mut().new_object();
    for (o, v) in [(o1, 1), (o2, 2)] {
        let core = vm.core_mut();
        magpie::vm::ops::put_prop(core, o, x, Value::int(v)).unwrap();
    }
    // Shape {y, x}: same property, different slot.
    let o3 = vm.core_mut().new_object();
    {
        let core = vm.core_mut();
        magpie::vm::ops::put_prop(core, o3, y, Value::int(0)).unwrap();
        magpie::vm::ops::put_prop(core, o3, x, Value::int(3)).unwrap();
    }

    assert_eq!(vm.call(getter, &[o1]).unwrap(), Value::int(1));
    let code = vm.compiled(getter).unwrap();
    assert_eq!(code.prop_cache_count(), 1);
    let cache = code.prop_cache(0);
    assert_eq!(cache.state(), STATE_MONO);
    let cached_shape = cache.cached_shape();

    // Same shape: hits the fast path, never re-patches.
    assert_eq!(vm.call(getter, &[o2]).unwrap(), Value::int(2));
    assert_eq!(cache.state(), STATE_MONO);
    assert_eq!(cache.cached_shape(), cached_shape);

    // A second shape pins the cache; the original shape cannot bring it
    // back, and every lookup still answers correctly.
    assert_eq!(vm.call(getter, &[o3]).unwrap(), Value::int(3));
    assert_eq!(cache.state(), STATE_MEGA);
    assert_eq!(vm.call(getter, &[o1]).unwrap(), Value::int(1));
    assert_eq!(cache.state(), STATE_MEGA);
    assert_eq!(vm.call(getter, &[o3]).unwrap(), Value::int(3));
}

#[test]
fn test_global_cache_follows_shape_changes() {
    let mut vm = vm();
    vm.set_global("a", Value::int(5));
    let a = vm.intern("a");
    let mut b = UnitBuilder::new("geta", 0, 0, 8);
    b.emit(Op::Enter, &[]);
    b.emit(Op::GetGlobal, &[0, a]);
    b.emit(Op::Ret, &[0]);
    let getter = vm.make_function(b.finish());

    assert_eq!(vm.call(getter, &[]).unwrap(), Value::int(5));
    let code = vm.compiled(getter).unwrap();
    assert_eq!(code.prop_cache(0).state(), STATE_MONO);
    assert_eq!(vm.call(getter, &[]).unwrap(), Value::int(5));
    assert_eq!(code.prop_cache(0).state(), STATE_MONO);

    // Adding a fresh global changes the global object's shape; the site
    // re-enters the slow path and stays generic from then on.
    vm.set_global("b", Value::int(1));
    assert_eq!(vm.call(getter, &[]).unwrap(), Value::int(5));
    assert_eq!(code.prop_cache(0).state(), STATE_MEGA);
    vm.set_global("a", Value::int(9));
    assert_eq!(vm.call(getter, &[]).unwrap(), Value::int(9));
}

#[test]
fn test_native_callees_link_through_the_thunk() {
    unsafe extern "C" fn forty_two(
        _ctx: *mut magpie::vm::ExecContext,
        _frame: *mut u64,
        _callee: u64,
    ) -> u64 {
        Value::int(42).0
    }

    let mut vm = vm();
    let caller = vm.make_function(indirect_call_unit());
    let native = vm.register_native("n", 1, forty_two);

    assert_eq!(vm.call(caller, &[native]).unwrap(), Value::int(42));
    assert_eq!(vm.call(caller, &[native]).unwrap(), Value::int(42));
    let code = vm.compiled(caller).unwrap();
    // Native callees link like compiled ones; the hot target is the
    // native-call thunk.
    assert_eq!(code.call_cache(0).state(), STATE_MONO);
    assert_eq!(code.call_cache(0).cached_callee(), native.0);
    for _ in 0..5 {
        assert_eq!(vm.call(caller, &[native]).unwrap(), Value::int(42));
    }
}

#[test]
fn test_arity_mismatch_dispatches_generically() {
    let mut vm = vm();
    let caller = vm.make_function(indirect_call_unit());
    // Callee wants two arguments, the site passes one; the missing one
    // reads as undefined, so `x + undefined` throws. The site must never
    // link.
    let mut b = UnitBuilder::new("two", 2, 2, 8);
    b.emit(Op::Enter, &[]);
    b.emit(Op::Add, &[2, 0, 1, pack_hints(TypeHint::Unknown, TypeHint::Unknown)]);
    b.emit(Op::Ret, &[2]);
    let f = vm.make_function(b.finish());

    assert!(vm.call(caller, &[f]).is_err());
    assert!(vm.call(caller, &[f]).is_err());
    assert!(vm.call(caller, &[f]).is_err());
    let code = vm.compiled(caller).unwrap();
    assert_eq!(code.call_cache(0).state(), STATE_UNINIT);
}

#[test]
fn test_calling_a_non_function_throws() {
    let mut vm = vm();
    let caller = vm.make_function(indirect_call_unit());
    for bad in [Value::int(3), Value::UNDEFINED, Value::TRUE] {
        match vm.call(caller, &[bad]) {
            Err(magpie::VmError::Uncaught { message, .. }) => {
                assert_eq!(message, "value is not callable")
            }
            other => panic!("expected a type error, got {other:?}"),
        }
    }
    // The VM remains consistent and the site can still link afterwards.
    let f1 = vm.make_function(add_k_unit(1));
    assert_eq!(vm.call(caller, &[f1]).unwrap(), Value::int(6));
}

#[test]
fn test_compiled_function_exposes_runtime_tables() {
    let mut vm = vm();
    let caller = vm.make_function(indirect_call_unit());
    let f1 = vm.make_function(add_k_unit(1));
    vm.call(caller, &[f1]).unwrap();

    let code = vm.compiled(caller).unwrap();
    assert_eq!(code.unresolved_references(), 0);
    assert!(!code.entry().is_null());
    // Every emitted call is attributable to a bytecode offset.
    assert!(!code.call_return_table().is_empty());
    for &(off, bc) in code.call_return_table() {
        assert!(off <= code.code_size());
        assert!((bc as usize) < indirect_call_unit().code.len());
    }
    let site = code.call_sites()[0];
    assert!(site.hot_path_begin < site.cold_path_begin);
    assert!(site.cold_path_begin < code.code_size());
}
