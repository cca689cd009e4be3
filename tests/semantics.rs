//! Behavioral equivalence between compiled code and the reference
//! interpreter: every program here runs under both engines and must
//! produce identical observable results, including thrown errors. On
//! targets without JIT support both runs interpret and the assertions
//! still hold.

use pretty_assertions::assert_eq;

use magpie::vm::bytecode::{Op, SwitchTable, TypeHint, UnitBuilder, pack_hints};
use magpie::vm::value::INT_MAX;
use magpie::{CodeUnit, JitMode, RuntimeConfig, Value, VmError, VmRuntime};

fn jit_vm() -> VmRuntime {
    VmRuntime::new(RuntimeConfig {
        jit_mode: JitMode::On,
        ..RuntimeConfig::default()
    })
}

fn interp_vm() -> VmRuntime {
    VmRuntime::new(RuntimeConfig {
        jit_mode: JitMode::Off,
        ..RuntimeConfig::default()
    })
}

/// Host-side argument spec, realized per VM so cell values stay inside
/// their owning heap.
#[derive(Debug, Clone, Copy)]
enum Arg {
    Int(i64),
    Num(f64),
    Bool(bool),
    Str(&'static str),
    Undef,
    Obj,
}

fn make_args(vm: &mut VmRuntime, spec: &[Arg]) -> Vec<Value> {
    spec.iter()
        .map(|a| match a {
            Arg::Int(n) => Value::int(*n),
            Arg::Num(f) => vm.core_mut().heap.alloc_number(*f),
            Arg::Bool(b) => Value::bool(*b),
            Arg::Str(s) => vm.core_mut().heap.alloc_string(s),
            Arg::Undef => Value::UNDEFINED,
            Arg::Obj => vm.core_mut().new_object(),
        })
        .collect()
}

fn run_rendered(vm: &mut VmRuntime, f: Value, args: &[Value]) -> String {
    match vm.call(f, args) {
        Ok(v) => vm.describe(v),
        Err(VmError::Uncaught { message, .. }) => format!("uncaught: {message}"),
        Err(e) => format!("error: {e}"),
    }
}

/// Run one program under both engines for every argument set and compare
/// rendered outcomes.
fn check_parity(name: &str, build: impl Fn(&mut VmRuntime) -> CodeUnit, argsets: &[&[Arg]]) {
    for spec in argsets {
        let jit = {
            let mut vm = jit_vm();
            let unit = build(&mut vm);
            let f = vm.make_function(unit);
            let args = make_args(&mut vm, spec);
            run_rendered(&mut vm, f, &args)
        };
        let interp = {
            let mut vm = interp_vm();
            let unit = build(&mut vm);
            let f = vm.make_function(unit);
            let args = make_args(&mut vm, spec);
            run_rendered(&mut vm, f, &args)
        };
        assert_eq!(jit, interp, "{name} diverged on {spec:?}");
    }
}

/// `f(a, b) = a <op> b` for the 5-word arithmetic opcodes.
fn arith_unit(op: Op) -> CodeUnit {
    let mut b = UnitBuilder::new("arith", 2, 2, 8);
    b.emit(Op::Enter, &[]);
    b.emit(op, &[2, 0, 1, pack_hints(TypeHint::Unknown, TypeHint::Unknown)]);
    b.emit(Op::Ret, &[2]);
    b.finish()
}

/// `f(a, b) = a <op> b` for the 4-word binary opcodes.
fn bin_unit(op: Op) -> CodeUnit {
    let mut b = UnitBuilder::new("bin", 2, 2, 8);
    b.emit(Op::Enter, &[]);
    b.emit(op, &[2, 0, 1]);
    b.emit(Op::Ret, &[2]);
    b.finish()
}

const NUMERIC_SETS: &[&[Arg]] = &[
    &[Arg::Int(7), Arg::Int(5)],
    &[Arg::Int(-3), Arg::Int(9)],
    &[Arg::Int(INT_MAX), Arg::Int(1)],
    &[Arg::Int(INT_MAX), Arg::Int(INT_MAX)],
    &[Arg::Num(2.5), Arg::Int(2)],
    &[Arg::Int(2), Arg::Num(0.5)],
    &[Arg::Bool(true), Arg::Int(1)],
    &[Arg::Str("a"), Arg::Str("b")],
    &[Arg::Str("a"), Arg::Int(1)],
    &[Arg::Undef, Arg::Int(1)],
];

#[test]
fn test_add_matches_interpreter() {
    check_parity("add", |_| arith_unit(Op::Add), NUMERIC_SETS);
}

#[test]
fn test_sub_matches_interpreter() {
    check_parity("sub", |_| arith_unit(Op::Sub), NUMERIC_SETS);
}

#[test]
fn test_mul_matches_interpreter() {
    let mut sets: Vec<&[Arg]> = NUMERIC_SETS.to_vec();
    sets.push(&[Arg::Int(1 << 40), Arg::Int(1 << 30)]);
    check_parity("mul", |_| arith_unit(Op::Mul), &sets);
}

#[test]
fn test_div_mod_match_interpreter() {
    let sets: &[&[Arg]] = &[
        &[Arg::Int(7), Arg::Int(2)],
        &[Arg::Int(-7), Arg::Int(2)],
        &[Arg::Int(7), Arg::Int(0)],
        &[Arg::Int(7), Arg::Int(-1)],
        &[Arg::Num(7.5), Arg::Int(2)],
        &[Arg::Str("x"), Arg::Int(2)],
    ];
    check_parity("div", |_| arith_unit(Op::Div), sets);
    check_parity("mod", |_| arith_unit(Op::Mod), sets);
}

#[test]
fn test_add_constant_operand() {
    // Constant-folded shape, including the overflow path into a heap
    // number rather than a wrapped integer.
    check_parity(
        "add_const",
        |_| {
            let mut b = UnitBuilder::new("f", 1, 1, 4);
            let one = b.const_int(1);
            b.emit(Op::Enter, &[]);
            b.emit(
                Op::Add,
                &[1, 0, one, pack_hints(TypeHint::Unknown, TypeHint::Int)],
            );
            b.emit(Op::Ret, &[1]);
            b.finish()
        },
        &[
            &[Arg::Int(41)],
            &[Arg::Int(INT_MAX)],
            &[Arg::Num(0.5)],
            &[Arg::Str("x")],
        ],
    );
}

#[test]
fn test_overflow_never_wraps() {
    let mut vm = jit_vm();
    let unit = arith_unit(Op::Add);
    let f = vm.make_function(unit);
    let r = vm.call(f, &[Value::int(INT_MAX), Value::int(1)]).unwrap();
    assert!(!r.is_int(), "overflowing add must not stay an integer");
    assert_eq!(vm.describe(r), ((INT_MAX as f64) + 1.0).to_string());
}

#[test]
fn test_bitwise_matches_interpreter() {
    let sets: &[&[Arg]] = &[
        &[Arg::Int(0b1100), Arg::Int(0b1010)],
        &[Arg::Int(-8), Arg::Int(3)],
        &[Arg::Num(4.0), Arg::Int(1)],
        &[Arg::Num(4.5), Arg::Int(1)],
        &[Arg::Bool(true), Arg::Int(1)],
    ];
    for op in [Op::BitAnd, Op::BitOr, Op::BitXor] {
        check_parity("bitwise", |_| bin_unit(op), sets);
    }
}

#[test]
fn test_shifts_match_interpreter() {
    let sets: &[&[Arg]] = &[
        &[Arg::Int(1), Arg::Int(4)],
        &[Arg::Int(-64), Arg::Int(2)],
        &[Arg::Int(1), Arg::Int(62)],
        &[Arg::Int(1), Arg::Int(63)],
        &[Arg::Int(5), Arg::Int(64)],
        &[Arg::Int(5), Arg::Int(-1)],
        &[Arg::Str("x"), Arg::Int(1)],
    ];
    check_parity("lsh", |_| bin_unit(Op::Lsh), sets);
    check_parity("rsh", |_| bin_unit(Op::Rsh), sets);
}

#[test]
fn test_comparisons_match_interpreter() {
    let sets: &[&[Arg]] = &[
        &[Arg::Int(1), Arg::Int(2)],
        &[Arg::Int(2), Arg::Int(2)],
        &[Arg::Int(2), Arg::Num(2.0)],
        &[Arg::Str("abc"), Arg::Str("abd")],
        &[Arg::Undef, Arg::Undef],
        &[Arg::Bool(true), Arg::Int(1)],
        &[Arg::Obj, Arg::Obj],
    ];
    for op in [Op::Eq, Op::Neq, Op::StrictEq, Op::NStrictEq, Op::Less, Op::LessEq] {
        check_parity("compare", |_| bin_unit(op), sets);
    }
}

#[test]
fn test_unary_ops_match_interpreter() {
    let unary = |op: Op| {
        move |_: &mut VmRuntime| {
            let mut b = UnitBuilder::new("f", 1, 1, 4);
            b.emit(Op::Enter, &[]);
            b.emit(op, &[1, 0]);
            b.emit(Op::Ret, &[1]);
            b.finish()
        }
    };
    let sets: &[&[Arg]] = &[
        &[Arg::Int(5)],
        &[Arg::Int(0)],
        &[Arg::Int(-5)],
        &[Arg::Num(1.5)],
        &[Arg::Bool(false)],
        &[Arg::Str("s")],
        &[Arg::Undef],
    ];
    check_parity("neg", unary(Op::Neg), sets);
    check_parity("bitnot", unary(Op::BitNot), sets);
    check_parity("not", unary(Op::Not), sets);
    check_parity("tonumber", unary(Op::ToNumber), sets);
    check_parity("typeof", unary(Op::TypeOf), sets);

    check_parity(
        "preinc",
        |_| {
            let mut b = UnitBuilder::new("f", 1, 1, 4);
            b.emit(Op::Enter, &[]);
            b.emit(Op::PreInc, &[0]);
            b.emit(Op::PreDec, &[0]);
            b.emit(Op::PreInc, &[0]);
            b.emit(Op::Ret, &[0]);
            b.finish()
        },
        &[&[Arg::Int(1)], &[Arg::Int(INT_MAX)], &[Arg::Num(0.5)], &[Arg::Str("x")]],
    );
}

/// sum = 0; for (i = 0; i < n; i++) sum += i; return sum
fn loop_sum_unit() -> CodeUnit {
    let mut b = UnitBuilder::new("loop_sum", 1, 3, 8);
    let zero = b.const_int(0);
    let one = b.const_int(1);
    let hints = pack_hints(TypeHint::Unknown, TypeHint::Unknown);
    b.emit(Op::Enter, &[]);
    b.emit(Op::Mov, &[1, zero]);
    b.emit(Op::Mov, &[2, zero]);
    let head = b.here();
    let exit_jump = b.emit(Op::JNless, &[1, 0, 0]);
    b.emit(Op::Add, &[2, 2, 1, hints]);
    b.emit(Op::Add, &[1, 1, one, pack_hints(TypeHint::Unknown, TypeHint::Int)]);
    let loop_at = b.emit(Op::Loop, &[0]);
    b.patch_jump(loop_at, 1, head);
    let exit = b.emit(Op::Ret, &[2]);
    b.patch_jump(exit_jump, 3, exit);
    b.finish()
}

#[test]
fn test_loops_match_interpreter() {
    check_parity(
        "loop_sum",
        |_| loop_sum_unit(),
        &[
            &[Arg::Int(0)],
            &[Arg::Int(1)],
            &[Arg::Int(100)],
            &[Arg::Num(3.0)],
        ],
    );
}

#[test]
fn test_loop_if_true_and_jfalse() {
    // while (n) { n = n - 1; hits = hits + 1 } with a JFalse guard on an
    // extra flag argument.
    check_parity(
        "countdown",
        |_| {
            let mut b = UnitBuilder::new("f", 2, 3, 8);
            let one = b.const_int(1);
            b.emit(Op::Enter, &[]);
            let skip = b.emit(Op::JFalse, &[1, 0]);
            let head = b.here();
            b.emit(Op::Sub, &[0, 0, one, pack_hints(TypeHint::Unknown, TypeHint::Int)]);
            let back = b.emit(Op::LoopIfTrue, &[0, 0]);
            b.patch_jump(back, 2, head);
            let out = b.emit(Op::Ret, &[0]);
            b.patch_jump(skip, 2, out);
            b.finish()
        },
        &[
            &[Arg::Int(5), Arg::Bool(true)],
            &[Arg::Int(5), Arg::Bool(false)],
            &[Arg::Int(5), Arg::Str("t")],
            &[Arg::Int(0), Arg::Bool(true)],
        ],
    );
}

fn switch_unit() -> CodeUnit {
    let mut b = UnitBuilder::new("switch", 1, 1, 4);
    b.emit(Op::Enter, &[]);
    let switch_at = b.emit(Op::SwitchImm, &[0, 0, 0]);
    let k10 = b.const_int(10);
    let case0 = b.emit(Op::Ret, &[k10]);
    let k20 = b.const_int(20);
    let case2 = b.emit(Op::Ret, &[k20]);
    let km = b.const_int(-1);
    let default = b.emit(Op::Ret, &[km]);
    b.patch_jump(switch_at, 2, default);
    b.add_switch_table(SwitchTable {
        min: 0,
        offsets: vec![
            UnitBuilder::rel(switch_at, case0) as i32,
            0,
            UnitBuilder::rel(switch_at, case2) as i32,
        ],
    });
    b.finish()
}

#[test]
fn test_switch_matches_interpreter() {
    check_parity(
        "switch",
        |_| switch_unit(),
        &[
            &[Arg::Int(0)],
            &[Arg::Int(1)],
            &[Arg::Int(2)],
            &[Arg::Int(-5)],
            &[Arg::Int(99)],
            &[Arg::Str("x")],
            &[Arg::Num(1.0)],
        ],
    );
}

#[test]
fn test_objects_match_interpreter() {
    // o = {}; o.x = 41; o.x = o.x + 1; delete o.x reads back undefined.
    let build = |vm: &mut VmRuntime| {
        let x = vm.intern("x");
        let mut b = UnitBuilder::new("obj", 0, 0, 8);
        let k = b.const_int(41);
        let one = b.const_int(1);
        b.emit(Op::Enter, &[]);
        b.emit(Op::NewObject, &[0]);
        b.emit(Op::PutProp, &[0, x, k]);
        b.emit(Op::GetProp, &[1, 0, x]);
        b.emit(Op::Add, &[1, 1, one, pack_hints(TypeHint::Unknown, TypeHint::Int)]);
        b.emit(Op::PutProp, &[0, x, 1]);
        b.emit(Op::GetProp, &[2, 0, x]);
        b.emit(Op::Ret, &[2]);
        b.finish()
    };
    check_parity("obj_round_trip", build, &[&[]]);

    let build_del = |vm: &mut VmRuntime| {
        let x = vm.intern("x");
        let mut b = UnitBuilder::new("obj_del", 0, 0, 8);
        let k = b.const_int(41);
        b.emit(Op::Enter, &[]);
        b.emit(Op::NewObject, &[0]);
        b.emit(Op::PutProp, &[0, x, k]);
        b.emit(Op::DelProp, &[1, 0, x]);
        b.emit(Op::GetProp, &[2, 0, x]);
        b.emit(Op::Ret, &[2]);
        b.finish()
    };
    check_parity("obj_delete", build_del, &[&[]]);

    // Property access on a non-object argument throws under both engines.
    let build_arg = |vm: &mut VmRuntime| {
        let x = vm.intern("x");
        let mut b = UnitBuilder::new("obj_arg", 1, 1, 8);
        b.emit(Op::Enter, &[]);
        b.emit(Op::GetProp, &[1, 0, x]);
        b.emit(Op::Ret, &[1]);
        b.finish()
    };
    check_parity(
        "obj_arg",
        build_arg,
        &[&[Arg::Obj], &[Arg::Int(1)], &[Arg::Undef], &[Arg::Str("s")]],
    );
}

#[test]
fn test_arrays_match_interpreter() {
    let build = |_: &mut VmRuntime| {
        let mut b = UnitBuilder::new("arr", 1, 1, 8);
        let three = b.const_int(3);
        let zero = b.const_int(0);
        let nine = b.const_int(9);
        let five = b.const_int(5);
        b.emit(Op::Enter, &[]);
        b.emit(Op::NewArray, &[1, three]);
        b.emit(Op::PutIndex, &[1, zero, nine]);
        // Hole read, then a growing store, then an indexed read back.
        b.emit(Op::GetIndex, &[2, 1, 0]);
        b.emit(Op::PutIndex, &[1, five, nine]);
        b.emit(Op::GetIndex, &[3, 1, five]);
        b.emit(Op::Ret, &[2]);
        b.finish()
    };
    check_parity(
        "array",
        build,
        &[&[Arg::Int(0)], &[Arg::Int(1)], &[Arg::Int(99)], &[Arg::Num(0.5)]],
    );
}

#[test]
fn test_globals_match_interpreter() {
    let build = |vm: &mut VmRuntime| {
        let a = vm.intern("a");
        let missing = vm.intern("missing");
        let mut b = UnitBuilder::new("globals", 0, 0, 8);
        let k = b.const_int(5);
        b.emit(Op::Enter, &[]);
        b.emit(Op::PutGlobal, &[a, k]);
        b.emit(Op::GetGlobal, &[0, a]);
        b.emit(Op::GetGlobal, &[1, missing]);
        b.emit(Op::Ret, &[0]);
        b.finish()
    };
    check_parity("globals", build, &[&[]]);
}

#[test]
fn test_resolve_missing_throws() {
    let build = |vm: &mut VmRuntime| {
        let nope = vm.intern("nope");
        let mut b = UnitBuilder::new("resolve", 0, 0, 8);
        b.emit(Op::Enter, &[]);
        b.emit(Op::Resolve, &[0, nope]);
        b.emit(Op::Ret, &[0]);
        b.finish()
    };
    check_parity("resolve", build, &[&[]]);
}

#[test]
fn test_instance_of_matches_interpreter() {
    let run = |vm: &mut VmRuntime| -> Vec<String> {
        let mut b = UnitBuilder::new("inst", 3, 3, 8);
        b.emit(Op::Enter, &[]);
        b.emit(Op::InstanceOf, &[3, 0, 1, 2]);
        b.emit(Op::Ret, &[3]);
        let f = vm.make_function(b.finish());

        let proto = vm.core_mut().new_object();
        let obj = vm.core_mut().new_object_with_proto(proto);
        let other = vm.core_mut().new_object();
        let mut out = Vec::new();
        for (v, base, p) in [
            (obj, proto, proto),
            (other, proto, proto),
            (proto, proto, obj),
            (Value::int(3), proto, proto),
        ] {
            out.push(run_rendered(vm, f, &[v, base, p]));
        }
        out.push(run_rendered(vm, f, &[obj, Value::int(1), obj]));
        out
    };
    assert_eq!(run(&mut jit_vm()), run(&mut interp_vm()));
}

#[test]
fn test_throw_catch_matches_interpreter() {
    let build = |_: &mut VmRuntime| {
        let mut b = UnitBuilder::new("catcher", 0, 2, 8);
        let k = b.const_int(7);
        b.emit(Op::Enter, &[]);
        b.emit(Op::Mov, &[0, k]);
        let throw_at = b.emit(Op::Throw, &[0]);
        let handler = b.emit(Op::Catch, &[1]);
        b.emit(Op::Ret, &[1]);
        b.add_handler(throw_at, handler, handler);
        b.finish()
    };
    check_parity("catch", build, &[&[]]);
}

#[test]
fn test_uncaught_exception_surfaces() {
    let run = |vm: &mut VmRuntime| {
        let mut b = UnitBuilder::new("boom", 0, 1, 8);
        b.emit(Op::Enter, &[]);
        b.emit(Op::NewObject, &[0]);
        b.emit(Op::Throw, &[0]);
        b.emit(Op::Ret, &[0]);
        let f = vm.make_function(b.finish());
        vm.call(f, &[])
    };
    for vm in [&mut jit_vm(), &mut interp_vm()] {
        match run(vm) {
            Err(VmError::Uncaught { message, .. }) => assert_eq!(message, "[object]"),
            other => panic!("expected an uncaught exception, got {other:?}"),
        }
    }
}

#[test]
fn test_exception_unwinds_through_frames() {
    // The callee throws, the caller catches around its call site.
    let run = |vm: &mut VmRuntime| -> String {
        let mut cb = UnitBuilder::new("thrower", 0, 1, 8);
        let k = cb.const_int(13);
        cb.emit(Op::Enter, &[]);
        cb.emit(Op::Mov, &[0, k]);
        cb.emit(Op::Throw, &[0]);
        cb.emit(Op::Ret, &[0]);
        let callee = vm.make_function(cb.finish());
        vm.set_global("thrower", callee);

        let t = vm.intern("thrower");
        let mut b = UnitBuilder::new("caller", 0, 2, 16);
        b.emit(Op::Enter, &[]);
        b.emit(Op::GetGlobal, &[0, t]);
        let call_at = b.emit(Op::Call, &[1, 0, 0, 8]);
        let handler = b.emit(Op::Catch, &[1]);
        b.emit(Op::Ret, &[1]);
        b.add_handler(call_at, handler, handler);
        let f = vm.make_function(b.finish());
        let args: [Value; 0] = [];
        run_rendered(vm, f, &args)
    };
    assert_eq!(run(&mut jit_vm()), "13");
    assert_eq!(run(&mut interp_vm()), "13");
}

#[test]
fn test_scoped_variables() {
    let run = |vm: &mut VmRuntime| -> (String, String) {
        let root = vm.root_scope();
        let outer = vm.new_scope(root, 2);
        vm.set_scope_slot(outer, 0, Value::int(11));
        let inner = vm.new_scope(outer, 1);

        let mut b = UnitBuilder::new("scoped", 0, 1, 8);
        let k = b.const_int(5);
        b.emit(Op::Enter, &[]);
        // Read outer slot 0 through one chain hop, write inner slot 0.
        b.emit(Op::GetScoped, &[0, 1, 0]);
        b.emit(Op::PutScoped, &[0, 0, k]);
        b.emit(Op::Ret, &[0]);
        let f = vm.make_closure(b.finish(), inner);
        let got = run_rendered(vm, f, &[]);
        let written = vm.describe(vm.scope_slot(inner, 0));
        (got, written)
    };
    let jit = run(&mut jit_vm());
    let interp = run(&mut interp_vm());
    assert_eq!(jit, ("11".to_string(), "5".to_string()));
    assert_eq!(jit, interp);
}

#[test]
fn test_fibonacci_through_calls() {
    let build = |vm: &mut VmRuntime| {
        let fib = vm.intern("fib");
        let mut b = UnitBuilder::new("fib", 1, 1, 24);
        let one = b.const_int(1);
        let two = b.const_int(2);
        b.emit(Op::Enter, &[]);
        let recurse_jump = b.emit(Op::JNless, &[0, two, 0]);
        b.emit(Op::Ret, &[0]);
        let recurse = b.here();
        b.patch_jump(recurse_jump, 3, recurse);
        b.emit(Op::GetGlobal, &[1, fib]);
        b.emit(Op::Sub, &[2, 0, one, pack_hints(TypeHint::Unknown, TypeHint::Int)]);
        b.emit(Op::Mov, &[16, 2]);
        b.emit(Op::Call, &[3, 1, 1, 16]);
        b.emit(Op::GetGlobal, &[4, fib]);
        b.emit(Op::Sub, &[5, 0, two, pack_hints(TypeHint::Unknown, TypeHint::Int)]);
        b.emit(Op::Mov, &[16, 5]);
        b.emit(Op::Call, &[6, 4, 1, 16]);
        b.emit(Op::Add, &[7, 3, 6, pack_hints(TypeHint::Unknown, TypeHint::Unknown)]);
        b.emit(Op::Ret, &[7]);
        b.finish()
    };
    let run = |vm: &mut VmRuntime| -> String {
        let unit = build(vm);
        let f = vm.make_function(unit);
        vm.set_global("fib", f);
        run_rendered(vm, f, &[Value::int(10)])
    };
    assert_eq!(run(&mut jit_vm()), "55");
    assert_eq!(run(&mut interp_vm()), "55");
}

#[test]
fn test_native_functions() {
    unsafe extern "C" fn native_sum(
        _ctx: *mut magpie::vm::ExecContext,
        frame: *mut u64,
        _callee: u64,
    ) -> u64 {
        use magpie::vm::bytecode::frame as slots;
        unsafe {
            let argc = *frame.offset(slots::ARG_COUNT as isize) as usize;
            let mut sum = 0i64;
            for i in 0..argc {
                let v = Value(*frame.add(i));
                if v.is_int() {
                    sum += v.as_int();
                }
            }
            Value::int(sum).0
        }
    }

    let run = |vm: &mut VmRuntime| -> String {
        vm.register_native("sum2", 2, native_sum);
        let sym = vm.intern("sum2");
        let mut b = UnitBuilder::new("caller", 2, 2, 16);
        b.emit(Op::Enter, &[]);
        b.emit(Op::GetGlobal, &[2, sym]);
        b.emit(Op::Mov, &[8, 0]);
        b.emit(Op::Mov, &[9, 1]);
        b.emit(Op::Call, &[3, 2, 2, 8]);
        b.emit(Op::Ret, &[3]);
        let f = vm.make_function(b.finish());
        run_rendered(vm, f, &[Value::int(30), Value::int(12)])
    };
    assert_eq!(run(&mut jit_vm()), "42");
    assert_eq!(run(&mut interp_vm()), "42");
}

/// n executions of a loop-back edge under interval N poll exactly
/// floor(n/N) times.
#[test]
fn test_preemption_poll_count() {
    let countdown = || {
        let mut b = UnitBuilder::new("countdown", 1, 1, 8);
        let zero = b.const_int(0);
        let one = b.const_int(1);
        b.emit(Op::Enter, &[]);
        let head = b.here();
        b.emit(Op::Sub, &[0, 0, one, pack_hints(TypeHint::Unknown, TypeHint::Int)]);
        let back = b.emit(Op::LoopIfLess, &[zero, 0, 0]);
        b.patch_jump(back, 3, head);
        b.emit(Op::Ret, &[0]);
        b.finish()
    };
    for (k, interval, expected) in [(95u32, 10u32, 9u64), (100, 10, 10), (3, 10, 0), (40, 1, 40)] {
        for jit_mode in [JitMode::On, JitMode::Off] {
            let mut vm = VmRuntime::new(RuntimeConfig {
                jit_mode,
                preempt_interval: interval,
                ..RuntimeConfig::default()
            });
            let f = vm.make_function(countdown());
            vm.call(f, &[Value::int(k as i64)]).unwrap();
            assert_eq!(
                vm.preempt_ticks(),
                expected,
                "mode {jit_mode:?}, k={k}, interval={interval}"
            );
        }
    }
}

#[test]
fn test_cancellation_stops_loops() {
    let spin = || {
        let mut b = UnitBuilder::new("spin", 0, 1, 8);
        b.emit(Op::Enter, &[]);
        let head = b.here();
        let back = b.emit(Op::Loop, &[0]);
        b.patch_jump(back, 1, head);
        b.emit(Op::Ret, &[0]);
        b.finish()
    };
    for jit_mode in [JitMode::On, JitMode::Off] {
        let mut vm = VmRuntime::new(RuntimeConfig {
            jit_mode,
            preempt_interval: 8,
            ..RuntimeConfig::default()
        });
        let f = vm.make_function(spin());
        vm.cancel();
        match vm.call(f, &[]) {
            Err(VmError::Cancelled) => {}
            other => panic!("expected cancellation in {jit_mode:?}, got {other:?}"),
        }
    }
}

#[test]
fn test_runaway_recursion_is_a_script_error() {
    let build = |vm: &mut VmRuntime| {
        let f = vm.intern("f");
        let mut b = UnitBuilder::new("f", 0, 1, 16);
        b.emit(Op::Enter, &[]);
        b.emit(Op::GetGlobal, &[0, f]);
        b.emit(Op::Call, &[1, 0, 0, 8]);
        b.emit(Op::Ret, &[1]);
        b.finish()
    };
    for jit_mode in [JitMode::On, JitMode::Off] {
        let mut vm = VmRuntime::new(RuntimeConfig {
            jit_mode,
            register_file_words: 2048,
            ..RuntimeConfig::default()
        });
        let unit = build(&mut vm);
        let f = vm.make_function(unit);
        vm.set_global("f", f);
        match vm.call(f, &[]) {
            Err(VmError::Uncaught { message, .. }) => {
                assert_eq!(message, "call stack exhausted")
            }
            other => panic!("expected exhaustion in {jit_mode:?}, got {other:?}"),
        }
        // The VM stays usable afterwards.
        let mut b = UnitBuilder::new("ok", 0, 0, 4);
        let k = b.const_int(1);
        b.emit(Op::Enter, &[]);
        b.emit(Op::Ret, &[k]);
        let ok = vm.make_function(b.finish());
        assert_eq!(vm.call(ok, &[]).unwrap(), Value::int(1));
    }
}

#[test]
fn test_string_concat_and_compare() {
    let build = |_: &mut VmRuntime| {
        let mut b = UnitBuilder::new("concat", 2, 2, 8);
        b.emit(Op::Enter, &[]);
        b.emit(Op::Add, &[2, 0, 1, pack_hints(TypeHint::Unknown, TypeHint::Unknown)]);
        b.emit(Op::Ret, &[2]);
        b.finish()
    };
    check_parity(
        "concat",
        build,
        &[&[Arg::Str("foo"), Arg::Str("bar")], &[Arg::Str(""), Arg::Str("x")]],
    );
}
