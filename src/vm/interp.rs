//! Reference interpreter.
//!
//! Executes the same `CodeUnit`s as the JIT over the same runtime semantics
//! (`vm::ops`). It is the comparison oracle for the compiler's fast/slow
//! path behavior and the execution engine when the JIT is disabled or
//! unsupported.

use std::sync::Arc;

use crate::vm::bytecode::{CodeUnit, FRAME_HEADER_WORDS, Op, frame};
use crate::vm::heap::{CellExt, NativeFn, kind};
use crate::vm::ops::{self, Thrown};
use crate::vm::value::Value;
use crate::vm::vm::{ExecContext, VmCore};

/// Call a function value. Arguments beyond the callee's arity are dropped;
/// missing ones read as undefined.
pub fn call_function(
    core: &mut VmCore,
    ctx: &mut ExecContext,
    f: Value,
    args: &[Value],
) -> Result<Value, Thrown> {
    call_with_budget(core, ctx, f, args, 0)
}

/// `used_words` models the register-file consumption of the frames below
/// this one, so exhaustion behaves like the compiled bound check.
fn call_with_budget(
    core: &mut VmCore,
    ctx: &mut ExecContext,
    f: Value,
    args: &[Value],
    used_words: usize,
) -> Result<Value, Thrown> {
    if !f.is_cell() {
        return Err(core.type_error("value is not callable"));
    }
    let cell = unsafe { &*f.as_cell() };
    match cell.kind {
        kind::FUNCTION => {
            let CellExt::Function { unit, .. } = &cell.ext else {
                unreachable!("function cell without function ext");
            };
            let unit = Arc::clone(unit);
            let scope = Value(cell.w2);
            let used = used_words + unit.num_regs + FRAME_HEADER_WORDS;
            if used > core.config.register_file_words {
                return Err(Thrown(core.intern_string("call stack exhausted")));
            }
            run_unit(core, ctx, &unit, f, scope, args, used)
        }
        kind::NATIVE => call_native(ctx, f, args),
        _ => Err(core.type_error("value is not callable")),
    }
}

fn call_native(ctx: &mut ExecContext, f: Value, args: &[Value]) -> Result<Value, Thrown> {
    // Natives consume the compiled frame ABI, so synthesize a small frame.
    let mut words = vec![0u64; FRAME_HEADER_WORDS + args.len().max(1)];
    let base = unsafe { words.as_mut_ptr().add(FRAME_HEADER_WORDS) };
    unsafe {
        *base.offset(frame::CALLEE as isize) = f.0;
        *base.offset(frame::ARG_COUNT as isize) = args.len() as u64;
        for (i, a) in args.iter().enumerate() {
            *base.add(i) = a.0;
        }
    }
    let func: NativeFn =
        unsafe { std::mem::transmute((*f.as_cell()).w0 as usize) };
    let ret = unsafe { func(ctx, base, f.0) };
    if ctx.exception != 0 {
        return Err(Thrown(Value(std::mem::take(&mut ctx.exception))));
    }
    Ok(Value(ret))
}

struct Frame<'u> {
    unit: &'u CodeUnit,
    regs: Vec<Value>,
}

impl Frame<'_> {
    fn get(&self, operand: u32) -> Value {
        if self.unit.is_constant(operand) {
            self.unit.constant(operand).unwrap_or(Value::UNDEFINED)
        } else {
            self.regs[operand as usize]
        }
    }

    fn set(&mut self, operand: u32, v: Value) {
        self.regs[operand as usize] = v;
    }
}

fn run_unit(
    core: &mut VmCore,
    ctx: &mut ExecContext,
    unit: &CodeUnit,
    callee: Value,
    scope: Value,
    args: &[Value],
    used_words: usize,
) -> Result<Value, Thrown> {
    let mut fr = Frame {
        unit,
        regs: vec![Value::EMPTY; unit.num_regs],
    };
    for i in 0..unit.arity {
        fr.set(i as u32, args.get(i).copied().unwrap_or(Value::UNDEFINED));
    }

    let mut pc: usize = 0;
    let mut countdown = ctx.preempt_interval.max(1);
    let mut pending: Option<Value> = None;

    macro_rules! throwing {
        ($pc:expr, $e:expr) => {
            match $e {
                Ok(v) => v,
                Err(thrown) => {
                    match handle(unit, $pc, thrown) {
                        Ok(target) => {
                            pending = Some(thrown.0);
                            pc = target;
                            continue;
                        }
                        Err(t) => return Err(t),
                    }
                }
            }
        };
    }

    fn handle(unit: &CodeUnit, pc: usize, thrown: Thrown) -> Result<usize, Thrown> {
        match unit.handler_for(pc as u32) {
            Some(h) => Ok(h.target as usize),
            None => Err(thrown),
        }
    }

    loop {
        let op = Op::from_word(unit.code[pc]).expect("interpreter hit invalid opcode");
        let operand = |k: usize| unit.code[pc + k];
        match op {
            Op::Enter => {
                for i in 0..unit.num_vars.max(unit.arity) {
                    if fr.regs[i].is_empty() {
                        fr.regs[i] = Value::UNDEFINED;
                    }
                }
            }
            Op::Mov => {
                let v = fr.get(operand(2));
                fr.set(operand(1), v);
            }
            Op::Add => {
                let (a, b) = (fr.get(operand(2)), fr.get(operand(3)));
                let v = throwing!(pc, ops::add(core, a, b));
                fr.set(operand(1), v);
            }
            Op::Sub => {
                let (a, b) = (fr.get(operand(2)), fr.get(operand(3)));
                let v = throwing!(pc, ops::sub(core, a, b));
                fr.set(operand(1), v);
            }
            Op::Mul => {
                let (a, b) = (fr.get(operand(2)), fr.get(operand(3)));
                let v = throwing!(pc, ops::mul(core, a, b));
                fr.set(operand(1), v);
            }
            Op::Div => {
                let (a, b) = (fr.get(operand(2)), fr.get(operand(3)));
                let v = throwing!(pc, ops::div(core, a, b));
                fr.set(operand(1), v);
            }
            Op::Mod => {
                let (a, b) = (fr.get(operand(2)), fr.get(operand(3)));
                let v = throwing!(pc, ops::rem(core, a, b));
                fr.set(operand(1), v);
            }
            Op::Neg => {
                let a = fr.get(operand(2));
                let v = throwing!(pc, ops::neg(core, a));
                fr.set(operand(1), v);
            }
            Op::PreInc => {
                let a = fr.get(operand(1));
                let v = throwing!(pc, ops::add(core, a, Value::int(1)));
                fr.set(operand(1), v);
            }
            Op::PreDec => {
                let a = fr.get(operand(1));
                let v = throwing!(pc, ops::sub(core, a, Value::int(1)));
                fr.set(operand(1), v);
            }
            Op::BitAnd => {
                let (a, b) = (fr.get(operand(2)), fr.get(operand(3)));
                let v = throwing!(pc, ops::bit_and(core, a, b));
                fr.set(operand(1), v);
            }
            Op::BitOr => {
                let (a, b) = (fr.get(operand(2)), fr.get(operand(3)));
                let v = throwing!(pc, ops::bit_or(core, a, b));
                fr.set(operand(1), v);
            }
            Op::BitXor => {
                let (a, b) = (fr.get(operand(2)), fr.get(operand(3)));
                let v = throwing!(pc, ops::bit_xor(core, a, b));
                fr.set(operand(1), v);
            }
            Op::BitNot => {
                let a = fr.get(operand(2));
                let v = throwing!(pc, ops::bit_not(core, a));
                fr.set(operand(1), v);
            }
            Op::Lsh => {
                let (a, b) = (fr.get(operand(2)), fr.get(operand(3)));
                let v = throwing!(pc, ops::lsh(core, a, b));
                fr.set(operand(1), v);
            }
            Op::Rsh => {
                let (a, b) = (fr.get(operand(2)), fr.get(operand(3)));
                let v = throwing!(pc, ops::rsh(core, a, b));
                fr.set(operand(1), v);
            }
            Op::Eq => {
                let (a, b) = (fr.get(operand(2)), fr.get(operand(3)));
                fr.set(operand(1), Value::bool(ops::loose_eq(a, b)));
            }
            Op::Neq => {
                let (a, b) = (fr.get(operand(2)), fr.get(operand(3)));
                fr.set(operand(1), Value::bool(!ops::loose_eq(a, b)));
            }
            Op::StrictEq => {
                let (a, b) = (fr.get(operand(2)), fr.get(operand(3)));
                fr.set(operand(1), Value::bool(ops::strict_eq(a, b)));
            }
            Op::NStrictEq => {
                let (a, b) = (fr.get(operand(2)), fr.get(operand(3)));
                fr.set(operand(1), Value::bool(!ops::strict_eq(a, b)));
            }
            Op::Less => {
                let (a, b) = (fr.get(operand(2)), fr.get(operand(3)));
                let v = throwing!(pc, ops::less(core, a, b));
                fr.set(operand(1), Value::bool(v));
            }
            Op::LessEq => {
                let (a, b) = (fr.get(operand(2)), fr.get(operand(3)));
                let v = throwing!(pc, ops::less_eq(core, a, b));
                fr.set(operand(1), Value::bool(v));
            }
            Op::Not => {
                let a = fr.get(operand(2));
                fr.set(operand(1), Value::bool(!a.is_truthy()));
            }
            Op::Jmp => {
                pc = jump(pc, operand(1));
                continue;
            }
            Op::JTrue => {
                if fr.get(operand(1)).is_truthy() {
                    pc = jump(pc, operand(2));
                    continue;
                }
            }
            Op::JFalse => {
                if !fr.get(operand(1)).is_truthy() {
                    pc = jump(pc, operand(2));
                    continue;
                }
            }
            Op::JNless => {
                let (a, b) = (fr.get(operand(1)), fr.get(operand(2)));
                let is_less = throwing!(pc, ops::less(core, a, b));
                if !is_less {
                    pc = jump(pc, operand(3));
                    continue;
                }
            }
            Op::Loop => {
                throwing!(pc, poll_preempt(core, ctx, &mut countdown));
                pc = jump(pc, operand(1));
                continue;
            }
            Op::LoopIfTrue => {
                throwing!(pc, poll_preempt(core, ctx, &mut countdown));
                if fr.get(operand(1)).is_truthy() {
                    pc = jump(pc, operand(2));
                    continue;
                }
            }
            Op::LoopIfLess => {
                throwing!(pc, poll_preempt(core, ctx, &mut countdown));
                let (a, b) = (fr.get(operand(1)), fr.get(operand(2)));
                let is_less = throwing!(pc, ops::less(core, a, b));
                if is_less {
                    pc = jump(pc, operand(3));
                    continue;
                }
            }
            Op::LoopIfLessEq => {
                throwing!(pc, poll_preempt(core, ctx, &mut countdown));
                let (a, b) = (fr.get(operand(1)), fr.get(operand(2)));
                let le = throwing!(pc, ops::less_eq(core, a, b));
                if le {
                    pc = jump(pc, operand(3));
                    continue;
                }
            }
            Op::SwitchImm => {
                let table = &unit.switch_tables[operand(1) as usize];
                let scrutinee = fr.get(operand(3));
                let mut offset = operand(2) as i32;
                if scrutinee.is_int() {
                    let i = scrutinee.as_int() - table.min;
                    if (0..table.offsets.len() as i64).contains(&i)
                        && table.offsets[i as usize] != 0
                    {
                        offset = table.offsets[i as usize];
                    }
                }
                pc = (pc as i64 + offset as i64) as usize;
                continue;
            }
            Op::Ret | Op::End => {
                return Ok(fr.get(operand(1)));
            }
            Op::GetProp => {
                let base = fr.get(operand(2));
                let v = throwing!(pc, ops::get_prop(core, base, operand(3)));
                fr.set(operand(1), v);
            }
            Op::PutProp => {
                let (base, src) = (fr.get(operand(1)), fr.get(operand(3)));
                throwing!(pc, ops::put_prop(core, base, operand(2), src));
            }
            Op::DelProp => {
                let base = fr.get(operand(2));
                let v = throwing!(pc, ops::del_prop(core, base, operand(3)));
                fr.set(operand(1), v);
            }
            Op::GetIndex => {
                let (base, idx) = (fr.get(operand(2)), fr.get(operand(3)));
                let v = throwing!(pc, ops::get_index(core, base, idx));
                fr.set(operand(1), v);
            }
            Op::PutIndex => {
                let (base, idx, src) =
                    (fr.get(operand(1)), fr.get(operand(2)), fr.get(operand(3)));
                throwing!(pc, ops::put_index(core, base, idx, src));
            }
            Op::GetGlobal => {
                let global = core.global;
                let v = throwing!(pc, ops::get_prop(core, global, operand(2)));
                fr.set(operand(1), v);
            }
            Op::PutGlobal => {
                let global = core.global;
                let src = fr.get(operand(2));
                throwing!(pc, ops::put_prop(core, global, operand(1), src));
            }
            Op::GetScoped => {
                let v = scoped_slot(scope, operand(2), operand(3));
                fr.set(operand(1), v);
            }
            Op::PutScoped => {
                let v = fr.get(operand(3));
                set_scoped_slot(scope, operand(1), operand(2), v);
            }
            Op::Resolve => {
                let global = core.global;
                let sym = operand(2);
                let v = throwing!(pc, ops::get_prop(core, global, sym));
                if v.is_undefined() {
                    let name = core.symbols.name(sym).to_string();
                    let msg = format!("unresolved identifier: {name}");
                    let err = Thrown(core.intern_string(&msg));
                    throwing!(pc, Err::<Value, _>(err));
                }
                fr.set(operand(1), v);
            }
            Op::NewObject => {
                let v = core.new_object();
                fr.set(operand(1), v);
            }
            Op::NewArray => {
                let len = fr.get(operand(2));
                let len = if len.is_int() { len.as_int().max(0) as usize } else { 0 };
                let v = core.heap.alloc_array(len);
                fr.set(operand(1), v);
            }
            Op::TypeOf => {
                let v = fr.get(operand(2));
                let s = ops::type_of(core, v);
                fr.set(operand(1), s);
            }
            Op::InstanceOf => {
                let (v, base, proto) =
                    (fr.get(operand(2)), fr.get(operand(3)), fr.get(operand(4)));
                let hit = throwing!(pc, ops::instance_of(core, v, base, proto));
                fr.set(operand(1), Value::bool(hit));
            }
            Op::ToNumber => {
                let v = fr.get(operand(2));
                let n = throwing!(pc, ops::to_number(core, v));
                fr.set(operand(1), n);
            }
            Op::Call => {
                let callee = fr.get(operand(2));
                let argc = operand(3) as usize;
                let shift = operand(4) as usize;
                let args: Vec<Value> =
                    (0..argc).map(|i| fr.get((shift + i) as u32)).collect();
                let v = throwing!(pc, call_with_budget(core, ctx, callee, &args, used_words));
                fr.set(operand(1), v);
            }
            Op::Throw => {
                let v = fr.get(operand(1));
                throwing!(pc, Err::<Value, _>(Thrown(v)));
            }
            Op::Catch => {
                let v = pending.take().expect("Catch without a pending exception");
                fr.set(operand(1), v);
            }
        }
        pc += op.length();
    }
}

fn jump(pc: usize, rel: u32) -> usize {
    (pc as i64 + rel as i32 as i64) as usize
}

fn poll_preempt(
    core: &mut VmCore,
    ctx: &mut ExecContext,
    countdown: &mut u64,
) -> Result<Value, Thrown> {
    *countdown -= 1;
    if *countdown == 0 {
        *countdown = ctx.preempt_interval.max(1);
        ctx.preempt_ticks += 1;
        if ctx.cancel != 0 {
            return Err(Thrown(core.intern_string("execution cancelled")));
        }
    }
    Ok(Value::UNDEFINED)
}

fn scoped_slot(scope: Value, skip: u32, slot: u32) -> Value {
    let mut cur = scope;
    for _ in 0..skip {
        cur = Value(unsafe { (*cur.as_cell()).w1 });
    }
    let cell = unsafe { &*cur.as_cell() };
    debug_assert_eq!(cell.kind, kind::SCOPE);
    unsafe { *(cell.w0 as *const Value).add(slot as usize) }
}

fn set_scoped_slot(scope: Value, skip: u32, slot: u32, v: Value) {
    let mut cur = scope;
    for _ in 0..skip {
        cur = Value(unsafe { (*cur.as_cell()).w1 });
    }
    let cell = unsafe { &*cur.as_cell() };
    debug_assert_eq!(cell.kind, kind::SCOPE);
    unsafe { *(cell.w0 as *mut Value).add(slot as usize) = v }
}
