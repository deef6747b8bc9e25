//! # Control-flow and call-frame operations
//!
//! Closures, calls, `new`, and `return`, generalized from the teacher's
//! `ops_control.rs` (which pushed/popped `ret_stack`/`env_stack` entries
//! around a flat operand stack) to this runtime's call-frame model: a call
//! reserves a fresh register window at the top of the shared value stack
//! instead of pushing a new environment dict, and a return copies one value
//! back into the caller's window before popping it.

use crate::bytecode::{Constant, Reg};
use crate::error::{Error, ErrorKind};
use crate::object::{Closure, Object, Upvalue};
use crate::value::Value;

use super::{CallFrame, Vm};

/// `this` is always bound at local register 0 of any function that needs
/// it (function literals and class methods reserve it there at parse time);
/// the root frame's register 0 is simply `Undefined` by the same
/// convention, so no special-casing is needed at the top level.
pub(super) fn current_this(vm: &Vm) -> Value {
    vm.reg(0)
}

pub(super) fn load_upvalue(vm: &Vm, idx: u16) -> Value {
    let cell = vm.frames.last().expect("no active frame").upvalues[idx as usize].clone();
    let v = match &*cell.borrow() {
        Upvalue::Open(stack_index) => vm.stack[*stack_index],
        Upvalue::Closed(v) => *v,
    };
    v
}

pub(super) fn store_upvalue(vm: &mut Vm, idx: u16, val: Value) {
    let cell = vm.frames.last().expect("no active frame").upvalues[idx as usize].clone();
    let mut cell_ref = cell.borrow_mut();
    match &mut *cell_ref {
        Upvalue::Open(stack_index) => vm.stack[*stack_index] = val,
        Upvalue::Closed(v) => *v = val,
    }
}

/// Build a closure over the function named by constant `func_const`,
/// resolving each of its `UpvalueDesc`s against the currently executing
/// frame (distance 0: capture a local register directly off the shared
/// stack; distance 1: share a cell already captured by *this* frame's own
/// closure).
pub(super) fn make_closure(vm: &mut Vm, func_const: u16) -> Value {
    let (function_id, base) = {
        let proto = vm.current_proto();
        let function_id = match proto.constants[func_const as usize] {
            Constant::Function(id) => id,
            other => unreachable!("Closure operand must be a Function constant, got {other:?}"),
        };
        (function_id, vm.frames.last().expect("no active frame").base)
    };
    let target = vm.program().function(function_id);
    let mut upvalues = Vec::with_capacity(target.upvalues.len());
    for desc in &target.upvalues {
        let cell = if desc.outer_frame_distance == 0 {
            vm.find_or_open_upvalue(base + desc.index_in_outer as usize)
        } else {
            vm.frames.last().expect("no active frame").upvalues[desc.index_in_outer as usize]
                .clone()
        };
        upvalues.push(cell);
    }
    let this = current_this(vm);
    let handle = vm.arena.alloc(Object::Closure(Closure {
        function: function_id,
        upvalues,
        this,
    }));
    Value::Object(handle)
}

/// Shared setup for `Call`/`New`: reserve a register window for `function`,
/// copy the contiguous argument block `callee+1..=callee+nparams` from the
/// caller's window into the callee's locals (missing trailing parameters
/// default to `Undefined`, extra arguments are simply ignored — the
/// lenient-arity calling convention), and push the new frame.
fn push_call_frame(
    vm: &mut Vm,
    function: crate::bytecode::FunctionId,
    upvalues: Vec<crate::object::UpvalueCell>,
    this: Value,
    caller_base: usize,
    callee: Reg,
    nparams: u16,
    return_reg: Option<Reg>,
    construct_this: Option<Value>,
) {
    let proto = vm.program().function(function);
    let formal_count = proto.formal_param_count as usize;
    let frame_size = proto.frame_size().max(1);
    let new_base = vm.stack.len();
    vm.stack.resize(new_base + frame_size, Value::Undefined);

    let args_base = caller_base + callee as usize + 1;
    let copy_count = (nparams as usize).min(formal_count);
    for i in 0..copy_count {
        vm.stack[new_base + i] = vm.stack[args_base + i];
    }
    // Local slot 0 doubles as the `this` binding when this function expects
    // one; a function never both declares a first formal parameter and an
    // implicit `this` at the same slot, so overwriting here is always safe.
    if formal_count > 0 {
        vm.stack[new_base] = this;
    }

    vm.frames.push(CallFrame {
        function,
        pc: 0,
        base: new_base,
        upvalues,
        return_reg,
        args_base,
        nargs: nparams,
        construct_this,
    });
}

pub(super) fn call(vm: &mut Vm, callee: Reg, nparams: u16) -> Result<(), Error> {
    let caller_base = vm.frames.last().expect("no active frame").base;
    let callee_val = vm.reg(callee);
    match callee_val {
        Value::Object(h) => {
            let closure = vm
                .arena
                .get(h)
                .and_then(Object::as_closure)
                .cloned()
                .ok_or_else(|| {
                    ErrorKind::PropertyNotCallable.into_error("value is not callable".into())
                })?;
            push_call_frame(
                vm,
                closure.function,
                closure.upvalues,
                closure.this,
                caller_base,
                callee,
                nparams,
                Some(callee),
                None,
            );
            Ok(())
        }
        Value::NativeFunction(id, bound_this) => {
            let args_base = caller_base + callee as usize + 1;
            let args = vm.stack[args_base..args_base + nparams as usize].to_vec();
            let this = bound_this.map(Value::Object).unwrap_or(Value::Undefined);
            let result = super::builtins::dispatch(vm, id, this, &args)?;
            vm.set_reg(callee, result);
            Ok(())
        }
        _ => Err(ErrorKind::PropertyNotCallable.into_error(format!(
            "{} is not callable",
            callee_val.type_name()
        ))),
    }
}

/// `new Ctor(args)`: allocates a fresh instance object (its `class` field
/// set to the constructor's own closure, for the "own → class own → global"
/// property lookup order), invokes the constructor with that instance bound
/// as `this`, and leaves the instance in `callee` once the call returns
/// *unless* the constructor itself returned an object, in which case that
/// object wins instead (spec §4.5 `NEW`).
pub(super) fn construct(vm: &mut Vm, callee: Reg, nparams: u16) -> Result<(), Error> {
    let caller_base = vm.frames.last().expect("no active frame").base;
    let callee_val = vm.reg(callee);
    let Value::Object(h) = callee_val else {
        return Err(
            ErrorKind::PropertyNotCallable.into_error("new target is not a constructor".into())
        );
    };
    let closure = vm
        .arena
        .get(h)
        .and_then(Object::as_closure)
        .cloned()
        .ok_or_else(|| {
            ErrorKind::PropertyNotCallable.into_error("new target is not a constructor".into())
        })?;

    let mut instance = crate::object::MaterObject::new();
    instance.class = Some(h);
    let instance_handle = vm.arena.alloc(Object::Mater(instance));
    let this = Value::Object(instance_handle);

    // `return_reg: Some(callee)` so `ret` can read back whatever the
    // constructor actually returned; `construct_this` carries the
    // pre-allocated instance so `ret` can fall back to it when that return
    // value isn't itself an object.
    push_call_frame(
        vm,
        closure.function,
        closure.upvalues,
        this,
        caller_base,
        callee,
        nparams,
        Some(callee),
        Some(this),
    );
    Ok(())
}

/// Pop the current frame. Returns `Some(value)` once the *root* frame
/// returns (there is no caller left to resume), signalling the fetch loop
/// to finish; otherwise writes the return value into the caller's
/// `return_reg` (when present) and leaves the caller to resume at its saved
/// `pc`. For a frame pushed by `new`, the constructor's own return value is
/// substituted with the pre-allocated instance unless it is itself an
/// object, per spec §4.5 `NEW`.
pub(super) fn ret(vm: &mut Vm, nvalues: u8) -> Option<Value> {
    let value = if nvalues == 0 {
        Value::Undefined
    } else {
        vm.reg(0)
    };
    let frame = vm.frames.pop().expect("no active frame");
    vm.close_upvalues_from(frame.base);
    vm.stack.truncate(frame.base);

    let value = match frame.construct_this {
        Some(instance) if !matches!(value, Value::Object(_) | Value::StringObject(_)) => instance,
        Some(_) | None => value,
    };

    if vm.frames.is_empty() {
        return Some(value);
    }
    if let Some(dst) = frame.return_reg {
        vm.set_reg(dst, value);
    }
    None
}
