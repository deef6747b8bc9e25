//! # Arithmetic, comparison, and bitwise operations
//!
//! Generalizes the teacher's `ops_arith.rs` (stack-popping handlers over an
//! untyped `Value::Int`) to this runtime's `Integer`/`Float` split: numeric
//! binary ops promote to `Float` if either operand is one, otherwise stay
//! `Integer`; `+` additionally supports string concatenation exactly the way
//! the teacher's `handle_add` special-cases `Value::Str`.
//!
//! ## Type & coercion rules
//! - `+` : `Integer + Integer` → `Integer`; either side `Float` → `Float`;
//!   either side a string (literal or heap) → concatenate both sides'
//!   display form into a fresh heap string.
//! - `-`, `*`, `/`, `%` : numeric only, same int/float promotion as `+`.
//!   Integer `/`/`%` by zero is `ZeroDivision`; float division by zero
//!   follows IEEE 754 (`inf`/`NaN`), matching the host float type.
//! - `&`, `|`, `^`, `<<`, `>>`, `>>>` : integer only (operands truncate
//!   float input the way the teacher's `as_int()` did).
//! - `==`/`!=` : cross-type `Integer`/`Float` compare numerically; strings
//!   compare by content; objects/arrays/closures compare by arena identity;
//!   anything else compares by variant equality.
//! - `<`/`<=`/`>`/`>=` : numeric comparison, or lexicographic string
//!   comparison if both sides are strings.
//!
//! ## Error behavior
//! - Division/modulo by zero (integer) → `Error::ZeroDivision`.
//! - Non-numeric operands to a numeric-only op → `ErrorKind::Type`.

use crate::bytecode::{BinOp, UnOp};
use crate::error::{Error, ErrorKind};
use crate::value::Value;

use super::Vm;

#[derive(Clone, Copy)]
enum Num {
    Int(i32),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    fn into_value(self) -> Value {
        match self {
            Num::Int(i) => Value::Integer(i),
            Num::Float(f) => Value::Float(f),
        }
    }
}

fn type_err(v: Value, ctx: &str) -> Error {
    ErrorKind::Type.into_error(format!("{} is not a valid operand for {}", v.type_name(), ctx))
}

fn to_num(v: Value, ctx: &str) -> Result<Num, Error> {
    match v {
        Value::Integer(i) => Ok(Num::Int(i)),
        Value::Float(f) => Ok(Num::Float(f)),
        other => Err(type_err(other, ctx)),
    }
}

fn to_int(v: Value, ctx: &str) -> Result<i32, Error> {
    match v {
        Value::Integer(i) => Ok(i),
        Value::Float(f) => Ok(f as i32),
        other => Err(type_err(other, ctx)),
    }
}

fn is_stringish(v: Value) -> bool {
    matches!(v, Value::StringLiteral(_) | Value::StringObject(_))
}

fn display_value(vm: &Vm, v: Value) -> String {
    if let Some(s) = vm.string_of(v) {
        return s;
    }
    match v {
        Value::None => "none".to_string(),
        Value::Null => "null".to_string(),
        Value::Undefined => "undefined".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::NativeFunction(..) => "function".to_string(),
        Value::Object(_) => "object".to_string(),
        other => other.type_name().to_string(),
    }
}

fn numeric_binop(
    l: Value,
    r: Value,
    ctx: &str,
    int_op: impl Fn(i32, i32) -> i32,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, Error> {
    match (to_num(l, ctx)?, to_num(r, ctx)?) {
        (Num::Int(a), Num::Int(b)) => Ok(Value::Integer(int_op(a, b))),
        (a, b) => Ok(Value::Float(float_op(a.as_f64(), b.as_f64()))),
    }
}

pub(super) fn eval_binop(vm: &mut Vm, op: BinOp, l: Value, r: Value) -> Result<Value, Error> {
    use BinOp::*;
    match op {
        Add => {
            if is_stringish(l) || is_stringish(r) {
                let mut s = display_value(vm, l);
                s.push_str(&display_value(vm, r));
                return Ok(vm.alloc_string(s));
            }
            numeric_binop(l, r, "+", i32::wrapping_add, |a, b| a + b)
        }
        Sub => numeric_binop(l, r, "-", i32::wrapping_sub, |a, b| a - b),
        Mul => numeric_binop(l, r, "*", i32::wrapping_mul, |a, b| a * b),
        Div => match (to_num(l, "/")?, to_num(r, "/")?) {
            (Num::Int(_), Num::Int(0)) => Err(Error::ZeroDivision),
            (Num::Int(a), Num::Int(b)) => Ok(Value::Integer(a / b)),
            (a, b) => Ok(Value::Float(a.as_f64() / b.as_f64())),
        },
        Mod => match (to_num(l, "%")?, to_num(r, "%")?) {
            (Num::Int(_), Num::Int(0)) => Err(Error::ZeroDivision),
            (Num::Int(a), Num::Int(b)) => Ok(Value::Integer(a % b)),
            (a, b) => Ok(Value::Float(a.as_f64() % b.as_f64())),
        },
        And => Ok(Value::Integer(to_int(l, "&")? & to_int(r, "&")?)),
        Or => Ok(Value::Integer(to_int(l, "|")? | to_int(r, "|")?)),
        Xor => Ok(Value::Integer(to_int(l, "^")? ^ to_int(r, "^")?)),
        Shl => Ok(Value::Integer(
            to_int(l, "<<")?.wrapping_shl(to_int(r, "<<")? as u32 & 31),
        )),
        // Per the instruction set's own naming, `Shr` is the signed `>>`
        // (sign-extending) and `Sar` is the unsigned logical `>>>`.
        Shr => Ok(Value::Integer(
            to_int(l, ">>")?.wrapping_shr(to_int(r, ">>")? as u32 & 31),
        )),
        Sar => {
            let a = to_int(l, ">>>")? as u32;
            let b = to_int(r, ">>>")? as u32 & 31;
            Ok(Value::Integer((a >> b) as i32))
        }
        Lor => Ok(Value::Integer((l.as_bool() || r.as_bool()) as i32)),
        Land => Ok(Value::Integer((l.as_bool() && r.as_bool()) as i32)),
        Eq => Ok(Value::Integer(values_equal(vm, l, r)? as i32)),
        Ne => Ok(Value::Integer(!values_equal(vm, l, r)? as i32)),
        Lt => compare(vm, l, r, "<", |o| o == std::cmp::Ordering::Less),
        Le => compare(vm, l, r, "<=", |o| o != std::cmp::Ordering::Greater),
        Gt => compare(vm, l, r, ">", |o| o == std::cmp::Ordering::Greater),
        Ge => compare(vm, l, r, ">=", |o| o != std::cmp::Ordering::Less),
    }
}

fn compare(
    vm: &Vm,
    l: Value,
    r: Value,
    ctx: &str,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> Result<Value, Error> {
    if is_stringish(l) && is_stringish(r) {
        let a = vm.string_of(l).unwrap_or_default();
        let b = vm.string_of(r).unwrap_or_default();
        return Ok(Value::Integer(accept(a.cmp(&b)) as i32));
    }
    let a = to_num(l, ctx)?.as_f64();
    let b = to_num(r, ctx)?.as_f64();
    let ord = a.partial_cmp(&b).ok_or_else(|| {
        ErrorKind::Type.into_error(format!("cannot order NaN with {}", ctx))
    })?;
    Ok(Value::Integer(accept(ord) as i32))
}

/// Structural equality used by both `==`/`!=` and switch `CaseTest`.
pub(super) fn values_equal(vm: &Vm, a: Value, b: Value) -> Result<bool, Error> {
    let eq = match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Null, Value::Null) => true,
        (Value::Undefined, Value::Undefined) => true,
        (Value::Integer(x), Value::Integer(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Integer(x), Value::Float(y)) | (Value::Float(y), Value::Integer(x)) => {
            x as f64 == y
        }
        _ if is_stringish(a) && is_stringish(b) => {
            vm.string_of(a).unwrap_or_default() == vm.string_of(b).unwrap_or_default()
        }
        (Value::Object(x), Value::Object(y)) => x == y,
        (Value::StringObject(x), Value::StringObject(y)) => x == y,
        (Value::NativeFunction(fx, bx), Value::NativeFunction(fy, by)) => fx == fy && bx == by,
        _ => false,
    };
    Ok(eq)
}

pub(super) fn eval_unop(
    vm: &mut Vm,
    op: UnOp,
    src: crate::bytecode::RegOrConst,
) -> Result<Value, Error> {
    use UnOp::*;
    let v = vm.operand(src);
    match op {
        UPlus => Ok(to_num(v, "unary +")?.into_value()),
        UMinus => match to_num(v, "unary -")? {
            Num::Int(i) => Ok(Value::Integer(i.wrapping_neg())),
            Num::Float(f) => Ok(Value::Float(-f)),
        },
        UNot => Ok(Value::Integer(!v.as_bool() as i32)),
        UNeg => Ok(Value::Integer(!to_int(v, "~")?)),
        PreInc | PreDec | PostInc | PostDec => {
            let crate::bytecode::RegOrConst::Reg(r) = src else {
                return Err(ErrorKind::Type.into_error(
                    "increment/decrement target must be a register".into(),
                ));
            };
            let old = to_num(v, "++/--")?;
            let delta = if matches!(op, PreInc | PostInc) { 1 } else { -1 };
            let new = match old {
                Num::Int(i) => Num::Int(i.wrapping_add(delta)),
                Num::Float(f) => Num::Float(f + delta as f64),
            };
            vm.set_reg(r, new.into_value());
            Ok(if matches!(op, PreInc | PreDec) {
                new.into_value()
            } else {
                old.into_value()
            })
        }
        // `PropertyRef`/`ElementRef` are transient l-value markers that the
        // emitter always resolves into a load before a value reaches a
        // register; `Deref` exists for the degenerate case where one
        // nonetheless shows up here, and just forces the read.
        Deref => match v {
            Value::PropertyRef(h, key) => super::ops_struct::load_prop(vm, Value::Object(h), key),
            Value::ElementRef(h, idx) => {
                super::ops_struct::load_elt(vm, Value::Object(h), Value::Integer(idx))
            }
            other => Ok(other),
        },
    }
}
