//! # Structural operations: property/element load, store, and literal build-up
//!
//! Generalizes the teacher's `ops_struct.rs` (list/dict build, index,
//! attribute access over `Rc<RefCell<_>>` collections) to this runtime's
//! object model: ordered `MaterObject` property maps, dense `Array`s, and
//! heap/literal strings, all addressed through arena handles instead of
//! `Rc<RefCell<_>>`.
//!
//! ## Property resolution order
//! Reading `obj.key` checks, in order: the object's own properties, then
//! (if the object was constructed via `new` from some class) the class
//! template's own properties, then falls through to `undefined` — there is
//! no prototype chain beyond one level (spec §9 decision, see `DESIGN.md`).
//!
//! ## Error behavior
//! - Indexing a non-array/non-string/non-object value → `NotIndexable`.
//! - Calling `.prop` on a value with no property map → `Type`.
//! - Nothing here ever panics on a missing key; absent properties read as
//!   `Value::Undefined`, matching ordinary dynamic-object semantics.

use crate::atom::{shared, Atom};
use crate::error::{Error, ErrorKind};
use crate::object::{Array, Object, ObjectHandle};
use crate::value::Value;

use super::builtins;
use super::Vm;

fn not_indexable(v: Value) -> Error {
    ErrorKind::NotIndexable.into_error(format!("{} is not indexable", v.type_name()))
}

/// Final fallback of the "own → class own → global" resolution order: look
/// `key` up on the runtime's global object, or `undefined` if it's absent
/// there too.
fn global_prop(vm: &Vm, key: Atom) -> Value {
    match vm.arena.get(vm.globals) {
        Some(Object::Mater(globals)) => globals.get(key).unwrap_or(Value::Undefined),
        _ => Value::Undefined,
    }
}

/// Resolve `obj.key`: own property → class-template own property → global
/// object property → `undefined` (spec §9 "own → class own → global").
pub(super) fn load_prop(vm: &mut Vm, obj: Value, key: Atom) -> Result<Value, Error> {
    match obj {
        Value::Object(h) => {
            let Some(object) = vm.arena.get(h) else {
                return Ok(Value::Undefined);
            };
            match object {
                Object::Mater(m) => {
                    if let Some(v) = m.get(key) {
                        return Ok(v);
                    }
                    if let Some(class) = m.class {
                        if let Some(Object::Mater(class_obj)) = vm.arena.get(class) {
                            if let Some(v) = class_obj.get(key) {
                                return Ok(v);
                            }
                        }
                    }
                    Ok(global_prop(vm, key))
                }
                Object::Array(a) => Ok(array_prop(h, a, key)),
                Object::Closure(_) => Ok(Value::Undefined),
                Object::Str(_) => unreachable!("Str lives under StringObject, not Object"),
            }
        }
        Value::StringObject(h) => {
            let s = vm.arena.get(h).and_then(Object::as_str).unwrap_or("");
            Ok(string_prop(s, key))
        }
        Value::StringLiteral(idx) => {
            let s = vm.program().string_literal(idx).to_string();
            Ok(string_prop(&s, key))
        }
        _ => Err(not_indexable(obj)),
    }
}

pub(super) fn load_elt(vm: &mut Vm, obj: Value, idx: Value) -> Result<Value, Error> {
    let i = as_index(idx)?;
    match obj {
        Value::Object(h) => match vm.arena.get(h) {
            Some(Object::Array(a)) => Ok(a.get(i)),
            _ => Err(not_indexable(obj)),
        },
        Value::StringObject(h) => {
            let s = vm.arena.get(h).and_then(Object::as_str).unwrap_or("");
            Ok(char_at(s, i))
        }
        Value::StringLiteral(sidx) => {
            let s = vm.program().string_literal(sidx).to_string();
            Ok(char_at(&s, i))
        }
        _ => Err(not_indexable(obj)),
    }
}

pub(super) fn sto_prop(vm: &mut Vm, obj: Value, key: Atom, val: Value) -> Result<(), Error> {
    match obj {
        Value::Object(h) => match vm.arena.get_mut(h) {
            Some(Object::Mater(m)) => {
                m.set(key, val);
                Ok(())
            }
            Some(_) => Err(ErrorKind::Type.into_error("value has no writable properties".into())),
            None => Ok(()),
        },
        _ => Err(not_indexable(obj)),
    }
}

pub(super) fn sto_elt(vm: &mut Vm, obj: Value, idx: Value, val: Value) -> Result<(), Error> {
    let i = as_index(idx)?;
    match obj {
        Value::Object(h) => match vm.arena.get_mut(h) {
            Some(Object::Array(a)) => {
                a.set(i, val);
                Ok(())
            }
            _ => Err(not_indexable(obj)),
        },
        _ => Err(not_indexable(obj)),
    }
}

pub(super) fn append_elt(vm: &mut Vm, arr: Value, val: Value) -> Result<(), Error> {
    match arr {
        Value::Object(h) => match vm.arena.get_mut(h) {
            Some(Object::Array(a)) => {
                a.elements.push(val);
                Ok(())
            }
            _ => Err(not_indexable(arr)),
        },
        _ => Err(not_indexable(arr)),
    }
}

pub(super) fn append_prop(vm: &mut Vm, obj: Value, key: Atom, val: Value) -> Result<(), Error> {
    match obj {
        Value::Object(h) => match vm.arena.get_mut(h) {
            Some(Object::Mater(m)) => {
                m.set(key, val);
                Ok(())
            }
            _ => Err(not_indexable(obj)),
        },
        _ => Err(not_indexable(obj)),
    }
}

fn as_index(v: Value) -> Result<i32, Error> {
    match v {
        Value::Integer(i) => Ok(i),
        Value::Float(f) => Ok(f as i32),
        other => Err(ErrorKind::Type.into_error(format!(
            "{} is not a valid index",
            other.type_name()
        ))),
    }
}

/// `length` plus the iterator protocol (spec §4.6): `.iterator()` hands back
/// a fresh two-slot cursor object `[target, index]`, and that cursor object
/// (itself a plain `Array`, so this same function resolves its properties
/// too) answers `.next()`/`.done()` against the slots it was built with.
fn array_prop(handle: ObjectHandle, a: &Array, key: Atom) -> Value {
    if key == shared::LENGTH {
        Value::Integer(a.elements.len() as i32)
    } else if key == shared::ITERATOR {
        Value::NativeFunction(builtins::ARRAY_ITERATOR_CREATE, Some(handle))
    } else if key == shared::NEXT {
        Value::NativeFunction(builtins::ARRAY_ITER_NEXT, Some(handle))
    } else if key == shared::DONE {
        Value::NativeFunction(builtins::ARRAY_ITER_DONE, Some(handle))
    } else {
        Value::Undefined
    }
}

fn string_prop(s: &str, key: Atom) -> Value {
    if key == crate::atom::shared::LENGTH {
        Value::Integer(s.chars().count() as i32)
    } else {
        Value::Undefined
    }
}

fn char_at(s: &str, i: i32) -> Value {
    if i < 0 {
        return Value::Undefined;
    }
    match s.chars().nth(i as usize) {
        Some(c) => Value::Integer(c as i32),
        None => Value::Undefined,
    }
}
