//! # Native proto-object dispatch
//!
//! This module installs and serves the runtime's script-visible standard
//! library: the free `Global` functions plus the `Base64`, `JSON`, `GPIO`,
//! `TCP`, `UDP`, and `IPAddr` proto-objects (spec §6). Generalizes the
//! teacher's `call_builtin` dispatch-by-name table to dispatch-by-`NativeFnId`
//! instead, and moves every capability that touches the outside world (the
//! console, the clock, a GPIO pin) behind [`crate::host::Host`] rather than
//! reaching for `std::io`/`std::fs` directly the way the teacher's
//! `file_open`/`file_read` did.
//!
//! ## Provided globals
//! - **Free functions:** `print`, `println`, `printf`, `currentTime`,
//!   `delay`, `toFloat`, `toInt`, `toUInt`, `arguments`
//! - **`Base64`:** `encode`, `decode`
//! - **`JSON`:** `parse`, `stringify`
//! - **`GPIO`:** `setPinMode`, `digitalRead`, `digitalWrite`, `onInterrupt`,
//!   plus the `PinMode`/`Trigger` constant tables
//! - **`TCP`/`UDP`/`IPAddr`:** `create` stubs — this host doesn't drive a
//!   socket event loop yet, so these raise rather than silently no-op
//!
//! ## Error conventions
//! Arity/type mismatches raise `ErrorKind::Type` or `ErrorKind::Value`; a
//! malformed `printf` format string raises `ErrorKind::BadFormatString` or
//! `ErrorKind::UnknownFormatSpecifier`, matching spec §7's taxonomy exactly.

use crate::atom::shared;
use crate::error::{Error, ErrorKind};
use crate::host::{PinMode, Trigger};
use crate::object::Object;
use crate::value::{NativeFnId, Value};

use super::Vm;

const PRINT: NativeFnId = 1;
const PRINTLN: NativeFnId = 2;
const PRINTF: NativeFnId = 3;
const CURRENT_TIME: NativeFnId = 4;
const DELAY: NativeFnId = 5;
const TO_FLOAT: NativeFnId = 6;
const TO_INT: NativeFnId = 7;
const TO_UINT: NativeFnId = 8;
const ARGUMENTS: NativeFnId = 9;
const BASE64_ENCODE: NativeFnId = 10;
const BASE64_DECODE: NativeFnId = 11;
const JSON_PARSE: NativeFnId = 12;
const JSON_STRINGIFY: NativeFnId = 13;
const GPIO_SET_PIN_MODE: NativeFnId = 14;
const GPIO_DIGITAL_READ: NativeFnId = 15;
const GPIO_DIGITAL_WRITE: NativeFnId = 16;
const GPIO_ON_INTERRUPT: NativeFnId = 17;
pub(super) const ARRAY_ITERATOR_CREATE: NativeFnId = 18;
pub(super) const ARRAY_ITER_NEXT: NativeFnId = 19;
pub(super) const ARRAY_ITER_DONE: NativeFnId = 20;
const SOCKET_CREATE: NativeFnId = 21;
const IP_ADDR_CREATE: NativeFnId = 22;

/// Populate the global object with every native free function and
/// proto-object. Called once by `Vm::new`.
pub(super) fn install_globals(vm: &mut Vm) {
    vm.set_global(shared::PRINT, Value::NativeFunction(PRINT, None));
    vm.set_global(shared::PRINTLN, Value::NativeFunction(PRINTLN, None));
    vm.set_global(shared::PRINTF, Value::NativeFunction(PRINTF, None));
    vm.set_global(
        shared::CURRENT_TIME,
        Value::NativeFunction(CURRENT_TIME, None),
    );
    vm.set_global(shared::DELAY, Value::NativeFunction(DELAY, None));
    vm.set_global(shared::TO_FLOAT, Value::NativeFunction(TO_FLOAT, None));
    vm.set_global(shared::TO_INT, Value::NativeFunction(TO_INT, None));
    vm.set_global(shared::TO_UINT, Value::NativeFunction(TO_UINT, None));
    vm.set_global(shared::ARGUMENTS, Value::NativeFunction(ARGUMENTS, None));

    let base64 = vm.alloc_mater();
    vm.set_object_prop(
        base64,
        shared::ENCODE,
        Value::NativeFunction(BASE64_ENCODE, Some(base64)),
    );
    vm.set_object_prop(
        base64,
        shared::DECODE,
        Value::NativeFunction(BASE64_DECODE, Some(base64)),
    );
    vm.set_global(shared::BASE64, Value::Object(base64));

    let json = vm.alloc_mater();
    vm.set_object_prop(
        json,
        shared::PARSE,
        Value::NativeFunction(JSON_PARSE, Some(json)),
    );
    vm.set_object_prop(
        json,
        shared::STRINGIFY,
        Value::NativeFunction(JSON_STRINGIFY, Some(json)),
    );
    vm.set_global(shared::JSON, Value::Object(json));

    let gpio = vm.alloc_mater();
    vm.set_object_prop(
        gpio,
        shared::SET_PIN_MODE,
        Value::NativeFunction(GPIO_SET_PIN_MODE, Some(gpio)),
    );
    vm.set_object_prop(
        gpio,
        shared::DIGITAL_READ,
        Value::NativeFunction(GPIO_DIGITAL_READ, Some(gpio)),
    );
    vm.set_object_prop(
        gpio,
        shared::DIGITAL_WRITE,
        Value::NativeFunction(GPIO_DIGITAL_WRITE, Some(gpio)),
    );
    vm.set_object_prop(
        gpio,
        shared::ON_INTERRUPT,
        Value::NativeFunction(GPIO_ON_INTERRUPT, Some(gpio)),
    );

    let pin_mode = vm.alloc_mater();
    for (name, code) in [
        ("Input", PinMode::Input as i32),
        ("Output", PinMode::Output as i32),
        ("InputPullup", PinMode::InputPullup as i32),
        ("InputPulldown", PinMode::InputPulldown as i32),
        ("OutputOpenDrain", PinMode::OutputOpenDrain as i32),
    ] {
        let atom = vm.atomize(name);
        vm.set_object_prop(pin_mode, atom, Value::Integer(code));
    }
    vm.set_object_prop(gpio, shared::PIN_MODE, Value::Object(pin_mode));

    let trigger = vm.alloc_mater();
    for (name, code) in [
        ("None", Trigger::None as i32),
        ("RisingEdge", Trigger::RisingEdge as i32),
        ("FallingEdge", Trigger::FallingEdge as i32),
        ("BothEdges", Trigger::BothEdges as i32),
        ("Low", Trigger::Low as i32),
        ("High", Trigger::High as i32),
    ] {
        let atom = vm.atomize(name);
        vm.set_object_prop(trigger, atom, Value::Integer(code));
    }
    vm.set_object_prop(gpio, shared::TRIGGER, Value::Object(trigger));
    vm.set_global(shared::GPIO, Value::Object(gpio));

    // No socket event loop is wired up behind `Host` yet; `TCP`/`UDP` are
    // exposed so scripts written against the full surface still parse and
    // resolve, but `.create()` raises rather than pretending to connect.
    let tcp = vm.alloc_mater();
    vm.set_object_prop(
        tcp,
        shared::CREATE,
        Value::NativeFunction(SOCKET_CREATE, Some(tcp)),
    );
    vm.set_global(shared::TCP, Value::Object(tcp));

    let udp = vm.alloc_mater();
    vm.set_object_prop(
        udp,
        shared::CREATE,
        Value::NativeFunction(SOCKET_CREATE, Some(udp)),
    );
    vm.set_global(shared::UDP, Value::Object(udp));

    let ip_addr = vm.alloc_mater();
    vm.set_object_prop(
        ip_addr,
        shared::CREATE,
        Value::NativeFunction(IP_ADDR_CREATE, None),
    );
    vm.set_global(shared::IP_ADDR, Value::Object(ip_addr));
}

pub(super) fn dispatch(
    vm: &mut Vm,
    id: NativeFnId,
    this: Value,
    args: &[Value],
) -> Result<Value, Error> {
    match id {
        PRINT => {
            for a in args {
                let s = display(vm, *a);
                vm.host.console_write(&s);
            }
            Ok(Value::Undefined)
        }
        PRINTLN => {
            for a in args {
                let s = display(vm, *a);
                vm.host.console_write(&s);
            }
            vm.host.console_write("\n");
            Ok(Value::Undefined)
        }
        PRINTF => {
            let fmt = args
                .first()
                .and_then(|v| vm.string_of(*v))
                .ok_or_else(|| ErrorKind::Type.into_error("printf expects a format string".into()))?;
            let out = format_printf(vm, &fmt, &args[1.min(args.len())..])?;
            vm.host.console_write(&out);
            Ok(Value::Undefined)
        }
        CURRENT_TIME => Ok(Value::Float(vm.host.current_time_us() as f64)),
        DELAY => {
            let ms = args.first().copied().map(as_f64).unwrap_or(0.0);
            vm.request_delay(ms.max(0.0) as u64);
            Ok(Value::Undefined)
        }
        TO_FLOAT => Ok(parse_number(vm, args, false)),
        TO_INT => Ok(parse_number(vm, args, true)),
        TO_UINT => {
            let v = parse_number(vm, args, true);
            match v {
                Value::Integer(i) if i < 0 => Ok(Value::Undefined),
                other => Ok(other),
            }
        }
        ARGUMENTS => {
            let args = vm.current_arguments();
            Ok(vm.alloc_array(args))
        }
        BASE64_ENCODE => {
            let s = string_arg(vm, args, 0, "Base64.encode")?;
            Ok(vm.alloc_string(base64_encode(s.as_bytes())))
        }
        BASE64_DECODE => {
            let s = string_arg(vm, args, 0, "Base64.decode")?;
            let bytes = base64_decode(&s)
                .ok_or_else(|| ErrorKind::Value.into_error("invalid base64 input".into()))?;
            let decoded = String::from_utf8_lossy(&bytes).into_owned();
            Ok(vm.alloc_string(decoded))
        }
        JSON_PARSE => {
            let s = string_arg(vm, args, 0, "JSON.parse")?;
            json::parse(vm, &s)
        }
        JSON_STRINGIFY => {
            let v = args
                .first()
                .copied()
                .ok_or_else(|| ErrorKind::Type.into_error("JSON.stringify expects a value".into()))?;
            let mut out = String::new();
            json::stringify(vm, v, &mut out)?;
            Ok(vm.alloc_string(out))
        }
        GPIO_SET_PIN_MODE => {
            let pin = int_arg(args, 0, "GPIO.setPinMode")? as u32;
            let mode = int_to_pin_mode(int_arg(args, 1, "GPIO.setPinMode")?)?;
            vm.host
                .set_pin_mode(pin, mode)
                .map_err(|e| e.0.into_error(e.1))?;
            Ok(Value::Undefined)
        }
        GPIO_DIGITAL_READ => {
            let pin = int_arg(args, 0, "GPIO.digitalRead")? as u32;
            let v = vm.host.digital_read(pin).map_err(|e| e.0.into_error(e.1))?;
            Ok(Value::Integer(v as i32))
        }
        GPIO_DIGITAL_WRITE => {
            let pin = int_arg(args, 0, "GPIO.digitalWrite")? as u32;
            let value = args.get(1).map(|v| v.as_bool()).unwrap_or(false);
            vm.host
                .digital_write(pin, value)
                .map_err(|e| e.0.into_error(e.1))?;
            Ok(Value::Undefined)
        }
        GPIO_ON_INTERRUPT => {
            // Real interrupt delivery needs an async event source re-entering
            // the VM through a `VmStatus::Waiting` suspension; no host in
            // this tree drives one, so registration is accepted but never
            // fires. See the module doc comment for the suspension contract.
            Ok(Value::Undefined)
        }
        ARRAY_ITERATOR_CREATE => {
            let target = this;
            Ok(vm.alloc_array(vec![target, Value::Integer(0)]))
        }
        ARRAY_ITER_NEXT => {
            let (target, index, handle) = iterator_state(vm, this)?;
            let v = super::ops_struct::load_elt(vm, target, Value::Integer(index))?;
            bump_iterator_index(vm, handle, index + 1);
            Ok(v)
        }
        ARRAY_ITER_DONE => {
            let (target, index, _) = iterator_state(vm, this)?;
            let len = iterable_len(vm, target)?;
            Ok(Value::Integer((index >= len) as i32))
        }
        SOCKET_CREATE => Err(ErrorKind::InternalError
            .into_error("this host does not support socket creation".into())),
        IP_ADDR_CREATE => {
            let a = int_arg(args, 0, "IPAddr.create")?;
            let b = int_arg(args, 1, "IPAddr.create")?;
            let c = int_arg(args, 2, "IPAddr.create")?;
            let d = int_arg(args, 3, "IPAddr.create")?;
            Ok(vm.alloc_string(format!("{a}.{b}.{c}.{d}")))
        }
        other => Err(ErrorKind::InternalError
            .into_error(format!("no native function registered for id {other}"))),
    }
}

fn iterator_state(vm: &Vm, this: Value) -> Result<(Value, i32, crate::object::ObjectHandle), Error> {
    let Value::Object(handle) = this else {
        return Err(ErrorKind::Type.into_error("iterator state is not an object".into()));
    };
    let Some(Object::Array(a)) = vm.arena.get(handle) else {
        return Err(ErrorKind::Type.into_error("iterator state is malformed".into()));
    };
    let target = a.get(0);
    let index = match a.get(1) {
        Value::Integer(i) => i,
        _ => 0,
    };
    Ok((target, index, handle))
}

fn bump_iterator_index(vm: &mut Vm, handle: crate::object::ObjectHandle, new_index: i32) {
    if let Some(Object::Array(a)) = vm.arena.get_mut(handle) {
        a.set(1, Value::Integer(new_index));
    }
}

fn iterable_len(vm: &Vm, v: Value) -> Result<i32, Error> {
    match v {
        Value::Object(h) => match vm.arena.get(h) {
            Some(Object::Array(a)) => Ok(a.elements.len() as i32),
            _ => Err(ErrorKind::NotIndexable.into_error("value is not iterable".into())),
        },
        Value::StringLiteral(idx) => Ok(vm.program().string_literal(idx).chars().count() as i32),
        Value::StringObject(h) => Ok(vm
            .arena
            .get(h)
            .and_then(Object::as_str)
            .map(|s| s.chars().count())
            .unwrap_or(0) as i32),
        _ => Err(ErrorKind::NotIndexable.into_error("value is not iterable".into())),
    }
}

fn as_f64(v: Value) -> f64 {
    match v {
        Value::Integer(i) => i as f64,
        Value::Float(f) => f,
        _ => 0.0,
    }
}

fn int_arg(args: &[Value], index: usize, ctx: &str) -> Result<i32, Error> {
    match args.get(index) {
        Some(Value::Integer(i)) => Ok(*i),
        Some(Value::Float(f)) => Ok(*f as i32),
        Some(other) => Err(ErrorKind::Type.into_error(format!(
            "{ctx}: argument {index} must be a number, got {}",
            other.type_name()
        ))),
        None => Err(ErrorKind::WrongNumberOfParams.into_error(format!("{ctx}: missing argument {index}"))),
    }
}

fn string_arg(vm: &Vm, args: &[Value], index: usize, ctx: &str) -> Result<String, Error> {
    args.get(index)
        .and_then(|v| vm.string_of(*v))
        .ok_or_else(|| ErrorKind::Type.into_error(format!("{ctx}: argument {index} must be a string")))
}

fn int_to_pin_mode(code: i32) -> Result<PinMode, Error> {
    Ok(match code {
        0 => PinMode::Input,
        1 => PinMode::Output,
        2 => PinMode::InputPullup,
        3 => PinMode::InputPulldown,
        4 => PinMode::OutputOpenDrain,
        other => {
            return Err(ErrorKind::Value.into_error(format!("unknown PinMode value {other}")))
        }
    })
}

/// Stringify `v` for `print`/`println`/`%s`, matching the teacher's
/// `display_value`-style conversion rather than a debug dump.
fn display(vm: &Vm, v: Value) -> String {
    if let Some(s) = vm.string_of(v) {
        return s;
    }
    match v {
        Value::None => "none".to_string(),
        Value::Null => "null".to_string(),
        Value::Undefined => "undefined".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Object(h) => match vm.arena.get(h) {
            Some(Object::Array(a)) => {
                let parts: Vec<String> = a.elements.iter().map(|e| display(vm, *e)).collect();
                format!("[{}]", parts.join(","))
            }
            _ => "object".to_string(),
        },
        Value::NativeFunction(..) => "function".to_string(),
        other => other.type_name().to_string(),
    }
}

fn parse_number(vm: &Vm, args: &[Value], as_int: bool) -> Value {
    let Some(s) = args.first().and_then(|v| vm.string_of(*v)) else {
        return Value::Undefined;
    };
    let allow_whitespace = args.get(1).map(|v| v.as_bool()).unwrap_or(false);
    let trimmed = if allow_whitespace { s.trim() } else { s.as_str() };
    if trimmed.is_empty() {
        return Value::Undefined;
    }
    if as_int {
        match trimmed.parse::<i32>() {
            Ok(i) => Value::Integer(i),
            Err(_) => match trimmed.parse::<f64>() {
                Ok(f) => Value::Integer(f as i32),
                Err(_) => Value::Undefined,
            },
        }
    } else {
        match trimmed.parse::<f64>() {
            Ok(f) => Value::Float(f),
            Err(_) => Value::Undefined,
        }
    }
}

// ---- printf mini-language -------------------------------------------------

fn take_arg(args: &[Value], arg_idx: &mut usize) -> Result<Value, Error> {
    let v = args.get(*arg_idx).copied().ok_or_else(|| {
        ErrorKind::BadFormatString.into_error("not enough arguments for format string".into())
    })?;
    *arg_idx += 1;
    Ok(v)
}

/// `%[0][width][.prec](c|s|d|i|x|X|u|f|e|E|g|G|p)`, with `%%` as a literal
/// percent sign. One conversion consumes one argument; running out of
/// arguments or naming an unknown conversion character is a format error
/// (spec §7).
fn format_printf(vm: &Vm, fmt: &str, args: &[Value]) -> Result<String, Error> {
    let mut out = String::new();
    let mut chars = fmt.chars().peekable();
    let mut arg_idx = 0usize;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }

        let zero_pad = chars.peek() == Some(&'0');
        if zero_pad {
            chars.next();
        }
        let mut width = String::new();
        while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
            width.push(chars.next().unwrap());
        }
        let mut prec: Option<usize> = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut p = String::new();
            while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                p.push(chars.next().unwrap());
            }
            prec = Some(p.parse().unwrap_or(0));
        }
        let width: usize = width.parse().unwrap_or(0);
        let conv = chars
            .next()
            .ok_or_else(|| ErrorKind::BadFormatString.into_error("truncated format specifier".into()))?;

        let piece = match conv {
            'c' => {
                let v = take_arg(args, &mut arg_idx)?;
                match v {
                    Value::Integer(code) => char::from_u32(code as u32).unwrap_or('\u{FFFD}').to_string(),
                    other => display(vm, other),
                }
            }
            's' => {
                let v = take_arg(args, &mut arg_idx)?;
                let s = display(vm, v);
                match prec {
                    Some(p) => s.chars().take(p).collect(),
                    None => s,
                }
            }
            'd' | 'i' => (as_f64(take_arg(args, &mut arg_idx)?) as i64).to_string(),
            'u' => (as_f64(take_arg(args, &mut arg_idx)?) as i64 as u32).to_string(),
            'x' => format!("{:x}", as_f64(take_arg(args, &mut arg_idx)?) as i64 as u32),
            'X' => format!("{:X}", as_f64(take_arg(args, &mut arg_idx)?) as i64 as u32),
            'f' => format!("{:.*}", prec.unwrap_or(6), as_f64(take_arg(args, &mut arg_idx)?)),
            'e' => format!("{:.*e}", prec.unwrap_or(6), as_f64(take_arg(args, &mut arg_idx)?)),
            'E' => format!("{:.*E}", prec.unwrap_or(6), as_f64(take_arg(args, &mut arg_idx)?)),
            'g' | 'G' => format!("{}", as_f64(take_arg(args, &mut arg_idx)?)),
            'p' => match take_arg(args, &mut arg_idx)? {
                Value::Object(h) => format!("0x{:x}", h.index),
                _ => "0x0".to_string(),
            },
            other => {
                return Err(ErrorKind::UnknownFormatSpecifier
                    .into_error(format!("unknown format specifier '%{other}'")))
            }
        };

        if piece.len() < width {
            let pad_char = if zero_pad { '0' } else { ' ' };
            out.extend(std::iter::repeat(pad_char).take(width - piece.len()));
        }
        out.push_str(&piece);
    }
    Ok(out)
}

// ---- Base64 ----------------------------------------------------------------

const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn base64_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() + 2) / 3 * 4);
    for chunk in data.chunks(3) {
        let b0 = chunk[0];
        let b1 = chunk.get(1).copied().unwrap_or(0);
        let b2 = chunk.get(2).copied().unwrap_or(0);
        let n = ((b0 as u32) << 16) | ((b1 as u32) << 8) | b2 as u32;
        out.push(BASE64_ALPHABET[(n >> 18 & 0x3f) as usize] as char);
        out.push(BASE64_ALPHABET[(n >> 12 & 0x3f) as usize] as char);
        out.push(if chunk.len() > 1 {
            BASE64_ALPHABET[(n >> 6 & 0x3f) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            BASE64_ALPHABET[(n & 0x3f) as usize] as char
        } else {
            '='
        });
    }
    out
}

fn base64_decode(s: &str) -> Option<Vec<u8>> {
    fn val(c: u8) -> Option<u32> {
        match c {
            b'A'..=b'Z' => Some((c - b'A') as u32),
            b'a'..=b'z' => Some((c - b'a' + 26) as u32),
            b'0'..=b'9' => Some((c - b'0' + 52) as u32),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }
    let filtered: Vec<u8> = s.bytes().filter(|&b| b != b'\n' && b != b'\r').collect();
    let mut out = Vec::with_capacity(filtered.len() / 4 * 3);
    for chunk in filtered.chunks(4) {
        if chunk.len() < 2 {
            return None;
        }
        let c0 = val(chunk[0])?;
        let c1 = val(chunk[1])?;
        let c2 = if chunk.len() > 2 && chunk[2] != b'=' {
            Some(val(chunk[2])?)
        } else {
            None
        };
        let c3 = if chunk.len() > 3 && chunk[3] != b'=' {
            Some(val(chunk[3])?)
        } else {
            None
        };
        let n = (c0 << 18) | (c1 << 12) | (c2.unwrap_or(0) << 6) | c3.unwrap_or(0);
        out.push((n >> 16) as u8);
        if c2.is_some() {
            out.push((n >> 8) as u8);
        }
        if c3.is_some() {
            out.push(n as u8);
        }
    }
    Some(out)
}

// ---- JSON -------------------------------------------------------------------

mod json {
    use super::*;

    pub(super) fn stringify(vm: &Vm, v: Value, out: &mut String) -> Result<(), Error> {
        match v {
            Value::None | Value::Null | Value::Undefined => out.push_str("null"),
            Value::Integer(i) => out.push_str(&i.to_string()),
            Value::Float(f) => out.push_str(&f.to_string()),
            Value::StringLiteral(_) | Value::StringObject(_) => {
                let s = vm.string_of(v).unwrap_or_default();
                push_json_string(out, &s);
            }
            Value::Object(h) => match vm.arena.get(h) {
                Some(Object::Array(a)) => {
                    out.push('[');
                    for (i, e) in a.elements.iter().enumerate() {
                        if i > 0 {
                            out.push(',');
                        }
                        stringify(vm, *e, out)?;
                    }
                    out.push(']');
                }
                Some(Object::Mater(m)) => {
                    out.push('{');
                    for (i, (key, value)) in m.iter().enumerate() {
                        if i > 0 {
                            out.push(',');
                        }
                        push_json_string(out, &vm.atom_name(*key));
                        out.push(':');
                        stringify(vm, *value, out)?;
                    }
                    out.push('}');
                }
                _ => {
                    return Err(ErrorKind::Type.into_error("value is not JSON-serializable".into()))
                }
            },
            _ => return Err(ErrorKind::Type.into_error("value is not JSON-serializable".into())),
        }
        Ok(())
    }

    fn push_json_string(out: &mut String, s: &str) {
        out.push('"');
        for c in s.chars() {
            match c {
                '"' => out.push_str("\\\""),
                '\\' => out.push_str("\\\\"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
                c => out.push(c),
            }
        }
        out.push('"');
    }

    struct P<'a> {
        bytes: &'a [u8],
        pos: usize,
    }

    impl<'a> P<'a> {
        fn peek(&self) -> Option<u8> {
            self.bytes.get(self.pos).copied()
        }

        fn bump(&mut self) -> Option<u8> {
            let b = self.peek();
            if b.is_some() {
                self.pos += 1;
            }
            b
        }

        fn skip_ws(&mut self) {
            while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
                self.pos += 1;
            }
        }

        fn expect(&mut self, b: u8) -> Result<(), Error> {
            if self.bump() == Some(b) {
                Ok(())
            } else {
                Err(ErrorKind::Value.into_error(format!("expected '{}' in JSON input", b as char)))
            }
        }
    }

    pub(super) fn parse(vm: &mut Vm, s: &str) -> Result<Value, Error> {
        let mut p = P {
            bytes: s.as_bytes(),
            pos: 0,
        };
        p.skip_ws();
        let v = parse_value(vm, &mut p)?;
        p.skip_ws();
        Ok(v)
    }

    fn parse_value(vm: &mut Vm, p: &mut P) -> Result<Value, Error> {
        p.skip_ws();
        match p.peek() {
            Some(b'{') => parse_object(vm, p),
            Some(b'[') => parse_array(vm, p),
            Some(b'"') => Ok(parse_string(vm, p)?),
            Some(b't') => {
                expect_literal(p, "true")?;
                Ok(Value::Integer(1))
            }
            Some(b'f') => {
                expect_literal(p, "false")?;
                Ok(Value::Integer(0))
            }
            Some(b'n') => {
                expect_literal(p, "null")?;
                Ok(Value::Null)
            }
            Some(b'-') | Some(b'0'..=b'9') => parse_number(p),
            _ => Err(ErrorKind::Value.into_error("unexpected character in JSON input".into())),
        }
    }

    fn expect_literal(p: &mut P, lit: &str) -> Result<(), Error> {
        for b in lit.bytes() {
            if p.bump() != Some(b) {
                return Err(ErrorKind::Value.into_error(format!("expected '{lit}' in JSON input")));
            }
        }
        Ok(())
    }

    fn parse_number(p: &mut P) -> Result<Value, Error> {
        let start = p.pos;
        if p.peek() == Some(b'-') {
            p.bump();
        }
        while matches!(p.peek(), Some(b'0'..=b'9')) {
            p.bump();
        }
        let mut is_float = false;
        if p.peek() == Some(b'.') {
            is_float = true;
            p.bump();
            while matches!(p.peek(), Some(b'0'..=b'9')) {
                p.bump();
            }
        }
        if matches!(p.peek(), Some(b'e' | b'E')) {
            is_float = true;
            p.bump();
            if matches!(p.peek(), Some(b'+' | b'-')) {
                p.bump();
            }
            while matches!(p.peek(), Some(b'0'..=b'9')) {
                p.bump();
            }
        }
        let text = std::str::from_utf8(&p.bytes[start..p.pos]).unwrap_or("0");
        if is_float {
            text.parse::<f64>()
                .map(Value::Float)
                .map_err(|_| ErrorKind::Value.into_error("invalid number in JSON input".into()))
        } else {
            text.parse::<i32>()
                .map(Value::Integer)
                .or_else(|_| {
                    text.parse::<f64>()
                        .map(Value::Float)
                        .map_err(|_| ErrorKind::Value.into_error("invalid number in JSON input".into()))
                })
        }
    }

    fn parse_raw_string(p: &mut P) -> Result<String, Error> {
        p.expect(b'"')?;
        let mut s = String::new();
        loop {
            match p.bump() {
                None => return Err(ErrorKind::Value.into_error("unterminated JSON string".into())),
                Some(b'"') => break,
                Some(b'\\') => match p.bump() {
                    Some(b'"') => s.push('"'),
                    Some(b'\\') => s.push('\\'),
                    Some(b'/') => s.push('/'),
                    Some(b'n') => s.push('\n'),
                    Some(b't') => s.push('\t'),
                    Some(b'r') => s.push('\r'),
                    Some(b'b') => s.push('\u{8}'),
                    Some(b'f') => s.push('\u{c}'),
                    Some(b'u') => {
                        let mut code = 0u32;
                        for _ in 0..4 {
                            let c = p.bump().ok_or_else(|| {
                                ErrorKind::Value.into_error("truncated \\u escape in JSON input".into())
                            })?;
                            code = code * 16
                                + (c as char).to_digit(16).ok_or_else(|| {
                                    ErrorKind::Value.into_error("invalid \\u escape in JSON input".into())
                                })?;
                        }
                        s.push(char::from_u32(code).unwrap_or('\u{FFFD}'));
                    }
                    _ => return Err(ErrorKind::Value.into_error("invalid escape in JSON input".into())),
                },
                Some(b) => s.push(b as char),
            }
        }
        Ok(s)
    }

    fn parse_string(vm: &mut Vm, p: &mut P) -> Result<Value, Error> {
        let s = parse_raw_string(p)?;
        Ok(vm.alloc_string(s))
    }

    fn parse_array(vm: &mut Vm, p: &mut P) -> Result<Value, Error> {
        p.expect(b'[')?;
        let mut elements = Vec::new();
        p.skip_ws();
        if p.peek() == Some(b']') {
            p.bump();
            return Ok(vm.alloc_array(elements));
        }
        loop {
            elements.push(parse_value(vm, p)?);
            p.skip_ws();
            match p.bump() {
                Some(b',') => continue,
                Some(b']') => break,
                _ => return Err(ErrorKind::Value.into_error("expected ',' or ']' in JSON input".into())),
            }
        }
        Ok(vm.alloc_array(elements))
    }

    fn parse_object(vm: &mut Vm, p: &mut P) -> Result<Value, Error> {
        p.expect(b'{')?;
        let handle = vm.alloc_mater();
        p.skip_ws();
        if p.peek() == Some(b'}') {
            p.bump();
            return Ok(Value::Object(handle));
        }
        loop {
            p.skip_ws();
            let key = parse_raw_string(p)?;
            p.skip_ws();
            p.expect(b':')?;
            let value = parse_value(vm, p)?;
            let atom = vm.atomize(&key);
            vm.set_object_prop(handle, atom, value);
            p.skip_ws();
            match p.bump() {
                Some(b',') => continue,
                Some(b'}') => break,
                _ => return Err(ErrorKind::Value.into_error("expected ',' or '}' in JSON input".into())),
            }
        }
        Ok(Value::Object(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NullHost;
    use crate::bytecode::Program;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn test_vm() -> Vm {
        Vm::new(
            Rc::new(Program::default()),
            Rc::new(RefCell::new(crate::atom::AtomTable::new())),
            super::RuntimeConfig::default(),
            Box::new(NullHost),
        )
    }

    #[test]
    fn base64_round_trips() {
        let encoded = base64_encode(b"hello world");
        assert_eq!(encoded, "aGVsbG8gd29ybGQ=");
        assert_eq!(base64_decode(&encoded).unwrap(), b"hello world");
    }

    #[test]
    fn printf_basic_specifiers() {
        let mut vm = test_vm();
        let s = vm.alloc_string("x".to_string());
        let out = format_printf(&vm, "%d-%s-%05d", &[Value::Integer(3), s, Value::Integer(7)]).unwrap();
        assert_eq!(out, "3-x-00007");
    }

    #[test]
    fn printf_unknown_specifier_errors() {
        let vm = test_vm();
        let err = format_printf(&vm, "%q", &[]).unwrap_err();
        assert!(matches!(
            err,
            Error::Runtime(ErrorKind::UnknownFormatSpecifier, _)
        ));
    }

    #[test]
    fn printf_missing_argument_errors() {
        let vm = test_vm();
        let err = format_printf(&vm, "%d", &[]).unwrap_err();
        assert!(matches!(err, Error::Runtime(ErrorKind::BadFormatString, _)));
    }

    #[test]
    fn json_stringify_matches_expected_shape() {
        let mut vm = test_vm();
        let inner = vm.alloc_array(vec![Value::Integer(2), Value::Integer(3)]);
        let handle = vm.alloc_mater();
        let a = vm.atomize("a");
        let b = vm.atomize("b");
        vm.set_object_prop(handle, a, Value::Integer(1));
        vm.set_object_prop(handle, b, inner);
        let mut out = String::new();
        json::stringify(&vm, Value::Object(handle), &mut out).unwrap();
        assert_eq!(out, "{\"a\":1,\"b\":[2,3]}");
    }

    #[test]
    fn json_parse_round_trips_object() {
        let mut vm = test_vm();
        let v = json::parse(&mut vm, "{\"a\":1,\"b\":[2,3]}").unwrap();
        let mut out = String::new();
        json::stringify(&vm, v, &mut out).unwrap();
        assert_eq!(out, "{\"a\":1,\"b\":[2,3]}");
    }

    #[test]
    fn to_int_parses_with_whitespace_option() {
        let mut vm = test_vm();
        let s = vm.alloc_string("  42  ".to_string());
        assert_eq!(parse_number(&vm, &[s, Value::Integer(1)], true), Value::Integer(42));
        assert_eq!(parse_number(&vm, &[s], true), Value::Undefined);
    }
}
