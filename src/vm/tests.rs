//! End-to-end VM tests: hand-built `Program`s exercising the fetch/decode
//! loop, call-frame machinery, and the native builtin surface together,
//! rather than unit-testing `ops_*` helpers in isolation.

use std::cell::RefCell;
use std::rc::Rc;

use crate::atom::{shared, AtomTable};
use crate::bytecode::{BinOp, Constant, FunctionProto, Instr, Program, RegOrConst, GLOBAL_REG};
use crate::host::TestHost;
use crate::object::Object;
use crate::value::Value;

use super::{RuntimeConfig, Vm, VmStatus};

/// Builds a VM the way every test here does. Also initializes `env_logger`
/// (idempotently — repeated calls across tests in the same binary are fine)
/// so `RUST_LOG=m8rscript_runtime=trace cargo test -- --nocapture` surfaces
/// the GC-sweep and suspension logging emitted by `vm::mod`.
fn vm_for(program: Program, host: TestHost) -> Vm {
    let _ = env_logger::builder().is_test(true).try_init();
    let atoms = Rc::new(RefCell::new(AtomTable::new()));
    Vm::new(
        Rc::new(program),
        atoms,
        RuntimeConfig::default(),
        Box::new(host),
    )
}

#[test]
fn arithmetic_returns_value() {
    let root = FunctionProto {
        code: vec![
            Instr::BinOp {
                op: BinOp::Add,
                dst: 0,
                lhs: RegOrConst::Const(0),
                rhs: RegOrConst::Const(1),
            },
            Instr::Ret { nvalues: 1 },
        ],
        constants: vec![Constant::Integer(2), Constant::Integer(3)],
        temp_registers: 1,
        ..Default::default()
    };
    let program = Program {
        functions: vec![root],
        strings: vec![],
        root: 0,
    };
    let mut vm = vm_for(program, TestHost::new());
    vm.start_execution();
    assert_eq!(
        vm.continue_execution(None),
        VmStatus::Finished(Value::Integer(5))
    );
}

#[test]
fn global_println_writes_to_host_console() {
    let mut program = Program::default();
    let hi = program.intern_string("hi");
    let root = FunctionProto {
        code: vec![
            Instr::LoadProp {
                dst: 1,
                obj: RegOrConst::Reg(GLOBAL_REG),
                key: shared::PRINTLN,
            },
            Instr::LoadRefK { dst: 2, konst: 0 },
            Instr::Call {
                callee: 1,
                nparams: 1,
            },
            Instr::Ret { nvalues: 0 },
        ],
        constants: vec![Constant::StringLiteral(hi)],
        temp_registers: 3,
        ..Default::default()
    };
    program.functions.push(root);
    program.root = 0;

    let mut vm = vm_for(program, TestHost::new());
    vm.start_execution();
    assert_eq!(
        vm.continue_execution(None),
        VmStatus::Finished(Value::Undefined)
    );

    let console = vm
        .host_mut()
        .as_any()
        .downcast_mut::<TestHost>()
        .unwrap()
        .console
        .clone();
    assert_eq!(console, "hi\n");
}

#[test]
fn delay_suspends_with_computed_deadline() {
    let root = FunctionProto {
        code: vec![
            Instr::LoadProp {
                dst: 0,
                obj: RegOrConst::Reg(GLOBAL_REG),
                key: shared::DELAY,
            },
            Instr::LoadRefK { dst: 1, konst: 0 },
            Instr::Call {
                callee: 0,
                nparams: 1,
            },
            Instr::Ret { nvalues: 0 },
        ],
        constants: vec![Constant::Integer(10)],
        temp_registers: 2,
        ..Default::default()
    };
    let program = Program {
        functions: vec![root],
        strings: vec![],
        root: 0,
    };
    let mut vm = vm_for(program, TestHost::new());
    vm.start_execution();
    assert_eq!(vm.continue_execution(None), VmStatus::MsDelay(10_000));
}

#[test]
fn closure_call_returns_captured_upvalue() {
    // Inner function: `return x` where `x` is upvalue 0, captured from the
    // root's local register 0 (distance 0 — a direct stack capture).
    let inner = FunctionProto {
        code: vec![Instr::LoadUp { dst: 0, idx: 0 }, Instr::Ret { nvalues: 1 }],
        upvalues: vec![crate::bytecode::UpvalueDesc {
            outer_frame_distance: 0,
            index_in_outer: 0,
            name: 0,
        }],
        temp_registers: 1,
        ..Default::default()
    };

    // Root: put 7 in local 0, materialize a closure over `inner` capturing
    // it, call the closure, and return whatever it returns.
    let root = FunctionProto {
        code: vec![
            Instr::LoadRefK { dst: 0, konst: 0 },
            Instr::Closure {
                dst: 1,
                func_const: 1,
            },
            Instr::Call {
                callee: 1,
                nparams: 0,
            },
            Instr::Ret { nvalues: 1 },
        ],
        constants: vec![Constant::Integer(7), Constant::Function(1)],
        temp_registers: 2,
        ..Default::default()
    };

    let program = Program {
        functions: vec![root, inner],
        strings: vec![],
        root: 0,
    };
    let mut vm = vm_for(program, TestHost::new());
    vm.start_execution();
    let status = vm.continue_execution(None);
    assert_eq!(status, VmStatus::Finished(Value::Integer(7)));
}

#[test]
fn unhandled_error_unwinds_frames_and_closes_upvalues() {
    // Calling a plain integer aborts with `PropertyNotCallable`; the VM
    // should come back with an empty frame stack rather than leaving the
    // aborted call's frame dangling for a later `start_execution` to trip
    // over.
    let root = FunctionProto {
        code: vec![
            Instr::LoadRefK { dst: 0, konst: 0 },
            Instr::Call {
                callee: 0,
                nparams: 0,
            },
            Instr::Ret { nvalues: 0 },
        ],
        constants: vec![Constant::Integer(5)],
        temp_registers: 1,
        ..Default::default()
    };
    let program = Program {
        functions: vec![root],
        strings: vec![],
        root: 0,
    };
    let mut vm = vm_for(program, TestHost::new());
    vm.start_execution();
    let status = vm.continue_execution(None);
    assert!(matches!(status, VmStatus::Error(_)));
    assert!(vm.frames.is_empty());
    assert!(vm.stack.is_empty());
    assert!(vm.open_upvalues.is_empty());
}

#[test]
fn construct_substitutes_instance_when_constructor_returns_non_object() {
    // Constructor does nothing and returns nothing; `new` should still
    // yield the pre-allocated instance, not `undefined`.
    let ctor = FunctionProto {
        code: vec![Instr::Ret { nvalues: 0 }],
        temp_registers: 1,
        ..Default::default()
    };
    let root = FunctionProto {
        code: vec![
            Instr::Closure {
                dst: 0,
                func_const: 0,
            },
            Instr::New {
                callee: 0,
                nparams: 0,
            },
            Instr::Ret { nvalues: 1 },
        ],
        constants: vec![Constant::Function(1)],
        temp_registers: 1,
        ..Default::default()
    };
    let program = Program {
        functions: vec![root, ctor],
        strings: vec![],
        root: 0,
    };
    let mut vm = vm_for(program, TestHost::new());
    vm.start_execution();
    let status = vm.continue_execution(None);
    let Value::Object(h) = (match status {
        VmStatus::Finished(v) => v,
        other => panic!("expected a constructed instance, got {other:?}"),
    }) else {
        panic!("expected an object")
    };
    match vm.arena.get(h) {
        Some(Object::Mater(m)) => assert!(m.class.is_some(), "expected the instance, with its class field set by `new`"),
        other => panic!("expected a Mater instance, got {other:?}"),
    }
}

#[test]
fn construct_uses_constructors_own_object_return_value() {
    // Constructor returns a fresh object of its own; `new` should yield
    // *that* object rather than the one it pre-allocated for `this`.
    let ctor = FunctionProto {
        code: vec![
            Instr::LoadLitO { dst: 0 },
            Instr::Ret { nvalues: 1 },
        ],
        temp_registers: 1,
        ..Default::default()
    };
    let root = FunctionProto {
        code: vec![
            Instr::Closure {
                dst: 0,
                func_const: 0,
            },
            Instr::New {
                callee: 0,
                nparams: 0,
            },
            Instr::Ret { nvalues: 1 },
        ],
        constants: vec![Constant::Function(1)],
        temp_registers: 1,
        ..Default::default()
    };
    let program = Program {
        functions: vec![root, ctor],
        strings: vec![],
        root: 0,
    };
    let mut vm = vm_for(program, TestHost::new());
    vm.start_execution();
    let status = vm.continue_execution(None);
    let Value::Object(h) = (match status {
        VmStatus::Finished(v) => v,
        other => panic!("expected an object, got {other:?}"),
    }) else {
        panic!("expected an object")
    };
    match vm.arena.get(h) {
        Some(Object::Mater(m)) => assert!(
            m.class.is_none(),
            "expected the constructor's own returned object, not the pre-allocated instance"
        ),
        other => panic!("expected a Mater object, got {other:?}"),
    }
}

#[test]
fn gpio_round_trip_through_host() {
    let mut program = Program::default();
    let root = FunctionProto {
        code: vec![Instr::Ret { nvalues: 0 }],
        temp_registers: 1,
        ..Default::default()
    };
    program.functions.push(root);
    program.root = 0;

    let mut host = TestHost::new();
    host.set_pin_mode(4, crate::host::PinMode::Output).unwrap();
    host.digital_write(4, true).unwrap();

    let mut vm = vm_for(program, host);
    vm.start_execution();
    assert_eq!(
        vm.continue_execution(None),
        VmStatus::Finished(Value::Undefined)
    );

    let host_ref = vm.host_mut().as_any().downcast_mut::<TestHost>().unwrap();
    assert!(host_ref.digital_read(4).unwrap());
}
