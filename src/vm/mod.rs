//! # Register-based bytecode virtual machine (runtime)
//!
//! Generalizes the teacher's stack-based fetch/decode/execute loop (`pc`,
//! `advance_pc`, per-instruction dispatch delegating to `ops_*` submodules)
//! to this runtime's register machine: each call frame owns a fixed-size
//! register file (`FunctionProto::frame_size`) instead of pushing/popping an
//! operand stack, and a jump's offset is relative to the instruction that
//! follows it, so `pc` is advanced *before* dispatch the same way the
//! teacher's loop advances after.
//!
//! ## High-level model
//! - **Frames (`frames`)**: one [`CallFrame`] per active function activation,
//!   each with its own register file, program counter, and upvalue list.
//! - **Arena (`arena`)**: the GC-managed object heap (`gc::Arena`).
//! - **Globals (`globals`)**: a single always-alive `MaterObject`, addressed
//!   through the register sentinel [`bytecode::GLOBAL_REG`].
//! - **Fuel**: `continue_execution` runs at most `fuel` instructions before
//!   yielding control back to the host, so a single script can't starve a
//!   cooperative scheduler.
//!
//! `VmStatus::Waiting` is part of the suspension contract (spec §4.5) for a
//! native call that completes asynchronously (socket accept, DNS lookup),
//! but no native call in this tree produces it yet: every host this crate
//! ships errors eagerly on socket creation rather than suspending (see
//! `vm::builtins`), so there is no event-delivery mechanism to re-enter the
//! VM with a completed event. Wiring a real one is left to an embedder with
//! an actual async I/O source to drive it from.

pub mod builtins;
mod gc;
mod ops_arith;
mod ops_control;
mod ops_struct;

#[cfg(test)]
mod tests;

use std::rc::Rc;

use crate::atom::{Atom, AtomTable};
use crate::bytecode::{FunctionId, Instr, Program, Reg, RegOrConst, GLOBAL_REG};
use crate::error::Error;
use crate::host::Host;
use crate::object::{Array, MaterObject, Object, ObjectHandle, Upvalue, UpvalueCell};
use crate::value::Value;

pub use gc::Arena;

/// One function activation: its program counter, captured upvalues, and
/// where to deliver its eventual return value. Registers themselves live in
/// the VM's single flat `stack`, addressed as `stack[base + reg]` — a flat
/// stack (rather than one `Vec<Value>` per frame) is what lets an `Open`
/// upvalue name a still-live ancestor frame's register by plain index and
/// keep seeing writes to it for as long as that frame is on the stack.
struct CallFrame {
    function: FunctionId,
    pc: usize,
    base: usize,
    upvalues: Vec<UpvalueCell>,
    /// Register in the *caller's* frame to receive this call's return value,
    /// or `None` for the root/outermost frame (which has no caller).
    return_reg: Option<Reg>,
    /// Where (and how many of) the caller's actual arguments live, still
    /// addressable for as long as this frame is active — backs the
    /// `arguments()` builtin, which sees every argument the caller passed
    /// even beyond the callee's own formal parameter count.
    args_base: usize,
    nargs: u16,
    /// `Some(instance)` only for a frame pushed by `new`: the pre-allocated
    /// instance to substitute for the constructor's own return value unless
    /// that value is itself an object (spec §4.5 `NEW`).
    construct_this: Option<Value>,
}

/// Suspension state after a `continue_execution` slice (spec §3
/// "Suspension points").
#[derive(Debug, Clone, PartialEq)]
pub enum VmStatus {
    /// Still runnable; the fuel slice ran out before the program finished.
    Running,
    /// Suspended in a `delay(ms)`-style builtin until `deadline_ms` (an
    /// opaque host clock reading) has elapsed.
    MsDelay(u64),
    /// Waiting on a host event (socket readable, GPIO interrupt, ...).
    Waiting,
    /// Cooperative yield point; the event queue is only drained here.
    Yield,
    /// Program ran to completion.
    Finished(Value),
    /// An unhandled error propagated out of the root frame.
    Error(Error),
    /// `request_termination` was honored.
    Terminated,
}

/// Explicit-injection runtime configuration (ambient-stack addition).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub fuel_per_slice: u32,
    pub max_delay_ms: u64,
    pub gc_allocation_threshold: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            fuel_per_slice: 10_000,
            max_delay_ms: 6_000_000,
            gc_allocation_threshold: 4096,
        }
    }
}

pub struct Vm {
    pub(crate) arena: Arena,
    pub(crate) globals: ObjectHandle,
    program: Rc<Program>,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Upvalue cells still in `Open` state, keyed by the absolute stack
    /// index they point into. Sorted by index isn't required for
    /// correctness (lookups/removals are linear scans); activation depth on
    /// embedded targets is small enough that this beats a `BTreeMap`.
    open_upvalues: Vec<(usize, UpvalueCell)>,
    config: RuntimeConfig,
    terminated: bool,
    pub(crate) host: Box<dyn Host>,
    /// Set by the `delay(ms)` builtin; consumed by `continue_execution` right
    /// after the `Call` instruction that set it finishes, turning it into a
    /// `VmStatus::MsDelay` suspension instead of an ordinary register write.
    pending_delay: Option<u64>,
    /// The same table the program was parsed against — carried alongside
    /// `Program` (rather than folded into it) so multiple programs can
    /// share one atom namespace across reloads. Needed at runtime both to
    /// turn a property atom back into its name (`JSON.stringify`) and to
    /// mint fresh atoms for names only seen at runtime (`JSON.parse`).
    atoms: Rc<std::cell::RefCell<AtomTable>>,
}

impl Vm {
    /// Build a VM over `program`, installing the native global surface
    /// (`print`, `JSON`, `Base64`, `GPIO`, ...) against `host` (spec §6).
    pub fn new(
        program: Rc<Program>,
        atoms: Rc<std::cell::RefCell<AtomTable>>,
        config: RuntimeConfig,
        host: Box<dyn Host>,
    ) -> Self {
        let mut arena = Arena::new();
        let globals = arena.alloc(Object::Mater(MaterObject::new()));
        let mut vm = Vm {
            arena,
            globals,
            program,
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            config,
            terminated: false,
            host,
            atoms,
            pending_delay: None,
        };
        builtins::install_globals(&mut vm);
        vm
    }

    pub(crate) fn atom_name(&self, a: Atom) -> String {
        self.atoms.borrow().lookup(a).to_string()
    }

    pub(crate) fn atomize(&self, name: &str) -> Atom {
        self.atoms.borrow_mut().atomize(name)
    }

    /// Request a suspension once the in-flight instruction finishes, capped
    /// at `config.max_delay_ms` (spec §6).
    pub(crate) fn request_delay(&mut self, ms: u64) {
        let capped = ms.min(self.config.max_delay_ms);
        let deadline = self.host.current_time_us() + capped * 1_000;
        self.pending_delay = Some(deadline);
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Borrow the embedding host, for embedders that need to read back
    /// state through [`Host::as_any`] (a REPL's captured console, a test
    /// harness's simulated pins) after a run.
    pub fn host_mut(&mut self) -> &mut dyn Host {
        &mut *self.host
    }

    /// Begin execution at the program's root function.
    pub fn start_execution(&mut self) {
        let root = self.program.root;
        let proto = self.program.function(root);
        let base = 0;
        self.stack
            .resize(base + proto.frame_size().max(1), Value::Undefined);
        self.frames.push(CallFrame {
            function: root,
            pc: 0,
            base,
            upvalues: Vec::new(),
            return_reg: None,
            args_base: 0,
            nargs: 0,
            construct_this: None,
        });
    }

    /// The actual arguments passed to the currently executing function,
    /// independent of its own formal parameter count.
    pub(crate) fn current_arguments(&self) -> Vec<Value> {
        let frame = self.frames.last().expect("no active frame");
        self.stack[frame.args_base..frame.args_base + frame.nargs as usize].to_vec()
    }

    pub fn request_termination(&mut self) {
        self.terminated = true;
    }

    fn current_proto(&self) -> &crate::bytecode::FunctionProto {
        let f = self.frames.last().expect("no active frame").function;
        self.program.function(f)
    }

    /// Resolve an operand to its value: a register read, or a constant-pool
    /// lookup against the current frame's function.
    fn operand(&self, roc: RegOrConst) -> Value {
        match roc {
            RegOrConst::Reg(r) => self.reg(r),
            RegOrConst::Const(k) => {
                let proto = self.current_proto();
                match &proto.constants[k as usize] {
                    crate::bytecode::Constant::Integer(v) => Value::Integer(*v),
                    crate::bytecode::Constant::Float(v) => Value::Float(*v),
                    crate::bytecode::Constant::StringLiteral(idx) => Value::StringLiteral(*idx),
                    crate::bytecode::Constant::Atom(a) => Value::Integer(*a as i32),
                    crate::bytecode::Constant::Function(id) => {
                        // Bare function constants are only ever wrapped by a
                        // `Closure` instruction; reading one directly (which
                        // the emitter never does) surfaces as its id so a
                        // misuse is at least visible rather than silently
                        // wrong.
                        Value::Integer(*id as i32)
                    }
                }
            }
        }
    }

    fn reg(&self, r: Reg) -> Value {
        if r == GLOBAL_REG {
            return Value::Object(self.globals);
        }
        let base = self.frames.last().expect("no active frame").base;
        self.stack[base + r as usize]
    }

    fn set_reg(&mut self, r: Reg, v: Value) {
        let base = self.frames.last().expect("no active frame").base;
        self.stack[base + r as usize] = v;
    }

    /// Resolve the `obj` operand of `LoadProp`/`StoProp`, handling the
    /// global-object sentinel specially.
    fn obj_operand(&self, roc: RegOrConst) -> Value {
        self.operand(roc)
    }

    pub(crate) fn string_of(&self, v: Value) -> Option<String> {
        match v {
            Value::StringLiteral(idx) => Some(self.program.string_literal(idx).to_string()),
            Value::StringObject(h) => self.arena.get(h)?.as_str().map(|s| s.to_string()),
            _ => None,
        }
    }

    pub(crate) fn alloc_string(&mut self, s: String) -> Value {
        Value::StringObject(self.arena.alloc(Object::Str(s)))
    }

    pub(crate) fn alloc_array(&mut self, elements: Vec<Value>) -> Value {
        Value::Object(self.arena.alloc(Object::Array(Array { elements })))
    }

    pub(crate) fn alloc_mater(&mut self) -> ObjectHandle {
        self.arena.alloc(Object::Mater(MaterObject::new()))
    }

    /// Set a property directly on the global object, for installing native
    /// functions/proto-objects at startup.
    pub(crate) fn set_global(&mut self, key: Atom, v: Value) {
        let globals = self.globals;
        if let Some(Object::Mater(m)) = self.arena.get_mut(globals) {
            m.set(key, v);
        }
    }

    /// Set a property on an arbitrary already-allocated object handle (used
    /// while building a proto-object such as `JSON` or `GPIO`).
    pub(crate) fn set_object_prop(&mut self, handle: ObjectHandle, key: Atom, v: Value) {
        if let Some(Object::Mater(m)) = self.arena.get_mut(handle) {
            m.set(key, v);
        }
    }

    pub(crate) fn maybe_collect(&mut self) {
        if self.arena.live_count() < self.config.gc_allocation_threshold {
            return;
        }
        let before = self.arena.live_count();
        let mut roots = Vec::new();
        roots.push(self.globals);
        for v in &self.stack {
            collect_root(*v, &mut roots);
        }
        for frame in &self.frames {
            for up in &frame.upvalues {
                if let Upvalue::Closed(v) = &*up.borrow() {
                    collect_root(*v, &mut roots);
                }
            }
        }
        for (_, up) in &self.open_upvalues {
            if let Upvalue::Closed(v) = &*up.borrow() {
                collect_root(*v, &mut roots);
            }
        }
        self.arena.collect(roots);
        log::debug!(
            "gc sweep: {} live objects before, {} after",
            before,
            self.arena.live_count()
        );
    }

    /// Find (or lazily create) the open upvalue cell pointing at absolute
    /// stack slot `index`, sharing one cell across every closure that
    /// captures the same still-live local (classic upvalue aliasing: two
    /// closures over the same loop-local see each other's writes until it
    /// closes).
    fn find_or_open_upvalue(&mut self, index: usize) -> UpvalueCell {
        if let Some((_, cell)) = self.open_upvalues.iter().find(|(i, _)| *i == index) {
            return Rc::clone(cell);
        }
        let cell: UpvalueCell = Rc::new(std::cell::RefCell::new(Upvalue::Open(index)));
        self.open_upvalues.push((index, Rc::clone(&cell)));
        cell
    }

    /// Close every open upvalue pointing at or above `from_index`, copying
    /// the stack's current value into the cell so it survives the frame
    /// that owned that stack slot being popped.
    fn close_upvalues_from(&mut self, from_index: usize) {
        let stack = &self.stack;
        self.open_upvalues.retain(|(index, cell)| {
            if *index < from_index {
                return true;
            }
            *cell.borrow_mut() = Upvalue::Closed(stack[*index]);
            false
        });
    }

    /// Unwind every remaining call frame on an unhandled runtime error or a
    /// termination request — the script isn't resumable past this point, but
    /// the `Vm` itself (its arena and globals) may still be inspected by the
    /// host, so every `Open` upvalue still pointing into the live stack must
    /// close before that stack is discarded (spec §4.5 "error model": a
    /// runtime error aborts the current call chain, generalizing the
    /// teacher's `Block` unwind target to close upvalues across the whole
    /// unwound frame range rather than just the innermost one).
    fn unwind_on_error(&mut self) {
        self.close_upvalues_from(0);
        self.frames.clear();
        self.stack.clear();
    }

    /// Run at most `fuel` instructions (or the configured per-slice fuel if
    /// `fuel` is `None`), returning the resulting suspension status.
    pub fn continue_execution(&mut self, fuel: Option<u32>) -> VmStatus {
        if self.frames.is_empty() {
            return VmStatus::Finished(Value::Undefined);
        }
        let budget = fuel.unwrap_or(self.config.fuel_per_slice);
        for _ in 0..budget {
            if self.terminated {
                self.unwind_on_error();
                return VmStatus::Terminated;
            }
            match self.step() {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Finished(v)) => return VmStatus::Finished(v),
                Ok(StepOutcome::Yield) => {
                    return VmStatus::Yield;
                }
                Err(e) => {
                    self.unwind_on_error();
                    return VmStatus::Error(e);
                }
            }
            if let Some(deadline) = self.pending_delay.take() {
                log::trace!("vm suspended: MsDelay(deadline_us={deadline})");
                return VmStatus::MsDelay(deadline);
            }
            if self.frames.is_empty() {
                return VmStatus::Finished(Value::Undefined);
            }
        }
        VmStatus::Running
    }

    /// Execute exactly one instruction.
    fn step(&mut self) -> Result<StepOutcome, Error> {
        let frame_idx = self.frames.len() - 1;
        let pc = self.frames[frame_idx].pc;
        let proto_code_len = self.current_proto().code.len();
        if pc >= proto_code_len {
            return Err(Error::VmInvariant("pc ran off the end of code".into()));
        }
        self.frames[frame_idx].pc = pc + 1;
        let instr = self.current_proto().code[pc];

        use Instr::*;
        match instr {
            Move { dst, src } => {
                let v = self.operand(src);
                self.set_reg(dst, v);
            }
            LoadRefK { dst, konst } => {
                let v = self.operand(RegOrConst::Const(konst));
                self.set_reg(dst, v);
            }
            LoadLitA { dst } => {
                let v = self.alloc_array(Vec::new());
                self.set_reg(dst, v);
            }
            LoadLitO { dst } => {
                let h = self.alloc_mater();
                self.set_reg(dst, Value::Object(h));
            }
            LoadProp { dst, obj, key } => {
                let obj_v = self.obj_operand(obj);
                let v = ops_struct::load_prop(self, obj_v, key)?;
                self.set_reg(dst, v);
            }
            LoadElt { dst, obj, idx } => {
                let obj_v = self.obj_operand(obj);
                let idx_v = self.operand(idx);
                let v = ops_struct::load_elt(self, obj_v, idx_v)?;
                self.set_reg(dst, v);
            }
            StoProp { obj, key, val } => {
                let obj_v = self.obj_operand(obj);
                let v = self.operand(val);
                ops_struct::sto_prop(self, obj_v, key, v)?;
            }
            StoElt { obj, idx, val } => {
                let obj_v = self.obj_operand(obj);
                let idx_v = self.operand(idx);
                let v = self.operand(val);
                ops_struct::sto_elt(self, obj_v, idx_v, v)?;
            }
            AppendElt { arr, val } => {
                let arr_v = self.reg(arr);
                let v = self.operand(val);
                ops_struct::append_elt(self, arr_v, v)?;
            }
            AppendProp { obj, key, val } => {
                let obj_v = self.reg(obj);
                let v = self.operand(val);
                ops_struct::append_prop(self, obj_v, key, v)?;
            }
            LoadTrue { dst } => self.set_reg(dst, Value::Integer(1)),
            LoadFalse { dst } => self.set_reg(dst, Value::Integer(0)),
            LoadNull { dst } => self.set_reg(dst, Value::Null),
            LoadThis { dst } => {
                let this = ops_control::current_this(self);
                self.set_reg(dst, this);
            }
            LoadUp { dst, idx } => {
                let v = ops_control::load_upvalue(self, idx);
                self.set_reg(dst, v);
            }
            StoreUp { idx, val } => {
                let v = self.operand(val);
                ops_control::store_upvalue(self, idx, v);
            }
            BinOp { op, dst, lhs, rhs } => {
                let l = self.operand(lhs);
                let r = self.operand(rhs);
                let v = ops_arith::eval_binop(self, op, l, r)?;
                self.set_reg(dst, v);
            }
            UnOp { op, dst, src } => {
                let v = ops_arith::eval_unop(self, op, src)?;
                self.set_reg(dst, v);
            }
            Dup { dst, src } => {
                let v = self.reg(src);
                self.set_reg(dst, v);
            }
            Jmp { offset } => {
                self.jump(frame_idx, offset);
            }
            Jt { cond, offset } => {
                if self.reg(cond).as_bool() {
                    self.jump(frame_idx, offset);
                }
            }
            Jf { cond, offset } => {
                if !self.reg(cond).as_bool() {
                    self.jump(frame_idx, offset);
                }
            }
            CaseTest { val, case, offset } => {
                let subject = self.reg(val);
                let test = self.operand(case);
                if ops_arith::values_equal(self, subject, test)? {
                    self.jump(frame_idx, offset);
                }
            }
            Call { callee, nparams } => {
                ops_control::call(self, callee, nparams)?;
            }
            New { callee, nparams } => {
                ops_control::construct(self, callee, nparams)?;
            }
            Ret { nvalues } => {
                if let Some(result) = ops_control::ret(self, nvalues) {
                    return Ok(StepOutcome::Finished(result));
                }
            }
            End => return Ok(StepOutcome::Yield),
            Closure { dst, func_const } => {
                let v = ops_control::make_closure(self, func_const);
                self.set_reg(dst, v);
            }
        }
        self.maybe_collect();
        Ok(StepOutcome::Continue)
    }

    fn jump(&mut self, frame_idx: usize, offset: i32) {
        let pc = self.frames[frame_idx].pc as i32 + offset;
        self.frames[frame_idx].pc = pc as usize;
    }
}

fn collect_root(v: Value, roots: &mut Vec<ObjectHandle>) {
    match v {
        Value::Object(h) | Value::StringObject(h) => roots.push(h),
        Value::PropertyRef(h, _) | Value::ElementRef(h, _) => roots.push(h),
        Value::NativeFunction(_, Some(h)) => roots.push(h),
        _ => {}
    }
}

enum StepOutcome {
    Continue,
    Yield,
    Finished(Value),
}
