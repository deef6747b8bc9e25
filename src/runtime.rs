//! # Runtime — owns the atom table across the parse/execute boundary
//!
//! `Parser` borrows an `AtomTable` mutably while it compiles; `Vm` needs to
//! keep reading (and occasionally minting) atoms long after parsing is
//! done. `Runtime` is the small wrapper that sequences the two phases: it
//! owns one [`AtomTable`], hands a `&mut` of it to [`Parser::new`], then
//! moves the same table (now shared) into the constructed [`Vm`]. Embedding
//! code should go through this rather than wiring `Parser`/`Vm` by hand.

use std::cell::RefCell;
use std::rc::Rc;

use crate::atom::AtomTable;
use crate::error::ParseErrorList;
use crate::host::Host;
use crate::parser::Parser;
use crate::vm::{RuntimeConfig, Vm, VmStatus};

/// A compiled, ready-to-run program plus the VM executing it.
pub struct Runtime {
    vm: Vm,
}

impl Runtime {
    /// Compile `source` and build a VM over it, ready to call
    /// [`Runtime::start`]. Returns the accumulated parse errors instead of a
    /// `Runtime` if compilation failed (spec §4.3: parsing keeps reporting
    /// past the first error, so callers see every diagnostic at once).
    pub fn compile(
        source: &str,
        config: RuntimeConfig,
        host: Box<dyn Host>,
    ) -> Result<Runtime, ParseErrorList> {
        let mut atoms = AtomTable::new();
        let parser = Parser::new(source, &mut atoms).map_err(|e| {
            let mut errors = ParseErrorList::new();
            errors.push(e);
            errors
        })?;
        let (program, errors) = parser.parse_program();
        let Some(program) = program else {
            return Err(errors);
        };
        if !errors.is_empty() {
            return Err(errors);
        }

        let atoms = Rc::new(RefCell::new(atoms));
        let vm = Vm::new(Rc::new(program), atoms, config, host);
        Ok(Runtime { vm })
    }

    /// Begin execution at the program's root function.
    pub fn start(&mut self) {
        self.vm.start_execution();
    }

    /// Run one fuel-bounded slice. See [`VmStatus`] for what each outcome
    /// means and how to resume.
    pub fn step(&mut self, fuel: Option<u32>) -> VmStatus {
        self.vm.continue_execution(fuel)
    }

    /// Run to completion (or first suspension/error), driving the VM one
    /// slice at a time. `on_wait` is invoked whenever the VM reports
    /// `Waiting` or `MsDelay`, so the embedder can block on its own event
    /// source before resuming; returning `false` aborts the run.
    pub fn run_to_completion(&mut self, mut on_wait: impl FnMut(&VmStatus) -> bool) -> VmStatus {
        loop {
            let status = self.step(None);
            match &status {
                VmStatus::Running => continue,
                VmStatus::Waiting | VmStatus::MsDelay(_) | VmStatus::Yield => {
                    if !on_wait(&status) {
                        return status;
                    }
                }
                VmStatus::Finished(_) | VmStatus::Error(_) | VmStatus::Terminated => {
                    return status;
                }
            }
        }
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::TestHost;

    #[test]
    fn compile_reports_syntax_errors() {
        let err = Runtime::compile(
            "function f( { }",
            RuntimeConfig::default(),
            Box::new(TestHost::new()),
        )
        .unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn compile_and_run_hello() {
        let mut rt = Runtime::compile(
            r#"println("hello");"#,
            RuntimeConfig::default(),
            Box::new(TestHost::new()),
        )
        .expect("valid program should compile");
        rt.start();
        let status = rt.run_to_completion(|_| false);
        assert!(matches!(status, VmStatus::Finished(_)));
    }

    /// Compile and run `source` to completion, returning the final status
    /// plus everything written to the console, the way a host embedding the
    /// crate actually drives it end to end.
    fn run(source: &str) -> (VmStatus, String) {
        let mut rt = Runtime::compile(source, RuntimeConfig::default(), Box::new(TestHost::new()))
            .unwrap_or_else(|e| panic!("compile failed: {e}"));
        rt.start();
        let status = rt.run_to_completion(|s| matches!(s, VmStatus::Yield));
        let console = rt
            .vm_mut()
            .host_mut()
            .as_any()
            .downcast_mut::<TestHost>()
            .expect("TestHost")
            .console
            .clone();
        (status, console)
    }

    #[test]
    fn hello() {
        let (status, console) = run("print(\"hello\\n\");");
        assert!(matches!(status, VmStatus::Finished(_)));
        assert_eq!(console, "hello\n");
    }

    #[test]
    fn counting_loop() {
        let (status, console) =
            run("var s = 0; for (var i = 0; i < 5; ++i) { s += i; } print(s);");
        assert!(matches!(status, VmStatus::Finished(_)));
        assert_eq!(console, "10");
    }

    #[test]
    fn fibonacci_via_closure() {
        let (status, console) = run(
            "function mk(){ var a=0,b=1; return function(){ var t=a+b; a=b; b=t; return a; }; }\n\
             var f = mk(); var r = \"\"; for (var i=0;i<6;++i){ r += f(); r += \",\"; } print(r);",
        );
        assert!(matches!(status, VmStatus::Finished(_)));
        assert_eq!(console, "1,2,3,5,8,13,");
    }

    #[test]
    fn switch_with_default() {
        let (status, console) = run(
            "var x=2; switch(x){ case 1: print(\"a\"); break; case 2: print(\"b\"); break; default: print(\"d\"); }",
        );
        assert!(matches!(status, VmStatus::Finished(_)));
        assert_eq!(console, "b");
    }

    #[test]
    fn json_round_trip() {
        let (status, console) = run(
            "var o={a:1,b:[2,3]}; print(JSON.stringify(JSON.parse(JSON.stringify(o))));",
        );
        assert!(matches!(status, VmStatus::Finished(_)));
        assert_eq!(console, r#"{"a":1,"b":[2,3]}"#);
    }

    #[test]
    fn runtime_error_surfaces() {
        let (status, _console) = run("var o=null; o.x = 1;");
        assert!(matches!(status, VmStatus::Error(_)));
    }
}
