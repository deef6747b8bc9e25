//! m8rscript runtime entry point.
//!
//! Behavior summary:
//! - With **no args**, start an interactive REPL.
//! - With `-h/--help`, print usage.
//! - With `-v/--version`, print build-target + version.
//! - With a script path, compile and run it to completion. There is no
//!   forwarding of CLI arguments into the script; `arguments()` only ever
//!   sees the current function call's own parameters (see `SPEC_FULL.md`).

use std::env;
use std::fs;
use std::time::Instant;

use m8rscript_runtime::host::{Host, HostError, PinMode};
use m8rscript_runtime::runtime::Runtime;
use m8rscript_runtime::vm::{RuntimeConfig, VmStatus};

mod repl;

/// Human-facing runtime version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn usage() -> String {
    format!(
        r#"m8rscript Runtime v{0}

Usage:
    m8rscript <script.m8r>

Arguments:
    <script.m8r>
        Path to an m8rscript source file to execute.

Options:
    -h, --help
        Show this help message and exit.
    -v, --version
        Show runtime version."#,
        VERSION
    )
}

/// [`Host`] backing the CLI binary: console writes go to real stdout, the
/// clock reads the process's monotonic start time, and GPIO always errors
/// since this binary drives no hardware.
struct CliHost {
    start: Instant,
}

impl CliHost {
    fn new() -> Self {
        CliHost {
            start: Instant::now(),
        }
    }
}

impl Host for CliHost {
    fn console_write(&mut self, s: &str) {
        print!("{s}");
        use std::io::Write;
        let _ = std::io::stdout().flush();
    }

    fn current_time_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn set_pin_mode(&mut self, _pin: u32, _mode: PinMode) -> Result<(), HostError> {
        Err(HostError(
            m8rscript_runtime::ErrorKind::InternalError,
            "this binary has no GPIO".into(),
        ))
    }

    fn digital_read(&mut self, _pin: u32) -> Result<bool, HostError> {
        Err(HostError(
            m8rscript_runtime::ErrorKind::InternalError,
            "this binary has no GPIO".into(),
        ))
    }

    fn digital_write(&mut self, _pin: u32, _value: bool) -> Result<(), HostError> {
        Err(HostError(
            m8rscript_runtime::ErrorKind::InternalError,
            "this binary has no GPIO".into(),
        ))
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

fn run_source(source: &str) -> i32 {
    let mut rt = match Runtime::compile(source, RuntimeConfig::default(), Box::new(CliHost::new()))
    {
        Ok(rt) => rt,
        Err(errors) => {
            eprintln!("{errors}");
            return 1;
        }
    };
    rt.start();
    let status = rt.run_to_completion(|status| {
        // A bare CLI run has no external event source to wait on; treat any
        // suspension as a hard stop rather than spinning forever.
        matches!(status, VmStatus::Yield)
    });
    match status {
        VmStatus::Finished(_) | VmStatus::Terminated => 0,
        VmStatus::Error(e) => {
            eprintln!("{e}");
            e.exit_code()
        }
        VmStatus::Running | VmStatus::Waiting | VmStatus::MsDelay(_) | VmStatus::Yield => 0,
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() == 1 {
        repl::repl_interpret();
        return;
    }

    if args[1] == "-h" || args[1] == "--help" {
        println!("{}", usage());
        return;
    }

    if args[1] == "-v" || args[1] == "--version" {
        println!(
            "m8rscript-runtime-build-{}-{}: v{}",
            env::consts::OS,
            env::consts::ARCH,
            VERSION
        );
        return;
    }

    let script_path = &args[1];
    let source = match fs::read_to_string(script_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to read {script_path}: {e}");
            std::process::exit(1);
        }
    };

    std::process::exit(run_source(&source));
}
