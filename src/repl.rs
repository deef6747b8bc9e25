//! # m8rscript REPL
//!
//! Interactive Read-Eval-Print Loop. Tracks brace depth so multi-line
//! blocks (function bodies, conditionals) can be entered before execution,
//! and keeps a running `history` of successfully executed source so later
//! lines can reference earlier declarations — the same accumulate-and-
//! recompile model as before, but now run in-process against a real
//! [`Runtime`] instead of spawning a subprocess per line.

use std::io::{self, Write};
use std::time::Instant;

use m8rscript_runtime::host::{Host, HostError, PinMode};
use m8rscript_runtime::runtime::Runtime;
use m8rscript_runtime::vm::{RuntimeConfig, VmStatus};

/// Captures console output into a `String` instead of touching real stdout
/// directly, so the REPL can diff each run's full output against the
/// previous one and print only what's new (re-running `history` every turn
/// would otherwise reprint everything already shown).
struct ReplHost {
    start: Instant,
    pub console: String,
}

impl ReplHost {
    fn new() -> Self {
        ReplHost {
            start: Instant::now(),
            console: String::new(),
        }
    }
}

impl Host for ReplHost {
    fn console_write(&mut self, s: &str) {
        self.console.push_str(s);
    }

    fn current_time_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn set_pin_mode(&mut self, _pin: u32, _mode: PinMode) -> Result<(), HostError> {
        Err(HostError(
            m8rscript_runtime::ErrorKind::InternalError,
            "the REPL has no GPIO".into(),
        ))
    }

    fn digital_read(&mut self, _pin: u32) -> Result<bool, HostError> {
        Err(HostError(
            m8rscript_runtime::ErrorKind::InternalError,
            "the REPL has no GPIO".into(),
        ))
    }

    fn digital_write(&mut self, _pin: u32, _value: bool) -> Result<(), HostError> {
        Err(HostError(
            m8rscript_runtime::ErrorKind::InternalError,
            "the REPL has no GPIO".into(),
        ))
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Run an interactive REPL for m8rscript.
///
/// The loop:
/// 1. Prints a prompt.
/// 2. Reads a line of user input.
/// 3. If braces are balanced and the user isn't inside a string, compiles
///    and runs the accumulated block against `history` so far.
/// 4. Prints only the new console output produced by this turn.
/// 5. On success, folds the block into `history`; on error, discards it.
///
/// Exits cleanly on EOF (Ctrl+D) or if the user types `exit`/`quit`.
pub fn repl_interpret() {
    println!("m8rscript Interpreter - REPL");
    println!("Type `exit` or `quit` to leave.");

    let mut history = String::new();
    let mut buffer: Vec<String> = Vec::new();
    let mut brace_depth: i32 = 0;

    loop {
        let prompt = if buffer.is_empty() { ">>> " } else { "... " };
        print!("{prompt}");
        io::stdout().flush().unwrap();

        let mut line = String::new();
        if io::stdin().read_line(&mut line).unwrap() == 0 {
            println!();
            break;
        }

        let trimmed = line.trim();
        if buffer.is_empty() && (trimmed == "exit" || trimmed == "quit") {
            break;
        }

        let mut string_char: Option<char> = None;
        let mut escape = false;
        for ch in line.chars() {
            if escape {
                escape = false;
                continue;
            }
            match ch {
                '\\' => escape = true,
                '"' | '\'' => {
                    if string_char == Some(ch) {
                        string_char = None;
                    } else if string_char.is_none() {
                        string_char = Some(ch);
                    }
                }
                '{' if string_char.is_none() => brace_depth += 1,
                '}' if string_char.is_none() => brace_depth -= 1,
                _ => {}
            }
        }

        buffer.push(line);

        if brace_depth > 0 {
            continue;
        }

        let block = buffer.join("");
        let source = format!("{history}{block}");

        let host = ReplHost::new();
        match Runtime::compile(&source, RuntimeConfig::default(), Box::new(host)) {
            Ok(mut rt) => {
                rt.start();
                let status = rt.run_to_completion(|status| matches!(status, VmStatus::Yield));
                let console = rt
                    .vm_mut()
                    .host_mut()
                    .as_any()
                    .downcast_mut::<ReplHost>()
                    .expect("REPL always runs with a ReplHost")
                    .console
                    .clone();
                match status {
                    VmStatus::Finished(_) => {
                        print!("{console}");
                        history.push_str(&block);
                    }
                    VmStatus::Error(e) => {
                        print!("{console}");
                        println!("{e}");
                    }
                    VmStatus::Terminated
                    | VmStatus::Running
                    | VmStatus::Waiting
                    | VmStatus::MsDelay(_)
                    | VmStatus::Yield => {
                        print!("{console}");
                    }
                }
            }
            Err(errors) => {
                let text = errors.to_string();
                // An unterminated construct (e.g. a dangling `{`) reads as
                // an unexpected-EOF syntax error; treat it as "need more
                // input" rather than a hard failure.
                if text.contains("EOF") || text.contains("end of input") {
                    buffer.clear();
                    brace_depth = 0;
                    buffer.push(block);
                    continue;
                }
                println!("{text}");
            }
        }

        buffer.clear();
        brace_depth = 0;
    }
}
