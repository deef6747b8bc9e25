//! # m8rscript runtime
//!
//! Library surface for embedding the scanner, parser/codegen, and
//! register-based bytecode VM in a host application: compile source with
//! [`runtime::Runtime::compile`], drive it with [`runtime::Runtime::step`]
//! or [`runtime::Runtime::run_to_completion`], and supply your own
//! [`host::Host`] to wire up console output, the clock, and GPIO.

pub mod atom;
pub mod bytecode;
pub mod error;
pub mod host;
pub mod object;
pub mod parser;
pub mod runtime;
pub mod scanner;
pub mod value;
pub mod vm;

pub use error::{Error, ErrorKind};
pub use host::Host;
pub use runtime::Runtime;
pub use vm::{RuntimeConfig, VmStatus};
