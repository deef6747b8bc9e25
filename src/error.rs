//! # Error Handling for the m8rscript Runtime
//!
//! Mirrors the error taxonomy of the specification (lexical, syntactic,
//! semantic-at-compile-time, runtime type, resource, host/IO) as a single
//! crate-wide [`Error`] enum, plus a compact [`ErrorKind`] that is the
//! subset of categories a running script can `raise` as a first-class
//! value and that crosses the bytecode boundary (the `Raise` instruction
//! payload).
//!
//! ## Design
//! - [`ErrorKind`] is `repr(u8)` so it can be embedded directly in a
//!   bytecode instruction operand, the same way the teacher's
//!   `ErrorKind` rides along on `Instr::Raise`.
//! - [`Error`] is the richer enum returned from fallible APIs throughout
//!   the crate (`Result<T, Error>`), with an embedded message where the
//!   category alone isn't enough context for the caller.
//! - `ErrorKind::into_error(msg)` upgrades a kind into a full `Error`,
//!   the same conversion shape as the teacher's `ErrorKind::into_runtime`.

use std::fmt;

/// Compact, bytecode-embeddable category of runtime error.
///
/// Corresponds to spec §7 "Runtime type" and "Host/IO" categories.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Generic = 0,
    Syntax = 1,
    Type = 2,
    UndefinedIdentifier = 3,
    Value = 4,
    PropertyNotCallable = 5,
    NotIndexable = 6,
    WrongNumberOfParams = 7,
    BadFormatString = 8,
    UnknownFormatSpecifier = 9,
    CannotCreateArgumentsArray = 10,
    OutOfMemory = 11,
    CodeSizeExceeded = 12,
    StackOverflow = 13,
    FileNotFound = 14,
    NotReadable = 15,
    NotWritable = 16,
    SeekNotAllowed = 17,
    MountFailed = 18,
    Corrupted = 19,
    NoSpace = 20,
    InternalError = 21,
}

impl ErrorKind {
    /// Upgrade this kind into a fully descriptive [`Error`], embedding `msg`.
    pub fn into_error(self, msg: String) -> Error {
        Error::Runtime(self, msg)
    }
}

impl TryFrom<u8> for ErrorKind {
    type Error = ();

    fn try_from(v: u8) -> Result<Self, ()> {
        use ErrorKind::*;
        Ok(match v {
            0 => Generic,
            1 => Syntax,
            2 => Type,
            3 => UndefinedIdentifier,
            4 => Value,
            5 => PropertyNotCallable,
            6 => NotIndexable,
            7 => WrongNumberOfParams,
            8 => BadFormatString,
            9 => UnknownFormatSpecifier,
            10 => CannotCreateArgumentsArray,
            11 => OutOfMemory,
            12 => CodeSizeExceeded,
            13 => StackOverflow,
            14 => FileNotFound,
            15 => NotReadable,
            16 => NotWritable,
            17 => SeekNotAllowed,
            18 => MountFailed,
            19 => Corrupted,
            20 => NoSpace,
            21 => InternalError,
            _ => return Err(()),
        })
    }
}

/// A single location in source text, for lexical/syntactic diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Crate-wide error type.
///
/// Lexical and syntactic variants carry a [`Location`] so a
/// [`ParseErrorList`] can report several per compile. Runtime variants
/// carry only a message, matching the teacher's `RuntimeError` — by the
/// time a runtime fault happens there is no source position left to
/// report, only the failing instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Unterminated string, malformed number, illegal character.
    Lexical(String, Location),
    /// Expected-token, misplaced default, wrong var-decl count in for-in, etc.
    Syntax(String, Location),
    /// Constant-required or too-many-registers, caught during codegen.
    Semantic(String, Location),
    /// A categorized runtime fault, carrying the kind that crossed the
    /// bytecode boundary via `Raise`/`CallBuiltin` plus a human message.
    Runtime(ErrorKind, String),
    /// User-raised error via a script-level `raise`/`panic` builtin.
    Raised(String),
    /// Division or modulo by zero.
    ZeroDivision,
    /// An `assert` instruction's condition was falsey.
    AssertionFailed,
    /// Internal VM invariant violated (operand stack underflow, missing
    /// frame, etc.) — indicates a bug in the compiler or VM, not user code.
    VmInvariant(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Lexical(msg, loc) => write!(f, "LexicalError at {}: {}", loc, msg),
            Error::Syntax(msg, loc) => write!(f, "SyntaxError at {}: {}", loc, msg),
            Error::Semantic(msg, loc) => write!(f, "SemanticError at {}: {}", loc, msg),
            Error::Runtime(kind, msg) => write!(f, "{:?}Error: {}", kind, msg),
            Error::Raised(msg) => write!(f, "RuntimeError: {}", msg),
            Error::ZeroDivision => write!(f, "ZeroDivisionError: division or modulo by zero"),
            Error::AssertionFailed => write!(f, "AssertionError: assertion failed"),
            Error::VmInvariant(msg) => write!(f, "VmInvariant: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// First-error-kind exit code convention of spec §6 (0 = clean completion).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Lexical(..) | Error::Syntax(..) | Error::Semantic(..) => 1,
            Error::Runtime(kind, _) => 2 + *kind as i32,
            Error::Raised(_) => 1,
            Error::ZeroDivision => 2,
            Error::AssertionFailed => 3,
            Error::VmInvariant(_) => 255,
        }
    }
}

/// Accumulates lexical/syntactic errors across a single parse so the
/// parser can keep reporting past the first failure (spec §4.3: "parsing
/// continues token-by-token until a recovery point").
#[derive(Debug, Default, Clone)]
pub struct ParseErrorList {
    errors: Vec<Error>,
}

impl ParseErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: Error) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<Error> {
        self.errors
    }
}

impl fmt::Display for ParseErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}
