//! # Host capability seam
//!
//! Everything the VM can't do itself — writing output, reading the clock,
//! touching a filesystem or socket, toggling a GPIO pin — crosses this one
//! trait instead of reaching for `std::io`/`std::net` directly from
//! `vm/builtins.rs`. This generalizes the teacher's narrower seam (plain
//! `env`/`globals` maps threaded into `call_builtin` so file I/O could stay
//! out of the arithmetic/control modules) into an explicit capability
//! object, so tests substitute an in-memory [`TestHost`] instead of hitting
//! a real filesystem or socket the way the teacher's tests never had to.

use std::fmt;

/// GPIO pin electrical mode (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PinMode {
    Input,
    Output,
    InputPullup,
    InputPulldown,
    OutputOpenDrain,
}

/// GPIO interrupt trigger condition (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    None,
    RisingEdge,
    FallingEdge,
    BothEdges,
    Low,
    High,
}

/// Host-level filesystem/socket/GPIO fault, reported back as one of the
/// "Host/IO" `ErrorKind`s (spec §7).
#[derive(Clone, Debug, PartialEq)]
pub struct HostError(pub crate::error::ErrorKind, pub String);

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.0, self.1)
    }
}

impl std::error::Error for HostError {}

/// Everything script-visible native code needs from the embedding
/// environment. A `Runtime` is constructed with one `Box<dyn Host>`; every
/// native proto-object dispatch in `vm::builtins` goes through it instead
/// of touching the OS directly.
pub trait Host {
    /// `print`/`println`/`printf` — write to the script's console. Never
    /// buffers across calls; each call is one complete write.
    fn console_write(&mut self, s: &str);

    /// Monotonic clock in microseconds (spec §6 "Monotonic clock").
    fn current_time_us(&self) -> u64;

    /// GPIO surface. A `NullHost` errors on all three; boards implement
    /// them against real registers.
    fn set_pin_mode(&mut self, pin: u32, mode: PinMode) -> Result<(), HostError>;
    fn digital_read(&mut self, pin: u32) -> Result<bool, HostError>;
    fn digital_write(&mut self, pin: u32, value: bool) -> Result<(), HostError>;

    /// Downcasting escape hatch: an embedder holding only `&mut dyn Host`
    /// (e.g. through a `Vm`) can recover its concrete host type to read back
    /// state the trait itself has no business exposing (a REPL's captured
    /// console buffer, a test harness's pin simulation).
    fn as_any(&mut self) -> &mut dyn std::any::Any;
}

/// A host with no real capabilities: console writes are discarded, the
/// clock always reads zero, and every device operation errors. Useful as
/// a placeholder when embedding code needs *a* host but doesn't care what
/// it does.
#[derive(Default)]
pub struct NullHost;

impl Host for NullHost {
    fn console_write(&mut self, _s: &str) {}

    fn current_time_us(&self) -> u64 {
        0
    }

    fn set_pin_mode(&mut self, _pin: u32, _mode: PinMode) -> Result<(), HostError> {
        Err(HostError(
            crate::error::ErrorKind::InternalError,
            "NullHost has no GPIO".into(),
        ))
    }

    fn digital_read(&mut self, _pin: u32) -> Result<bool, HostError> {
        Err(HostError(
            crate::error::ErrorKind::InternalError,
            "NullHost has no GPIO".into(),
        ))
    }

    fn digital_write(&mut self, _pin: u32, _value: bool) -> Result<(), HostError> {
        Err(HostError(
            crate::error::ErrorKind::InternalError,
            "NullHost has no GPIO".into(),
        ))
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// In-memory host for unit/integration tests: captures console output in a
/// `String` and simulates a small bank of GPIO pins instead of touching
/// real hardware.
#[derive(Default)]
pub struct TestHost {
    pub console: String,
    pub clock_us: u64,
    pins: std::collections::HashMap<u32, (PinMode, bool)>,
}

impl TestHost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Host for TestHost {
    fn console_write(&mut self, s: &str) {
        self.console.push_str(s);
    }

    fn current_time_us(&self) -> u64 {
        self.clock_us
    }

    fn set_pin_mode(&mut self, pin: u32, mode: PinMode) -> Result<(), HostError> {
        let entry = self.pins.entry(pin).or_insert((mode, false));
        entry.0 = mode;
        Ok(())
    }

    fn digital_read(&mut self, pin: u32) -> Result<bool, HostError> {
        Ok(self.pins.get(&pin).map(|(_, v)| *v).unwrap_or(false))
    }

    fn digital_write(&mut self, pin: u32, value: bool) -> Result<(), HostError> {
        let entry = self
            .pins
            .entry(pin)
            .or_insert((PinMode::Output, false));
        entry.1 = value;
        Ok(())
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_captures_console_output() {
        let mut host = TestHost::new();
        host.console_write("hello\n");
        assert_eq!(host.console, "hello\n");
    }

    #[test]
    fn test_host_gpio_round_trips() {
        let mut host = TestHost::new();
        host.set_pin_mode(4, PinMode::Output).unwrap();
        host.digital_write(4, true).unwrap();
        assert!(host.digital_read(4).unwrap());
    }

    #[test]
    fn null_host_gpio_errors() {
        let mut host = NullHost;
        assert!(host.set_pin_mode(0, PinMode::Input).is_err());
    }
}
