//! # Atom Table
//!
//! Interns identifier and property-name strings into 16-bit handles so the
//! rest of the runtime can compare names with an integer equality check
//! instead of a string compare. Two disjoint ranges share one table: a
//! built-in block of well-known names baked in at construction time, and a
//! per-program dynamic block appended as the scanner/parser discover new
//! identifiers.

use std::collections::HashMap;

/// A 16-bit handle into the atom table.
pub type Atom = u16;

/// Built-in names every program needs, in a fixed order. Index into this
/// table *is* the shared atom value, so `shared::LENGTH` below must track
/// this list positionally.
pub const SHARED_ATOM_NAMES: &[&str] = &[
    "constructor",
    "length",
    "print",
    "println",
    "printf",
    "iterator",
    "next",
    "done",
    "value",
    "this",
    "arguments",
    "prototype",
    "name",
    "encode",
    "decode",
    "parse",
    "stringify",
    "setPinMode",
    "digitalRead",
    "digitalWrite",
    "onInterrupt",
    "PinMode",
    "Trigger",
    "currentTime",
    "delay",
    "toFloat",
    "toInt",
    "toUInt",
    "Base64",
    "JSON",
    "GPIO",
    "TCP",
    "UDP",
    "IPAddr",
    "create",
];

/// Positional handles for [`SHARED_ATOM_NAMES`]. Kept as plain constants
/// (rather than an enum) so they can be used directly as `Atom` values.
pub mod shared {
    use super::Atom;

    pub const CONSTRUCTOR: Atom = 0;
    pub const LENGTH: Atom = 1;
    pub const PRINT: Atom = 2;
    pub const PRINTLN: Atom = 3;
    pub const PRINTF: Atom = 4;
    pub const ITERATOR: Atom = 5;
    pub const NEXT: Atom = 6;
    pub const DONE: Atom = 7;
    pub const VALUE: Atom = 8;
    pub const THIS: Atom = 9;
    pub const ARGUMENTS: Atom = 10;
    pub const PROTOTYPE: Atom = 11;
    pub const NAME: Atom = 12;
    pub const ENCODE: Atom = 13;
    pub const DECODE: Atom = 14;
    pub const PARSE: Atom = 15;
    pub const STRINGIFY: Atom = 16;
    pub const SET_PIN_MODE: Atom = 17;
    pub const DIGITAL_READ: Atom = 18;
    pub const DIGITAL_WRITE: Atom = 19;
    pub const ON_INTERRUPT: Atom = 20;
    pub const PIN_MODE: Atom = 21;
    pub const TRIGGER: Atom = 22;
    pub const CURRENT_TIME: Atom = 23;
    pub const DELAY: Atom = 24;
    pub const TO_FLOAT: Atom = 25;
    pub const TO_INT: Atom = 26;
    pub const TO_UINT: Atom = 27;
    pub const BASE64: Atom = 28;
    pub const JSON: Atom = 29;
    pub const GPIO: Atom = 30;
    pub const TCP: Atom = 31;
    pub const UDP: Atom = 32;
    pub const IP_ADDR: Atom = 33;
    pub const CREATE: Atom = 34;
}

/// Append-only string interner. Handles stay valid for the table's whole
/// lifetime; nothing is ever removed.
#[derive(Debug)]
pub struct AtomTable {
    strings: Vec<String>,
    lookup: HashMap<String, Atom>,
}

impl AtomTable {
    /// Build a fresh table pre-seeded with [`SHARED_ATOM_NAMES`].
    pub fn new() -> Self {
        let mut table = AtomTable {
            strings: Vec::with_capacity(SHARED_ATOM_NAMES.len()),
            lookup: HashMap::new(),
        };
        for name in SHARED_ATOM_NAMES {
            table.atomize(name);
        }
        table
    }

    /// Insert `s` if absent, returning its handle either way.
    ///
    /// O(1) via the side hashmap; the spec only requires the O(N) scan
    /// bound (identifier counts are small on embedded targets), which this
    /// comfortably beats.
    pub fn atomize(&mut self, s: &str) -> Atom {
        if let Some(&atom) = self.lookup.get(s) {
            return atom;
        }
        let atom = self.strings.len() as Atom;
        self.strings.push(s.to_string());
        self.lookup.insert(s.to_string(), atom);
        atom
    }

    /// Resolve a handle back to its string. Panics on an out-of-range atom,
    /// which would indicate a compiler bug (a handle minted by one table
    /// used against another).
    pub fn lookup(&self, atom: Atom) -> &str {
        &self.strings[atom as usize]
    }

    /// Look up a compile-time-known name without inserting it, for callers
    /// that only want to know if it has already been atomized.
    pub fn find(&self, s: &str) -> Option<Atom> {
        self.lookup.get(s).copied()
    }
}

impl Default for AtomTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_atoms_resolve_positionally() {
        let table = AtomTable::new();
        assert_eq!(table.lookup(shared::LENGTH), "length");
        assert_eq!(table.lookup(shared::ITERATOR), "iterator");
    }

    #[test]
    fn atomize_round_trips() {
        let mut table = AtomTable::new();
        let a = table.atomize("myVariable");
        assert_eq!(table.lookup(a), "myVariable");
        // Re-atomizing returns the same handle.
        assert_eq!(table.atomize("myVariable"), a);
    }

    #[test]
    fn atomize_is_append_only() {
        let mut table = AtomTable::new();
        let before = table.strings.len();
        table.atomize("constructor"); // already shared
        assert_eq!(table.strings.len(), before);
        table.atomize("freshName");
        assert_eq!(table.strings.len(), before + 1);
    }
}
