//! Registry of native addresses owned by in-flight payloads
//!
//! Envelope teardown runs from two places (creation error unwind and the
//! completion trampoline) and may be reached more than once for the same
//! envelope. An address is only freed by whoever removes it from this set.
//!
//! Each address is recorded together with what it points at. The allocator
//! hands freed addresses out again, so a stale envelope pointer may name a
//! live token of some other event; removal only succeeds for the kind the
//! caller expects.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

/// What a registered address points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerKind {
    /// A three-word payload envelope
    Envelope,
    /// A serialized payload slot
    Token,
}

impl fmt::Display for PointerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointerKind::Envelope => write!(f, "envelope"),
            PointerKind::Token => write!(f, "token"),
        }
    }
}

/// Concurrent set of registered native addresses
#[derive(Debug, Default)]
pub struct PointerRegistry {
    entries: Mutex<HashMap<usize, PointerKind>>,
}

impl PointerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an address; returns false for 0 or an address already present
    pub fn register(&self, addr: usize, kind: PointerKind) -> bool {
        if addr == 0 {
            return false;
        }
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&addr) {
            log::warn!("Pointer 0x{:X} registered twice ({} then {})", addr, existing, kind);
            return false;
        }
        entries.insert(addr, kind);
        true
    }

    /// Remove an address registered as `kind`; returns whether it was removed
    pub fn unregister(&self, addr: usize, kind: PointerKind) -> bool {
        if addr == 0 {
            return false;
        }
        let mut entries = self.entries.lock();
        match entries.get(&addr) {
            Some(existing) if *existing == kind => {
                entries.remove(&addr);
                true
            }
            Some(existing) => {
                log::warn!("Pointer 0x{:X} is a {}, not a {}; left registered", addr, existing, kind);
                false
            }
            None => false,
        }
    }

    /// True if `addr` is registered as `kind`
    pub fn contains(&self, addr: usize, kind: PointerKind) -> bool {
        self.kind_of(addr) == Some(kind)
    }

    pub fn kind_of(&self, addr: usize) -> Option<PointerKind> {
        if addr == 0 {
            return None;
        }
        self.entries.lock().get(&addr).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
