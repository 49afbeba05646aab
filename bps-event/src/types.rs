//! Core types for the BPS event bridge
//!
//! This module defines the error type, the result alias and the opaque
//! address types that cross the native boundary. None of the address types
//! are ever dereferenced outside the `payload` module and the bus adapters.

use std::ffi::c_void;
use std::fmt;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// The maximum allowable domain of an event created through this bridge.
pub const EVENT_DOMAIN_MAX: i32 = 0x0000_0FFF;

/// The maximum allowable code of an event (codes are 16-bit on the wire).
pub const EVENT_CODE_MAX: u32 = u16::MAX as u32;

/// Status returned by native calls on success.
pub const BPS_SUCCESS: i32 = 0;

/// Status returned by native calls on failure; details live in `errno`.
pub const BPS_FAILURE: i32 = -1;

/// Errors that can occur while creating, reading or destroying events
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Argument out of range: {name} = {value} (valid: 0..={max})")]
    ArgumentOutOfRange {
        name: &'static str,
        value: i64,
        max: i64,
    },

    #[error("Native call {call} failed (errno {errno}): {message}")]
    NativeCallFailure {
        call: &'static str,
        errno: i32,
        message: String,
    },

    #[error("Event has been disposed")]
    Disposed,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Failed to allocate {size} bytes of native memory")]
    AllocationFailure { size: usize },

    #[error("A completion callback is already registered for event {0}")]
    DuplicateCompletion(NativeHandle),

    #[error("Token at 0x{addr:X} was not produced by this bridge")]
    ForeignToken { addr: usize },

    #[error("Native bus library error: {0}")]
    Library(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Build a `NativeCallFailure` from a platform error number
    pub fn native(call: &'static str, errno: i32) -> Self {
        let message = std::io::Error::from_raw_os_error(errno).to_string();
        BridgeError::NativeCallFailure {
            call,
            errno,
            message,
        }
    }
}

/// Opaque handle identifying a native event object
///
/// A null handle means "absent or destroyed" and is never passed to the bus
/// by an [`Event`](crate::Event) accessor.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NativeHandle(usize);

impl NativeHandle {
    pub const NULL: NativeHandle = NativeHandle(0);

    pub fn from_raw(ptr: *mut c_void) -> Self {
        NativeHandle(ptr as usize)
    }

    pub fn from_addr(addr: usize) -> Self {
        NativeHandle(addr)
    }

    pub fn as_raw(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub fn addr(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

/// Address of a three-word payload envelope in native memory
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EnvelopePtr(usize);

impl EnvelopePtr {
    pub const NULL: EnvelopePtr = EnvelopePtr(0);

    pub fn from_raw(ptr: *mut c_void) -> Self {
        EnvelopePtr(ptr as usize)
    }

    pub fn from_addr(addr: usize) -> Self {
        EnvelopePtr(addr)
    }

    pub fn as_raw(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub fn addr(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EnvelopePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

/// Check an event domain against `0..=EVENT_DOMAIN_MAX`
pub(crate) fn validate_domain(domain: i32) -> Result<u32> {
    if !(0..=EVENT_DOMAIN_MAX).contains(&domain) {
        return Err(BridgeError::ArgumentOutOfRange {
            name: "domain",
            value: domain as i64,
            max: EVENT_DOMAIN_MAX as i64,
        });
    }
    Ok(domain as u32)
}

/// Check an event code against `0..=EVENT_CODE_MAX`
pub(crate) fn validate_code(code: u32) -> Result<u32> {
    if code > EVENT_CODE_MAX {
        return Err(BridgeError::ArgumentOutOfRange {
            name: "code",
            value: code as i64,
            max: EVENT_CODE_MAX as i64,
        });
    }
    Ok(code)
}
