//! Native event bus boundary
//!
//! The bridge only needs a handful of calls from the native bus. They are
//! expressed as the [`NativeBus`] trait so that the same event lifecycle runs
//! against the real library ([`DynamicBus`]) or an in-process stand-in
//! ([`SimulatedBus`]).

use std::ffi::c_void;

use crate::types::{EnvelopePtr, NativeHandle, BPS_SUCCESS};

pub mod ffi;
pub mod simulated;

pub use ffi::DynamicBus;
pub use simulated::SimulatedBus;

/// Completion function the native bus calls with the finished event's handle
pub type CompletionFn = unsafe extern "C" fn(event: *mut c_void);

/// The calls the bridge makes into the native event bus
///
/// Implementations must be callable from any thread. `destroy` may invoke
/// the event's completion function before returning, so implementations must
/// not hold internal locks across that call, and `payload`, `domain` and
/// `code` must keep answering for the handle until the completion function
/// returns.
pub trait NativeBus: Send + Sync {
    /// Create an event; returns the status and, on success, the new handle
    fn create(
        &self,
        domain: u32,
        code: u32,
        payload: EnvelopePtr,
        completion: CompletionFn,
    ) -> (i32, NativeHandle);

    /// Destroy an event created by [`create`](Self::create)
    fn destroy(&self, handle: NativeHandle);

    fn domain(&self, handle: NativeHandle) -> i32;

    fn code(&self, handle: NativeHandle) -> u32;

    /// Envelope pointer the event was created with, or null
    fn payload(&self, handle: NativeHandle) -> EnvelopePtr;

    /// Called once the bridge has reclaimed the payload of a completed event
    fn payload_reclaimed(&self, _handle: NativeHandle) {}

    /// Platform error number describing the most recent failed call
    fn last_error(&self) -> i32;
}

/// The single success predicate for native calls
pub fn is_success(status: i32) -> bool {
    status == BPS_SUCCESS
}
