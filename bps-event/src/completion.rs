//! Completion trampoline
//!
//! The native bus calls [`event_completion`] with nothing but the handle of
//! the event it has finished with. A route table maps that handle back to the
//! bridge that created the event; the bridge then runs the caller's callback
//! and reclaims the event's payload.
//!
//! Nothing raised by a callback crosses back into the native caller. Errors
//! and panics are handed to the bridge's [`CallbackErrorSink`].

use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, LazyLock};

use crate::bridge::BridgeShared;
use crate::types::NativeHandle;

/// Completion routes, plus completions that arrived for an unknown handle
/// while some bridge was between `bus.create` and publishing its route
#[derive(Default)]
struct RouteTable {
    routes: HashMap<NativeHandle, Arc<BridgeShared>>,
    creating: usize,
    early: HashSet<NativeHandle>,
}

static ROUTES: LazyLock<Mutex<RouteTable>> = LazyLock::new(|| Mutex::new(RouteTable::default()));

/// Completion function handed to the native bus for every event we create
///
/// # Safety
/// Called by the native bus with the handle of an event it created. The
/// pointer is only used as a lookup key and is never dereferenced.
pub unsafe extern "C" fn event_completion(event: *mut c_void) {
    let handle = NativeHandle::from_raw(event);
    let outcome = catch_unwind(|| {
        let Some(shared) = take_route(handle) else {
            return;
        };
        shared.complete(handle);
    });
    if outcome.is_err() {
        log::error!("Completion handling for event {} panicked", handle);
    }
}

fn take_route(handle: NativeHandle) -> Option<Arc<BridgeShared>> {
    let mut table = ROUTES.lock();
    if let Some(shared) = table.routes.remove(&handle) {
        return Some(shared);
    }
    if table.creating > 0 {
        log::debug!("Completion for event {} arrived before its route, deferring", handle);
        table.early.insert(handle);
    } else {
        log::trace!("No route for completed event {}", handle);
    }
    None
}

/// Marks a bridge as creating an event until dropped
///
/// Completions for unknown handles are remembered while any guard is alive,
/// so one that races ahead of [`CreateGuard::publish`] is not lost.
pub(crate) struct CreateGuard {
    published: bool,
}

impl CreateGuard {
    pub(crate) fn begin() -> Self {
        ROUTES.lock().creating += 1;
        Self { published: false }
    }

    /// Route future completions for `handle` to `shared`
    ///
    /// Returns true, without adding a route, if the bus already delivered
    /// the completion; the caller then completes the event itself.
    pub(crate) fn publish(mut self, handle: NativeHandle, shared: Arc<BridgeShared>) -> bool {
        let mut table = ROUTES.lock();
        let completed = table.early.remove(&handle);
        if !completed && table.routes.insert(handle, shared).is_some() {
            log::warn!("Replaced stale completion route for event {}", handle);
        }
        self.published = true;
        Self::finish(&mut table);
        completed
    }

    fn finish(table: &mut RouteTable) {
        table.creating -= 1;
        if table.creating == 0 {
            table.early.clear();
        }
    }
}

impl Drop for CreateGuard {
    fn drop(&mut self) {
        if !self.published {
            Self::finish(&mut ROUTES.lock());
        }
    }
}

/// Drop the route for `handle` if it still points at `shared`
pub(crate) fn remove_route(handle: NativeHandle, shared: &Arc<BridgeShared>) -> bool {
    let mut table = ROUTES.lock();
    match table.routes.get(&handle) {
        Some(owner) if Arc::ptr_eq(owner, shared) => {
            table.routes.remove(&handle);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
pub(crate) fn is_routed(handle: NativeHandle) -> bool {
    ROUTES.lock().routes.contains_key(&handle)
}

/// What went wrong inside a completion callback
#[derive(Debug)]
pub enum FailureKind {
    /// The callback returned an error
    Error(anyhow::Error),
    /// The callback panicked; holds the panic message when there was one
    Panic(String),
}

/// A completion callback that failed
#[derive(Debug)]
pub struct CallbackFailure {
    pub handle: NativeHandle,
    pub kind: FailureKind,
}

impl CallbackFailure {
    pub(crate) fn error(handle: NativeHandle, error: anyhow::Error) -> Self {
        Self {
            handle,
            kind: FailureKind::Error(error),
        }
    }

    pub(crate) fn panic(handle: NativeHandle, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self {
            handle,
            kind: FailureKind::Panic(message),
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self.kind, FailureKind::Panic(_))
    }
}

impl fmt::Display for CallbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FailureKind::Error(e) => {
                write!(f, "completion callback for event {} failed: {:#}", self.handle, e)
            }
            FailureKind::Panic(msg) => {
                write!(f, "completion callback for event {} panicked: {}", self.handle, msg)
            }
        }
    }
}

/// Receives completion callback failures
///
/// Any `Fn(CallbackFailure)` closure is a sink.
pub trait CallbackErrorSink: Send + Sync {
    fn report(&self, failure: CallbackFailure);
}

impl<F> CallbackErrorSink for F
where
    F: Fn(CallbackFailure) + Send + Sync,
{
    fn report(&self, failure: CallbackFailure) {
        self(failure)
    }
}

/// Default sink: log the failure at warn level
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl CallbackErrorSink for LogSink {
    fn report(&self, failure: CallbackFailure) {
        log::warn!("{}", failure);
    }
}

/// Run a callback, turning errors and panics into a [`CallbackFailure`]
pub(crate) fn invoke_guarded<F>(handle: NativeHandle, callback: F) -> Option<CallbackFailure>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(CallbackFailure::error(handle, e)),
        Err(payload) => Some(CallbackFailure::panic(handle, payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_passes_success() {
        assert!(invoke_guarded(NativeHandle::from_addr(0x10), || Ok(())).is_none());
    }

    #[test]
    fn test_guard_captures_error() {
        let failure = invoke_guarded(NativeHandle::from_addr(0x10), || anyhow::bail!("boom"))
            .expect("error should be captured");
        assert!(!failure.is_panic());
        assert!(failure.to_string().contains("boom"));
        assert!(failure.to_string().contains("0x10"));
    }

    #[test]
    fn test_guard_captures_panic() {
        let failure = invoke_guarded(NativeHandle::from_addr(0x20), || panic!("kaboom"))
            .expect("panic should be captured");
        match failure.kind {
            FailureKind::Panic(msg) => assert_eq!(msg, "kaboom"),
            other => panic!("unexpected failure kind: {:?}", other),
        }
    }

    #[test]
    fn test_closure_sink() {
        let seen = Mutex::new(Vec::new());
        let sink = |failure: CallbackFailure| seen.lock().push(failure.handle);
        sink.report(CallbackFailure::error(NativeHandle::from_addr(0x30), anyhow::anyhow!("x")));
        assert_eq!(*seen.lock(), vec![NativeHandle::from_addr(0x30)]);
    }

    #[test]
    fn test_unrouted_completion_is_ignored() {
        unsafe { event_completion(0xDEAD_0000usize as *mut c_void) };
        assert!(!is_routed(NativeHandle::from_addr(0xDEAD_0000)));
    }
}
