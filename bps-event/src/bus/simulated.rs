//! In-process stand-in for the native event bus
//!
//! Behaves like the native library as far as the bridge can observe:
//! handles are opaque non-null addresses unique within the process, `destroy` runs the event's
//! completion function before the event disappears, and failed calls leave an
//! error number behind for [`NativeBus::last_error`]. Tests and the CLI use it
//! to drive the full event lifecycle without the real library.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use super::{CompletionFn, NativeBus};
use crate::types::{EnvelopePtr, NativeHandle, BPS_FAILURE, BPS_SUCCESS};

const HANDLE_BASE: usize = 0x0B50_0000;
const HANDLE_STRIDE: usize = 0x40;

// Shared by every simulated bus so handles never collide within a process,
// as with real native addresses.
static NEXT_HANDLE: AtomicUsize = AtomicUsize::new(0);

/// `ENOMEM`, reported when creation failure is injected without an errno
const DEFAULT_ERRNO: i32 = 12;

#[derive(Debug, Clone, Copy)]
struct SimEvent {
    domain: u32,
    code: u32,
    payload: EnvelopePtr,
    completion: CompletionFn,
}

/// Counters describing what the simulated bus has seen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SimulatedStats {
    pub created: usize,
    pub destroyed: usize,
    pub failed_creates: usize,
    pub completions_delivered: usize,
    pub live: usize,
}

/// Simulated native event bus
#[derive(Debug, Default)]
pub struct SimulatedBus {
    events: Mutex<HashMap<NativeHandle, SimEvent>>,
    fail_creates: Mutex<VecDeque<i32>>,
    early_completions: AtomicUsize,
    last_error: AtomicI32,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    failed_creates: AtomicUsize,
    completions: AtomicUsize,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `create` call fail with `errno` (0 picks `ENOMEM`)
    pub fn fail_next_create(&self, errno: i32) {
        let errno = if errno == 0 { DEFAULT_ERRNO } else { errno };
        self.fail_creates.lock().push_back(errno);
    }

    /// Make the next `create` call run the completion function before it
    /// returns the handle, as a bus completing on another thread may
    pub fn complete_next_create_early(&self) {
        self.early_completions.fetch_add(1, Ordering::AcqRel);
    }

    /// Act as the bus finishing with an event: run its completion function
    ///
    /// The event stays alive, so this may be called repeatedly to simulate
    /// duplicate delivery. Returns false for an unknown handle.
    pub fn deliver_completion(&self, handle: NativeHandle) -> bool {
        let completion = match self.events.lock().get(&handle) {
            Some(event) => event.completion,
            None => return false,
        };
        self.completions.fetch_add(1, Ordering::AcqRel);
        log::trace!("Simulated bus delivering completion for {}", handle);
        // SAFETY: completion functions handed to the bus accept any handle.
        unsafe { completion(handle.as_raw()) };
        true
    }

    /// True if the bus still knows the event
    pub fn is_live(&self, handle: NativeHandle) -> bool {
        self.events.lock().contains_key(&handle)
    }

    /// Handles of all events the bus currently holds
    pub fn live_handles(&self) -> Vec<NativeHandle> {
        let mut handles: Vec<_> = self.events.lock().keys().copied().collect();
        handles.sort();
        handles
    }

    pub fn stats(&self) -> SimulatedStats {
        SimulatedStats {
            created: self.created.load(Ordering::Acquire),
            destroyed: self.destroyed.load(Ordering::Acquire),
            failed_creates: self.failed_creates.load(Ordering::Acquire),
            completions_delivered: self.completions.load(Ordering::Acquire),
            live: self.events.lock().len(),
        }
    }

    fn allocate_handle(&self) -> NativeHandle {
        let index = NEXT_HANDLE.fetch_add(1, Ordering::AcqRel);
        NativeHandle::from_addr(HANDLE_BASE + index * HANDLE_STRIDE)
    }
}

impl NativeBus for SimulatedBus {
    fn create(
        &self,
        domain: u32,
        code: u32,
        payload: EnvelopePtr,
        completion: CompletionFn,
    ) -> (i32, NativeHandle) {
        if let Some(errno) = self.fail_creates.lock().pop_front() {
            self.last_error.store(errno, Ordering::Release);
            self.failed_creates.fetch_add(1, Ordering::AcqRel);
            log::debug!("Simulated bus failing create (errno {})", errno);
            return (BPS_FAILURE, NativeHandle::NULL);
        }

        let handle = self.allocate_handle();
        self.events.lock().insert(
            handle,
            SimEvent {
                domain,
                code,
                payload,
                completion,
            },
        );
        self.created.fetch_add(1, Ordering::AcqRel);

        let early = self
            .early_completions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if early {
            self.deliver_completion(handle);
        }
        (BPS_SUCCESS, handle)
    }

    fn destroy(&self, handle: NativeHandle) {
        if !self.deliver_completion(handle) {
            log::warn!("Simulated bus asked to destroy unknown event {}", handle);
            return;
        }
        if self.events.lock().remove(&handle).is_some() {
            self.destroyed.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn domain(&self, handle: NativeHandle) -> i32 {
        self.events
            .lock()
            .get(&handle)
            .map(|event| event.domain as i32)
            .unwrap_or(-1)
    }

    fn code(&self, handle: NativeHandle) -> u32 {
        self.events.lock().get(&handle).map(|event| event.code).unwrap_or(0)
    }

    fn payload(&self, handle: NativeHandle) -> EnvelopePtr {
        self.events
            .lock()
            .get(&handle)
            .map(|event| event.payload)
            .unwrap_or(EnvelopePtr::NULL)
    }

    fn last_error(&self) -> i32 {
        self.last_error.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::c_void;
    use std::sync::atomic::AtomicUsize;

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn count_completion(_event: *mut c_void) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_create_and_read_back() {
        let bus = SimulatedBus::new();
        let (status, handle) = bus.create(0x12, 0x34, EnvelopePtr::from_addr(0x999), count_completion);

        assert_eq!(status, BPS_SUCCESS);
        assert!(!handle.is_null());
        assert_eq!(bus.domain(handle), 0x12);
        assert_eq!(bus.code(handle), 0x34);
        assert_eq!(bus.payload(handle), EnvelopePtr::from_addr(0x999));
        assert_eq!(bus.stats().live, 1);
    }

    #[test]
    fn test_injected_failure() {
        let bus = SimulatedBus::new();
        bus.fail_next_create(22);

        let (status, handle) = bus.create(1, 1, EnvelopePtr::NULL, count_completion);
        assert_eq!(status, BPS_FAILURE);
        assert!(handle.is_null());
        assert_eq!(bus.last_error(), 22);

        let (status, _) = bus.create(1, 1, EnvelopePtr::NULL, count_completion);
        assert_eq!(status, BPS_SUCCESS);
        assert_eq!(bus.stats().failed_creates, 1);
    }

    #[test]
    fn test_injected_failures_keep_order() {
        let bus = SimulatedBus::new();
        bus.fail_next_create(5);
        bus.fail_next_create(0);

        bus.create(1, 1, EnvelopePtr::NULL, count_completion);
        assert_eq!(bus.last_error(), 5);
        bus.create(1, 1, EnvelopePtr::NULL, count_completion);
        assert_eq!(bus.last_error(), DEFAULT_ERRNO);
    }

    #[test]
    fn test_early_completion_runs_inside_create() {
        let bus = SimulatedBus::new();
        bus.complete_next_create_early();

        let (status, handle) = bus.create(1, 1, EnvelopePtr::NULL, count_completion);
        assert_eq!(status, BPS_SUCCESS);
        assert!(bus.is_live(handle));
        assert_eq!(bus.stats().completions_delivered, 1);

        bus.create(1, 1, EnvelopePtr::NULL, count_completion);
        assert_eq!(bus.stats().completions_delivered, 1);
    }

    #[test]
    fn test_destroy_runs_completion_then_forgets() {
        let bus = SimulatedBus::new();
        let (_, handle) = bus.create(1, 2, EnvelopePtr::NULL, count_completion);
        let before = CALLS.load(Ordering::SeqCst);

        bus.destroy(handle);
        assert!(CALLS.load(Ordering::SeqCst) > before);
        assert!(!bus.is_live(handle));
        assert_eq!(bus.domain(handle), -1);

        // Unknown handles are ignored
        bus.destroy(handle);
        assert_eq!(bus.stats().destroyed, 1);
    }

    #[test]
    fn test_handles_are_unique() {
        let bus = SimulatedBus::new();
        let (_, a) = bus.create(1, 1, EnvelopePtr::NULL, count_completion);
        let (_, b) = bus.create(1, 1, EnvelopePtr::NULL, count_completion);
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(bus.live_handles(), vec![a, b]);
    }
}
