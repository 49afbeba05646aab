//! Native events
//!
//! An [`Event`] wraps a native handle. Events created through
//! [`EventBridge::create`](crate::EventBridge::create) are disposable: the
//! caller destroys them with [`Event::dispose`], or dropping them does it as a
//! last resort. Events wrapping a handle the bus delivered (inside a
//! completion callback, or through [`EventBridge::adopt`](crate::EventBridge::adopt))
//! are not, and `dispose` refuses them.
//!
//! Every accessor re-checks the event's cancellation token before touching
//! the handle. A fired token makes the event read as disposed without
//! destroying anything.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::bridge::BridgeShared;
use crate::payload::Payload;
use crate::registry::CompletionCallback;
use crate::types::{BridgeError, NativeHandle, Result};

/// Lifecycle state of an [`Event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventState {
    /// Native event exists and may be read
    Live,
    /// Destroyed through `dispose`
    Disposed,
    /// Cancellation token fired; reads fail but the handle is kept for reclamation
    Cancelled,
    /// Destroyed by the drop-time safety net
    Finalized,
}

/// Parameters for creating an event
pub struct EventRequest {
    pub(crate) domain: i32,
    pub(crate) code: u32,
    pub(crate) payload: Payload,
    pub(crate) on_complete: Option<CompletionCallback>,
    pub(crate) cancellation: Option<CancellationToken>,
}

impl EventRequest {
    pub fn new(domain: i32, code: u32) -> Self {
        Self {
            domain,
            code,
            payload: Payload::new(),
            on_complete: None,
            cancellation: None,
        }
    }

    /// Builder method: set the payload
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Builder method: callback to run once the bus has finished with the event
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Event) -> anyhow::Result<()> + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Builder method: track completion without a callback of our own
    pub fn track_completion(self) -> Self {
        self.on_complete(|_| Ok(()))
    }

    /// Builder method: token that invalidates the event when cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn domain(&self) -> i32 {
        self.domain
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }
}

impl fmt::Debug for EventRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRequest")
            .field("domain", &self.domain)
            .field("code", &self.code)
            .field("payload", &self.payload)
            .field("on_complete", &self.on_complete.is_some())
            .field("cancellation", &self.cancellation)
            .finish()
    }
}

/// A native event
pub struct Event {
    shared: Arc<BridgeShared>,
    handle: NativeHandle,
    cancellation: Option<CancellationToken>,
    disposable: bool,
    state: Cell<EventState>,
}

impl Event {
    /// Disposable event over a handle this process just created
    pub(crate) fn new(
        shared: Arc<BridgeShared>,
        handle: NativeHandle,
        cancellation: Option<CancellationToken>,
    ) -> Self {
        Self {
            shared,
            handle,
            cancellation,
            disposable: true,
            state: Cell::new(EventState::Live),
        }
    }

    /// Non-disposable wrapper over a handle the bus delivered
    pub(crate) fn wrap(
        shared: Arc<BridgeShared>,
        handle: NativeHandle,
        cancellation: Option<CancellationToken>,
    ) -> Self {
        Self {
            shared,
            handle,
            cancellation,
            disposable: false,
            state: Cell::new(EventState::Live),
        }
    }

    fn check_state(&self) -> Result<NativeHandle> {
        match self.state.get() {
            EventState::Live => {}
            _ => return Err(BridgeError::Disposed),
        }
        if self.cancellation.as_ref().is_some_and(|t| t.is_cancelled()) {
            log::debug!("Event {} invalidated by cancellation", self.handle);
            self.state.set(EventState::Cancelled);
            return Err(BridgeError::Disposed);
        }
        if self.handle.is_null() {
            return Err(BridgeError::Disposed);
        }
        Ok(self.handle)
    }

    pub fn domain(&self) -> Result<i32> {
        let handle = self.check_state()?;
        Ok(self.shared.bus.domain(handle))
    }

    pub fn code(&self) -> Result<u32> {
        let handle = self.check_state()?;
        Ok(self.shared.bus.code(handle))
    }

    /// Read the payload back without releasing it
    ///
    /// Fails with `ForeignToken` once the payload has been reclaimed by a
    /// completion, and for payloads this bridge did not produce.
    pub fn payload(&self) -> Result<Payload> {
        let handle = self.check_state()?;
        let Some(ptr) = self.shared.in_flight_payload(handle) else {
            let native = self.shared.bus.payload(handle);
            if native.is_null() {
                return Ok(Payload::new());
            }
            return Err(BridgeError::ForeignToken { addr: native.addr() });
        };
        // SAFETY: in-flight envelopes are only reclaimed on the completion
        // path, after the completion callback has returned.
        unsafe { self.shared.envelope.recover(ptr) }
    }

    /// The native handle, for passing the event to other native calls
    pub fn handle(&self) -> Result<NativeHandle> {
        self.check_state()
    }

    /// True while the handle is set and the cancellation token has not fired
    pub fn is_valid(&self) -> bool {
        self.state.get() == EventState::Live
            && !self.handle.is_null()
            && !self.cancellation.as_ref().is_some_and(|t| t.is_cancelled())
    }

    pub fn is_disposable(&self) -> bool {
        self.disposable
    }

    pub fn state(&self) -> EventState {
        if self.state.get() == EventState::Live
            && self.cancellation.as_ref().is_some_and(|t| t.is_cancelled())
        {
            self.state.set(EventState::Cancelled);
        }
        self.state.get()
    }

    /// Destroy the native event
    ///
    /// Only events this process created may be disposed. A cancelled event
    /// that was never destroyed is still reclaimed here.
    pub fn dispose(&mut self) -> Result<()> {
        if !self.disposable {
            return Err(BridgeError::InvalidOperation(
                "event wraps a delivered handle and cannot be disposed directly".to_string(),
            ));
        }
        if self.handle.is_null() {
            return Err(BridgeError::Disposed);
        }

        let handle = self.release();
        self.state.set(EventState::Disposed);
        log::debug!("Disposed event {}", handle);
        Ok(())
    }

    /// Give the native handle to another owner, such as a channel push
    ///
    /// The event is no longer destroyed when dropped; whoever receives the
    /// handle is responsible for it. Its completion still runs through the
    /// bridge.
    pub fn into_handle(mut self) -> Result<NativeHandle> {
        let handle = self.check_state()?;
        self.disposable = false;
        Ok(handle)
    }

    fn release(&mut self) -> NativeHandle {
        let handle = std::mem::replace(&mut self.handle, NativeHandle::NULL);
        self.cancellation = None;
        self.shared.destroy_native(handle);
        handle
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if !self.disposable || self.handle.is_null() {
            return;
        }
        log::debug!("Event {} dropped without dispose, destroying", self.handle);
        self.release();
        self.state.set(EventState::Finalized);
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("handle", &self.handle)
            .field("state", &self.state.get())
            .field("disposable", &self.disposable)
            .finish()
    }
}
