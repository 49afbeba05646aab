//! Event bridge
//!
//! [`EventBridge`] ties the pieces together: a native bus, the allocator the
//! payload blocks come from, and the two registries. Cloning a bridge is
//! cheap and every clone shares the same state.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::alloc::{NativeAllocator, SystemAllocator};
use crate::bus::{is_success, NativeBus};
use crate::completion::{self, event_completion, CallbackErrorSink, CreateGuard, LogSink};
use crate::config::BridgeConfig;
use crate::event::{Event, EventRequest};
use crate::payload::{Payload, PayloadEnvelope};
use crate::registry::{CompletionCallback, CompletionRegistry, PointerRegistry};
use crate::types::{validate_code, validate_domain, BridgeError, EnvelopePtr, NativeHandle, Result};

/// State shared by a bridge, its events and the completion route table
pub(crate) struct BridgeShared {
    pub(crate) bus: Arc<dyn NativeBus>,
    pub(crate) envelope: PayloadEnvelope,
    /// Envelopes handed to native events that have not completed yet
    pub(crate) in_flight: Mutex<HashMap<NativeHandle, EnvelopePtr>>,
    pub(crate) completions: Arc<CompletionRegistry>,
    pub(crate) sink: Arc<dyn CallbackErrorSink>,
    pub(crate) config: BridgeConfig,
}

impl BridgeShared {
    /// Handle the native bus reporting that it has finished with `handle`
    ///
    /// Runs the pending callback at most once, then reclaims the payload.
    /// The envelope is taken out of the in-flight table, never re-read from
    /// the bus, so repeated delivery for the same handle frees nothing even
    /// after the allocator has handed the old addresses to another event.
    pub(crate) fn complete(self: &Arc<Self>, handle: NativeHandle) {
        log::trace!("Completion delivered for event {}", handle);

        if let Some(callback) = self.completions.consume(handle) {
            let wrapper = Event::wrap(Arc::clone(self), handle, None);
            if let Some(failure) = completion::invoke_guarded(handle, || callback(&wrapper)) {
                self.sink.report(failure);
            }
        }

        let Some(envelope) = self.in_flight.lock().remove(&handle) else {
            return;
        };
        // SAFETY: in-flight envelopes were materialized by this bridge and
        // each is removed from the table exactly once.
        unsafe { self.envelope.destroy(envelope) };
        self.bus.payload_reclaimed(handle);
    }

    /// Envelope of an event this bridge created and that has not completed
    pub(crate) fn in_flight_payload(&self, handle: NativeHandle) -> Option<EnvelopePtr> {
        self.in_flight.lock().get(&handle).copied()
    }

    /// Destroy a native event and drop its completion route
    pub(crate) fn destroy_native(self: &Arc<Self>, handle: NativeHandle) {
        self.bus.destroy(handle);
        completion::remove_route(handle, self);
    }
}

/// Bridge between safe callers and a native event bus
#[derive(Clone)]
pub struct EventBridge {
    shared: Arc<BridgeShared>,
}

impl EventBridge {
    /// Start building a bridge over `bus`
    pub fn builder(bus: Arc<dyn NativeBus>) -> EventBridgeBuilder {
        EventBridgeBuilder::new(bus)
    }

    /// Bridge over `bus` with default allocator, registries and config
    pub fn new(bus: Arc<dyn NativeBus>) -> Self {
        Self::builder(bus).build()
    }

    /// Create a native event
    ///
    /// Domain and code are checked before anything is allocated or any
    /// native call is made. If the bus refuses the event, the payload that
    /// was materialized for it is released before the error is returned.
    pub fn create(&self, request: EventRequest) -> Result<Event> {
        let EventRequest {
            domain,
            code,
            payload,
            on_complete,
            cancellation,
        } = request;

        let domain = validate_domain(domain)?;
        let code = validate_code(code)?;

        let shared = &self.shared;
        let owned = shared.envelope.materialize(payload)?;
        let guard = CreateGuard::begin();
        let (status, handle) = shared.bus.create(domain, code, owned.ptr(), event_completion);

        if !is_success(status) || handle.is_null() {
            let errno = shared.bus.last_error();
            drop(owned);
            log::debug!(
                "Native create failed for domain 0x{:X} code 0x{:X} (status {}, errno {})",
                domain,
                code,
                status,
                errno
            );
            return Err(BridgeError::native("bps_event_create", errno));
        }

        let envelope = owned.into_native();
        if !envelope.is_null() {
            shared.in_flight.lock().insert(handle, envelope);
        }
        let registered = match on_complete {
            Some(callback) => shared.completions.register(handle, callback),
            None => Ok(()),
        };

        // The bus may run the completion on another thread before create
        // returns. Everything it needs is in place before the route is.
        if guard.publish(handle, Arc::clone(shared)) {
            log::debug!("Event {} completed before create returned", handle);
            shared.complete(handle);
        }

        if let Err(e) = registered {
            // Tear the new event down; its payload goes with the
            // completion that destroy delivers.
            shared.destroy_native(handle);
            return Err(e);
        }

        log::debug!(
            "Created event {} (domain 0x{:X}, code 0x{:X}, payload {})",
            handle,
            domain,
            code,
            envelope
        );
        Ok(Event::new(Arc::clone(shared), handle, cancellation))
    }

    /// Create an event with no payload and no completion callback
    pub fn create_event(&self, domain: i32, code: u32) -> Result<Event> {
        self.create(EventRequest::new(domain, code))
    }

    /// Create an event carrying `payload`
    pub fn create_event_with_payload(&self, domain: i32, code: u32, payload: Payload) -> Result<Event> {
        self.create(EventRequest::new(domain, code).with_payload(payload))
    }

    /// Create an event carrying `payload` and notify `callback` on completion
    pub fn create_event_with_completion<F>(
        &self,
        domain: i32,
        code: u32,
        payload: Payload,
        callback: F,
    ) -> Result<Event>
    where
        F: FnOnce(&Event) -> anyhow::Result<()> + Send + 'static,
    {
        self.create(
            EventRequest::new(domain, code)
                .with_payload(payload)
                .on_complete(callback),
        )
    }

    /// Wrap a handle the native bus delivered to us
    ///
    /// The wrapper cannot be disposed; the bus owns the event.
    pub fn adopt(&self, handle: NativeHandle, cancellation: Option<CancellationToken>) -> Result<Event> {
        if handle.is_null() {
            return Err(BridgeError::Disposed);
        }
        Ok(Event::wrap(Arc::clone(&self.shared), handle, cancellation))
    }

    /// Process a completion for `handle` as if the native bus had called
    /// the trampoline
    pub fn complete(&self, handle: NativeHandle) {
        completion::remove_route(handle, &self.shared);
        self.shared.complete(handle);
    }

    /// Register a completion callback for an event that already exists
    pub fn register_completion(&self, handle: NativeHandle, callback: CompletionCallback) -> Result<()> {
        self.shared.completions.register(handle, callback)
    }

    pub fn bus(&self) -> &Arc<dyn NativeBus> {
        &self.shared.bus
    }

    pub fn envelope(&self) -> &PayloadEnvelope {
        &self.shared.envelope
    }

    pub fn pointers(&self) -> &Arc<PointerRegistry> {
        self.shared.envelope.pointers()
    }

    pub fn completions(&self) -> &Arc<CompletionRegistry> {
        &self.shared.completions
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }
}

impl fmt::Debug for EventBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBridge")
            .field("envelope", &self.shared.envelope)
            .field("completions", &self.shared.completions)
            .field("config", &self.shared.config)
            .finish()
    }
}

/// Builder for [`EventBridge`]
pub struct EventBridgeBuilder {
    bus: Arc<dyn NativeBus>,
    allocator: Option<Arc<dyn NativeAllocator>>,
    pointers: Option<Arc<PointerRegistry>>,
    completions: Option<Arc<CompletionRegistry>>,
    sink: Option<Arc<dyn CallbackErrorSink>>,
    config: BridgeConfig,
}

impl EventBridgeBuilder {
    fn new(bus: Arc<dyn NativeBus>) -> Self {
        Self {
            bus,
            allocator: None,
            pointers: None,
            completions: None,
            sink: None,
            config: BridgeConfig::default(),
        }
    }

    /// Builder method: allocator for native payload blocks
    pub fn with_allocator(mut self, allocator: Arc<dyn NativeAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Builder method: share a pointer registry with other bridges
    pub fn with_pointers(mut self, pointers: Arc<PointerRegistry>) -> Self {
        self.pointers = Some(pointers);
        self
    }

    /// Builder method: share a completion registry with other bridges
    ///
    /// The registry's own duplicate policy wins over the config's.
    pub fn with_completions(mut self, completions: Arc<CompletionRegistry>) -> Self {
        self.completions = Some(completions);
        self
    }

    /// Builder method: where completion callback failures go
    pub fn with_error_sink(mut self, sink: Arc<dyn CallbackErrorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Builder method: bridge configuration
    pub fn with_config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> EventBridge {
        let allocator = self
            .allocator
            .unwrap_or_else(|| Arc::new(SystemAllocator) as Arc<dyn NativeAllocator>);
        let pointers = self.pointers.unwrap_or_default();
        let completions = self
            .completions
            .unwrap_or_else(|| Arc::new(CompletionRegistry::new(self.config.duplicate_completion)));
        let sink = self.sink.unwrap_or_else(|| Arc::new(LogSink) as Arc<dyn CallbackErrorSink>);
        let envelope = PayloadEnvelope::new(allocator, pointers, self.config.default_mode());

        EventBridge {
            shared: Arc::new(BridgeShared {
                bus: self.bus,
                envelope,
                in_flight: Mutex::new(HashMap::new()),
                completions,
                sink,
                config: self.config,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::TrackingAllocator;
    use crate::bus::SimulatedBus;
    use crate::types::EVENT_DOMAIN_MAX;

    fn bridge() -> (EventBridge, Arc<SimulatedBus>, Arc<TrackingAllocator>) {
        let bus = Arc::new(SimulatedBus::new());
        let alloc = Arc::new(TrackingAllocator::new());
        let bridge = EventBridge::builder(bus.clone())
            .with_allocator(alloc.clone())
            .build();
        (bridge, bus, alloc)
    }

    #[test]
    fn test_out_of_range_touches_nothing() {
        let (bridge, bus, alloc) = bridge();
        let payload = Payload::new().with_data1(1i32);

        let err = bridge
            .create_event_with_payload(EVENT_DOMAIN_MAX + 1, 1, payload.clone())
            .unwrap_err();
        assert!(matches!(err, BridgeError::ArgumentOutOfRange { name: "domain", .. }));

        let err = bridge.create_event_with_payload(1, 0x1_0000, payload).unwrap_err();
        assert!(matches!(err, BridgeError::ArgumentOutOfRange { name: "code", .. }));

        assert_eq!(alloc.stats().allocations, 0);
        assert_eq!(bus.stats().created, 0);
    }

    #[test]
    fn test_native_failure_unwinds_payload() {
        let (bridge, bus, alloc) = bridge();
        bus.fail_next_create(12);

        let err = bridge
            .create_event_with_payload(1, 2, Payload::new().with_data1("lost"))
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::NativeCallFailure { call: "bps_event_create", errno: 12, .. }
        ));
        let stats = alloc.stats();
        assert!(stats.allocations > 0);
        assert_eq!(stats.live_blocks, 0);
        assert!(bridge.pointers().is_empty());
    }

    #[test]
    fn test_create_routes_completion() {
        let (bridge, _bus, _alloc) = bridge();
        let mut event = bridge.create_event(3, 4).unwrap();
        let handle = event.handle().unwrap();

        assert!(completion::is_routed(handle));
        event.dispose().unwrap();
        assert!(!completion::is_routed(handle));
    }

    #[test]
    fn test_adopt_null_handle() {
        let (bridge, _bus, _alloc) = bridge();
        assert!(matches!(bridge.adopt(NativeHandle::NULL, None), Err(BridgeError::Disposed)));
    }

    #[test]
    fn test_builder_policy_from_config() {
        let bus = Arc::new(SimulatedBus::new());
        let bridge = EventBridge::builder(bus)
            .with_config(BridgeConfig::new().with_duplicate_completion(crate::DuplicatePolicy::Overwrite))
            .build();
        assert_eq!(bridge.completions().policy(), crate::DuplicatePolicy::Overwrite);
    }
}
