//! BPS Event Bridge Library
//!
//! Creates, serializes, dispatches and reclaims events on a native event bus
//! (BPS), each carrying up to three payload values, and reports back when the
//! bus has finished with an event.
//!
//! # Architecture
//!
//! - Payload values are serialized into native memory and laid out in a
//!   three-word envelope the bus carries alongside the event
//! - A pointer registry records every native block the bridge owns, so each
//!   one is freed exactly once no matter which path reaches it first
//! - A completion registry correlates the native handle reported by the bus
//!   with the callback supplied when the event was created
//! - The native bus is a trait: the real library is loaded at runtime
//!   ([`DynamicBus`]) and an in-process [`SimulatedBus`] drives tests
//!
//! The library does NOT:
//! - Initialise or shut down the bus
//! - Run a dispatch loop or manage channels
//! - Register domains beyond creating and destroying events
//!
//! # Example Usage
//!
//! ```no_run
//! use bps_event::{EventBridge, Payload, SimulatedBus};
//! use std::sync::Arc;
//!
//! let bus = Arc::new(SimulatedBus::new());
//! let bridge = EventBridge::new(bus.clone());
//!
//! let payload = Payload::new().with_data1(42i32).with_data2("hello");
//! let mut event = bridge
//!     .create_event_with_completion(0x10, 0x01, payload, |event| {
//!         println!("Bus finished with event {:?}", event.handle()?);
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! assert_eq!(event.domain().unwrap(), 0x10);
//! let data = event.payload().unwrap();
//! println!("data1 = {:?}", data.data1);
//!
//! // Destroying the event runs the callback and frees the payload
//! event.dispose().unwrap();
//! ```

// Public modules
pub mod alloc;
pub mod bridge;
pub mod bus;
pub mod completion;
pub mod config;
pub mod event;
pub mod payload;
pub mod registry;
pub mod types;

// Re-export main types for convenience
pub use alloc::{AllocationStats, NativeAllocator, SystemAllocator, TrackingAllocator};
pub use bridge::{EventBridge, EventBridgeBuilder};
pub use bus::simulated::SimulatedStats;
pub use bus::{is_success, CompletionFn, DynamicBus, NativeBus, SimulatedBus};
pub use completion::{event_completion, CallbackErrorSink, CallbackFailure, FailureKind, LogSink};
pub use config::{BridgeConfig, DuplicatePolicy};
pub use event::{Event, EventRequest, EventState};
pub use payload::{OwnedEnvelope, Payload, PayloadEnvelope, PayloadSerializer, PayloadValue, SerializeMode, Token};
pub use registry::{CompletionCallback, CompletionRegistry, PointerKind, PointerRegistry};
pub use types::{
    BridgeError, EnvelopePtr, NativeHandle, Result, BPS_FAILURE, BPS_SUCCESS, EVENT_CODE_MAX,
    EVENT_DOMAIN_MAX,
};

pub use tokio_util::sync::CancellationToken;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
