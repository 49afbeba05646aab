//! Event payloads and their native representation
//!
//! A payload is three optional values. On its way to the native bus each
//! present value becomes one [`Token`] (serializer), and the three tokens are
//! laid out in a single three-word block (envelope). This module is the only
//! place that reads or writes native memory.

pub mod envelope;
pub mod serializer;
pub mod value;

pub use envelope::{OwnedEnvelope, Payload, PayloadEnvelope};
pub use serializer::{PayloadSerializer, SerializeMode, Token};
pub use value::PayloadValue;
