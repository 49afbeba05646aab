//! Payload envelope
//!
//! The native bus carries a payload as one block of three pointer-sized
//! words, each a [`Token`] from the serializer. This module materializes a
//! [`Payload`] into such a block, reads it back, and tears it down.
//!
//! Ownership of a materialized block is tracked by [`OwnedEnvelope`]: it is
//! either still ours (dropping it destroys the block) or transferred to a
//! native event, after which only [`PayloadEnvelope::destroy`] reclaims it.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;

use super::serializer::{PayloadSerializer, SerializeMode, Token};
use super::value::PayloadValue;
use crate::alloc::NativeAllocator;
use crate::registry::{PointerKind, PointerRegistry};
use crate::types::{BridgeError, EnvelopePtr, Result};

/// Native layout of an event payload
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RawEnvelope {
    data1: Token,
    data2: Token,
    data3: Token,
}

const _: () = assert!(std::mem::size_of::<RawEnvelope>() == 3 * std::mem::size_of::<usize>());

impl RawEnvelope {
    fn tokens(&self) -> [Token; 3] {
        [self.data1, self.data2, self.data3]
    }
}

/// The payload of an event: three independent optional values
#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub data1: Option<PayloadValue>,
    pub data2: Option<PayloadValue>,
    pub data3: Option<PayloadValue>,
    mode: Option<SerializeMode>,
}

impl Payload {
    /// Create an empty payload
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a payload from up to three values
    pub fn from_values(
        data1: Option<PayloadValue>,
        data2: Option<PayloadValue>,
        data3: Option<PayloadValue>,
    ) -> Self {
        Self {
            data1,
            data2,
            data3,
            mode: None,
        }
    }

    /// Builder method: set the first slot
    pub fn with_data1(mut self, value: impl Into<PayloadValue>) -> Self {
        self.data1 = Some(value.into());
        self
    }

    /// Builder method: set the second slot
    pub fn with_data2(mut self, value: impl Into<PayloadValue>) -> Self {
        self.data2 = Some(value.into());
        self
    }

    /// Builder method: set the third slot
    pub fn with_data3(mut self, value: impl Into<PayloadValue>) -> Self {
        self.data3 = Some(value.into());
        self
    }

    /// Builder method: choose how the values are made addressable natively
    pub fn with_mode(mut self, mode: SerializeMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Serialization mode requested by this payload, if any
    pub fn mode(&self) -> Option<SerializeMode> {
        self.mode
    }

    /// True if all three slots are absent
    pub fn is_empty(&self) -> bool {
        self.data1.is_none() && self.data2.is_none() && self.data3.is_none()
    }

    /// Borrow the three slots in order
    pub fn values(&self) -> [Option<&PayloadValue>; 3] {
        [self.data1.as_ref(), self.data2.as_ref(), self.data3.as_ref()]
    }

    fn into_values(self) -> [Option<PayloadValue>; 3] {
        [self.data1, self.data2, self.data3]
    }
}

// Only the slots take part in equality; the serialization mode is a request,
// not part of the data.
impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.data1 == other.data1 && self.data2 == other.data2 && self.data3 == other.data3
    }
}

/// Converts payloads to and from native envelopes
#[derive(Clone)]
pub struct PayloadEnvelope {
    serializer: PayloadSerializer,
    allocator: Arc<dyn NativeAllocator>,
    pointers: Arc<PointerRegistry>,
    default_mode: SerializeMode,
}

impl PayloadEnvelope {
    pub fn new(
        allocator: Arc<dyn NativeAllocator>,
        pointers: Arc<PointerRegistry>,
        default_mode: SerializeMode,
    ) -> Self {
        Self {
            serializer: PayloadSerializer::new(Arc::clone(&allocator)),
            allocator,
            pointers,
            default_mode,
        }
    }

    pub fn serializer(&self) -> &PayloadSerializer {
        &self.serializer
    }

    pub fn pointers(&self) -> &Arc<PointerRegistry> {
        &self.pointers
    }

    /// Serialize a payload into a newly allocated envelope
    ///
    /// An empty payload allocates nothing and yields a null envelope. If any
    /// allocation fails, every token produced so far is released before the
    /// error is returned.
    pub fn materialize(&self, payload: Payload) -> Result<OwnedEnvelope<'_>> {
        if payload.is_empty() {
            return Ok(OwnedEnvelope::new(self, EnvelopePtr::NULL));
        }

        let mode = payload.mode().unwrap_or(self.default_mode);
        let mut tokens = [Token::NULL; 3];
        for (slot, value) in payload.into_values().into_iter().enumerate() {
            match self.serializer.serialize(value, mode) {
                Ok(token) => tokens[slot] = token,
                Err(e) => {
                    self.release_unregistered(&tokens);
                    return Err(e);
                }
            }
        }

        let layout = Layout::new::<RawEnvelope>();
        let Some(block) = self.allocator.allocate(layout) else {
            log::warn!("Native allocation of payload envelope failed");
            self.release_unregistered(&tokens);
            return Err(BridgeError::AllocationFailure {
                size: layout.size(),
            });
        };

        let raw = RawEnvelope {
            data1: tokens[0],
            data2: tokens[1],
            data3: tokens[2],
        };
        // SAFETY: block is a fresh allocation with RawEnvelope's layout.
        unsafe { block.cast::<RawEnvelope>().as_ptr().write(raw) };

        for token in raw.tokens() {
            self.pointers.register(token.addr(), PointerKind::Token);
        }
        let ptr = EnvelopePtr::from_addr(block.as_ptr() as usize);
        self.pointers.register(ptr.addr(), PointerKind::Envelope);

        log::debug!("Materialized payload envelope {} ({:?})", ptr, mode);
        Ok(OwnedEnvelope::new(self, ptr))
    }

    /// Read a payload back out of an envelope without freeing anything
    ///
    /// Envelopes and tokens this bridge did not register (for example the
    /// payload of an event some other process created) are rejected with
    /// `ForeignToken` instead of being decoded, as is an address registered
    /// as a token rather than an envelope.
    ///
    /// # Safety
    /// The envelope must not be destroyed concurrently with this call.
    pub unsafe fn recover(&self, ptr: EnvelopePtr) -> Result<Payload> {
        if ptr.is_null() {
            return Ok(Payload::new());
        }
        if !self.pointers.contains(ptr.addr(), PointerKind::Envelope) {
            return Err(BridgeError::ForeignToken { addr: ptr.addr() });
        }
        let raw = (ptr.addr() as *const RawEnvelope).read();
        Ok(Payload::from_values(
            self.recover_token(raw.data1)?,
            self.recover_token(raw.data2)?,
            self.recover_token(raw.data3)?,
        ))
    }

    unsafe fn recover_token(&self, token: Token) -> Result<Option<PayloadValue>> {
        if !token.is_null() && !self.pointers.contains(token.addr(), PointerKind::Token) {
            return Err(BridgeError::ForeignToken { addr: token.addr() });
        }
        self.serializer.deserialize(token)
    }

    /// Free an envelope and the tokens it holds
    ///
    /// Only envelopes and tokens still present in the pointer registry under
    /// their own kind are touched, so calling this again for the same
    /// envelope, for an envelope this bridge never produced, or for a stale
    /// address that now belongs to another event's token, does nothing.
    ///
    /// # Safety
    /// A non-null `ptr` that is still registered must be an envelope produced
    /// by [`materialize`](Self::materialize) on a bridge sharing this
    /// allocator.
    pub unsafe fn destroy(&self, ptr: EnvelopePtr) {
        if ptr.is_null() {
            return;
        }
        if !self.pointers.unregister(ptr.addr(), PointerKind::Envelope) {
            log::trace!("Envelope {} already reclaimed", ptr);
            return;
        }

        let raw = (ptr.addr() as *const RawEnvelope).read();
        for token in raw.tokens() {
            if self.pointers.unregister(token.addr(), PointerKind::Token) {
                self.serializer.release(token);
            }
        }
        self.allocator.deallocate(
            NonNull::new_unchecked(ptr.addr() as *mut u8),
            Layout::new::<RawEnvelope>(),
        );
        log::debug!("Destroyed payload envelope {}", ptr);
    }

    fn release_unregistered(&self, tokens: &[Token; 3]) {
        for token in tokens {
            // SAFETY: these tokens were just produced and never shared.
            unsafe { self.serializer.release(*token) };
        }
    }
}

impl std::fmt::Debug for PayloadEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadEnvelope")
            .field("registered_pointers", &self.pointers.len())
            .field("default_mode", &self.default_mode)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Allocated,
    Transferred,
}

/// A materialized envelope that has not yet been handed to the native side
///
/// Dropping it destroys the envelope. [`into_native`](Self::into_native)
/// gives up ownership once a native event holds the pointer.
#[derive(Debug)]
pub struct OwnedEnvelope<'a> {
    envelope: &'a PayloadEnvelope,
    ptr: EnvelopePtr,
    state: BlockState,
}

impl<'a> OwnedEnvelope<'a> {
    fn new(envelope: &'a PayloadEnvelope, ptr: EnvelopePtr) -> Self {
        Self {
            envelope,
            ptr,
            state: BlockState::Allocated,
        }
    }

    pub fn ptr(&self) -> EnvelopePtr {
        self.ptr
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Transfer ownership of the block to the native side
    pub fn into_native(mut self) -> EnvelopePtr {
        self.state = BlockState::Transferred;
        self.ptr
    }
}

impl Drop for OwnedEnvelope<'_> {
    fn drop(&mut self) {
        if self.state == BlockState::Allocated && !self.ptr.is_null() {
            log::debug!("Unwinding untransferred envelope {}", self.ptr);
            // SAFETY: the block is ours and was never handed out.
            unsafe { self.envelope.destroy(self.ptr) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{LimitedAllocator, TrackingAllocator};

    fn envelope() -> (PayloadEnvelope, Arc<TrackingAllocator>, Arc<PointerRegistry>) {
        let alloc = Arc::new(TrackingAllocator::new());
        let pointers = Arc::new(PointerRegistry::new());
        let envelope = PayloadEnvelope::new(alloc.clone(), pointers.clone(), SerializeMode::Copied);
        (envelope, alloc, pointers)
    }

    #[test]
    fn test_empty_payload_allocates_nothing() {
        let (envelope, alloc, pointers) = envelope();
        let owned = envelope.materialize(Payload::new()).unwrap();
        assert!(owned.is_null());
        drop(owned);

        assert_eq!(alloc.stats().allocations, 0);
        assert!(pointers.is_empty());
    }

    #[test]
    fn test_materialize_recover_destroy() {
        let (envelope, alloc, pointers) = envelope();
        let payload = Payload::new().with_data1(7i32).with_data3("three");

        let ptr = envelope.materialize(payload.clone()).unwrap().into_native();
        assert!(!ptr.is_null());
        // Two tokens plus the envelope block
        assert_eq!(alloc.stats().live_blocks, 3);
        assert_eq!(pointers.len(), 3);

        let recovered = unsafe { envelope.recover(ptr) }.unwrap();
        assert_eq!(recovered, payload);
        assert!(recovered.data2.is_none());

        unsafe { envelope.destroy(ptr) };
        assert_eq!(alloc.stats().live_blocks, 0);
        assert!(pointers.is_empty());
    }

    #[test]
    fn test_destroy_twice_is_a_noop() {
        let (envelope, alloc, _pointers) = envelope();
        let ptr = envelope
            .materialize(Payload::new().with_data2(1.25f64))
            .unwrap()
            .into_native();

        unsafe {
            envelope.destroy(ptr);
            envelope.destroy(ptr);
        }
        let stats = alloc.stats();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.deallocations, 2);
    }

    #[test]
    fn test_destroy_skips_tokens_already_unregistered() {
        let (envelope, alloc, pointers) = envelope();
        let ptr = envelope
            .materialize(Payload::new().with_data1(1u8).with_data2(2u8))
            .unwrap()
            .into_native();

        let raw = unsafe { (ptr.addr() as *const RawEnvelope).read() };
        assert!(pointers.unregister(raw.data1.addr(), PointerKind::Token));

        unsafe { envelope.destroy(ptr) };
        // data1 was not freed because someone else claimed it
        assert_eq!(alloc.stats().live_blocks, 1);
        unsafe { envelope.serializer().release(raw.data1) };
        assert_eq!(alloc.stats().live_blocks, 0);
    }

    #[test]
    fn test_recover_rejects_unregistered_envelope() {
        let (envelope, _alloc, _pointers) = envelope();
        let foreign = [0usize; 3];
        let ptr = EnvelopePtr::from_addr(foreign.as_ptr() as usize);
        assert!(matches!(
            unsafe { envelope.recover(ptr) },
            Err(BridgeError::ForeignToken { .. })
        ));
    }

    #[test]
    fn test_null_envelope_ops() {
        let (envelope, alloc, _pointers) = envelope();
        assert!(unsafe { envelope.recover(EnvelopePtr::NULL) }.unwrap().is_empty());
        unsafe { envelope.destroy(EnvelopePtr::NULL) };
        assert_eq!(alloc.stats().allocations, 0);
    }

    #[test]
    fn test_dropping_owned_envelope_reclaims_it() {
        let (envelope, alloc, pointers) = envelope();
        let owned = envelope.materialize(Payload::new().with_data1(true)).unwrap();
        assert_eq!(alloc.stats().live_blocks, 2);
        drop(owned);
        assert_eq!(alloc.stats().live_blocks, 0);
        assert!(pointers.is_empty());
    }

    #[test]
    fn test_envelope_allocation_failure_releases_tokens() {
        // Three token blocks succeed, the envelope block fails
        let alloc = Arc::new(TrackingAllocator::wrap(LimitedAllocator::new(3)));
        let pointers = Arc::new(PointerRegistry::new());
        let envelope = PayloadEnvelope::new(alloc.clone(), pointers.clone(), SerializeMode::Copied);

        let payload = Payload::new().with_data1(1i64).with_data2(2i64).with_data3(3i64);
        let result = envelope.materialize(payload);

        assert!(matches!(result, Err(BridgeError::AllocationFailure { .. })));
        let stats = alloc.stats();
        assert_eq!(stats.allocations, 3);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.live_blocks, 0);
        assert!(pointers.is_empty());
    }

    #[test]
    fn test_token_allocation_failure_releases_earlier_tokens() {
        let alloc = Arc::new(TrackingAllocator::wrap(LimitedAllocator::new(1)));
        let pointers = Arc::new(PointerRegistry::new());
        let envelope = PayloadEnvelope::new(alloc.clone(), pointers.clone(), SerializeMode::Copied);

        let result = envelope.materialize(Payload::new().with_data1(1u16).with_data2(2u16));
        assert!(result.is_err());
        assert_eq!(alloc.stats().live_blocks, 0);
    }

    #[test]
    fn test_pinned_payload_uses_only_envelope_block() {
        let (envelope, alloc, _pointers) = envelope();
        let payload = Payload::new()
            .with_data1(PayloadValue::opaque(42u64))
            .with_data2(vec![1u8, 2, 3])
            .with_mode(SerializeMode::Pinned);

        let ptr = envelope.materialize(payload.clone()).unwrap().into_native();
        assert_eq!(alloc.stats().live_blocks, 1);
        assert_eq!(unsafe { envelope.recover(ptr) }.unwrap(), payload);

        unsafe { envelope.destroy(ptr) };
        assert_eq!(alloc.stats().live_blocks, 0);
    }

    #[test]
    fn test_token_address_is_not_an_envelope() {
        let (envelope, alloc, pointers) = envelope();
        let ptr = envelope
            .materialize(Payload::new().with_data1(7u8))
            .unwrap()
            .into_native();
        let raw = unsafe { (ptr.addr() as *const RawEnvelope).read() };
        let token_as_envelope = EnvelopePtr::from_addr(raw.data1.addr());

        assert!(matches!(
            unsafe { envelope.recover(token_as_envelope) },
            Err(BridgeError::ForeignToken { .. })
        ));
        unsafe { envelope.destroy(token_as_envelope) };
        assert_eq!(alloc.stats().live_blocks, 2);
        assert_eq!(pointers.kind_of(raw.data1.addr()), Some(PointerKind::Token));
        assert_eq!(
            unsafe { envelope.recover(ptr) }.unwrap().data1,
            Some(PayloadValue::U8(7))
        );

        unsafe { envelope.destroy(ptr) };
        assert_eq!(alloc.stats().live_blocks, 0);
    }
}
