//! Registry of pending completion callbacks
//!
//! Maps a native event handle to the callback supplied when the event was
//! created. The completion trampoline consumes each entry at most once.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

use crate::config::DuplicatePolicy;
use crate::event::Event;
use crate::types::{BridgeError, NativeHandle, Result};

/// Callback invoked once the native bus has finished with an event
///
/// It receives a non-disposable wrapper over the completed event. Errors it
/// returns (and panics it raises) are reported to the bridge's
/// [`CallbackErrorSink`](crate::CallbackErrorSink) and go no further.
pub type CompletionCallback = Box<dyn FnOnce(&Event) -> anyhow::Result<()> + Send + 'static>;

/// Concurrent map from native handle to pending completion callback
pub struct CompletionRegistry {
    callbacks: Mutex<HashMap<NativeHandle, CompletionCallback>>,
    policy: DuplicatePolicy,
}

impl CompletionRegistry {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            callbacks: Mutex::new(HashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Record the callback for `handle`
    ///
    /// With [`DuplicatePolicy::Reject`] a second registration before the first
    /// is consumed fails with `DuplicateCompletion` and leaves the pending
    /// callback in place. With [`DuplicatePolicy::Overwrite`] it replaces it.
    pub fn register(&self, handle: NativeHandle, callback: CompletionCallback) -> Result<()> {
        let mut callbacks = self.callbacks.lock();
        match self.policy {
            DuplicatePolicy::Reject if callbacks.contains_key(&handle) => {
                log::warn!("Rejected second completion callback for event {}", handle);
                Err(BridgeError::DuplicateCompletion(handle))
            }
            _ => {
                if callbacks.insert(handle, callback).is_some() {
                    log::warn!("Replaced pending completion callback for event {}", handle);
                }
                Ok(())
            }
        }
    }

    /// Atomically remove and return the callback for `handle`
    pub fn consume(&self, handle: NativeHandle) -> Option<CompletionCallback> {
        self.callbacks.lock().remove(&handle)
    }

    pub fn is_registered(&self, handle: NativeHandle) -> bool {
        self.callbacks.lock().contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.lock().is_empty()
    }
}

impl Default for CompletionRegistry {
    fn default() -> Self {
        Self::new(DuplicatePolicy::default())
    }
}

impl fmt::Debug for CompletionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionRegistry")
            .field("pending", &self.len())
            .field("policy", &self.policy)
            .finish()
    }
}
