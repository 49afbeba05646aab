//! Bridge configuration types
//!
//! This module defines the small amount of policy the bridge needs. Anything
//! about which bus to talk to or which events to send belongs to the
//! application layer.

use serde::{Deserialize, Serialize};

use crate::payload::SerializeMode;

/// Configuration for an [`EventBridge`](crate::EventBridge)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// What to do when a completion callback is registered for a handle
    /// that already has one pending
    #[serde(default)]
    pub duplicate_completion: DuplicatePolicy,

    /// Serialize payload values in pinned mode unless the payload says otherwise
    #[serde(default)]
    pub pinned_by_default: bool,
}

/// Policy for a second completion registration on the same native handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Keep the pending callback and fail the new registration
    #[default]
    Reject,
    /// Replace the pending callback with the new one
    Overwrite,
}

impl BridgeConfig {
    /// Create a new bridge configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the duplicate completion policy
    pub fn with_duplicate_completion(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_completion = policy;
        self
    }

    /// Builder method: serialize payloads pinned by default
    pub fn with_pinned_by_default(mut self, pinned: bool) -> Self {
        self.pinned_by_default = pinned;
        self
    }

    /// Serialization mode used for payloads that do not pick one themselves
    pub fn default_mode(&self) -> SerializeMode {
        if self.pinned_by_default {
            SerializeMode::Pinned
        } else {
            SerializeMode::Copied
        }
    }
}
