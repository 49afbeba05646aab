//! Process-wide correlation tables
//!
//! These are the only shared mutable state in the bridge. Both tables are
//! internally synchronized and are handed to the components that need them
//! explicitly rather than being reached through globals.

pub mod completion;
pub mod pointer;

pub use completion::{CompletionCallback, CompletionRegistry};
pub use pointer::{PointerKind, PointerRegistry};
