//! State management module.
//!
//! This module persists the last-observed remote state keyed by resource
//! address. Every backend is versioned: each mutation names the version it
//! expects and bumps the store serial.

mod document;
mod local;
mod lock;
mod memory;
mod store;
mod types;

pub use document::{StateDocument, STATE_FORMAT_VERSION};
pub use local::LocalStateStore;
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
pub use memory::MemoryStateStore;
pub use store::StateStore;
pub use types::{AttributeMap, RemoteStateRecord, ResourceAddress, ResourceMode, StateSnapshot};
