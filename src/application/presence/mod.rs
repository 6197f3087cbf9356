//! Presence
//!
//! The store facade over the key/value cache and the worker that keeps it
//! in step with the hub's registry.

mod store;
mod sync;

pub use store::{PresenceEntry, PresenceStore};
pub use sync::{presence_channel, PresenceReceiver, PresenceRequest, PresenceSender, PresenceSync};
