//! Application Layer
//!
//! The routing core: the connection hub, the dual-mode message router and
//! presence synchronization. This layer sits between the WebSocket
//! presentation and the cache/bus infrastructure.

pub mod hub;
pub mod presence;
pub mod router;
