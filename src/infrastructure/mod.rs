//! Infrastructure Layer
//!
//! Contains implementations for external services including:
//! - Presence cache (Redis, in-memory)
//! - Message bus (Redis Streams, in-memory)
//! - Prometheus metrics

pub mod bus;
pub mod cache;
pub mod metrics;
