//! HTTP Surface
//!
//! Route table and the health handlers.

pub mod handlers;
pub mod routes;
