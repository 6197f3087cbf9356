//! Presentation Layer
//!
//! HTTP routes and the WebSocket ingress.

pub mod http;
pub mod middleware;
pub mod websocket;
