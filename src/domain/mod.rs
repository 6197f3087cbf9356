//! # Domain Layer
//!
//! Core types of the relay, independent of transport and infrastructure.
//!
//! ## Structure
//!
//! - **message**: `ChatMessage`, its `Target` and `MessageKind`
//! - **directory**: group membership lookup contract

pub mod directory;
pub mod message;

// Re-export commonly used types
pub use directory::{GroupDirectory, InMemoryGroupDirectory};
pub use message::{ChatMessage, MessageKind, Target};
