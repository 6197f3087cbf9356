//! # Chat Relay Library
//!
//! A WebSocket chat relay that routes messages between connected users:
//! - In-process through a connection hub (channel mode)
//! - Across instances through a partitioned Redis Streams bus (bus mode)
//! - Redis-backed presence with namespace purge on shutdown
//!
//! ## Architecture
//!
//! The crate keeps the layered layout:
//!
//! - **Domain Layer**: chat messages, targets and the group directory contract
//! - **Application Layer**: connection hub, message routers, presence
//! - **Infrastructure Layer**: cache, message bus and metrics
//! - **Presentation Layer**: HTTP routes and the WebSocket ingress
//!
//! ## Module Structure
//!
//! ```text
//! chat_relay/
//! +-- config/         Configuration management
//! +-- domain/         Messages, targets, group directory
//! +-- application/    Hub, routers, presence
//! +-- infrastructure/ Cache, bus and metrics implementations
//! +-- presentation/   HTTP routes and WebSocket handlers
//! +-- shared/         Error types
//! +-- lifecycle       Ordered startup and shutdown
//! ```

// Configuration module
pub mod config;

// Domain layer - Core types
pub mod domain;

// Application layer - Routing core
pub mod application;

// Infrastructure layer - External implementations
pub mod infrastructure;

// Presentation layer - HTTP and WebSocket handlers
pub mod presentation;

// Shared utilities
pub mod shared;

// Startup ordering and graceful shutdown
pub mod lifecycle;

// Application startup and state management
pub mod startup;

// Telemetry and observability
pub mod telemetry;
