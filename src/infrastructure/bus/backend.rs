//! Bus backend abstraction
//!
//! The log-structured operations the bus client needs: append to a
//! partition stream, consumer-group reads with explicit acknowledgement.

use async_trait::async_trait;

use crate::config::StartFrom;
use crate::shared::error::BusError;

/// One record read from a partition stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRecord {
    pub stream: String,
    pub id: String,
    /// Encoded message; empty when the stored record carries no payload
    pub payload: Vec<u8>,
}

/// Which records a consumer-group read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Records already delivered to this consumer but not acknowledged
    Pending,
    /// Records never delivered to the group
    New,
}

/// Fixed parameters of one consumer loop's reads.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub group: String,
    pub consumer: String,
    pub streams: Vec<String>,
    pub count: usize,
}

#[async_trait]
pub trait BusBackend: Send + Sync {
    async fn ping(&self) -> Result<(), BusError>;

    /// Append a payload; returns the record id assigned by the backend.
    async fn append(&self, stream: &str, payload: &[u8]) -> Result<String, BusError>;

    /// Create the consumer group (and the stream) if it does not exist.
    async fn ensure_group(&self, stream: &str, group: &str, start: StartFrom) -> Result<(), BusError>;

    /// Non-blocking group read across `request.streams`.
    async fn read_group(&self, request: &ReadRequest, cursor: ReadCursor) -> Result<Vec<BusRecord>, BusError>;

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), BusError>;

    /// Destroy a consumer group with its pending entries. Missing groups are not an error.
    async fn remove_group(&self, stream: &str, group: &str) -> Result<(), BusError>;

    async fn close(&self) -> Result<(), BusError>;
}
