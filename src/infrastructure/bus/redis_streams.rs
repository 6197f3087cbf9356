//! Redis Streams bus backend
//!
//! Each partition is a stream; each instance reads through its own
//! consumer group so every instance observes every record.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError};
use tracing::{debug, instrument};

use super::backend::{BusBackend, BusRecord, ReadCursor, ReadRequest};
use crate::config::{BusSettings, StartFrom};
use crate::infrastructure::cache::connect_with_retry;
use crate::shared::error::{BusError, StartupError};

/// Stream entry field carrying the encoded message.
pub const PAYLOAD_FIELD: &str = "payload";

#[derive(Clone)]
pub struct RedisStreamBus {
    conn: ConnectionManager,
    max_len: usize,
}

impl RedisStreamBus {
    pub fn new(conn: ConnectionManager, max_len: usize) -> Self {
        Self { conn, max_len }
    }

    /// Dial the bus endpoint with the configured retries.
    #[instrument(skip(settings))]
    pub async fn connect(settings: &BusSettings) -> Result<Self, StartupError> {
        let conn = connect_with_retry(
            "message bus",
            &settings.url,
            settings.connect_attempts,
            settings.dial_timeout(),
            settings.connect_backoff(),
        )
        .await?;
        Ok(Self::new(conn, settings.max_len))
    }
}

#[async_trait]
impl BusBackend for RedisStreamBus {
    #[instrument(skip(self), level = "debug")]
    async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    #[instrument(skip(self, payload), level = "debug")]
    async fn append(&self, stream: &str, payload: &[u8]) -> Result<String, BusError> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd_maxlen(
                stream,
                StreamMaxlen::Approx(self.max_len),
                "*",
                &[(PAYLOAD_FIELD, payload.to_vec())],
            )
            .await?;
        Ok(id)
    }

    #[instrument(skip(self), level = "debug")]
    async fn ensure_group(&self, stream: &str, group: &str, start: StartFrom) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let start_id = match start {
            StartFrom::Earliest => "0",
            StartFrom::Latest => "$",
        };
        let created: Result<(), RedisError> = conn.xgroup_create_mkstream(stream, group, start_id).await;
        match created {
            Ok(()) => {
                debug!(stream = %stream, group = %group, "Consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, request), level = "debug", fields(group = %request.group))]
    async fn read_group(&self, request: &ReadRequest, cursor: ReadCursor) -> Result<Vec<BusRecord>, BusError> {
        let mut conn = self.conn.clone();
        let start = match cursor {
            ReadCursor::Pending => "0",
            ReadCursor::New => ">",
        };
        let ids = vec![start; request.streams.len()];
        let options = StreamReadOptions::default()
            .group(&request.group, &request.consumer)
            .count(request.count);

        let reply: Option<StreamReadReply> = conn.xread_options(&request.streams, &ids, &options).await?;

        let records = reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| {
                        let stream = key.key;
                        key.ids.into_iter().map(move |entry| BusRecord {
                            stream: stream.clone(),
                            payload: entry.get::<Vec<u8>>(PAYLOAD_FIELD).unwrap_or_default(),
                            id: entry.id,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(records)
    }

    #[instrument(skip(self), level = "debug")]
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.xack(stream, group, ids).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn remove_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: bool = conn.xgroup_destroy(stream, group).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        // ConnectionManager closes when the last clone drops
        Ok(())
    }
}

impl std::fmt::Debug for RedisStreamBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamBus")
            .field("max_len", &self.max_len)
            .finish_non_exhaustive()
    }
}
