//! Message bus client
//!
//! Producer/consumer wrapper used by the distributed router. Messages are
//! published to `<topic>:<partition>` streams; every instance runs one
//! consumer loop per topic and forwards what it reads into its own hub.
//!
//! # Delivery
//!
//! Publishing is at-least-once: the producer task retries a failed append
//! with a linearly growing backoff and drops the record once the attempts
//! are exhausted. Consumers acknowledge a record only after it has been
//! handed to the sink, and replay their own unacknowledged records first
//! when they start.
//!
//! Records older than the replay window are acknowledged without being
//! delivered, so a group created over a long backlog does not flood the
//! hub with stale traffic.

mod backend;
mod memory;
mod redis_streams;

pub use backend::{BusBackend, BusRecord, ReadCursor, ReadRequest};
pub use memory::MemoryBus;
pub use redis_streams::{RedisStreamBus, PAYLOAD_FIELD};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::BusSettings;
use crate::domain::{ChatMessage, MessageKind};
use crate::infrastructure::metrics;
use crate::shared::error::{BusError, StartupError};

/// Receiver of consumed messages.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, message: ChatMessage);
}

/// Where a published message was queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub topic: String,
    pub partition: u32,
}

/// The three configured topic names.
#[derive(Debug, Clone)]
pub struct TopicSet {
    pub login: String,
    pub logout: String,
    pub chat: String,
}

impl TopicSet {
    pub fn from_settings(settings: &BusSettings) -> Self {
        Self {
            login: settings.login_topic.clone(),
            logout: settings.logout_topic.clone(),
            chat: settings.chat_topic.clone(),
        }
    }

    pub fn for_kind(&self, kind: MessageKind) -> &str {
        match kind {
            MessageKind::Login => &self.login,
            MessageKind::Logout => &self.logout,
            MessageKind::Chat => &self.chat,
        }
    }

    pub fn all(&self) -> [&str; 3] {
        [&self.login, &self.logout, &self.chat]
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.all().contains(&topic)
    }
}

/// FNV-1a (32-bit) of the key, reduced to a partition index.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let hash = key
        .bytes()
        .fold(OFFSET_BASIS, |hash, byte| (hash ^ u32::from(byte)).wrapping_mul(PRIME));
    hash % partitions.max(1)
}

pub fn stream_name(topic: &str, partition: u32) -> String {
    format!("{}:{}", topic, partition)
}

/// A record waiting in the producer queue.
#[derive(Debug)]
struct Outgoing {
    topic: String,
    stream: String,
    payload: Vec<u8>,
}

pub struct MessageBusClient {
    backend: Arc<dyn BusBackend>,
    settings: BusSettings,
    topics: TopicSet,
    producer_tx: Mutex<Option<mpsc::Sender<Outgoing>>>,
    producer_rx: Mutex<Option<mpsc::Receiver<Outgoing>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MessageBusClient {
    pub fn new(backend: Arc<dyn BusBackend>, settings: BusSettings) -> Self {
        let (producer_tx, producer_rx) = mpsc::channel(settings.publish_buffer.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            backend,
            topics: TopicSet::from_settings(&settings),
            settings,
            producer_tx: Mutex::new(Some(producer_tx)),
            producer_rx: Mutex::new(Some(producer_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    pub fn partitions(&self) -> u32 {
        self.settings.partitions
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Single round-trip to the backend, bounded by the operation timeout.
    pub async fn ping(&self) -> Result<(), BusError> {
        timeout(self.settings.timeout(), self.backend.ping())
            .await
            .map_err(|_| BusError::Timeout("ping"))?
    }

    /// Queue a message for the producer task.
    ///
    /// Returns once the record is queued, not once it is appended.
    pub async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        message: &ChatMessage,
    ) -> Result<PublishReceipt, BusError> {
        if !self.topics.contains(topic) {
            return Err(BusError::UnknownTopic(topic.to_string()));
        }
        let sender = self.producer_tx.lock().clone().ok_or(BusError::Closed)?;

        let partition = partition_for(partition_key, self.settings.partitions);
        let outgoing = Outgoing {
            topic: topic.to_string(),
            stream: stream_name(topic, partition),
            payload: message.to_wire()?,
        };

        timeout(self.settings.timeout(), sender.send(outgoing))
            .await
            .map_err(|_| BusError::Timeout("publish queue full"))?
            .map_err(|_| BusError::Closed)?;

        debug!(topic = %topic, partition, message_id = %message.id, "Message queued for bus");
        Ok(PublishReceipt {
            topic: topic.to_string(),
            partition,
        })
    }

    /// Connect, create consumer groups and spawn the producer and consumer tasks.
    pub async fn start(&self, sink: Arc<dyn DeliverySink>) -> Result<(), StartupError> {
        if self.is_closed() {
            return Err(BusError::Closed.into());
        }
        self.wait_until_reachable().await?;

        let group = self.settings.group_name();
        for topic in self.topics.all() {
            for partition in 0..self.settings.partitions {
                let stream = stream_name(topic, partition);
                timeout(
                    self.settings.timeout(),
                    self.backend.ensure_group(&stream, &group, self.settings.start_from),
                )
                .await
                .map_err(|_| BusError::Timeout("ensure group"))??;
            }
        }

        let producer_rx = self
            .producer_rx
            .lock()
            .take()
            .ok_or_else(|| BusError::Unavailable("bus client already started".into()))?;

        let mut tasks = Vec::with_capacity(1 + self.topics.all().len());
        tasks.push(tokio::spawn(run_producer(
            self.backend.clone(),
            producer_rx,
            ProducerPolicy::from_settings(&self.settings),
        )));

        for topic in self.topics.all() {
            let request = ReadRequest {
                group: group.clone(),
                consumer: self.settings.instance_id.clone(),
                streams: (0..self.settings.partitions)
                    .map(|p| stream_name(topic, p))
                    .collect(),
                count: self.settings.read_batch.max(1),
            };
            tasks.push(tokio::spawn(run_consumer(
                self.backend.clone(),
                topic.to_string(),
                request,
                sink.clone(),
                ConsumerPolicy::from_settings(&self.settings),
                self.shutdown_tx.subscribe(),
            )));
        }

        self.tasks.lock().extend(tasks);
        info!(
            group = %group,
            partitions = self.settings.partitions,
            "Message bus client started"
        );
        Ok(())
    }

    /// Stop consumers, flush the producer queue and close the backend.
    ///
    /// Idempotent. Tasks still running after `within` are aborted and the
    /// call reports `BusError::Timeout`.
    pub async fn close(&self, within: Duration) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.shutdown_tx.send(true);
        // Dropping the last sender lets the producer drain and exit
        self.producer_tx.lock().take();
        self.producer_rx.lock().take();

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let drained = timeout(within, join_all(tasks.iter_mut())).await;

        let result = match drained {
            Ok(_) => {
                info!("Message bus client drained");
                Ok(())
            }
            Err(_) => {
                for task in &tasks {
                    task.abort();
                }
                warn!(timeout = ?within, "Message bus client did not drain in time");
                Err(BusError::Timeout("close"))
            }
        };

        if result.is_ok() && self.settings.remove_group_on_close {
            self.remove_groups(within).await;
        }

        let closed = self.backend.close().await;
        result.and(closed)
    }

    /// Destroy this instance's group on every partition stream. Failures are logged.
    async fn remove_groups(&self, within: Duration) {
        let group = self.settings.group_name();
        for topic in self.topics.all() {
            for partition in 0..self.settings.partitions {
                let stream = stream_name(topic, partition);
                let removed = timeout(within, self.backend.remove_group(&stream, &group))
                    .await
                    .unwrap_or(Err(BusError::Timeout("remove group")));
                if let Err(e) = removed {
                    warn!(stream = %stream, group = %group, error = %e, "Consumer group not removed");
                }
            }
        }
        debug!(group = %group, "Consumer groups removed");
    }

    async fn wait_until_reachable(&self) -> Result<(), StartupError> {
        let attempts = self.settings.connect_attempts.max(1);
        let mut reason = String::new();

        for attempt in 1..=attempts {
            match timeout(self.settings.dial_timeout(), self.backend.ping()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => reason = e.to_string(),
                Err(_) => reason = "ping timed out".into(),
            }
            warn!(attempt, attempts, error = %reason, "Message bus not reachable");
            if attempt < attempts {
                sleep(self.settings.connect_backoff()).await;
            }
        }

        Err(StartupError::Unreachable {
            dependency: "message bus",
            attempts,
            reason,
        })
    }
}

impl std::fmt::Debug for MessageBusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBusClient")
            .field("topics", &self.topics)
            .field("partitions", &self.settings.partitions)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
struct ProducerPolicy {
    attempts: u32,
    backoff: Duration,
    op_timeout: Duration,
}

impl ProducerPolicy {
    fn from_settings(settings: &BusSettings) -> Self {
        Self {
            attempts: settings.publish_attempts.max(1),
            backoff: settings.retry_backoff(),
            op_timeout: settings.timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ConsumerPolicy {
    poll_interval: Duration,
    op_timeout: Duration,
    replay_window: Option<Duration>,
}

impl ConsumerPolicy {
    fn from_settings(settings: &BusSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            op_timeout: settings.timeout(),
            replay_window: settings.replay_window(),
        }
    }

    fn is_expired(&self, message: &ChatMessage) -> bool {
        let Some(window) = self.replay_window else {
            return false;
        };
        chrono::Duration::from_std(window)
            .map(|window| message.timestamp < Utc::now() - window)
            .unwrap_or(false)
    }
}

async fn run_producer(
    backend: Arc<dyn BusBackend>,
    mut queue: mpsc::Receiver<Outgoing>,
    policy: ProducerPolicy,
) {
    while let Some(record) = queue.recv().await {
        // Failures are logged and counted inside
        let _ = append_with_retry(backend.as_ref(), &record, policy).await;
    }
    debug!("Producer queue drained");
}

async fn append_with_retry(
    backend: &dyn BusBackend,
    record: &Outgoing,
    policy: ProducerPolicy,
) -> Result<String, BusError> {
    let mut attempt = 1u32;
    loop {
        let result = timeout(policy.op_timeout, backend.append(&record.stream, &record.payload))
            .await
            .unwrap_or(Err(BusError::Timeout("append")));

        match result {
            Ok(id) => {
                metrics::record_bus_publish(&record.topic, "ok");
                return Ok(id);
            }
            Err(e) if attempt < policy.attempts => {
                metrics::record_bus_publish(&record.topic, "retry");
                warn!(stream = %record.stream, attempt, error = %e, "Bus append failed, retrying");
                sleep(policy.backoff * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                metrics::record_bus_publish(&record.topic, "dropped");
                error!(
                    stream = %record.stream,
                    attempts = policy.attempts,
                    error = %e,
                    "Bus append failed, dropping record"
                );
                return Err(e);
            }
        }
    }
}

async fn run_consumer(
    backend: Arc<dyn BusBackend>,
    topic: String,
    request: ReadRequest,
    sink: Arc<dyn DeliverySink>,
    policy: ConsumerPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut cursor = ReadCursor::Pending;
    debug!(topic = %topic, streams = ?request.streams, "Consumer loop started");

    while !*shutdown.borrow() {
        let read = timeout(policy.op_timeout, backend.read_group(&request, cursor))
            .await
            .unwrap_or(Err(BusError::Timeout("read")));

        match read {
            Ok(records) if records.is_empty() => {
                if cursor == ReadCursor::Pending {
                    debug!(topic = %topic, "Pending records replayed");
                    cursor = ReadCursor::New;
                    continue;
                }
                if !idle(&mut shutdown, policy.poll_interval).await {
                    break;
                }
            }
            Ok(records) => {
                let mut all_acked = true;
                for record in records {
                    all_acked &= forward(backend.as_ref(), &topic, &request.group, record, sink.as_ref(), policy).await;
                }
                // Unacked records come straight back from the pending list
                if !all_acked && !idle(&mut shutdown, policy.poll_interval).await {
                    break;
                }
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Bus read failed");
                if !idle(&mut shutdown, policy.poll_interval).await {
                    break;
                }
            }
        }
    }

    debug!(topic = %topic, "Consumer loop stopped");
}

/// Decode, hand to the sink, then acknowledge. Returns whether the ack succeeded.
async fn forward(
    backend: &dyn BusBackend,
    topic: &str,
    group: &str,
    record: BusRecord,
    sink: &dyn DeliverySink,
    policy: ConsumerPolicy,
) -> bool {
    match ChatMessage::from_wire(&record.payload) {
        Ok(message) if policy.is_expired(&message) => {
            metrics::record_bus_consumed(topic, "expired");
            debug!(stream = %record.stream, id = %record.id, sent_at = %message.timestamp, "Skipping bus record outside the replay window");
        }
        Ok(message) => {
            sink.deliver(message).await;
            metrics::record_bus_consumed(topic, "delivered");
        }
        Err(e) => {
            metrics::record_bus_consumed(topic, "undecodable");
            warn!(stream = %record.stream, id = %record.id, error = %e, "Skipping undecodable bus record");
        }
    }

    let acked = timeout(
        policy.op_timeout,
        backend.ack(&record.stream, group, std::slice::from_ref(&record.id)),
    )
    .await
    .unwrap_or(Err(BusError::Timeout("ack")));
    match acked {
        Ok(()) => true,
        Err(e) => {
            warn!(stream = %record.stream, id = %record.id, error = %e, "Bus ack failed");
            false
        }
    }
}

/// Sleep for the poll interval; false once shutdown was requested.
async fn idle(shutdown: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    tokio::select! {
        _ = sleep(interval) => !*shutdown.borrow(),
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}
