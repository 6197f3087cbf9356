//! In-memory bus backend
//!
//! Single-process log with consumer groups and pending-entry tracking,
//! mirroring the Redis Streams semantics the client relies on. Share one
//! instance between several clients to simulate several relay instances.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::backend::{BusBackend, BusRecord, ReadCursor, ReadRequest};
use crate::config::StartFrom;
use crate::shared::error::BusError;

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: u64,
    /// Delivered but unacknowledged: sequence -> consumer
    pending: BTreeMap<u64, String>,
}

#[derive(Debug, Default)]
struct StreamLog {
    entries: BTreeMap<u64, Vec<u8>>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

impl StreamLog {
    fn last_seq(&self) -> u64 {
        self.next_seq
    }
}

fn record_id(seq: u64) -> String {
    format!("{}-0", seq)
}

fn parse_id(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

#[derive(Debug, Default)]
pub struct MemoryBus {
    streams: Mutex<HashMap<String, StreamLog>>,
    failing_appends: AtomicU32,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` appends fail with `BusError::Unavailable`.
    pub fn fail_next_appends(&self, count: u32) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    /// Records currently retained on a stream.
    pub fn len(&self, stream: &str) -> usize {
        self.streams.lock().get(stream).map_or(0, |log| log.entries.len())
    }

    /// Unacknowledged records of a group on a stream.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    pub fn has_group(&self, stream: &str, group: &str) -> bool {
        self.streams
            .lock()
            .get(stream)
            .is_some_and(|log| log.groups.contains_key(group))
    }

    fn take_failure(&self) -> bool {
        self.failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BusBackend for MemoryBus {
    async fn ping(&self) -> Result<(), BusError> {
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &[u8]) -> Result<String, BusError> {
        if self.take_failure() {
            return Err(BusError::Unavailable("injected append failure".into()));
        }
        let mut streams = self.streams.lock();
        let log = streams.entry(stream.to_string()).or_default();
        log.next_seq += 1;
        let seq = log.next_seq;
        log.entries.insert(seq, payload.to_vec());
        Ok(record_id(seq))
    }

    async fn ensure_group(&self, stream: &str, group: &str, start: StartFrom) -> Result<(), BusError> {
        let mut streams = self.streams.lock();
        let log = streams.entry(stream.to_string()).or_default();
        let last_delivered = match start {
            StartFrom::Earliest => 0,
            StartFrom::Latest => log.last_seq(),
        };
        log.groups.entry(group.to_string()).or_insert_with(|| GroupState {
            last_delivered,
            pending: BTreeMap::new(),
        });
        Ok(())
    }

    async fn read_group(&self, request: &ReadRequest, cursor: ReadCursor) -> Result<Vec<BusRecord>, BusError> {
        let mut streams = self.streams.lock();
        let mut records = Vec::new();

        for name in &request.streams {
            if records.len() >= request.count {
                break;
            }
            let log = streams
                .get_mut(name)
                .ok_or_else(|| BusError::Unavailable(format!("no such stream: {}", name)))?;
            let StreamLog { entries, groups, .. } = log;
            let group = groups
                .get_mut(&request.group)
                .ok_or_else(|| BusError::Unavailable(format!("no such group: {}", request.group)))?;
            let room = request.count - records.len();

            match cursor {
                ReadCursor::Pending => {
                    let seqs: Vec<u64> = group
                        .pending
                        .iter()
                        .filter(|(_, owner)| **owner == request.consumer)
                        .map(|(seq, _)| *seq)
                        .take(room)
                        .collect();
                    for seq in seqs {
                        records.push(BusRecord {
                            stream: name.clone(),
                            id: record_id(seq),
                            payload: entries.get(&seq).cloned().unwrap_or_default(),
                        });
                    }
                }
                ReadCursor::New => {
                    let fresh: Vec<(u64, Vec<u8>)> = entries
                        .range(group.last_delivered + 1..)
                        .take(room)
                        .map(|(seq, payload)| (*seq, payload.clone()))
                        .collect();
                    for (seq, payload) in fresh {
                        group.last_delivered = seq;
                        group.pending.insert(seq, request.consumer.clone());
                        records.push(BusRecord {
                            stream: name.clone(),
                            id: record_id(seq),
                            payload,
                        });
                    }
                }
            }
        }

        Ok(records)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), BusError> {
        let mut streams = self.streams.lock();
        if let Some(state) = streams.get_mut(stream).and_then(|log| log.groups.get_mut(group)) {
            for seq in ids.iter().filter_map(|id| parse_id(id)) {
                state.pending.remove(&seq);
            }
        }
        Ok(())
    }

    async fn remove_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        if let Some(log) = self.streams.lock().get_mut(stream) {
            log.groups.remove(group);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        Ok(())
    }
}
