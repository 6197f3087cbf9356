//! Connection Hub
//!
//! In-process registry of live connections, keyed by user id, with one
//! bounded outbound queue per connection.
//!
//! # Invariants
//!
//! - At most one connection per user id; registering again evicts the
//!   previous connection.
//! - Presence requests for a user are emitted while that user's registry
//!   entry is locked, so the presence worker sees them in registry order.
//! - Sending never blocks. A full queue closes and unregisters the
//!   connection instead of dropping the message silently.
//!
//! Lock order is always the presence gate, then a registry shard.

mod events;

pub use events::{Notice, NoticeCode, ServerEvent};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::presence::{PresenceEntry, PresenceRequest, PresenceSender};
use crate::domain::ChatMessage;
use crate::infrastructure::metrics;

/// Result of queuing an event for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Enqueued,
    UserOffline,
    /// The queue was full; the connection has been closed
    QueueFull,
}

impl SendOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendOutcome::Enqueued => "enqueued",
            SendOutcome::UserOffline => "user_offline",
            SendOutcome::QueueFull => "queue_full",
        }
    }
}

/// Per-recipient result of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub user_id: String,
    pub outcome: SendOutcome,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HubError {
    #[error("Connection hub is shut down")]
    Closed,
}

/// The transport's half of a registered connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub user_id: String,
    pub connection_id: Uuid,
    pub receiver: mpsc::Receiver<ServerEvent>,
}

struct Connection {
    id: Uuid,
    sender: mpsc::Sender<ServerEvent>,
    connected_at: DateTime<Utc>,
}

pub struct ConnectionHub {
    connections: DashMap<String, Connection>,
    /// `None` once the hub is shut down
    presence_tx: RwLock<Option<PresenceSender>>,
    instance_id: String,
    queue_capacity: usize,
}

impl ConnectionHub {
    pub fn new(instance_id: impl Into<String>, queue_capacity: usize, presence_tx: PresenceSender) -> Self {
        Self {
            connections: DashMap::new(),
            presence_tx: RwLock::new(Some(presence_tx)),
            instance_id: instance_id.into(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Register a connection for `user_id`, evicting any previous one.
    pub fn register(&self, user_id: &str) -> Result<ConnectionHandle, HubError> {
        let gate = self.presence_tx.read();
        let presence = gate.as_ref().ok_or(HubError::Closed)?;

        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let connection = Connection {
            id: Uuid::now_v7(),
            sender,
            connected_at: Utc::now(),
        };
        let connection_id = connection.id;
        let entry = self.presence_entry(user_id, &connection);

        match self.connections.entry(user_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(connection);
                // Dropping `previous` closes its queue once the notice is drained
                let _ = previous
                    .sender
                    .try_send(Notice::new(NoticeCode::SessionReplaced).into());
                let _ = presence.send(PresenceRequest::SetOnline(entry));
                info!(
                    user_id = %user_id,
                    connection_id = %connection_id,
                    replaced = %previous.id,
                    "Connection replaced"
                );
            }
            Entry::Vacant(vacant) => {
                vacant.insert(connection);
                let _ = presence.send(PresenceRequest::SetOnline(entry));
                info!(user_id = %user_id, connection_id = %connection_id, "Connection registered");
            }
        }
        drop(gate);

        metrics::set_connections(self.connections.len());
        Ok(ConnectionHandle {
            user_id: user_id.to_string(),
            connection_id,
            receiver,
        })
    }

    /// Remove whatever connection `user_id` has. Idempotent.
    pub fn unregister(&self, user_id: &str) -> bool {
        self.remove_where(user_id, |_| true)
    }

    /// Remove the connection only if it is still `connection_id`.
    pub fn release(&self, user_id: &str, connection_id: Uuid) -> bool {
        self.remove_where(user_id, |c| c.id == connection_id)
    }

    fn remove_where(&self, user_id: &str, matches: impl Fn(&Connection) -> bool) -> bool {
        let gate = self.presence_tx.read();
        let removed = match self.connections.entry(user_id.to_string()) {
            Entry::Occupied(occupied) if matches(occupied.get()) => {
                if let Some(presence) = gate.as_ref() {
                    let entry = self.presence_entry(user_id, occupied.get());
                    let _ = presence.send(PresenceRequest::Clear(entry));
                }
                let (_, connection) = occupied.remove_entry();
                info!(user_id = %user_id, connection_id = %connection.id, "Connection unregistered");
                true
            }
            _ => false,
        };
        drop(gate);

        if removed {
            metrics::set_connections(self.connections.len());
        }
        removed
    }

    /// Queue an event for a user without blocking.
    pub fn send(&self, user_id: &str, event: ServerEvent) -> SendOutcome {
        let (connection_id, result) = match self.connections.get(user_id) {
            Some(connection) => (connection.id, connection.sender.try_send(event)),
            None => return SendOutcome::UserOffline,
        };

        match result {
            Ok(()) => SendOutcome::Enqueued,
            Err(TrySendError::Full(_)) => {
                metrics::record_queue_overflow();
                warn!(
                    user_id = %user_id,
                    capacity = self.queue_capacity,
                    "Outbound queue full, closing connection"
                );
                self.release(user_id, connection_id);
                SendOutcome::QueueFull
            }
            Err(TrySendError::Closed(_)) => {
                debug!(user_id = %user_id, "Outbound queue closed, releasing connection");
                self.release(user_id, connection_id);
                SendOutcome::UserOffline
            }
        }
    }

    pub fn send_message(&self, user_id: &str, message: &ChatMessage) -> SendOutcome {
        self.send(user_id, ServerEvent::Message(message.clone()))
    }

    /// Send `message` to every target; one `Delivery` per target.
    pub fn broadcast(&self, message: &ChatMessage, targets: &[String]) -> Vec<Delivery> {
        targets
            .iter()
            .map(|user_id| Delivery {
                user_id: user_id.clone(),
                outcome: self.send_message(user_id, message),
            })
            .collect()
    }

    pub fn notify(&self, user_id: &str, notice: Notice) -> SendOutcome {
        self.send(user_id, notice.into())
    }

    /// Refresh the presence entry of a live connection.
    pub fn touch(&self, user_id: &str, connection_id: Uuid) -> bool {
        let gate = self.presence_tx.read();
        let Some(presence) = gate.as_ref() else {
            return false;
        };
        match self.connections.get(user_id) {
            Some(connection) if connection.id == connection_id => {
                let _ = presence.send(PresenceRequest::SetOnline(
                    self.presence_entry(user_id, &connection),
                ));
                true
            }
            _ => false,
        }
    }

    /// Close every connection and refuse new ones.
    ///
    /// Each live connection gets a `server_shutdown` notice and a presence
    /// clear. Dropping the presence sender ends the presence worker once it
    /// has applied what is queued. Returns the number of connections closed.
    pub fn shutdown(&self) -> usize {
        let mut gate = self.presence_tx.write();
        let Some(presence) = gate.take() else {
            return 0;
        };

        let users: Vec<String> = self.connections.iter().map(|c| c.key().clone()).collect();
        let mut closed = 0;
        for user_id in users {
            if let Some((_, connection)) = self.connections.remove(&user_id) {
                let _ = connection
                    .sender
                    .try_send(Notice::new(NoticeCode::ServerShutdown).into());
                let _ = presence.send(PresenceRequest::Clear(
                    self.presence_entry(&user_id, &connection),
                ));
                closed += 1;
            }
        }
        drop(presence);
        drop(gate);

        metrics::set_connections(self.connections.len());
        info!(closed, "Connection hub shut down");
        closed
    }

    /// The presence entry a connection writes; identical on every refresh so
    /// a clear can match it exactly.
    fn presence_entry(&self, user_id: &str, connection: &Connection) -> PresenceEntry {
        PresenceEntry {
            user_id: user_id.to_string(),
            instance_id: self.instance_id.clone(),
            connection_id: connection.id,
            connected_at: connection.connected_at,
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.connections.contains_key(user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.connections.iter().map(|c| c.key().clone()).collect();
        users.sort();
        users
    }

    pub fn is_closed(&self) -> bool {
        self.presence_tx.read().is_none()
    }
}

impl std::fmt::Debug for ConnectionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHub")
            .field("instance_id", &self.instance_id)
            .field("connections", &self.connections.len())
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}
