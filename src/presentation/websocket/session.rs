//! WebSocket Session Management

use std::time::{Duration, Instant};

use uuid::Uuid;

/// Per-connection state owned by the session's read loop.
#[derive(Debug)]
pub struct SessionState {
    pub user_id: String,
    pub connection_id: Uuid,
    pub frames_received: u64,
    pub last_seen: Instant,
}

impl SessionState {
    pub fn new(user_id: String, connection_id: Uuid) -> Self {
        Self {
            user_id,
            connection_id,
            frames_received: 0,
            last_seen: Instant::now(),
        }
    }

    /// Record inbound traffic of any kind.
    pub fn heartbeat(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn record_frame(&mut self) {
        self.frames_received += 1;
        self.heartbeat();
    }

    pub fn is_alive(&self, idle_timeout: Duration) -> bool {
        self.last_seen.elapsed() < idle_timeout
    }
}
