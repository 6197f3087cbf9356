//! Presence synchronization worker.
//!
//! The hub emits presence requests from inside its registry critical
//! sections; this worker applies them to the store in the order received.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::store::{PresenceEntry, PresenceStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceRequest {
    /// Store or refresh an entry
    SetOnline(PresenceEntry),
    /// Remove the entry if it still belongs to this connection
    Clear(PresenceEntry),
}

pub type PresenceSender = mpsc::UnboundedSender<PresenceRequest>;
pub type PresenceReceiver = mpsc::UnboundedReceiver<PresenceRequest>;

pub fn presence_channel() -> (PresenceSender, PresenceReceiver) {
    mpsc::unbounded_channel()
}

pub struct PresenceSync {
    store: Arc<PresenceStore>,
    requests: PresenceReceiver,
}

impl PresenceSync {
    pub fn new(store: Arc<PresenceStore>, requests: PresenceReceiver) -> Self {
        Self { store, requests }
    }

    /// Apply requests until every sender is dropped.
    pub async fn run(mut self) {
        let mut applied = 0u64;
        while let Some(request) = self.requests.recv().await {
            match request {
                PresenceRequest::SetOnline(entry) => {
                    self.store.set_online(&entry, self.store.ttl()).await;
                }
                PresenceRequest::Clear(entry) => self.store.clear_if(&entry).await,
            }
            applied += 1;
        }
        debug!(applied, "Presence request channel closed");
        info!("Presence worker stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
