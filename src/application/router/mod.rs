//! Message routing.
//!
//! One `MessageRouter` is chosen at startup from the configured mode and
//! injected wherever messages enter the system:
//!
//! - [`LocalRouter`] delivers straight into this process's hub.
//! - [`DistributedRouter`] publishes to the message bus; every instance's
//!   consumer hands records to [`LocalDelivery`], which delivers to the
//!   recipients connected there.

mod distributed;
mod local;

pub use distributed::DistributedRouter;
pub use local::LocalRouter;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::application::hub::{ConnectionHub, Delivery};
use crate::config::MessageMode;
use crate::domain::{ChatMessage, GroupDirectory, Target};
use crate::infrastructure::bus::{DeliverySink, MessageBusClient};
use crate::shared::error::BusError;

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Group target not known to the directory.
    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// What happened to a dispatched message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to local connections, one entry per recipient
    Delivered(Vec<Delivery>),
    /// Queued on the bus; delivery happens on whichever instance holds the recipient
    Published { topic: String, partition: u32 },
}

#[async_trait]
pub trait MessageRouter: Send + Sync {
    async fn dispatch(&self, message: ChatMessage) -> Result<DispatchOutcome, RouterError>;

    fn mode(&self) -> MessageMode;
}

/// Build the router for the configured mode.
///
/// Bus mode without a bus client is a configuration error. Channel mode
/// ignores `bus`.
pub fn build_router(
    mode: MessageMode,
    delivery: Arc<LocalDelivery>,
    bus: Option<Arc<MessageBusClient>>,
) -> Result<Arc<dyn MessageRouter>, BusError> {
    match (mode, bus) {
        (MessageMode::Bus, Some(bus)) => Ok(Arc::new(DistributedRouter::new(bus))),
        (MessageMode::Bus, None) => Err(BusError::Unavailable("bus mode requires a bus client".into())),
        (MessageMode::Channel, _) => Ok(Arc::new(LocalRouter::new(delivery))),
    }
}

/// Recipient resolution plus delivery into the local hub.
pub struct LocalDelivery {
    hub: Arc<ConnectionHub>,
    directory: Arc<dyn GroupDirectory>,
}

impl LocalDelivery {
    pub fn new(hub: Arc<ConnectionHub>, directory: Arc<dyn GroupDirectory>) -> Self {
        Self { hub, directory }
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    /// User ids a message goes to. Group senders do not get their own message.
    pub async fn recipients(&self, message: &ChatMessage) -> Result<Vec<String>, RouterError> {
        match &message.target {
            Target::User(user_id) => Ok(vec![user_id.clone()]),
            Target::Group(group_id) => {
                let members = self
                    .directory
                    .members(group_id)
                    .await
                    .ok_or_else(|| RouterError::UnknownGroup(group_id.clone()))?;
                Ok(members
                    .into_iter()
                    .filter(|member| *member != message.sender_id)
                    .collect())
            }
        }
    }

    pub async fn deliver_local(&self, message: &ChatMessage) -> Result<Vec<Delivery>, RouterError> {
        let recipients = self.recipients(message).await?;
        Ok(self.hub.broadcast(message, &recipients))
    }
}

#[async_trait]
impl DeliverySink for LocalDelivery {
    async fn deliver(&self, message: ChatMessage) {
        // Recipients connected elsewhere show up as offline here
        match self.deliver_local(&message).await {
            Ok(deliveries) => debug!(
                message_id = %message.id,
                recipients = deliveries.len(),
                "Bus message forwarded to local connections"
            ),
            Err(e) => debug!(message_id = %message.id, error = %e, "Bus message not deliverable"),
        }
    }
}

impl std::fmt::Debug for LocalDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDelivery")
            .field("hub", &self.hub)
            .finish_non_exhaustive()
    }
}
