//! Bus-mediated routing for horizontally scaled deployments.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{DispatchOutcome, MessageRouter, RouterError};
use crate::config::MessageMode;
use crate::domain::ChatMessage;
use crate::infrastructure::bus::MessageBusClient;
use crate::infrastructure::metrics;

/// Publishes every message to the topic of its kind, keyed by target id.
///
/// Recipient presence is not consulted; an offline recipient picks the
/// message up from the log once some instance's consumer reaches it.
pub struct DistributedRouter {
    bus: Arc<MessageBusClient>,
}

impl DistributedRouter {
    pub fn new(bus: Arc<MessageBusClient>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl MessageRouter for DistributedRouter {
    async fn dispatch(&self, message: ChatMessage) -> Result<DispatchOutcome, RouterError> {
        let topic = self.bus.topics().for_kind(message.kind).to_string();

        match self.bus.publish(&topic, message.target.id(), &message).await {
            Ok(receipt) => {
                metrics::record_routed(MessageMode::Bus.as_str(), "published");
                debug!(
                    message_id = %message.id,
                    topic = %receipt.topic,
                    partition = receipt.partition,
                    "Message published"
                );
                Ok(DispatchOutcome::Published {
                    topic: receipt.topic,
                    partition: receipt.partition,
                })
            }
            Err(e) => {
                metrics::record_routed(MessageMode::Bus.as_str(), "failed");
                warn!(message_id = %message.id, topic = %topic, error = %e, "Publish failed");
                Err(e.into())
            }
        }
    }

    fn mode(&self) -> MessageMode {
        MessageMode::Bus
    }
}
