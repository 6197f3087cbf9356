//! In-process routing for single-instance deployments.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{DispatchOutcome, LocalDelivery, MessageRouter, RouterError};
use crate::config::MessageMode;
use crate::domain::ChatMessage;
use crate::infrastructure::metrics;

pub struct LocalRouter {
    delivery: Arc<LocalDelivery>,
}

impl LocalRouter {
    pub fn new(delivery: Arc<LocalDelivery>) -> Self {
        Self { delivery }
    }
}

#[async_trait]
impl MessageRouter for LocalRouter {
    async fn dispatch(&self, message: ChatMessage) -> Result<DispatchOutcome, RouterError> {
        match self.delivery.deliver_local(&message).await {
            Ok(deliveries) => {
                metrics::record_routed(MessageMode::Channel.as_str(), "delivered");
                debug!(
                    message_id = %message.id,
                    target = %message.target,
                    recipients = deliveries.len(),
                    "Message delivered locally"
                );
                Ok(DispatchOutcome::Delivered(deliveries))
            }
            Err(e) => {
                metrics::record_routed(MessageMode::Channel.as_str(), "rejected");
                Err(e)
            }
        }
    }

    fn mode(&self) -> MessageMode {
        MessageMode::Channel
    }
}
