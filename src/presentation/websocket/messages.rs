//! WebSocket Message Types
//!
//! Inbound client frame format. Outbound frames are
//! [`ServerEvent`](crate::application::hub::ServerEvent)s.

use serde::Deserialize;

use crate::domain::{ChatMessage, MessageKind, Target};

/// Text frame sent by a client.
///
/// ```json
/// {"receive_id": "G1001", "kind": "chat", "content": "hello"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientFrame {
    /// User id, or group id when it starts with `G`
    pub receive_id: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub content: String,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Build the message this frame asks to send; `None` without a usable target.
    pub fn into_message(self, sender_id: &str) -> Option<ChatMessage> {
        let target = Target::parse(&self.receive_id)?;
        Some(ChatMessage::new(sender_id, target, self.kind, self.content))
    }
}
