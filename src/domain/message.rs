//! Chat Message
//!
//! The immutable unit that flows from ingress through the router to the
//! recipients' outbound queues, and across instances over the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix marking a client-supplied receive id as a group id.
pub const GROUP_ID_PREFIX: char = 'G';

/// What a message announces; selects the bus topic in bus mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Login,
    Logout,
    #[default]
    Chat,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Login => "login",
            MessageKind::Logout => "logout",
            MessageKind::Chat => "chat",
        }
    }
}

/// Recipient of a message: a single user or every member of a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Target {
    User(String),
    Group(String),
}

impl Target {
    /// Interpret a client receive id: ids starting with `G` are groups.
    pub fn parse(receive_id: &str) -> Option<Self> {
        let id = receive_id.trim();
        if id.is_empty() {
            return None;
        }
        if id.starts_with(GROUP_ID_PREFIX) {
            Some(Target::Group(id.to_string()))
        } else {
            Some(Target::User(id.to_string()))
        }
    }

    /// The raw id, used as the bus partition key.
    pub fn id(&self) -> &str {
        match self {
            Target::User(id) | Target::Group(id) => id,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Target::Group(_))
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::User(id) => write!(f, "user:{}", id),
            Target::Group(id) => write!(f, "group:{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender_id: String,
    pub target: Target,
    pub kind: MessageKind,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(
        sender_id: impl Into<String>,
        target: Target,
        kind: MessageKind,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            sender_id: sender_id.into(),
            target,
            kind,
            body: body.into(),
            timestamp: Utc::now(),
        }
    }

    /// Shorthand for a direct chat message.
    pub fn chat(sender_id: impl Into<String>, user_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(sender_id, Target::User(user_id.into()), MessageKind::Chat, body)
    }

    /// Encode into the self-describing bus wire format.
    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
