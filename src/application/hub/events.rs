//! Outbound events
//!
//! Everything a connection's writer sends to the client: routed messages
//! and server notices.

use serde::{Deserialize, Serialize};

use crate::domain::ChatMessage;

/// Server notice codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeCode {
    /// Another connection registered for the same user
    SessionReplaced,
    ServerShutdown,
    /// Direct recipient has no live connection here
    UserOffline,
    UnknownGroup,
    InvalidFrame,
    /// The router could not accept the message
    DeliveryFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub code: NoticeCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Notice {
    pub fn new(code: NoticeCode) -> Self {
        Self {
            code,
            target: None,
            detail: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A frame queued for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerEvent {
    Message(ChatMessage),
    Notice(Notice),
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<Notice> for ServerEvent {
    fn from(notice: Notice) -> Self {
        ServerEvent::Notice(notice)
    }
}
