//! Conversation message types.
//!
//! [`Message`] is what flows through context assembly and into the
//! completion capability. [`ConversationMessage`] is the persisted form read
//! back from the durable store, carrying the ID and position the extraction
//! cursor needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MessageId, WorkspaceId};

/// Speaker of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions and injected context.
    System,
    /// The human.
    User,
    /// The model.
    Assistant,
}

impl Role {
    /// Wire name of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parse a stored role name. Unknown names map to `None`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message in an ordered, append-only conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Speaker.
    pub role: Role,
    /// Plain-text content.
    pub content: String,
    /// When the message was written, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Marks synthetic summary messages so they are never summarized again.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub extracted: bool,
}

impl Message {
    /// Create a message with the given role.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: None,
            extracted: false,
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a synthetic summary message (system role, `extracted`).
    pub fn summary(content: impl Into<String>) -> Self {
        Self {
            extracted: true,
            ..Self::system(content)
        }
    }

    /// Attach a timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// A message as persisted in the durable store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    /// Message ID.
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Monotonic position within the store; later messages have larger values.
    pub position: i64,
    /// Speaker.
    pub role: Role,
    /// Plain-text content.
    pub content: String,
    /// Write time.
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    /// Convert into the context-assembly form.
    #[must_use]
    pub fn to_message(&self) -> Message {
        Message::new(self.role, self.content.clone()).with_timestamp(self.created_at)
    }
}

/// A conversation that may need extraction attention.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    /// Conversation ID.
    pub id: ConversationId,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Last activity.
    pub updated_at: DateTime<Utc>,
}
