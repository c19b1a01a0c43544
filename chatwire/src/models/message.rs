//! Message model representing one entry in the conversation ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Message from the user.
    User,
    /// Message from the assistant.
    Assistant,
    /// System message.
    System,
}

impl MessageRole {
    /// Convert role to string for the wire and for storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    /// Parse role from a stored string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An action affordance attached to an assistant message (e.g. a quick
/// reply button supplied by the backend).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAction {
    /// Label shown to the user.
    pub label: String,
    /// Opaque action payload forwarded back to the backend when chosen.
    pub value: String,
}

/// A message in the conversation ledger.
///
/// A message with `is_streaming == true` is a live placeholder owned by the
/// in-flight exchange; once the stream handle is finalized the message is
/// flipped to `is_streaming == false` and becomes immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier within the session.
    pub id: Uuid,
    /// Role of the message sender.
    pub role: MessageRole,
    /// Content of the message.
    pub content: String,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
    /// Whether a streaming response is still being accumulated into this
    /// message.
    pub is_streaming: bool,
    /// Action affordances attached by the backend.
    #[serde(default)]
    pub actions: Vec<MessageAction>,
    /// Free-form metadata bag (e.g. `can_retry` on error messages).
    #[serde(default)]
    pub metadata: Value,
}

impl Message {
    /// Create a new finalized message.
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            is_streaming: false,
            actions: Vec::new(),
            metadata: Value::Null,
        }
    }

    /// Create a streaming placeholder for an assistant response.
    pub fn streaming_placeholder() -> Self {
        Self {
            id: Uuid::now_v7(),
            role: MessageRole::Assistant,
            content: String::new(),
            timestamp: Utc::now(),
            is_streaming: true,
            actions: Vec::new(),
            metadata: Value::Null,
        }
    }

    /// Read a boolean flag out of the metadata bag.
    pub fn metadata_flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}
