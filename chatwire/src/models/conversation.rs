//! Conversation model: backend-side conversation state bound to a session.

use serde::{Deserialize, Serialize};

/// Backend conversation state, bound 1:1 to a session once initialized.
///
/// The continuation token is an opaque bearer credential. It is redacted
/// from `Debug` output and must never be written to logs; it lives only in
/// the session-scoped store and is cleared on purge.
#[derive(Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Backend-assigned conversation identifier.
    pub conversation_id: String,
    /// Tenant this conversation belongs to.
    pub tenant_id: String,
    /// Completed user/assistant exchanges so far.
    pub turn: u32,
    /// Opaque credential authorizing continuation of this conversation.
    pub continuation_token: Option<String>,
    /// Number of messages exchanged.
    pub message_count: u32,
    /// Whether the backend has summarized earlier turns.
    pub has_been_summarized: bool,
    /// The most recent backend-provided summary, if any.
    #[serde(default)]
    pub last_summary: Option<String>,
}

impl Conversation {
    /// Create a freshly initialized conversation bound to `session_id`'s
    /// tenant.
    pub fn new(
        conversation_id: impl Into<String>,
        tenant_id: impl Into<String>,
        continuation_token: Option<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            tenant_id: tenant_id.into(),
            turn: 0,
            continuation_token,
            message_count: 0,
            has_been_summarized: false,
            last_summary: None,
        }
    }

    /// Record a backend-provided summary of earlier turns.
    pub fn record_summary(&mut self, summary: impl Into<String>) {
        self.last_summary = Some(summary.into());
        self.has_been_summarized = true;
    }

    /// The continuation token, filtered for usability.
    ///
    /// Backends occasionally echo the literal strings `"undefined"` or
    /// `"null"` where a token should be; those are treated as absent.
    pub fn usable_token(&self) -> Option<&str> {
        self.continuation_token
            .as_deref()
            .filter(|t| !t.is_empty() && *t != "undefined" && *t != "null")
    }
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("conversation_id", &self.conversation_id)
            .field("tenant_id", &self.tenant_id)
            .field("turn", &self.turn)
            .field(
                "continuation_token",
                &self.continuation_token.as_ref().map(|_| "<redacted>"),
            )
            .field("message_count", &self.message_count)
            .field("has_been_summarized", &self.has_been_summarized)
            .field("last_summary", &self.last_summary)
            .finish()
    }
}
