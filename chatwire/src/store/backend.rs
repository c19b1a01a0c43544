//! Conversation backend collaborator: the two server round-trips owned by
//! the store (initialization and server-side clear).

use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ChatError;
use crate::transport::{HttpTransport, TransportRequest};

/// Result of initializing a conversation with the backend.
#[derive(Debug, Clone)]
pub struct InitOutcome {
    /// Backend-assigned conversation identifier.
    pub conversation_id: String,
    /// Continuation token for subsequent requests, if the backend issued
    /// one.
    pub continuation_token: Option<String>,
}

/// Server round-trips the session store depends on.
pub trait ConversationBackend: Send + Sync + 'static {
    /// Obtain a conversation id and continuation token for a new session.
    fn initialize(
        &self,
        tenant_id: &str,
        session_id: Uuid,
    ) -> impl Future<Output = Result<InitOutcome, ChatError>> + Send;

    /// Clear server-side conversation state. Requires the *current*
    /// continuation token, which is why the store clears server state
    /// before purging locally.
    fn clear(
        &self,
        conversation_id: &str,
        continuation_token: Option<&str>,
    ) -> impl Future<Output = Result<(), ChatError>> + Send;
}

/// Production backend over the shared HTTP transport.
#[derive(Debug)]
pub struct HttpConversationBackend<T> {
    transport: Arc<T>,
    init_url: String,
    clear_url: String,
}

impl<T: HttpTransport> HttpConversationBackend<T> {
    /// Create a backend posting to the given endpoints.
    pub fn new(transport: Arc<T>, init_url: impl Into<String>, clear_url: impl Into<String>) -> Self {
        Self {
            transport,
            init_url: init_url.into(),
            clear_url: clear_url.into(),
        }
    }
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(key).and_then(Value::as_str))
        .map(ToString::to_string)
}

impl<T: HttpTransport> ConversationBackend for HttpConversationBackend<T> {
    async fn initialize(
        &self,
        tenant_id: &str,
        session_id: Uuid,
    ) -> Result<InitOutcome, ChatError> {
        let request = TransportRequest {
            url: self.init_url.clone(),
            body: json!({
                "tenant_id": tenant_id,
                "session_id": session_id,
            }),
            bearer_token: None,
        };
        let response = self.transport.fetch(request).await?;
        if !(200..300).contains(&response.status) {
            return Err(ChatError::from_status(response.status));
        }

        let value: Value = serde_json::from_str(&response.body)
            .map_err(|e| ChatError::Decode(format!("invalid init response: {e}")))?;
        let conversation_id = string_field(&value, &["conversation_id", "id"])
            .ok_or_else(|| ChatError::Decode("init response missing conversation id".into()))?;
        let continuation_token = string_field(&value, &["continuation_token", "token"]);

        Ok(InitOutcome {
            conversation_id,
            continuation_token,
        })
    }

    async fn clear(
        &self,
        conversation_id: &str,
        continuation_token: Option<&str>,
    ) -> Result<(), ChatError> {
        let request = TransportRequest {
            url: self.clear_url.clone(),
            body: json!({ "conversation_id": conversation_id }),
            bearer_token: continuation_token.map(ToString::to_string),
        };
        let response = self.transport.fetch(request).await?;
        if !(200..300).contains(&response.status) {
            return Err(ChatError::from_status(response.status));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;

    #[tokio::test]
    async fn initialize_parses_id_and_token() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_buffered_json(
            200,
            json!({ "conversation_id": "conv-9", "continuation_token": "tok-1" }),
        );
        let backend = HttpConversationBackend::new(transport, "http://t/init", "http://t/clear");

        let outcome = backend.initialize("tenant-1", Uuid::now_v7()).await.unwrap();
        assert_eq!(outcome.conversation_id, "conv-9");
        assert_eq!(outcome.continuation_token.as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn initialize_requires_a_conversation_id() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_buffered_json(200, json!({ "token": "t" }));
        let backend = HttpConversationBackend::new(transport, "http://t/init", "http://t/clear");

        let err = backend.initialize("tenant-1", Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, ChatError::Decode(_)));
    }

    #[tokio::test]
    async fn clear_forwards_the_current_token() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_buffered_json(200, json!({}));
        let backend = HttpConversationBackend::new(
            Arc::clone(&transport),
            "http://t/init",
            "http://t/clear",
        );

        backend.clear("conv-9", Some("tok-1")).await.unwrap();
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "http://t/clear");
        assert_eq!(requests[0].bearer_token.as_deref(), Some("tok-1"));
        assert_eq!(requests[0].body["conversation_id"], "conv-9");
    }
}
