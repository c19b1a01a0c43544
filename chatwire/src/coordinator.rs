//! Engine facade: the single entry point a host embeds.
//!
//! Owns the session store, the fallback orchestrator, and the sanitizer,
//! and surfaces everything that happens as [`ChatEvent`]s on a channel.
//! One engine instance serves one tenant conversation at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ChatConfig, EndpointKind};
use crate::error::ChatError;
use crate::fallback::{ExchangeFailure, FallbackOrchestrator};
use crate::models::{Message, MessageRole, RetryTicket, StreamHandle};
use crate::retry::ErrorKind;
use crate::sanitize::{DefaultSanitizer, InputSanitizer};
use crate::store::{HttpConversationBackend, KvStore, SessionStore};
use crate::transport::{HttpTransport, RequestDescriptor, TransportClient};

/// Everything the engine reports to its host.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A message entered the ledger (user message or assistant placeholder).
    MessageAdded(Message),
    /// A streaming delta arrived for an assistant placeholder.
    Delta { message_id: Uuid, chunk: String },
    /// An assistant message reached its final content.
    MessageFinalized { message_id: Uuid, content: String },
    /// An exchange failed; `can_retry` reflects whether a retry ticket
    /// exists for the message.
    MessageFailed {
        message_id: Uuid,
        error: String,
        can_retry: bool,
    },
    /// The conversation was cleared; a fresh session was minted.
    ConversationCleared { session_id: Uuid },
    /// The assistant started or stopped producing a reply.
    TypingChanged(bool),
}

/// The chat engine. Construct with [`ChatEngine::with_events`], hold it in
/// an `Arc`, and drain the event receiver from the host UI loop.
pub struct ChatEngine<T: HttpTransport> {
    config: ChatConfig,
    store: Arc<SessionStore<HttpConversationBackend<T>>>,
    orchestrator: FallbackOrchestrator<T>,
    sanitizer: Box<dyn InputSanitizer>,
    events: mpsc::Sender<ChatEvent>,
    tickets: Mutex<HashMap<Uuid, RetryTicket>>,
    typing: AtomicBool,
}

impl<T: HttpTransport> ChatEngine<T> {
    /// Build an engine and the event channel the host drains.
    pub fn with_events(
        transport: Arc<T>,
        kv: Arc<dyn KvStore>,
        config: ChatConfig,
    ) -> (Arc<Self>, mpsc::Receiver<ChatEvent>) {
        Self::with_events_and_sanitizer(transport, kv, config, Box::new(DefaultSanitizer::default()))
    }

    /// Like [`ChatEngine::with_events`] with a host-provided sanitizer.
    pub fn with_events_and_sanitizer(
        transport: Arc<T>,
        kv: Arc<dyn KvStore>,
        config: ChatConfig,
        sanitizer: Box<dyn InputSanitizer>,
    ) -> (Arc<Self>, mpsc::Receiver<ChatEvent>) {
        let (events, rx) = mpsc::channel(256);
        let backend = Arc::new(HttpConversationBackend::new(
            Arc::clone(&transport),
            config.endpoint(EndpointKind::Init),
            config.endpoint(EndpointKind::Clear),
        ));
        let store = Arc::new(SessionStore::open(kv, backend, &config));
        let client = TransportClient::new(transport, config.timeouts);
        let orchestrator = FallbackOrchestrator::new(client, &config);

        let engine = Arc::new(Self {
            config,
            store,
            orchestrator,
            sanitizer,
            events,
            tickets: Mutex::new(HashMap::new()),
            typing: AtomicBool::new(false),
        });
        (engine, rx)
    }

    /// Initialize the conversation with the backend. Idempotent and safe
    /// under concurrent invocation.
    pub async fn initialize(&self) -> Result<(), ChatError> {
        self.store.initialize_conversation().await.map(|_| ())
    }

    /// Whether the engine can accept user messages.
    pub async fn is_ready(&self) -> bool {
        self.store.is_initialized().await
    }

    /// Whether an assistant reply is currently being produced.
    pub fn is_typing(&self) -> bool {
        self.typing.load(Ordering::SeqCst)
    }

    /// Current ledger snapshot for rendering.
    pub async fn messages(&self) -> Vec<Message> {
        self.store.messages().await
    }

    /// Sanitize and send a user message, returning the id of the
    /// assistant placeholder the reply will land in. The exchange itself
    /// runs in a background task; progress arrives as events.
    pub async fn send_user_message(self: &Arc<Self>, raw_input: &str) -> Result<Uuid, ChatError> {
        // Resolve the session first: an expired one is purged here, which
        // drops the conversation and must block the send below.
        let session_id = self.store.get_or_create_session().await;
        if !self.store.is_initialized().await {
            warn!("dropping user message, conversation is not initialized");
            return Err(ChatError::Init("conversation is not initialized".into()));
        }
        let sanitized = self.sanitizer.sanitize(raw_input);
        if sanitized.is_empty() {
            return Err(ChatError::Init("message is empty after sanitization".into()));
        }

        // Context is built from messages before this exchange; the new
        // input travels in `user_input`.
        let context = self.store.conversation_context().await;
        let bearer_token = self.store.continuation_token().await;

        let user_message = Message::new(MessageRole::User, sanitized.clone());
        self.store.add_message(user_message.clone()).await;
        self.emit(ChatEvent::MessageAdded(user_message)).await;

        let placeholder = Message::streaming_placeholder();
        let message_id = placeholder.id;
        self.store.add_message(placeholder.clone()).await;
        self.emit(ChatEvent::MessageAdded(placeholder)).await;

        let descriptor = RequestDescriptor {
            message_id,
            body: json!({
                "tenant_id": self.config.tenant_id,
                "user_input": sanitized,
                "session_id": session_id,
                "conversation_id": context.conversation_id,
                "turn": context.turn,
                "conversation_context": context,
            }),
            bearer_token,
            streaming_url: self.config.endpoint(EndpointKind::Streaming).to_string(),
            buffered_url: self.config.endpoint(EndpointKind::Buffered).to_string(),
        };

        self.set_typing(true).await;
        let engine = Arc::clone(self);
        let budget = self.config.retry.max_retries;
        tokio::spawn(async move {
            engine.run_exchange(descriptor, budget).await;
        });
        Ok(message_id)
    }

    /// Manually re-issue a failed exchange using its remaining retry
    /// budget. The budget never resets; a zero budget still allows the
    /// single manual attempt.
    pub async fn retry_message(self: &Arc<Self>, message_id: Uuid) -> Result<(), ChatError> {
        let ticket = self
            .lock_tickets()
            .remove(&message_id)
            .ok_or_else(|| ChatError::Init("no retry ticket for this message".into()))?;

        info!(message_id = %message_id, budget = ticket.remaining_retries, "retrying exchange");
        // Reset the ledger entry back to a live placeholder.
        let mut placeholder = Message::new(MessageRole::Assistant, "");
        placeholder.id = message_id;
        placeholder.is_streaming = true;
        self.store.add_message(placeholder).await;

        self.set_typing(true).await;
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine
                .run_exchange(ticket.descriptor, ticket.remaining_retries)
                .await;
        });
        Ok(())
    }

    /// Connectivity came back: re-issue every exchange that failed on a
    /// network error, once each, on their remaining budgets.
    pub async fn handle_online(self: &Arc<Self>) {
        let network_failures: Vec<Uuid> = self
            .lock_tickets()
            .values()
            .filter(|t| t.classification.kind == ErrorKind::Network)
            .map(|t| t.message_id)
            .collect();

        for message_id in network_failures {
            if let Err(err) = self.retry_message(message_id).await {
                warn!(message_id = %message_id, error = %err, "reconnect retry failed to start");
            }
        }
    }

    /// Cancel the in-flight exchange for a message, if any.
    pub fn cancel_message(&self, message_id: Uuid) -> bool {
        self.orchestrator.cancel(message_id)
    }

    /// Clear the conversation on the server and locally, returning the
    /// fresh session id. In-flight exchanges are cancelled first.
    pub async fn clear_conversation(&self) -> Result<Uuid, ChatError> {
        self.orchestrator.cancel_all();
        self.lock_tickets().clear();
        let session_id = self.store.clear_conversation().await?;
        self.emit(ChatEvent::ConversationCleared { session_id }).await;
        Ok(session_id)
    }

    /// Force pending persistence writes (host teardown path).
    pub async fn flush(&self) {
        self.store.flush().await;
    }

    /// Record the newest message the host UI has rendered as read.
    pub async fn mark_read(&self, message_id: Uuid) {
        self.store.mark_read(message_id).await;
    }

    /// The read-position marker, if one was stored this session.
    pub async fn last_read(&self) -> Option<Uuid> {
        self.store.last_read().await
    }

    /// Diagnostic snapshot. Never includes the continuation token.
    pub async fn debug_state(&self) -> Value {
        let conversation = self.store.conversation().await;
        json!({
            "initialized": conversation.is_some(),
            "conversation_id": conversation.as_ref().map(|c| c.conversation_id.clone()),
            "turn": conversation.as_ref().map_or(0, |c| c.turn),
            "message_count": self.store.messages().await.len(),
            "typing": self.is_typing(),
            "pending_tickets": self.lock_tickets().len(),
        })
    }

    async fn run_exchange(self: Arc<Self>, descriptor: RequestDescriptor, budget: u32) {
        let message_id = descriptor.message_id;

        // Deltas come out of the orchestrator on a sync callback; relay
        // them through a channel so ledger updates stay ordered. The
        // relay owns the stream handle; finalizing it yields whatever
        // text was streamed before the exchange settled.
        let (delta_tx, mut delta_rx) = mpsc::unbounded_channel::<String>();
        let relay = {
            let store = Arc::clone(&self.store);
            let events = self.events.clone();
            tokio::spawn(async move {
                let mut handle = StreamHandle::new(message_id);
                while let Some(chunk) = delta_rx.recv().await {
                    handle.push(&chunk);
                    store.update_streaming(message_id, &handle.accumulated_text).await;
                    let _ = events.send(ChatEvent::Delta { message_id, chunk }).await;
                }
                handle.finalize()
            })
        };

        let result = self
            .orchestrator
            .execute_with_budget(&descriptor, budget, |delta| {
                let _ = delta_tx.send(delta.to_string());
            })
            .await;
        drop(delta_tx);
        let streamed_text = relay.await.unwrap_or_default();

        match result {
            Ok(outcome) => {
                debug!(
                    message_id = %message_id,
                    streamed = outcome.streamed,
                    attempts = outcome.attempts,
                    "exchange completed"
                );
                self.finalize_success(
                    message_id,
                    outcome.full_text,
                    json!({ "streamed": outcome.streamed, "attempts": outcome.attempts }),
                )
                .await;
            }
            Err(failure) => {
                self.finalize_failure(message_id, descriptor, failure, streamed_text)
                    .await;
            }
        }

        self.set_typing(false).await;
    }

    async fn finalize_success(&self, message_id: Uuid, content: String, metadata: Value) {
        self.lock_tickets().remove(&message_id);
        self.store
            .finalize_message(message_id, content.clone(), Vec::new(), metadata)
            .await;
        self.store.complete_turn().await;
        self.emit(ChatEvent::MessageFinalized {
            message_id,
            content,
        })
        .await;
    }

    async fn finalize_failure(
        &self,
        message_id: Uuid,
        descriptor: RequestDescriptor,
        failure: ExchangeFailure,
        streamed_text: String,
    ) {
        // Partial content was already shown; re-issuing would duplicate
        // it, so finalize what the stream handle accumulated and count
        // the turn.
        if failure.partial_text.is_some() {
            warn!(message_id = %message_id, error = %failure.error, "finalizing partial reply");
            self.finalize_success(
                message_id,
                streamed_text,
                json!({ "streamed": true, "degraded": true }),
            )
            .await;
            return;
        }

        if matches!(failure.error, ChatError::Cancelled) {
            self.store
                .finalize_message(
                    message_id,
                    String::new(),
                    Vec::new(),
                    json!({ "cancelled": true }),
                )
                .await;
            self.emit(ChatEvent::MessageFailed {
                message_id,
                error: failure.error.user_message().to_string(),
                can_retry: false,
            })
            .await;
            return;
        }

        warn!(
            message_id = %message_id,
            error = %failure.error,
            attempts = failure.attempts,
            remaining = failure.remaining_retries,
            "exchange failed"
        );
        let user_text = failure.error.user_message().to_string();
        self.store
            .finalize_message(
                message_id,
                user_text.clone(),
                Vec::new(),
                json!({ "error": true, "can_retry": true }),
            )
            .await;
        self.lock_tickets().insert(
            message_id,
            RetryTicket {
                message_id,
                attempt: failure.attempts,
                classification: failure.classification,
                remaining_retries: failure.remaining_retries,
                descriptor,
            },
        );
        self.emit(ChatEvent::MessageFailed {
            message_id,
            error: user_text,
            can_retry: true,
        })
        .await;
    }

    async fn set_typing(&self, typing: bool) {
        if self.typing.swap(typing, Ordering::SeqCst) != typing {
            self.emit(ChatEvent::TypingChanged(typing)).await;
        }
    }

    async fn emit(&self, event: ChatEvent) {
        // A dropped receiver means the host went away; nothing to do.
        let _ = self.events.send(event).await;
    }

    fn lock_tickets(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, RetryTicket>> {
        self.tickets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
