//! Session & conversation store: the single source of truth for the
//! ledger, the turn counter, and the continuation token.
//!
//! Other components never mutate session-scoped persisted state directly;
//! they go through this store. Persistence writes are debounced so a burst
//! of streaming updates coalesces into one write, with `flush` covering
//! teardown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::backend::ConversationBackend;
use super::kv::KvStore;
use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::models::{Conversation, Message, MessageAction, Session};

const KEY_SESSION: &str = "chatwire.session";
const KEY_CONVERSATION: &str = "chatwire.conversation";
const KEY_LEDGER: &str = "chatwire.ledger";
const KEY_READ_MARKER: &str = "chatwire.read_marker";

/// One entry of the bounded context window sent to the backend.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
}

/// Bounded view of the conversation for outbound request payloads.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationContext {
    pub conversation_id: Option<String>,
    pub turn: u32,
    pub recent_messages: Vec<ContextMessage>,
    pub last_summary: Option<String>,
}

#[derive(Debug)]
struct LedgerState {
    session: Session,
    conversation: Option<Conversation>,
    messages: Vec<Message>,
}

/// Durable conversation state scoped to one session.
pub struct SessionStore<B> {
    kv: Arc<dyn KvStore>,
    backend: Arc<B>,
    tenant_id: String,
    session_timeout: Duration,
    debounce: Duration,
    context_window: usize,
    state: Arc<RwLock<LedgerState>>,
    init_lock: AsyncMutex<()>,
    pending_persist: Mutex<Option<JoinHandle<()>>>,
}

fn store_json<T: Serialize>(kv: &dyn KvStore, key: &str, value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => kv.set(key, &json),
        Err(err) => warn!(key, error = %err, "failed to serialize state for persistence"),
    }
}

fn load_json<T: serde::de::DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Option<T> {
    kv.get(key).and_then(|raw| serde_json::from_str(&raw).ok())
}

fn purge_keys(kv: &dyn KvStore) {
    for key in [KEY_SESSION, KEY_CONVERSATION, KEY_LEDGER, KEY_READ_MARKER] {
        kv.remove(key);
    }
}

impl<B: ConversationBackend> SessionStore<B> {
    /// Open the store, resuming a persisted session when it is still
    /// within its inactivity window and purging it otherwise.
    pub fn open(kv: Arc<dyn KvStore>, backend: Arc<B>, config: &ChatConfig) -> Self {
        let persisted: Option<Session> = load_json(&*kv, KEY_SESSION);
        let state = match persisted {
            Some(session) if !session.is_expired_at(Utc::now()) => LedgerState {
                conversation: load_json(&*kv, KEY_CONVERSATION),
                messages: load_json(&*kv, KEY_LEDGER).unwrap_or_default(),
                session,
            },
            stale => {
                if stale.is_some() {
                    debug!("persisted session expired, purging");
                }
                purge_keys(&*kv);
                let session = Session::new(config.session_timeout);
                store_json(&*kv, KEY_SESSION, &session);
                LedgerState {
                    session,
                    conversation: None,
                    messages: Vec::new(),
                }
            }
        };

        Self {
            kv,
            backend,
            tenant_id: config.tenant_id.clone(),
            session_timeout: config.session_timeout,
            debounce: config.persist_debounce,
            context_window: config.context_window,
            state: Arc::new(RwLock::new(state)),
            init_lock: AsyncMutex::new(()),
            pending_persist: Mutex::new(None),
        }
    }

    /// Return the active session id, extending its activity window. If it
    /// has expired, the ledger, token, and markers are purged and a fresh
    /// session is minted first.
    pub async fn get_or_create_session(&self) -> Uuid {
        let mut state = self.state.write().await;
        if state.session.is_expired_at(Utc::now()) {
            warn!("session expired, purging ledger and minting a new one");
            self.abort_pending_persist();
            purge_keys(&*self.kv);
            *state = LedgerState {
                session: Session::new(self.session_timeout),
                conversation: None,
                messages: Vec::new(),
            };
        } else {
            state.session.touch();
        }
        store_json(&*self.kv, KEY_SESSION, &state.session);
        state.session.session_id
    }

    /// Initialize the conversation with the backend exactly once.
    ///
    /// Safe under concurrent invocation: the init lock makes the first
    /// caller perform the round-trip while every concurrent caller waits
    /// and then observes the same conversation. The lock guard is released
    /// on success and failure alike.
    pub async fn initialize_conversation(&self) -> Result<Conversation, ChatError> {
        let _guard = self.init_lock.lock().await;

        if let Some(existing) = self.state.read().await.conversation.clone() {
            return Ok(existing);
        }

        let session_id = self.get_or_create_session().await;
        let outcome = self
            .backend
            .initialize(&self.tenant_id, session_id)
            .await
            .map_err(|err| ChatError::Init(err.to_string()))?;

        let conversation = Conversation::new(
            outcome.conversation_id,
            self.tenant_id.clone(),
            outcome.continuation_token,
        );

        let mut state = self.state.write().await;
        state.conversation = Some(conversation.clone());
        store_json(&*self.kv, KEY_CONVERSATION, &conversation);
        debug!(conversation_id = %conversation.conversation_id, "conversation initialized");
        Ok(conversation)
    }

    /// Whether a conversation has been initialized for this session.
    pub async fn is_initialized(&self) -> bool {
        self.state.read().await.conversation.is_some()
    }

    /// Whether the ledger holds any messages. Queryable replacement for
    /// an ambient "conversation has messages" flag.
    pub async fn has_messages(&self) -> bool {
        !self.state.read().await.messages.is_empty()
    }

    /// Snapshot of the current ledger.
    pub async fn messages(&self) -> Vec<Message> {
        self.state.read().await.messages.clone()
    }

    /// Current conversation state, if initialized.
    pub async fn conversation(&self) -> Option<Conversation> {
        self.state.read().await.conversation.clone()
    }

    /// Append a message, or replace the ledger entry with the same id.
    /// Schedules a debounced persistence write.
    pub async fn add_message(&self, message: Message) -> bool {
        {
            let mut state = self.state.write().await;
            state.session.touch();
            match state.messages.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => *existing = message,
                None => state.messages.push(message),
            }
        }
        self.schedule_persist();
        true
    }

    /// Update the content of a live streaming placeholder.
    pub async fn update_streaming(&self, message_id: Uuid, content: &str) {
        {
            let mut state = self.state.write().await;
            if let Some(msg) = state
                .messages
                .iter_mut()
                .find(|m| m.id == message_id && m.is_streaming)
            {
                msg.content = content.to_string();
            }
        }
        self.schedule_persist();
    }

    /// Finalize a streaming placeholder in place: set its final content,
    /// actions, and metadata, and flip `is_streaming` off. This is the
    /// only path that clears the flag.
    pub async fn finalize_message(
        &self,
        message_id: Uuid,
        content: String,
        actions: Vec<MessageAction>,
        metadata: serde_json::Value,
    ) -> bool {
        let updated = {
            let mut state = self.state.write().await;
            state
                .messages
                .iter_mut()
                .find(|m| m.id == message_id)
                .map(|msg| {
                    msg.content = content;
                    msg.actions = actions;
                    msg.metadata = metadata;
                    msg.is_streaming = false;
                })
                .is_some()
        };
        if updated {
            self.schedule_persist();
        }
        updated
    }

    /// Record one completed user/assistant exchange.
    ///
    /// Called exactly once per successful exchange, never on retries of
    /// the same logical request and never on the fallback re-issue.
    pub async fn complete_turn(&self) {
        let mut state = self.state.write().await;
        let message_count = u32::try_from(state.messages.len()).unwrap_or(u32::MAX);
        if let Some(conversation) = state.conversation.as_mut() {
            conversation.turn += 1;
            conversation.message_count = message_count;
            store_json(&*self.kv, KEY_CONVERSATION, conversation);
        }
    }

    /// Record a backend-provided summary of earlier turns.
    pub async fn record_summary(&self, summary: &str) {
        let mut state = self.state.write().await;
        if let Some(conversation) = state.conversation.as_mut() {
            conversation.record_summary(summary);
            store_json(&*self.kv, KEY_CONVERSATION, conversation);
        }
    }

    /// Bounded window of recent conversation state for outbound payloads.
    pub async fn conversation_context(&self) -> ConversationContext {
        let state = self.state.read().await;
        let skip = state.messages.len().saturating_sub(self.context_window);
        ConversationContext {
            conversation_id: state
                .conversation
                .as_ref()
                .map(|c| c.conversation_id.clone()),
            turn: state.conversation.as_ref().map_or(0, |c| c.turn),
            recent_messages: state.messages[skip..]
                .iter()
                .map(|m| ContextMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            last_summary: state
                .conversation
                .as_ref()
                .and_then(|c| c.last_summary.clone()),
        }
    }

    /// The continuation token, filtered for usability.
    pub async fn continuation_token(&self) -> Option<String> {
        self.state
            .read()
            .await
            .conversation
            .as_ref()
            .and_then(|c| c.usable_token().map(ToString::to_string))
    }

    /// Mark the latest message the host UI has shown to the user.
    pub async fn mark_read(&self, message_id: Uuid) {
        self.kv.set(KEY_READ_MARKER, &message_id.to_string());
    }

    /// The read-position marker, if one was stored this session.
    pub async fn last_read(&self) -> Option<Uuid> {
        self.kv
            .get(KEY_READ_MARKER)
            .and_then(|raw| raw.parse().ok())
    }

    /// Clear the conversation: server-side state first (it needs the
    /// current token), then the local ledger and token, then a fresh
    /// session id.
    pub async fn clear_conversation(&self) -> Result<Uuid, ChatError> {
        let current = self.state.read().await.conversation.clone();
        if let Some(conversation) = current {
            self.backend
                .clear(
                    &conversation.conversation_id,
                    conversation.usable_token(),
                )
                .await?;
        }

        self.abort_pending_persist();
        let mut state = self.state.write().await;
        purge_keys(&*self.kv);
        *state = LedgerState {
            session: Session::new(self.session_timeout),
            conversation: None,
            messages: Vec::new(),
        };
        store_json(&*self.kv, KEY_SESSION, &state.session);
        Ok(state.session.session_id)
    }

    /// Force the pending debounced write to happen now (teardown path).
    pub async fn flush(&self) {
        self.abort_pending_persist();
        let state = self.state.read().await;
        store_json(&*self.kv, KEY_LEDGER, &state.messages);
        if let Some(conversation) = &state.conversation {
            store_json(&*self.kv, KEY_CONVERSATION, conversation);
        }
        store_json(&*self.kv, KEY_SESSION, &state.session);
    }

    fn abort_pending_persist(&self) {
        let mut pending = self
            .pending_persist
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(handle) = pending.take() {
            handle.abort();
        }
    }

    /// Schedule a coalescing persistence write: a newly scheduled write
    /// supersedes the pending one rather than interleaving with it.
    fn schedule_persist(&self) {
        let kv = Arc::clone(&self.kv);
        let state = Arc::clone(&self.state);
        let debounce = self.debounce;

        let mut pending = self
            .pending_persist
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let state = state.read().await;
            store_json(&*kv, KEY_LEDGER, &state.messages);
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageRole;
    use crate::testing::CountingBackend;
    use chrono::Duration as ChronoDuration;
    use futures::future::join_all;
    use std::sync::atomic::Ordering;

    fn config() -> ChatConfig {
        ChatConfig::new("tenant-1", "http://test")
    }

    fn open_store(kv: Arc<dyn KvStore>, backend: Arc<CountingBackend>) -> SessionStore<CountingBackend> {
        SessionStore::open(kv, backend, &config())
    }

    #[tokio::test]
    async fn ledger_survives_a_reload() {
        let kv: Arc<dyn KvStore> = Arc::new(super::super::kv::MemoryStore::new());
        let backend = Arc::new(CountingBackend::new());

        let store = open_store(Arc::clone(&kv), Arc::clone(&backend));
        let first_id = store.get_or_create_session().await;
        store.initialize_conversation().await.unwrap();
        store
            .add_message(Message::new(MessageRole::User, "hello"))
            .await;
        store.flush().await;
        drop(store);

        let reopened = open_store(kv, backend);
        assert_eq!(reopened.get_or_create_session().await, first_id);
        assert!(reopened.is_initialized().await);
        let messages = reopened.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
    }

    #[tokio::test]
    async fn expired_session_is_purged_before_reuse() {
        let kv: Arc<dyn KvStore> = Arc::new(super::super::kv::MemoryStore::new());
        let backend = Arc::new(CountingBackend::new());

        // Persist a session whose last activity was 31 minutes ago.
        let mut stale = Session::new(Duration::from_secs(30 * 60));
        stale.last_activity_at = Utc::now() - ChronoDuration::minutes(31);
        let stale_id = stale.session_id;
        kv.set(KEY_SESSION, &serde_json::to_string(&stale).unwrap());
        kv.set(KEY_LEDGER, "[]");
        kv.set(KEY_READ_MARKER, "junk");

        let store = open_store(Arc::clone(&kv), backend);
        let fresh_id = store.get_or_create_session().await;
        assert_ne!(fresh_id, stale_id);
        assert!(!store.is_initialized().await);
        assert!(!store.has_messages().await);
        assert_eq!(kv.get(KEY_READ_MARKER), None);
        assert_eq!(kv.get(KEY_LEDGER), None);
    }

    #[tokio::test]
    async fn concurrent_initialization_is_single_flight() {
        let kv: Arc<dyn KvStore> = Arc::new(super::super::kv::MemoryStore::new());
        let backend = Arc::new(CountingBackend::new().with_init_delay(Duration::from_millis(50)));
        let store = open_store(kv, Arc::clone(&backend));

        let attempts = (0..8).map(|_| store.initialize_conversation());
        let results = join_all(attempts).await;

        assert_eq!(backend.init_calls.load(Ordering::SeqCst), 1);
        let first = results[0].as_ref().unwrap().conversation_id.clone();
        for result in &results {
            assert_eq!(result.as_ref().unwrap().conversation_id, first);
        }
    }

    #[tokio::test]
    async fn failed_initialization_releases_the_lock() {
        let kv: Arc<dyn KvStore> = Arc::new(super::super::kv::MemoryStore::new());
        let backend = Arc::new(CountingBackend::new());
        backend.fail_next_init(ChatError::Network("down".into()));
        let store = open_store(kv, Arc::clone(&backend));

        let err = store.initialize_conversation().await.unwrap_err();
        assert!(matches!(err, ChatError::Init(_)));
        assert!(!store.is_initialized().await);

        // Second attempt goes through: the lock was not leaked.
        store.initialize_conversation().await.unwrap();
        assert_eq!(backend.init_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_is_debounced_and_coalesced() {
        let memory = Arc::new(crate::testing::CountingKv::new());
        let kv: Arc<dyn KvStore> = Arc::clone(&memory) as Arc<dyn KvStore>;
        let backend = Arc::new(CountingBackend::new());
        let store = open_store(kv, backend);
        let baseline = memory.set_count();

        store
            .add_message(Message::new(MessageRole::User, "a"))
            .await;
        store
            .add_message(Message::new(MessageRole::User, "b"))
            .await;
        // Inside the coalescing window nothing has been written yet.
        assert_eq!(memory.set_count(), baseline);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(memory.set_count(), baseline + 1);
        let stored = memory.get(KEY_LEDGER).unwrap();
        assert!(stored.contains("\"a\"") && stored.contains("\"b\""));
    }

    #[tokio::test]
    async fn flush_writes_immediately() {
        let memory = Arc::new(crate::testing::CountingKv::new());
        let kv: Arc<dyn KvStore> = Arc::clone(&memory) as Arc<dyn KvStore>;
        let backend = Arc::new(CountingBackend::new());
        let store = open_store(kv, backend);

        store
            .add_message(Message::new(MessageRole::User, "bye"))
            .await;
        store.flush().await;
        assert!(memory.get(KEY_LEDGER).unwrap().contains("bye"));
    }

    #[tokio::test]
    async fn context_window_is_bounded() {
        let kv: Arc<dyn KvStore> = Arc::new(super::super::kv::MemoryStore::new());
        let backend = Arc::new(CountingBackend::new());
        let store = open_store(kv, backend);
        store.initialize_conversation().await.unwrap();

        for i in 0..15 {
            store
                .add_message(Message::new(MessageRole::User, format!("m{i}")))
                .await;
        }

        let context = store.conversation_context().await;
        assert_eq!(context.recent_messages.len(), 10);
        assert_eq!(context.recent_messages[0].content, "m5");
        assert_eq!(context.recent_messages[9].content, "m14");
    }

    #[tokio::test]
    async fn clear_hits_the_server_with_the_current_token_first() {
        let kv: Arc<dyn KvStore> = Arc::new(super::super::kv::MemoryStore::new());
        let backend = Arc::new(CountingBackend::new());
        let store = open_store(kv, Arc::clone(&backend));

        let old_session = store.get_or_create_session().await;
        let conversation = store.initialize_conversation().await.unwrap();
        store
            .add_message(Message::new(MessageRole::User, "x"))
            .await;

        let new_session = store.clear_conversation().await.unwrap();
        assert_ne!(new_session, old_session);
        assert!(!store.is_initialized().await);
        assert!(!store.has_messages().await);

        let clears = backend.clear_calls();
        assert_eq!(clears.len(), 1);
        assert_eq!(clears[0].0, conversation.conversation_id);
        assert_eq!(
            clears[0].1.as_deref(),
            conversation.usable_token(),
            "server-side clear must carry the token that was current"
        );
    }

    #[tokio::test]
    async fn summaries_flow_into_the_context() {
        let kv: Arc<dyn KvStore> = Arc::new(super::super::kv::MemoryStore::new());
        let backend = Arc::new(CountingBackend::new());
        let store = open_store(kv, backend);
        store.initialize_conversation().await.unwrap();

        assert_eq!(store.conversation_context().await.last_summary, None);
        store.record_summary("earlier turns condensed").await;

        let conversation = store.conversation().await.unwrap();
        assert!(conversation.has_been_summarized);
        assert_eq!(
            store.conversation_context().await.last_summary.as_deref(),
            Some("earlier turns condensed")
        );
    }

    #[tokio::test]
    async fn turn_increments_only_on_complete_turn() {
        let kv: Arc<dyn KvStore> = Arc::new(super::super::kv::MemoryStore::new());
        let backend = Arc::new(CountingBackend::new());
        let store = open_store(kv, backend);
        store.initialize_conversation().await.unwrap();

        store
            .add_message(Message::new(MessageRole::User, "q"))
            .await;
        store
            .add_message(Message::new(MessageRole::Assistant, "a"))
            .await;
        assert_eq!(store.conversation().await.unwrap().turn, 0);

        store.complete_turn().await;
        let conversation = store.conversation().await.unwrap();
        assert_eq!(conversation.turn, 1);
        assert_eq!(conversation.message_count, 2);
    }

    #[tokio::test]
    async fn finalize_is_the_only_path_off_streaming() {
        let kv: Arc<dyn KvStore> = Arc::new(super::super::kv::MemoryStore::new());
        let backend = Arc::new(CountingBackend::new());
        let store = open_store(kv, backend);

        let placeholder = Message::streaming_placeholder();
        let id = placeholder.id;
        store.add_message(placeholder).await;

        store.update_streaming(id, "partial").await;
        let messages = store.messages().await;
        assert!(messages[0].is_streaming);
        assert_eq!(messages[0].content, "partial");

        assert!(
            store
                .finalize_message(id, "final".into(), Vec::new(), serde_json::Value::Null)
                .await
        );
        let messages = store.messages().await;
        assert!(!messages[0].is_streaming);
        assert_eq!(messages[0].content, "final");

        // Further streaming updates are ignored once finalized.
        store.update_streaming(id, "late").await;
        assert_eq!(store.messages().await[0].content, "final");
    }
}
