//! Scripted collaborators for tests: a transport that replays queued
//! responses and records every request, a counting conversation backend,
//! and a write-counting key-value store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures::{stream, StreamExt};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ChatError;
use crate::store::{InitOutcome, KvStore};
use crate::transport::{BufferedResponse, HttpTransport, StreamResponse, TransportRequest};

/// One scripted streaming response.
pub(crate) struct StreamScript {
    pub status: u16,
    pub content_type: String,
    pub chunks: Vec<Result<Bytes, ChatError>>,
    /// Keep the stream open (never yield, never end) after the chunks.
    pub hang_after: bool,
}

/// A 200 event-stream response delivering the given byte chunks.
pub(crate) fn sse_chunks(chunks: &[&str]) -> StreamScript {
    StreamScript {
        status: 200,
        content_type: "text/event-stream".into(),
        chunks: chunks
            .iter()
            .map(|c| Ok(Bytes::copy_from_slice(c.as_bytes())))
            .collect(),
        hang_after: false,
    }
}

enum Script {
    Buffered(BufferedResponse),
    BufferedError(ChatError),
    Stream(StreamScript),
}

/// Transport that pops scripted responses in order and records requests.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, script: Script) {
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(script);
    }

    fn pop(&self) -> Script {
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| panic!("scripted transport exhausted"))
    }

    pub fn push_stream(&self, content_type: &str, mut script: StreamScript) {
        script.content_type = content_type.to_string();
        self.push(Script::Stream(script));
    }

    pub fn push_stream_script(&self, script: StreamScript) {
        self.push(Script::Stream(script));
    }

    /// A stream that connects successfully but never yields a byte.
    pub fn push_silent_stream(&self, content_type: &str) {
        let mut script = sse_chunks(&[]);
        script.content_type = content_type.to_string();
        script.hang_after = true;
        self.push(Script::Stream(script));
    }

    pub fn push_stream_status(&self, status: u16) {
        let mut script = sse_chunks(&[]);
        script.status = status;
        self.push(Script::Stream(script));
    }

    pub fn push_buffered_json(&self, status: u16, body: Value) {
        self.push(Script::Buffered(BufferedResponse {
            status,
            content_type: Some("application/json".into()),
            body: body.to_string(),
        }));
    }

    /// Fail the next buffered request with a transport-level error.
    pub fn push_buffered_error(&self, error: ChatError) {
        self.push(Script::BufferedError(error));
    }

    pub fn push_buffered_raw(&self, status: u16, content_type: &str, body: &str) {
        self.push(Script::Buffered(BufferedResponse {
            status,
            content_type: Some(content_type.to_string()),
            body: body.to_string(),
        }));
    }

    /// Every request issued so far, in order.
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn record(&self, request: &TransportRequest) {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request.clone());
    }
}

impl HttpTransport for ScriptedTransport {
    async fn fetch(&self, request: TransportRequest) -> Result<BufferedResponse, ChatError> {
        self.record(&request);
        match self.pop() {
            Script::Buffered(response) => Ok(response),
            Script::BufferedError(error) => Err(error),
            Script::Stream(_) => panic!("scripted a stream but fetch was called"),
        }
    }

    async fn stream(&self, request: TransportRequest) -> Result<StreamResponse, ChatError> {
        self.record(&request);
        match self.pop() {
            Script::Stream(script) => {
                let chunks = stream::iter(script.chunks);
                let body = if script.hang_after {
                    chunks.chain(stream::pending()).boxed()
                } else {
                    chunks.boxed()
                };
                Ok(StreamResponse {
                    status: script.status,
                    content_type: Some(script.content_type),
                    stream: body,
                })
            }
            Script::Buffered(_) | Script::BufferedError(_) => {
                panic!("scripted a buffered response but stream was called")
            }
        }
    }
}

/// Conversation backend that counts calls and can fail on demand.
#[derive(Default)]
pub(crate) struct CountingBackend {
    pub init_calls: AtomicUsize,
    init_delay: Option<Duration>,
    next_init_error: Mutex<Option<ChatError>>,
    clear_calls: Mutex<Vec<(String, Option<String>)>>,
}

impl CountingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold each initialization open for `delay`, widening the window in
    /// which concurrent callers can pile up.
    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = Some(delay);
        self
    }

    pub fn fail_next_init(&self, error: ChatError) {
        *self
            .next_init_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(error);
    }

    pub fn clear_calls(&self) -> Vec<(String, Option<String>)> {
        self.clear_calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl crate::store::ConversationBackend for CountingBackend {
    async fn initialize(
        &self,
        _tenant_id: &str,
        _session_id: Uuid,
    ) -> Result<InitOutcome, ChatError> {
        let call = self.init_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.init_delay {
            tokio::time::sleep(delay).await;
        }
        let scripted_error = self
            .next_init_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(error) = scripted_error {
            return Err(error);
        }
        Ok(InitOutcome {
            conversation_id: format!("conv-{call}"),
            continuation_token: Some("tok-1".into()),
        })
    }

    async fn clear(
        &self,
        conversation_id: &str,
        continuation_token: Option<&str>,
    ) -> Result<(), ChatError> {
        self.clear_calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((
                conversation_id.to_string(),
                continuation_token.map(ToString::to_string),
            ));
        Ok(())
    }
}

/// In-memory key-value store that counts `set` calls, for asserting on
/// write coalescing.
#[derive(Default)]
pub(crate) struct CountingKv {
    entries: Mutex<std::collections::HashMap<String, String>>,
    sets: AtomicUsize,
}

impl CountingKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_count(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }
}

impl KvStore for CountingKv {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
    }
}
