//! Transport client: drives the decoder over response bytes, applies the
//! watchdog timers, and keeps the per-message cancellation registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::http::{HttpTransport, RequestDescriptor, TransportRequest};
use crate::config::Timeouts;
use crate::decode::{decode_body, DecodeEvent, StreamDecoder};
use crate::error::ChatError;

/// Event emitted while one request is in flight.
///
/// `Chunk` events fire strictly in arrival order; exactly one terminal
/// event (`Done` or `Failed`) follows the last chunk.
#[derive(Debug)]
pub enum TransportEvent {
    /// A content delta arrived.
    Chunk(String),
    /// The exchange finished; carries the full accumulated text.
    Done { full_text: String },
    /// The exchange failed before completing.
    Failed(ChatError),
}

/// A live registration in the cancel registry.
///
/// Carries the generation its entry was registered under, so a task that
/// finishes late can never drop a newer registration for the same
/// message id (the streaming task and its buffered fallback overlap on
/// one id).
#[derive(Debug)]
pub struct Registration {
    /// Token the registered request selects on.
    pub token: CancellationToken,
    message_id: Uuid,
    generation: u64,
}

#[derive(Debug)]
struct Entry {
    generation: u64,
    token: CancellationToken,
}

/// Cancellation tokens for in-flight requests, keyed by message id.
///
/// Registering a message id a second time cancels the previous token, so
/// the same logical request can never be in flight twice.
#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<Mutex<HashMap<Uuid, Entry>>>,
    generations: Arc<AtomicU64>,
}

impl CancelRegistry {
    /// Register a fresh token for `message_id`, cancelling any previous one.
    pub fn register(&self, message_id: Uuid) -> Registration {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let mut map = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(previous) = map.insert(
            message_id,
            Entry {
                generation,
                token: token.clone(),
            },
        ) {
            previous.token.cancel();
        }
        Registration {
            token,
            message_id,
            generation,
        }
    }

    /// Drop the entry for a finished request, unless a newer registration
    /// has already replaced it.
    pub fn deregister(&self, registration: &Registration) {
        let mut map = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let current = map
            .get(&registration.message_id)
            .is_some_and(|entry| entry.generation == registration.generation);
        if current {
            map.remove(&registration.message_id);
        }
    }

    /// Cancel the in-flight request for `message_id`, if any.
    pub fn cancel(&self, message_id: Uuid) -> bool {
        let mut map = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.remove(&message_id).map(|e| e.token.cancel()).is_some()
    }

    /// Cancel every outstanding request (teardown path).
    pub fn cancel_all(&self) {
        let mut map = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for (_, entry) in map.drain() {
            entry.token.cancel();
        }
    }

    /// Number of currently registered tokens.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether no request is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Issues buffered and streaming requests over a pluggable transport.
#[derive(Debug)]
pub struct TransportClient<T> {
    transport: Arc<T>,
    timeouts: Timeouts,
    cancels: CancelRegistry,
}

impl<T> Clone for TransportClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            timeouts: self.timeouts,
            cancels: self.cancels.clone(),
        }
    }
}

impl<T: HttpTransport> TransportClient<T> {
    /// Create a client over `transport` with the given timing knobs.
    pub fn new(transport: Arc<T>, timeouts: Timeouts) -> Self {
        Self {
            transport,
            timeouts,
            cancels: CancelRegistry::default(),
        }
    }

    /// The shared cancellation registry.
    pub fn cancels(&self) -> &CancelRegistry {
        &self.cancels
    }

    /// Issue the buffered request for `descriptor` and decode its body.
    ///
    /// A non-2xx status or an undecodable body is an error; partially
    /// parsed data is never returned as success.
    pub async fn send_buffered(&self, descriptor: &RequestDescriptor) -> Result<String, ChatError> {
        let registration = self.cancels.register(descriptor.message_id);
        let request = descriptor.buffered_request();
        debug!(url = %request.url, "sending buffered request");

        let outcome = tokio::select! {
            () = registration.token.cancelled() => Err(ChatError::Cancelled),
            () = sleep(self.timeouts.request) => {
                Err(ChatError::Timeout("buffered request deadline exceeded".into()))
            }
            response = self.transport.fetch(request) => response,
        };
        self.cancels.deregister(&registration);

        let response = outcome?;
        if !(200..300).contains(&response.status) {
            return Err(ChatError::from_status(response.status));
        }

        let events = decode_body(response.content_type.as_deref(), &response.body)?;
        Ok(final_text(events))
    }

    /// Open the streaming request for `descriptor`.
    ///
    /// Events arrive on the returned channel: zero or more `Chunk`s in
    /// arrival order, then exactly one `Done` or `Failed`. The first-chunk
    /// watchdog aborts a silent stream; the total-duration watchdog aborts
    /// a long one but still delivers the accumulated text via `Done`.
    pub fn send_streaming(&self, descriptor: &RequestDescriptor) -> mpsc::Receiver<TransportEvent> {
        let (tx, rx) = mpsc::channel(64);
        let registration = self.cancels.register(descriptor.message_id);
        let transport = Arc::clone(&self.transport);
        let request = descriptor.streaming_request();
        let timeouts = self.timeouts;
        let cancels = self.cancels.clone();

        tokio::spawn(async move {
            run_stream(transport, request, timeouts, registration.token.clone(), tx).await;
            cancels.deregister(&registration);
        });

        rx
    }
}

/// Whether a response content type is decoded line-by-line as it streams.
/// JSON bodies (including gateway-wrapped SSE) are buffered and decoded
/// whole at end of stream instead.
fn is_line_based(content_type: Option<&str>) -> bool {
    content_type.map_or(true, |ct| {
        let ct = ct.to_ascii_lowercase();
        ct.contains("text/event-stream") || ct.contains("ndjson") || !ct.contains("json")
    })
}

fn final_text(events: Vec<DecodeEvent>) -> String {
    events
        .into_iter()
        .find_map(|event| match event {
            DecodeEvent::Done(text) => Some(text),
            DecodeEvent::Delta(_) => None,
        })
        .unwrap_or_default()
}

async fn run_stream<T: HttpTransport>(
    transport: Arc<T>,
    request: TransportRequest,
    timeouts: Timeouts,
    token: CancellationToken,
    tx: mpsc::Sender<TransportEvent>,
) {
    debug!(url = %request.url, "opening streaming request");
    let connected = tokio::select! {
        () = token.cancelled() => {
            let _ = tx.send(TransportEvent::Failed(ChatError::Cancelled)).await;
            return;
        }
        response = transport.stream(request) => response,
    };

    let response = match connected {
        Ok(response) => response,
        Err(err) => {
            let _ = tx.send(TransportEvent::Failed(err)).await;
            return;
        }
    };
    if !(200..300).contains(&response.status) {
        let _ = tx
            .send(TransportEvent::Failed(ChatError::from_status(response.status)))
            .await;
        return;
    }

    let content_type = response.content_type.clone();
    let line_based = is_line_based(content_type.as_deref());
    let first_deadline = Instant::now() + timeouts.first_chunk;
    let total_deadline = Instant::now() + timeouts.total_stream;

    let mut decoder = StreamDecoder::new();
    let mut raw = String::new();
    let mut received = false;
    let mut stream = response.stream;

    loop {
        let deadline = if received {
            total_deadline
        } else {
            first_deadline.min(total_deadline)
        };

        tokio::select! {
            () = token.cancelled() => {
                let _ = tx.send(TransportEvent::Failed(ChatError::Cancelled)).await;
                return;
            }
            () = sleep_until(deadline) => {
                if received {
                    // Total-duration watchdog: abort the connection but keep
                    // everything already streamed.
                    warn!("total-duration watchdog fired, finalizing partial stream");
                    let full_text = if line_based {
                        let _ = decoder.finish();
                        decoder.accumulated().to_string()
                    } else {
                        decode_body(content_type.as_deref(), &raw)
                            .map(final_text)
                            .unwrap_or_default()
                    };
                    let _ = tx.send(TransportEvent::Done { full_text }).await;
                } else {
                    let _ = tx
                        .send(TransportEvent::Failed(ChatError::Timeout(
                            "no bytes before first-chunk watchdog".into(),
                        )))
                        .await;
                }
                return;
            }
            next = stream.next() => match next {
                Some(Ok(bytes)) => {
                    if !bytes.is_empty() {
                        received = true;
                    }
                    let chunk = String::from_utf8_lossy(&bytes);
                    if line_based {
                        for event in decoder.feed(&chunk) {
                            match event {
                                DecodeEvent::Delta(delta) => {
                                    if tx.send(TransportEvent::Chunk(delta)).await.is_err() {
                                        return;
                                    }
                                }
                                DecodeEvent::Done(full_text) => {
                                    let _ = tx.send(TransportEvent::Done { full_text }).await;
                                    return;
                                }
                            }
                        }
                    } else {
                        raw.push_str(&chunk);
                    }
                }
                Some(Err(err)) => {
                    let _ = tx.send(TransportEvent::Failed(err)).await;
                    return;
                }
                None => {
                    if line_based {
                        for event in decoder.finish() {
                            match event {
                                DecodeEvent::Delta(delta) => {
                                    if tx.send(TransportEvent::Chunk(delta)).await.is_err() {
                                        return;
                                    }
                                }
                                DecodeEvent::Done(full_text) => {
                                    let _ = tx.send(TransportEvent::Done { full_text }).await;
                                }
                            }
                        }
                    } else {
                        match decode_body(content_type.as_deref(), &raw) {
                            Ok(events) => {
                                let full_text = final_text(events);
                                if !full_text.is_empty() {
                                    if tx
                                        .send(TransportEvent::Chunk(full_text.clone()))
                                        .await
                                        .is_err()
                                    {
                                        return;
                                    }
                                }
                                let _ = tx.send(TransportEvent::Done { full_text }).await;
                            }
                            Err(err) => {
                                let _ = tx.send(TransportEvent::Failed(err)).await;
                            }
                        }
                    }
                    return;
                }
            }
        }
    }
}
