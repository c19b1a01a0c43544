//! Streaming-to-buffered fallback with bounded retry.
//!
//! One logical exchange is tried over the streaming endpoint first. If the
//! stream fails before delivering any content, the same payload is replayed
//! against the buffered endpoint, with exponential backoff between retryable
//! failures. A stream that fails after partial content is surfaced as a
//! partial failure instead, so the caller can finalize what was shown
//! rather than re-issue the request and duplicate it.

use tracing::{debug, warn};

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::retry::{classify, ErrorClass, RetryPolicy};
use crate::transport::{HttpTransport, RequestDescriptor, TransportClient, TransportEvent};

/// A completed exchange.
#[derive(Debug)]
pub struct ExchangeOutcome {
    /// Final assistant text.
    pub full_text: String,
    /// Whether the text arrived incrementally over the stream.
    pub streamed: bool,
    /// Total network attempts made (streaming and buffered).
    pub attempts: u32,
}

/// A failed exchange, with everything a retry ticket needs.
#[derive(Debug)]
pub struct ExchangeFailure {
    pub error: ChatError,
    pub classification: ErrorClass,
    /// Total network attempts made before giving up.
    pub attempts: u32,
    /// Retry budget left for a manual re-issue.
    pub remaining_retries: u32,
    /// Text that was already delivered to the caller before the failure.
    /// When present, re-issuing the request would duplicate it.
    pub partial_text: Option<String>,
}

enum StreamAttempt {
    Complete(String),
    PartialThenFailed { partial: String, error: ChatError },
    FailedCleanly(ChatError),
}

/// Runs one exchange end to end: streaming, fallback, retries.
#[derive(Debug)]
pub struct FallbackOrchestrator<T> {
    client: TransportClient<T>,
    policy: RetryPolicy,
    streaming_enabled: bool,
}

impl<T: HttpTransport> FallbackOrchestrator<T> {
    pub fn new(client: TransportClient<T>, config: &ChatConfig) -> Self {
        Self {
            client,
            policy: config.retry,
            streaming_enabled: config.streaming_enabled,
        }
    }

    /// Cancel the in-flight request for a message, if any.
    pub fn cancel(&self, message_id: uuid::Uuid) -> bool {
        self.client.cancels().cancel(message_id)
    }

    /// Cancel every in-flight request.
    pub fn cancel_all(&self) {
        self.client.cancels().cancel_all();
    }

    /// Execute the exchange with the full configured retry budget.
    pub async fn execute<F>(
        &self,
        descriptor: &RequestDescriptor,
        on_delta: F,
    ) -> Result<ExchangeOutcome, ExchangeFailure>
    where
        F: FnMut(&str) + Send,
    {
        self.execute_with_budget(descriptor, self.policy.max_retries, on_delta)
            .await
    }

    /// Execute the exchange with a caller-supplied retry budget. Manual
    /// retries pass in the budget left on their ticket; a budget of zero
    /// still makes one attempt.
    pub async fn execute_with_budget<F>(
        &self,
        descriptor: &RequestDescriptor,
        budget: u32,
        mut on_delta: F,
    ) -> Result<ExchangeOutcome, ExchangeFailure>
    where
        F: FnMut(&str) + Send,
    {
        let policy = RetryPolicy {
            max_retries: budget,
            ..self.policy
        };
        let mut attempts = 0u32;

        if self.streaming_enabled {
            attempts += 1;
            match self.try_streaming(descriptor, &mut on_delta).await {
                StreamAttempt::Complete(full_text) => {
                    return Ok(ExchangeOutcome {
                        full_text,
                        streamed: true,
                        attempts,
                    });
                }
                StreamAttempt::PartialThenFailed { partial, error } => {
                    warn!(
                        error = %error,
                        delivered = partial.len(),
                        "stream failed after partial content, not replaying"
                    );
                    let classification = classify(&error);
                    return Err(ExchangeFailure {
                        error,
                        classification,
                        attempts,
                        remaining_retries: 0,
                        partial_text: Some(partial),
                    });
                }
                StreamAttempt::FailedCleanly(ChatError::Cancelled) => {
                    return Err(ExchangeFailure {
                        error: ChatError::Cancelled,
                        classification: classify(&ChatError::Cancelled),
                        attempts,
                        remaining_retries: 0,
                        partial_text: None,
                    });
                }
                StreamAttempt::FailedCleanly(error) => {
                    warn!(error = %error, "stream failed before any content, falling back to buffered");
                }
            }
        }

        let mut buffered_attempt = 0u32;
        loop {
            buffered_attempt += 1;
            attempts += 1;
            match self.client.send_buffered(descriptor).await {
                Ok(full_text) => {
                    return Ok(ExchangeOutcome {
                        full_text,
                        streamed: false,
                        attempts,
                    });
                }
                Err(ChatError::Cancelled) => {
                    return Err(ExchangeFailure {
                        error: ChatError::Cancelled,
                        classification: classify(&ChatError::Cancelled),
                        attempts,
                        remaining_retries: 0,
                        partial_text: None,
                    });
                }
                Err(error) => {
                    let classification = classify(&error);
                    if policy.should_retry(classification, buffered_attempt) {
                        let delay = policy.delay(classification, buffered_attempt);
                        debug!(
                            error = %error,
                            attempt = buffered_attempt,
                            delay_ms = delay.as_millis() as u64,
                            "buffered request failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        return Err(ExchangeFailure {
                            error,
                            classification,
                            attempts,
                            remaining_retries: policy
                                .max_retries
                                .saturating_sub(buffered_attempt),
                            partial_text: None,
                        });
                    }
                }
            }
        }
    }

    async fn try_streaming<F>(
        &self,
        descriptor: &RequestDescriptor,
        on_delta: &mut F,
    ) -> StreamAttempt
    where
        F: FnMut(&str) + Send,
    {
        let mut rx = self.client.send_streaming(descriptor);
        let mut received = String::new();

        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::Chunk(chunk) => {
                    on_delta(&chunk);
                    received.push_str(&chunk);
                }
                TransportEvent::Done { full_text } => {
                    return StreamAttempt::Complete(full_text);
                }
                TransportEvent::Failed(error) => {
                    return if received.is_empty() {
                        StreamAttempt::FailedCleanly(error)
                    } else {
                        StreamAttempt::PartialThenFailed {
                            partial: received,
                            error,
                        }
                    };
                }
            }
        }

        // Channel closed without a terminal event.
        let error = ChatError::Network("stream ended unexpectedly".into());
        if received.is_empty() {
            StreamAttempt::FailedCleanly(error)
        } else {
            StreamAttempt::PartialThenFailed {
                partial: received,
                error,
            }
        }
    }
}
