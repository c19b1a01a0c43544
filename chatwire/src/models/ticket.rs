//! Retry ticket and stream handle models for in-flight exchanges.

use uuid::Uuid;

use crate::retry::ErrorClass;
use crate::transport::RequestDescriptor;

/// Bookkeeping for a failed exchange that may be retried.
///
/// Created when an exchange fails; consumed by automatic
/// retry-on-reconnect or a manual user-triggered retry; removed on success
/// or permanent failure. `remaining_retries` only ever decreases.
#[derive(Debug, Clone)]
pub struct RetryTicket {
    /// The assistant placeholder message this ticket belongs to.
    pub message_id: Uuid,
    /// Attempts already made for this logical request.
    pub attempt: u32,
    /// Classification of the most recent failure.
    pub classification: ErrorClass,
    /// Retry budget left for this logical request.
    pub remaining_retries: u32,
    /// The original request, replayed verbatim on retry.
    pub descriptor: RequestDescriptor,
}

/// Live accumulator for one streaming response.
///
/// Exactly one stream handle exists per message with `is_streaming == true`;
/// finalizing the handle is the only path that flips that flag off.
#[derive(Debug)]
pub struct StreamHandle {
    /// The message this stream feeds.
    pub stream_id: Uuid,
    /// Text accumulated so far.
    pub accumulated_text: String,
    /// False once a terminal event (done, error, fallback) was seen.
    pub is_active: bool,
}

impl StreamHandle {
    /// Open a handle for the given placeholder message.
    pub const fn new(stream_id: Uuid) -> Self {
        Self {
            stream_id,
            accumulated_text: String::new(),
            is_active: true,
        }
    }

    /// Append a delta to the accumulated text.
    pub fn push(&mut self, delta: &str) {
        self.accumulated_text.push_str(delta);
    }

    /// Close the handle, returning the accumulated text.
    pub fn finalize(mut self) -> String {
        self.is_active = false;
        std::mem::take(&mut self.accumulated_text)
    }
}
