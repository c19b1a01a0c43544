//! Engine configuration: tenant identity, endpoints, and timing knobs.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Which backend endpoint a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Streaming chat endpoint (SSE/NDJSON response).
    Streaming,
    /// Buffered chat endpoint (single JSON response).
    Buffered,
    /// Conversation initialization endpoint.
    Init,
    /// Server-side conversation clear endpoint.
    Clear,
}

/// Watchdog and request timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Abort a streaming request that has produced zero bytes by this
    /// deadline, so the caller can fall back.
    pub first_chunk: Duration,
    /// Abort the whole stream by this deadline (kept under the upstream
    /// gateway's hard limit); accumulated text is still delivered.
    pub total_stream: Duration,
    /// Timeout for a single buffered request.
    pub request: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            first_chunk: Duration::from_millis(7500),
            total_stream: Duration::from_secs(25),
            request: Duration::from_secs(30),
        }
    }
}

/// Configuration for a chat engine instance.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Tenant the conversation belongs to.
    pub tenant_id: String,
    /// Streaming chat endpoint URL.
    pub streaming_url: String,
    /// Buffered chat endpoint URL.
    pub buffered_url: String,
    /// Conversation initialization endpoint URL.
    pub init_url: String,
    /// Server-side clear endpoint URL.
    pub clear_url: String,
    /// Whether to attempt the streaming path at all.
    pub streaming_enabled: bool,
    /// Watchdog and request timing.
    pub timeouts: Timeouts,
    /// Retry budget and delay curve.
    pub retry: RetryPolicy,
    /// Session inactivity window before a full purge.
    pub session_timeout: Duration,
    /// Coalescing window for ledger persistence writes.
    pub persist_debounce: Duration,
    /// How many recent messages go into the outbound conversation context.
    pub context_window: usize,
}

impl ChatConfig {
    /// Create a config for `tenant_id` with all endpoints under `base_url`
    /// and default timing.
    pub fn new(tenant_id: impl Into<String>, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            tenant_id: tenant_id.into(),
            streaming_url: format!("{base}/chat/stream"),
            buffered_url: format!("{base}/chat"),
            init_url: format!("{base}/conversation/init"),
            clear_url: format!("{base}/conversation/clear"),
            streaming_enabled: true,
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            session_timeout: Duration::from_secs(30 * 60),
            persist_debounce: Duration::from_secs(1),
            context_window: 10,
        }
    }

    /// Look up the URL for an endpoint kind.
    pub fn endpoint(&self, kind: EndpointKind) -> &str {
        match kind {
            EndpointKind::Streaming => &self.streaming_url,
            EndpointKind::Buffered => &self.buffered_url,
            EndpointKind::Init => &self.init_url,
            EndpointKind::Clear => &self.clear_url,
        }
    }

    /// Disable the streaming path (buffered-only).
    pub const fn buffered_only(mut self) -> Self {
        self.streaming_enabled = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_derived_from_base_url() {
        let config = ChatConfig::new("tenant-1", "https://api.example.com/");
        assert_eq!(
            config.endpoint(EndpointKind::Streaming),
            "https://api.example.com/chat/stream"
        );
        assert_eq!(
            config.endpoint(EndpointKind::Buffered),
            "https://api.example.com/chat"
        );
        assert_eq!(
            config.endpoint(EndpointKind::Init),
            "https://api.example.com/conversation/init"
        );
        assert_eq!(
            config.endpoint(EndpointKind::Clear),
            "https://api.example.com/conversation/clear"
        );
    }

    #[test]
    fn defaults_match_the_watchdog_budget() {
        let config = ChatConfig::new("t", "http://x");
        assert_eq!(config.timeouts.first_chunk, Duration::from_millis(7500));
        assert_eq!(config.timeouts.total_stream, Duration::from_secs(25));
        assert_eq!(config.session_timeout, Duration::from_secs(1800));
        assert!(config.streaming_enabled);
        assert!(!config.buffered_only().streaming_enabled);
    }
}
