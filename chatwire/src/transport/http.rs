//! HTTP transport abstraction and the reqwest-backed implementation.
//!
//! The engine is generic over [`HttpTransport`] so tests can script
//! responses without a network; production code uses [`ReqwestTransport`].

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use crate::error::ChatError;

/// One logical chat exchange, addressed to both endpoints.
///
/// The fallback path replays the exact same body and message id against
/// the buffered URL; nothing is re-sanitized or regenerated.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    /// The assistant placeholder message this request feeds.
    pub message_id: Uuid,
    /// JSON wire body (see the wire protocol: `tenant_id`, `user_input`,
    /// `session_id`, `conversation_context`, `conversation_id`, `turn`).
    pub body: Value,
    /// Continuation token, already filtered for usability.
    pub bearer_token: Option<String>,
    /// Streaming endpoint URL.
    pub streaming_url: String,
    /// Buffered endpoint URL.
    pub buffered_url: String,
}

impl RequestDescriptor {
    /// The concrete request for the streaming path.
    pub fn streaming_request(&self) -> TransportRequest {
        TransportRequest {
            url: self.streaming_url.clone(),
            body: self.body.clone(),
            bearer_token: self.bearer_token.clone(),
        }
    }

    /// The concrete request for the buffered path (same logical payload).
    pub fn buffered_request(&self) -> TransportRequest {
        TransportRequest {
            url: self.buffered_url.clone(),
            body: self.body.clone(),
            bearer_token: self.bearer_token.clone(),
        }
    }
}

/// A single POST to one endpoint.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    pub body: Value,
    pub bearer_token: Option<String>,
}

/// Fully-buffered response.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

/// Streaming response: status plus a stream of byte chunks.
pub struct StreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub stream: BoxStream<'static, Result<Bytes, ChatError>>,
}

impl std::fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Issues the actual network calls.
pub trait HttpTransport: Send + Sync + 'static {
    /// POST and buffer the whole response body.
    fn fetch(
        &self,
        request: TransportRequest,
    ) -> impl Future<Output = Result<BufferedResponse, ChatError>> + Send;

    /// POST and open the response body as a byte-chunk stream.
    fn stream(
        &self,
        request: TransportRequest,
    ) -> impl Future<Output = Result<StreamResponse, ChatError>> + Send;
}

/// Production transport over a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl ReqwestTransport {
    /// Build a transport with the given buffered-request timeout.
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            request_timeout,
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

fn content_type_of(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

impl HttpTransport for ReqwestTransport {
    async fn fetch(&self, request: TransportRequest) -> Result<BufferedResponse, ChatError> {
        let mut builder = self
            .client
            .post(&request.url)
            .json(&request.body)
            .timeout(self.request_timeout);
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let content_type = content_type_of(&response);
        let body = response.text().await?;

        Ok(BufferedResponse {
            status,
            content_type,
            body,
        })
    }

    async fn stream(&self, request: TransportRequest) -> Result<StreamResponse, ChatError> {
        let mut builder = self
            .client
            .post(&request.url)
            .json(&request.body)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let content_type = content_type_of(&response);
        let stream = response.bytes_stream().map(|r| r.map_err(ChatError::from));

        Ok(StreamResponse {
            status,
            content_type,
            stream: stream.boxed(),
        })
    }
}
