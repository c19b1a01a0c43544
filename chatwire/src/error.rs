//! Error taxonomy for the chat engine.
//!
//! Every failure that can reach a caller is one of these variants; the
//! retry policy decides which of them are transient (see `crate::retry`).

use thiserror::Error;

/// Errors surfaced by the transport, decoder, store, and coordinator.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Connectivity failure (DNS, refused connection, dropped socket).
    #[error("network error: {0}")]
    Network(String),

    /// A watchdog or request timeout fired.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The backend answered with a 5xx status.
    #[error("server error (status {status})")]
    Server { status: u16 },

    /// The backend answered with a 4xx status.
    #[error("client error (status {status})")]
    Client { status: u16 },

    /// The response body could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// Conversation initialization failed; sends are blocked until re-init.
    #[error("conversation initialization failed: {0}")]
    Init(String),

    /// The request was cancelled via its cancellation token.
    #[error("request cancelled")]
    Cancelled,
}

impl ChatError {
    /// Build the error matching an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        if status >= 500 {
            Self::Server { status }
        } else {
            Self::Client { status }
        }
    }

    /// Plain-language description shown to the end user in place of the
    /// technical error (which goes to the log only).
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Network(_) => {
                "I couldn't reach the server. Please check your connection and try again."
            }
            Self::Timeout(_) => "The response took too long. Please try again.",
            Self::Server { .. } => {
                "Something went wrong on our side. Please try again in a moment."
            }
            Self::Client { .. } | Self::Decode(_) => {
                "Sorry, something went wrong handling your request."
            }
            Self::Init(_) => "The chat isn't ready yet. Please try again in a moment.",
            Self::Cancelled => "The request was cancelled.",
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}
