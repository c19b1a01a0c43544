//! Backoff policy: error classification and retry decisions.
//!
//! Everything here is a pure function of its inputs (no clocks, no RNG)
//! so the policy can be unit-tested exhaustively. The delay curve is
//! exponential with a cap: `min(base * 2^attempt, cap)`, attempt counting
//! from 1.

use std::time::Duration;

use crate::error::ChatError;

/// Broad category a failure falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connectivity failure (retryable).
    Network,
    /// Watchdog or request timeout (retryable).
    Timeout,
    /// 5xx from the backend (retryable).
    Server,
    /// 4xx from the backend (retryable only for 429).
    Client,
    /// Malformed response body (not retryable).
    Decode,
    /// Initialization failure or cancellation (not retryable).
    Other,
}

/// Classification of a failure: its kind plus whether a retry can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorClass {
    pub kind: ErrorKind,
    pub retryable: bool,
}

/// Classify an error for retry purposes.
///
/// 4xx responses indicate a caller-side defect and are not retryable,
/// with the single exception of 429 (rate limiting).
pub fn classify(err: &ChatError) -> ErrorClass {
    match err {
        ChatError::Network(_) => ErrorClass {
            kind: ErrorKind::Network,
            retryable: true,
        },
        ChatError::Timeout(_) => ErrorClass {
            kind: ErrorKind::Timeout,
            retryable: true,
        },
        ChatError::Server { .. } => ErrorClass {
            kind: ErrorKind::Server,
            retryable: true,
        },
        ChatError::Client { status } => ErrorClass {
            kind: ErrorKind::Client,
            retryable: *status == 429,
        },
        ChatError::Decode(_) => ErrorClass {
            kind: ErrorKind::Decode,
            retryable: false,
        },
        ChatError::Init(_) | ChatError::Cancelled => ErrorClass {
            kind: ErrorKind::Other,
            retryable: false,
        },
    }
}

/// Retry budget and delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Base for the exponential delay.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// A policy that allows `retries` retries with the default delay curve.
    pub fn with_budget(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Self::default()
        }
    }

    /// Whether another attempt should be made after `attempt` failures.
    ///
    /// The attempt counter starts at 1 for the first failure.
    pub const fn should_retry(&self, class: ErrorClass, attempt: u32) -> bool {
        class.retryable && attempt < self.max_retries
    }

    /// Delay to wait before the retry following failed attempt `attempt`.
    pub fn delay(&self, _class: ErrorClass, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}
