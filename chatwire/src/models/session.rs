//! Session model representing one browser-tab-scoped chat session.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A session scopes the conversation ledger and its tokens.
///
/// At most one session is active per persistence scope; a session that has
/// been inactive longer than `expires_after` is purged in full before a new
/// one is minted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub session_id: Uuid,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Last time any activity touched the session.
    pub last_activity_at: DateTime<Utc>,
    /// Inactivity window after which the session expires, in seconds.
    pub expires_after_secs: i64,
}

impl Session {
    /// Mint a fresh session with the given inactivity window.
    pub fn new(expires_after: std::time::Duration) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::now_v7(),
            created_at: now,
            last_activity_at: now,
            expires_after_secs: i64::try_from(expires_after.as_secs()).unwrap_or(i64::MAX),
        }
    }

    /// Whether the session has outlived its inactivity window at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now - self.last_activity_at > ChronoDuration::seconds(self.expires_after_secs)
    }

    /// Record activity, extending the session's life.
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}
