//! Chatwire - streaming transport and conversation-state sync for
//! embeddable chat.
//!
//! The engine sits between a host UI and a chat backend:
//! - Streams assistant replies over SSE/NDJSON, falling back to a
//!   buffered request when the stream fails before delivering content
//! - Retries transient failures with bounded exponential backoff
//! - Keeps a session-scoped conversation ledger with single-flight
//!   initialization and debounced persistence
//!
//! Hosts construct a [`ChatEngine`], drain its event channel, and render
//! the ledger; everything network-facing stays inside the crate.

pub mod config;
pub mod coordinator;
pub mod decode;
pub mod error;
pub mod fallback;
pub mod models;
pub mod retry;
pub mod sanitize;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ChatConfig, Timeouts};
pub use coordinator::{ChatEngine, ChatEvent};
pub use error::ChatError;
pub use models::{Conversation, Message, MessageRole, Session};
pub use store::{FileStore, KvStore, MemoryStore, SessionStore};
pub use transport::ReqwestTransport;
