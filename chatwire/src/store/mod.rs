//! Session-scoped persistence: the conversation ledger and its collaborators.

mod backend;
mod kv;
mod session;

pub use backend::{ConversationBackend, HttpConversationBackend, InitOutcome};
pub use kv::{FileStore, KvStore, MemoryStore};
pub use session::{ContextMessage, ConversationContext, SessionStore};
