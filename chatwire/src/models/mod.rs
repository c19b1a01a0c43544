//! Data models for chatwire entities.

mod conversation;
mod message;
mod session;
mod ticket;

pub use conversation::Conversation;
pub use message::{Message, MessageAction, MessageRole};
pub use session::Session;
pub use ticket::{RetryTicket, StreamHandle};
