//! Durable conversation storage.

pub mod errors;
pub mod sqlite;
pub mod types;

pub use errors::{StoreError, StoreResult};
pub use sqlite::{ConversationStore, SessionUpdate, SqliteConversationStore, StoreFuture};
pub use types::{
    AssistantMeta, DEFAULT_SESSION_TITLE, Message, MessagePage, MessageRole, Session, SessionPage,
};
