//! Durable storage for chats, messages, and stream sessions.
//!
//! [`store`] defines the row types and the [`ChatStore`] trait; [`sqlite`]
//! is the embedded production backend. `MemoryStore` backs tests and
//! ephemeral deployments.

pub mod sqlite;
pub mod store;

pub use sqlite::SqliteStore;
pub use store::{
    AttachmentRef, ChatRecord, ChatStore, MemoryStore, MessageRecord, MessageRole, SessionStatus,
    SharedStore, StreamSessionRecord, Visibility,
};
