pub mod chat_store;
pub mod memory;
pub mod sqlite;

pub use chat_store::ChatStore;
pub use memory::{InMemoryChatStore, OpCounts};
pub use sqlite::SqliteChatStore;
