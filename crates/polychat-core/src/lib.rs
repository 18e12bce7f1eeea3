pub mod completion;
pub mod config;
pub mod conversation;
pub mod error;
pub mod providers;
pub mod store;

#[cfg(test)]
mod test_util;

pub use completion::{CompletionService, StreamEvent};
pub use config::{
    AppConfig, InMemorySettingsStore, JsonSettingsStore, ProviderConfig, SettingsStore,
};
pub use conversation::{ChatReconciler, Conversation, Message, Origin, SyncPlan};
pub use error::{CompletionError, StoreError, StoreResult, UnknownProvider};
pub use providers::local::{
    LoadParams, LocalModelHandle, LocalModelSession, END_OF_GENERATION,
};
pub use providers::provider::{
    ChatAdapter, ChatMessage, CompletionRequest, ProviderKind, Role, StreamChunk,
};
pub use store::{ChatStore, InMemoryChatStore, SqliteChatStore};
