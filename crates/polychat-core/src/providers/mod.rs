pub mod anthropic;
pub mod google;
mod lines;
pub mod local;
pub mod ollama;
pub mod openai;
pub mod provider;

pub use anthropic::AnthropicAdapter;
pub use google::GoogleAdapter;
pub use local::{LocalAdapter, LocalModelHandle, LocalModelSession};
pub use ollama::SimpleJsonAdapter;
pub use openai::OpenAiCompatibleAdapter;
pub use provider::{
    AdapterFamily, ChatAdapter, ChatMessage, CompletionRequest, ErrorPolicy, ProviderKind, Role,
    StreamChunk,
};
