use crate::error::UnknownProvider;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;

/// Every completion backend the client knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "google")]
    Google,
    #[serde(rename = "groq")]
    Groq,
    #[serde(rename = "ollama")]
    Ollama,
    #[serde(rename = "local")]
    Local,
}

/// Wire protocol a provider speaks. Several providers can share one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterFamily {
    OpenAiCompatible,
    Anthropic,
    SimpleJson,
    Google,
    Local,
}

/// What the orchestrator does with an error reported by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Emit `Error` and stop consuming the adapter.
    Surface,
    /// Log the error and finish with `Done` as if the stream ended normally.
    Swallow,
}

/// Where the system prompt goes in a provider request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemPlacement {
    /// Leading `system` role entry in the message array.
    Inline,
    /// Separate request field outside the message array.
    OutOfBand,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 6] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Google,
        ProviderKind::Groq,
        ProviderKind::Ollama,
        ProviderKind::Local,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
            ProviderKind::Groq => "groq",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Local => "local",
        }
    }

    pub fn family(&self) -> AdapterFamily {
        match self {
            ProviderKind::OpenAi | ProviderKind::Groq => AdapterFamily::OpenAiCompatible,
            ProviderKind::Anthropic => AdapterFamily::Anthropic,
            ProviderKind::Ollama => AdapterFamily::SimpleJson,
            ProviderKind::Google => AdapterFamily::Google,
            ProviderKind::Local => AdapterFamily::Local,
        }
    }

    // TODO: confirm with product whether Google stream errors should be surfaced
    // like every other provider; kept silent to match shipped behaviour.
    pub fn error_policy(&self) -> ErrorPolicy {
        match self {
            ProviderKind::Google => ErrorPolicy::Swallow,
            _ => ErrorPolicy::Surface,
        }
    }

    pub fn system_placement(&self) -> SystemPlacement {
        match self.family() {
            AdapterFamily::Anthropic | AdapterFamily::Google | AdapterFamily::Local => {
                SystemPlacement::OutOfBand
            }
            AdapterFamily::OpenAiCompatible | AdapterFamily::SimpleJson => SystemPlacement::Inline,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ProviderKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownProvider(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A provider-shaped chat turn, produced by the history projector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Everything an adapter needs to issue one completion.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Out-of-band system prompt, for providers that do not take it inline.
    pub system: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Incremental text from the model
    Delta { text: String },
    /// Transport, decode or service-reported failure
    Error { message: String },
    /// End of stream
    Done,
}

#[async_trait]
pub trait ChatAdapter: Send + Sync {
    /// Stream one completion into `tx`.
    ///
    /// Implementations report failures as `StreamChunk::Error` followed by
    /// `StreamChunk::Done` and stop as soon as `tx` is closed.
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<()>;
}

/// Send an error chunk and the terminating `Done`.
pub(crate) async fn send_failure(tx: &mpsc::Sender<StreamChunk>, message: impl Into<String>) {
    let _ = tx
        .send(StreamChunk::Error {
            message: message.into(),
        })
        .await;
    let _ = tx.send(StreamChunk::Done).await;
}
