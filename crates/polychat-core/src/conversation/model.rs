use crate::error::UnknownProvider;
use crate::providers::provider::ProviderKind;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Longest title derived from a message, in characters.
pub const TITLE_MAX_CHARS: usize = 50;

pub(crate) fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Who wrote a message: the user, or a specific provider's assistant turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    User,
    Provider(ProviderKind),
}

impl Origin {
    pub fn provider(&self) -> Option<ProviderKind> {
        match self {
            Origin::User => None,
            Origin::Provider(kind) => Some(*kind),
        }
    }

    /// Nullable `provider` column value.
    pub fn as_column(&self) -> Option<&'static str> {
        self.provider().map(|k| k.as_str())
    }

    pub fn from_column(value: Option<&str>) -> Result<Self, UnknownProvider> {
        match value {
            None => Ok(Origin::User),
            Some(name) => Ok(Origin::Provider(name.parse()?)),
        }
    }
}

/// A stored chat message. `id == 0` means it has not been persisted yet.
///
/// Equality covers every field, so any difference (timestamps included) counts
/// as a change when reconciling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub origin: Origin,
    pub content: String,
    pub created_at: i64,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: 0,
            conversation_id: 0,
            origin: Origin::User,
            content: content.into(),
            created_at: now_ts(),
        }
    }

    pub fn from_provider(kind: ProviderKind, content: impl Into<String>) -> Self {
        Self {
            id: 0,
            conversation_id: 0,
            origin: Origin::Provider(kind),
            content: content.into(),
            created_at: now_ts(),
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id != 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub title: String,
    pub created_at: i64,
    /// Providers enabled when the conversation was started.
    pub enabled_providers: Vec<ProviderKind>,
}

impl Conversation {
    pub fn new(enabled_providers: Vec<ProviderKind>) -> Self {
        Self {
            id: 0,
            title: String::new(),
            created_at: now_ts(),
            enabled_providers,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id != 0
    }
}

/// Flatten newlines and cap the length so text fits on one title line.
pub fn flatten_title(text: &str) -> String {
    text.replace('\n', " ").chars().take(TITLE_MAX_CHARS).collect()
}

/// Title seeded from the earliest user message, if there is one.
pub fn default_title(messages: &[Message]) -> Option<String> {
    messages
        .iter()
        .filter(|m| m.origin == Origin::User)
        .min_by_key(|m| (m.created_at, m.id))
        .map(|m| flatten_title(&m.content))
}
