use crate::config::ProviderConfig;
use crate::conversation::model::{Message, Origin};
use crate::providers::provider::{
    AdapterFamily, ChatMessage, CompletionRequest, ProviderKind, SystemPlacement,
};

/// Built-in system prompt for OpenAI models.
pub const OPENAI_PROMPT: &str = "You are a helpful, clever, and very friendly assistant. \
You are familiar with various languages in the world. \
You are to answer my questions precisely.";

/// Built-in system prompt for every other provider.
pub const DEFAULT_PROMPT: &str = "Your task is to answer my questions precisely.";

pub fn default_system_prompt(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAi => OPENAI_PROMPT,
        _ => DEFAULT_PROMPT,
    }
}

/// Configured prompt, or the built-in one for this provider.
pub fn system_prompt(config: &ProviderConfig) -> String {
    config
        .system_prompt
        .clone()
        .unwrap_or_else(|| default_system_prompt(config.kind).to_string())
}

/// Turns visible to `target`: user messages and its own replies. Replies from
/// other providers are dropped.
pub fn project_turns(target: ProviderKind, history: &[Message]) -> Vec<ChatMessage> {
    history
        .iter()
        .filter_map(|m| match m.origin {
            Origin::User => Some(ChatMessage::user(&m.content)),
            Origin::Provider(kind) if kind == target => Some(ChatMessage::assistant(&m.content)),
            Origin::Provider(_) => None,
        })
        .collect()
}

/// Only Gemini models accept a system instruction; Gemma and others reject it.
fn accepts_system_instruction(model: &str) -> bool {
    model
        .get(..6)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("gemini"))
}

/// Shape `history` (the new question included, last) into a request for the
/// provider `config` describes.
pub fn project(config: &ProviderConfig, history: &[Message]) -> CompletionRequest {
    let model = config.model.clone().unwrap_or_default();
    let turns = project_turns(config.kind, history);
    let prompt = system_prompt(config);

    let (messages, system) = match config.kind.system_placement() {
        SystemPlacement::Inline => {
            let mut messages = Vec::with_capacity(turns.len() + 1);
            messages.push(ChatMessage::system(prompt));
            messages.extend(turns);
            (messages, None)
        }
        SystemPlacement::OutOfBand => {
            let system = match config.kind.family() {
                AdapterFamily::Google if !accepts_system_instruction(&model) => None,
                _ => Some(prompt),
            };
            (turns, system)
        }
    };

    CompletionRequest {
        model,
        messages,
        system,
        temperature: config.temperature,
        top_p: config.top_p,
    }
}
