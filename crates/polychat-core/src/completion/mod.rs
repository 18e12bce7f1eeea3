pub mod orchestrator;
pub mod projector;

pub use orchestrator::{CompletionService, StreamEvent};
pub use projector::{project, DEFAULT_PROMPT, OPENAI_PROMPT};
