use super::provider::{ChatAdapter, ChatMessage, CompletionRequest, Role, StreamChunk};
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Marker the session yields when generation is finished.
pub const END_OF_GENERATION: &str = "[EOG]";

#[derive(Debug, Clone, PartialEq)]
pub struct LoadParams {
    pub context_size: u32,
    pub threads: u32,
    pub min_p: f32,
    pub temperature: f32,
}

pub type TokenIter<'a> = Box<dyn Iterator<Item = Result<String>> + Send + 'a>;

/// A stateful on-device model. Turns appended to it are retained; the session
/// is append-only between loads. All calls block.
pub trait LocalModelSession: Send {
    fn load(&mut self, path: &Path, params: &LoadParams) -> bool;
    fn unload(&mut self);
    fn is_loaded(&self) -> bool;
    fn loaded_path(&self) -> Option<&Path>;
    fn append_system_turn(&mut self, text: &str);
    fn append_user_turn(&mut self, text: &str);
    fn append_assistant_turn(&mut self, text: &str);
    /// Generate a reply to `prompt`, ending with [`END_OF_GENERATION`].
    fn generate(&mut self, prompt: &str) -> Result<TokenIter<'_>>;
}

struct LocalState {
    session: Box<dyn LocalModelSession>,
    /// Turns the session has seen since its last load, excluding the system turn.
    turns: Vec<ChatMessage>,
    params: Option<LoadParams>,
    system_prompt: Option<String>,
}

impl LocalState {
    fn load(&mut self, path: &Path, params: &LoadParams, system_prompt: Option<&str>) -> Result<()> {
        if self.session.is_loaded() {
            self.session.unload();
        }
        self.turns.clear();
        if !self.session.load(path, params) {
            self.params = None;
            anyhow::bail!(
                "Failed to load offline model from: {}. Please verify the file is a valid GGUF model.",
                path.display()
            );
        }
        if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
            self.session.append_system_turn(prompt);
        }
        self.params = Some(params.clone());
        self.system_prompt = system_prompt.map(str::to_string);
        Ok(())
    }

    fn append(&mut self, turn: &ChatMessage) {
        match turn.role {
            Role::User => self.session.append_user_turn(&turn.content),
            Role::Assistant => self.session.append_assistant_turn(&turn.content),
            Role::System => self.session.append_system_turn(&turn.content),
        }
        self.turns.push(turn.clone());
    }
}

/// Owned handle to the single local model session.
///
/// Callers must not run two local completions at once: turn replay assumes the
/// session log only changes through the completion that is currently running.
#[derive(Clone)]
pub struct LocalModelHandle {
    state: Arc<Mutex<LocalState>>,
}

impl LocalModelHandle {
    pub fn new(session: impl LocalModelSession + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(LocalState {
                session: Box::new(session),
                turns: Vec::new(),
                params: None,
                system_prompt: None,
            })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LocalState>> {
        self.state
            .lock()
            .map_err(|e| anyhow::anyhow!("local session lock poisoned: {}", e))
    }

    /// Load `path` unless it is already the loaded model. Returns `true` when a
    /// load actually happened. Blocks; run it on a blocking thread.
    pub fn load_or_reuse(
        &self,
        path: &Path,
        params: &LoadParams,
        system_prompt: Option<&str>,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        if state.session.is_loaded() && state.session.loaded_path() == Some(path) {
            debug!("Model already loaded, reusing {}", path.display());
            return Ok(false);
        }
        info!("Loading model from: {}", path.display());
        state.load(path, params, system_prompt)?;
        info!("Model loaded successfully");
        Ok(true)
    }

    pub fn unload(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.session.unload();
        state.turns.clear();
        state.params = None;
        info!("Model unloaded");
        Ok(())
    }

    /// Reload the current model with its parameters, giving an empty session.
    /// Returns `false` when no model is loaded.
    pub fn reset(&self) -> Result<bool> {
        let mut state = self.lock()?;
        let (Some(path), Some(params)) = (
            state.session.loaded_path().map(Path::to_path_buf),
            state.params.clone(),
        ) else {
            return Ok(false);
        };
        let system = state.system_prompt.clone();
        info!("Resetting local session for {}", path.display());
        state.load(&path, &params, system.as_deref())?;
        Ok(true)
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().map(|s| s.session.is_loaded()).unwrap_or(false)
    }

    pub fn loaded_path(&self) -> Option<PathBuf> {
        self.lock()
            .ok()
            .and_then(|s| s.session.loaded_path().map(Path::to_path_buf))
    }

    /// Bring the session log in line with `history`, then stream a reply to
    /// `question` into `tx`. Blocks.
    fn generate_blocking(
        &self,
        history: &[ChatMessage],
        question: &str,
        tx: &mpsc::Sender<StreamChunk>,
    ) -> Result<()> {
        let mut state = self.lock()?;
        if !state.session.is_loaded() {
            anyhow::bail!("Model not loaded");
        }

        // Append-only: a history that does not extend the log (another
        // conversation) is replayed in full on top of what the session holds.
        let seen = if history.starts_with(&state.turns) {
            state.turns.len()
        } else {
            debug!("History does not extend the session log, replaying it in full");
            state.turns.clear();
            0
        };
        let pending = history[seen..].to_vec();
        debug!("Replaying {} turn(s) into the local session", pending.len());
        for turn in &pending {
            state.append(turn);
        }

        let mut reply = String::new();
        {
            let tokens = state.session.generate(question)?;
            for token in tokens {
                if tx.is_closed() {
                    debug!("consumer went away, stopping local generation");
                    break;
                }
                let token = token?;
                if token == END_OF_GENERATION {
                    break;
                }
                reply.push_str(&token);
                if tx.blocking_send(StreamChunk::Delta { text: token }).is_err() {
                    break;
                }
            }
        }

        // The session stores the exchange it just produced.
        state.turns.push(ChatMessage::user(question));
        state.turns.push(ChatMessage::assistant(reply));
        Ok(())
    }
}

/// Adapter over the local session. The model must already be loaded; the
/// orchestrator takes care of that before streaming.
pub struct LocalAdapter {
    handle: LocalModelHandle,
}

impl LocalAdapter {
    pub fn new(handle: LocalModelHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl ChatAdapter for LocalAdapter {
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<()> {
        let Some((question, history)) = request.messages.split_last() else {
            super::provider::send_failure(&tx, "no message to answer").await;
            return Ok(());
        };
        if question.role != Role::User {
            super::provider::send_failure(&tx, "last message must come from the user").await;
            return Ok(());
        }

        let handle = self.handle.clone();
        let history = history.to_vec();
        let question = question.content.clone();
        let worker_tx = tx.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            handle.generate_blocking(&history, &question, &worker_tx)
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                let _ = tx.send(StreamChunk::Done).await;
            }
            Ok(Err(e)) => super::provider::send_failure(&tx, format!("{e:#}")).await,
            Err(join) => super::provider::send_failure(&tx, join.to_string()).await,
        }
        Ok(())
    }
}
