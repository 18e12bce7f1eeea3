use crate::providers::provider::ProviderKind;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::info;

pub const DEFAULT_LOCAL_CONTEXT_SIZE: u32 = 4096;

/// Per-provider settings. The store holds at most one per [`ProviderKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Replaces the built-in prompt for this provider when set.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// GGUF file for the local provider.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default = "default_context_size")]
    pub context_size: u32,
}

fn default_context_size() -> u32 {
    DEFAULT_LOCAL_CONTEXT_SIZE
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind) -> Self {
        let base_url = match kind {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::Google => "https://generativelanguage.googleapis.com",
            ProviderKind::Groq => "https://api.groq.com/openai/v1",
            ProviderKind::Ollama => "http://localhost:11434",
            ProviderKind::Local => "",
        };
        Self {
            kind,
            enabled: false,
            base_url: base_url.to_string(),
            api_key: None,
            model: None,
            temperature: None,
            top_p: None,
            system_prompt: None,
            model_path: None,
            context_size: DEFAULT_LOCAL_CONTEXT_SIZE,
        }
    }

    /// First-run configuration: one disabled entry per provider.
    pub fn defaults() -> Vec<Self> {
        ProviderKind::ALL.into_iter().map(Self::new).collect()
    }
}

/// Replace entries of the same kind, append the rest.
fn merge(existing: &mut Vec<ProviderConfig>, updates: &[ProviderConfig]) {
    for update in updates {
        match existing.iter_mut().find(|c| c.kind == update.kind) {
            Some(slot) => *slot = update.clone(),
            None => existing.push(update.clone()),
        }
    }
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn fetch_provider_config(&self, kind: ProviderKind) -> Result<Option<ProviderConfig>>;
    async fn save_provider_configs(&self, configs: &[ProviderConfig]) -> Result<()>;
}

// ── JSON file ─────────────────────────────────────────────────────────────────

/// Provider settings kept as a JSON array on disk. The file is created with
/// [`ProviderConfig::defaults`] the first time it is read.
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<ProviderConfig>> {
        if !self.path.exists() {
            let defaults = ProviderConfig::defaults();
            self.write_all(&defaults).await?;
            info!("Wrote default provider settings to {}", self.path.display());
            return Ok(defaults);
        }
        let data = tokio::fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&data)?)
    }

    async fn write_all(&self, configs: &[ProviderConfig]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_string_pretty(configs)?;
        tokio::fs::write(&self.path, data).await?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for JsonSettingsStore {
    async fn fetch_provider_config(&self, kind: ProviderKind) -> Result<Option<ProviderConfig>> {
        Ok(self.read_all().await?.into_iter().find(|c| c.kind == kind))
    }

    async fn save_provider_configs(&self, configs: &[ProviderConfig]) -> Result<()> {
        let mut all = self.read_all().await?;
        merge(&mut all, configs);
        self.write_all(&all).await
    }
}

// ── In memory ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemorySettingsStore {
    configs: RwLock<Vec<ProviderConfig>>,
}

impl InMemorySettingsStore {
    pub fn new(configs: Vec<ProviderConfig>) -> Self {
        Self {
            configs: RwLock::new(configs),
        }
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn fetch_provider_config(&self, kind: ProviderKind) -> Result<Option<ProviderConfig>> {
        Ok(self.configs.read().await.iter().find(|c| c.kind == kind).cloned())
    }

    async fn save_provider_configs(&self, configs: &[ProviderConfig]) -> Result<()> {
        merge(&mut *self.configs.write().await, configs);
        Ok(())
    }
}
