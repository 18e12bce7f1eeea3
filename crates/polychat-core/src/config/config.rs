use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application-level settings. Provider credentials and models live in the
/// settings store; this covers where things are kept and how the runtime
/// behaves.
///
/// Read from `~/.polychat/config.json`, then overridden key by key from a
/// `.polychat.json` in the working directory:
/// ```json
/// {
///   "db_path": "/data/polychat/chats.db",
///   "request_timeout_secs": 120,
///   "local_threads": 8
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Provider settings file used by `JsonSettingsStore`.
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,
    /// Whole-request timeout for hosted providers. Unset keeps the transport
    /// defaults.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default = "default_local_threads")]
    pub local_threads: u32,
    #[serde(default = "default_local_min_p")]
    pub local_min_p: f32,
    #[serde(default = "default_local_temperature")]
    pub local_temperature: f32,
}

fn default_db_path() -> PathBuf {
    std::env::var_os("POLYCHAT_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| AppConfig::resolve_path("chats.db"))
}

fn default_settings_path() -> PathBuf {
    AppConfig::resolve_path("providers.json")
}

fn default_local_threads() -> u32 {
    4
}

fn default_local_min_p() -> f32 {
    0.1
}

fn default_local_temperature() -> f32 {
    0.8
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            settings_path: default_settings_path(),
            request_timeout_secs: None,
            local_threads: default_local_threads(),
            local_min_p: default_local_min_p(),
            local_temperature: default_local_temperature(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let local = std::env::current_dir()
            .ok()
            .map(|d| d.join(".polychat.json"))
            .filter(|p| p.exists());
        Self::load_from(&Self::resolve_path("config.json"), local.as_deref())
    }

    pub fn load_from(config_path: &Path, override_path: Option<&Path>) -> Result<Self> {
        let mut config = if config_path.exists() {
            let data = std::fs::read_to_string(config_path)?;
            serde_json::from_str::<AppConfig>(&data)?
        } else {
            AppConfig::default()
        };

        if let Some(local) = override_path {
            let data = std::fs::read_to_string(local)?;
            let override_val: serde_json::Value = serde_json::from_str(&data)?;
            let mut base = serde_json::to_value(&config)?;
            if let (Some(base_obj), Some(over_obj)) =
                (base.as_object_mut(), override_val.as_object())
            {
                for (k, v) in over_obj {
                    base_obj.insert(k.clone(), v.clone());
                }
            }
            config = serde_json::from_value(base)?;
        }

        Ok(config)
    }

    pub fn resolve_path(relative: &str) -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".polychat")
            .join(relative)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}
