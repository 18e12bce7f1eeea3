#[allow(clippy::module_inception)]
pub mod config;
pub mod settings;
pub use config::AppConfig;
pub use settings::{InMemorySettingsStore, JsonSettingsStore, ProviderConfig, SettingsStore};
