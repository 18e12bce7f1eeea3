use crate::providers::provider::ProviderKind;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown provider: {0}")]
pub struct UnknownProvider(pub String);

/// Failures raised before a completion stream is started. Everything that goes
/// wrong after that point is reported inside the stream as `StreamEvent::Error`.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("no configuration found for provider `{0}`")]
    MissingConfig(ProviderKind),
    #[error("no offline model selected")]
    MissingModelPath,
    #[error("failed to read provider settings: {0:#}")]
    Settings(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    UnknownProvider(#[from] UnknownProvider),
    #[error("store lock poisoned: {0}")]
    Lock(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
