use attention::AttentionError;
use thiserror::Error;

/// Failures raised while loading configuration or running fusion heads.
#[derive(Debug, Error)]
pub enum FusionError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to parse JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported configuration format: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("invalid tensor shape: {0}")]
    InvalidShape(String),
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}
