//! Core error types.

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// JSON configuration could not be parsed.
    #[error("Invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML configuration could not be parsed.
    #[error("Invalid TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration parsed but failed validation.
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Unknown event kind name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);
