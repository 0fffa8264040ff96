//! Storage error types.

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying I/O failed for a key.
    #[error("Storage I/O failed for {key}: {source}")]
    Io {
        /// Key being read or written.
        key: String,
        /// I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Value could not be serialized.
    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Key cannot be used as a storage key.
    #[error("Invalid storage key: {0:?}")]
    InvalidKey(String),
}

impl StoreError {
    /// Wrap an I/O error with the key it happened on.
    pub fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            key: key.into(),
            source,
        }
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
