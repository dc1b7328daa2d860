//! Storage error types.

use thiserror::Error;

/// Errors from the storage layer.
///
/// Version conflicts are not errors; stores report them as `Ok(false)`.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("data corruption at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    #[error("record too large: {size} bytes (max: {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("core error: {0}")]
    Core(#[from] bpmnflow_core::CoreError),
}

impl StorageError {
    /// Returns true if stored history cannot be trusted.
    pub fn is_fatal(&self) -> bool {
        match self {
            StorageError::Corruption { .. } => true,
            StorageError::Core(e) => e.is_structural(),
            _ => false,
        }
    }
}
