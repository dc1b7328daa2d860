//! Engine error types.

use thiserror::Error;

/// Errors from the engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("core error: {0}")]
    Core(#[from] bpmnflow_core::CoreError),

    #[error("storage error: {0}")]
    Storage(#[from] bpmnflow_storage::StorageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("process definition not found: {process_id}")]
    DefinitionNotFound { process_id: String },
}

impl EngineError {
    /// Returns a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::Core(e) => e.error_code(),
            EngineError::Storage(bpmnflow_storage::StorageError::Core(e)) => e.error_code(),
            EngineError::Storage(_) => "STORAGE_ERROR",
            EngineError::Json(_) => "BAD_JSON",
            EngineError::DefinitionNotFound { .. } => "DEFINITION_NOT_FOUND",
        }
    }
}
