//! Core error types.

use thiserror::Error;

/// Errors from the process engine core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("missing handler: no handler registered for '{name}'")]
    MissingHandler { name: String },

    #[error("machine not found: {machine}")]
    MachineNotFound { machine: String },

    #[error("element not found: {element_id}")]
    ElementNotFound { element_id: String },

    #[error("invalid process graph: {reason}")]
    InvalidGraph { reason: String },

    #[error("invalid expression: {reason}")]
    InvalidExpression { reason: String },

    #[error("instance {instance_id} is completed and accepts no further commands")]
    InstanceCompleted { instance_id: String },

    #[error("instance {instance_id} has not been created")]
    InstanceNotCreated { instance_id: String },

    #[error("handler failed: {reason}")]
    HandlerFailed { reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Returns whether this error means the process definition and the
    /// stored history no longer agree.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            CoreError::MachineNotFound { .. }
                | CoreError::ElementNotFound { .. }
                | CoreError::InvalidGraph { .. }
        )
    }

    /// Returns a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::MissingHandler { .. } => "MISSING_HANDLER",
            CoreError::MachineNotFound { .. } => "MACHINE_NOT_FOUND",
            CoreError::ElementNotFound { .. } => "ELEMENT_NOT_FOUND",
            CoreError::InvalidGraph { .. } => "INVALID_GRAPH",
            CoreError::InvalidExpression { .. } => "BAD_EXPRESSION",
            CoreError::InstanceCompleted { .. } => "INSTANCE_COMPLETED",
            CoreError::InstanceNotCreated { .. } => "INSTANCE_NOT_CREATED",
            CoreError::HandlerFailed { .. } => "HANDLER_FAILED",
            CoreError::Json(_) => "BAD_REQUEST",
        }
    }
}
