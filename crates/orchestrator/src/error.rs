use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Engine exited with code {exit_code}: {stderr}")]
    Execution { exit_code: i32, stderr: String },

    #[error("Engine invocation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Resource exhaustion: {0}")]
    Resource(String),

    #[error("Failed to spawn engine process: {0}")]
    Spawn(String),

    #[error("Invalid session state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("No session to operate on")]
    NoSession,

    #[error("Feature {feature} failed: {reason}")]
    Feature { feature: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Unknown(String),
}

impl From<codemend_core::CoreError> for OrchestratorError {
    fn from(err: codemend_core::CoreError) -> Self {
        match err {
            codemend_core::CoreError::Validation(msg) => Self::Validation(msg),
            codemend_core::CoreError::InvalidStateTransition { from, to } => {
                Self::InvalidTransition { from, to }
            }
            other => Self::Unknown(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_validation_maps_to_validation() {
        let err: OrchestratorError =
            codemend_core::CoreError::Validation("bad plan".to_string()).into();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn test_execution_display_includes_stderr() {
        let err = OrchestratorError::Execution {
            exit_code: 2,
            stderr: "engine crashed".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("2"));
        assert!(text.contains("engine crashed"));
    }
}
