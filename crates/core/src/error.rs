use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Phase not found: {0}")]
    PhaseNotFound(u32),

    #[error("Invalid session state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let id = Uuid::new_v4();
        let error = CoreError::TaskNotFound(id);
        assert!(error.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_validation_display() {
        let error = CoreError::Validation("timeout_ms must be > 0".to_string());
        assert!(error.to_string().contains("timeout_ms"));
    }
}
