//! Failure taxonomy.
//!
//! Classification is pure and stateless: it never performs I/O and is
//! the single source of truth for what gets retried versus surfaced.
//! The classifier is constructed explicitly and injected wherever it is
//! needed; there is no ambient global error handler.

use std::io::ErrorKind as IoErrorKind;

use serde::{Deserialize, Serialize};

use events::Severity;

use crate::error::OrchestratorError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad task or config. Never retried.
    Validation,
    /// Engine exited non-zero. Retryable.
    Execution,
    /// Deadline exceeded. Retryable.
    Timeout,
    /// System resource exhaustion. Retryable with longer backoff.
    Resource,
    /// Default bucket. Retried once, then surfaced.
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::Timeout => "timeout",
            Self::Resource => "resource",
            Self::Unknown => "unknown",
        }
    }
}

/// Where the failure happened, fed into severity escalation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyContext {
    pub retry_count: u32,
    pub max_retries: u32,
    pub phase_number: Option<u32>,
}

impl ClassifyContext {
    pub fn new(retry_count: u32, max_retries: u32) -> Self {
        Self {
            retry_count,
            max_retries,
            phase_number: None,
        }
    }

    pub fn with_phase(mut self, phase_number: u32) -> Self {
        self.phase_number = Some(phase_number);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub retryable: bool,
    /// Exponential base used for this kind's backoff. Resource errors
    /// back off more steeply than ordinary execution failures.
    pub backoff_multiplier: u64,
    pub message: String,
}

/// Stateless classifier mapping any failure into the fixed taxonomy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, error: &OrchestratorError, ctx: &ClassifyContext) -> Classification {
        let (kind, base_severity) = Self::kind_of(error);

        let retryable = match kind {
            ErrorKind::Validation => false,
            ErrorKind::Execution | ErrorKind::Timeout | ErrorKind::Resource => true,
            // Unknown failures get exactly one retry before surfacing.
            ErrorKind::Unknown => ctx.retry_count == 0,
        };

        // A failure that exhausted its retry budget is the signal the
        // degradation manager listens for.
        let severity = if retryable && ctx.retry_count >= ctx.max_retries {
            Severity::Critical
        } else {
            base_severity
        };

        let backoff_multiplier = match kind {
            ErrorKind::Resource => 4,
            _ => 2,
        };

        Classification {
            kind,
            severity,
            retryable,
            backoff_multiplier,
            message: error.to_string(),
        }
    }

    fn kind_of(error: &OrchestratorError) -> (ErrorKind, Severity) {
        match error {
            OrchestratorError::Validation(_) | OrchestratorError::InvalidTransition { .. } => {
                (ErrorKind::Validation, Severity::High)
            }
            OrchestratorError::Execution { .. } => (ErrorKind::Execution, Severity::Medium),
            OrchestratorError::Timeout { .. } => (ErrorKind::Timeout, Severity::Medium),
            OrchestratorError::Resource(_) => (ErrorKind::Resource, Severity::High),
            OrchestratorError::Spawn(msg) => {
                // A missing engine binary is a config problem, not a
                // transient fault.
                if msg.contains("not found") {
                    (ErrorKind::Validation, Severity::Critical)
                } else {
                    (ErrorKind::Resource, Severity::High)
                }
            }
            OrchestratorError::Io(err) => match err.kind() {
                IoErrorKind::NotFound | IoErrorKind::PermissionDenied => {
                    (ErrorKind::Validation, Severity::High)
                }
                IoErrorKind::OutOfMemory | IoErrorKind::WouldBlock => {
                    (ErrorKind::Resource, Severity::High)
                }
                _ => (ErrorKind::Unknown, Severity::Medium),
            },
            _ => (ErrorKind::Unknown, Severity::Medium),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::new()
    }

    #[test]
    fn test_validation_never_retried() {
        let err = OrchestratorError::Validation("empty prompt".to_string());
        let c = classifier().classify(&err, &ClassifyContext::new(0, 3));
        assert_eq!(c.kind, ErrorKind::Validation);
        assert!(!c.retryable);
    }

    #[test]
    fn test_execution_retryable() {
        let err = OrchestratorError::Execution {
            exit_code: 1,
            stderr: "oops".to_string(),
        };
        let c = classifier().classify(&err, &ClassifyContext::new(1, 3));
        assert_eq!(c.kind, ErrorKind::Execution);
        assert!(c.retryable);
        assert_eq!(c.backoff_multiplier, 2);
        assert_eq!(c.severity, Severity::Medium);
    }

    #[test]
    fn test_timeout_retryable() {
        let err = OrchestratorError::Timeout {
            duration_ms: 120_000,
        };
        let c = classifier().classify(&err, &ClassifyContext::new(0, 3));
        assert_eq!(c.kind, ErrorKind::Timeout);
        assert!(c.retryable);
    }

    #[test]
    fn test_resource_backs_off_longer() {
        let err = OrchestratorError::Resource("fd limit".to_string());
        let c = classifier().classify(&err, &ClassifyContext::new(0, 3));
        assert_eq!(c.kind, ErrorKind::Resource);
        assert!(c.retryable);
        assert_eq!(c.backoff_multiplier, 4);
    }

    #[test]
    fn test_unknown_retried_exactly_once() {
        let err = OrchestratorError::Unknown("???".to_string());

        let first = classifier().classify(&err, &ClassifyContext::new(0, 3));
        assert_eq!(first.kind, ErrorKind::Unknown);
        assert!(first.retryable);

        let second = classifier().classify(&err, &ClassifyContext::new(1, 3));
        assert!(!second.retryable);
    }

    #[test]
    fn test_exhausted_retries_escalate_to_critical() {
        let err = OrchestratorError::Execution {
            exit_code: 1,
            stderr: "oops".to_string(),
        };
        let c = classifier().classify(&err, &ClassifyContext::new(3, 3));
        assert_eq!(c.severity, Severity::Critical);
    }

    #[test]
    fn test_missing_engine_binary_is_validation() {
        let err = OrchestratorError::Spawn("engine binary not found in PATH".to_string());
        let c = classifier().classify(&err, &ClassifyContext::new(0, 3));
        assert_eq!(c.kind, ErrorKind::Validation);
        assert!(!c.retryable);
        assert_eq!(c.severity, Severity::Critical);
    }

    #[test]
    fn test_classification_is_stable() {
        // Same input, same context, same result: the classifier holds
        // no state.
        let err = OrchestratorError::Timeout { duration_ms: 1000 };
        let ctx = ClassifyContext::new(2, 3);
        let a = classifier().classify(&err, &ctx);
        let b = classifier().classify(&err, &ctx);
        assert_eq!(a.kind, b.kind);
        assert_eq!(a.severity, b.severity);
        assert_eq!(a.retryable, b.retryable);
    }
}
