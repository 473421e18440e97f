//! Event types for the Codemend progress stream

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity attached to events surfaced to a host UI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// All progress events emitted by the orchestration core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Session events
    #[serde(rename = "session.launched")]
    SessionLaunched { session_id: Uuid },

    #[serde(rename = "session.finalized")]
    SessionFinalized { session_id: Uuid, degraded: bool },

    #[serde(rename = "session.cancelled")]
    SessionCancelled { session_id: Uuid },

    // Phase events
    #[serde(rename = "phase.started")]
    PhaseStarted {
        session_id: Uuid,
        phase_number: u32,
        name: String,
    },

    #[serde(rename = "phase.completed")]
    PhaseCompleted {
        session_id: Uuid,
        phase_number: u32,
        status: String,
        completed: usize,
        failed: usize,
        cancelled: usize,
    },

    // Task events
    #[serde(rename = "task.started")]
    TaskStarted {
        task_id: Uuid,
        phase_number: u32,
        agent_index: usize,
    },

    #[serde(rename = "task.completed")]
    TaskCompleted {
        task_id: Uuid,
        phase_number: u32,
        duration_ms: u64,
    },

    #[serde(rename = "task.failed")]
    TaskFailed {
        task_id: Uuid,
        phase_number: u32,
        error: String,
        severity: Severity,
    },

    #[serde(rename = "task.retry_scheduled")]
    TaskRetryScheduled {
        task_id: Uuid,
        phase_number: u32,
        retry_count: u32,
        delay_ms: u64,
    },

    /// Incremental output from a running engine invocation
    #[serde(rename = "task.output")]
    TaskOutput { task_id: Uuid, chunk: String },

    // Feature health events
    #[serde(rename = "feature.degraded")]
    FeatureDegraded {
        feature: String,
        message: String,
        severity: Severity,
    },

    #[serde(rename = "feature.recovered")]
    FeatureRecovered { feature: String },

    /// Emitted exactly once per transition, never once per retry
    #[serde(rename = "degradation_mode.changed")]
    DegradationModeChanged { active: bool, unhealthy: Vec<String> },

    // System events
    #[serde(rename = "error")]
    Error {
        message: String,
        severity: Severity,
        context: Option<String>,
    },
}

impl Event {
    /// Get the task ID associated with this event, if any
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Event::TaskStarted { task_id, .. } => Some(*task_id),
            Event::TaskCompleted { task_id, .. } => Some(*task_id),
            Event::TaskFailed { task_id, .. } => Some(*task_id),
            Event::TaskRetryScheduled { task_id, .. } => Some(*task_id),
            Event::TaskOutput { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }

    /// Get the phase number associated with this event, if any
    pub fn phase_number(&self) -> Option<u32> {
        match self {
            Event::PhaseStarted { phase_number, .. } => Some(*phase_number),
            Event::PhaseCompleted { phase_number, .. } => Some(*phase_number),
            Event::TaskStarted { phase_number, .. } => Some(*phase_number),
            Event::TaskCompleted { phase_number, .. } => Some(*phase_number),
            Event::TaskFailed { phase_number, .. } => Some(*phase_number),
            Event::TaskRetryScheduled { phase_number, .. } => Some(*phase_number),
            _ => None,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Event::TaskFailed { severity, .. } => *severity,
            Event::FeatureDegraded { severity, .. } => *severity,
            Event::Error { severity, .. } => *severity,
            Event::DegradationModeChanged { active: true, .. } => Severity::High,
            Event::SessionCancelled { .. } => Severity::Medium,
            _ => Severity::Low,
        }
    }
}
