use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One unit of engine work: a single prompt sent to the external
/// reasoning engine by one agent slot within a phase.
///
/// Owned exclusively by the orchestrator; workers report results back
/// over a channel and never mutate tasks directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: Uuid,
    pub phase_number: u32,
    pub agent_index: usize,
    pub prompt: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl AgentTask {
    pub fn new(phase_number: u32, agent_index: usize, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            phase_number,
            agent_index,
            prompt: prompt.into(),
            status: TaskStatus::default(),
            retry_count: 0,
            max_retries: 3,
            started_at: None,
            ended_at: None,
            output: None,
            error: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn complete(&mut self, output: String) {
        self.status = TaskStatus::Completed;
        self.output = Some(output);
        self.error = None;
        self.ended_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: String) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.ended_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.ended_at = Some(Utc::now());
    }

    /// Reset a failed task back to pending for another attempt. Keeps the
    /// retry counter; callers bump it when scheduling the retry.
    pub fn requeue(&mut self) {
        self.status = TaskStatus::Pending;
        self.ended_at = None;
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds().max(0) as u64)
            }
            _ => None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}
