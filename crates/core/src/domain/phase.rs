use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{AgentTask, TaskStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Degraded,
    Cancelled,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Degraded => "degraded",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "degraded" => Some(Self::Degraded),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Degraded | Self::Cancelled)
    }
}

/// Per-phase task tallies, used for progress snapshots and reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PhaseCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// One of the five ordered stages of an execution session.
///
/// Invariant: a phase ends Completed only when every task completed;
/// exhausted retries leave Failed tasks and the phase ends Degraded
/// instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseExecution {
    pub phase_number: u32,
    pub name: String,
    pub tasks: Vec<AgentTask>,
    pub concurrency_limit: usize,
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl PhaseExecution {
    pub fn new(phase_number: u32, name: impl Into<String>, concurrency_limit: usize) -> Self {
        Self {
            phase_number,
            name: name.into(),
            tasks: Vec::new(),
            concurrency_limit,
            status: PhaseStatus::default(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn start(&mut self) {
        self.status = PhaseStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Settle the phase into its terminal status based on task outcomes.
    pub fn finish(&mut self) {
        let counts = self.counts();
        self.status = if counts.cancelled > 0 {
            PhaseStatus::Cancelled
        } else if counts.failed > 0 {
            PhaseStatus::Degraded
        } else {
            PhaseStatus::Completed
        };
        self.ended_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        for task in &mut self.tasks {
            if !task.status.is_terminal() {
                task.cancel();
            }
        }
        self.status = PhaseStatus::Cancelled;
        self.ended_at = Some(Utc::now());
    }

    pub fn counts(&self) -> PhaseCounts {
        let mut counts = PhaseCounts {
            total: self.tasks.len(),
            ..Default::default()
        };
        for task in &self.tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds().max(0) as u64)
            }
            _ => None,
        }
    }

    pub fn failed_task_ids(&self) -> Vec<uuid::Uuid> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase_with_tasks(statuses: &[TaskStatus]) -> PhaseExecution {
        let mut phase = PhaseExecution::new(1, "Survey", 8);
        for (i, status) in statuses.iter().enumerate() {
            let mut task = AgentTask::new(1, i, "p");
            task.status = *status;
            phase.tasks.push(task);
        }
        phase
    }

    #[test]
    fn test_phase_completed_when_all_tasks_complete() {
        let mut phase = phase_with_tasks(&[TaskStatus::Completed, TaskStatus::Completed]);
        phase.start();
        phase.finish();
        assert_eq!(phase.status, PhaseStatus::Completed);
        assert!(phase.ended_at.is_some());
    }

    #[test]
    fn test_phase_degraded_when_any_task_failed() {
        let mut phase = phase_with_tasks(&[TaskStatus::Completed, TaskStatus::Failed]);
        phase.start();
        phase.finish();
        assert_eq!(phase.status, PhaseStatus::Degraded);
    }

    #[test]
    fn test_phase_cancel_marks_non_terminal_tasks() {
        let mut phase = phase_with_tasks(&[
            TaskStatus::Completed,
            TaskStatus::Running,
            TaskStatus::Pending,
        ]);
        phase.cancel();

        assert_eq!(phase.status, PhaseStatus::Cancelled);
        let counts = phase.counts();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.cancelled, 2);
        assert_eq!(counts.running, 0);
    }

    #[test]
    fn test_counts() {
        let phase = phase_with_tasks(&[
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ]);
        let counts = phase.counts();
        assert_eq!(counts.total, 5);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.cancelled, 1);
    }

    #[test]
    fn test_failed_task_ids() {
        let phase = phase_with_tasks(&[TaskStatus::Failed, TaskStatus::Completed]);
        let failed = phase.failed_task_ids();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0], phase.tasks[0].id);
    }
}
