//! Structured reports written on phase and session completion.
//!
//! The JSON schema is stable across runs so report files can be diffed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::phase::{PhaseExecution, PhaseStatus};
use crate::domain::session::{ExecutionSession, SessionState};
use crate::domain::task::{AgentTask, TaskStatus};

const OUTPUT_EXCERPT_LEN: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: Uuid,
    pub agent_index: usize,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub duration_ms: Option<u64>,
    pub output_excerpt: Option<String>,
    pub error: Option<String>,
}

impl TaskSummary {
    pub fn from_task(task: &AgentTask) -> Self {
        Self {
            task_id: task.id,
            agent_index: task.agent_index,
            status: task.status,
            retry_count: task.retry_count,
            duration_ms: task.duration_ms(),
            output_excerpt: task.output.as_ref().map(|o| excerpt(o)),
            error: task.error.clone(),
        }
    }
}

fn excerpt(output: &str) -> String {
    if output.chars().count() <= OUTPUT_EXCERPT_LEN {
        output.to_string()
    } else {
        let truncated: String = output.chars().take(OUTPUT_EXCERPT_LEN).collect();
        format!("{}...", truncated)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase_number: u32,
    pub name: String,
    pub status: PhaseStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub duration_ms: Option<u64>,
    pub task_summaries: Vec<TaskSummary>,
}

impl PhaseReport {
    pub fn from_phase(phase: &PhaseExecution) -> Self {
        let counts = phase.counts();
        Self {
            phase_number: phase.phase_number,
            name: phase.name.clone(),
            status: phase.status,
            total: counts.total,
            completed: counts.completed,
            failed: counts.failed,
            cancelled: counts.cancelled,
            duration_ms: phase.duration_ms(),
            task_summaries: phase.tasks.iter().map(TaskSummary::from_task).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phases: Vec<PhaseReport>,
}

impl SessionReport {
    pub fn from_session(session: &ExecutionSession) -> Self {
        Self {
            session_id: session.session_id,
            state: session.state,
            created_at: session.created_at,
            finished_at: session.finished_at,
            phases: session.phases.iter().map(PhaseReport::from_phase).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_summary_excerpts_long_output() {
        let mut task = AgentTask::new(1, 0, "p");
        task.start();
        task.complete("x".repeat(500));

        let summary = TaskSummary::from_task(&task);
        let excerpt = summary.output_excerpt.unwrap();
        assert!(excerpt.len() < 500);
        assert!(excerpt.ends_with("..."));
    }

    #[test]
    fn test_phase_report_counts() {
        let mut phase = PhaseExecution::new(3, "Repair", 8);
        for i in 0..4 {
            let mut task = AgentTask::new(3, i, "p");
            task.start();
            if i < 2 {
                task.complete("ok".to_string());
            } else if i == 2 {
                task.fail("boom".to_string());
            } else {
                task.cancel();
            }
            phase.tasks.push(task);
        }
        phase.start();
        phase.finish();

        let report = PhaseReport::from_phase(&phase);
        assert_eq!(report.total, 4);
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.task_summaries.len(), 4);
    }

    #[test]
    fn test_report_json_is_snake_case() {
        let phase = PhaseExecution::new(1, "Survey", 8);
        let report = PhaseReport::from_phase(&phase);
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"phase_number\""));
        assert!(json.contains("\"task_summaries\""));
        assert!(json.contains("\"pending\""));
    }

    #[test]
    fn test_session_report_roundtrip() {
        let plan = crate::plan::SessionPlan::with_default_phases("p");
        let session = plan.build_session().unwrap();
        let report = SessionReport::from_session(&session);

        let json = serde_json::to_string_pretty(&report).unwrap();
        let parsed: SessionReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.session_id, report.session_id);
        assert_eq!(parsed.phases.len(), 5);
    }
}
