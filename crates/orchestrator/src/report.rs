//! Report persistence.
//!
//! Reports are written at phase boundaries and at session end, never on
//! the per-task hot path. The sink is a trait so the orchestrator stays
//! agnostic to where reports land.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, warn};

use codemend_core::{ExecutionSession, PhaseExecution, PhaseReport, SessionReport};

use crate::error::Result;

#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn write_phase_report(&self, report: &PhaseReport) -> Result<()>;
    async fn write_session_report(&self, report: &SessionReport) -> Result<()>;
}

/// Writes reports as pretty-printed JSON files under a reports
/// directory, one file per phase plus a session summary.
pub struct JsonReportSink {
    dir: PathBuf,
}

impl JsonReportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn write_json<T: serde::Serialize>(&self, filename: &str, value: &T) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(filename);
        let json = serde_json::to_string_pretty(value)?;
        tokio::fs::write(&path, json).await?;
        debug!(path = %path.display(), "report written");
        Ok(())
    }
}

#[async_trait]
impl ReportSink for JsonReportSink {
    async fn write_phase_report(&self, report: &PhaseReport) -> Result<()> {
        self.write_json(&format!("phase-{}.json", report.phase_number), report)
            .await
    }

    async fn write_session_report(&self, report: &SessionReport) -> Result<()> {
        self.write_json("session.json", report).await
    }
}

/// Collects reports in memory. Used by tests and by hosts that render
/// reports themselves.
#[derive(Default)]
pub struct MemoryReportSink {
    phases: Mutex<Vec<PhaseReport>>,
    sessions: Mutex<Vec<SessionReport>>,
}

impl MemoryReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase_reports(&self) -> Vec<PhaseReport> {
        self.phases.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn session_reports(&self) -> Vec<SessionReport> {
        self.sessions.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ReportSink for MemoryReportSink {
    async fn write_phase_report(&self, report: &PhaseReport) -> Result<()> {
        if let Ok(mut guard) = self.phases.lock() {
            guard.push(report.clone());
        }
        Ok(())
    }

    async fn write_session_report(&self, report: &SessionReport) -> Result<()> {
        if let Ok(mut guard) = self.sessions.lock() {
            guard.push(report.clone());
        }
        Ok(())
    }
}

/// Discards reports. Report persistence is best-effort and must never
/// fail a session, so headless callers can plug this in.
#[derive(Debug, Default)]
pub struct NullReportSink;

#[async_trait]
impl ReportSink for NullReportSink {
    async fn write_phase_report(&self, _report: &PhaseReport) -> Result<()> {
        Ok(())
    }

    async fn write_session_report(&self, _report: &SessionReport) -> Result<()> {
        Ok(())
    }
}

/// Persist a phase report, logging instead of failing on error.
pub async fn persist_phase_report(sink: &dyn ReportSink, phase: &PhaseExecution) {
    let report = PhaseReport::from_phase(phase);
    if let Err(err) = sink.write_phase_report(&report).await {
        warn!(phase_number = phase.phase_number, error = %err, "failed to persist phase report");
    }
}

/// Persist the session report, logging instead of failing on error.
pub async fn persist_session_report(sink: &dyn ReportSink, session: &ExecutionSession) {
    let report = SessionReport::from_session(session);
    if let Err(err) = sink.write_session_report(&report).await {
        warn!(session_id = %session.session_id, error = %err, "failed to persist session report");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codemend_core::{AgentTask, SessionPlan};

    fn sample_phase() -> PhaseExecution {
        let mut phase = PhaseExecution::new(1, "Survey", 8);
        phase.tasks.push(AgentTask::new(1, 0, "inspect"));
        phase.start();
        phase
    }

    #[tokio::test]
    async fn test_json_sink_writes_phase_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonReportSink::new(dir.path().join("reports"));

        let report = PhaseReport::from_phase(&sample_phase());
        sink.write_phase_report(&report).await.unwrap();

        let path = dir.path().join("reports").join("phase-1.json");
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains("\"phase_number\": 1"));
        assert!(contents.contains("Survey"));
    }

    #[tokio::test]
    async fn test_json_sink_writes_session_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonReportSink::new(dir.path());

        let plan = SessionPlan::with_default_phases("analyze {agent_index}");
        let session = plan.build_session().unwrap();
        let report = SessionReport::from_session(&session);
        sink.write_session_report(&report).await.unwrap();

        let path = dir.path().join("session.json");
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["phases"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_memory_sink_collects_reports() {
        let sink = MemoryReportSink::new();
        let report = PhaseReport::from_phase(&sample_phase());

        sink.write_phase_report(&report).await.unwrap();
        sink.write_phase_report(&report).await.unwrap();

        assert_eq!(sink.phase_reports().len(), 2);
        assert!(sink.session_reports().is_empty());
    }

    #[tokio::test]
    async fn test_persist_phase_report_never_fails() {
        // A sink pointed at an unwritable path logs and moves on.
        let sink = JsonReportSink::new("/proc/definitely-not-writable/reports");
        persist_phase_report(&sink, &sample_phase()).await;
    }
}
