//! Core domain types for Codemend.
//!
//! This crate holds the data model shared across the workspace: agent
//! tasks, phase executions, execution sessions, feature health, the
//! session plan (configuration input) and the report types written on
//! phase/session completion.

pub mod domain;
pub mod error;
pub mod plan;
pub mod report;

pub use domain::feature::{FallbackPriority, FeatureKind, FeatureStatus};
pub use domain::phase::{PhaseCounts, PhaseExecution, PhaseStatus};
pub use domain::session::{ExecutionSession, SessionState, SessionStateMachine, PHASE_COUNT};
pub use domain::task::{AgentTask, TaskStatus};
pub use error::CoreError;
pub use plan::{PhasePlan, SessionPlan};
pub use report::{PhaseReport, SessionReport, TaskSummary};
