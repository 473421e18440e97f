//! Agent orchestration engine.
//!
//! Drives the external reasoning engine through five sequential phases
//! of bounded-concurrency agent tasks. The pieces:
//!
//! - [`CommandExecutor`]: supervises one engine invocation (spawn,
//!   stream, timeout, cancellation, guaranteed termination)
//! - [`ErrorClassifier`]: pure failure taxonomy shared by retry policy
//!   and degradation tracking
//! - [`DegradationManager`]: feature health registry with fallback and
//!   recovery, isolated from task scheduling
//! - [`PhaseOrchestrator`]: the 5-phase state machine, worker pool,
//!   retry/backoff loop and report aggregation

pub mod backoff;
pub mod classifier;
pub mod command;
pub mod degradation;
pub mod error;
pub mod report;
pub mod session;

pub use backoff::backoff_delay;
pub use classifier::{Classification, ClassifyContext, ErrorClassifier, ErrorKind};
pub use command::{
    CommandExecutor, CommandOutput, CommandRequest, EngineConfig, EngineHandle, EngineProcess,
    EngineSpawner, ExecutionOutcome, ProcessSpawner, ProgressChunk,
};
pub use degradation::{DegradationManager, DegradationSummary, FallbackStrategy};
pub use error::{OrchestratorError, Result};
pub use report::{JsonReportSink, MemoryReportSink, NullReportSink, ReportSink};
pub use session::{CancelHandle, PhaseOrchestrator, ProgressSnapshot};
