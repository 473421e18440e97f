//! The 5-phase orchestration state machine.
//!
//! `PhaseOrchestrator` owns the execution session exclusively. Workers
//! run engine invocations in spawned tasks and report outcomes back
//! over a channel; every task and session state transition happens in
//! the scheduler loop, so no transition can race another.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use codemend_core::{
    AgentTask, ExecutionSession, PhaseCounts, PhaseExecution, PhaseStatus, SessionPlan,
    SessionReport, SessionState, SessionStateMachine, TaskStatus, PHASE_COUNT,
};
use events::{Event, EventBus, EventBusNotifier, EventEnvelope, Severity};

use crate::backoff::backoff_delay;
use crate::classifier::{ClassifyContext, ErrorClassifier};
use crate::command::{
    CommandExecutor, CommandRequest, EngineSpawner, ExecutionOutcome, ProgressChunk,
};
use crate::degradation::DegradationManager;
use crate::error::{OrchestratorError, Result};
use crate::report::{self, NullReportSink, ReportSink};

const WORKER_CHANNEL_CAPACITY: usize = 64;

/// Message sent from a worker (or retry timer) back to the scheduler.
enum WorkerMsg {
    Finished {
        task_id: Uuid,
        result: Result<ExecutionOutcome>,
    },
    RetryReady {
        task_id: Uuid,
    },
}

/// Aggregated progress across the whole session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProgressSnapshot {
    pub session_id: Uuid,
    pub state: SessionState,
    pub current_phase: Option<u32>,
    pub counts: PhaseCounts,
}

/// Cloneable handle for requesting cancellation from outside the
/// scheduler (signal handlers, UI buttons, marker files).
///
/// `cancel` only requests; `settled` resolves once the orchestrator has
/// finished draining, so no task is left mid-transition when it fires.
#[derive(Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    settled: watch::Receiver<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the orchestrator has settled into a terminal state.
    pub async fn settled(&mut self) {
        while !*self.settled.borrow_and_update() {
            if self.settled.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Drives one execution session through its five phases.
pub struct PhaseOrchestrator {
    plan: SessionPlan,
    session: ExecutionSession,
    executor: Arc<CommandExecutor>,
    classifier: ErrorClassifier,
    bus: EventBus,
    sink: Arc<dyn ReportSink>,
    degradation: DegradationManager,
    token: CancellationToken,
    settled_tx: watch::Sender<bool>,
    settled_rx: watch::Receiver<bool>,
}

impl PhaseOrchestrator {
    /// Validate the plan and materialize a fresh session. A malformed
    /// plan fails here, before any engine process is spawned.
    pub fn new(plan: SessionPlan, spawner: Arc<dyn EngineSpawner>) -> Result<Self> {
        let session = plan.build_session()?;
        let bus = EventBus::new();
        let degradation = DegradationManager::new(Arc::new(EventBusNotifier::new(bus.clone())))
            .with_backoff(plan.base_delay_ms, plan.max_delay_ms);
        let (settled_tx, settled_rx) = watch::channel(false);
        Ok(Self {
            plan,
            session,
            executor: Arc::new(CommandExecutor::new(spawner)),
            classifier: ErrorClassifier::new(),
            bus,
            sink: Arc::new(NullReportSink),
            degradation,
            token: CancellationToken::new(),
            settled_tx,
            settled_rx,
        })
    }

    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.executor = Arc::new(self.executor.as_ref().clone().with_grace_period(grace));
        self
    }

    pub fn session(&self) -> &ExecutionSession {
        &self.session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn degradation(&self) -> &DegradationManager {
        &self.degradation
    }

    pub fn degradation_mut(&mut self) -> &mut DegradationManager {
        &mut self.degradation
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.token.clone(),
            settled: self.settled_rx.clone(),
        }
    }

    pub fn overall_progress(&self) -> ProgressSnapshot {
        let mut counts = PhaseCounts::default();
        for phase in &self.session.phases {
            let c = phase.counts();
            counts.total += c.total;
            counts.pending += c.pending;
            counts.running += c.running;
            counts.completed += c.completed;
            counts.failed += c.failed;
            counts.cancelled += c.cancelled;
        }
        ProgressSnapshot {
            session_id: self.session.session_id,
            state: self.session.state,
            current_phase: self.session.current_phase_number(),
            counts,
        }
    }

    pub fn phase_progress(&self, phase_number: u32) -> Result<PhaseCounts> {
        Ok(self.session.phase(phase_number)?.counts())
    }

    /// Run the full session: phases 1 through 5 strictly in order.
    ///
    /// Phase N+1 never starts while phase N has non-terminal tasks. A
    /// Degraded phase still advances unless the plan says to halt; a
    /// cancelled phase ends the session.
    pub async fn launch_session(&mut self) -> Result<SessionReport> {
        info!(session_id = %self.session.session_id, "session launched");
        self.bus.publish(Event::SessionLaunched {
            session_id: self.session.session_id,
        });

        for n in 1..=PHASE_COUNT {
            if self.token.is_cancelled() {
                break;
            }
            self.session.transition(SessionState::Phase(n))?;
            self.run_phase_tasks(n).await?;

            let status = self.session.phase(n)?.status;
            if status == PhaseStatus::Cancelled {
                break;
            }
            if status == PhaseStatus::Degraded && self.plan.halt_on_degradation {
                warn!(phase_number = n, "phase degraded, halting session");
                break;
            }
        }

        self.finalize().await
    }

    /// Run exactly one phase and finalize. Earlier phases are skipped,
    /// not executed; their tasks stay pending in the report.
    pub async fn run_single_phase(&mut self, phase_number: u32) -> Result<SessionReport> {
        if !(1..=PHASE_COUNT).contains(&phase_number) {
            return Err(OrchestratorError::Validation(format!(
                "phase number must be 1..={}, got {}",
                PHASE_COUNT, phase_number
            )));
        }

        info!(
            session_id = %self.session.session_id,
            phase_number,
            "single-phase session launched"
        );
        self.bus.publish(Event::SessionLaunched {
            session_id: self.session.session_id,
        });

        for n in 1..=phase_number {
            self.session.transition(SessionState::Phase(n))?;
        }
        self.run_phase_tasks(phase_number).await?;
        self.finalize().await
    }

    /// Re-run only the tasks that ended Failed, leaving completed work
    /// untouched. Valid only on a finalized session; calling it again
    /// when nothing failed is a no-op.
    pub async fn retry_failed_only(&mut self) -> Result<SessionReport> {
        if self.session.state != SessionState::Finalized {
            return Err(OrchestratorError::Validation(format!(
                "retry requires a finalized session, state is {}",
                self.session.state.as_str()
            )));
        }

        let targets: Vec<u32> = self
            .session
            .phases
            .iter()
            .filter(|p| p.counts().failed > 0)
            .map(|p| p.phase_number)
            .collect();

        if targets.is_empty() {
            debug!("no failed tasks to retry");
            return Ok(SessionReport::from_session(&self.session));
        }

        for n in targets {
            let phase = self.session.phase_mut(n)?;
            for task in &mut phase.tasks {
                if task.status == TaskStatus::Failed {
                    task.retry_count = 0;
                    task.error = None;
                    task.requeue();
                }
            }
            phase.ended_at = None;
            self.run_phase_tasks(n).await?;
        }

        report::persist_session_report(self.sink.as_ref(), &self.session).await;
        Ok(SessionReport::from_session(&self.session))
    }

    /// Scheduler loop for one phase. Owns all task transitions; workers
    /// only report outcomes.
    async fn run_phase_tasks(&mut self, phase_number: u32) -> Result<()> {
        let session_id = self.session.session_id;
        let plan = self
            .plan
            .phases
            .get(phase_number as usize - 1)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::Validation(format!("no plan for phase {}", phase_number))
            })?;
        let base_delay_ms = self.plan.base_delay_ms;
        let max_delay_ms = self.plan.max_delay_ms;

        let phase = self.session.phase_mut(phase_number)?;
        phase.start();
        info!(
            phase_number,
            name = %phase.name,
            tasks = phase.tasks.len(),
            concurrency_limit = plan.concurrency_limit,
            "phase started"
        );
        self.bus.publish(Event::PhaseStarted {
            session_id,
            phase_number,
            name: phase.name.clone(),
        });

        let mut queue: VecDeque<Uuid> = phase
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| t.id)
            .collect();

        let phase_token = self.token.child_token();
        let (tx, mut rx) = mpsc::channel::<WorkerMsg>(WORKER_CHANNEL_CAPACITY);
        let mut running = 0usize;
        let mut waiting = 0usize;

        loop {
            if !phase_token.is_cancelled() {
                while running < plan.concurrency_limit {
                    let Some(task_id) = queue.pop_front() else {
                        break;
                    };
                    let Some(task) = find_task_mut(phase, task_id) else {
                        continue;
                    };
                    task.start();
                    self.bus.publish(Event::TaskStarted {
                        task_id,
                        phase_number,
                        agent_index: task.agent_index,
                    });
                    spawn_worker(
                        self.executor.clone(),
                        self.bus.clone(),
                        tx.clone(),
                        phase_token.clone(),
                        CommandRequest::new(task_id, task.prompt.clone()),
                        plan.timeout_ms,
                    );
                    running += 1;
                }
            }

            if running == 0 && waiting == 0 && (queue.is_empty() || phase_token.is_cancelled()) {
                break;
            }

            let Some(msg) = rx.recv().await else {
                break;
            };
            match msg {
                WorkerMsg::RetryReady { task_id } => {
                    waiting -= 1;
                    if !phase_token.is_cancelled() {
                        queue.push_back(task_id);
                    }
                }
                WorkerMsg::Finished { task_id, result } => {
                    running -= 1;
                    let Some(task) = find_task_mut(phase, task_id) else {
                        continue;
                    };
                    match result {
                        Ok(ExecutionOutcome::Success(output)) => {
                            task.complete(output.stdout);
                            debug!(%task_id, duration_ms = output.duration_ms, "task completed");
                            self.bus.publish(Event::TaskCompleted {
                                task_id,
                                phase_number,
                                duration_ms: output.duration_ms,
                            });
                        }
                        Ok(ExecutionOutcome::Cancelled) => {
                            task.cancel();
                        }
                        Err(err) => {
                            let ctx = ClassifyContext::new(task.retry_count, task.max_retries)
                                .with_phase(phase_number);
                            let classification = self.classifier.classify(&err, &ctx);
                            self.bus.publish(Event::TaskFailed {
                                task_id,
                                phase_number,
                                error: classification.message.clone(),
                                severity: classification.severity,
                            });
                            if classification.severity == Severity::Critical {
                                self.degradation
                                    .record_engine_failure(&classification.message);
                            }

                            if classification.retryable
                                && task.can_retry()
                                && !phase_token.is_cancelled()
                            {
                                let delay = backoff_delay(
                                    base_delay_ms,
                                    max_delay_ms,
                                    task.retry_count,
                                    classification.backoff_multiplier,
                                );
                                task.retry_count += 1;
                                task.requeue();
                                debug!(
                                    %task_id,
                                    retry_count = task.retry_count,
                                    delay_ms = delay.as_millis() as u64,
                                    "retry scheduled"
                                );
                                self.bus
                                    .publish(Event::TaskRetryScheduled {
                                        task_id,
                                        phase_number,
                                        retry_count: task.retry_count,
                                        delay_ms: delay.as_millis() as u64,
                                    });
                                waiting += 1;
                                spawn_retry_timer(tx.clone(), phase_token.clone(), task_id, delay);
                            } else {
                                warn!(%task_id, error = %classification.message, "task failed");
                                task.fail(classification.message);
                            }
                        }
                    }
                }
            }
        }

        if phase_token.is_cancelled() {
            phase.cancel();
        } else {
            phase.finish();
        }

        let counts = phase.counts();
        let status = phase.status;
        info!(
            phase_number,
            status = status.as_str(),
            completed = counts.completed,
            failed = counts.failed,
            cancelled = counts.cancelled,
            "phase finished"
        );
        self.bus.publish(Event::PhaseCompleted {
            session_id,
            phase_number,
            status: status.as_str().to_string(),
            completed: counts.completed,
            failed: counts.failed,
            cancelled: counts.cancelled,
        });

        let phase_ref = self.session.phase(phase_number)?;
        report::persist_phase_report(self.sink.as_ref(), phase_ref).await;

        Ok(())
    }

    /// Settle the session into its terminal state, persist the session
    /// report and release anyone waiting on the cancel handle.
    async fn finalize(&mut self) -> Result<SessionReport> {
        let cancelled = self.token.is_cancelled()
            || self
                .session
                .phases
                .iter()
                .any(|p| p.status == PhaseStatus::Cancelled);

        if cancelled {
            self.session.cancel();
            info!(session_id = %self.session.session_id, "session cancelled");
            self.bus.publish(Event::SessionCancelled {
                session_id: self.session.session_id,
            });
        } else {
            while !self.session.state.is_terminal() {
                match SessionStateMachine::next_state(&self.session.state) {
                    Some(next) => self.session.transition(next)?,
                    None => break,
                }
            }
            let degraded = self
                .session
                .phases
                .iter()
                .any(|p| p.status == PhaseStatus::Degraded);
            info!(session_id = %self.session.session_id, degraded, "session finalized");
            self.bus.publish(Event::SessionFinalized {
                session_id: self.session.session_id,
                degraded,
            });
        }

        report::persist_session_report(self.sink.as_ref(), &self.session).await;
        let _ = self.settled_tx.send(true);
        Ok(SessionReport::from_session(&self.session))
    }
}

fn find_task_mut(phase: &mut PhaseExecution, task_id: Uuid) -> Option<&mut AgentTask> {
    phase.tasks.iter_mut().find(|t| t.id == task_id)
}

/// One engine invocation in a spawned task. Incremental output is
/// re-published on the event bus; the outcome goes back to the
/// scheduler, which performs the actual task transition.
fn spawn_worker(
    executor: Arc<CommandExecutor>,
    bus: EventBus,
    tx: mpsc::Sender<WorkerMsg>,
    token: CancellationToken,
    request: CommandRequest,
    timeout_ms: u64,
) {
    tokio::spawn(async move {
        let task_id = request.task_id;
        let (ptx, mut prx) = mpsc::channel::<ProgressChunk>(256);
        let forwarder = tokio::spawn(async move {
            while let Some(chunk) = prx.recv().await {
                let line = match chunk {
                    ProgressChunk::Stdout(line) | ProgressChunk::Stderr(line) => line,
                };
                bus.publish(Event::TaskOutput {
                    task_id,
                    chunk: line,
                });
            }
        });

        let result = executor.execute(&request, timeout_ms, &token, ptx).await;
        let _ = forwarder.await;
        let _ = tx.send(WorkerMsg::Finished { task_id, result }).await;
    });
}

/// Delay a retry without blocking a concurrency slot. Cancellation
/// short-circuits the sleep so a cancelled phase drains promptly.
fn spawn_retry_timer(
    tx: mpsc::Sender<WorkerMsg>,
    token: CancellationToken,
    task_id: Uuid,
    delay: Duration,
) {
    tokio::spawn(async move {
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = token.cancelled() => {}
        }
        let _ = tx.send(WorkerMsg::RetryReady { task_id }).await;
    });
}
