//! Supervision of a single external-engine invocation.
//!
//! `CommandExecutor` owns the full lifecycle of one engine process:
//! spawn, incremental output streaming, deadline enforcement and
//! cancellation. Timeout and manual cancellation share one termination
//! path, and a terminated process is never left running.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// How to invoke the engine CLI.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine binary, e.g. `claude` or `opencode`.
    pub program: String,
    /// Flags passed before the prompt.
    pub args: Vec<String>,
    /// Working directory for the invocation (the target codebase).
    pub cwd: Option<PathBuf>,
}

impl EngineConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// One engine invocation payload.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub task_id: Uuid,
    pub prompt: String,
}

impl CommandRequest {
    pub fn new(task_id: Uuid, prompt: impl Into<String>) -> Self {
        Self {
            task_id,
            prompt: prompt.into(),
        }
    }
}

/// A line of incremental output from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressChunk {
    Stdout(String),
    Stderr(String),
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Result of a supervised invocation. Cancellation resolves the call
/// normally rather than surfacing as an error.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Success(CommandOutput),
    Cancelled,
}

/// A running engine process, abstracted so tests can stand in for the
/// real child process.
#[async_trait]
pub trait EngineProcess: Send {
    /// Wait for the process to exit and return its exit code.
    async fn wait(&mut self) -> Result<i32>;

    /// Request termination, wait up to `grace` for the process to exit,
    /// then force-kill. The process must not be left running.
    async fn terminate(&mut self, grace: Duration) -> Result<()>;
}

/// Handle returned by a spawner: the output stream plus the process.
pub struct EngineHandle {
    pub chunks: mpsc::Receiver<ProgressChunk>,
    pub process: Box<dyn EngineProcess>,
}

/// The externally supplied command execution capability.
#[async_trait]
pub trait EngineSpawner: Send + Sync {
    async fn spawn(&self, request: &CommandRequest) -> Result<EngineHandle>;
}

struct ChildProcess {
    child: tokio::process::Child,
}

#[async_trait]
impl EngineProcess for ChildProcess {
    async fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait().await?;
        // A signal-killed process has no code; report it as -1.
        Ok(status.code().unwrap_or(-1))
    }

    async fn terminate(&mut self, grace: Duration) -> Result<()> {
        // Already exited: nothing to do.
        if self.child.id().is_none() {
            return Ok(());
        }
        if let Err(e) = self.child.start_kill() {
            debug!("kill request failed (process likely exited): {}", e);
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                status?;
            }
            Err(_) => {
                warn!("engine process did not exit within grace period, forcing kill");
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}

/// Production spawner backed by `tokio::process::Command`.
pub struct ProcessSpawner {
    config: EngineConfig,
}

impl ProcessSpawner {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EngineSpawner for ProcessSpawner {
    async fn spawn(&self, request: &CommandRequest) -> Result<EngineHandle> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args);
        cmd.arg(&request.prompt);
        if let Some(ref cwd) = self.config.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Backstop: never leave an orphan engine process behind.
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OrchestratorError::Spawn(format!(
                    "engine binary not found: {}",
                    self.config.program
                ))
            } else {
                OrchestratorError::Spawn(e.to_string())
            }
        })?;

        debug!(
            task_id = %request.task_id,
            pid = child.id().unwrap_or(0),
            "engine process spawned"
        );

        let (tx, rx) = mpsc::channel(256);

        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(ProgressChunk::Stdout(line)).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(ProgressChunk::Stderr(line)).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        Ok(EngineHandle {
            chunks: rx,
            process: Box::new(ChildProcess { child }),
        })
    }
}

/// Supervises one invocation end to end.
#[derive(Clone)]
pub struct CommandExecutor {
    spawner: Arc<dyn EngineSpawner>,
    grace_period: Duration,
}

impl CommandExecutor {
    pub fn new(spawner: Arc<dyn EngineSpawner>) -> Self {
        Self {
            spawner,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Run one engine invocation under a deadline.
    ///
    /// Output is streamed to `progress` as it arrives. On timeout the
    /// process is terminated and a Timeout error returned; on
    /// cancellation the process is terminated and the call resolves
    /// with `ExecutionOutcome::Cancelled`.
    pub async fn execute(
        &self,
        request: &CommandRequest,
        timeout_ms: u64,
        cancel: &CancellationToken,
        progress: mpsc::Sender<ProgressChunk>,
    ) -> Result<ExecutionOutcome> {
        if timeout_ms == 0 {
            return Err(OrchestratorError::Validation(
                "timeout_ms must be > 0".to_string(),
            ));
        }

        let started = Instant::now();
        let deadline = tokio::time::sleep(Duration::from_millis(timeout_ms));
        tokio::pin!(deadline);

        let mut handle = self.spawner.spawn(request).await?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    handle.process.terminate(self.grace_period).await?;
                    return Ok(ExecutionOutcome::Cancelled);
                }
                () = &mut deadline => {
                    handle.process.terminate(self.grace_period).await?;
                    return Err(OrchestratorError::Timeout { duration_ms: timeout_ms });
                }
                chunk = handle.chunks.recv() => match chunk {
                    Some(chunk) => {
                        match &chunk {
                            ProgressChunk::Stdout(line) => {
                                stdout.push_str(line);
                                stdout.push('\n');
                            }
                            ProgressChunk::Stderr(line) => {
                                stderr.push_str(line);
                                stderr.push('\n');
                            }
                        }
                        // A lagging consumer must not stall the engine.
                        let _ = progress.try_send(chunk);
                    }
                    None => break,
                }
            }
        }

        // Output streams closed; the exit itself still honors the
        // deadline and the cancellation token.
        let exit_code = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                handle.process.terminate(self.grace_period).await?;
                return Ok(ExecutionOutcome::Cancelled);
            }
            () = &mut deadline => {
                handle.process.terminate(self.grace_period).await?;
                return Err(OrchestratorError::Timeout { duration_ms: timeout_ms });
            }
            code = handle.process.wait() => code?,
        };

        let duration_ms = started.elapsed().as_millis() as u64;

        if exit_code == 0 {
            Ok(ExecutionOutcome::Success(CommandOutput {
                stdout,
                stderr,
                duration_ms,
            }))
        } else {
            Err(OrchestratorError::Execution { exit_code, stderr })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockProcess {
        exit_code: i32,
        wait_delay: Duration,
        terminated: Arc<AtomicBool>,
    }

    #[async_trait]
    impl EngineProcess for MockProcess {
        async fn wait(&mut self) -> Result<i32> {
            tokio::time::sleep(self.wait_delay).await;
            Ok(self.exit_code)
        }

        async fn terminate(&mut self, _grace: Duration) -> Result<()> {
            self.terminated.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockSpawner {
        chunks: Vec<ProgressChunk>,
        exit_code: i32,
        wait_delay: Duration,
        terminated: Arc<AtomicBool>,
    }

    impl MockSpawner {
        fn new(chunks: Vec<ProgressChunk>, exit_code: i32) -> Self {
            Self {
                chunks,
                exit_code,
                wait_delay: Duration::ZERO,
                terminated: Arc::new(AtomicBool::new(false)),
            }
        }

        fn with_wait_delay(mut self, delay: Duration) -> Self {
            self.wait_delay = delay;
            self
        }
    }

    #[async_trait]
    impl EngineSpawner for MockSpawner {
        async fn spawn(&self, _request: &CommandRequest) -> Result<EngineHandle> {
            let (tx, rx) = mpsc::channel(64);
            for chunk in &self.chunks {
                tx.send(chunk.clone()).await.expect("channel open");
            }
            drop(tx);
            Ok(EngineHandle {
                chunks: rx,
                process: Box::new(MockProcess {
                    exit_code: self.exit_code,
                    wait_delay: self.wait_delay,
                    terminated: self.terminated.clone(),
                }),
            })
        }
    }

    fn request() -> CommandRequest {
        CommandRequest::new(Uuid::new_v4(), "inspect src/")
    }

    #[tokio::test]
    async fn test_success_captures_output_and_streams_progress() {
        let spawner = MockSpawner::new(
            vec![
                ProgressChunk::Stdout("line one".to_string()),
                ProgressChunk::Stderr("note".to_string()),
                ProgressChunk::Stdout("line two".to_string()),
            ],
            0,
        );
        let executor = CommandExecutor::new(Arc::new(spawner));
        let (ptx, mut prx) = mpsc::channel(64);

        let outcome = executor
            .execute(&request(), 5_000, &CancellationToken::new(), ptx)
            .await
            .unwrap();

        match outcome {
            ExecutionOutcome::Success(output) => {
                assert_eq!(output.stdout, "line one\nline two\n");
                assert_eq!(output.stderr, "note\n");
            }
            _ => panic!("expected success"),
        }

        let mut streamed = Vec::new();
        while let Ok(chunk) = prx.try_recv() {
            streamed.push(chunk);
        }
        assert_eq!(streamed.len(), 3);
    }

    #[tokio::test]
    async fn test_nonzero_exit_becomes_execution_error() {
        let spawner = MockSpawner::new(
            vec![ProgressChunk::Stderr("compiler exploded".to_string())],
            2,
        );
        let executor = CommandExecutor::new(Arc::new(spawner));
        let (ptx, _prx) = mpsc::channel(64);

        let err = executor
            .execute(&request(), 5_000, &CancellationToken::new(), ptx)
            .await
            .unwrap_err();

        match err {
            OrchestratorError::Execution { exit_code, stderr } => {
                assert_eq!(exit_code, 2);
                assert!(stderr.contains("compiler exploded"));
            }
            other => panic!("expected execution error, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_terminates_process() {
        let spawner =
            MockSpawner::new(vec![], 0).with_wait_delay(Duration::from_secs(600));
        let terminated = spawner.terminated.clone();
        let executor = CommandExecutor::new(Arc::new(spawner));
        let (ptx, _prx) = mpsc::channel(64);

        let err = executor
            .execute(&request(), 120_000, &CancellationToken::new(), ptx)
            .await
            .unwrap_err();

        match err {
            OrchestratorError::Timeout { duration_ms } => assert_eq!(duration_ms, 120_000),
            other => panic!("expected timeout, got {other}"),
        }
        assert!(terminated.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_resolves_not_errors() {
        let spawner =
            MockSpawner::new(vec![], 0).with_wait_delay(Duration::from_secs(600));
        let terminated = spawner.terminated.clone();
        let executor = CommandExecutor::new(Arc::new(spawner));
        let (ptx, _prx) = mpsc::channel(64);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let outcome = executor
            .execute(&request(), 120_000, &cancel, ptx)
            .await
            .unwrap();

        assert!(matches!(outcome, ExecutionOutcome::Cancelled));
        assert!(terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_zero_timeout_rejected() {
        let spawner = MockSpawner::new(vec![], 0);
        let executor = CommandExecutor::new(Arc::new(spawner));
        let (ptx, _prx) = mpsc::channel(64);

        let err = executor
            .execute(&request(), 0, &CancellationToken::new(), ptx)
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_duration_is_recorded() {
        let spawner = MockSpawner::new(vec![ProgressChunk::Stdout("ok".to_string())], 0);
        let executor = CommandExecutor::new(Arc::new(spawner));
        let (ptx, _prx) = mpsc::channel(64);

        let outcome = executor
            .execute(&request(), 5_000, &CancellationToken::new(), ptx)
            .await
            .unwrap();

        match outcome {
            ExecutionOutcome::Success(output) => {
                assert!(output.duration_ms < 5_000);
            }
            _ => panic!("expected success"),
        }
    }
}
