use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use codemend_core::{PhaseStatus, SessionPlan, SessionReport};
use events::{Event, EventEnvelope};
use orchestrator::{
    CancelHandle, EngineConfig, JsonReportSink, OrchestratorError, PhaseOrchestrator,
    ProcessSpawner,
};

const CODEMEND_DIR: &str = ".codemend";
const PLAN_FILE: &str = "plan.json";
const CANCEL_MARKER: &str = "cancel";
const REPORTS_DIR: &str = "reports";
const SESSION_REPORT_FILE: &str = "session.json";
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "codemend")]
#[command(about = "Agent orchestration for automated codebase repair", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine binary invoked once per agent task
    #[arg(long, global = true, default_value = "claude")]
    engine: String,

    /// Extra flag passed to the engine before the prompt (repeatable)
    #[arg(long = "engine-arg", global = true)]
    engine_args: Vec<String>,

    /// Session plan file (defaults to .codemend/plan.json)
    #[arg(long, global = true)]
    plan: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all five phases in order
    Launch {
        /// Prompt template used when no plan file exists
        #[arg(long)]
        prompt: Option<String>,
    },
    /// Run a single phase (1-5)
    Phase {
        number: u32,

        #[arg(long)]
        prompt: Option<String>,
    },
    /// Request cancellation of a running session
    Cancel,
    /// Show the last session report
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Launch { ref prompt } => run(&cli, prompt.clone(), None).await,
        Commands::Phase { number, ref prompt } => run(&cli, prompt.clone(), Some(number)).await,
        Commands::Cancel => cancel().await,
        Commands::Status => status().await,
    }
}

async fn run(cli: &Cli, prompt: Option<String>, phase: Option<u32>) -> Result<()> {
    init_tracing();

    let cwd = std::env::current_dir()?;
    let codemend_dir = cwd.join(CODEMEND_DIR);
    tokio::fs::create_dir_all(&codemend_dir).await?;

    // A marker left over from a previous run must not cancel this one.
    let marker = codemend_dir.join(CANCEL_MARKER);
    if marker.exists() {
        tokio::fs::remove_file(&marker).await?;
    }

    let plan_path = cli
        .plan
        .clone()
        .unwrap_or_else(|| codemend_dir.join(PLAN_FILE));
    let plan = match load_plan(&plan_path, prompt).await {
        Ok(plan) => plan,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            std::process::exit(1);
        }
    };

    let config = EngineConfig::new(&cli.engine)
        .with_args(cli.engine_args.clone())
        .with_cwd(&cwd);
    let spawner = Arc::new(ProcessSpawner::new(config));
    let sink = Arc::new(JsonReportSink::new(codemend_dir.join(REPORTS_DIR)));

    let mut orchestrator = match PhaseOrchestrator::new(plan, spawner) {
        Ok(orchestrator) => orchestrator.with_report_sink(sink),
        Err(err) => {
            eprintln!("Error: invalid plan: {}", err);
            std::process::exit(1);
        }
    };

    spawn_cancel_watcher(orchestrator.cancel_handle(), marker);
    spawn_progress_printer(orchestrator.subscribe());

    let result = match phase {
        Some(number) => orchestrator.run_single_phase(number).await,
        None => orchestrator.launch_session().await,
    };

    match result {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(OrchestratorError::Validation(msg)) => {
            eprintln!("Error: {}", msg);
            std::process::exit(1);
        }
        // Degraded and cancelled sessions already produced a report;
        // anything else is logged but does not change the exit code.
        Err(err) => {
            tracing::error!(error = %err, "session ended with error");
            Ok(())
        }
    }
}

async fn load_plan(path: &Path, prompt: Option<String>) -> Result<SessionPlan> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read plan at {}", path.display()))?;
        let plan: SessionPlan = serde_json::from_str(&content)
            .with_context(|| format!("malformed plan at {}", path.display()))?;
        Ok(plan)
    } else if let Some(prompt) = prompt {
        Ok(SessionPlan::with_default_phases(prompt))
    } else {
        anyhow::bail!(
            "no plan found at {} and no --prompt given",
            path.display()
        )
    }
}

async fn cancel() -> Result<()> {
    let codemend_dir = std::env::current_dir()?.join(CODEMEND_DIR);
    tokio::fs::create_dir_all(&codemend_dir).await?;

    let marker = codemend_dir.join(CANCEL_MARKER);
    tokio::fs::write(&marker, b"cancel").await?;

    println!("Cancellation requested ({}).", marker.display());
    println!("The running session will stop once in-flight engine processes terminate.");
    Ok(())
}

async fn status() -> Result<()> {
    let path = std::env::current_dir()?
        .join(CODEMEND_DIR)
        .join(REPORTS_DIR)
        .join(SESSION_REPORT_FILE);

    if !path.exists() {
        println!("No session report found.");
        println!("Run 'codemend launch' to start a session.");
        return Ok(());
    }

    let content = tokio::fs::read_to_string(&path).await?;
    let report: SessionReport = serde_json::from_str(&content)
        .with_context(|| format!("malformed session report at {}", path.display()))?;
    print_report(&report);
    Ok(())
}

/// Watch for ctrl-c and the cancel marker file; either one requests
/// cancellation of the running session.
fn spawn_cancel_watcher(handle: CancelHandle, marker: PathBuf) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CANCEL_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("ctrl-c received, cancelling session");
                    handle.cancel();
                    break;
                }
                _ = interval.tick() => {
                    if marker.exists() {
                        tracing::info!("cancel marker found, cancelling session");
                        handle.cancel();
                        break;
                    }
                }
            }
        }
    });
}

fn spawn_progress_printer(mut rx: broadcast::Receiver<EventEnvelope>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => print_event(&envelope.event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn print_event(event: &Event) {
    match event {
        Event::PhaseStarted {
            phase_number, name, ..
        } => {
            println!("Phase {} ({}) started", phase_number, name);
        }
        Event::PhaseCompleted {
            phase_number,
            status,
            completed,
            failed,
            cancelled,
            ..
        } => {
            println!(
                "Phase {} finished: {} ({} completed, {} failed, {} cancelled)",
                phase_number, status, completed, failed, cancelled
            );
        }
        Event::SessionCancelled { .. } => {
            println!("Session cancelled.");
        }
        Event::SessionFinalized { degraded, .. } => {
            if *degraded {
                println!("Session finalized with degraded phases.");
            } else {
                println!("Session finalized.");
            }
        }
        _ => {}
    }
}

fn print_report(report: &SessionReport) {
    println!();
    println!("Session: {}", report.session_id);
    println!("State:   {}", report.state.as_str());
    println!();
    for phase in &report.phases {
        let icon = match phase.status {
            PhaseStatus::Completed => "●",
            PhaseStatus::Degraded => "◑",
            PhaseStatus::Running => "◐",
            PhaseStatus::Cancelled => "✕",
            PhaseStatus::Pending => "○",
        };
        println!(
            "  {} [{}] phase {} {}: {}/{} completed, {} failed, {} cancelled",
            icon,
            phase.status.as_str(),
            phase.phase_number,
            phase.name,
            phase.completed,
            phase.total,
            phase.failed,
            phase.cancelled
        );
    }
    println!();
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "codemend=info,orchestrator=info,events=info".into()),
        )
        .init();
}
