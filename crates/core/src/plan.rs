//! Session plan: the configuration input consumed read-only at launch.
//!
//! A plan is produced by an external project-analysis step and describes
//! the task set for each phase: how many agents, the prompt template,
//! the concurrency bound and the retry/timeout budgets.

use serde::{Deserialize, Serialize};

use crate::domain::phase::PhaseExecution;
use crate::domain::session::{ExecutionSession, PHASE_COUNT};
use crate::domain::task::AgentTask;
use crate::error::{CoreError, Result};

pub const DEFAULT_AGENT_COUNT: usize = 25;
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 8;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

pub const DEFAULT_PHASE_NAMES: [&str; PHASE_COUNT as usize] =
    ["Survey", "Diagnose", "Repair", "Validate", "Polish"];

fn default_agent_count() -> usize {
    DEFAULT_AGENT_COUNT
}

fn default_concurrency_limit() -> usize {
    DEFAULT_CONCURRENCY_LIMIT
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

/// Task-set specification for a single phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasePlan {
    pub name: String,
    /// Prompt template; `{agent_index}` and `{agent_count}` are
    /// substituted per task.
    pub prompt_template: String,
    #[serde(default = "default_agent_count")]
    pub agent_count: usize,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl PhasePlan {
    pub fn new(name: impl Into<String>, prompt_template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt_template: prompt_template.into(),
            agent_count: DEFAULT_AGENT_COUNT,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn with_agent_count(mut self, agent_count: usize) -> Self {
        self.agent_count = agent_count;
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn render_prompt(&self, agent_index: usize) -> String {
        self.prompt_template
            .replace("{agent_index}", &agent_index.to_string())
            .replace("{agent_count}", &self.agent_count.to_string())
    }

    fn validate(&self, phase_number: u32) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "phase {}: name must not be empty",
                phase_number
            )));
        }
        if self.prompt_template.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "phase {}: prompt_template must not be empty",
                phase_number
            )));
        }
        if self.agent_count == 0 {
            return Err(CoreError::Validation(format!(
                "phase {}: agent_count must be > 0",
                phase_number
            )));
        }
        if self.concurrency_limit == 0 {
            return Err(CoreError::Validation(format!(
                "phase {}: concurrency_limit must be > 0",
                phase_number
            )));
        }
        if self.timeout_ms == 0 {
            return Err(CoreError::Validation(format!(
                "phase {}: timeout_ms must be > 0",
                phase_number
            )));
        }
        Ok(())
    }
}

/// Full session configuration: exactly five phase plans plus the
/// retry/backoff budgets shared by tasks and feature recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPlan {
    pub phases: Vec<PhasePlan>,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// When true, a Degraded phase stops the session instead of
    /// advancing to the next phase.
    #[serde(default)]
    pub halt_on_degradation: bool,
}

impl SessionPlan {
    /// Reference configuration: five phases, 25 agents each.
    pub fn with_default_phases(prompt_template: impl Into<String>) -> Self {
        let template = prompt_template.into();
        Self {
            phases: DEFAULT_PHASE_NAMES
                .iter()
                .map(|name| PhasePlan::new(*name, template.clone()))
                .collect(),
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            halt_on_degradation: false,
        }
    }

    /// Session-wide validation; a malformed plan fails session launch
    /// before any task runs.
    pub fn validate(&self) -> Result<()> {
        if self.phases.len() != PHASE_COUNT as usize {
            return Err(CoreError::Validation(format!(
                "plan must contain exactly {} phases, got {}",
                PHASE_COUNT,
                self.phases.len()
            )));
        }
        if self.base_delay_ms == 0 {
            return Err(CoreError::Validation(
                "base_delay_ms must be > 0".to_string(),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(CoreError::Validation(
                "max_delay_ms must be >= base_delay_ms".to_string(),
            ));
        }
        for (i, phase) in self.phases.iter().enumerate() {
            phase.validate(i as u32 + 1)?;
        }
        Ok(())
    }

    /// Materialize a fresh session from this plan.
    pub fn build_session(&self) -> Result<ExecutionSession> {
        self.validate()?;

        let phases = self
            .phases
            .iter()
            .enumerate()
            .map(|(i, plan)| {
                let phase_number = i as u32 + 1;
                let mut phase =
                    PhaseExecution::new(phase_number, plan.name.clone(), plan.concurrency_limit);
                phase.tasks = (0..plan.agent_count)
                    .map(|agent_index| {
                        AgentTask::new(phase_number, agent_index, plan.render_prompt(agent_index))
                            .with_max_retries(plan.max_retries)
                    })
                    .collect();
                phase
            })
            .collect();

        Ok(ExecutionSession::new(phases))
    }
}
