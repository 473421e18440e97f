use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

use super::phase::PhaseExecution;

pub const PHASE_COUNT: u32 = 5;

/// Session-level state: the five phases run strictly in order, with a
/// parallel Cancelled absorbing state reachable from anywhere.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    NotStarted,
    Phase(u32),
    Finalized,
    Cancelled,
}

impl SessionState {
    pub fn as_str(&self) -> String {
        match self {
            Self::NotStarted => "not_started".to_string(),
            Self::Phase(n) => format!("phase_{}", n),
            Self::Finalized => "finalized".to_string(),
            Self::Cancelled => "cancelled".to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Cancelled)
    }
}

pub struct SessionStateMachine;

impl SessionStateMachine {
    pub fn validate_transition(from: &SessionState, to: &SessionState) -> Result<()> {
        if Self::allowed_transitions(from).contains(to) {
            Ok(())
        } else {
            Err(CoreError::InvalidStateTransition {
                from: from.as_str(),
                to: to.as_str(),
            })
        }
    }

    fn allowed_transitions(from: &SessionState) -> Vec<SessionState> {
        match from {
            SessionState::NotStarted => {
                vec![SessionState::Phase(1), SessionState::Cancelled]
            }
            SessionState::Phase(n) if *n < PHASE_COUNT => {
                vec![SessionState::Phase(n + 1), SessionState::Cancelled]
            }
            SessionState::Phase(_) => {
                vec![SessionState::Finalized, SessionState::Cancelled]
            }
            SessionState::Finalized | SessionState::Cancelled => vec![],
        }
    }

    pub fn can_transition(from: &SessionState, to: &SessionState) -> bool {
        Self::validate_transition(from, to).is_ok()
    }

    pub fn next_state(current: &SessionState) -> Option<SessionState> {
        match current {
            SessionState::NotStarted => Some(SessionState::Phase(1)),
            SessionState::Phase(n) if *n < PHASE_COUNT => Some(SessionState::Phase(n + 1)),
            SessionState::Phase(_) => Some(SessionState::Finalized),
            SessionState::Finalized | SessionState::Cancelled => None,
        }
    }
}

/// The top-level run: five ordered phase executions and the state that
/// gates them. Phase N+1 never starts while phase N is non-terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSession {
    pub session_id: Uuid,
    pub phases: Vec<PhaseExecution>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionSession {
    pub fn new(phases: Vec<PhaseExecution>) -> Self {
        debug_assert_eq!(phases.len(), PHASE_COUNT as usize);
        Self {
            session_id: Uuid::new_v4(),
            phases,
            state: SessionState::default(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn transition(&mut self, to: SessionState) -> Result<()> {
        SessionStateMachine::validate_transition(&self.state, &to)?;
        self.state = to;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Cancellation is allowed from any non-terminal state.
    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Cancelled;
            self.finished_at = Some(Utc::now());
        }
        for phase in &mut self.phases {
            if !phase.status.is_terminal() {
                phase.cancel();
            }
        }
    }

    pub fn current_phase_number(&self) -> Option<u32> {
        match self.state {
            SessionState::Phase(n) => Some(n),
            _ => None,
        }
    }

    pub fn phase(&self, phase_number: u32) -> Result<&PhaseExecution> {
        self.phases
            .iter()
            .find(|p| p.phase_number == phase_number)
            .ok_or(CoreError::PhaseNotFound(phase_number))
    }

    pub fn phase_mut(&mut self, phase_number: u32) -> Result<&mut PhaseExecution> {
        self.phases
            .iter_mut()
            .find(|p| p.phase_number == phase_number)
            .ok_or(CoreError::PhaseNotFound(phase_number))
    }
}
