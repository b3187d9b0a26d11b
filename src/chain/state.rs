//! Task-chain state with phase transition validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::{ExecutionId, TaskId};
use crate::error::{Error, Result};

/// Where a chain is in its lifecycle.
///
/// NotStarted -> Queued(1) -> AwaitingResult(1) -> { Queued(n) -> AwaitingResult(n) }*
/// -> Finalizing -> Done, with Failed reachable from every non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "phase")]
pub enum ChainPhase {
    NotStarted,
    Queued { round: u32 },
    AwaitingResult { round: u32 },
    Finalizing,
    Done,
    Failed,
}

impl ChainPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChainPhase::Done | ChainPhase::Failed)
    }
}

impl std::fmt::Display for ChainPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainPhase::NotStarted => write!(f, "not_started"),
            ChainPhase::Queued { round } => write!(f, "queued({})", round),
            ChainPhase::AwaitingResult { round } => write!(f, "awaiting_result({})", round),
            ChainPhase::Finalizing => write!(f, "finalizing"),
            ChainPhase::Done => write!(f, "done"),
            ChainPhase::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    pub phase: ChainPhase,
    pub entered_at: DateTime<Utc>,
}

/// Per-step chain record, keyed by the step's execution id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskChainState {
    pub execution_id: ExecutionId,
    /// Every task this chain submitted, in round order.
    pub task_ids: Vec<TaskId>,
    /// Opaque data carried from one round to the next.
    pub pass_through: serde_json::Value,
    pub chain_end: bool,
    phase: ChainPhase,
    history: Vec<PhaseHistoryEntry>,
}

impl TaskChainState {
    pub fn new(execution_id: ExecutionId, now: DateTime<Utc>) -> Self {
        Self {
            execution_id,
            task_ids: Vec::new(),
            pass_through: serde_json::Value::Null,
            chain_end: false,
            phase: ChainPhase::NotStarted,
            history: vec![PhaseHistoryEntry {
                phase: ChainPhase::NotStarted,
                entered_at: now,
            }],
        }
    }

    pub fn can_transition(&self, target: ChainPhase) -> bool {
        use ChainPhase::*;
        match (self.phase, target) {
            (Done, _) | (Failed, _) => false,
            (_, Failed) => true,
            (NotStarted, Queued { round }) => round == 1,
            (NotStarted, Finalizing) => true,
            (Queued { round: a }, AwaitingResult { round: b }) => a == b,
            (AwaitingResult { round: a }, Queued { round: b }) => b == a + 1,
            (AwaitingResult { .. }, Finalizing) => true,
            (Finalizing, Done) => true,
            _ => false,
        }
    }

    pub fn transition(&mut self, target: ChainPhase, now: DateTime<Utc>) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidChainTransition {
                from: self.phase.to_string(),
                to: target.to_string(),
            });
        }
        self.phase = target;
        self.history.push(PhaseHistoryEntry {
            phase: target,
            entered_at: now,
        });
        Ok(())
    }

    pub fn phase(&self) -> ChainPhase {
        self.phase
    }

    pub fn history(&self) -> &[PhaseHistoryEntry] {
        &self.history
    }

    /// Rounds issued so far.
    pub fn round(&self) -> u32 {
        u32::try_from(self.task_ids.len()).unwrap_or(u32::MAX)
    }
}
