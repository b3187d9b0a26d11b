//! Interrupt/Retry Governor.
//!
//! Turns a node execution's terminal outcome into a decision: complete it,
//! RETRY it as a fresh execution linked to its predecessors, or ABORT it and
//! release whatever restraint permits its scope still holds.

pub mod model;
pub mod policy;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::chain::StepOutcome;
use crate::config::GovernorConfig;
use crate::core::clock::{Clock, SystemClock};
use crate::core::ids::{ExecutionId, InterruptId};
use crate::error::{Error, Result};
use crate::restraint::{HoldingScope, ScopeLevel, ScopeRelease, ScopeReleaser};
use crate::{rlog, rlog_warn};

pub use model::{
    ExecutionStatus, FailureInfo, Interrupt, InterruptType, NodeExecution, Outcome,
};
pub use policy::RetryPolicy;

/// Starts a node execution the governor created for a retry.
#[async_trait]
pub trait ExecutionLauncher: Send + Sync {
    async fn launch(&self, execution: &NodeExecution) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Completed {
        execution: NodeExecution,
        released: ScopeRelease,
    },
    Retry {
        failed: ExecutionId,
        execution: NodeExecution,
        interrupt: Interrupt,
        released: ScopeRelease,
    },
    Abort {
        execution: NodeExecution,
        interrupt: Interrupt,
        released: ScopeRelease,
    },
}

impl Decision {
    pub fn interrupt(&self) -> Option<&Interrupt> {
        match self {
            Decision::Completed { .. } => None,
            Decision::Retry { interrupt, .. } | Decision::Abort { interrupt, .. } => {
                Some(interrupt)
            }
        }
    }
}

#[derive(Default)]
struct Ledger {
    executions: HashMap<ExecutionId, NodeExecution>,
    /// Executions of each logical step, in creation order.
    by_step: HashMap<String, Vec<ExecutionId>>,
    interrupts: Vec<Interrupt>,
}

impl Ledger {
    fn running(&mut self, id: ExecutionId) -> Result<&mut NodeExecution> {
        let execution = self
            .executions
            .get_mut(&id)
            .ok_or(Error::ExecutionNotFound(id))?;
        if execution.status.is_terminal() {
            return Err(Error::ExecutionNotRunning {
                id,
                status: execution.status.to_string(),
            });
        }
        Ok(execution)
    }

    fn record(&mut self, execution: NodeExecution) {
        self.by_step
            .entry(execution.step_id.clone())
            .or_default()
            .push(execution.id);
        self.executions.insert(execution.id, execution);
    }

    fn interrupt(
        &mut self,
        kind: InterruptType,
        target: ExecutionId,
        reason: String,
        now: DateTime<Utc>,
    ) -> Interrupt {
        let interrupt = Interrupt {
            id: InterruptId::new(),
            kind,
            target,
            created_at: now,
            reason,
        };
        self.interrupts.push(interrupt.clone());
        interrupt
    }
}

pub struct Governor {
    policy: RetryPolicy,
    releaser: Option<Arc<dyn ScopeReleaser>>,
    launcher: Option<Arc<dyn ExecutionLauncher>>,
    clock: Arc<dyn Clock>,
    ledger: Mutex<Ledger>,
}

impl Governor {
    pub fn new(config: &GovernorConfig) -> Result<Self> {
        Ok(Self {
            policy: RetryPolicy::from_config(config)?,
            releaser: None,
            launcher: None,
            clock: Arc::new(SystemClock),
            ledger: Mutex::new(Ledger::default()),
        })
    }

    pub fn with_releaser(mut self, releaser: Arc<dyn ScopeReleaser>) -> Self {
        self.releaser = Some(releaser);
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ExecutionLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record the first execution of a logical step. Without an explicit
    /// scope the execution holds permits under its own step scope.
    pub async fn create_execution(
        &self,
        step_id: &str,
        account_id: &str,
        parameters: Value,
        scope: Option<HoldingScope>,
    ) -> NodeExecution {
        let id = ExecutionId::new();
        let execution = NodeExecution {
            id,
            step_id: step_id.to_string(),
            account_id: account_id.to_string(),
            parameters,
            status: ExecutionStatus::Running,
            retry_ids: Vec::new(),
            attempt: 1,
            scope: scope.unwrap_or_else(|| HoldingScope::step(id.to_string())),
            created_at: self.clock.now(),
            ended_at: None,
            failure: None,
            output: None,
        };
        self.ledger.lock().await.record(execution.clone());
        rlog!("[execution={}] created for step {}", id.short(), step_id);
        execution
    }

    pub async fn on_step_outcome(
        &self,
        execution_id: ExecutionId,
        outcome: &StepOutcome,
    ) -> Result<Decision> {
        self.on_outcome(execution_id, self.policy.outcome_for(outcome))
            .await
    }

    /// Decide what follows a terminal outcome. A retry whose launch fails is
    /// reported as an ABORT of the new execution.
    pub async fn on_outcome(
        &self,
        execution_id: ExecutionId,
        outcome: Outcome,
    ) -> Result<Decision> {
        let now = self.clock.now();
        let mut ledger = self.ledger.lock().await;
        let current = ledger.running(execution_id)?;
        current.ended_at = Some(now);

        let failure = match outcome {
            Outcome::Success { output } => {
                current.status = ExecutionStatus::Succeeded;
                current.output = Some(output);
                let execution = current.clone();
                drop(ledger);
                rlog!("[execution={}] succeeded", execution_id.short());
                let released = self.release_step_scope(&execution.scope).await;
                return Ok(Decision::Completed {
                    execution,
                    released,
                });
            }
            Outcome::RetryableFailure { failure } if self.policy.has_budget(current.attempt) => {
                failure
            }
            Outcome::RetryableFailure { failure } => {
                let reason = format!(
                    "retry budget exhausted after {} attempt(s): {}",
                    current.attempt, failure
                );
                current.failure = Some(failure);
                drop(ledger);
                return self.abort_with(execution_id, reason, now).await;
            }
            Outcome::FatalFailure { failure } => {
                let reason = format!("fatal failure: {}", failure);
                current.failure = Some(failure);
                drop(ledger);
                return self.abort_with(execution_id, reason, now).await;
            }
        };

        current.status = ExecutionStatus::Retried;
        current.failure = Some(failure.clone());
        let failed = current.clone();

        let id = ExecutionId::new();
        let mut retry_ids = failed.retry_ids.clone();
        retry_ids.push(failed.id);
        let scope = match failed.scope.level {
            ScopeLevel::Step => HoldingScope::step(id.to_string()),
            _ => failed.scope.clone(),
        };
        let execution = NodeExecution {
            id,
            step_id: failed.step_id.clone(),
            account_id: failed.account_id.clone(),
            parameters: failed.parameters.clone(),
            status: ExecutionStatus::Running,
            retry_ids,
            attempt: failed.attempt + 1,
            scope,
            created_at: now,
            ended_at: None,
            failure: None,
            output: None,
        };
        ledger.record(execution.clone());
        let interrupt = ledger.interrupt(
            InterruptType::Retry,
            failed.id,
            failure.to_string(),
            now,
        );
        drop(ledger);

        rlog_warn!(
            "[execution={}] RETRY as {} (attempt {}): {}",
            failed.id.short(),
            id.short(),
            execution.attempt,
            failure
        );
        let released = self.release_step_scope(&failed.scope).await;
        if let Some(launcher) = &self.launcher {
            if let Err(e) = launcher.launch(&execution).await {
                // The new execution never started.
                let reason = format!("retry launch failed: {}", e);
                return self.abort_with(id, reason, now).await;
            }
        }
        Ok(Decision::Retry {
            failed: failed.id,
            execution,
            interrupt,
            released,
        })
    }

    /// Abort a running execution from outside.
    pub async fn abort(&self, execution_id: ExecutionId, reason: &str) -> Result<Decision> {
        self.abort_with(execution_id, reason.to_string(), self.clock.now())
            .await
    }

    async fn abort_with(
        &self,
        execution_id: ExecutionId,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let mut ledger = self.ledger.lock().await;
        let execution = ledger
            .executions
            .get_mut(&execution_id)
            .ok_or(Error::ExecutionNotFound(execution_id))?;
        if execution.status.is_terminal() {
            return Err(Error::ExecutionNotRunning {
                id: execution_id,
                status: execution.status.to_string(),
            });
        }
        execution.status = ExecutionStatus::Aborted;
        execution.ended_at = Some(now);
        let execution = execution.clone();
        let interrupt = ledger.interrupt(InterruptType::Abort, execution_id, reason, now);
        drop(ledger);

        rlog_warn!(
            "[execution={}] ABORT: {}",
            execution_id.short(),
            interrupt.reason
        );
        let released = match &self.releaser {
            Some(releaser) => releaser.release_scope(&execution.scope).await,
            None => ScopeRelease::default(),
        };
        Ok(Decision::Abort {
            execution,
            interrupt,
            released,
        })
    }

    /// Step scopes end with their execution. Plan and stage scopes outlive it.
    async fn release_step_scope(&self, scope: &HoldingScope) -> ScopeRelease {
        match (&self.releaser, scope.level) {
            (Some(releaser), ScopeLevel::Step) => releaser.release_scope(scope).await,
            _ => ScopeRelease::default(),
        }
    }

    pub async fn execution(&self, id: ExecutionId) -> Option<NodeExecution> {
        self.ledger.lock().await.executions.get(&id).cloned()
    }

    /// The newest execution of a logical step.
    pub async fn latest_execution(&self, step_id: &str) -> Option<NodeExecution> {
        let ledger = self.ledger.lock().await;
        let id = ledger.by_step.get(step_id)?.last()?;
        ledger.executions.get(id).cloned()
    }

    /// The execution and every execution it superseded, oldest first.
    pub async fn retry_chain(&self, id: ExecutionId) -> Result<Vec<NodeExecution>> {
        let ledger = self.ledger.lock().await;
        let execution = ledger
            .executions
            .get(&id)
            .ok_or(Error::ExecutionNotFound(id))?;
        let mut chain = execution
            .retry_ids
            .iter()
            .filter_map(|prior| ledger.executions.get(prior).cloned())
            .collect::<Vec<_>>();
        chain.push(execution.clone());
        Ok(chain)
    }

    pub async fn interrupts(&self) -> Vec<Interrupt> {
        self.ledger.lock().await.interrupts.clone()
    }
}
