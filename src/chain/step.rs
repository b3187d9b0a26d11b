//! Contracts between the chain controller and step implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ids::ExecutionId;
use crate::core::task::TaskRequest;
use crate::error::{ErrorClass, Result};
use crate::governor::model::FailureInfo;
use crate::log::LogContext;
use crate::rlog;

/// What a step hands back after each round.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainHandle {
    /// The next round's task. Required unless `chain_end` is set.
    pub task_request: Option<TaskRequest>,
    pub pass_through: Value,
    pub chain_end: bool,
}

impl ChainHandle {
    pub fn next(task_request: TaskRequest, pass_through: Value) -> Self {
        Self {
            task_request: Some(task_request),
            pass_through,
            chain_end: false,
        }
    }

    pub fn end(pass_through: Value) -> Self {
        Self {
            task_request: None,
            pass_through,
            chain_end: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
}

/// Terminal outcome of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub output: Value,
    pub failure: Option<FailureInfo>,
}

impl StepOutcome {
    pub fn succeeded(output: Value) -> Self {
        Self {
            status: StepStatus::Succeeded,
            output,
            failure: None,
        }
    }

    pub fn failed(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            output: Value::Null,
            failure: Some(FailureInfo::new(class, message)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// Request-scoped context threaded through every step call.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub execution_id: ExecutionId,
    pub account_id: String,
    pub step_name: String,
    pub parameters: Value,
    pub log: LogContext,
}

impl StepContext {
    pub fn new(
        execution_id: ExecutionId,
        account_id: &str,
        step_name: &str,
        parameters: Value,
    ) -> Self {
        Self {
            execution_id,
            account_id: account_id.to_string(),
            step_name: step_name.to_string(),
            parameters,
            log: LogContext::account(account_id).with_execution(execution_id),
        }
    }

    /// Name of the log stream opened for the lifetime of the chain.
    pub fn stream_name(&self) -> String {
        format!("{}-{}", self.step_name, self.execution_id.short())
    }
}

/// A step that takes one or more delegate round-trips.
#[async_trait]
pub trait TaskChainStep: Send + Sync {
    /// Build the first round.
    async fn start(&self, ctx: &StepContext) -> Result<ChainHandle>;

    /// Consume a round's result and decide whether another round follows.
    async fn advance(
        &self,
        ctx: &StepContext,
        handle: &ChainHandle,
        response: &[u8],
    ) -> Result<ChainHandle>;

    /// Turn the final handle into the step outcome.
    async fn finalize(&self, ctx: &StepContext, handle: &ChainHandle) -> Result<StepOutcome>;
}

/// External log/telemetry stream sink.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn open_stream(&self, unit: &str) -> Result<()>;
    async fn close_stream(&self, unit: &str) -> Result<()>;
}

pub struct NoopLogSink;

#[async_trait]
impl LogSink for NoopLogSink {
    async fn open_stream(&self, _unit: &str) -> Result<()> {
        Ok(())
    }

    async fn close_stream(&self, _unit: &str) -> Result<()> {
        Ok(())
    }
}

/// Marks stream boundaries in the relay log.
pub struct FileLogSink;

#[async_trait]
impl LogSink for FileLogSink {
    async fn open_stream(&self, unit: &str) -> Result<()> {
        rlog!("log stream {} opened", unit);
        Ok(())
    }

    async fn close_stream(&self, unit: &str) -> Result<()> {
        rlog!("log stream {} closed", unit);
        Ok(())
    }
}
