//! Node execution, interrupt, and outcome types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::{ExecutionId, InterruptId};
use crate::error::{Error, ErrorClass};
use crate::restraint::HoldingScope;

/// Why an execution failed, annotated with its class in the failure taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub class: ErrorClass,
    pub message: String,
}

impl FailureInfo {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

impl From<&Error> for FailureInfo {
    fn from(error: &Error) -> Self {
        Self::new(error.class(), error.to_string())
    }
}

impl std::fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.class, self.message)
    }
}

/// Classified result of one node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Outcome {
    Success { output: serde_json::Value },
    RetryableFailure { failure: FailureInfo },
    FatalFailure { failure: FailureInfo },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    Retry,
    Abort,
}

impl std::fmt::Display for InterruptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterruptType::Retry => write!(f, "RETRY"),
            InterruptType::Abort => write!(f, "ABORT"),
        }
    }
}

/// Out-of-band control signal recorded against a node execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interrupt {
    pub id: InterruptId,
    pub kind: InterruptType,
    /// The execution the interrupt acted on.
    pub target: ExecutionId,
    pub created_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    /// Failed and superseded by a retry.
    Retried,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Retried => "retried",
            ExecutionStatus::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// One attempt at a logical workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: ExecutionId,
    /// The logical step; shared by every retry of it.
    pub step_id: String,
    pub account_id: String,
    pub parameters: serde_json::Value,
    pub status: ExecutionStatus,
    /// Executions this one supersedes, oldest first.
    pub retry_ids: Vec<ExecutionId>,
    /// 1 for the first execution of the step.
    pub attempt: u32,
    pub scope: HoldingScope,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureInfo>,
    pub output: Option<serde_json::Value>,
}
