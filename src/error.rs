use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ids::{DelegateId, ExecutionId, TaskId, UsageId};

/// Failure taxonomy shared by the dispatch layer and the retry governor.
///
/// Transient transport and stale lease failures are absorbed at the protocol
/// layer. Capacity exhaustion is absorbed by queuing. Everything else surfaces
/// as a terminal node execution failure annotated with its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TransientTransport,
    StaleLease,
    CapacityExhausted,
    DelegateExhaustion,
    RemoteTaskFailure,
    TaskTimeout,
    ChainProtocol,
    Internal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::TransientTransport => "transient_transport",
            ErrorClass::StaleLease => "stale_lease",
            ErrorClass::CapacityExhausted => "capacity_exhausted",
            ErrorClass::DelegateExhaustion => "delegate_exhaustion",
            ErrorClass::RemoteTaskFailure => "remote_task_failure",
            ErrorClass::TaskTimeout => "task_timeout",
            ErrorClass::ChainProtocol => "chain_protocol",
            ErrorClass::Internal => "internal",
        }
    }

    /// Classes the retry governor re-issues unless its policy says otherwise.
    pub fn is_retryable_by_default(&self) -> bool {
        matches!(
            self,
            ErrorClass::TransientTransport
                | ErrorClass::RemoteTaskFailure
                | ErrorClass::TaskTimeout
        )
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ErrorClass {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "transient_transport" => Ok(ErrorClass::TransientTransport),
            "stale_lease" => Ok(ErrorClass::StaleLease),
            "capacity_exhausted" => Ok(ErrorClass::CapacityExhausted),
            "delegate_exhaustion" => Ok(ErrorClass::DelegateExhaustion),
            "remote_task_failure" => Ok(ErrorClass::RemoteTaskFailure),
            "task_timeout" => Ok(ErrorClass::TaskTimeout),
            "chain_protocol" => Ok(ErrorClass::ChainProtocol),
            "internal" => Ok(ErrorClass::Internal),
            other => Err(Error::Validation(format!("unknown error class: {}", other))),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {task_id} is {status}, expected {expected}")]
    InvalidTaskState {
        task_id: TaskId,
        status: String,
        expected: &'static str,
    },

    #[error("Delegate not found: {0}")]
    DelegateNotFound(DelegateId),

    #[error("Delegate {0} is not enabled")]
    DelegateNotEnabled(DelegateId),

    #[error("Stale lease on task {task_id}: presented epoch {presented}, current epoch {current}")]
    StaleLease {
        task_id: TaskId,
        presented: u64,
        current: u64,
    },

    #[error("Restraint not found: {0}")]
    RestraintNotFound(String),

    #[error("Usage record not found: {0}")]
    UsageNotFound(UsageId),

    #[error("Requested {requested} permits but restraint {restraint_id} has capacity {capacity}")]
    InvalidPermits {
        restraint_id: String,
        requested: u32,
        capacity: u32,
    },

    #[error("Capacity exhausted on {restraint_id}/{unit} after waiting {waited:?}")]
    CapacityExhausted {
        restraint_id: String,
        unit: String,
        waited: std::time::Duration,
    },

    #[error("Queued claim was withdrawn before it was granted")]
    ClaimWithdrawn,

    #[error("{message}")]
    DelegateExhaustion { task_id: TaskId, message: String },

    #[error("Remote task {task_id} failed: {message}")]
    RemoteTaskFailure { task_id: TaskId, message: String },

    #[error("Task {0} timed out")]
    TaskTimedOut(TaskId),

    #[error("Chain protocol violation: {0}")]
    ChainProtocol(String),

    #[error("Invalid chain transition from {from} to {to}")]
    InvalidChainTransition { from: String, to: String },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("Execution {id} is {status}, cannot accept an outcome")]
    ExecutionNotRunning { id: ExecutionId, status: String },
}

impl Error {
    /// Place this error in the failure taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Transport(_) => ErrorClass::TransientTransport,
            Error::StaleLease { .. } => ErrorClass::StaleLease,
            Error::CapacityExhausted { .. } | Error::ClaimWithdrawn => {
                ErrorClass::CapacityExhausted
            }
            Error::DelegateExhaustion { .. } => ErrorClass::DelegateExhaustion,
            Error::RemoteTaskFailure { .. } => ErrorClass::RemoteTaskFailure,
            Error::TaskTimedOut(_) | Error::Timeout(_) => ErrorClass::TaskTimeout,
            Error::ChainProtocol(_) | Error::InvalidChainTransition { .. } => {
                ErrorClass::ChainProtocol
            }
            _ => ErrorClass::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
