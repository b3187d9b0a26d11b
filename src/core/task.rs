//! Task data model for the dispatch queue.
//!
//! A task is created from a [`TaskRequest`], offered to delegates while
//! `Queued`, held under an exclusive [`Lease`] while `Leased`, and archived
//! in one of the terminal statuses once a result, abort, or expiry lands.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::clock::span;
use crate::core::ids::{DelegateId, ExecutionId, TaskId};
use crate::error::ErrorClass;

/// Closed set of task kinds a delegate can be asked to run.
///
/// The payload schema belongs to the kind; the dispatch layer never reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ShellScript,
    HttpCall,
    FetchFiles,
    JobQueue,
    JobPoll,
    CapabilityProbe,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::ShellScript,
        TaskKind::HttpCall,
        TaskKind::FetchFiles,
        TaskKind::JobQueue,
        TaskKind::JobPoll,
        TaskKind::CapabilityProbe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::ShellScript => "shell_script",
            TaskKind::HttpCall => "http_call",
            TaskKind::FetchFiles => "fetch_files",
            TaskKind::JobQueue => "job_queue",
            TaskKind::JobPoll => "job_poll",
            TaskKind::CapabilityProbe => "capability_probe",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a producer submits to the dispatch service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub account_id: String,
    pub kind: TaskKind,
    pub payload: Vec<u8>,
    /// Labels a delegate must carry to be offered this task.
    pub selectors: BTreeSet<String>,
    /// Lease lifetime; the dispatch default applies when absent.
    pub timeout: Option<Duration>,
    pub is_async: bool,
    /// Parked tasks wait for an explicit `queue_parked_task`.
    pub parked: bool,
    pub max_attempts: Option<u32>,
    /// The step execution this task belongs to, if any.
    pub execution_id: Option<ExecutionId>,
}

impl TaskRequest {
    pub fn new(account_id: &str, kind: TaskKind, payload: Vec<u8>) -> Self {
        Self {
            account_id: account_id.to_string(),
            kind,
            payload,
            selectors: BTreeSet::new(),
            timeout: None,
            is_async: true,
            parked: false,
            max_attempts: None,
            execution_id: None,
        }
    }

    pub fn with_selector(mut self, selector: &str) -> Self {
        self.selectors.insert(selector.to_string());
        self
    }

    pub fn with_selectors<I, S>(mut self, selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selectors.extend(selectors.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn for_execution(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn sync(mut self) -> Self {
        self.is_async = false;
        self
    }

    pub fn parked(mut self) -> Self {
        self.parked = true;
        self
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Parked,
    Queued,
    Leased,
    Completed,
    Failed,
    Aborted,
    Expired,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Aborted
                | TaskStatus::Expired
                | TaskStatus::TimedOut
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Parked => "parked",
            TaskStatus::Queued => "queued",
            TaskStatus::Leased => "leased",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Aborted => "aborted",
            TaskStatus::Expired => "expired",
            TaskStatus::TimedOut => "timed_out",
        };
        write!(f, "{}", s)
    }
}

/// Exclusive, time-bounded claim on a task by one delegate.
///
/// `epoch` is the fencing token: it increases on every grant, so a report
/// carrying an older epoch can always be told apart from the current holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: DelegateId,
    pub epoch: u64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// What a delegate reports after running a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TaskResponse {
    Success { data: Vec<u8> },
    Error { message: String },
}

/// Terminal result of a task as seen by its producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TaskOutcome {
    Success { data: Vec<u8> },
    Failure { class: ErrorClass, message: String },
}

impl TaskOutcome {
    pub fn failure(class: ErrorClass, message: impl Into<String>) -> Self {
        TaskOutcome::Failure {
            class,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success { .. })
    }
}

impl From<TaskResponse> for TaskOutcome {
    fn from(response: TaskResponse) -> Self {
        match response {
            TaskResponse::Success { data } => TaskOutcome::Success { data },
            TaskResponse::Error { message } => {
                TaskOutcome::failure(ErrorClass::RemoteTaskFailure, message)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// A task record in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub account_id: String,
    pub kind: TaskKind,
    pub payload: Vec<u8>,
    pub selectors: BTreeSet<String>,
    pub timeout: Duration,
    pub is_async: bool,
    pub status: TaskStatus,
    /// Current or most recent lease; kept after completion for idempotent
    /// duplicate detection.
    pub lease: Option<Lease>,
    /// Highest lease epoch granted so far.
    pub epoch: u64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub execution_id: Option<ExecutionId>,
    /// Arrival order; queue scans offer lower sequences first.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the task reached a terminal status.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Delegates that reported they cannot run this task.
    pub unable_delegates: BTreeSet<DelegateId>,
    pub outcome: Option<TaskOutcome>,
    pub activity: Vec<ActivityEntry>,
}

impl Task {
    pub fn from_request(
        request: TaskRequest,
        default_timeout: Duration,
        default_max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let status = if request.parked {
            TaskStatus::Parked
        } else {
            TaskStatus::Queued
        };
        let mut task = Self {
            id: TaskId::new(),
            account_id: request.account_id,
            kind: request.kind,
            payload: request.payload,
            selectors: request.selectors,
            timeout: request.timeout.unwrap_or(default_timeout),
            is_async: request.is_async,
            status,
            lease: None,
            epoch: 0,
            attempts: 0,
            max_attempts: request.max_attempts.unwrap_or(default_max_attempts).max(1),
            execution_id: request.execution_id,
            sequence: 0,
            created_at: now,
            updated_at: now,
            finished_at: None,
            unable_delegates: BTreeSet::new(),
            outcome: None,
            activity: Vec::new(),
        };
        task.log(now, format!("created as {}", status));
        task
    }

    pub fn log(&mut self, at: DateTime<Utc>, message: impl Into<String>) {
        self.activity.push(ActivityEntry {
            at,
            message: message.into(),
        });
        self.updated_at = at;
    }

    /// Grant a fresh lease to `owner`, bumping the fencing epoch.
    pub fn grant_lease(&mut self, owner: DelegateId, now: DateTime<Utc>) -> &Lease {
        self.epoch += 1;
        self.attempts += 1;
        self.status = TaskStatus::Leased;
        let epoch = self.epoch;
        self.log(
            now,
            format!(
                "leased to {} (epoch {}, attempt {})",
                owner.short(),
                epoch,
                self.attempts
            ),
        );
        self.lease.insert(Lease {
            owner,
            epoch,
            acquired_at: now,
            expires_at: now + span(self.timeout),
        })
    }

    /// True when `delegate` holds the live lease at `epoch`.
    pub fn is_leased_by(&self, delegate: &DelegateId, epoch: u64, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Leased
            && self
                .lease
                .as_ref()
                .map(|l| l.owner == *delegate && l.epoch == epoch && !l.is_expired(now))
                .unwrap_or(false)
    }

    /// Drop the current lease and put the task back in the queue.
    pub fn requeue(&mut self, now: DateTime<Utc>, reason: &str) {
        self.status = TaskStatus::Queued;
        self.lease = None;
        self.log(now, format!("requeued: {}", reason));
    }

    pub fn finish(&mut self, status: TaskStatus, outcome: TaskOutcome, now: DateTime<Utc>) {
        self.status = status;
        self.outcome = Some(outcome);
        self.finished_at = Some(now);
        self.log(now, format!("finished as {}", status));
    }

    /// Terminal at or before `cutoff`.
    pub fn finished_by(&self, cutoff: DateTime<Utc>) -> bool {
        self.status.is_terminal() && self.finished_at.map(|at| at <= cutoff).unwrap_or(false)
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Wire package handed to the lease holder.
    pub fn package(&self) -> Option<TaskPackage> {
        let lease = self.lease.as_ref()?;
        Some(TaskPackage {
            task_id: self.id,
            account_id: self.account_id.clone(),
            kind: self.kind,
            payload: self.payload.clone(),
            lease_epoch: lease.epoch,
            expires_at: lease.expires_at,
            timeout: self.timeout,
        })
    }
}

/// A leased task as delivered to a delegate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPackage {
    pub task_id: TaskId,
    pub account_id: String,
    pub kind: TaskKind,
    pub payload: Vec<u8>,
    pub lease_epoch: u64,
    pub expires_at: DateTime<Utc>,
    pub timeout: Duration,
}

/// Delivered to the producer when a task reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNotification {
    pub task_id: TaskId,
    pub account_id: String,
    pub execution_id: Option<ExecutionId>,
    pub status: TaskStatus,
    pub outcome: TaskOutcome,
}

impl TaskNotification {
    pub fn from_task(task: &Task) -> Option<Self> {
        Some(Self {
            task_id: task.id,
            account_id: task.account_id.clone(),
            execution_id: task.execution_id,
            status: task.status,
            outcome: task.outcome.clone()?,
        })
    }
}
