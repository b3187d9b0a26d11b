//! Task Queue & Lease Store.
//!
//! The store is the only place task records change. Every mutation that
//! the at-most-one-assignment guarantee depends on (claiming, fencing a
//! report, revoking a lease) is a single atomic operation on the store, so
//! callers never read-modify-write a task themselves.
//!
//! Terminal tasks stay readable for a retention window so late reports can
//! be fenced and producers can look up outcomes, then `purge_finished`
//! drops them.

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::delegate::Delegate;
use crate::core::ids::{DelegateId, TaskId};
use crate::core::task::{Lease, Task, TaskOutcome, TaskStatus};
use crate::error::Result;

pub use memory::MemoryTaskStore;

/// Result of fencing a delegate report against the current lease.
#[derive(Debug, Clone)]
pub enum Recorded {
    /// First report under the live lease; the task is now terminal.
    Accepted(Task),
    /// The same holder already reported under this epoch.
    Duplicate,
}

/// What happened to a task whose lease was taken away.
#[derive(Debug, Clone)]
pub enum Revocation {
    /// Back in the queue with attempts to spare.
    Requeued(Task),
    /// Out of attempts; the task now carries a terminal outcome.
    Exhausted(Task),
}

impl Revocation {
    pub fn task(&self) -> &Task {
        match self {
            Revocation::Requeued(task) | Revocation::Exhausted(task) => task,
        }
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Store a new task, assigning its arrival sequence.
    async fn insert(&self, task: Task) -> Result<Task>;

    async fn get(&self, task_id: TaskId) -> Option<Task>;

    /// Atomically lease the oldest queued task the delegate is eligible for.
    async fn claim_next(&self, delegate: &Delegate, now: DateTime<Utc>) -> Option<Task>;

    /// Accept a result only from the live lease holder at `epoch`.
    async fn record_result(
        &self,
        task_id: TaskId,
        delegate_id: DelegateId,
        epoch: u64,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<Recorded>;

    /// Push the lease expiry out by the task timeout, fenced by epoch.
    async fn renew_lease(
        &self,
        task_id: TaskId,
        delegate_id: DelegateId,
        epoch: u64,
        now: DateTime<Utc>,
    ) -> Result<Lease>;

    /// End a non-terminal task with the given status and outcome.
    async fn finish(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<Task>;

    /// Fail a task only if it is still waiting for a delegate. Returns `None`
    /// when the task was assigned or finished in the meantime.
    async fn fail_unassigned(
        &self,
        task_id: TaskId,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>>;

    /// Revoke every lease that expired at or before `now`.
    async fn revoke_expired(&self, now: DateTime<Utc>) -> Vec<Revocation>;

    /// Revoke every lease held by a delegate that went away.
    async fn revoke_delegate(
        &self,
        delegate_id: DelegateId,
        delegate_name: &str,
        now: DateTime<Utc>,
    ) -> Vec<Revocation>;

    /// Record that a delegate cannot run the task, releasing its lease if it
    /// holds one.
    async fn mark_unable(
        &self,
        task_id: TaskId,
        delegate_id: DelegateId,
        now: DateTime<Utc>,
    ) -> Result<Task>;

    /// Move a parked task into the queue.
    async fn unpark(&self, task_id: TaskId, now: DateTime<Utc>) -> Result<Task>;

    /// Drop terminal tasks that finished at or before `cutoff`, returning
    /// how many were removed.
    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> usize;

    /// Snapshot of all tasks, optionally restricted to one account.
    async fn list(&self, account_id: Option<&str>) -> Vec<Task>;
}
