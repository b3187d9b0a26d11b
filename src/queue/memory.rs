use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{Recorded, Revocation, TaskStore};
use crate::core::clock::span;
use crate::core::delegate::Delegate;
use crate::core::ids::{DelegateId, TaskId};
use crate::core::task::{Lease, Task, TaskOutcome, TaskStatus};
use crate::error::{Error, ErrorClass, Result};

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    /// Queued tasks by arrival sequence.
    queued: BTreeMap<u64, TaskId>,
    next_sequence: u64,
}

impl Inner {
    fn task_mut(&mut self, task_id: TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(&task_id)
            .ok_or(Error::TaskNotFound(task_id))
    }

    /// Take the lease away from `task_id` and decide its fate.
    fn revoke(
        &mut self,
        task_id: TaskId,
        reason: &str,
        exhausted: TaskOutcome,
        now: DateTime<Utc>,
    ) -> Option<Revocation> {
        let task = self.tasks.get_mut(&task_id)?;
        if task.attempts_remaining() {
            task.requeue(now, reason);
            self.queued.insert(task.sequence, task.id);
            Some(Revocation::Requeued(task.clone()))
        } else {
            let status = match &exhausted {
                TaskOutcome::Failure {
                    class: ErrorClass::TaskTimeout,
                    ..
                } => TaskStatus::TimedOut,
                _ => TaskStatus::Failed,
            };
            task.lease = None;
            task.log(now, reason.to_string());
            task.finish(status, exhausted, now);
            Some(Revocation::Exhausted(task.clone()))
        }
    }
}

/// In-process task store guarded by a single async mutex.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<Inner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, mut task: Task) -> Result<Task> {
        let mut inner = self.inner.lock().await;
        if inner.tasks.contains_key(&task.id) {
            return Err(Error::Validation(format!("duplicate task id {}", task.id)));
        }
        inner.next_sequence += 1;
        task.sequence = inner.next_sequence;
        if task.status == TaskStatus::Queued {
            inner.queued.insert(task.sequence, task.id);
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get(&self, task_id: TaskId) -> Option<Task> {
        self.inner.lock().await.tasks.get(&task_id).cloned()
    }

    async fn claim_next(&self, delegate: &Delegate, now: DateTime<Utc>) -> Option<Task> {
        let mut inner = self.inner.lock().await;
        let Inner { tasks, queued, .. } = &mut *inner;

        let (sequence, task_id) = queued
            .iter()
            .find(|(_, id)| {
                tasks
                    .get(id)
                    .map(|t| {
                        t.account_id == delegate.account_id
                            && delegate.matches(&t.selectors)
                            && !t.unable_delegates.contains(&delegate.id)
                    })
                    .unwrap_or(false)
            })
            .map(|(seq, id)| (*seq, *id))?;

        queued.remove(&sequence);
        let task = tasks.get_mut(&task_id)?;
        task.grant_lease(delegate.id, now);
        Some(task.clone())
    }

    async fn record_result(
        &self,
        task_id: TaskId,
        delegate_id: DelegateId,
        epoch: u64,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<Recorded> {
        let mut inner = self.inner.lock().await;
        let task = inner.task_mut(task_id)?;

        if task.is_leased_by(&delegate_id, epoch, now) {
            let status = if outcome.is_success() {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            task.log(
                now,
                format!("result reported by {} (epoch {})", delegate_id.short(), epoch),
            );
            task.finish(status, outcome, now);
            return Ok(Recorded::Accepted(task.clone()));
        }

        let same_holder = task
            .lease
            .as_ref()
            .map(|l| l.owner == delegate_id && l.epoch == epoch)
            .unwrap_or(false);
        if same_holder && task.status.is_terminal() {
            return Ok(Recorded::Duplicate);
        }

        task.log(
            now,
            format!("rejected stale report from {} (epoch {})", delegate_id.short(), epoch),
        );
        Err(Error::StaleLease {
            task_id,
            presented: epoch,
            current: task.epoch,
        })
    }

    async fn renew_lease(
        &self,
        task_id: TaskId,
        delegate_id: DelegateId,
        epoch: u64,
        now: DateTime<Utc>,
    ) -> Result<Lease> {
        let mut inner = self.inner.lock().await;
        let task = inner.task_mut(task_id)?;
        if !task.is_leased_by(&delegate_id, epoch, now) {
            return Err(Error::StaleLease {
                task_id,
                presented: epoch,
                current: task.epoch,
            });
        }
        let expires_at = now + span(task.timeout);
        let lease = match task.lease.as_mut() {
            Some(lease) => {
                lease.expires_at = expires_at;
                lease.clone()
            }
            None => {
                return Err(Error::StaleLease {
                    task_id,
                    presented: epoch,
                    current: task.epoch,
                })
            }
        };
        task.log(now, format!("lease renewed until {}", expires_at.to_rfc3339()));
        Ok(lease)
    }

    async fn finish(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let mut inner = self.inner.lock().await;
        let task = inner.task_mut(task_id)?;
        if task.status.is_terminal() {
            return Err(Error::InvalidTaskState {
                task_id,
                status: task.status.to_string(),
                expected: "a non-terminal status",
            });
        }
        let sequence = task.sequence;
        task.lease = None;
        task.finish(status, outcome, now);
        let task = task.clone();
        inner.queued.remove(&sequence);
        Ok(task)
    }

    async fn fail_unassigned(
        &self,
        task_id: TaskId,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let mut inner = self.inner.lock().await;
        let task = inner.task_mut(task_id)?;
        if !matches!(task.status, TaskStatus::Queued | TaskStatus::Parked) {
            return Ok(None);
        }
        let sequence = task.sequence;
        task.finish(TaskStatus::Failed, outcome, now);
        let task = task.clone();
        inner.queued.remove(&sequence);
        Ok(Some(task))
    }

    async fn revoke_expired(&self, now: DateTime<Utc>) -> Vec<Revocation> {
        let mut inner = self.inner.lock().await;
        let expired: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Leased
                    && t.lease.as_ref().map(|l| l.is_expired(now)).unwrap_or(false)
            })
            .map(|t| t.id)
            .collect();

        expired
            .into_iter()
            .filter_map(|task_id| {
                let message = match inner.tasks.get(&task_id) {
                    Some(t) => format!("Task timed out after {} attempt(s)", t.attempts),
                    None => return None,
                };
                inner.revoke(
                    task_id,
                    "lease expired",
                    TaskOutcome::failure(ErrorClass::TaskTimeout, message),
                    now,
                )
            })
            .collect()
    }

    async fn revoke_delegate(
        &self,
        delegate_id: DelegateId,
        delegate_name: &str,
        now: DateTime<Utc>,
    ) -> Vec<Revocation> {
        let mut inner = self.inner.lock().await;
        let held: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Leased
                    && t.lease.as_ref().map(|l| l.owner == delegate_id).unwrap_or(false)
            })
            .map(|t| t.id)
            .collect();

        let message = format!(
            "Delegate [{}] disconnected while executing the task",
            delegate_name
        );
        held.into_iter()
            .filter_map(|task_id| {
                inner.revoke(
                    task_id,
                    "lease holder disconnected",
                    TaskOutcome::failure(ErrorClass::RemoteTaskFailure, message.clone()),
                    now,
                )
            })
            .collect()
    }

    async fn mark_unable(
        &self,
        task_id: TaskId,
        delegate_id: DelegateId,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let mut inner = self.inner.lock().await;
        let task = inner.task_mut(task_id)?;
        if task.status.is_terminal() {
            return Err(Error::InvalidTaskState {
                task_id,
                status: task.status.to_string(),
                expected: "a non-terminal status",
            });
        }
        task.unable_delegates.insert(delegate_id);
        task.log(now, format!("delegate {} reported it cannot run this task", delegate_id.short()));

        let holds_lease = task.status == TaskStatus::Leased
            && task.lease.as_ref().map(|l| l.owner == delegate_id).unwrap_or(false);
        if holds_lease {
            // Giving the task back does not count as an attempt.
            task.attempts = task.attempts.saturating_sub(1);
            task.requeue(now, "released by lease holder");
            let (sequence, id) = (task.sequence, task.id);
            let task = task.clone();
            inner.queued.insert(sequence, id);
            return Ok(task);
        }
        Ok(task.clone())
    }

    async fn unpark(&self, task_id: TaskId, now: DateTime<Utc>) -> Result<Task> {
        let mut inner = self.inner.lock().await;
        let task = inner.task_mut(task_id)?;
        if task.status != TaskStatus::Parked {
            return Err(Error::InvalidTaskState {
                task_id,
                status: task.status.to_string(),
                expected: "parked",
            });
        }
        task.status = TaskStatus::Queued;
        task.log(now, "queued from parked");
        let (sequence, id) = (task.sequence, task.id);
        let task = task.clone();
        inner.queued.insert(sequence, id);
        Ok(task)
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.tasks.len();
        inner.tasks.retain(|_, t| !t.finished_by(cutoff));
        before - inner.tasks.len()
    }

    async fn list(&self, account_id: Option<&str>) -> Vec<Task> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| account_id.map(|a| t.account_id == a).unwrap_or(true))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }
}
