//! Server side of the dispatch protocol.
//!
//! Delegates pull work: they register, heartbeat, long-poll `acquire_task`,
//! and report with the lease epoch they were handed. Producers submit tasks
//! and hear back through a notification channel or `wait_for_result`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use super::TaskSubmitter;
use crate::config::DispatchConfig;
use crate::core::clock::{span, Clock, SystemClock};
use crate::core::delegate::{Delegate, DelegateStatus, RegisterAck, RegisterRequest};
use crate::core::ids::{DelegateId, TaskId};
use crate::core::task::{
    Lease, Task, TaskNotification, TaskOutcome, TaskPackage, TaskRequest, TaskResponse,
    TaskStatus,
};
use crate::error::{Error, ErrorClass, Result};
use crate::log::LogContext;
use crate::queue::{MemoryTaskStore, Recorded, Revocation, TaskStore};
use crate::util::bounded;
use crate::{rlog, rlog_debug, rlog_warn};

/// Server reply to `report_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportAck {
    Accepted,
    /// Already recorded under the same lease; nothing changed.
    Duplicate,
    /// The presented epoch no longer owns the task.
    RejectedStale { current_epoch: u64 },
}

/// What one reaper pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub dead_delegates: Vec<DelegateId>,
    pub requeued: usize,
    pub exhausted: usize,
    /// Finished tasks dropped after their retention window.
    pub purged: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.dead_delegates.is_empty()
            && self.requeued == 0
            && self.exhausted == 0
            && self.purged == 0
    }
}

pub struct DispatchService {
    store: Arc<dyn TaskStore>,
    delegates: RwLock<HashMap<DelegateId, Delegate>>,
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    /// Wakes long-polling delegates when something enters the queue.
    work_available: Notify,
    notifier: Option<mpsc::Sender<TaskNotification>>,
    waiters: Mutex<HashMap<TaskId, Vec<oneshot::Sender<TaskOutcome>>>>,
}

impl DispatchService {
    /// Create a service backed by an in-memory store and the system clock.
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            store: Arc::new(MemoryTaskStore::new()),
            delegates: RwLock::new(HashMap::new()),
            config,
            clock: Arc::new(SystemClock),
            work_available: Notify::new(),
            notifier: None,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Deliver a [`TaskNotification`] on `tx` whenever a task becomes terminal.
    pub fn with_notifier(mut self, tx: mpsc::Sender<TaskNotification>) -> Self {
        self.notifier = Some(tx);
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    // ---- producer API ----

    /// Queue a new task (or park it, if the request says so).
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskId> {
        if request.account_id.is_empty() {
            return Err(Error::Validation("task request has no account".to_string()));
        }
        let task = Task::from_request(
            request,
            self.config.default_task_timeout(),
            self.config.max_task_attempts,
            self.clock.now(),
        );
        let task = self.store.insert(task).await?;
        let ctx = LogContext::account(&task.account_id).with_task(task.id);
        rlog_debug!(
            "{} submitted {} task ({}, timeout {:?})",
            ctx,
            task.kind,
            task.status,
            task.timeout
        );
        if task.status == TaskStatus::Queued {
            self.work_available.notify_waiters();
        }
        Ok(task.id)
    }

    pub async fn queue_parked_task(&self, account_id: &str, task_id: TaskId) -> Result<()> {
        self.task(account_id, task_id).await?;
        self.store.unpark(task_id, self.clock.now()).await?;
        rlog_debug!("{} parked task queued", LogContext::account(account_id).with_task(task_id));
        self.work_available.notify_waiters();
        Ok(())
    }

    /// End a queued or leased task at the producer's request.
    pub async fn abort_task(&self, account_id: &str, task_id: TaskId) -> Result<Task> {
        self.task(account_id, task_id).await?;
        let task = self
            .store
            .finish(
                task_id,
                TaskStatus::Aborted,
                TaskOutcome::failure(ErrorClass::Internal, "Task aborted"),
                self.clock.now(),
            )
            .await?;
        rlog!("{} task aborted", LogContext::account(account_id).with_task(task_id));
        self.publish(&task).await;
        Ok(task)
    }

    /// End a task whose producer stopped waiting for it.
    pub async fn expire_task(&self, account_id: &str, task_id: TaskId) -> Result<Task> {
        self.task(account_id, task_id).await?;
        let message = format!(
            "Task expired. Please check the delegate logs for task {}",
            task_id
        );
        let task = self
            .store
            .finish(
                task_id,
                TaskStatus::Expired,
                TaskOutcome::failure(ErrorClass::TaskTimeout, message),
                self.clock.now(),
            )
            .await?;
        rlog!("{} task expired", LogContext::account(account_id).with_task(task_id));
        self.publish(&task).await;
        Ok(task)
    }

    /// Block until the task is terminal or `timeout` passes.
    pub async fn wait_for_result(
        &self,
        account_id: &str,
        task_id: TaskId,
        timeout: Duration,
    ) -> Result<TaskOutcome> {
        let rx = {
            // Registered under the waiters lock so a concurrent publish
            // cannot slip between the status check and the registration.
            let mut waiters = self.waiters.lock().await;
            let task = self.task(account_id, task_id).await?;
            if let Some(outcome) = task.outcome.filter(|_| task.status.is_terminal()) {
                return Ok(outcome);
            }
            let (tx, rx) = oneshot::channel();
            waiters.entry(task_id).or_default().push(tx);
            rx
        };
        let result = bounded(timeout, async {
            rx.await.map_err(|_| Error::ChannelClosed("task result"))
        })
        .await;
        if result.is_err() {
            self.forget_waiters(task_id).await;
        }
        result
    }

    /// Drop senders whose receiver gave up.
    async fn forget_waiters(&self, task_id: TaskId) {
        let mut waiters = self.waiters.lock().await;
        if let Some(senders) = waiters.get_mut(&task_id) {
            senders.retain(|tx| !tx.is_closed());
            if senders.is_empty() {
                waiters.remove(&task_id);
            }
        }
    }

    /// Look up a task, treating another account's task as missing.
    pub async fn task(&self, account_id: &str, task_id: TaskId) -> Result<Task> {
        match self.store.get(task_id).await {
            Some(task) if task.account_id == account_id => Ok(task),
            _ => Err(Error::TaskNotFound(task_id)),
        }
    }

    pub async fn tasks(&self, account_id: &str) -> Vec<Task> {
        self.store.list(Some(account_id)).await
    }

    // ---- delegate API ----

    /// Register or re-register a delegate. Re-registration refreshes its
    /// capabilities and starts a new connection epoch.
    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterAck> {
        if request.account_id.is_empty() {
            return Err(Error::Validation("delegate has no account".to_string()));
        }
        let now = self.clock.now();
        let ctx = LogContext::account(&request.account_id).with_delegate(request.delegate_id);
        let mut delegates = self.delegates.write().await;
        let delegate = match delegates.get_mut(&request.delegate_id) {
            Some(existing) if existing.account_id != request.account_id => {
                return Err(Error::Validation(format!(
                    "delegate {} belongs to another account",
                    request.delegate_id
                )));
            }
            Some(existing) => {
                existing.name = request.name.clone();
                existing.capabilities = request.capabilities.clone();
                existing.status = DelegateStatus::Enabled;
                existing.last_heartbeat = now;
                existing.connection_epoch += 1;
                rlog_debug!("{} re-registered", ctx);
                existing.clone()
            }
            None => {
                let delegate = Delegate::new(&request, now);
                rlog!(
                    "{} registered with capabilities {:?}",
                    ctx,
                    delegate.capabilities
                );
                delegates.insert(delegate.id, delegate.clone());
                delegate
            }
        };
        Ok(RegisterAck {
            delegate_id: delegate.id,
            connection_epoch: delegate.connection_epoch,
        })
    }

    /// Refresh liveness. A disconnected delegate that heartbeats again is
    /// re-enabled under a new connection epoch.
    pub async fn heartbeat(
        &self,
        account_id: &str,
        delegate_id: DelegateId,
    ) -> Result<RegisterAck> {
        let now = self.clock.now();
        let mut delegates = self.delegates.write().await;
        let delegate = delegates
            .get_mut(&delegate_id)
            .filter(|d| d.account_id == account_id)
            .ok_or(Error::DelegateNotFound(delegate_id))?;
        delegate.last_heartbeat = now;
        if delegate.status == DelegateStatus::Disconnected {
            delegate.status = DelegateStatus::Enabled;
            delegate.connection_epoch += 1;
            rlog!(
                "{} reconnected (connection epoch {})",
                LogContext::account(account_id).with_delegate(delegate_id),
                delegate.connection_epoch
            );
        }
        Ok(RegisterAck {
            delegate_id,
            connection_epoch: delegate.connection_epoch,
        })
    }

    /// Lease the oldest eligible task, waiting up to the configured poll
    /// timeout for one to show up.
    pub async fn acquire_task(
        &self,
        account_id: &str,
        delegate_id: DelegateId,
    ) -> Result<Option<TaskPackage>> {
        let deadline = Instant::now() + self.config.acquire_poll_timeout();
        loop {
            let notified = self.work_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let delegate = self.enabled_delegate(account_id, delegate_id).await?;
            if let Some(task) = self.store.claim_next(&delegate, self.clock.now()).await {
                rlog_debug!(
                    "{} acquired {} task (epoch {})",
                    LogContext::account(account_id)
                        .with_task(task.id)
                        .with_delegate(delegate_id),
                    task.kind,
                    task.epoch
                );
                return Ok(task.package());
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Record a delegate's result, fenced by the lease epoch it was handed.
    pub async fn report_result(
        &self,
        account_id: &str,
        delegate_id: DelegateId,
        task_id: TaskId,
        lease_epoch: u64,
        response: TaskResponse,
    ) -> Result<ReportAck> {
        self.task(account_id, task_id).await?;
        let ctx = LogContext::account(account_id)
            .with_task(task_id)
            .with_delegate(delegate_id);
        let recorded = self
            .store
            .record_result(
                task_id,
                delegate_id,
                lease_epoch,
                response.into(),
                self.clock.now(),
            )
            .await;
        match recorded {
            Ok(Recorded::Accepted(task)) => {
                rlog_debug!("{} result accepted ({})", ctx, task.status);
                self.publish(&task).await;
                Ok(ReportAck::Accepted)
            }
            Ok(Recorded::Duplicate) => {
                rlog_debug!("{} duplicate result ignored", ctx);
                Ok(ReportAck::Duplicate)
            }
            Err(Error::StaleLease {
                presented, current, ..
            }) => {
                rlog_warn!(
                    "{} rejected stale result (epoch {}, current {})",
                    ctx,
                    presented,
                    current
                );
                Ok(ReportAck::RejectedStale {
                    current_epoch: current,
                })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn renew_lease(
        &self,
        account_id: &str,
        delegate_id: DelegateId,
        task_id: TaskId,
        lease_epoch: u64,
    ) -> Result<Lease> {
        self.task(account_id, task_id).await?;
        self.store
            .renew_lease(task_id, delegate_id, lease_epoch, self.clock.now())
            .await
    }

    /// A delegate cannot run this task. If it held the lease the task goes
    /// back to the queue for somebody else.
    pub async fn report_unable(
        &self,
        account_id: &str,
        delegate_id: DelegateId,
        task_id: TaskId,
    ) -> Result<()> {
        self.task(account_id, task_id).await?;
        let task = self
            .store
            .mark_unable(task_id, delegate_id, self.clock.now())
            .await?;
        rlog_debug!(
            "{} reported unable",
            LogContext::account(account_id)
                .with_task(task_id)
                .with_delegate(delegate_id)
        );
        if task.status == TaskStatus::Queued {
            self.work_available.notify_waiters();
        }
        Ok(())
    }

    /// Fail an unassigned task once every connected delegate able to match
    /// its selectors has reported it cannot run it.
    ///
    /// Returns `false` while the task is assigned, finished, still waiting
    /// on its first verdict, or some eligible delegate has not yet given up.
    pub async fn fail_if_all_delegates_failed(
        &self,
        account_id: &str,
        task_id: TaskId,
    ) -> Result<bool> {
        let task = self.task(account_id, task_id).await?;
        let ctx = LogContext::account(account_id).with_task(task_id);
        if !matches!(task.status, TaskStatus::Queued | TaskStatus::Parked) {
            rlog_debug!("{} already assigned or finished", ctx);
            return Ok(false);
        }
        if task.unable_delegates.is_empty() {
            rlog_debug!("{} no delegate has reported yet", ctx);
            return Ok(false);
        }

        let now = self.clock.now();
        let heartbeat_timeout = span(self.config.heartbeat_timeout());
        let (remaining, tested) = {
            let delegates = self.delegates.read().await;
            let remaining: Vec<String> = delegates
                .values()
                .filter(|d| {
                    d.account_id == account_id
                        && d.is_enabled()
                        && d.is_alive(now, heartbeat_timeout)
                        && d.matches(&task.selectors)
                        && !task.unable_delegates.contains(&d.id)
                })
                .map(Delegate::display_name)
                .collect();
            let tested: Vec<String> = task
                .unable_delegates
                .iter()
                .map(|id| {
                    delegates
                        .get(id)
                        .map(Delegate::display_name)
                        .unwrap_or_else(|| id.to_string())
                })
                .collect();
            (remaining, tested)
        };

        if !remaining.is_empty() {
            rlog_debug!("{} waiting on delegates {:?}", ctx, remaining);
            return Ok(false);
        }

        let selectors: Vec<&str> = task.selectors.iter().map(String::as_str).collect();
        let message = format!(
            "No eligible delegates could perform the required capabilities for this task: [ {} ]\n  \
             -  The capabilities were tested by the following delegates: [ {} ]\n  \
             -  Other delegates (if any) may have been offline or were not eligible due to tag or scope restrictions.",
            selectors.join(", "),
            tested.join(", ")
        );
        let outcome = TaskOutcome::failure(ErrorClass::DelegateExhaustion, message);
        match self.store.fail_unassigned(task_id, outcome, now).await? {
            Some(task) => {
                rlog_warn!("{} failed: no eligible delegate left", ctx);
                self.publish(&task).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn delegate(&self, delegate_id: DelegateId) -> Option<Delegate> {
        self.delegates.read().await.get(&delegate_id).cloned()
    }

    // ---- lease maintenance ----

    /// Mark silent delegates disconnected, revoke leases that ran out, and
    /// drop tasks that finished longer than the retention window ago.
    pub async fn reap(&self) -> ReapReport {
        let now = self.clock.now();
        let heartbeat_timeout = span(self.config.heartbeat_timeout());
        let dead: Vec<(DelegateId, String, String)> = {
            let mut delegates = self.delegates.write().await;
            delegates
                .values_mut()
                .filter(|d| d.is_enabled() && !d.is_alive(now, heartbeat_timeout))
                .map(|d| {
                    d.status = DelegateStatus::Disconnected;
                    (d.id, d.account_id.clone(), d.display_name())
                })
                .collect()
        };

        let mut revocations = Vec::new();
        for (delegate_id, account_id, name) in &dead {
            rlog_warn!(
                "{} missed its heartbeat window, marking disconnected",
                LogContext::account(account_id).with_delegate(*delegate_id)
            );
            revocations.extend(self.store.revoke_delegate(*delegate_id, name, now).await);
        }
        revocations.extend(self.store.revoke_expired(now).await);

        let mut report = ReapReport {
            dead_delegates: dead.into_iter().map(|(id, _, _)| id).collect(),
            ..Default::default()
        };
        for revocation in &revocations {
            match revocation {
                Revocation::Requeued(_) => report.requeued += 1,
                Revocation::Exhausted(task) => {
                    report.exhausted += 1;
                    self.publish(task).await;
                }
            }
        }
        if report.requeued > 0 {
            self.work_available.notify_waiters();
        }
        let cutoff = now - span(self.config.finished_task_retention());
        report.purged = self.store.purge_finished(cutoff).await;
        if !report.is_empty() {
            rlog_debug!(
                "reaper: {} dead delegate(s), {} requeued, {} exhausted, {} purged",
                report.dead_delegates.len(),
                report.requeued,
                report.exhausted,
                report.purged
            );
        }
        report
    }

    /// Run [`reap`](Self::reap) every `reaper_interval` until cancelled.
    pub fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.config.reaper_interval());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        service.reap().await;
                    }
                }
            }
            rlog_debug!("reaper stopped");
        })
    }

    async fn enabled_delegate(
        &self,
        account_id: &str,
        delegate_id: DelegateId,
    ) -> Result<Delegate> {
        let delegates = self.delegates.read().await;
        let delegate = delegates
            .get(&delegate_id)
            .filter(|d| d.account_id == account_id)
            .ok_or(Error::DelegateNotFound(delegate_id))?;
        if !delegate.is_enabled() {
            return Err(Error::DelegateNotEnabled(delegate_id));
        }
        Ok(delegate.clone())
    }

    /// Hand a terminal task to anyone waiting on it.
    async fn publish(&self, task: &Task) {
        let Some(notification) = TaskNotification::from_task(task) else {
            return;
        };
        if let Some(senders) = self.waiters.lock().await.remove(&task.id) {
            for tx in senders {
                let _ = tx.send(notification.outcome.clone());
            }
        }
        if let Some(tx) = &self.notifier {
            let _ = tx.send(notification).await;
        }
    }
}

#[async_trait]
impl TaskSubmitter for DispatchService {
    async fn submit(&self, request: TaskRequest) -> Result<TaskId> {
        DispatchService::submit(self, request).await
    }

    async fn abort(&self, account_id: &str, task_id: TaskId) -> Result<()> {
        match self.abort_task(account_id, task_id).await {
            Ok(_) => Ok(()),
            // Already finished; nothing left to withdraw.
            Err(Error::InvalidTaskState { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
