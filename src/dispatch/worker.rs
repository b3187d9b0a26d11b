//! Delegate worker loop: register, heartbeat, long-poll, execute, report.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::handler::HandlerRegistry;
use super::service::ReportAck;
use super::transport::DispatchTransport;
use crate::core::delegate::{RegisterAck, RegisterRequest};
use crate::core::ids::DelegateId;
use crate::core::task::{TaskPackage, TaskResponse};
use crate::error::{Error, Result};
use crate::log::LogContext;
use crate::util::bounded;
use crate::{rlog, rlog_debug, rlog_warn};

/// Counters for one worker's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub acquired: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub unable: u64,
    pub duplicates: u64,
    pub rejected_stale: u64,
}

pub struct DelegateWorker {
    id: DelegateId,
    account_id: String,
    name: String,
    capabilities: BTreeSet<String>,
    transport: Arc<dyn DispatchTransport>,
    handlers: HandlerRegistry,
    heartbeat_interval: Duration,
}

impl DelegateWorker {
    pub fn new(
        account_id: &str,
        name: &str,
        transport: Arc<dyn DispatchTransport>,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            id: DelegateId::new(),
            account_id: account_id.to_string(),
            name: name.to_string(),
            capabilities: BTreeSet::new(),
            transport,
            handlers,
            heartbeat_interval: Duration::from_secs(10),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn id(&self) -> DelegateId {
        self.id
    }

    fn ctx(&self) -> LogContext {
        LogContext::account(&self.account_id).with_delegate(self.id)
    }

    pub async fn register(&self) -> Result<RegisterAck> {
        let request = RegisterRequest::new(
            &self.account_id,
            self.id,
            &self.name,
            self.capabilities.iter().cloned(),
        );
        self.transport.register(request).await
    }

    /// Acquire and run at most one task. Returns whether a task was handled.
    pub async fn run_once(&self, stats: &mut WorkerStats) -> Result<bool> {
        let Some(package) = self
            .transport
            .acquire_task(&self.account_id, self.id)
            .await?
        else {
            return Ok(false);
        };
        stats.acquired += 1;
        let ctx = self.ctx().with_task(package.task_id);

        if !self.handlers.handles(package.kind) {
            rlog_debug!("{} cannot run {} tasks, handing back", ctx, package.kind);
            self.transport
                .report_unable(&self.account_id, self.id, package.task_id)
                .await?;
            stats.unable += 1;
            return Ok(true);
        }

        let response = self.execute(&package).await;
        if matches!(response, TaskResponse::Success { .. }) {
            stats.succeeded += 1;
        } else {
            stats.failed += 1;
        }

        let ack = self
            .transport
            .report_result(
                &self.account_id,
                self.id,
                package.task_id,
                package.lease_epoch,
                response,
            )
            .await?;
        match ack {
            ReportAck::Accepted => {}
            ReportAck::Duplicate => stats.duplicates += 1,
            ReportAck::RejectedStale { current_epoch } => {
                rlog_warn!(
                    "{} result dropped, lease epoch {} superseded by {}",
                    ctx,
                    package.lease_epoch,
                    current_epoch
                );
                stats.rejected_stale += 1;
            }
        }
        Ok(true)
    }

    /// Run the handler under the task timeout, renewing the lease at half
    /// that period so the report still lands under a live lease.
    async fn execute(&self, package: &TaskPackage) -> TaskResponse {
        let run = bounded(package.timeout, self.handlers.execute(package));
        tokio::pin!(run);
        let period = (package.timeout / 2).max(Duration::from_millis(10));
        let mut renew = tokio::time::interval_at(Instant::now() + period, period);
        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                _ = renew.tick() => self.renew(package).await,
            }
        };
        match result {
            Ok(response) => response,
            Err(Error::Timeout(after)) => TaskResponse::Error {
                message: format!("Task timed out after {:?}", after),
            },
            Err(e) => TaskResponse::Error {
                message: e.to_string(),
            },
        }
    }

    async fn renew(&self, package: &TaskPackage) {
        let renewed = self
            .transport
            .renew_lease(&self.account_id, self.id, package.task_id, package.lease_epoch)
            .await;
        match renewed {
            Ok(lease) => rlog_debug!(
                "{} lease renewed until {}",
                self.ctx().with_task(package.task_id),
                lease.expires_at
            ),
            Err(e) => rlog_warn!(
                "{} lease renewal failed: {}",
                self.ctx().with_task(package.task_id),
                e
            ),
        }
    }

    /// Register, then serve tasks until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<WorkerStats> {
        self.register().await?;
        rlog!("{} worker started as {}", self.ctx(), self.name);

        let heartbeat_stop = cancel.child_token();
        let heartbeat = {
            let transport = Arc::clone(&self.transport);
            let account_id = self.account_id.clone();
            let id = self.id;
            let interval = self.heartbeat_interval;
            let stop = heartbeat_stop.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = transport.heartbeat(&account_id, id).await {
                                rlog_warn!("heartbeat from {} failed: {}", id.short(), e);
                            }
                        }
                    }
                }
            })
        };

        let mut stats = WorkerStats::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.run_once(&mut stats) => {
                    if let Err(e) = result {
                        rlog_warn!("{} worker iteration failed: {}", self.ctx(), e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.heartbeat_interval) => {}
                        }
                    }
                }
            }
        }

        heartbeat_stop.cancel();
        let _ = heartbeat.await;
        rlog_debug!("{} worker stopped: {:?}", self.ctx(), stats);
        Ok(stats)
    }
}
