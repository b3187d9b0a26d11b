//! Delegate-facing RPC surface.
//!
//! [`DispatchTransport`] is what a delegate worker talks to. The in-process
//! [`DispatchService`] implements it directly; a networked client would
//! implement it over the wire. [`RetryingTransport`] layers Fibonacci
//! back-off over any transport for transient failures.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::backoff::FibonacciBackoff;
use super::service::{DispatchService, ReportAck};
use crate::config::BackoffConfig;
use crate::core::delegate::{RegisterAck, RegisterRequest};
use crate::core::ids::{DelegateId, TaskId};
use crate::core::task::{Lease, TaskPackage, TaskResponse};
use crate::error::{ErrorClass, Result};
use crate::{rlog_debug, rlog_warn};

#[async_trait]
pub trait DispatchTransport: Send + Sync {
    async fn register(&self, request: RegisterRequest) -> Result<RegisterAck>;

    async fn heartbeat(&self, account_id: &str, delegate_id: DelegateId) -> Result<RegisterAck>;

    async fn acquire_task(
        &self,
        account_id: &str,
        delegate_id: DelegateId,
    ) -> Result<Option<TaskPackage>>;

    async fn report_result(
        &self,
        account_id: &str,
        delegate_id: DelegateId,
        task_id: TaskId,
        lease_epoch: u64,
        response: TaskResponse,
    ) -> Result<ReportAck>;

    async fn renew_lease(
        &self,
        account_id: &str,
        delegate_id: DelegateId,
        task_id: TaskId,
        lease_epoch: u64,
    ) -> Result<Lease>;

    async fn report_unable(
        &self,
        account_id: &str,
        delegate_id: DelegateId,
        task_id: TaskId,
    ) -> Result<()>;

    async fn fail_if_all_delegates_failed(&self, account_id: &str, task_id: TaskId)
        -> Result<bool>;
}

#[async_trait]
impl DispatchTransport for DispatchService {
    async fn register(&self, request: RegisterRequest) -> Result<RegisterAck> {
        DispatchService::register(self, request).await
    }

    async fn heartbeat(&self, account_id: &str, delegate_id: DelegateId) -> Result<RegisterAck> {
        DispatchService::heartbeat(self, account_id, delegate_id).await
    }

    async fn acquire_task(
        &self,
        account_id: &str,
        delegate_id: DelegateId,
    ) -> Result<Option<TaskPackage>> {
        DispatchService::acquire_task(self, account_id, delegate_id).await
    }

    async fn report_result(
        &self,
        account_id: &str,
        delegate_id: DelegateId,
        task_id: TaskId,
        lease_epoch: u64,
        response: TaskResponse,
    ) -> Result<ReportAck> {
        DispatchService::report_result(
            self,
            account_id,
            delegate_id,
            task_id,
            lease_epoch,
            response,
        )
        .await
    }

    async fn renew_lease(
        &self,
        account_id: &str,
        delegate_id: DelegateId,
        task_id: TaskId,
        lease_epoch: u64,
    ) -> Result<Lease> {
        DispatchService::renew_lease(self, account_id, delegate_id, task_id, lease_epoch).await
    }

    async fn report_unable(
        &self,
        account_id: &str,
        delegate_id: DelegateId,
        task_id: TaskId,
    ) -> Result<()> {
        DispatchService::report_unable(self, account_id, delegate_id, task_id).await
    }

    async fn fail_if_all_delegates_failed(
        &self,
        account_id: &str,
        task_id: TaskId,
    ) -> Result<bool> {
        DispatchService::fail_if_all_delegates_failed(self, account_id, task_id).await
    }
}

/// Retries transient transport errors with Fibonacci back-off.
///
/// Every server call is idempotent (results are keyed by task and lease
/// epoch), so replaying a call whose reply was lost is safe. Errors of any
/// other class are returned immediately.
pub struct RetryingTransport {
    inner: Arc<dyn DispatchTransport>,
    backoff: BackoffConfig,
}

impl RetryingTransport {
    pub fn new(inner: Arc<dyn DispatchTransport>, backoff: BackoffConfig) -> Self {
        Self { inner, backoff }
    }

    async fn retry<T, F, Fut>(&self, call: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut delays = FibonacciBackoff::from_config(&self.backoff);
        let mut attempt = 1u32;
        loop {
            match op().await {
                Err(e) if e.class() == ErrorClass::TransientTransport => match delays.next() {
                    Some(delay) => {
                        rlog_debug!(
                            "{} failed (attempt {}): {}, retrying in {:?}",
                            call,
                            attempt,
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        rlog_warn!("{} failed after {} attempts: {}", call, attempt, e);
                        return Err(e);
                    }
                },
                other => return other,
            }
        }
    }
}

#[async_trait]
impl DispatchTransport for RetryingTransport {
    async fn register(&self, request: RegisterRequest) -> Result<RegisterAck> {
        let inner = &self.inner;
        self.retry("register", move || inner.register(request.clone()))
            .await
    }

    async fn heartbeat(&self, account_id: &str, delegate_id: DelegateId) -> Result<RegisterAck> {
        let inner = &self.inner;
        self.retry("heartbeat", move || inner.heartbeat(account_id, delegate_id))
            .await
    }

    async fn acquire_task(
        &self,
        account_id: &str,
        delegate_id: DelegateId,
    ) -> Result<Option<TaskPackage>> {
        let inner = &self.inner;
        self.retry("acquire_task", move || {
            inner.acquire_task(account_id, delegate_id)
        })
        .await
    }

    async fn report_result(
        &self,
        account_id: &str,
        delegate_id: DelegateId,
        task_id: TaskId,
        lease_epoch: u64,
        response: TaskResponse,
    ) -> Result<ReportAck> {
        let inner = &self.inner;
        self.retry("report_result", move || {
            inner.report_result(account_id, delegate_id, task_id, lease_epoch, response.clone())
        })
        .await
    }

    async fn renew_lease(
        &self,
        account_id: &str,
        delegate_id: DelegateId,
        task_id: TaskId,
        lease_epoch: u64,
    ) -> Result<Lease> {
        let inner = &self.inner;
        self.retry("renew_lease", move || {
            inner.renew_lease(account_id, delegate_id, task_id, lease_epoch)
        })
        .await
    }

    async fn report_unable(
        &self,
        account_id: &str,
        delegate_id: DelegateId,
        task_id: TaskId,
    ) -> Result<()> {
        let inner = &self.inner;
        self.retry("report_unable", move || {
            inner.report_unable(account_id, delegate_id, task_id)
        })
        .await
    }

    async fn fail_if_all_delegates_failed(
        &self,
        account_id: &str,
        task_id: TaskId,
    ) -> Result<bool> {
        let inner = &self.inner;
        self.retry("fail_if_all_delegates_failed", move || {
            inner.fail_if_all_delegates_failed(account_id, task_id)
        })
        .await
    }
}
