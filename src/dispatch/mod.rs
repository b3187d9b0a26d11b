//! Delegate Dispatch Protocol.
//!
//! The server side ([`DispatchService`]) owns the delegate registry and fronts
//! the task store. The delegate side ([`DelegateWorker`]) talks to it through
//! a [`DispatchTransport`], optionally wrapped in a [`RetryingTransport`] for
//! back-off on transient failures.

pub mod backoff;
pub mod handler;
pub mod service;
pub mod transport;
pub mod worker;

use async_trait::async_trait;

use crate::core::ids::TaskId;
use crate::core::task::TaskRequest;
use crate::error::Result;

pub use backoff::FibonacciBackoff;
pub use handler::{HandlerRegistry, TaskHandler};
pub use service::{DispatchService, ReapReport, ReportAck};
pub use transport::{DispatchTransport, RetryingTransport};
pub use worker::{DelegateWorker, WorkerStats};

/// Producer-facing half of the dispatch service.
#[async_trait]
pub trait TaskSubmitter: Send + Sync {
    async fn submit(&self, request: TaskRequest) -> Result<TaskId>;

    /// Withdraw a task that is no longer wanted.
    async fn abort(&self, account_id: &str, task_id: TaskId) -> Result<()>;
}
