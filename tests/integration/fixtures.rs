//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A dispatch service on a manual clock with its notification feed
//! - A stub delegate that answers queue/poll rounds from a script
//! - A chain harness running real delegate workers

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use relay::chain::{LogSink, TaskChainController};
use relay::config::{BackoffConfig, ChainConfig, DispatchConfig};
use relay::core::clock::ManualClock;
use relay::core::delegate::RegisterRequest;
use relay::core::ids::DelegateId;
use relay::core::task::{TaskKind, TaskNotification, TaskPackage, TaskResponse};
use relay::dispatch::{
    DelegateWorker, DispatchService, HandlerRegistry, RetryingTransport, TaskHandler, WorkerStats,
};
use relay::util::{bounded, join};
use relay::Result;

pub const ACCOUNT: &str = "acme";

/// Short polls and a long heartbeat window, so only lease expiry moves
/// tasks unless a test says otherwise.
pub fn dispatch_config() -> DispatchConfig {
    DispatchConfig {
        heartbeat_timeout_secs: 600,
        acquire_poll_timeout_ms: 50,
        default_task_timeout_secs: 60,
        max_task_attempts: 3,
        reaper_interval_ms: 20,
        finished_task_retention_secs: 3_600,
    }
}

/// A dispatch service whose lease arithmetic runs on a manual clock.
pub struct DispatchHarness {
    pub service: Arc<DispatchService>,
    pub clock: Arc<ManualClock>,
    pub notifications: mpsc::Receiver<TaskNotification>,
}

impl DispatchHarness {
    pub fn new(config: DispatchConfig) -> Self {
        let clock = Arc::new(ManualClock::starting_now());
        let (tx, notifications) = mpsc::channel(256);
        let service = DispatchService::new(config)
            .with_clock(clock.clone())
            .with_notifier(tx);
        Self {
            service: Arc::new(service),
            clock,
            notifications,
        }
    }

    pub async fn register(&self, name: &str, capabilities: &[&str]) -> DelegateId {
        let id = DelegateId::new();
        self.service
            .register(RegisterRequest::new(
                ACCOUNT,
                id,
                name,
                capabilities.iter().copied(),
            ))
            .await
            .expect("register delegate");
        id
    }

    pub async fn next_notification(&mut self) -> TaskNotification {
        let next = bounded(Duration::from_secs(5), async {
            Ok(self.notifications.recv().await)
        })
        .await
        .expect("notification within 5s");
        next.expect("notifier still open")
    }
}

/// Stub delegate for queue-then-poll jobs.
///
/// The queue round answers with `handle`; each poll answers `running`
/// until `running_polls` are used up, then `final_state`.
pub struct StubJobs {
    handle: String,
    running_polls: u32,
    final_state: &'static str,
    polls: AtomicU32,
    fail_polls: bool,
}

impl StubJobs {
    pub fn new(handle: &str, running_polls: u32, final_state: &'static str) -> Self {
        Self {
            handle: handle.to_string(),
            running_polls,
            final_state,
            polls: AtomicU32::new(0),
            fail_polls: false,
        }
    }

    /// Every poll round reports an application error instead of a state.
    pub fn failing_polls(mut self) -> Self {
        self.fail_polls = true;
        self
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for StubJobs {
    async fn run(&self, package: &TaskPackage) -> Result<TaskResponse> {
        let body = match package.kind {
            TaskKind::JobQueue => json!({ "handle": self.handle }),
            TaskKind::JobPoll => {
                let n = self.polls.fetch_add(1, Ordering::SeqCst);
                if self.fail_polls {
                    return Ok(TaskResponse::Error {
                        message: "build server unreachable".to_string(),
                    });
                }
                let state = if n < self.running_polls {
                    "running"
                } else {
                    self.final_state
                };
                json!({ "state": state, "output": { "polls": n + 1 } })
            }
            other => panic!("stub cannot run {} tasks", other),
        };
        Ok(TaskResponse::Success {
            data: serde_json::to_vec(&body)?,
        })
    }
}

/// Log sink that records stream boundaries.
#[derive(Default)]
pub struct RecordingSink {
    events: StdMutex<Vec<String>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogSink for RecordingSink {
    async fn open_stream(&self, unit: &str) -> Result<()> {
        self.events.lock().unwrap().push(format!("open {}", unit));
        Ok(())
    }

    async fn close_stream(&self, unit: &str) -> Result<()> {
        self.events.lock().unwrap().push(format!("close {}", unit));
        Ok(())
    }
}

/// A real-clock dispatch service, a chain controller fed by its
/// notifications, and `workers` delegates running `handler`.
pub struct ChainHarness {
    pub service: Arc<DispatchService>,
    pub controller: Arc<TaskChainController>,
    pub sink: Arc<RecordingSink>,
    cancel: CancellationToken,
    driver: JoinHandle<()>,
    workers: Vec<JoinHandle<Result<WorkerStats>>>,
}

impl ChainHarness {
    pub fn start(handler: Arc<dyn TaskHandler>, workers: usize, max_rounds: u32) -> Self {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(256);
        let service = Arc::new(DispatchService::new(dispatch_config()).with_notifier(tx));
        let sink = Arc::new(RecordingSink::default());
        let controller = Arc::new(TaskChainController::new(
            service.clone(),
            sink.clone(),
            ChainConfig { max_rounds },
        ));
        let driver = controller.spawn(rx, cancel.child_token());

        let workers = (0..workers)
            .map(|i| {
                let transport = Arc::new(RetryingTransport::new(
                    service.clone(),
                    BackoffConfig::default(),
                ));
                let handlers = HandlerRegistry::new()
                    .register(TaskKind::JobQueue, handler.clone())
                    .register(TaskKind::JobPoll, handler.clone());
                let worker =
                    DelegateWorker::new(ACCOUNT, &format!("stub-{}", i), transport, handlers)
                        .with_capabilities(["jobs"])
                        .with_heartbeat_interval(Duration::from_millis(100));
                let cancel = cancel.clone();
                tokio::spawn(async move { worker.run(cancel).await })
            })
            .collect();

        Self {
            service,
            controller,
            sink,
            cancel,
            driver,
            workers,
        }
    }

    pub async fn shutdown(self) -> Vec<WorkerStats> {
        self.cancel.cancel();
        let mut stats = Vec::new();
        for worker in self.workers {
            stats.push(join(worker).await.expect("worker exits cleanly"));
        }
        let _ = self.driver.await;
        stats
    }
}
