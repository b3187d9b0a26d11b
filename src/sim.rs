//! In-process simulation: a dispatch service, a pool of delegate workers, a
//! set of queue-then-poll steps competing for a capacity-limited restraint,
//! and the governor deciding retries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::chain::{FileLogSink, JobState, QueueThenPoll, StepContext, TaskChainController};
use crate::config::Config;
use crate::core::task::{TaskKind, TaskPackage, TaskResponse};
use crate::dispatch::{
    DelegateWorker, DispatchService, HandlerRegistry, RetryingTransport, TaskHandler, WorkerStats,
};
use crate::error::{Error, Result};
use crate::governor::{Decision, Governor};
use crate::restraint::{AcquireRequest, ResourceRestraint, RestraintEngine};
use crate::util::{bounded, join};
use crate::{rlog, rlog_debug, rlog_warn};

const ACCOUNT: &str = "sim";
const RESTRAINT: &str = "sim-slots";
const SELECTOR: &str = "jobs";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub delegates: usize,
    pub steps: usize,
    pub capacity: u32,
    /// Polls each external job answers with `running` before it finishes.
    pub polls_per_job: u32,
    /// Every n-th step fails its first job, exercising the retry path. Zero
    /// disables injected failures.
    pub fail_every: usize,
    pub poll_interval_ms: u64,
    pub deadline_secs: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            delegates: 4,
            steps: 8,
            capacity: 2,
            polls_per_job: 2,
            fail_every: 3,
            poll_interval_ms: 1_000,
            deadline_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationReport {
    pub steps: usize,
    pub succeeded: usize,
    pub aborted: usize,
    pub retries: usize,
    pub tasks_dispatched: u64,
    pub capacity: u32,
    pub peak_usage: u32,
    pub interrupts: usize,
    pub workers: Vec<WorkerStats>,
}

struct Job {
    remaining: u32,
    fails: bool,
}

/// Stands in for an external build system: `JobQueue` hands out handles,
/// `JobPoll` reports progress until the job finishes.
pub struct ExternalJobSimulator {
    polls_per_job: u32,
    jobs: Mutex<HashMap<String, Job>>,
    next_job: AtomicU64,
    handled: AtomicU64,
}

impl ExternalJobSimulator {
    pub fn new(polls_per_job: u32) -> Self {
        Self {
            polls_per_job,
            jobs: Mutex::new(HashMap::new()),
            next_job: AtomicU64::new(1),
            handled: AtomicU64::new(0),
        }
    }

    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::SeqCst)
    }

    async fn queue(&self, payload: &[u8]) -> Result<TaskResponse> {
        let params: Value = serde_json::from_slice(payload)?;
        let handle = format!("job-{}", self.next_job.fetch_add(1, Ordering::SeqCst));
        let job = Job {
            remaining: self.polls_per_job,
            fails: params["fail"].as_bool().unwrap_or(false),
        };
        self.jobs.lock().await.insert(handle.clone(), job);
        Ok(TaskResponse::Success {
            data: serde_json::to_vec(&json!({ "handle": handle }))?,
        })
    }

    async fn poll(&self, payload: &[u8]) -> Result<TaskResponse> {
        let params: Value = serde_json::from_slice(payload)?;
        let handle = params["handle"].as_str().unwrap_or_default();
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(handle) else {
            return Ok(TaskResponse::Error {
                message: format!("unknown job handle {:?}", handle),
            });
        };
        let state = if job.remaining > 0 {
            job.remaining -= 1;
            JobState::Running
        } else if job.fails {
            JobState::Failed
        } else {
            JobState::Succeeded
        };
        let output = match state {
            JobState::Succeeded => json!({ "artifact": format!("{}.tar.gz", handle) }),
            _ => Value::Null,
        };
        Ok(TaskResponse::Success {
            data: serde_json::to_vec(&json!({ "state": state, "output": output }))?,
        })
    }
}

#[async_trait]
impl TaskHandler for ExternalJobSimulator {
    async fn run(&self, package: &TaskPackage) -> Result<TaskResponse> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        match package.kind {
            TaskKind::JobQueue => self.queue(&package.payload).await,
            TaskKind::JobPoll => self.poll(&package.payload).await,
            other => Err(Error::Validation(format!("job simulator cannot run {}", other))),
        }
    }
}

struct Harness {
    controller: Arc<TaskChainController>,
    engine: Arc<RestraintEngine>,
    governor: Arc<Governor>,
    step: Arc<QueueThenPoll>,
    peak: AtomicU32,
}

#[derive(Default)]
struct StepReport {
    succeeded: bool,
    retries: usize,
}

impl Harness {
    /// Drive one logical step to a terminal decision, following retries.
    async fn run_step(&self, index: usize, inject_failure: bool) -> Result<StepReport> {
        let step_id = format!("step-{}", index);
        let mut execution = self
            .governor
            .create_execution(&step_id, ACCOUNT, json!({ "index": index }), None)
            .await;
        let mut report = StepReport::default();

        loop {
            let request =
                AcquireRequest::new(RESTRAINT, "pool", &step_id, 1, execution.scope.clone());
            self.engine.acquire_and_wait(request, None).await?;
            let usage = self.engine.usage(RESTRAINT, "pool").await;
            self.peak.fetch_max(usage, Ordering::SeqCst);

            let mut parameters = execution.parameters.clone();
            parameters["fail"] = json!(inject_failure && execution.attempt == 1);
            let ctx = StepContext::new(execution.id, ACCOUNT, &step_id, parameters);
            let pending = self.controller.start(self.step.clone(), ctx).await?;
            let outcome = pending.outcome().await;

            match self.governor.on_step_outcome(execution.id, &outcome).await? {
                Decision::Completed { .. } => {
                    report.succeeded = true;
                    return Ok(report);
                }
                Decision::Retry { execution: next, .. } => {
                    report.retries += 1;
                    execution = next;
                }
                Decision::Abort { interrupt, .. } => {
                    rlog_warn!("{} aborted: {}", step_id, interrupt.reason);
                    return Ok(report);
                }
            }
        }
    }
}

/// Run the simulation to completion and summarize it.
pub async fn run(config: &Config, sim: &SimulationConfig) -> Result<SimulationReport> {
    if sim.delegates == 0 || sim.capacity == 0 {
        return Err(Error::Validation(
            "simulation needs at least one delegate and a positive capacity".to_string(),
        ));
    }
    rlog!(
        "simulation starting: {} delegates, {} steps, capacity {}",
        sim.delegates,
        sim.steps,
        sim.capacity
    );
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(1024);
    let service = Arc::new(DispatchService::new(config.dispatch.clone()).with_notifier(tx));
    let reaper = service.spawn_reaper(cancel.child_token());

    let controller = Arc::new(TaskChainController::new(
        service.clone(),
        Arc::new(FileLogSink),
        config.chain.clone(),
    ));
    let driver = controller.spawn(rx, cancel.child_token());

    let engine = Arc::new(RestraintEngine::new());
    engine
        .register(ResourceRestraint::new(RESTRAINT, sim.capacity))
        .await?;
    let governor = Arc::new(Governor::new(&config.governor)?.with_releaser(engine.clone()));

    let jobs = Arc::new(ExternalJobSimulator::new(sim.polls_per_job));
    let heartbeat = config.dispatch.heartbeat_timeout() / 3;
    let workers = (0..sim.delegates)
        .map(|i| {
            let transport = Arc::new(RetryingTransport::new(
                service.clone(),
                config.backoff.clone(),
            ));
            let handlers = HandlerRegistry::new()
                .register(TaskKind::JobQueue, jobs.clone())
                .register(TaskKind::JobPoll, jobs.clone());
            let worker =
                DelegateWorker::new(ACCOUNT, &format!("sim-delegate-{}", i), transport, handlers)
                    .with_capabilities([SELECTOR])
                    .with_heartbeat_interval(heartbeat);
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(cancel).await })
        })
        .collect::<Vec<_>>();

    let harness = Arc::new(Harness {
        controller,
        engine,
        governor: governor.clone(),
        step: Arc::new(
            QueueThenPoll::new(Duration::from_millis(sim.poll_interval_ms)).with_selector(SELECTOR),
        ),
        peak: AtomicU32::new(0),
    });
    let steps = (0..sim.steps).map(|i| {
        let harness = harness.clone();
        let inject = sim.fail_every > 0 && (i + 1) % sim.fail_every == 0;
        async move { harness.run_step(i, inject).await }
    });
    let results = bounded(Duration::from_secs(sim.deadline_secs), async {
        Ok(futures::future::join_all(steps).await)
    })
    .await;

    cancel.cancel();
    let mut stats = Vec::with_capacity(workers.len());
    for worker in workers {
        match join(worker).await {
            Ok(s) => stats.push(s),
            Err(e) => rlog_warn!("worker ended with error: {}", e),
        }
    }
    let _ = reaper.await;
    let _ = driver.await;

    let mut report = SimulationReport {
        steps: sim.steps,
        capacity: sim.capacity,
        peak_usage: harness.peak.load(Ordering::SeqCst),
        tasks_dispatched: jobs.handled(),
        interrupts: governor.interrupts().await.len(),
        workers: stats,
        ..SimulationReport::default()
    };
    for result in results? {
        let step = result?;
        report.retries += step.retries;
        if step.succeeded {
            report.succeeded += 1;
        } else {
            report.aborted += 1;
        }
    }
    rlog_debug!(
        "simulation finished: {} succeeded, {} aborted, {} retries",
        report.succeeded,
        report.aborted,
        report.retries
    );
    Ok(report)
}
