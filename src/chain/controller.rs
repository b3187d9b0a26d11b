//! Drives task chains from dispatch notifications.
//!
//! A chain occupies no task between rounds: it sits in the table until the
//! notification for its current task arrives, then runs the step's
//! `advance`/`finalize` and either submits the next round or completes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::state::{ChainPhase, TaskChainState};
use super::step::{ChainHandle, LogSink, StepContext, StepOutcome, TaskChainStep};
use crate::config::ChainConfig;
use crate::core::clock::{Clock, SystemClock};
use crate::core::ids::{ExecutionId, TaskId};
use crate::core::task::{TaskNotification, TaskOutcome};
use crate::dispatch::TaskSubmitter;
use crate::error::{Error, ErrorClass, Result};
use crate::governor::model::FailureInfo;
use crate::{rlog, rlog_debug, rlog_warn};

struct ActiveChain {
    step: Arc<dyn TaskChainStep>,
    ctx: StepContext,
    state: TaskChainState,
    handle: ChainHandle,
    /// The only task whose notification this chain accepts.
    current_task: Option<TaskId>,
    done: Option<oneshot::Sender<StepOutcome>>,
}

/// A started step; resolves once its chain reaches a terminal phase.
pub struct PendingStep {
    pub execution_id: ExecutionId,
    rx: oneshot::Receiver<StepOutcome>,
}

impl PendingStep {
    pub async fn outcome(self) -> StepOutcome {
        self.rx.await.unwrap_or_else(|_| {
            StepOutcome::failed(ErrorClass::Internal, "task chain dropped without an outcome")
        })
    }
}

pub struct TaskChainController {
    submitter: Arc<dyn TaskSubmitter>,
    log_sink: Arc<dyn LogSink>,
    config: ChainConfig,
    clock: Arc<dyn Clock>,
    chains: Mutex<HashMap<ExecutionId, Arc<Mutex<ActiveChain>>>>,
}

impl TaskChainController {
    pub fn new(
        submitter: Arc<dyn TaskSubmitter>,
        log_sink: Arc<dyn LogSink>,
        config: ChainConfig,
    ) -> Self {
        Self {
            submitter,
            log_sink,
            config,
            clock: Arc::new(SystemClock),
            chains: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Open the log stream, run the step's `start`, and submit round one.
    ///
    /// Failures inside the step do not surface here; they complete the
    /// returned [`PendingStep`] with a failed outcome.
    pub async fn start(
        &self,
        step: Arc<dyn TaskChainStep>,
        ctx: StepContext,
    ) -> Result<PendingStep> {
        let execution_id = ctx.execution_id;
        let (tx, rx) = oneshot::channel();
        let now = self.clock.now();

        let chain = Arc::new(Mutex::new(ActiveChain {
            step,
            ctx,
            state: TaskChainState::new(execution_id, now),
            handle: ChainHandle::end(serde_json::Value::Null),
            current_task: None,
            done: Some(tx),
        }));
        // Locked before it becomes visible, so a fast notification for round
        // one waits until `current_task` is set.
        let mut active = chain.lock().await;
        {
            let mut chains = self.chains.lock().await;
            if chains.contains_key(&execution_id) {
                return Err(Error::Validation(format!(
                    "execution {} already has a running chain",
                    execution_id
                )));
            }
            chains.insert(execution_id, Arc::clone(&chain));
        }
        if let Err(e) = self.log_sink.open_stream(&active.ctx.stream_name()).await {
            self.chains.lock().await.remove(&execution_id);
            return Err(e);
        }

        rlog!("{} chain started", active.ctx.log);
        let step = Arc::clone(&active.step);
        let first = step.start(&active.ctx).await;
        let started = match first {
            Ok(handle) => self.apply(&mut active, handle).await,
            Err(e) => Err(e),
        };
        self.settle(&mut active, started).await;
        Ok(PendingStep { execution_id, rx })
    }

    /// Feed one dispatch notification to its chain. Returns whether a chain
    /// consumed it.
    pub async fn on_result(&self, notification: TaskNotification) -> bool {
        let Some(execution_id) = notification.execution_id else {
            return false;
        };
        let Some(chain) = self.chains.lock().await.get(&execution_id).cloned() else {
            rlog_debug!(
                "no running chain for execution {}, ignoring task {}",
                execution_id.short(),
                notification.task_id.short()
            );
            return false;
        };
        let mut active = chain.lock().await;
        if active.current_task != Some(notification.task_id) {
            rlog_debug!(
                "{} ignoring result for task {} (not the current round)",
                active.ctx.log,
                notification.task_id.short()
            );
            return false;
        }
        active.current_task = None;

        let advanced = match notification.outcome {
            TaskOutcome::Success { data } => {
                let step = Arc::clone(&active.step);
                let next = step.advance(&active.ctx, &active.handle, &data).await;
                match next {
                    Ok(next) => self.apply(&mut active, next).await,
                    Err(e) => Err(e),
                }
            }
            TaskOutcome::Failure { class, message } => {
                rlog_warn!(
                    "{} round {} failed: [{}] {}",
                    active.ctx.log,
                    active.state.round(),
                    class,
                    message
                );
                Ok(Some(StepOutcome::failed(class, message)))
            }
        };
        self.settle(&mut active, advanced).await;
        true
    }

    /// Take a step's handle: finalize if the chain ended, otherwise submit
    /// the next round. Returns the outcome when the chain is complete.
    async fn apply(
        &self,
        active: &mut ActiveChain,
        handle: ChainHandle,
    ) -> Result<Option<StepOutcome>> {
        let now = self.clock.now();
        active.state.pass_through = handle.pass_through.clone();
        active.state.chain_end = handle.chain_end;

        if handle.chain_end {
            active.state.transition(ChainPhase::Finalizing, now)?;
            let outcome = active.step.finalize(&active.ctx, &handle).await?;
            active.state.transition(ChainPhase::Done, self.clock.now())?;
            active.handle = handle;
            return Ok(Some(outcome));
        }

        let Some(request) = handle.task_request.clone() else {
            return Err(Error::ChainProtocol(
                "chain continues but no next task was built".to_string(),
            ));
        };
        let round = active.state.round() + 1;
        if round > self.config.max_rounds {
            return Err(Error::ChainProtocol(format!(
                "chain exceeded {} rounds without ending",
                self.config.max_rounds
            )));
        }
        if request.account_id != active.ctx.account_id {
            return Err(Error::ChainProtocol(format!(
                "round {} task targets account {}",
                round, request.account_id
            )));
        }

        active.state.transition(ChainPhase::Queued { round }, now)?;
        let task_id = self
            .submitter
            .submit(request.for_execution(active.ctx.execution_id))
            .await?;
        active.state.task_ids.push(task_id);
        active.current_task = Some(task_id);
        active.state.transition(ChainPhase::AwaitingResult { round }, now)?;
        active.handle = handle;
        rlog_debug!(
            "{} round {} submitted as task {}",
            active.ctx.log,
            round,
            task_id.short()
        );
        Ok(None)
    }

    /// Complete the chain if `result` carries an outcome or an error. The log
    /// stream is closed on every completion path.
    async fn settle(&self, active: &mut ActiveChain, result: Result<Option<StepOutcome>>) {
        let outcome = match result {
            Ok(None) => return,
            Ok(Some(outcome)) => outcome,
            Err(e) => {
                rlog_warn!("{} chain failed: {}", active.ctx.log, e);
                let info = FailureInfo::from(&e);
                StepOutcome::failed(info.class, info.message)
            }
        };

        if !active.state.phase().is_terminal() {
            let _ = active.state.transition(ChainPhase::Failed, self.clock.now());
        }
        if let Some(task_id) = active.current_task.take() {
            if let Err(e) = self.submitter.abort(&active.ctx.account_id, task_id).await {
                rlog_warn!("{} could not withdraw task {}: {}", active.ctx.log, task_id, e);
            }
        }
        if let Err(e) = self.log_sink.close_stream(&active.ctx.stream_name()).await {
            rlog_warn!("{} log stream close failed: {}", active.ctx.log, e);
        }
        self.chains.lock().await.remove(&active.ctx.execution_id);
        rlog!(
            "{} chain finished as {} after {} round(s)",
            active.ctx.log,
            active.state.phase(),
            active.state.round()
        );
        if let Some(done) = active.done.take() {
            let _ = done.send(outcome);
        }
    }

    /// Fail a running chain from outside, withdrawing its in-flight task.
    pub async fn abort(&self, execution_id: ExecutionId, reason: &str) -> bool {
        let Some(chain) = self.chains.lock().await.get(&execution_id).cloned() else {
            return false;
        };
        let mut active = chain.lock().await;
        if active.state.phase().is_terminal() {
            return false;
        }
        let outcome =
            StepOutcome::failed(ErrorClass::Internal, format!("Chain aborted: {}", reason));
        self.settle(&mut active, Ok(Some(outcome))).await;
        true
    }

    pub async fn state(&self, execution_id: ExecutionId) -> Option<TaskChainState> {
        let chain = self.chains.lock().await.get(&execution_id).cloned()?;
        let active = chain.lock().await;
        Some(active.state.clone())
    }

    pub async fn active_chains(&self) -> usize {
        self.chains.lock().await.len()
    }

    /// Consume dispatch notifications until cancelled or the feed closes.
    pub fn spawn(
        self: &Arc<Self>,
        mut notifications: mpsc::Receiver<TaskNotification>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = notifications.recv() => {
                        let Some(notification) = next else { break };
                        let controller = Arc::clone(&controller);
                        tokio::spawn(async move {
                            controller.on_result(notification).await;
                        });
                    }
                }
            }
            rlog_debug!("chain driver stopped");
        })
    }
}
