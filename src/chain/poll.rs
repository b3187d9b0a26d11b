//! Queue-then-poll step: submit a job to an external system, then poll its
//! status until it reaches a terminal state.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::step::{ChainHandle, StepContext, StepOutcome, TaskChainStep};
use crate::core::task::{TaskKind, TaskRequest};
use crate::error::{Error, ErrorClass, Result};
use crate::rlog_debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Aborted)
    }
}

/// Delegate reply to the queue round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueResponse {
    pub handle: String,
}

/// Delegate reply to a poll round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    pub state: JobState,
    #[serde(default)]
    pub output: Value,
}

/// Carried between rounds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollState {
    pub handle: String,
    pub polls: u32,
    pub state: Option<JobState>,
    #[serde(default)]
    pub output: Value,
}

impl PollState {
    fn from_handle(handle: &ChainHandle) -> Result<Self> {
        serde_json::from_value(handle.pass_through.clone())
            .map_err(|e| Error::ChainProtocol(format!("corrupt poll state: {}", e)))
    }

    fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

pub struct QueueThenPoll {
    poll_interval: Duration,
    selectors: Vec<String>,
}

impl QueueThenPoll {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            selectors: Vec::new(),
        }
    }

    pub fn with_selector(mut self, selector: &str) -> Self {
        self.selectors.push(selector.to_string());
        self
    }

    fn poll_request(&self, ctx: &StepContext, handle: &str) -> Result<TaskRequest> {
        let payload = serde_json::to_vec(&serde_json::json!({ "handle": handle }))?;
        Ok(TaskRequest::new(&ctx.account_id, TaskKind::JobPoll, payload)
            .with_selectors(self.selectors.iter().cloned())
            .with_timeout(self.poll_interval))
    }
}

#[async_trait]
impl TaskChainStep for QueueThenPoll {
    async fn start(&self, ctx: &StepContext) -> Result<ChainHandle> {
        let payload = serde_json::to_vec(&ctx.parameters)?;
        let request = TaskRequest::new(&ctx.account_id, TaskKind::JobQueue, payload)
            .with_selectors(self.selectors.iter().cloned());
        Ok(ChainHandle::next(request, PollState::default().to_value()?))
    }

    async fn advance(
        &self,
        ctx: &StepContext,
        handle: &ChainHandle,
        response: &[u8],
    ) -> Result<ChainHandle> {
        let mut state = PollState::from_handle(handle)?;

        if state.handle.is_empty() {
            let queued: QueueResponse = serde_json::from_slice(response)
                .map_err(|e| Error::ChainProtocol(format!("malformed queue response: {}", e)))?;
            if queued.handle.trim().is_empty() {
                return Err(Error::ChainProtocol(
                    "queue round returned an empty job handle".to_string(),
                ));
            }
            rlog_debug!("{} job queued as {}", ctx.log, queued.handle);
            state.handle = queued.handle;
            let request = self.poll_request(ctx, &state.handle)?;
            return Ok(ChainHandle::next(request, state.to_value()?));
        }

        let polled: PollResponse = serde_json::from_slice(response)
            .map_err(|e| Error::ChainProtocol(format!("malformed poll response: {}", e)))?;
        state.polls += 1;
        state.state = Some(polled.state);
        if polled.state.is_terminal() {
            state.output = polled.output;
            return Ok(ChainHandle::end(state.to_value()?));
        }
        let request = self.poll_request(ctx, &state.handle)?;
        Ok(ChainHandle::next(request, state.to_value()?))
    }

    async fn finalize(&self, _ctx: &StepContext, handle: &ChainHandle) -> Result<StepOutcome> {
        let state = PollState::from_handle(handle)?;
        Ok(match state.state {
            Some(JobState::Succeeded) => StepOutcome::succeeded(state.output),
            Some(other) => StepOutcome::failed(
                ErrorClass::RemoteTaskFailure,
                format!("job {} ended as {:?}", state.handle, other),
            ),
            None => StepOutcome::failed(
                ErrorClass::ChainProtocol,
                "chain ended before the job reported a state",
            ),
        })
    }
}
