//! Retry lineage tests.
//!
//! These tests feed chain outcomes into the governor and verify the retry
//! chain it builds and the permits it releases along the way.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use relay::chain::{QueueThenPoll, StepContext};
use relay::config::GovernorConfig;
use relay::core::task::{TaskKind, TaskPackage, TaskResponse};
use relay::dispatch::TaskHandler;
use relay::governor::{Decision, ExecutionStatus, Governor, InterruptType, NodeExecution};
use relay::restraint::{AcquireRequest, ResourceRestraint, RestraintEngine};
use relay::Result;

use crate::fixtures::{ChainHarness, ACCOUNT};

/// Jobs 1..=`failures` end in `failed`; later jobs succeed.
struct FlakyJobs {
    failures: u32,
    queued: AtomicU32,
}

#[async_trait]
impl TaskHandler for FlakyJobs {
    async fn run(&self, package: &TaskPackage) -> Result<TaskResponse> {
        let body = match package.kind {
            TaskKind::JobQueue => {
                let n = self.queued.fetch_add(1, Ordering::SeqCst) + 1;
                json!({ "handle": format!("job-{}", n) })
            }
            _ => {
                let request: serde_json::Value = serde_json::from_slice(&package.payload)?;
                let n: u32 = request["handle"]
                    .as_str()
                    .and_then(|h| h.strip_prefix("job-"))
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(0);
                if n <= self.failures {
                    json!({ "state": "failed" })
                } else {
                    json!({ "state": "succeeded", "output": { "job": n } })
                }
            }
        };
        Ok(TaskResponse::Success {
            data: serde_json::to_vec(&body)?,
        })
    }
}

/// Test: Retry lineage
/// Given a step whose first two executions fail transiently
/// When the governor retries it until the third execution succeeds
/// Then the final execution's retry ids are the two failed ids in order
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_retries_then_success_links_lineage() {
    let jobs = Arc::new(FlakyJobs {
        failures: 2,
        queued: AtomicU32::new(0),
    });
    let harness = ChainHarness::start(jobs, 2, 100);
    let engine = Arc::new(RestraintEngine::new());
    engine
        .register(ResourceRestraint::new("artifact-store", 1))
        .await
        .unwrap();
    let governor = Governor::new(&GovernorConfig::default())
        .unwrap()
        .with_releaser(engine.clone());
    let step = Arc::new(QueueThenPoll::new(Duration::from_secs(2)).with_selector("jobs"));

    let mut execution = governor
        .create_execution("publish", ACCOUNT, json!({ "bucket": "b1" }), None)
        .await;
    let mut created: Vec<NodeExecution> = vec![execution.clone()];
    let last = loop {
        let request = AcquireRequest::new(
            "artifact-store",
            "b1",
            "publish",
            1,
            execution.scope.clone(),
        );
        engine
            .acquire_and_wait(request, Some(Duration::from_secs(1)))
            .await
            .expect("previous attempt released its permit");

        let ctx = StepContext::new(
            execution.id,
            ACCOUNT,
            "publish",
            execution.parameters.clone(),
        );
        let pending = harness.controller.start(step.clone(), ctx).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(10), pending.outcome())
            .await
            .expect("chain finishes");

        match governor.on_step_outcome(execution.id, &outcome).await.unwrap() {
            Decision::Retry {
                execution: next,
                released,
                ..
            } => {
                assert_eq!(released.released.len(), 1);
                created.push(next.clone());
                execution = next;
            }
            Decision::Completed { execution, .. } => break execution,
            Decision::Abort { interrupt, .. } => panic!("aborted: {}", interrupt.reason),
        }
    };

    assert_eq!(created.len(), 3);
    assert_eq!(last.status, ExecutionStatus::Succeeded);
    assert_eq!(last.retry_ids, vec![created[0].id, created[1].id]);
    assert_eq!(last.parameters, json!({ "bucket": "b1" }));
    assert_eq!(last.output, Some(json!({ "job": 3 })));
    assert_eq!(engine.usage("artifact-store", "b1").await, 0);

    let lineage: Vec<_> = governor
        .retry_chain(last.id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(lineage, created.iter().map(|e| e.id).collect::<Vec<_>>());

    let interrupts = governor.interrupts().await;
    assert_eq!(interrupts.len(), 2);
    assert!(interrupts.iter().all(|i| i.kind == InterruptType::Retry));
    assert_eq!(
        governor.latest_execution("publish").await.map(|e| e.id),
        Some(last.id)
    );
    harness.shutdown().await;
}

/// Test: Budget exhaustion aborts and frees permits
/// Given a step that always fails and a budget of two attempts
/// When both executions fail
/// Then the governor emits ABORT and the permits are released
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhausted_budget_aborts() {
    let jobs = Arc::new(FlakyJobs {
        failures: u32::MAX,
        queued: AtomicU32::new(0),
    });
    let harness = ChainHarness::start(jobs, 1, 100);
    let engine = Arc::new(RestraintEngine::new());
    engine
        .register(ResourceRestraint::new("artifact-store", 1))
        .await
        .unwrap();
    let config = GovernorConfig {
        max_attempts: 2,
        ..GovernorConfig::default()
    };
    let governor = Governor::new(&config).unwrap().with_releaser(engine.clone());
    let step = Arc::new(QueueThenPoll::new(Duration::from_secs(2)).with_selector("jobs"));

    let mut execution = governor
        .create_execution("publish", ACCOUNT, json!({}), None)
        .await;
    let aborted = loop {
        engine
            .acquire_and_wait(
                AcquireRequest::new("artifact-store", "b1", "publish", 1, execution.scope.clone()),
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        let ctx = StepContext::new(execution.id, ACCOUNT, "publish", json!({}));
        let outcome = harness
            .controller
            .start(step.clone(), ctx)
            .await
            .unwrap()
            .outcome()
            .await;
        match governor.on_step_outcome(execution.id, &outcome).await.unwrap() {
            Decision::Retry { execution: next, .. } => execution = next,
            Decision::Abort {
                execution,
                interrupt,
                released,
            } => {
                assert_eq!(interrupt.kind, InterruptType::Abort);
                assert!(interrupt.reason.contains("retry budget exhausted"));
                assert_eq!(released.released.len(), 1);
                break execution;
            }
            Decision::Completed { .. } => panic!("job cannot succeed"),
        }
    };

    assert_eq!(aborted.attempt, 2);
    assert_eq!(aborted.status, ExecutionStatus::Aborted);
    assert_eq!(engine.usage("artifact-store", "b1").await, 0);
    harness.shutdown().await;
}
