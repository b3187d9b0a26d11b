//! Task chain tests.
//!
//! These tests run queue-then-poll chains against stub delegates over a
//! real dispatch service and check termination and log-stream pairing.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use relay::chain::{QueueThenPoll, StepContext};
use relay::core::ids::ExecutionId;
use relay::core::task::{TaskKind, TaskStatus};
use relay::ErrorClass;

use crate::fixtures::{ChainHarness, StubJobs, ACCOUNT};

fn step() -> Arc<QueueThenPoll> {
    Arc::new(QueueThenPoll::new(Duration::from_secs(2)).with_selector("jobs"))
}

fn ctx() -> StepContext {
    StepContext::new(ExecutionId::new(), ACCOUNT, "build", json!({ "target": "release" }))
}

async fn kinds(harness: &ChainHarness, kind: TaskKind) -> usize {
    harness
        .service
        .tasks(ACCOUNT)
        .await
        .iter()
        .filter(|t| t.kind == kind)
        .count()
}

/// Test: Queue then poll to completion
/// Given a job that reports running twice before succeeding
/// When the chain runs against two stub delegates
/// Then it issues one queue and three poll rounds and succeeds
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_then_poll_completes() {
    let jobs = Arc::new(StubJobs::new("build-42", 2, "succeeded"));
    let harness = ChainHarness::start(jobs.clone(), 2, 100);
    let ctx = ctx();

    let pending = harness.controller.start(step(), ctx.clone()).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(10), pending.outcome())
        .await
        .expect("chain finishes");

    assert!(outcome.is_success(), "unexpected outcome {:?}", outcome);
    assert_eq!(outcome.output, json!({ "polls": 3 }));
    assert_eq!(jobs.polls(), 3);
    assert_eq!(kinds(&harness, TaskKind::JobQueue).await, 1);
    assert_eq!(kinds(&harness, TaskKind::JobPoll).await, 3);
    let tasks = harness.service.tasks(ACCOUNT).await;
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
    assert!(tasks.iter().all(|t| t.execution_id == Some(ctx.execution_id)));
    assert_eq!(
        harness.sink.events(),
        vec![
            format!("open {}", ctx.stream_name()),
            format!("close {}", ctx.stream_name())
        ]
    );
    assert_eq!(harness.controller.active_chains().await, 0);
    harness.shutdown().await;
}

/// Test: Empty poll handle fails fast
/// Given a queue round that answers with an empty handle
/// When the chain advances
/// Then it fails with a chain protocol error and never submits a poll round
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_handle_fails_fast() {
    let jobs = Arc::new(StubJobs::new("", 0, "succeeded"));
    let harness = ChainHarness::start(jobs.clone(), 1, 100);
    let ctx = ctx();

    let pending = harness.controller.start(step(), ctx.clone()).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(10), pending.outcome())
        .await
        .expect("chain finishes");

    let failure = outcome.failure.expect("chain failed");
    assert_eq!(failure.class, ErrorClass::ChainProtocol);
    assert!(failure.message.contains("empty job handle"));
    assert_eq!(kinds(&harness, TaskKind::JobPoll).await, 0);
    assert_eq!(jobs.polls(), 0);
    assert_eq!(harness.sink.events().len(), 2, "stream closed on failure");
    harness.shutdown().await;
}

/// Test: Chain termination under a round cap
/// Given a job that never leaves the running state
/// When the chain is capped at 5 rounds
/// Then it fails after exactly 5 submitted tasks instead of looping
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runaway_chain_stops_at_round_cap() {
    let jobs = Arc::new(StubJobs::new("forever", u32::MAX, "succeeded"));
    let harness = ChainHarness::start(jobs.clone(), 2, 5);
    let ctx = ctx();

    let pending = harness.controller.start(step(), ctx.clone()).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(10), pending.outcome())
        .await
        .expect("chain finishes");

    assert_eq!(
        outcome.failure.map(|f| f.class),
        Some(ErrorClass::ChainProtocol)
    );
    assert_eq!(harness.service.tasks(ACCOUNT).await.len(), 5);
    assert_eq!(harness.sink.events().len(), 2);
    harness.shutdown().await;
}

/// Test: Delegate error in a later round
/// Given a poll round that the delegate reports as an application error
/// When the chain receives the failed task
/// Then it fails as a remote task failure and still closes its stream
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_round_closes_stream() {
    let jobs = Arc::new(StubJobs::new("build-9", 0, "succeeded").failing_polls());
    let harness = ChainHarness::start(jobs.clone(), 1, 100);
    let ctx = ctx();

    let pending = harness.controller.start(step(), ctx.clone()).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(10), pending.outcome())
        .await
        .expect("chain finishes");

    let failure = outcome.failure.expect("chain failed");
    assert_eq!(failure.class, ErrorClass::RemoteTaskFailure);
    assert!(failure.message.contains("build server unreachable"));
    assert_eq!(
        harness.sink.events().last(),
        Some(&format!("close {}", ctx.stream_name()))
    );
    let stats = harness.shutdown().await;
    assert_eq!(stats[0].failed, 1);
}
