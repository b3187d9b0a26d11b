//! Dispatch protocol tests.
//!
//! These tests verify leasing, epoch fencing, and the handling of delegates
//! that die or cannot run a task.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use relay::core::task::{TaskKind, TaskOutcome, TaskRequest, TaskResponse, TaskStatus};
use relay::dispatch::{DelegateWorker, HandlerRegistry, ReportAck};
use relay::ErrorClass;

use crate::fixtures::{dispatch_config, DispatchHarness, StubJobs, ACCOUNT};

fn shell(selector: &str) -> TaskRequest {
    TaskRequest::new(ACCOUNT, TaskKind::ShellScript, b"make".to_vec()).with_selector(selector)
}

/// Test: No double assignment under concurrent acquire
/// Given 10 queued tasks and 25 delegates polling at once
/// When every delegate calls acquire concurrently
/// Then each task is leased exactly once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_double_assignment_under_concurrent_acquire() {
    let harness = DispatchHarness::new(dispatch_config());
    let mut delegates = Vec::new();
    for i in 0..25 {
        delegates.push(harness.register(&format!("d{}", i), &["linux"]).await);
    }
    let mut submitted = HashSet::new();
    for _ in 0..10 {
        submitted.insert(harness.service.submit(shell("linux")).await.unwrap());
    }

    let polls = delegates.iter().map(|id| {
        let service = harness.service.clone();
        let id = *id;
        tokio::spawn(async move { service.acquire_task(ACCOUNT, id).await })
    });
    let packages: Vec<_> = join_all(polls)
        .await
        .into_iter()
        .filter_map(|r| r.unwrap().unwrap())
        .collect();

    assert_eq!(packages.len(), 10, "every task leased once");
    let leased: HashSet<_> = packages.iter().map(|p| p.task_id).collect();
    assert_eq!(leased, submitted, "no task handed to two delegates");
    assert!(packages.iter().all(|p| p.lease_epoch == 1));
}

/// Test: Stale lease rejection
/// Given a task whose first lease expired and was re-leased at epoch 2
/// When the first holder reports late with epoch 1
/// Then the report is rejected and the epoch-2 result stands
#[tokio::test]
async fn test_stale_report_does_not_overwrite_newer_result() {
    let mut harness = DispatchHarness::new(dispatch_config());
    let slow = harness.register("slow", &["linux"]).await;
    let fast = harness.register("fast", &["linux"]).await;
    let task_id = harness
        .service
        .submit(shell("linux").with_timeout(Duration::from_secs(5)))
        .await
        .unwrap();

    let first = harness
        .service
        .acquire_task(ACCOUNT, slow)
        .await
        .unwrap()
        .unwrap();
    harness.clock.advance(Duration::from_secs(6));
    let report = harness.service.reap().await;
    assert_eq!(report.requeued, 1);

    let second = harness
        .service
        .acquire_task(ACCOUNT, fast)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.task_id, task_id);
    assert_eq!(second.lease_epoch, 2);

    let ack = harness
        .service
        .report_result(
            ACCOUNT,
            fast,
            task_id,
            second.lease_epoch,
            TaskResponse::Success { data: b"new".to_vec() },
        )
        .await
        .unwrap();
    assert_eq!(ack, ReportAck::Accepted);

    let late = harness
        .service
        .report_result(
            ACCOUNT,
            slow,
            task_id,
            first.lease_epoch,
            TaskResponse::Success { data: b"old".to_vec() },
        )
        .await
        .unwrap();
    assert_eq!(late, ReportAck::RejectedStale { current_epoch: 2 });

    let task = harness.service.task(ACCOUNT, task_id).await.unwrap();
    assert_eq!(
        task.outcome,
        Some(TaskOutcome::Success { data: b"new".to_vec() })
    );
    let notification = harness.next_notification().await;
    assert_eq!(notification.task_id, task_id);
    assert_eq!(notification.status, TaskStatus::Completed);
}

/// Test: Dead delegate's work moves to a survivor
/// Given a delegate holding a lease that stops heartbeating
/// When the reaper runs past the heartbeat window
/// Then the delegate is disconnected and its task is re-leased elsewhere
#[tokio::test]
async fn test_dead_delegate_work_moves_to_survivor() {
    let mut config = dispatch_config();
    config.heartbeat_timeout_secs = 30;
    let harness = DispatchHarness::new(config);
    let doomed = harness.register("doomed", &["linux"]).await;
    let survivor = harness.register("survivor", &["linux"]).await;
    let task_id = harness.service.submit(shell("linux")).await.unwrap();
    harness
        .service
        .acquire_task(ACCOUNT, doomed)
        .await
        .unwrap()
        .unwrap();

    harness.clock.advance(Duration::from_secs(31));
    harness.service.heartbeat(ACCOUNT, survivor).await.unwrap();
    let report = harness.service.reap().await;
    assert_eq!(report.dead_delegates, vec![doomed]);
    assert_eq!(report.requeued, 1);

    assert!(harness.service.acquire_task(ACCOUNT, doomed).await.is_err());
    let package = harness
        .service
        .acquire_task(ACCOUNT, survivor)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(package.task_id, task_id);
    let task = harness.service.task(ACCOUNT, task_id).await.unwrap();
    assert!(task
        .activity
        .iter()
        .any(|entry| entry.message.contains("disconnected")));

    // A heartbeat brings the doomed delegate back.
    harness.service.heartbeat(ACCOUNT, doomed).await.unwrap();
    assert!(harness.service.acquire_task(ACCOUNT, doomed).await.is_ok());
}

/// Test: Delegate exhaustion
/// Given two matching delegates that both run without a handler for the task
/// When each worker hands the task back and the producer asks
/// Then the task fails with a delegate exhaustion outcome
#[tokio::test]
async fn test_all_delegates_unable_fails_task() {
    let mut harness = DispatchHarness::new(dispatch_config());
    let handlers = HandlerRegistry::new().register(
        TaskKind::JobQueue,
        Arc::new(StubJobs::new("unused", 0, "succeeded")),
    );
    let workers: Vec<_> = ["w1", "w2"]
        .iter()
        .map(|name| {
            DelegateWorker::new(ACCOUNT, name, harness.service.clone(), handlers.clone())
                .with_capabilities(["linux"])
        })
        .collect();
    for worker in &workers {
        worker.register().await.unwrap();
    }
    let task_id = harness
        .service
        .submit(TaskRequest::new(ACCOUNT, TaskKind::HttpCall, vec![]).with_selector("linux"))
        .await
        .unwrap();

    let mut stats = Default::default();
    assert!(workers[0].run_once(&mut stats).await.unwrap());
    assert!(!harness
        .service
        .fail_if_all_delegates_failed(ACCOUNT, task_id)
        .await
        .unwrap());
    assert!(workers[1].run_once(&mut stats).await.unwrap());
    assert_eq!(stats.unable, 2);

    assert!(harness
        .service
        .fail_if_all_delegates_failed(ACCOUNT, task_id)
        .await
        .unwrap());
    let notification = harness.next_notification().await;
    assert_eq!(notification.status, TaskStatus::Failed);
    match notification.outcome {
        TaskOutcome::Failure { class, message } => {
            assert_eq!(class, ErrorClass::DelegateExhaustion);
            assert!(message.starts_with(
                "No eligible delegates could perform the required capabilities for this task"
            ));
            assert!(message.contains("w1") && message.contains("w2"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
}
