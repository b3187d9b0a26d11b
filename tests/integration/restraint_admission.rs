//! Resource restraint admission tests.
//!
//! These tests verify capacity safety under concurrent claimants, FIFO
//! grant order, and scope-driven release.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;

use relay::restraint::{
    AcquireOutcome, AcquireRequest, HoldingScope, ResourceRestraint, RestraintEngine,
    RestraintEvent,
};

/// Test: Admission safety
/// Given a capacity-3 unit and 40 concurrent claimants of 1-2 permits
/// When each one acquires, holds briefly, and releases
/// Then granted permits never exceed capacity and every claimant finishes
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claimants_never_exceed_capacity() {
    let engine = Arc::new(RestraintEngine::new());
    engine
        .register(ResourceRestraint::new("builders", 3))
        .await
        .unwrap();
    let peak = Arc::new(AtomicU32::new(0));

    let claimants = (0..40).map(|i| {
        let engine = engine.clone();
        let peak = peak.clone();
        tokio::spawn(async move {
            let permits = 1 + (i % 2);
            let request = AcquireRequest::new(
                "builders",
                "linux",
                &format!("claimant-{}", i),
                permits,
                HoldingScope::step(format!("exec-{}", i)),
            );
            let record = engine.acquire_and_wait(request, None).await.unwrap();
            let held: u32 = engine
                .active_records("builders", "linux")
                .await
                .iter()
                .map(|r| r.permits)
                .sum();
            peak.fetch_max(held, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            engine.release(record.id).await.unwrap();
        })
    });
    for result in join_all(claimants).await {
        result.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(engine.usage("builders", "linux").await, 0);
    assert_eq!(engine.queue_len("builders", "linux").await, 0);
}

/// Test: FIFO fairness
/// Given an exhausted unit and 5 claimants queued in order
/// When capacity frees one permit at a time
/// Then claimants are granted in arrival order
#[tokio::test]
async fn test_queued_claimants_granted_in_arrival_order() {
    let (tx, mut events) = mpsc::channel(64);
    let engine = RestraintEngine::new().with_events(tx);
    engine
        .register(ResourceRestraint::new("deploy", 1))
        .await
        .unwrap();
    let holder = match engine
        .acquire(AcquireRequest::new("deploy", "prod", "holder", 1, HoldingScope::plan("p0")))
        .await
        .unwrap()
    {
        AcquireOutcome::Granted(record) => record,
        AcquireOutcome::Queued(_) => panic!("first claim should be granted"),
    };

    let mut tickets = Vec::new();
    for i in 0..5 {
        let request = AcquireRequest::new(
            "deploy",
            "prod",
            &format!("c{}", i),
            1,
            HoldingScope::plan(format!("p{}", i + 1)),
        );
        match engine.acquire(request).await.unwrap() {
            AcquireOutcome::Queued(ticket) => tickets.push(ticket),
            AcquireOutcome::Granted(_) => panic!("unit is exhausted"),
        }
    }
    assert_eq!(engine.queue_len("deploy", "prod").await, 5);

    let mut current = engine.release(holder.id).await.unwrap();
    let mut order = Vec::new();
    for ticket in tickets {
        let record = ticket.wait().await.unwrap();
        order.push(record.claimant_id.clone());
        current = engine.release(record.id).await.unwrap();
    }
    assert_eq!(current.claimant_id, "c4");
    assert_eq!(order, vec!["c0", "c1", "c2", "c3", "c4"]);

    let mut granted = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RestraintEvent::Granted(record) = event {
            granted.push(record.claimant_id);
        }
    }
    assert_eq!(granted, vec!["holder", "c0", "c1", "c2", "c3", "c4"]);
}

/// Test: Scope end grants the next claimant
/// Given a capacity-1 restraint and two ACCUMULATE plan-scope claimants
/// When claimant A's plan scope ends
/// Then claimant B is granted without manual intervention
#[tokio::test]
async fn test_scope_end_grants_queued_claimant() {
    let engine = Arc::new(RestraintEngine::new());
    engine
        .register(ResourceRestraint::new("license", 1))
        .await
        .unwrap();

    let a = engine
        .acquire(AcquireRequest::new("license", "seat", "A", 1, HoldingScope::plan("plan-a")))
        .await
        .unwrap();
    assert!(a.is_granted());
    let b = engine
        .acquire(AcquireRequest::new("license", "seat", "B", 1, HoldingScope::plan("plan-b")))
        .await
        .unwrap();
    let AcquireOutcome::Queued(ticket) = b else {
        panic!("B should queue behind A");
    };

    let released = engine.release_scope(&HoldingScope::plan("plan-a")).await;
    assert_eq!(released.released.len(), 1);
    let record = tokio::time::timeout(Duration::from_secs(1), ticket.wait())
        .await
        .expect("B granted promptly")
        .unwrap();
    assert_eq!(record.claimant_id, "B");
    assert_eq!(engine.usage("license", "seat").await, 1);
}

/// Test: Queued claims withdrawn with their scope
/// Given a claimant queued under a stage scope
/// When that stage ends before capacity frees
/// Then the claim is withdrawn and later releases skip it
#[tokio::test]
async fn test_scope_end_withdraws_queued_claim() {
    let engine = RestraintEngine::new();
    engine.register(ResourceRestraint::new("gpu", 1)).await.unwrap();
    let holder = engine
        .acquire(AcquireRequest::new("gpu", "a100", "train", 1, HoldingScope::plan("p")))
        .await
        .unwrap();
    let AcquireOutcome::Granted(holder) = holder else {
        panic!("first claim should be granted");
    };
    let AcquireOutcome::Queued(ticket) = engine
        .acquire(AcquireRequest::new("gpu", "a100", "eval", 1, HoldingScope::stage("s1")))
        .await
        .unwrap()
    else {
        panic!("second claim should queue");
    };

    let ended = engine.release_scope(&HoldingScope::stage("s1")).await;
    assert_eq!(ended.withdrawn, 1);
    assert!(ticket.wait().await.is_err());

    engine.release(holder.id).await.unwrap();
    assert_eq!(engine.usage("gpu", "a100").await, 0);
}
