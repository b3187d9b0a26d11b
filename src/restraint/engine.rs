use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, Mutex};

use super::model::{
    AcquireMode, AcquireOutcome, AcquireRequest, HoldingScope, OrderingPolicy, ResourceRestraint,
    RestraintEvent, ScopeRelease, Ticket, UsageRecord,
};
use super::ScopeReleaser;
use crate::core::clock::{Clock, SystemClock};
use crate::core::ids::UsageId;
use crate::error::{Error, Result};
use crate::{rlog_debug, rlog_warn};

struct Waiter {
    ticket: u64,
    request: AcquireRequest,
    tx: oneshot::Sender<UsageRecord>,
}

impl Waiter {
    fn withdrawn(&self) -> RestraintEvent {
        RestraintEvent::Withdrawn {
            ticket: self.ticket,
            claimant_id: self.request.claimant_id.clone(),
        }
    }
}

/// Holdings and waiters for one resource unit.
#[derive(Default)]
struct UnitState {
    records: Vec<UsageRecord>,
    queue: VecDeque<Waiter>,
}

impl UnitState {
    fn committed(&self) -> u64 {
        self.records.iter().map(|r| u64::from(r.permits)).sum()
    }

    fn held_by(&self, claimant_id: &str) -> u64 {
        self.records
            .iter()
            .filter(|r| r.claimant_id == claimant_id)
            .map(|r| u64::from(r.permits))
            .sum()
    }

    /// A REPLACE that does not raise the claimant's holding takes nothing
    /// from the line, so it never has to wait behind it.
    fn shrinks_holding(&self, request: &AcquireRequest) -> bool {
        request.mode == AcquireMode::Replace
            && u64::from(request.permits) <= self.held_by(&request.claimant_id)
    }

    fn is_idle(&self) -> bool {
        self.records.is_empty() && self.queue.is_empty()
    }

    fn fits(&self, request: &AcquireRequest, capacity: u32) -> bool {
        let mut committed = self.committed();
        if request.mode == AcquireMode::Replace {
            committed -= self.held_by(&request.claimant_id);
        }
        committed + u64::from(request.permits) <= u64::from(capacity)
    }

    /// Record a grant. Under REPLACE the claimant's earlier holdings on this
    /// unit are removed and returned.
    fn grant(
        &mut self,
        request: &AcquireRequest,
        now: DateTime<Utc>,
    ) -> (UsageRecord, Vec<UsageRecord>) {
        let superseded = if request.mode == AcquireMode::Replace {
            let (gone, kept): (Vec<UsageRecord>, Vec<UsageRecord>) =
                std::mem::take(&mut self.records)
                    .into_iter()
                    .partition(|r| r.claimant_id == request.claimant_id);
            self.records = kept;
            gone
        } else {
            Vec::new()
        };
        let record = UsageRecord::grant(request, now);
        self.records.push(record.clone());
        (record, superseded)
    }

    fn hand_over(
        &mut self,
        waiter: Waiter,
        now: DateTime<Utc>,
        events: &mut Vec<RestraintEvent>,
    ) {
        let (record, superseded) = self.grant(&waiter.request, now);
        match waiter.tx.send(record.clone()) {
            Ok(()) => {
                events.extend(superseded.into_iter().map(RestraintEvent::Released));
                events.push(RestraintEvent::Granted(record));
            }
            Err(_) => {
                // Ticket dropped after the closed check; undo.
                self.records.retain(|r| r.id != record.id);
                self.records.extend(superseded);
                events.push(RestraintEvent::Withdrawn {
                    ticket: waiter.ticket,
                    claimant_id: waiter.request.claimant_id,
                });
            }
        }
    }

    /// Give freed capacity to queued claimants per the ordering policy.
    fn admit(
        &mut self,
        restraint: &ResourceRestraint,
        now: DateTime<Utc>,
        events: &mut Vec<RestraintEvent>,
    ) {
        let capacity = restraint.capacity;
        match restraint.ordering {
            OrderingPolicy::Fifo => {
                while let Some(front) = self.queue.front() {
                    let dead = front.tx.is_closed() || front.request.permits > capacity;
                    if !dead && !self.fits(&front.request, capacity) {
                        break;
                    }
                    let Some(waiter) = self.queue.pop_front() else {
                        break;
                    };
                    if dead {
                        events.push(waiter.withdrawn());
                    } else {
                        self.hand_over(waiter, now, events);
                    }
                }
            }
            OrderingPolicy::FirstFit => {
                let mut i = 0;
                while i < self.queue.len() {
                    let waiter = &self.queue[i];
                    let dead = waiter.tx.is_closed() || waiter.request.permits > capacity;
                    if !dead && !self.fits(&waiter.request, capacity) {
                        i += 1;
                        continue;
                    }
                    let Some(waiter) = self.queue.remove(i) else {
                        break;
                    };
                    if dead {
                        events.push(waiter.withdrawn());
                    } else {
                        self.hand_over(waiter, now, events);
                    }
                }
            }
        }
    }
}

type UnitKey = (String, String);

#[derive(Default)]
struct Inner {
    restraints: HashMap<String, ResourceRestraint>,
    units: HashMap<UnitKey, UnitState>,
    next_ticket: u64,
}

impl Inner {
    fn drop_if_idle(&mut self, key: &UnitKey) {
        if self.units.get(key).map(UnitState::is_idle).unwrap_or(false) {
            self.units.remove(key);
        }
    }
}

/// In-process restraint engine. All admission decisions for every unit are
/// made under one lock, so a grant can never race a concurrent release.
pub struct RestraintEngine {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    events: Option<mpsc::Sender<RestraintEvent>>,
}

impl Default for RestraintEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RestraintEngine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock: Arc::new(SystemClock),
            events: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, tx: mpsc::Sender<RestraintEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Define a restraint, or change the capacity/ordering of an existing one.
    pub async fn register(&self, restraint: ResourceRestraint) -> Result<()> {
        if restraint.capacity == 0 {
            return Err(Error::Validation(format!(
                "restraint {} must have a positive capacity",
                restraint.id
            )));
        }
        let now = self.clock.now();
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let Inner {
                restraints, units, ..
            } = &mut *inner;
            for ((restraint_id, _), unit) in units.iter_mut() {
                if *restraint_id == restraint.id {
                    unit.admit(&restraint, now, &mut events);
                }
            }
            rlog_debug!(
                "restraint {} registered with capacity {} ({:?})",
                restraint.id,
                restraint.capacity,
                restraint.ordering
            );
            restraints.insert(restraint.id.clone(), restraint);
        }
        self.emit(events).await;
        Ok(())
    }

    pub async fn restraint(&self, restraint_id: &str) -> Option<ResourceRestraint> {
        self.inner.lock().await.restraints.get(restraint_id).cloned()
    }

    /// Grant immediately if the unit has room and nobody is ahead in line,
    /// otherwise queue the claim in arrival order.
    pub async fn acquire(&self, request: AcquireRequest) -> Result<AcquireOutcome> {
        if request.unit.is_empty() || request.claimant_id.is_empty() {
            return Err(Error::Validation(
                "acquire needs a resource unit and a claimant".to_string(),
            ));
        }
        let now = self.clock.now();
        let mut events = Vec::new();
        let outcome = {
            let mut inner = self.inner.lock().await;
            let restraint = inner
                .restraints
                .get(&request.restraint_id)
                .cloned()
                .ok_or_else(|| Error::RestraintNotFound(request.restraint_id.clone()))?;
            if request.permits == 0 || request.permits > restraint.capacity {
                return Err(Error::InvalidPermits {
                    restraint_id: restraint.id,
                    requested: request.permits,
                    capacity: restraint.capacity,
                });
            }

            inner.next_ticket += 1;
            let ticket = inner.next_ticket;
            let unit = inner
                .units
                .entry((request.restraint_id.clone(), request.unit.clone()))
                .or_default();
            unit.admit(&restraint, now, &mut events);

            let line_ahead = restraint.ordering == OrderingPolicy::Fifo
                && !unit.queue.is_empty()
                && !unit.shrinks_holding(&request);
            if !line_ahead && unit.fits(&request, restraint.capacity) {
                let (record, superseded) = unit.grant(&request, now);
                rlog_debug!(
                    "restraint {}/{}: granted {} permit(s) to {} ({} of {} committed)",
                    request.restraint_id,
                    request.unit,
                    request.permits,
                    request.claimant_id,
                    unit.committed(),
                    restraint.capacity
                );
                let freed = !superseded.is_empty();
                events.extend(superseded.into_iter().map(RestraintEvent::Released));
                events.push(RestraintEvent::Granted(record.clone()));
                if freed {
                    unit.admit(&restraint, now, &mut events);
                }
                AcquireOutcome::Granted(record)
            } else {
                let (tx, rx) = oneshot::channel();
                rlog_debug!(
                    "restraint {}/{}: {} queued behind {} claimant(s)",
                    request.restraint_id,
                    request.unit,
                    request.claimant_id,
                    unit.queue.len()
                );
                events.push(RestraintEvent::Queued {
                    ticket,
                    restraint_id: request.restraint_id.clone(),
                    unit: request.unit.clone(),
                    claimant_id: request.claimant_id.clone(),
                });
                let queued = Ticket {
                    id: ticket,
                    restraint_id: request.restraint_id.clone(),
                    unit: request.unit.clone(),
                    rx,
                };
                unit.queue.push_back(Waiter {
                    ticket,
                    request,
                    tx,
                });
                AcquireOutcome::Queued(queued)
            }
        };
        self.emit(events).await;
        Ok(outcome)
    }

    /// Acquire, waiting in line if needed. With a limit, a claim still queued
    /// when it runs out is withdrawn and reported as capacity exhaustion.
    pub async fn acquire_and_wait(
        &self,
        request: AcquireRequest,
        limit: Option<Duration>,
    ) -> Result<UsageRecord> {
        let (restraint_id, unit) = (request.restraint_id.clone(), request.unit.clone());
        let mut ticket = match self.acquire(request).await? {
            AcquireOutcome::Granted(record) => return Ok(record),
            AcquireOutcome::Queued(ticket) => ticket,
        };
        let Some(limit) = limit else {
            return ticket.wait().await;
        };
        match tokio::time::timeout(limit, &mut ticket.rx).await {
            Ok(Ok(record)) => Ok(record),
            Ok(Err(_)) => Err(Error::ClaimWithdrawn),
            Err(_) => {
                if self.cancel(&ticket).await {
                    rlog_warn!(
                        "restraint {}/{}: claim {} gave up after {:?}",
                        restraint_id,
                        unit,
                        ticket.id,
                        limit
                    );
                    return Err(Error::CapacityExhausted {
                        restraint_id,
                        unit,
                        waited: limit,
                    });
                }
                // Granted between the timeout and the cancel.
                ticket.rx.try_recv().map_err(|_| Error::ClaimWithdrawn)
            }
        }
    }

    /// Release one usage record. Releasing the same record twice is an error.
    pub async fn release(&self, usage_id: UsageId) -> Result<UsageRecord> {
        let now = self.clock.now();
        let mut events = Vec::new();
        let record = {
            let mut inner = self.inner.lock().await;
            let Inner {
                restraints, units, ..
            } = &mut *inner;
            let (unit, record) = units
                .values_mut()
                .find_map(|unit| {
                    let pos = unit.records.iter().position(|r| r.id == usage_id)?;
                    Some((unit, pos))
                })
                .map(|(unit, pos)| {
                    let record = unit.records.remove(pos);
                    (unit, record)
                })
                .ok_or(Error::UsageNotFound(usage_id))?;
            rlog_debug!(
                "restraint {}/{}: {} released {} permit(s)",
                record.restraint_id,
                record.unit,
                record.claimant_id,
                record.permits
            );
            events.push(RestraintEvent::Released(record.clone()));
            if let Some(restraint) = restraints.get(&record.restraint_id) {
                unit.admit(restraint, now, &mut events);
            }
            inner.drop_if_idle(&(record.restraint_id.clone(), record.unit.clone()));
            record
        };
        self.emit(events).await;
        Ok(record)
    }

    /// Withdraw a queued claim. Returns `false` if it was already granted or
    /// withdrawn.
    pub async fn cancel(&self, ticket: &Ticket) -> bool {
        let now = self.clock.now();
        let mut events = Vec::new();
        let removed = {
            let mut inner = self.inner.lock().await;
            let Inner {
                restraints, units, ..
            } = &mut *inner;
            let key = (ticket.restraint_id.clone(), ticket.unit.clone());
            let Some(unit) = units.get_mut(&key) else {
                return false;
            };
            let Some(pos) = unit.queue.iter().position(|w| w.ticket == ticket.id) else {
                return false;
            };
            if let Some(waiter) = unit.queue.remove(pos) {
                events.push(waiter.withdrawn());
            }
            // The withdrawn claim may have been blocking the head of the line.
            if let Some(restraint) = restraints.get(&ticket.restraint_id) {
                unit.admit(restraint, now, &mut events);
            }
            inner.drop_if_idle(&key);
            true
        };
        self.emit(events).await;
        removed
    }

    pub async fn release_scope(&self, scope: &HoldingScope) -> ScopeRelease {
        let now = self.clock.now();
        let mut events = Vec::new();
        let mut result = ScopeRelease::default();
        {
            let mut inner = self.inner.lock().await;
            let Inner {
                restraints, units, ..
            } = &mut *inner;
            for ((restraint_id, _), unit) in units.iter_mut() {
                let (released, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut unit.records)
                    .into_iter()
                    .partition(|r| r.scope == *scope);
                unit.records = kept;

                let before = unit.queue.len();
                unit.queue.retain(|w| {
                    if w.request.scope == *scope {
                        events.push(w.withdrawn());
                        false
                    } else {
                        true
                    }
                });
                let withdrawn = before - unit.queue.len();

                if released.is_empty() && withdrawn == 0 {
                    continue;
                }
                events.extend(released.iter().cloned().map(RestraintEvent::Released));
                result.released.extend(released);
                result.withdrawn += withdrawn;
                if let Some(restraint) = restraints.get(restraint_id) {
                    unit.admit(restraint, now, &mut events);
                }
            }
            units.retain(|_, unit| !unit.is_idle());
        }
        if !result.released.is_empty() || result.withdrawn > 0 {
            rlog_debug!(
                "scope {} ended: {} record(s) released, {} claim(s) withdrawn",
                scope,
                result.released.len(),
                result.withdrawn
            );
        }
        self.emit(events).await;
        result
    }

    /// Permits currently held on a unit.
    pub async fn usage(&self, restraint_id: &str, unit: &str) -> u32 {
        let inner = self.inner.lock().await;
        inner
            .units
            .get(&(restraint_id.to_string(), unit.to_string()))
            .map(|u| u32::try_from(u.committed()).unwrap_or(u32::MAX))
            .unwrap_or(0)
    }

    pub async fn queue_len(&self, restraint_id: &str, unit: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .units
            .get(&(restraint_id.to_string(), unit.to_string()))
            .map(|u| u.queue.len())
            .unwrap_or(0)
    }

    pub async fn active_records(&self, restraint_id: &str, unit: &str) -> Vec<UsageRecord> {
        let inner = self.inner.lock().await;
        inner
            .units
            .get(&(restraint_id.to_string(), unit.to_string()))
            .map(|u| u.records.clone())
            .unwrap_or_default()
    }

    async fn emit(&self, events: Vec<RestraintEvent>) {
        if let Some(tx) = &self.events {
            for event in events {
                let _ = tx.send(event).await;
            }
        }
    }
}

#[async_trait]
impl ScopeReleaser for RestraintEngine {
    async fn release_scope(&self, scope: &HoldingScope) -> ScopeRelease {
        RestraintEngine::release_scope(self, scope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    async fn engine(capacity: u32, ordering: OrderingPolicy) -> RestraintEngine {
        let engine = RestraintEngine::new();
        engine
            .register(ResourceRestraint::new("env", capacity).with_ordering(ordering))
            .await
            .unwrap();
        engine
    }

    fn claim(claimant: &str, permits: u32) -> AcquireRequest {
        AcquireRequest::new("env", "prod", claimant, permits, HoldingScope::plan(claimant))
    }

    fn granted(outcome: AcquireOutcome) -> UsageRecord {
        match outcome {
            AcquireOutcome::Granted(record) => record,
            AcquireOutcome::Queued(ticket) => panic!("expected grant, got ticket {}", ticket.id),
        }
    }

    fn queued(outcome: AcquireOutcome) -> Ticket {
        match outcome {
            AcquireOutcome::Queued(ticket) => ticket,
            AcquireOutcome::Granted(record) => panic!("expected ticket, got grant {:?}", record),
        }
    }

    #[tokio::test]
    async fn test_grant_then_queue() {
        let engine = engine(2, OrderingPolicy::Fifo).await;
        granted(engine.acquire(claim("a", 1)).await.unwrap());
        granted(engine.acquire(claim("b", 1)).await.unwrap());
        queued(engine.acquire(claim("c", 1)).await.unwrap());
        assert_eq!(engine.usage("env", "prod").await, 2);
        assert_eq!(engine.queue_len("env", "prod").await, 1);
        assert_eq!(engine.usage("env", "staging").await, 0);
    }

    #[tokio::test]
    async fn test_release_wakes_queued_claimant() {
        let engine = engine(1, OrderingPolicy::Fifo).await;
        let a = granted(engine.acquire(claim("a", 1)).await.unwrap());
        let ticket = queued(engine.acquire(claim("b", 1)).await.unwrap());

        let mut wait = task::spawn(ticket.wait());
        assert_pending!(wait.poll());

        engine.release(a.id).await.unwrap();
        assert!(wait.is_woken());
        let b = assert_ready!(wait.poll()).unwrap();
        assert_eq!(b.claimant_id, "b");
        assert_eq!(engine.usage("env", "prod").await, 1);
    }

    #[tokio::test]
    async fn test_double_release_is_rejected() {
        let engine = engine(1, OrderingPolicy::Fifo).await;
        let a = granted(engine.acquire(claim("a", 1)).await.unwrap());
        engine.release(a.id).await.unwrap();
        assert!(matches!(
            engine.release(a.id).await,
            Err(Error::UsageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fifo_blocks_smaller_claims_behind_head() {
        let engine = engine(3, OrderingPolicy::Fifo).await;
        let a = granted(engine.acquire(claim("a", 2)).await.unwrap());
        let b = queued(engine.acquire(claim("b", 2)).await.unwrap());
        let c = queued(engine.acquire(claim("c", 1)).await.unwrap());
        assert_eq!(engine.usage("env", "prod").await, 2);

        engine.release(a.id).await.unwrap();
        assert_eq!(b.wait().await.unwrap().claimant_id, "b");
        assert_eq!(c.wait().await.unwrap().claimant_id, "c");
        assert_eq!(engine.usage("env", "prod").await, 3);
    }

    #[tokio::test]
    async fn test_first_fit_lets_small_claims_through() {
        let engine = engine(3, OrderingPolicy::FirstFit).await;
        granted(engine.acquire(claim("a", 2)).await.unwrap());
        queued(engine.acquire(claim("b", 2)).await.unwrap());
        let c = granted(engine.acquire(claim("c", 1)).await.unwrap());
        assert_eq!(c.claimant_id, "c");
    }

    #[tokio::test]
    async fn test_replace_supersedes_prior_claim() {
        let engine = engine(2, OrderingPolicy::Fifo).await;
        let first = granted(engine.acquire(claim("a", 2)).await.unwrap());
        let second = granted(engine.acquire(claim("a", 1).replace()).await.unwrap());

        let records = engine.active_records("env", "prod").await;
        assert_eq!(records, vec![second.clone()]);
        assert_eq!(engine.usage("env", "prod").await, 1);
        assert!(engine.release(first.id).await.is_err());
        engine.release(second.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_shrinking_replace_skips_the_line_and_frees_permits() {
        let engine = engine(2, OrderingPolicy::Fifo).await;
        granted(engine.acquire(claim("a", 2)).await.unwrap());
        let b = queued(engine.acquire(claim("b", 1)).await.unwrap());

        let shrunk = granted(engine.acquire(claim("a", 1).replace()).await.unwrap());
        assert_eq!(shrunk.permits, 1);
        let b = tokio::time::timeout(Duration::from_secs(1), b.wait())
            .await
            .expect("b admitted by the freed permit")
            .unwrap();
        assert_eq!(b.claimant_id, "b");
        assert_eq!(engine.usage("env", "prod").await, 2);
        assert_eq!(engine.queue_len("env", "prod").await, 0);
    }

    #[tokio::test]
    async fn test_growing_replace_still_waits_its_turn() {
        let engine = engine(3, OrderingPolicy::Fifo).await;
        granted(engine.acquire(claim("a", 1)).await.unwrap());
        granted(engine.acquire(claim("c", 1)).await.unwrap());
        queued(engine.acquire(claim("b", 2)).await.unwrap());
        queued(engine.acquire(claim("a", 2).replace()).await.unwrap());
        assert_eq!(engine.queue_len("env", "prod").await, 2);
    }

    #[tokio::test]
    async fn test_idle_units_are_dropped() {
        let engine = engine(1, OrderingPolicy::Fifo).await;
        let a = granted(engine.acquire(claim("a", 1)).await.unwrap());
        let b = queued(engine.acquire(claim("b", 1)).await.unwrap());
        assert!(engine.cancel(&b).await);
        engine.release(a.id).await.unwrap();
        assert!(engine.inner.lock().await.units.is_empty());

        let scoped = AcquireRequest::new("env", "qa", "c", 1, HoldingScope::stage("s"));
        granted(engine.acquire(scoped).await.unwrap());
        engine.release_scope(&HoldingScope::stage("s")).await;
        assert!(engine.inner.lock().await.units.is_empty());
    }

    #[tokio::test]
    async fn test_accumulate_counts_same_claimant_twice() {
        let engine = engine(2, OrderingPolicy::Fifo).await;
        granted(engine.acquire(claim("a", 1)).await.unwrap());
        granted(engine.acquire(claim("a", 1)).await.unwrap());
        queued(engine.acquire(claim("a", 1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_permits() {
        let engine = engine(2, OrderingPolicy::Fifo).await;
        assert!(matches!(
            engine.acquire(claim("a", 3)).await,
            Err(Error::InvalidPermits { requested: 3, capacity: 2, .. })
        ));
        assert!(engine.acquire(claim("a", 0)).await.is_err());
        let missing = AcquireRequest::new("nope", "u", "a", 1, HoldingScope::plan("p"));
        assert!(matches!(
            engine.acquire(missing).await,
            Err(Error::RestraintNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_release_scope_releases_and_withdraws() {
        let engine = engine(1, OrderingPolicy::Fifo).await;
        let scope = HoldingScope::stage("stage-1");
        let held = AcquireRequest::new("env", "prod", "a", 1, scope.clone());
        granted(engine.acquire(held).await.unwrap());
        let waiting = AcquireRequest::new("env", "prod", "b", 1, scope.clone());
        let withdrawn = queued(engine.acquire(waiting).await.unwrap());
        let other = queued(engine.acquire(claim("c", 1)).await.unwrap());

        let result = engine.release_scope(&scope).await;
        assert_eq!(result.released.len(), 1);
        assert_eq!(result.withdrawn, 1);
        assert!(matches!(withdrawn.wait().await, Err(Error::ClaimWithdrawn)));
        assert_eq!(other.wait().await.unwrap().claimant_id, "c");
    }

    #[tokio::test]
    async fn test_cancel_unblocks_line() {
        let engine = engine(3, OrderingPolicy::Fifo).await;
        granted(engine.acquire(claim("a", 2)).await.unwrap());
        let b = queued(engine.acquire(claim("b", 2)).await.unwrap());
        let c = queued(engine.acquire(claim("c", 1)).await.unwrap());

        assert!(engine.cancel(&b).await);
        assert!(!engine.cancel(&b).await);
        assert_eq!(c.wait().await.unwrap().claimant_id, "c");
    }

    #[tokio::test]
    async fn test_dropped_ticket_does_not_block() {
        let engine = engine(1, OrderingPolicy::Fifo).await;
        let a = granted(engine.acquire(claim("a", 1)).await.unwrap());
        drop(queued(engine.acquire(claim("b", 1)).await.unwrap()));
        let c = queued(engine.acquire(claim("c", 1)).await.unwrap());

        engine.release(a.id).await.unwrap();
        assert_eq!(c.wait().await.unwrap().claimant_id, "c");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_and_wait_times_out() {
        let engine = engine(1, OrderingPolicy::Fifo).await;
        granted(engine.acquire(claim("a", 1)).await.unwrap());
        let err = engine
            .acquire_and_wait(claim("b", 1), Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted { .. }));
        assert_eq!(engine.queue_len("env", "prod").await, 0);
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let (tx, mut rx) = mpsc::channel(16);
        let engine = RestraintEngine::new().with_events(tx);
        engine.register(ResourceRestraint::new("env", 1)).await.unwrap();
        let a = granted(engine.acquire(claim("a", 1)).await.unwrap());
        let _b = queued(engine.acquire(claim("b", 1)).await.unwrap());
        engine.release(a.id).await.unwrap();

        assert!(matches!(rx.recv().await, Some(RestraintEvent::Granted(_))));
        assert!(matches!(rx.recv().await, Some(RestraintEvent::Queued { .. })));
        assert!(matches!(rx.recv().await, Some(RestraintEvent::Released(_))));
        match rx.recv().await {
            Some(RestraintEvent::Granted(record)) => assert_eq!(record.claimant_id, "b"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
