//! Resource Restraint Engine.
//!
//! A counting semaphore per `(restraint, resource unit)` key with FIFO
//! admission, two acquire modes, and release bound to the holding scope.
//! There is no TTL on a usage record: whoever holds the scope must end it,
//! or the unit stays occupied.

mod engine;
pub mod model;

use async_trait::async_trait;

pub use engine::RestraintEngine;
pub use model::{
    AcquireMode, AcquireOutcome, AcquireRequest, HoldingScope, OrderingPolicy, ResourceRestraint,
    RestraintEvent, ScopeLevel, ScopeRelease, Ticket, UsageRecord,
};

/// Ends a holding scope: every permit held under it is released and every
/// claim still queued under it is withdrawn.
#[async_trait]
pub trait ScopeReleaser: Send + Sync {
    async fn release_scope(&self, scope: &HoldingScope) -> ScopeRelease;
}
