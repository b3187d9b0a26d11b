//! Resource restraint data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::core::ids::UsageId;
use crate::error::{Error, Result};

/// How queued claimants are considered when capacity frees up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingPolicy {
    /// Strict head-of-line: nobody overtakes an earlier claimant.
    #[default]
    Fifo,
    /// Scan in arrival order and grant every claim that fits.
    FirstFit,
}

/// A named counting semaphore, instantiated once per resource unit key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRestraint {
    pub id: String,
    pub capacity: u32,
    #[serde(default)]
    pub ordering: OrderingPolicy,
}

impl ResourceRestraint {
    pub fn new(id: &str, capacity: u32) -> Self {
        Self {
            id: id.to_string(),
            capacity,
            ordering: OrderingPolicy::Fifo,
        }
    }

    pub fn with_ordering(mut self, ordering: OrderingPolicy) -> Self {
        self.ordering = ordering;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcquireMode {
    /// Held permits add up against capacity.
    Accumulate,
    /// A new claim supersedes the claimant's earlier claim on the unit.
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeLevel {
    Plan,
    Stage,
    Step,
}

/// Workflow lifetime whose end releases the permits held under it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HoldingScope {
    pub level: ScopeLevel,
    pub id: String,
}

impl HoldingScope {
    pub fn plan(id: impl Into<String>) -> Self {
        Self {
            level: ScopeLevel::Plan,
            id: id.into(),
        }
    }

    pub fn stage(id: impl Into<String>) -> Self {
        Self {
            level: ScopeLevel::Stage,
            id: id.into(),
        }
    }

    pub fn step(id: impl Into<String>) -> Self {
        Self {
            level: ScopeLevel::Step,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for HoldingScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.level {
            ScopeLevel::Plan => "plan",
            ScopeLevel::Stage => "stage",
            ScopeLevel::Step => "step",
        };
        write!(f, "{}:{}", level, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireRequest {
    pub restraint_id: String,
    pub unit: String,
    pub claimant_id: String,
    pub permits: u32,
    pub mode: AcquireMode,
    pub scope: HoldingScope,
}

impl AcquireRequest {
    /// An ACCUMULATE request; adjust with [`replace`](Self::replace).
    pub fn new(
        restraint_id: &str,
        unit: &str,
        claimant_id: &str,
        permits: u32,
        scope: HoldingScope,
    ) -> Self {
        Self {
            restraint_id: restraint_id.to_string(),
            unit: unit.to_string(),
            claimant_id: claimant_id.to_string(),
            permits,
            mode: AcquireMode::Accumulate,
            scope,
        }
    }

    pub fn replace(mut self) -> Self {
        self.mode = AcquireMode::Replace;
        self
    }
}

/// A granted permit holding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: UsageId,
    pub restraint_id: String,
    pub unit: String,
    pub claimant_id: String,
    pub permits: u32,
    pub mode: AcquireMode,
    pub scope: HoldingScope,
    pub acquired_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn grant(request: &AcquireRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: UsageId::new(),
            restraint_id: request.restraint_id.clone(),
            unit: request.unit.clone(),
            claimant_id: request.claimant_id.clone(),
            permits: request.permits,
            mode: request.mode,
            scope: request.scope.clone(),
            acquired_at: now,
        }
    }
}

/// A queued claim. Awaiting it resolves once the engine grants it.
#[derive(Debug)]
pub struct Ticket {
    pub id: u64,
    pub restraint_id: String,
    pub unit: String,
    pub(crate) rx: oneshot::Receiver<UsageRecord>,
}

impl Ticket {
    /// Wait for the grant. Fails with [`Error::ClaimWithdrawn`] if the claim
    /// was cancelled or its scope ended first.
    pub async fn wait(self) -> Result<UsageRecord> {
        self.rx.await.map_err(|_| Error::ClaimWithdrawn)
    }
}

#[derive(Debug)]
pub enum AcquireOutcome {
    Granted(UsageRecord),
    Queued(Ticket),
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireOutcome::Granted(_))
    }
}

/// Everything a scope's end gave back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeRelease {
    pub released: Vec<UsageRecord>,
    pub withdrawn: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestraintEvent {
    Granted(UsageRecord),
    Queued {
        ticket: u64,
        restraint_id: String,
        unit: String,
        claimant_id: String,
    },
    Released(UsageRecord),
    Withdrawn {
        ticket: u64,
        claimant_id: String,
    },
}
