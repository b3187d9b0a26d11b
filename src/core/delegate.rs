//! Delegate registry model.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::DelegateId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegateStatus {
    Enabled,
    /// Missed its heartbeat window; leases were revoked.
    Disconnected,
}

impl std::fmt::Display for DelegateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DelegateStatus::Enabled => write!(f, "enabled"),
            DelegateStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegate {
    pub id: DelegateId,
    pub account_id: String,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub status: DelegateStatus,
    pub last_heartbeat: DateTime<Utc>,
    /// Incremented on every (re)registration and reconnect.
    pub connection_epoch: u64,
    pub registered_at: DateTime<Utc>,
}

impl Delegate {
    pub fn new(request: &RegisterRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: request.delegate_id,
            account_id: request.account_id.clone(),
            name: request.name.clone(),
            capabilities: request.capabilities.clone(),
            status: DelegateStatus::Enabled,
            last_heartbeat: now,
            connection_epoch: 1,
            registered_at: now,
        }
    }

    /// A task is offered only when every selector is among our capabilities.
    pub fn matches(&self, selectors: &BTreeSet<String>) -> bool {
        selectors.is_subset(&self.capabilities)
    }

    pub fn is_alive(&self, now: DateTime<Utc>, heartbeat_timeout: chrono::Duration) -> bool {
        now - self.last_heartbeat <= heartbeat_timeout
    }

    pub fn is_enabled(&self) -> bool {
        self.status == DelegateStatus::Enabled
    }

    /// Label for failure messages: the name when set, otherwise the id.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.id.to_string()
        } else {
            self.name.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub account_id: String,
    pub delegate_id: DelegateId,
    pub name: String,
    pub capabilities: BTreeSet<String>,
}

impl RegisterRequest {
    pub fn new<I, S>(account_id: &str, delegate_id: DelegateId, name: &str, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            account_id: account_id.to_string(),
            delegate_id,
            name: name.to_string(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub delegate_id: DelegateId,
    pub connection_epoch: u64,
}
