//! Delegate-side task handlers, dispatched by [`TaskKind`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::task::{TaskKind, TaskPackage, TaskResponse};
use crate::error::{Error, Result};

/// Runs one kind of task. Handlers see only the opaque payload and must be
/// idempotent: the same lease can be delivered twice.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, package: &TaskPackage) -> Result<TaskResponse>;
}

/// Maps each task kind this delegate supports to its handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn handles(&self, kind: TaskKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub async fn execute(&self, package: &TaskPackage) -> Result<TaskResponse> {
        let handler = self
            .handlers
            .get(&package.kind)
            .ok_or_else(|| Error::Validation(format!("no handler for {} tasks", package.kind)))?;
        handler.run(package).await
    }
}
