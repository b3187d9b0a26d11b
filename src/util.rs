//! Shared utility functions.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::{Error, Result};

/// Run `fut` for at most `duration`, mapping expiry to [`Error::Timeout`].
pub async fn bounded<F, T>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, fut).await {
        Ok(inner) => inner,
        Err(_) => Err(Error::Timeout(duration)),
    }
}

/// Await a spawned task, folding a panic or cancellation into [`Error::TaskJoin`].
pub async fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle.await.map_err(|e| Error::TaskJoin(e.to_string()))?
}
