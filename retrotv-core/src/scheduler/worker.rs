//! Bounded worker pool for CPU-bound schedule builds.
//!
//! Schedule computation can walk multi-day horizons; running it inline would
//! stall request handling, so callers submit closures here and await the
//! result. The semaphore bounds concurrency, `spawn_blocking` keeps the work
//! off the async executor threads.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct ScheduleWorkerPool {
    permits: Arc<Semaphore>,
}

impl ScheduleWorkerPool {
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Run `build` on a blocking thread once a permit is available.
    pub async fn run<T, F>(&self, build: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("scheduler worker pool closed".to_string()))?;

        let handle = tokio::task::spawn_blocking(move || {
            let result = build();
            drop(permit);
            result
        });

        handle
            .await
            .map_err(|e| Error::Internal(format!("schedule build panicked: {e}")))
    }
}
