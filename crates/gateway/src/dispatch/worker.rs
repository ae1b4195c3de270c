//! Bounded pool of blocking worker threads.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Errors produced by the worker pool.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The pool was closed by shutdown before a worker became available.
    #[error("worker pool closed")]
    Closed,

    /// The job panicked or was cancelled.
    #[error("worker job failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Runs blocking jobs (parsing, HMAC hashing, dispatch) off the connection
/// tasks, with at most `size` jobs executing at once.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool running at most `size` jobs concurrently.
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Configured concurrency.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently idle.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Refuse new jobs. Queued jobs are dropped and running ones finish.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Queue `job` and return a handle to its completion.
    ///
    /// The job keeps running if the handle is dropped. Fails with
    /// [`WorkerError::Closed`] once [`close`](Self::close) has been called.
    pub fn spawn<F, R>(&self, job: F) -> JoinHandle<Result<R, WorkerError>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let permit = permits.acquire_owned().await.map_err(|_| WorkerError::Closed)?;
            let result = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                job()
            })
            .await?;
            Ok(result)
        })
    }
}
