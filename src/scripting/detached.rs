/// `scripting/detached.rs` — bounded pool for fire-and-forget script runs
///
/// Tasks run on the blocking threads of a private tokio runtime. A semaphore
/// caps running plus queued tasks; a submission that finds no permit is
/// rejected rather than queued without bound.
use std::{fmt, io, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::{
    runtime::{Builder, Runtime},
    sync::Semaphore,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetachedConfig {
    /// Threads running detached scripts.
    pub workers: usize,
    /// Tasks allowed to wait for a worker.
    pub queue_capacity: usize,
}

impl Default for DetachedConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("detached pool is full ({0} tasks in flight)")]
    Full(usize),
    #[error("detached pool has shut down")]
    ShutDown,
}

pub struct DetachedPool {
    runtime: Option<Runtime>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl DetachedPool {
    pub fn new(config: &DetachedConfig) -> io::Result<Self> {
        let workers = config.workers.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers)
            .thread_name("script-detached")
            .build()?;
        let capacity = workers + config.queue_capacity;
        Ok(Self {
            runtime: Some(runtime),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    pub fn submit<F>(&self, task: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        let runtime = self.runtime.as_ref().ok_or(SubmitError::ShutDown)?;
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| SubmitError::Full(self.capacity))?;
        runtime.spawn_blocking(move || {
            let _permit = permit;
            task();
        });
        Ok(())
    }

    /// Tasks running or waiting for a worker.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for DetachedPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for DetachedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetachedPool")
            .field("capacity", &self.capacity)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
