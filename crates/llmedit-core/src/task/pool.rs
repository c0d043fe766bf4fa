use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::types::TaskError;

/// RAII guard for one worker slot.
///
/// Task bodies hold it for as long as they run, even past a timeout.
pub struct WorkerPermit {
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for WorkerPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPermit").finish()
    }
}

/// Bounds how many task bodies run at once.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free worker slot.
    pub async fn acquire(&self) -> Result<WorkerPermit, TaskError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map(|permit| WorkerPermit { permit })
            .map_err(|_| TaskError::ServiceShutdown)
    }

    /// Take a slot only if one is free right now.
    #[cfg(test)]
    pub(crate) fn try_acquire(&self) -> Option<WorkerPermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| WorkerPermit { permit })
    }
}
