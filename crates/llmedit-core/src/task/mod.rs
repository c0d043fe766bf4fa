//! Background task execution.
//!
//! [`TaskService`] accepts [`Task`]s, runs their bodies on tokio's blocking
//! pool, and routes each [`TaskResult`] first to the task's own callback and
//! then to the global listeners. A busy flag is raised when the first task is
//! accepted and lowered when the last one finishes.

mod pool;
mod service;
mod types;

pub use pool::{WorkerPermit, WorkerPool};
pub use service::{TaskService, TaskServiceConfig};
pub use types::{CancelToken, Task, TaskError, TaskId, TaskResult, TaskState};

#[cfg(test)]
mod tests;
