use std::fmt;
use std::sync::Arc;

use strum::Display;
use thiserror::Error;
use tokio::sync::watch;

/// Caller-chosen identifier, unique among live tasks.
pub type TaskId = String;

pub(crate) type TaskWork = Box<dyn FnOnce(CancelToken) -> anyhow::Result<String> + Send + 'static>;
pub(crate) type TaskCallback = Box<dyn FnOnce(&TaskResult) + Send + 'static>;

/// A unit of blocking work plus an optional completion callback.
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) work: TaskWork,
    pub(crate) on_finished: Option<TaskCallback>,
}

impl Task {
    pub fn new(
        id: impl Into<TaskId>,
        work: impl FnOnce(CancelToken) -> anyhow::Result<String> + Send + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            work: Box::new(work),
            on_finished: None,
        }
    }

    /// Called once with the result, before any global listener.
    pub fn on_finished(mut self, callback: impl FnOnce(&TaskResult) + Send + 'static) -> Self {
        self.on_finished = Some(Box::new(callback));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("has_callback", &self.on_finished.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TaskState {
    /// Accepted, waiting for a worker.
    Queued,
    Running,
    Completed,
    Failed,
}

/// Outcome of a task, produced exactly once.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub id: TaskId,
    pub content: Option<String>,
    pub has_error: bool,
    pub error_message: String,
    pub cause: Option<Arc<anyhow::Error>>,
    /// Set when the task was canceled before it finished; such results
    /// reach the task's own callback but not the global listeners.
    pub canceled: bool,
}

impl TaskResult {
    pub fn success(id: impl Into<TaskId>, content: String) -> Self {
        Self {
            id: id.into(),
            content: Some(content),
            has_error: false,
            error_message: String::new(),
            cause: None,
            canceled: false,
        }
    }

    pub fn failure(id: impl Into<TaskId>, error: anyhow::Error) -> Self {
        Self {
            id: id.into(),
            content: None,
            has_error: true,
            error_message: format!("{error:#}"),
            cause: Some(Arc::new(error)),
            canceled: false,
        }
    }

    pub fn state(&self) -> TaskState {
        if self.has_error {
            TaskState::Failed
        } else {
            TaskState::Completed
        }
    }
}

/// Read side of a task's cancellation flag.
///
/// Bodies may poll it between steps; nothing interrupts a body that does not.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelToken {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx: Some(rx) }
    }

    /// A token that is never canceled.
    pub fn never() -> Self {
        Self::default()
    }

    pub fn is_canceled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("a task with id '{id}' is already running")]
    DuplicateTask { id: TaskId },

    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("task service has shut down")]
    ServiceShutdown,
}
