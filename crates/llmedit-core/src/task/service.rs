use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::pool::WorkerPool;
use super::types::{
    CancelToken, Task, TaskCallback, TaskError, TaskId, TaskResult, TaskState, TaskWork,
};

type FinishedListener = Box<dyn FnMut(&TaskResult) + Send + 'static>;
type BusyListener = Box<dyn FnMut(bool) + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskServiceConfig {
    /// Task bodies allowed to run at the same time.
    pub workers: usize,
    /// Live (queued or running) tasks accepted before `submit` fails.
    pub queue_capacity: usize,
    /// Bodies running longer than this produce a failed result. The body's
    /// token is canceled and the service stays busy until it returns.
    pub timeout: Option<Duration>,
}

impl Default for TaskServiceConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_capacity: 16,
            timeout: None,
        }
    }
}

/// Messages processed by the dispatch loop. All bookkeeping happens there.
enum TaskCommand {
    Submit {
        task: Task,
        reply_tx: oneshot::Sender<Result<(), TaskError>>,
    },
    /// A worker picked the task up.
    Started { task_id: TaskId },
    /// A worker produced the task's result. `detached` is set when the body
    /// timed out and is still running.
    Finished { result: TaskResult, detached: bool },
    /// A timed-out body finally returned.
    Released { task_id: TaskId },
    Cancel {
        task_id: TaskId,
        reply_tx: oneshot::Sender<bool>,
    },
    CancelAll { reply_tx: oneshot::Sender<usize> },
    State {
        task_id: TaskId,
        reply_tx: oneshot::Sender<Option<TaskState>>,
    },
    SubscribeFinished(FinishedListener),
    SubscribeBusy(BusyListener),
}

/// Handle to the task service.
///
/// Cloning is cheap; the dispatch loop stops once every handle is dropped and
/// the last in-flight task has reported back.
///
/// # Usage
///
/// ```rust,ignore
/// let service = TaskService::start(TaskServiceConfig::default());
/// service.subscribe_busy_state_changed(|busy| println!("busy: {busy}"));
/// service
///     .submit(Task::new("t1", |_| Ok("done".into())).on_finished(|r| println!("{r:?}")))
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct TaskService {
    command_tx: mpsc::UnboundedSender<TaskCommand>,
    busy_rx: watch::Receiver<bool>,
}

impl TaskService {
    /// Spawn the dispatch loop on the current tokio runtime.
    pub fn start(config: TaskServiceConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (busy_tx, busy_rx) = watch::channel(false);

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            timeout = ?config.timeout,
            "starting task service"
        );
        let dispatcher = Dispatcher {
            pool: WorkerPool::new(config.workers),
            config,
            worker_tx: command_tx.downgrade(),
            tasks: HashMap::new(),
            detached: 0,
            canceled: HashSet::new(),
            finished_listeners: Vec::new(),
            busy_listeners: Vec::new(),
            busy_tx,
        };
        tokio::spawn(dispatcher.run(command_rx));

        Self {
            command_tx,
            busy_rx,
        }
    }

    /// Accept a task for execution.
    ///
    /// Returns once the task is tracked, so [`Self::is_busy`] already reports
    /// `true`. Fails if the id is live or the queue is full.
    pub async fn submit(&self, task: Task) -> Result<(), TaskError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(TaskCommand::Submit { task, reply_tx })
            .map_err(|_| TaskError::ServiceShutdown)?;
        reply_rx.await.map_err(|_| TaskError::ServiceShutdown)?
    }

    /// Mark a live task canceled. Returns whether the task was found.
    ///
    /// The task's own callback still runs; global listeners are skipped.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = TaskCommand::Cancel {
            task_id: task_id.to_owned(),
            reply_tx,
        };
        if self.command_tx.send(command).is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Cancel every live task; returns how many were marked.
    pub async fn cancel_all(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .command_tx
            .send(TaskCommand::CancelAll { reply_tx })
            .is_err()
        {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    pub async fn state(&self, task_id: &str) -> Option<TaskState> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = TaskCommand::State {
            task_id: task_id.to_owned(),
            reply_tx,
        };
        self.command_tx.send(command).ok()?;
        reply_rx.await.ok().flatten()
    }

    /// True while at least one task is queued or running, including bodies
    /// that outlived their timeout.
    pub fn is_busy(&self) -> bool {
        *self.busy_rx.borrow()
    }

    pub fn busy_watch(&self) -> watch::Receiver<bool> {
        self.busy_rx.clone()
    }

    /// Listen for every non-canceled result. Listeners run on the dispatch
    /// loop and must not block.
    pub fn subscribe_task_finished(&self, listener: impl FnMut(&TaskResult) + Send + 'static) {
        self.subscribe(TaskCommand::SubscribeFinished(Box::new(listener)));
    }

    /// Listen for busy transitions (`true` on the first live task, `false`
    /// when none are left).
    pub fn subscribe_busy_state_changed(&self, listener: impl FnMut(bool) + Send + 'static) {
        self.subscribe(TaskCommand::SubscribeBusy(Box::new(listener)));
    }

    fn subscribe(&self, command: TaskCommand) {
        if self.command_tx.send(command).is_err() {
            warn!("subscribe: task service has shut down");
        }
    }
}

struct TaskRecord {
    state: TaskState,
    on_finished: Option<TaskCallback>,
    cancel_tx: watch::Sender<bool>,
}

struct Dispatcher {
    config: TaskServiceConfig,
    pool: WorkerPool,
    /// Weak, so the loop ends once handles and in-flight workers are gone.
    worker_tx: mpsc::WeakUnboundedSender<TaskCommand>,
    tasks: HashMap<TaskId, TaskRecord>,
    /// Timed-out bodies still occupying a worker.
    detached: usize,
    canceled: HashSet<TaskId>,
    finished_listeners: Vec<FinishedListener>,
    busy_listeners: Vec<BusyListener>,
    busy_tx: watch::Sender<bool>,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<TaskCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                TaskCommand::Submit { task, reply_tx } => {
                    let outcome = self.submit(task);
                    let _ = reply_tx.send(outcome);
                }
                TaskCommand::Started { task_id } => self.mark_running(&task_id),
                TaskCommand::Finished { result, detached } => self.finish(result, detached),
                TaskCommand::Released { task_id } => self.release(&task_id),
                TaskCommand::Cancel { task_id, reply_tx } => {
                    let _ = reply_tx.send(self.cancel(&task_id));
                }
                TaskCommand::CancelAll { reply_tx } => {
                    let ids: Vec<TaskId> = self.tasks.keys().cloned().collect();
                    let count = ids.iter().filter(|id| self.cancel(id)).count();
                    let _ = reply_tx.send(count);
                }
                TaskCommand::State { task_id, reply_tx } => {
                    let _ = reply_tx.send(self.tasks.get(&task_id).map(|record| record.state));
                }
                TaskCommand::SubscribeFinished(listener) => self.finished_listeners.push(listener),
                TaskCommand::SubscribeBusy(listener) => self.busy_listeners.push(listener),
            }
        }
        debug!("task service dispatch loop stopped");
    }

    fn submit(&mut self, task: Task) -> Result<(), TaskError> {
        let Task {
            id,
            work,
            on_finished,
        } = task;

        if self.tasks.contains_key(&id) {
            warn!(task_id = %id, "rejecting duplicate task id");
            return Err(TaskError::DuplicateTask { id });
        }
        if self.tasks.len() >= self.config.queue_capacity {
            warn!(task_id = %id, capacity = self.config.queue_capacity, "task queue full");
            return Err(TaskError::QueueFull {
                capacity: self.config.queue_capacity,
            });
        }
        let worker_tx = self.worker_tx.upgrade().ok_or(TaskError::ServiceShutdown)?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.tasks.insert(
            id.clone(),
            TaskRecord {
                state: TaskState::Queued,
                on_finished,
                cancel_tx,
            },
        );
        info!(
            task_id = %id,
            live = self.tasks.len(),
            idle_workers = self.pool.available(),
            "task submitted"
        );
        if self.tasks.len() == 1 {
            self.set_busy(true);
        }

        tokio::spawn(run_task(
            id,
            work,
            self.pool.clone(),
            CancelToken::new(cancel_rx),
            self.config.timeout,
            worker_tx,
        ));
        Ok(())
    }

    fn mark_running(&mut self, task_id: &str) {
        if let Some(record) = self.tasks.get_mut(task_id) {
            record.state = TaskState::Running;
            debug!(task_id, "task running");
        }
    }

    fn cancel(&mut self, task_id: &str) -> bool {
        match self.tasks.get(task_id) {
            Some(record) => {
                record.cancel_tx.send_replace(true);
                self.canceled.insert(task_id.to_owned());
                info!(task_id, "cancellation requested");
                true
            }
            None => {
                warn!(task_id, "cancel: task not found");
                false
            }
        }
    }

    /// Completion sequence: task callback, untrack, busy update, global
    /// event (skipped for canceled tasks), clear the cancel mark.
    ///
    /// A `detached` body is told to stop through its token and keeps the
    /// service busy until [`Self::release`].
    fn finish(&mut self, mut result: TaskResult, detached: bool) {
        let task_id = result.id.clone();
        result.canceled = self.canceled.contains(&task_id);

        let callback = match self.tasks.get_mut(&task_id) {
            Some(record) => {
                if detached {
                    record.cancel_tx.send_replace(true);
                }
                record.state = result.state();
                record.on_finished.take()
            }
            None => {
                warn!(task_id = %task_id, "finished task was not tracked");
                None
            }
        };
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(&result))).is_err() {
                error!(task_id = %task_id, "task callback panicked");
            }
        }

        self.tasks.remove(&task_id);
        if detached {
            self.detached += 1;
        }
        info!(
            task_id = %task_id,
            has_error = result.has_error,
            canceled = result.canceled,
            live = self.tasks.len(),
            "task finished"
        );

        self.update_idle();

        if result.canceled {
            debug!(task_id = %task_id, "skipping global listeners for canceled task");
        } else {
            for listener in &mut self.finished_listeners {
                if catch_unwind(AssertUnwindSafe(|| listener(&result))).is_err() {
                    error!(task_id = %task_id, "task finished listener panicked");
                }
            }
        }

        self.canceled.remove(&task_id);
    }

    fn release(&mut self, task_id: &str) {
        self.detached = self.detached.saturating_sub(1);
        debug!(task_id, detached = self.detached, "timed-out task body returned");
        self.update_idle();
    }

    fn update_idle(&mut self) {
        if self.tasks.is_empty() && self.detached == 0 {
            self.set_busy(false);
        }
    }

    fn set_busy(&mut self, busy: bool) {
        if *self.busy_tx.borrow() == busy {
            return;
        }
        self.busy_tx.send_replace(busy);
        debug!(busy, "busy state changed");
        for listener in &mut self.busy_listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(busy))).is_err() {
                error!(busy, "busy listener panicked");
            }
        }
    }
}

/// Worker side of one task: wait for a slot, run the body on the blocking
/// pool and report the result to the dispatch loop.
async fn run_task(
    task_id: TaskId,
    work: TaskWork,
    pool: WorkerPool,
    token: CancelToken,
    timeout: Option<Duration>,
    tx: mpsc::UnboundedSender<TaskCommand>,
) {
    let (result, pending) = execute(&task_id, work, pool, token, timeout, &tx).await;
    let _ = tx.send(TaskCommand::Finished {
        result,
        detached: pending.is_some(),
    });

    if let Some(handle) = pending {
        if let Err(join_err) = handle.await {
            error!(task_id = %task_id, error = %join_err, "timed-out task body panicked");
        }
        let _ = tx.send(TaskCommand::Released { task_id });
    }
}

type BodyHandle = tokio::task::JoinHandle<anyhow::Result<String>>;

async fn execute(
    task_id: &str,
    work: TaskWork,
    pool: WorkerPool,
    token: CancelToken,
    timeout: Option<Duration>,
    tx: &mpsc::UnboundedSender<TaskCommand>,
) -> (TaskResult, Option<BodyHandle>) {
    let permit = match pool.acquire().await {
        Ok(permit) => permit,
        Err(err) => return (TaskResult::failure(task_id, err.into()), None),
    };
    if token.is_canceled() {
        debug!(task_id, "task canceled before it started");
        let result = TaskResult::failure(task_id, anyhow!("task canceled before it started"));
        return (result, None);
    }
    let _ = tx.send(TaskCommand::Started {
        task_id: task_id.to_owned(),
    });

    // The permit moves into the closure so the slot stays taken until the
    // body returns, even after a timeout.
    let mut handle = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        work(token)
    });

    let joined = match timeout {
        Some(limit) => {
            let outcome = tokio::time::timeout(limit, &mut handle).await;
            match outcome {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(task_id, ?limit, "task timed out");
                    let result =
                        TaskResult::failure(task_id, anyhow!("task timed out after {limit:?}"));
                    return (result, Some(handle));
                }
            }
        }
        None => handle.await,
    };

    let result = match joined {
        Ok(Ok(content)) => TaskResult::success(task_id, content),
        Ok(Err(err)) => {
            debug!(task_id, error = %err, "task body failed");
            TaskResult::failure(task_id, err)
        }
        Err(join_err) => {
            error!(task_id, error = %join_err, "task body panicked");
            TaskResult::failure(task_id, anyhow!("task body panicked: {join_err}"))
        }
    };
    (result, None)
}
