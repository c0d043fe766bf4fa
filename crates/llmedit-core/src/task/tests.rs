use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use super::*;

const WAIT: Duration = Duration::from_secs(5);

/// Forward every global result and busy transition into channels.
fn observe(
    service: &TaskService,
) -> (
    mpsc::UnboundedReceiver<TaskResult>,
    mpsc::UnboundedReceiver<bool>,
) {
    let (finished_tx, finished_rx) = mpsc::unbounded_channel();
    let (busy_tx, busy_rx) = mpsc::unbounded_channel();
    service.subscribe_task_finished(move |result| {
        let _ = finished_tx.send(result.clone());
    });
    service.subscribe_busy_state_changed(move |busy| {
        let _ = busy_tx.send(busy);
    });
    (finished_rx, busy_rx)
}

/// Task whose per-task callback result can be awaited.
fn task_with_reply(
    id: &str,
    work: impl FnOnce(CancelToken) -> anyhow::Result<String> + Send + 'static,
) -> (Task, oneshot::Receiver<TaskResult>) {
    let (tx, rx) = oneshot::channel();
    let task = Task::new(id, work).on_finished(move |result| {
        let _ = tx.send(result.clone());
    });
    (task, rx)
}

/// Body that blocks until the returned sender fires (or is dropped).
fn gated(
    output: &'static str,
) -> (
    impl FnOnce(CancelToken) -> anyhow::Result<String> + Send + 'static,
    std::sync::mpsc::Sender<()>,
) {
    let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
    let work = move |_: CancelToken| {
        let _ = gate_rx.recv();
        Ok(output.to_owned())
    };
    (work, gate_tx)
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

async fn reply(rx: oneshot::Receiver<TaskResult>) -> TaskResult {
    timeout(WAIT, rx)
        .await
        .expect("timed out waiting for task callback")
        .expect("callback dropped")
}

// ── Submission ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn submit_round_trip_notifies_callback_then_listeners() {
    let service = TaskService::start(TaskServiceConfig::default());
    let (mut finished, mut busy) = observe(&service);
    assert!(!service.is_busy());

    let (task, per_task) = task_with_reply("t1", |_| Ok("X".to_owned()));
    service.submit(task).await.unwrap();
    assert!(service.is_busy(), "busy must be set when submit returns");

    let own = reply(per_task).await;
    assert_eq!(own.id, "t1");
    assert_eq!(own.content.as_deref(), Some("X"));
    assert!(!own.has_error);
    assert!(!own.canceled);

    let global = recv(&mut finished).await;
    assert_eq!(global.id, "t1");
    assert_eq!(global.content.as_deref(), Some("X"));

    assert!(recv(&mut busy).await);
    assert!(!recv(&mut busy).await);
    assert!(!service.is_busy());
}

#[tokio::test]
async fn back_to_back_tasks_toggle_busy_twice() {
    let service = TaskService::start(TaskServiceConfig::default());
    let (mut finished, mut busy) = observe(&service);

    for id in ["a", "b"] {
        service
            .submit(Task::new(id, |_| Ok(String::new())))
            .await
            .unwrap();
        assert_eq!(recv(&mut finished).await.id, id);
    }

    let mut transitions = Vec::new();
    for _ in 0..4 {
        transitions.push(recv(&mut busy).await);
    }
    assert_eq!(transitions, vec![true, false, true, false]);
}

#[tokio::test]
async fn overlapping_tasks_keep_busy_until_the_last_finishes() {
    let service = TaskService::start(TaskServiceConfig {
        workers: 2,
        ..TaskServiceConfig::default()
    });
    let (mut finished, mut busy) = observe(&service);

    let (work_a, gate_a) = gated("a");
    let (work_b, gate_b) = gated("b");
    service.submit(Task::new("a", work_a)).await.unwrap();
    service.submit(Task::new("b", work_b)).await.unwrap();
    assert!(recv(&mut busy).await);

    gate_a.send(()).unwrap();
    assert_eq!(recv(&mut finished).await.id, "a");
    assert!(service.is_busy(), "one task is still live");

    gate_b.send(()).unwrap();
    assert_eq!(recv(&mut finished).await.id, "b");
    assert!(!recv(&mut busy).await);
    assert!(busy.try_recv().is_err(), "busy false is emitted only once");
}

#[tokio::test]
async fn duplicate_live_id_is_rejected() {
    let service = TaskService::start(TaskServiceConfig::default());
    let (mut finished, _busy) = observe(&service);

    let (work, gate) = gated("first");
    service.submit(Task::new("same", work)).await.unwrap();
    let err = service
        .submit(Task::new("same", |_| Ok(String::new())))
        .await
        .unwrap_err();
    assert_eq!(err, TaskError::DuplicateTask { id: "same".into() });

    gate.send(()).unwrap();
    assert_eq!(recv(&mut finished).await.content.as_deref(), Some("first"));

    // Once finished, the id is free again.
    service
        .submit(Task::new("same", |_| Ok("second".into())))
        .await
        .unwrap();
    assert_eq!(recv(&mut finished).await.content.as_deref(), Some("second"));
}

#[tokio::test]
async fn queue_capacity_is_enforced() {
    let service = TaskService::start(TaskServiceConfig {
        queue_capacity: 1,
        ..TaskServiceConfig::default()
    });
    let (work, gate) = gated("x");
    service.submit(Task::new("one", work)).await.unwrap();
    assert_eq!(
        service.submit(Task::new("two", |_| Ok(String::new()))).await,
        Err(TaskError::QueueFull { capacity: 1 })
    );
    drop(gate);
}

// ── Failures ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn body_error_becomes_failed_result() {
    let service = TaskService::start(TaskServiceConfig::default());
    let (mut finished, _busy) = observe(&service);

    let (task, per_task) = task_with_reply("bad", |_| Err(anyhow::anyhow!("model exploded")));
    service.submit(task).await.unwrap();

    let own = reply(per_task).await;
    assert!(own.has_error);
    assert!(own.content.is_none());
    assert_eq!(own.error_message, "model exploded");
    assert!(own.cause.is_some());
    assert_eq!(own.state(), TaskState::Failed);

    assert!(recv(&mut finished).await.has_error);
}

#[tokio::test]
async fn panicking_body_is_reported_and_service_survives() {
    let service = TaskService::start(TaskServiceConfig::default());
    let (mut finished, _busy) = observe(&service);

    service
        .submit(Task::new("boom", |_| -> anyhow::Result<String> { panic!("kaboom") }))
        .await
        .unwrap();
    let failed = recv(&mut finished).await;
    assert!(failed.has_error);
    assert!(failed.error_message.contains("panicked"), "{}", failed.error_message);

    service
        .submit(Task::new("after", |_| Ok("fine".into())))
        .await
        .unwrap();
    assert_eq!(recv(&mut finished).await.content.as_deref(), Some("fine"));
}

#[tokio::test]
async fn panicking_callback_does_not_block_global_event() {
    let service = TaskService::start(TaskServiceConfig::default());
    let (mut finished, mut busy) = observe(&service);

    let task = Task::new("t", |_| Ok("ok".into())).on_finished(|_| panic!("callback bug"));
    service.submit(task).await.unwrap();

    assert_eq!(recv(&mut finished).await.id, "t");
    assert!(recv(&mut busy).await);
    assert!(!recv(&mut busy).await);
}

#[tokio::test]
async fn slow_body_times_out() {
    let service = TaskService::start(TaskServiceConfig {
        timeout: Some(Duration::from_millis(50)),
        ..TaskServiceConfig::default()
    });
    let (mut finished, mut busy) = observe(&service);

    let saw_cancel = Arc::new(AtomicBool::new(false));
    let saw_cancel_in_body = Arc::clone(&saw_cancel);
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let work = move |token: CancelToken| {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if token.is_canceled() {
                saw_cancel_in_body.store(true, Ordering::SeqCst);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        // hold the worker until the test has looked at the busy flag
        let _ = release_rx.recv_timeout(Duration::from_secs(2));
        Ok::<_, anyhow::Error>("late".to_owned())
    };
    service.submit(Task::new("slow", work)).await.unwrap();

    let result = recv(&mut finished).await;
    assert!(result.has_error);
    assert!(result.error_message.contains("timed out"), "{}", result.error_message);
    assert!(service.is_busy(), "busy until the timed-out body returns");
    assert!(recv(&mut busy).await);

    release_tx.send(()).unwrap();
    assert!(!recv(&mut busy).await);
    assert!(!service.is_busy());
    assert!(saw_cancel.load(Ordering::SeqCst), "body never saw its token flip");
    assert!(finished.try_recv().is_err());
}

// ── Cancellation ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_suppresses_only_the_global_event() {
    let service = TaskService::start(TaskServiceConfig::default());
    let (mut finished, mut busy) = observe(&service);

    let (work, gate) = gated("late");
    let (task, per_task) = task_with_reply("t", work);
    service.submit(task).await.unwrap();
    assert!(service.cancel("t").await);

    gate.send(()).unwrap();
    let own = reply(per_task).await;
    assert!(own.canceled);
    assert_eq!(own.content.as_deref(), Some("late"));

    assert!(recv(&mut busy).await);
    assert!(!recv(&mut busy).await);

    // A later task is the first thing global listeners see.
    service
        .submit(Task::new("u", |_| Ok(String::new())))
        .await
        .unwrap();
    assert_eq!(recv(&mut finished).await.id, "u");
}

#[tokio::test]
async fn cancel_unknown_task_returns_false() {
    let service = TaskService::start(TaskServiceConfig::default());
    assert!(!service.cancel("ghost").await);
}

#[tokio::test]
async fn queued_task_canceled_before_start_never_runs() {
    let service = TaskService::start(TaskServiceConfig::default());
    let (mut finished, _busy) = observe(&service);

    let (work, gate) = gated("first");
    service.submit(Task::new("running", work)).await.unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let ran_in_body = Arc::clone(&ran);
    let (queued, per_task) = task_with_reply("queued", move |_| {
        ran_in_body.store(true, Ordering::SeqCst);
        Ok(String::new())
    });
    service.submit(queued).await.unwrap();
    assert_eq!(service.state("queued").await, Some(TaskState::Queued));
    assert!(service.cancel("queued").await);

    gate.send(()).unwrap();
    let own = reply(per_task).await;
    assert!(own.canceled);
    assert!(own.has_error);
    assert!(!ran.load(Ordering::SeqCst));

    assert_eq!(recv(&mut finished).await.id, "running");
    assert!(finished.try_recv().is_err());
}

#[tokio::test]
async fn running_body_observes_its_cancel_token() {
    let service = TaskService::start(TaskServiceConfig::default());
    let (started_tx, started_rx) = oneshot::channel();

    let (task, per_task) = task_with_reply("poll", move |token| {
        let _ = started_tx.send(());
        while !token.is_canceled() {
            std::thread::sleep(Duration::from_millis(5));
        }
        anyhow::bail!("stopped early")
    });
    service.submit(task).await.unwrap();
    timeout(WAIT, started_rx).await.unwrap().unwrap();
    assert_eq!(service.state("poll").await, Some(TaskState::Running));

    assert_eq!(service.cancel_all().await, 1);
    let own = reply(per_task).await;
    assert!(own.canceled);
    assert_eq!(own.error_message, "stopped early");
    assert_eq!(service.state("poll").await, None);
}

#[tokio::test]
async fn cancel_flag_is_cleared_for_reused_ids() {
    let service = TaskService::start(TaskServiceConfig::default());
    let (mut finished, _busy) = observe(&service);

    let (work, gate) = gated("x");
    let (task, per_task) = task_with_reply("id", work);
    service.submit(task).await.unwrap();
    service.cancel("id").await;
    gate.send(()).unwrap();
    assert!(reply(per_task).await.canceled);

    service
        .submit(Task::new("id", |_| Ok("again".into())))
        .await
        .unwrap();
    let again = recv(&mut finished).await;
    assert!(!again.canceled);
    assert_eq!(again.content.as_deref(), Some("again"));
}

// ── Worker pool ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn worker_pool_bounds_concurrency() {
    let pool = WorkerPool::new(2);
    assert_eq!(pool.size(), 2);

    let first = pool.acquire().await.unwrap();
    let _second = pool.acquire().await.unwrap();
    assert!(pool.try_acquire().is_none());

    drop(first);
    assert_eq!(pool.available(), 1);
    assert!(pool.try_acquire().is_some());
}

#[test]
fn zero_sized_pool_still_has_one_worker() {
    assert_eq!(WorkerPool::new(0).size(), 1);
}

#[test]
fn never_token_is_never_canceled() {
    assert!(!CancelToken::never().is_canceled());
}
