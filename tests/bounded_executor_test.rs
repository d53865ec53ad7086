/*!
 * Bounded Executor Integration Tests
 *
 * Admission limits in front of a real scaling pool
 */

use loadguard::core::{Task, TaskFuture};
use loadguard::executor::{BoundedConfig, BoundedExecutor};
use loadguard::pool::{PoolConfig, ScalingPool};
use loadguard::{ExecutorError, TaskError, TaskSink};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn pool(max_threads: usize) -> Arc<ScalingPool> {
    Arc::new(
        ScalingPool::new(
            "admission-test",
            PoolConfig::new(1, max_threads, Duration::from_secs(1)),
        )
        .unwrap(),
    )
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
#[serial]
fn test_busy_after_bounded_wait() {
    let executor = BoundedExecutor::new(
        "single-slot",
        pool(4),
        BoundedConfig::new(1, Duration::from_millis(50)),
    )
    .unwrap();

    let slow = executor
        .submit(|| thread::sleep(Duration::from_millis(200)))
        .unwrap();

    let start = Instant::now();
    let err = executor.submit(|| ()).unwrap_err();
    let waited = start.elapsed();

    assert!(matches!(err, ExecutorError::Busy { .. }));
    assert!(waited >= Duration::from_millis(45), "gave up after {:?}", waited);
    assert!(waited < Duration::from_millis(190), "waited {:?}", waited);

    assert_eq!(slow.get(), Ok(()));
    assert!(wait_until(Duration::from_secs(1), || executor.in_flight() == 0));
    executor.submit(|| ()).unwrap().get().unwrap();
}

#[test]
fn test_submitter_beyond_capacity_blocks_until_release() {
    let capacity = 3;
    let executor = Arc::new(
        BoundedExecutor::new(
            "blocking",
            pool(capacity),
            BoundedConfig::new(capacity, Duration::from_secs(10)),
        )
        .unwrap(),
    );
    let (release_tx, release_rx) = flume::unbounded::<()>();

    for _ in 0..capacity {
        let release_rx = release_rx.clone();
        executor
            .submit(move || {
                let _ = release_rx.recv();
            })
            .unwrap();
    }
    assert_eq!(executor.available(), 0);

    let extra = {
        let executor = executor.clone();
        thread::spawn(move || executor.submit(|| "admitted").map(|future| future.get()))
    };
    assert!(wait_until(Duration::from_secs(2), || executor.waiting() == 1));
    assert_eq!(executor.in_flight(), capacity);

    release_tx.send(()).unwrap();
    assert_eq!(extra.join().unwrap(), Ok(Ok("admitted")));

    for _ in 1..capacity {
        release_tx.send(()).unwrap();
    }
    assert!(wait_until(Duration::from_secs(2), || executor.in_flight() == 0));
}

#[test]
fn test_interrupted_waiter_gets_interrupted_error() {
    let executor = Arc::new(
        BoundedExecutor::new(
            "interrupt",
            pool(1),
            BoundedConfig::new(1, Duration::from_secs(30)),
        )
        .unwrap(),
    );
    let (release_tx, release_rx) = flume::bounded::<()>(1);
    let _running = executor
        .submit(move || {
            let _ = release_rx.recv();
        })
        .unwrap();

    let waiter = {
        let executor = executor.clone();
        thread::spawn(move || executor.submit(|| ()).map(drop))
    };
    assert!(wait_until(Duration::from_secs(2), || executor.waiting() == 1));

    executor.interrupt_waiters();
    assert!(matches!(
        waiter.join().unwrap(),
        Err(ExecutorError::Interrupted { .. })
    ));

    release_tx.send(()).unwrap();
    assert!(wait_until(Duration::from_secs(2), || executor.in_flight() == 0));
}

#[test]
fn test_invoke_all_collects_every_outcome() {
    let executor = BoundedExecutor::new("batch", pool(4), BoundedConfig::new(4, Duration::from_secs(1)))
        .unwrap();

    let tasks: Vec<Box<dyn FnOnce() -> u32 + Send>> = vec![
        Box::new(|| 1),
        Box::new(|| -> u32 { panic!("bad input") }),
        Box::new(|| 3),
    ];
    let results = executor.invoke_all(tasks).unwrap();

    assert_eq!(results[0], Ok(1));
    assert!(matches!(results[1], Err(TaskError::Panicked(_))));
    assert_eq!(results[2], Ok(3));
    assert!(wait_until(Duration::from_secs(1), || executor.in_flight() == 0));
}

#[test]
fn test_invoke_all_larger_than_capacity_is_refused() {
    let executor = BoundedExecutor::new("small", pool(2), BoundedConfig::fail_fast(2)).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let ran = ran.clone();
            move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }
        })
        .collect();

    assert!(matches!(
        executor.invoke_all(tasks),
        Err(ExecutorError::BatchTooLarge { requested: 3, capacity: 2, .. })
    ));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(executor.available(), 2);
}

#[test]
fn test_invoke_any_returns_a_success() {
    let executor = BoundedExecutor::new("any", pool(3), BoundedConfig::new(3, Duration::from_secs(1)))
        .unwrap();

    let tasks: Vec<Box<dyn FnOnce() -> &'static str + Send>> = vec![
        Box::new(|| -> &'static str { panic!("first replica down") }),
        Box::new(|| "second replica"),
    ];
    assert_eq!(executor.invoke_any(tasks).unwrap(), Ok("second replica"));
}

#[test]
fn test_shutdown_propagates_to_sink() {
    let sink = pool(2);
    let executor = BoundedExecutor::new("lifecycle", sink.clone(), BoundedConfig::fail_fast(2)).unwrap();

    let future = executor
        .submit(|| {
            thread::sleep(Duration::from_millis(30));
            5
        })
        .unwrap();
    executor.shutdown();

    assert!(sink.is_shutdown());
    assert!(matches!(
        executor.submit(|| 0),
        Err(ExecutorError::Shutdown { .. })
    ));
    assert_eq!(future.get(), Ok(5));
    assert!(executor.await_termination(Duration::from_secs(2)));
    assert!(executor.is_terminated());
}

#[test]
fn test_unbounded_admission_wait() {
    let executor = BoundedExecutor::new(
        "unbounded-wait",
        pool(2),
        BoundedConfig::new(1, Duration::MAX),
    )
    .unwrap();

    let slow = executor
        .submit(|| thread::sleep(Duration::from_millis(50)))
        .unwrap();
    // Waits for the slot instead of overflowing the deadline
    let next: TaskFuture<i32> = executor.submit(|| 7).unwrap();

    assert_eq!(slow.get(), Ok(()));
    assert!(next.wait_timeout(Duration::MAX));
    assert_eq!(next.get(), Ok(7));

    let boxed: Task = Box::new(|| ());
    TaskSink::execute(&executor, boxed).unwrap();
    executor.shutdown();
    assert!(executor.await_termination(Duration::MAX));
}
