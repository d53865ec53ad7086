/*!
 * Worker Pool Integration Tests
 *
 * Growth before queueing, keep-alive shrinking, and scheduled execution
 */

use loadguard::pool::{PoolConfig, ScalingPool, ScheduledPool};
use loadguard::{ExecutorError, TaskError, TaskSink};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

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
fn test_grows_to_max_before_queueing() {
    let pool = ScalingPool::new("grow", PoolConfig::new(1, 4, Duration::from_secs(5))).unwrap();
    let (release_tx, release_rx) = flume::unbounded::<()>();

    for i in 0..4 {
        let release_rx = release_rx.clone();
        pool.submit(move || {
            let _ = release_rx.recv();
        })
        .unwrap();
        assert_eq!(pool.pool_size(), i + 1);
        assert_eq!(pool.queued(), 0);
    }

    let release_rx = release_rx.clone();
    let queued = pool
        .submit(move || {
            let _ = release_rx.recv();
        })
        .unwrap();
    assert_eq!(pool.pool_size(), 4);
    assert_eq!(pool.queued(), 1);

    for _ in 0..5 {
        release_tx.send(()).unwrap();
    }
    assert_eq!(queued.get(), Ok(()));
    assert_eq!(pool.largest_pool_size(), 4);

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(2)));
    assert_eq!(pool.completed_tasks(), 5);
}

#[test]
fn test_idle_worker_is_reused_instead_of_spawning() {
    let pool = ScalingPool::new("reuse", PoolConfig::new(1, 4, Duration::from_secs(5))).unwrap();

    pool.submit(|| ()).unwrap().get().unwrap();
    assert!(wait_until(Duration::from_secs(1), || pool.idle_count() == 1));

    pool.submit(|| ()).unwrap().get().unwrap();
    assert_eq!(pool.largest_pool_size(), 1);
}

#[test]
#[serial]
fn test_extra_threads_retire_after_keep_alive() {
    let pool = ScalingPool::new("shrink", PoolConfig::new(1, 3, Duration::from_millis(50))).unwrap();
    let (release_tx, release_rx) = flume::unbounded::<()>();

    let futures: Vec<_> = (0..3)
        .map(|_| {
            let release_rx = release_rx.clone();
            pool.submit(move || {
                let _ = release_rx.recv();
            })
            .unwrap()
        })
        .collect();
    assert_eq!(pool.pool_size(), 3);

    for _ in 0..3 {
        release_tx.send(()).unwrap();
    }
    for future in futures {
        future.get().unwrap();
    }

    assert!(wait_until(Duration::from_secs(2), || pool.pool_size() == 1));
    // The core thread stays
    thread::sleep(Duration::from_millis(150));
    assert_eq!(pool.pool_size(), 1);
}

#[test]
fn test_full_bounded_queue_blocks_submitter() {
    let config = PoolConfig::new(1, 1, Duration::from_secs(5)).with_queue_capacity(1);
    let pool = Arc::new(ScalingPool::new("bounded-queue", config).unwrap());
    let (release_tx, release_rx) = flume::unbounded::<()>();

    for _ in 0..2 {
        let release_rx = release_rx.clone();
        pool.submit(move || {
            let _ = release_rx.recv();
        })
        .unwrap();
    }
    assert_eq!(pool.queued(), 1);

    let blocked = {
        let pool = pool.clone();
        thread::spawn(move || pool.submit(|| "third").map(|future| future.get()))
    };
    assert!(wait_until(Duration::from_secs(2), || pool.blocked_submitters() == 1));

    release_tx.send(()).unwrap();
    release_tx.send(()).unwrap();
    assert_eq!(blocked.join().unwrap(), Ok(Ok("third")));
}

#[test]
fn test_blocked_submitter_can_be_interrupted() {
    let config = PoolConfig::new(1, 1, Duration::from_secs(5)).with_queue_capacity(1);
    let pool = Arc::new(ScalingPool::new("interrupt", config).unwrap());
    let (release_tx, release_rx) = flume::unbounded::<()>();

    for _ in 0..2 {
        let release_rx = release_rx.clone();
        pool.submit(move || {
            let _ = release_rx.recv();
        })
        .unwrap();
    }

    let blocked = {
        let pool = pool.clone();
        thread::spawn(move || pool.submit(|| ()).map(drop))
    };
    assert!(wait_until(Duration::from_secs(2), || pool.blocked_submitters() == 1));

    pool.interrupt_blocked();
    assert!(matches!(
        blocked.join().unwrap(),
        Err(ExecutorError::Interrupted { .. })
    ));

    release_tx.send(()).unwrap();
    release_tx.send(()).unwrap();
}

#[test]
fn test_shutdown_now_returns_queued_tasks() {
    let pool = ScalingPool::new("drain", PoolConfig::new(1, 1, Duration::from_secs(5))).unwrap();
    let (release_tx, release_rx) = flume::unbounded::<()>();

    let running = pool
        .submit(move || {
            let _ = release_rx.recv();
        })
        .unwrap();
    let never_ran = pool.submit(|| 1).unwrap();

    let drained = pool.shutdown_now();
    assert_eq!(drained.len(), 1);
    drop(drained);
    assert_eq!(never_ran.get(), Err(TaskError::Cancelled));

    release_tx.send(()).unwrap();
    assert_eq!(running.get(), Ok(()));
    assert!(pool.await_termination(Duration::from_secs(2)));
}

#[test]
fn test_scheduled_one_shot_fires_after_delay() {
    let scheduler = ScheduledPool::new("timer", PoolConfig::new(1, 2, Duration::from_secs(1))).unwrap();

    let start = Instant::now();
    let handle = scheduler.schedule(Duration::from_millis(50), || "fired").unwrap();
    assert!(!handle.is_periodic());

    assert_eq!(handle.get(), Ok("fired"));
    assert!(start.elapsed() >= Duration::from_millis(45));

    scheduler.shutdown();
    assert!(scheduler.await_termination(Duration::from_secs(2)));
}

#[test]
fn test_cancelled_before_fire_never_runs() {
    let scheduler = ScheduledPool::new("cancel", PoolConfig::new(1, 1, Duration::from_secs(1))).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let counter = ran.clone();
    let handle = scheduler
        .schedule(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert!(handle.cancel());
    assert!(handle.is_cancelled());

    thread::sleep(Duration::from_millis(200));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(handle.get(), Err(TaskError::Cancelled));
}

#[test]
#[serial]
fn test_fixed_rate_repeats_until_cancelled() {
    let scheduler = ScheduledPool::new("ticker", PoolConfig::new(1, 2, Duration::from_secs(1))).unwrap();
    let ticks = Arc::new(AtomicUsize::new(0));

    let counter = ticks.clone();
    let handle = scheduler
        .schedule_at_fixed_rate(Duration::ZERO, Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert!(handle.is_periodic());
    assert!(wait_until(Duration::from_secs(2), || ticks.load(Ordering::SeqCst) >= 3));

    handle.cancel();
    assert!(handle.wait_timeout(Duration::from_secs(1)));
    let after_cancel = ticks.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    // At most one run was already in flight
    assert!(ticks.load(Ordering::SeqCst) <= after_cancel + 1);
}

#[test]
fn test_zero_period_is_rejected() {
    let scheduler = ScheduledPool::new("zero", PoolConfig::new(1, 1, Duration::from_secs(1))).unwrap();

    assert!(matches!(
        scheduler.schedule_with_fixed_delay(Duration::ZERO, Duration::ZERO, || ()),
        Err(ExecutorError::InvalidConfig(_))
    ));
}

#[test]
fn test_shutdown_keeps_one_shots_and_cancels_periodic() {
    let scheduler = ScheduledPool::new("graceful", PoolConfig::new(1, 2, Duration::from_secs(1))).unwrap();

    let one_shot = scheduler.schedule(Duration::from_millis(50), || 7).unwrap();
    let periodic = scheduler
        .schedule_with_fixed_delay(Duration::from_millis(50), Duration::from_millis(10), || ())
        .unwrap();

    scheduler.shutdown();
    assert!(matches!(
        scheduler.schedule(Duration::ZERO, || 0),
        Err(ExecutorError::Shutdown { .. })
    ));

    assert!(periodic.is_cancelled());
    assert_eq!(one_shot.get(), Ok(7));
    assert!(scheduler.await_termination(Duration::from_secs(2)));
    assert!(scheduler.pool().is_terminated());
}

#[test]
fn test_cancel_after_dispatch_before_start() {
    let scheduler = ScheduledPool::new("queued-cancel", PoolConfig::new(1, 1, Duration::from_secs(1))).unwrap();
    let (release_tx, release_rx) = flume::unbounded::<()>();
    let ran = Arc::new(AtomicUsize::new(0));

    // Occupy the only worker so the fired task waits in the queue
    let blocker = scheduler
        .submit(move || {
            let _ = release_rx.recv();
        })
        .unwrap();

    let counter = ran.clone();
    let handle = scheduler
        .schedule(Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || scheduler.pool().queued() == 1));

    assert!(handle.cancel());
    assert!(handle.is_cancelled());

    release_tx.send(()).unwrap();
    assert_eq!(blocker.get(), Ok(()));
    assert_eq!(handle.get(), Err(TaskError::Cancelled));
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    scheduler.shutdown();
    assert!(scheduler.await_termination(Duration::from_secs(2)));
}

#[test]
#[serial]
fn test_await_termination_uses_one_deadline() {
    let scheduler = ScheduledPool::new("one-deadline", PoolConfig::new(1, 1, Duration::from_secs(1))).unwrap();
    let handle = scheduler
        .schedule(Duration::from_millis(100), || thread::sleep(Duration::from_millis(300)))
        .unwrap();
    scheduler.shutdown();

    // The scheduler exits after ~100ms; the pool gets only what is left
    let start = Instant::now();
    assert!(!scheduler.await_termination(Duration::from_millis(200)));
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(190), "gave up after {:?}", waited);
    assert!(waited < Duration::from_millis(280), "waited {:?}", waited);

    assert!(scheduler.await_termination(Duration::from_secs(2)));
    assert_eq!(handle.get(), Ok(()));
}

#[test]
fn test_cancelled_one_shot_does_not_block_termination() {
    let scheduler = ScheduledPool::new("cancel-drain", PoolConfig::new(1, 1, Duration::from_secs(1))).unwrap();
    let handle = scheduler.schedule(Duration::from_secs(3600), || ()).unwrap();

    assert!(handle.cancel());
    scheduler.shutdown();
    assert!(scheduler.await_termination(Duration::from_secs(2)));
    assert_eq!(scheduler.scheduled_count(), 0);
    assert!(scheduler.is_terminated());
}
