/*!
 * Circuit Breaker Integration Tests
 *
 * Threshold, cooldown and probe behaviour across threads and real time
 */

use loadguard::breaker::{
    CircuitBreaker, CircuitState, FnListener, HalfOpenPolicy, StateChange, TransitionReason,
};
use loadguard::core::clock::ManualClock;
use loadguard::BreakerError;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serial_test::serial;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn unavailable() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, "dependency down")
}

#[test]
#[serial]
fn test_end_to_end_trip_and_recover() {
    let gate = CircuitBreaker::builder("orders-db")
        .failure_threshold(2)
        .failure_expiry(Duration::from_secs(1))
        .reset_timeout(Duration::from_secs(1))
        .build()
        .unwrap();

    for _ in 0..2 {
        let mut permit = gate.try_acquire().expect("closed gate issues permits");
        permit.report_failure(&unavailable()).unwrap();
        permit.release().unwrap();
    }
    assert!(gate.try_acquire().is_none());
    assert_eq!(gate.state(), CircuitState::Open);

    thread::sleep(Duration::from_millis(1100));

    let mut probe = gate.try_acquire().expect("cooldown elapsed");
    assert_eq!(gate.state(), CircuitState::HalfOpen);
    probe.report_success().unwrap();
    probe.release().unwrap();

    assert_eq!(gate.state(), CircuitState::Closed);
    assert_eq!(gate.stats().recent_failures, 0);
}

#[test]
fn test_half_open_admits_one_probe_across_threads() {
    let clock = Arc::new(ManualClock::new());
    let gate = CircuitBreaker::builder("probe")
        .failure_threshold(1)
        .reset_timeout(Duration::from_secs(1))
        .clock(clock.clone())
        .build()
        .unwrap();

    let mut permit = gate.try_acquire().unwrap();
    permit.report_failure(&unavailable()).unwrap();
    drop(permit);
    clock.advance(Duration::from_secs(1));

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let admitted = Arc::new(AtomicUsize::new(0));
    let (hold_tx, hold_rx) = flume::unbounded();

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let gate = gate.clone();
            let barrier = barrier.clone();
            let admitted = admitted.clone();
            let hold_tx = hold_tx.clone();
            thread::spawn(move || {
                barrier.wait();
                if let Some(permit) = gate.try_acquire() {
                    admitted.fetch_add(1, Ordering::SeqCst);
                    // Keep the probe outstanding until every thread has tried
                    hold_tx.send(permit).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(admitted.load(Ordering::SeqCst), 1);
    assert_eq!(gate.outstanding_permits(), 1);

    let mut probe = hold_rx.try_recv().unwrap();
    probe.report_success().unwrap();
    probe.release().unwrap();
    assert_eq!(gate.state(), CircuitState::Closed);
}

#[test]
fn test_open_gate_refuses_until_cooldown() {
    let clock = Arc::new(ManualClock::new());
    let gate = CircuitBreaker::builder("cooldown")
        .failure_threshold(1)
        .reset_timeout(Duration::from_secs(30))
        .clock(clock.clone())
        .build()
        .unwrap();

    gate.call(|| Err::<(), _>(unavailable())).unwrap_err();

    for _ in 0..29 {
        clock.advance(Duration::from_secs(1));
        assert!(gate.try_acquire().is_none());
    }
    clock.advance(Duration::from_secs(1));
    assert!(gate.try_acquire().is_some());
}

#[test]
fn test_failure_while_open_extends_deadline() {
    let clock = Arc::new(ManualClock::new());
    let gate = CircuitBreaker::builder("extend")
        .failure_threshold(1)
        .reset_timeout(Duration::from_secs(10))
        .clock(clock.clone())
        .build()
        .unwrap();

    // Two permits issued while closed; both fail
    let mut first = gate.try_acquire().unwrap();
    let mut second = gate.try_acquire().unwrap();
    first.report_failure(&unavailable()).unwrap();

    clock.advance(Duration::from_secs(5));
    second.report_failure(&unavailable()).unwrap();
    drop((first, second));

    clock.advance(Duration::from_secs(6));
    assert_eq!(gate.state(), CircuitState::Open);
    clock.advance(Duration::from_secs(4));
    assert_eq!(gate.state(), CircuitState::HalfOpen);
}

#[test]
fn test_listeners_observe_full_cycle_after_panic_in_one() {
    let clock = Arc::new(ManualClock::new());
    let seen = Arc::new(parking_lot::Mutex::new(Vec::<(CircuitState, CircuitState)>::new()));
    let sink = seen.clone();

    let gate = CircuitBreaker::builder("observed")
        .failure_threshold(1)
        .reset_timeout(Duration::from_secs(1))
        .clock(clock.clone())
        .listener(Arc::new(FnListener(|_: &StateChange| panic!("broken listener"))))
        .listener(Arc::new(FnListener(move |change: &StateChange| {
            sink.lock().push((change.from, change.to));
        })))
        .build()
        .unwrap();

    gate.call(|| Err::<(), _>(unavailable())).unwrap_err();
    clock.advance(Duration::from_secs(1));
    gate.call(|| Ok::<_, io::Error>(())).unwrap();

    assert_eq!(
        *seen.lock(),
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
}

#[test]
fn test_fatal_classifier_opens_immediately() {
    let gate = CircuitBreaker::builder("fatal")
        .failure_threshold(50)
        .fatal_when(|e| {
            e.downcast_ref::<io::Error>()
                .map_or(false, |e| e.kind() == io::ErrorKind::ConnectionRefused)
        })
        .build()
        .unwrap();
    let rx = gate.subscribe();

    gate.call(|| Err::<(), _>(unavailable())).unwrap_err();

    assert_eq!(gate.state(), CircuitState::Open);
    assert_eq!(rx.try_recv().unwrap().reason, TransitionReason::FatalFailure);
}

#[test]
fn test_released_permit_rejects_reports() {
    let gate = CircuitBreaker::builder("misuse")
        .half_open_policy(HalfOpenPolicy::Accumulate)
        .build()
        .unwrap();
    let mut permit = gate.try_acquire().unwrap();
    permit.release().unwrap();

    assert_eq!(
        permit.report_failure(&unavailable()),
        Err(BreakerError::PermitReleased {
            gate: "misuse".into()
        })
    );
    assert_eq!(gate.stats().recent_failures, 0);
}

proptest! {
    #[test]
    fn prop_opens_exactly_at_threshold(
        threshold in 1u32..8,
        gaps_ms in proptest::collection::vec(0u64..100, 1..16),
    ) {
        // All failures land well inside a 10s window
        let clock = Arc::new(ManualClock::new());
        let gate = CircuitBreaker::builder("prop")
            .failure_threshold(threshold)
            .failure_expiry(Duration::from_secs(10))
            .reset_timeout(Duration::from_secs(60))
            .clock(clock.clone())
            .build()
            .unwrap();

        let mut permits: Vec<_> = gaps_ms
            .iter()
            .map(|_| gate.try_acquire().unwrap())
            .collect();

        for (i, (gap, permit)) in gaps_ms.iter().zip(permits.iter_mut()).enumerate() {
            clock.advance(Duration::from_millis(*gap));
            permit.report_failure(&unavailable()).unwrap();

            let failures = i as u32 + 1;
            let expected = if failures >= threshold {
                CircuitState::Open
            } else {
                CircuitState::Closed
            };
            prop_assert_eq!(gate.state(), expected);
            if expected == CircuitState::Open {
                prop_assert!(gate.try_acquire().is_none());
            }
        }
    }
}
