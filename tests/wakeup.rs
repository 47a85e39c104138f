//! The wakeup pipeline: get_efd / arm / wait / signal across threads.

use std::time::{Duration, Instant};

use fabriq::{Context, ContextConfig, Status, ThreadMode, WorkerParams};

fn multi_worker() -> fabriq::Worker {
    let _ = env_logger::builder().is_test(true).try_init();
    let context = Context::new(ContextConfig::default(), &[]).unwrap();
    context
        .worker(&WorkerParams {
            thread_mode: ThreadMode::Multi,
            ..WorkerParams::default()
        })
        .unwrap()
}

#[test]
fn wait_blocks_until_signaled() {
    let worker = multi_worker();
    assert_eq!(worker.query().thread_mode, ThreadMode::Multi);

    let efd = worker.get_efd().unwrap();
    assert_eq!(worker.get_efd().unwrap(), efd, "event fd is stable");

    let started = Instant::now();
    std::thread::scope(|scope| {
        scope.spawn(|| {
            std::thread::sleep(Duration::from_millis(50));
            worker.signal().unwrap();
        });
        worker.wait().unwrap();
    });
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(40), "wait returned early");
    assert!(elapsed < Duration::from_secs(5), "wait overslept: {elapsed:?}");
}

#[test]
fn signal_before_arm_turns_arm_busy() {
    let worker = multi_worker();
    worker.get_efd().unwrap();

    worker.signal().unwrap();
    assert_eq!(worker.arm(), Err(Status::Busy));
    // The busy arm drained the pipe; the next arm is clean.
    assert_eq!(worker.arm(), Ok(()));
}

#[test]
fn signal_before_wait_returns_immediately() {
    let worker = multi_worker();
    worker.signal().unwrap();
    // wait's internal arm sees the pending signal and skips blocking.
    let started = Instant::now();
    worker.wait().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn arm_twice_without_events_stays_ok() {
    let worker = multi_worker();
    worker.get_efd().unwrap();
    assert_eq!(worker.arm(), Ok(()));
    assert_eq!(worker.arm(), Ok(()));
}

#[test]
fn repeated_signals_coalesce() {
    let worker = multi_worker();
    worker.get_efd().unwrap();
    for _ in 0..1024 {
        worker.signal().unwrap();
    }
    assert_eq!(worker.arm(), Err(Status::Busy));
    assert_eq!(worker.arm(), Ok(()), "busy arm drained the pipe");
}
