//! Worker-local counters. Updated with relaxed atomics so the hot paths
//! never serialize on them; read by `print_info` and the teardown log.

use core::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub(crate) struct WorkerStats {
    pub progress_calls: AtomicU64,
    pub events: AtomicU64,
    pub signals: AtomicU64,
    pub am_sends: AtomicU64,
    pub eps_created: AtomicU64,
}

impl WorkerStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
