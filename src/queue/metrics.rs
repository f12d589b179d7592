// Per-kind outcome counters and slot utilization for the observability endpoint

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::queue::jobs::JobKind;

#[derive(Default)]
struct KindCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Default)]
pub struct PoolMetrics {
    kinds: [KindCounters; 3],
    active: AtomicUsize,
    concurrency: AtomicUsize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindStats {
    pub kind: JobKind,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub discarded: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub kinds: Vec<KindStats>,
    pub active_slots: usize,
    pub concurrency: usize,
}

impl PoolMetrics {
    pub fn new(concurrency: usize) -> Self {
        let metrics = Self::default();
        metrics.concurrency.store(concurrency, Ordering::Relaxed);
        metrics
    }

    pub fn record_completed(&self, kind: JobKind) {
        self.kinds[kind.index()].completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self, kind: JobKind) {
        self.kinds[kind.index()].failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self, kind: JobKind) {
        self.kinds[kind.index()].retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self, kind: JobKind) {
        self.kinds[kind.index()].discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn slot_busy(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn slot_idle(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            kinds: JobKind::ALL
                .iter()
                .map(|kind| {
                    let counters = &self.kinds[kind.index()];
                    KindStats {
                        kind: *kind,
                        completed: counters.completed.load(Ordering::Relaxed),
                        failed: counters.failed.load(Ordering::Relaxed),
                        retried: counters.retried.load(Ordering::Relaxed),
                        discarded: counters.discarded.load(Ordering::Relaxed),
                    }
                })
                .collect(),
            active_slots: self.active.load(Ordering::Relaxed),
            concurrency: self.concurrency.load(Ordering::Relaxed),
        }
    }
}
