use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time view of a pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub max_size: u32,

    /// Live connections (idle + in use + being created)
    pub size: u32,
    pub idle: u32,
    /// Connections checked out by callers, not counting pending acquires
    pub in_use: u32,

    pub connections_created: u64,
    pub connections_closed: u64,
    pub acquired: u64,
    pub acquire_timeouts: u64,
    pub creation_failures: u64,
    pub validation_failures: u64,
    pub evicted: u64,
}

/// Monotonic counters updated without taking the idle lock
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub created: AtomicU64,
    pub closed: AtomicU64,
    pub acquired: AtomicU64,
    pub acquire_timeouts: AtomicU64,
    pub creation_failures: AtomicU64,
    pub validation_failures: AtomicU64,
    pub evicted: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn fill(&self, stats: &mut PoolStats) {
        stats.connections_created = self.created.load(Ordering::Relaxed);
        stats.connections_closed = self.closed.load(Ordering::Relaxed);
        stats.acquired = self.acquired.load(Ordering::Relaxed);
        stats.acquire_timeouts = self.acquire_timeouts.load(Ordering::Relaxed);
        stats.creation_failures = self.creation_failures.load(Ordering::Relaxed);
        stats.validation_failures = self.validation_failures.load(Ordering::Relaxed);
        stats.evicted = self.evicted.load(Ordering::Relaxed);
    }
}
