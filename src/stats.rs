//! Process-local statistics counters.
//!
//! One monotone [`AtomicU64`] per quantity named across spec.md §4 and the
//! testable properties of §8. All counters use `Relaxed` ordering: they are
//! observational bookkeeping and never participate in the page-state
//! invariants (those are enforced by [`crate::flags`]).

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default, Debug)]
pub struct Stats {
    pub faults: AtomicU64,
    pub faults_r: AtomicU64,
    pub faults_w: AtomicU64,
    pub faults_wp: AtomicU64,
    pub zero_page_faults: AtomicU64,
    pub net_read: AtomicU64,
    pub net_write: AtomicU64,
    pub evict_pages: AtomicU64,
    pub evict_wp_retries: AtomicU64,
    pub wait_retries: AtomicU64,
    pub wait_steals: AtomicU64,
    pub ready_steals: AtomicU64,
    pub capacity_stalls: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let l = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            faults: l(&self.faults),
            faults_r: l(&self.faults_r),
            faults_w: l(&self.faults_w),
            faults_wp: l(&self.faults_wp),
            zero_page_faults: l(&self.zero_page_faults),
            net_read: l(&self.net_read),
            net_write: l(&self.net_write),
            evict_pages: l(&self.evict_pages),
            evict_wp_retries: l(&self.evict_wp_retries),
            wait_retries: l(&self.wait_retries),
            wait_steals: l(&self.wait_steals),
            ready_steals: l(&self.ready_steals),
            capacity_stalls: l(&self.capacity_stalls),
        }
    }
}

/// A point-in-time copy of [`Stats`], cheap to pass around and assert on in
/// tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub faults: u64,
    pub faults_r: u64,
    pub faults_w: u64,
    pub faults_wp: u64,
    pub zero_page_faults: u64,
    pub net_read: u64,
    pub net_write: u64,
    pub evict_pages: u64,
    pub evict_wp_retries: u64,
    pub wait_retries: u64,
    pub wait_steals: u64,
    pub ready_steals: u64,
    pub capacity_stalls: u64,
}
