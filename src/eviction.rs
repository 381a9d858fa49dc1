//! Eviction engine (C7, spec.md §4.8): scan for cold pages, quiesce them,
//! write back dirty content, and drop the local mapping.

use crate::backend::CompletionKind;
use crate::config::CHUNK_SIZE;
use crate::error::{Error, Result};
use crate::flags::{PageFlags, AWAITED, DIRTY, EVICT_ONGOING, HOT_MARKER, NOEVICT, PRESENT, WORK_ONGOING};
use crate::region::Region;
use crate::stats::Stats;
use crate::sys::{self, uffd};
use std::sync::atomic::Ordering;

/// Replacement policy chosen at engine initialisation (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementPolicy {
    /// Evict the next eligible page in scan order.
    None,
    /// Give each page one "hot" reprieve before it's eligible.
    SecondChance,
    /// Skip pages the configured [`AccessTracker`] reports as recently
    /// accessed.
    Lru,
}

/// Kernel-assisted recency oracle for the LRU policy (spec.md §4.8:
/// "relies on kernel-assisted young-bit reads"). Reading the actual
/// accessed/young bit requires `/proc/self/pagemap` or soft-dirty tracking,
/// which is environment-specific; this crate defines the contract and a
/// conservative default that treats nothing as recently accessed.
pub trait AccessTracker: Send + Sync {
    fn recently_accessed(&self, addr: usize) -> bool;
}

/// Default [`AccessTracker`]: never reports a page as recently accessed,
/// so the `Lru` policy degrades to `None` until a real young-bit reader is
/// plugged in.
#[derive(Debug, Default)]
pub struct NoopAccessTracker;

impl AccessTracker for NoopAccessTracker {
    fn recently_accessed(&self, _addr: usize) -> bool {
        false
    }
}

pub struct EvictionEngine {
    policy: ReplacementPolicy,
    access_tracker: Box<dyn AccessTracker>,
    batch_max: usize,
    tlb_flush_min: usize,
}

impl EvictionEngine {
    pub fn new(policy: ReplacementPolicy, batch_max: usize, tlb_flush_min: usize) -> Self {
        Self {
            policy,
            access_tracker: Box::new(NoopAccessTracker),
            batch_max,
            tlb_flush_min,
        }
    }

    pub fn with_access_tracker(mut self, tracker: Box<dyn AccessTracker>) -> Self {
        self.access_tracker = tracker;
        self
    }

    /// Scans from the region's rotating cursor, selects up to `batch_max`
    /// eligible pages, and commits them. Returns the number of pages
    /// evicted (0 if none were eligible this pass).
    pub fn run_batch(&self, region: &Region, stats: &Stats) -> Result<usize> {
        let page_count = region.page_count();
        if page_count == 0 {
            return Ok(0);
        }

        let mut batch = Vec::with_capacity(self.batch_max);
        let start = region.next_scan.load(Ordering::Relaxed) % page_count;
        let mut idx = start;
        for _ in 0..page_count {
            if batch.len() >= self.batch_max {
                break;
            }
            let addr = region.page_addr(idx);
            self.consider(region, addr, &mut batch);
            idx = (idx + 1) % page_count;
        }
        region.next_scan.store(idx, Ordering::Relaxed);

        if batch.is_empty() {
            return Ok(0);
        }
        let n = batch.len();
        self.commit_batch(region, &batch, stats)?;
        Ok(n)
    }

    fn consider(&self, region: &Region, addr: usize, batch: &mut Vec<usize>) {
        let pf = region.page_flags(addr);
        let flags = pf.get();
        if !PageFlags::is_set(flags, PRESENT) || PageFlags::is_set(flags, NOEVICT) {
            return;
        }
        if PageFlags::is_set(flags, WORK_ONGOING) {
            return;
        }

        let eligible = match self.policy {
            ReplacementPolicy::None => true,
            ReplacementPolicy::SecondChance => {
                if PageFlags::is_set(flags, HOT_MARKER) {
                    pf.clear(HOT_MARKER);
                    false
                } else {
                    true
                }
            }
            ReplacementPolicy::Lru => !self.access_tracker.recently_accessed(addr),
        };
        if !eligible {
            return;
        }

        if pf
            .compare_exchange(flags, flags | WORK_ONGOING | EVICT_ONGOING)
            .is_ok()
        {
            batch.push(addr);
        }
        // A lost CAS means someone else (a fault, or another evictor pass)
        // just took the page; skip it this round rather than retry.
    }

    fn commit_batch(&self, region: &Region, batch: &[usize], stats: &Stats) -> Result<()> {
        write_protect_runs(region, batch, self.tlb_flush_min)?;

        let mut dirty = Vec::new();
        let mut clean = Vec::new();
        for &addr in batch {
            let pf = region.page_flags(addr);
            if PageFlags::is_set(pf.get(), DIRTY) {
                pf.clear(DIRTY);
                dirty.push(addr);
            } else {
                clean.push(addr);
            }
        }

        for &addr in &dirty {
            self.writeback_with_retry(region, addr, stats)?;
        }

        for &addr in batch {
            // SAFETY: this page's WORK_ONGOING is held exclusively by this
            // evictor, so no other thread may be touching its frame.
            unsafe { sys::madvise_dontneed(addr, CHUNK_SIZE)? };
            region.release_page(true);

            let pf = region.page_flags(addr);
            pf.clear(PRESENT | EVICT_ONGOING | WORK_ONGOING | AWAITED);
            Stats::bump(&stats.evict_pages);
        }
        Ok(())
    }

    /// Writes a dirty page back to the backend, re-issuing the write if the
    /// page was concurrently re-dirtied between the DIRTY snapshot and the
    /// write completing (spec.md §4.8 "Retries and partial failures").
    fn writeback_with_retry(&self, region: &Region, addr: usize, stats: &Stats) -> Result<()> {
        loop {
            let mut buf = vec![0u8; CHUNK_SIZE];
            // SAFETY: the page is write-protected (mutators quiesced) but
            // still mapped, so a direct read observes the stable snapshot.
            unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), CHUNK_SIZE) };

            let channel = region.default_channel;
            let cb_ctx = addr as u64;
            let offset = region.remote_offset(addr);
            region
                .backend
                .post_write(channel, offset, buf.as_ptr() as usize, CHUNK_SIZE, cb_ctx)?;

            let mut attempts = 0;
            loop {
                let completions = region.backend.poll_completions(channel, 64)?;
                if completions
                    .iter()
                    .any(|c| c.kind == CompletionKind::Write && c.cb_ctx == cb_ctx)
                {
                    break;
                }
                attempts += 1;
                if attempts > 10_000 {
                    return Err(Error::fatal("eviction write-back completion never observed"));
                }
            }
            Stats::bump(&stats.net_write);

            let pf = region.page_flags(addr);
            if PageFlags::is_set(pf.get(), DIRTY) {
                pf.clear(DIRTY);
                Stats::bump(&stats.evict_wp_retries);
                continue;
            }
            return Ok(());
        }
    }
}

fn write_protect_runs(region: &Region, batch: &[usize], tlb_flush_min: usize) -> Result<()> {
    if batch.len() < tlb_flush_min {
        for &addr in batch {
            uffd::writeprotect(region.uffd_fd, addr, CHUNK_SIZE, true, true)?;
        }
        return Ok(());
    }

    let mut i = 0;
    while i < batch.len() {
        let start = batch[i];
        let mut end = start + CHUNK_SIZE;
        let mut j = i + 1;
        while j < batch.len() && batch[j] == end {
            end += CHUNK_SIZE;
            j += 1;
        }
        uffd::writeprotect(region.uffd_fd, start, end - start, true, true)?;
        i = j;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;
    use crate::config::CHUNK_SIZE as CS;
    use crate::fault::{Fault, FaultKind};
    use crate::region::RegionRegistry;
    use crate::scheduler::{ThreadParkScheduler, WaiterTable};
    use crate::statemachine::{self, Outcome};
    use std::sync::Arc;

    #[test]
    fn eviction_round_trip_preserves_content() {
        let registry = RegionRegistry::new();
        let backend = Arc::new(LocalBackend::new());
        let region = registry.register(16 * CS, true, backend, 0, 4 * CS as u64).unwrap();
        let parker: Arc<dyn crate::scheduler::ParkWake> = Arc::new(WaiterTable::new(ThreadParkScheduler));
        let stats = Stats::new();

        // First touch four pages with a per-page pattern byte, driving them
        // present and dirty via the zero-page path.
        for i in 0..4u8 {
            let addr = region.base + i as usize * CS;
            let mut f = Fault::new(addr, FaultKind::Missing, 0, true);
            assert_eq!(
                statemachine::handle(&region, parker.as_ref(), &mut f, &stats).unwrap(),
                Outcome::Done
            );
            unsafe {
                std::ptr::write_bytes(addr as *mut u8, i + 1, CS);
            }
        }

        let engine = EvictionEngine::new(ReplacementPolicy::None, 4, 2);
        let evicted = engine.run_batch(&region, &stats).unwrap();
        assert_eq!(evicted, 4);
        assert_eq!(stats.snapshot().evict_pages, 4);
        assert!(stats.snapshot().net_write >= 4);

        for i in 0..4u8 {
            let addr = region.base + i as usize * CS;
            let flags = region.page_flags(addr).get();
            assert_eq!(flags & PRESENT, 0, "evicted page should no longer be PRESENT");

            let mut f = Fault::new(addr, FaultKind::Missing, 0, false);
            assert_eq!(
                statemachine::handle(&region, parker.as_ref(), &mut f, &stats).unwrap(),
                Outcome::ReadPosted
            );
            // Local backend resolves synchronously; drain its completion.
            let completions = region.backend.poll_completions(0, 16).unwrap();
            assert_eq!(completions.len(), 1);
            statemachine::read_completion(&region, parker.as_ref(), &mut f, &stats).unwrap();

            let byte = unsafe { std::ptr::read(addr as *const u8) };
            assert_eq!(byte, i + 1, "round-tripped content must match what was written");
        }
    }

    #[test]
    fn noevict_page_is_skipped() {
        let registry = RegionRegistry::new();
        let backend = Arc::new(LocalBackend::new());
        let region = registry.register(4 * CS, true, backend, 0, 4 * CS as u64).unwrap();
        let parker: Arc<dyn crate::scheduler::ParkWake> = Arc::new(WaiterTable::new(ThreadParkScheduler));
        let stats = Stats::new();

        let mut f = Fault::new(region.base, FaultKind::Missing, 0, false);
        statemachine::handle(&region, parker.as_ref(), &mut f, &stats).unwrap();
        region.page_flags(region.base).set(NOEVICT);

        let engine = EvictionEngine::new(ReplacementPolicy::None, 4, 2);
        let evicted = engine.run_batch(&region, &stats).unwrap();
        assert_eq!(evicted, 0);
    }
}
