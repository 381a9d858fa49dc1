//! Fault state machine (C6, spec.md §4.5): the single-page `handle`
//! algorithm and its `read_completion` counterpart.

use crate::config::CHUNK_SIZE;
use crate::error::{Error, Result};
use crate::fault::{Fault, FaultKind};
use crate::flags::{
    current_thread_tag, PageFlags, AWAITED, DIRTY, PRESENT, READ_ONGOING, REGISTERED, ZEROPAGE,
};
use crate::region::Region;
use crate::scheduler::ParkWake;
use crate::stats::Stats;
use crate::sys::uffd;

/// Outcome of one `handle` call (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Fault fully resolved; caller releases the descriptor.
    Done,
    /// A backend read is in flight; the descriptor is owned by the backend
    /// until `read_completion` fires.
    ReadPosted,
    /// Another actor holds the page lock; caller must park the fault on
    /// the wait queue and retry later.
    InProgress,
    /// No local frame budget is available to install this page (spec.md
    /// §4.5 "Eviction notifier"). The caller must drive the eviction
    /// engine and retry; counted as a capacity stall.
    NeedsEviction,
}

/// Drives one fault through the page-flag state machine. Read-ahead is
/// elided, as in spec.md's reference algorithm.
pub fn handle(region: &Region, parker: &dyn ParkWake, fault: &mut Fault, stats: &Stats) -> Result<Outcome> {
    Stats::bump(&stats.faults);
    let pf = region.page_flags(fault.addr);

    // Steps 1-2: load flags, attempt to take WORK_ONGOING.
    let flags = match pf.try_lock(current_thread_tag()) {
        Ok(prev) => prev,
        Err(_prev) => {
            Stats::bump(&stats.wait_retries);
            return Ok(Outcome::InProgress);
        }
    };

    let present = PageFlags::is_set(flags, PRESENT);
    let dirty = PageFlags::is_set(flags, DIRTY);
    let registered = PageFlags::is_set(flags, REGISTERED);

    // Step 3: WP fault on a present, clean page upgrades to dirty.
    if fault.kind == FaultKind::WriteProtect && present && !dirty {
        Stats::bump(&stats.faults_wp);
        return finish_dirty_upgrade(region, pf, fault);
    }

    // Step 4: read/write fault on a missing page.
    if fault.kind == FaultKind::Missing && !present {
        if fault.is_write {
            Stats::bump(&stats.faults_w);
        } else {
            Stats::bump(&stats.faults_r);
        }
        if !registered {
            return fulfil_zero_page(region, pf, fault, stats);
        }
        return reserve_backend_read(region, pf, fault, parker, stats);
    }

    // Step 5: write fault on a present, clean page upgrades to dirty
    // (covers a duplicate WP fault's retry, and a write racing a reader).
    if fault.is_write && present && !dirty {
        Stats::bump(&stats.faults_w);
        return finish_dirty_upgrade(region, pf, fault);
    }

    // Step 6: page is present and this access kind is already satisfied —
    // a racing duplicate fault (spec.md §8 scenario 4) lands here.
    if present {
        pf.unlock(0);
        return Ok(Outcome::Done);
    }

    // Step 7: by construction EVICT_ONGOING never coexists with a page we
    // hold WORK_ONGOING on (the evictor sets both atomically together), so
    // reaching here means no rule matched — an invariant violation.
    pf.unlock(0);
    Err(Error::fatal("fault state machine: no rule matched a locked page"))
}

/// Completes a read posted by [`handle`] (spec.md §4.5 `read_completion`).
/// Installs the scratch buffer via the kernel fault API, updates the page
/// flags, and unparks the waiting thread.
pub fn read_completion(region: &Region, parker: &dyn ParkWake, fault: &mut Fault, stats: &Stats) -> Result<()> {
    let pf = region.page_flags(fault.addr);
    if !PageFlags::is_set(pf.get(), READ_ONGOING) {
        return Err(Error::fatal("read_completion on a fault without READ_ONGOING"));
    }
    let scratch = fault
        .scratch
        .take()
        .ok_or_else(|| Error::fatal("read_completion missing scratch buffer"))?;

    uffd::copy(region.uffd_fd, fault.addr, scratch.as_ptr(), CHUNK_SIZE, true)?;
    region.commit_page();
    Stats::bump(&stats.net_read);

    let mut extra = PRESENT;
    if fault.is_write {
        extra |= DIRTY;
    }
    pf.clear(READ_ONGOING | AWAITED);
    pf.set(extra);
    pf.unlock(0);
    fault.read_ongoing = false;

    if let Some(token) = fault.waiter.take() {
        parker.wake(token);
    }
    Ok(())
}

fn finish_dirty_upgrade(region: &Region, pf: &PageFlags, fault: &Fault) -> Result<Outcome> {
    // Drop the kernel write-protection so the retried store succeeds, then
    // publish DIRTY and release the page.
    uffd::writeprotect(region.uffd_fd, fault.addr, CHUNK_SIZE, false, true)?;
    pf.set(DIRTY);
    pf.unlock(0);
    Ok(Outcome::Done)
}

fn fulfil_zero_page(region: &Region, pf: &PageFlags, fault: &Fault, stats: &Stats) -> Result<Outcome> {
    if !region.try_book_page() {
        Stats::bump(&stats.capacity_stalls);
        pf.unlock(0);
        return Ok(Outcome::NeedsEviction);
    }

    uffd::zeropage(region.uffd_fd, fault.addr, CHUNK_SIZE, true)?;
    region.commit_page();
    Stats::bump(&stats.zero_page_faults);

    let mut extra = PRESENT | REGISTERED;
    if fault.is_write {
        extra |= DIRTY;
    } else {
        extra |= ZEROPAGE;
    }
    pf.set(extra);
    pf.unlock(0);
    Ok(Outcome::Done)
}

fn reserve_backend_read(
    region: &Region,
    pf: &PageFlags,
    fault: &mut Fault,
    parker: &dyn ParkWake,
    stats: &Stats,
) -> Result<Outcome> {
    if !region.try_book_page() {
        Stats::bump(&stats.capacity_stalls);
        pf.unlock(0);
        return Ok(Outcome::NeedsEviction);
    }

    let mut scratch = Box::new([0u8; CHUNK_SIZE]);
    let cb_ctx = fault.addr as u64;
    let offset = region.remote_offset(fault.addr);

    match region
        .backend
        .post_read(fault.channel, offset, scratch.as_mut_ptr() as usize, CHUNK_SIZE, cb_ctx)
    {
        Ok(()) => {}
        Err(Error::TransientBackend(_)) => {
            Stats::bump(&stats.wait_retries);
            region.release_page(false);
            pf.unlock(0);
            return Ok(Outcome::InProgress);
        }
        Err(e) => {
            region.release_page(false);
            pf.unlock(0);
            return Err(e);
        }
    }

    fault.scratch = Some(scratch);
    fault.read_ongoing = true;
    pf.set(READ_ONGOING);

    let token = parker.park_and_register();
    fault.waiter = Some(token);
    pf.set(AWAITED);

    Ok(Outcome::ReadPosted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;
    use crate::fault;
    use crate::region::RegionRegistry;
    use crate::scheduler::{ThreadParkScheduler, WaiterTable};
    use std::sync::Arc;

    fn test_region() -> (RegionRegistry, crate::region::RegionRef) {
        let registry = RegionRegistry::new();
        let backend = Arc::new(LocalBackend::new());
        let size = 4 * CHUNK_SIZE;
        let region = registry
            .register(size, true, backend, 0, (size * 2) as u64)
            .unwrap();
        (registry, region)
    }

    #[test]
    fn first_touch_read_is_zero_page() {
        let (_registry, region) = test_region();
        let parker: Arc<dyn ParkWake> = Arc::new(WaiterTable::new(ThreadParkScheduler));
        let stats = Stats::new();
        let mut f = fault::Fault::new(region.base, FaultKind::Missing, 0, false);

        let outcome = handle(&region, parker.as_ref(), &mut f, &stats).unwrap();
        assert_eq!(outcome, Outcome::Done);

        let flags = region.page_flags(region.base).get();
        assert_eq!(flags & PRESENT, PRESENT);
        assert_eq!(flags & DIRTY, 0);
        let snap = stats.snapshot();
        assert_eq!(snap.faults_r, 1);
        assert_eq!(snap.zero_page_faults, 1);
        assert_eq!(snap.net_read, 0);
    }

    #[test]
    fn first_touch_write_sets_dirty_without_backend_io() {
        let (_registry, region) = test_region();
        let parker: Arc<dyn ParkWake> = Arc::new(WaiterTable::new(ThreadParkScheduler));
        let stats = Stats::new();
        let mut f = fault::Fault::new(region.base, FaultKind::Missing, 0, true);

        let outcome = handle(&region, parker.as_ref(), &mut f, &stats).unwrap();
        assert_eq!(outcome, Outcome::Done);

        let flags = region.page_flags(region.base).get();
        assert_eq!(flags & (PRESENT | DIRTY), PRESENT | DIRTY);
        let snap = stats.snapshot();
        assert_eq!(snap.faults_w, 1);
        assert_eq!(snap.net_write, 0);
    }

    #[test]
    fn duplicate_fault_on_present_page_is_done_without_double_counting_io() {
        let (_registry, region) = test_region();
        let parker: Arc<dyn ParkWake> = Arc::new(WaiterTable::new(ThreadParkScheduler));
        let stats = Stats::new();

        let mut f1 = fault::Fault::new(region.base, FaultKind::Missing, 0, false);
        assert_eq!(handle(&region, parker.as_ref(), &mut f1, &stats).unwrap(), Outcome::Done);

        let mut f2 = fault::Fault::new(region.base, FaultKind::Missing, 0, false);
        assert_eq!(handle(&region, parker.as_ref(), &mut f2, &stats).unwrap(), Outcome::Done);

        assert_eq!(stats.snapshot().zero_page_faults, 1);
    }

    #[test]
    fn concurrent_lock_attempt_reports_in_progress() {
        let (_registry, region) = test_region();
        let parker: Arc<dyn ParkWake> = Arc::new(WaiterTable::new(ThreadParkScheduler));
        let stats = Stats::new();

        let pf = region.page_flags(region.base);
        pf.try_lock(999).unwrap();

        let mut f = fault::Fault::new(region.base, FaultKind::Missing, 0, false);
        let outcome = handle(&region, parker.as_ref(), &mut f, &stats).unwrap();
        assert_eq!(outcome, Outcome::InProgress);
        assert_eq!(stats.snapshot().wait_retries, 1);
    }
}
