//! Completion stealing (C9, spec.md §4.9).
//!
//! A fault can end up blocked on a page whose `WORK_ONGOING` is held by a
//! handler thread that is itself slow to drain its own completions (or, in
//! the original system, a worker kthread that has been descheduled). This
//! module lets a waiting handler make progress on someone else's behalf by
//! polling *their* backend channel directly.

use crate::backend::CompletionKind;
use crate::error::Result;
use crate::fault::Fault;
use crate::flags::{current_thread_tag, PageFlags, WORK_ONGOING};
use crate::region::Region;
use crate::scheduler::ParkWake;
use crate::stats::Stats;
use crate::statemachine;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Per-handler bookkeeping the stealing protocol needs to find and account
/// for another thread's in-flight faults.
struct HandlerInfo {
    channel: usize,
    pending_faults: Arc<AtomicUsize>,
}

static REGISTRY: Mutex<Option<HashMap<u32, HandlerInfo>>> = Mutex::new(None);

fn with_registry<R>(f: impl FnOnce(&mut HashMap<u32, HandlerInfo>) -> R) -> R {
    let mut guard = REGISTRY.lock().unwrap();
    f(guard.get_or_insert_with(HashMap::new))
}

/// Registers the calling thread as a handler owning `channel`, returning
/// its pending-fault counter (the handler increments this each time it
/// posts a read and decrements it itself on completion; stealing also
/// decrements it for faults it resolves on the handler's behalf).
pub fn register_handler(channel: usize) -> Arc<AtomicUsize> {
    let tag = current_thread_tag();
    with_registry(|reg| {
        reg.entry(tag)
            .or_insert_with(|| HandlerInfo {
                channel,
                pending_faults: Arc::new(AtomicUsize::new(0)),
            })
            .pending_faults
            .clone()
    })
}

thread_local! {
    /// `(owner_tag, blocking_page, unblocked)` for the steal currently in
    /// flight on this thread — read by the stealer callbacks below
    /// (mirrors the original's `current_stealing_kthr_id` / hopefully
    /// named thread-locals).
    static CURRENT_STEAL: Cell<Option<(u32, usize)>> = Cell::new(None);
    static CURRENT_UNBLOCKED: Cell<bool> = Cell::new(false);
}

/// Attempts to unblock `fault`, which has been waiting longer than
/// `WAIT_BEFORE_STEAL`, by polling the completion queue of whichever
/// thread owns the page it's blocked on. Returns `true` if the blocking
/// page's lock was observed released by the time this call returns (the
/// caller should retry the original fault immediately).
pub fn try_unblock_fault(
    region: &Region,
    parker: &dyn ParkWake,
    inflight: &InFlightReads,
    fault: &Fault,
    stats: &Stats,
) -> Result<bool> {
    let pf = region.page_flags(fault.addr);
    let flags = pf.get();
    if !PageFlags::is_set(flags, WORK_ONGOING) {
        return Ok(true);
    }

    let owner_tag = pf.owner();
    if owner_tag == crate::flags::NO_OWNER || owner_tag == current_thread_tag() {
        // Either released already, or we'd be "stealing" from ourselves.
        return Ok(false);
    }
    let owner_channel = match with_registry(|reg| reg.get(&owner_tag).map(|h| (h.channel, h.pending_faults.clone()))) {
        Some(v) => v,
        None => return Ok(false),
    };
    let (owner_channel, owner_pending) = owner_channel;

    CURRENT_STEAL.with(|c| c.set(Some((owner_tag, fault.addr))));
    CURRENT_UNBLOCKED.with(|c| c.set(false));

    let completions = region.backend.poll_completions(owner_channel, crate::config::MAX_CHUNKS_PER_OP)?;
    let mut stolen_reads = 0usize;
    for c in completions {
        match c.kind {
            CompletionKind::Read => {
                let addr = c.cb_ctx as usize;
                if let Some(mut victim) = inflight.take(addr) {
                    statemachine::read_completion(region, parker, &mut victim, stats)?;
                    crate::fault::recycle(victim);
                    Stats::bump(&stats.ready_steals);
                    stolen_reads += 1;
                    if addr == fault.addr {
                        CURRENT_UNBLOCKED.with(|c| c.set(true));
                    }
                }
            }
            CompletionKind::Write => {
                // Write-backs are drained inline by the eviction engine on
                // the owning thread; nothing for a stealer to do here.
            }
        }
    }

    if stolen_reads > 0 {
        owner_pending.fetch_sub(stolen_reads.min(owner_pending.load(Ordering::Relaxed)), Ordering::AcqRel);
    }

    let unblocked = CURRENT_UNBLOCKED.with(|c| c.get());
    CURRENT_STEAL.with(|c| c.set(None));
    Stats::bump(&stats.wait_steals);
    Ok(unblocked || !PageFlags::is_set(region.page_flags(fault.addr).get(), WORK_ONGOING))
}

/// Shared table of faults that have posted a backend read and are waiting
/// on its completion, keyed by faulting address. Any handler thread's
/// normal completion drain, or another thread's steal, may complete an
/// entry here (spec.md §4.3: "channels … mutated by at most one owner
/// thread except via the stealing protocol").
pub struct InFlightReads {
    table: Mutex<HashMap<usize, Box<Fault>>>,
}

impl InFlightReads {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, fault: Box<Fault>) {
        self.table.lock().unwrap().insert(fault.addr, fault);
    }

    pub fn take(&self, addr: usize) -> Option<Box<Fault>> {
        self.table.lock().unwrap().remove(&addr)
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InFlightReads {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inflight_reads_round_trip() {
        let table = InFlightReads::new();
        let f = crate::fault::Fault::new(0x4000, crate::fault::FaultKind::Missing, 0, false);
        table.insert(Box::new(f));
        assert_eq!(table.len(), 1);
        let taken = table.take(0x4000).unwrap();
        assert_eq!(taken.addr, 0x4000);
        assert!(table.is_empty());
        assert!(table.take(0x4000).is_none());
    }
}
