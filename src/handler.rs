//! Handler thread loop (C8, spec.md §4.7): the dedicated, pinned OS thread
//! that ingests kernel faults, drives the state machine and eviction
//! engine, and drains backend completions.

use crate::config::Config;
use crate::eviction::EvictionEngine;
use crate::fault::{self, Fault, FaultKind};
use crate::scheduler::ParkWake;
use crate::stats::Stats;
use crate::statemachine::{self, Outcome};
use crate::stealing::{self, InFlightReads};
use crate::sys::{self, uffd};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One wait-queue entry: a fault whose first attempt returned `InProgress`
/// or `NeedsEviction`, plus when it was first parked there (spec.md §4.6).
struct Waiting {
    fault: Box<Fault>,
    since: Instant,
}

/// Shared state every handler thread reads and writes into (region,
/// backend, budget bookkeeping). One instance is built by
/// [`crate::engine::Engine`] and cloned (via `Arc`) into each handler
/// thread's spawn closure.
pub struct HandlerShared {
    pub region: crate::region::RegionRef,
    pub config: Config,
    pub eviction: EvictionEngine,
    pub stats: Arc<Stats>,
    pub parker: Arc<dyn ParkWake>,
    pub inflight: Arc<InFlightReads>,
}

/// A single handler thread's private loop state.
pub struct HandlerThread {
    shared: Arc<HandlerShared>,
    channel: usize,
    stop: Arc<AtomicBool>,
    pending_faults: Arc<AtomicUsize>,
    wait_queue: VecDeque<Waiting>,
}

impl HandlerThread {
    pub fn new(shared: Arc<HandlerShared>, channel: usize, stop: Arc<AtomicBool>) -> Self {
        let pending_faults = stealing::register_handler(channel);
        Self {
            shared,
            channel,
            stop,
            pending_faults,
            wait_queue: VecDeque::new(),
        }
    }

    /// Spawns a pinned OS thread running [`HandlerThread::run`].
    pub fn spawn(shared: Arc<HandlerShared>, channel: usize, core_id: usize, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name(format!("rmem-handler-{channel}"))
            .spawn(move || {
                if let Err(e) = sys::pin_current_thread_to_core(core_id) {
                    tracing::warn!(error = %e, core_id, "failed to pin handler thread");
                }
                let mut handler = HandlerThread::new(shared, channel, stop);
                handler.run();
            })
            .expect("failed to spawn handler thread")
    }

    /// Runs until the stop flag is set *and* this thread has no more
    /// outstanding work of its own — once stop is requested, the loop
    /// keeps ticking until the wait queue is empty and every posted read
    /// has completed, so a shutdown never strands a parked application
    /// thread (spec.md §5: shutdown "drains the wait queue").
    pub fn run(&mut self) {
        loop {
            let stopping = self.stop.load(Ordering::Relaxed);
            if stopping && self.wait_queue.is_empty() && self.pending_faults.load(Ordering::Relaxed) == 0 {
                break;
            }
            self.tick();
        }
    }

    /// Runs exactly one loop iteration; exposed separately so tests can
    /// single-step the handler without spawning a thread.
    pub fn tick(&mut self) {
        let mut nevicts_needed: usize = 0;

        self.drain_wait_queue(&mut nevicts_needed);
        self.ingest_one_kernel_fault(&mut nevicts_needed);

        let pressure = self.shared.region.pressure();
        if nevicts_needed > 0 || pressure >= self.shared.config.eviction_threshold {
            self.drive_eviction(nevicts_needed);
        }

        self.drain_completions();
    }

    fn drain_wait_queue(&mut self, nevicts_needed: &mut usize) {
        let mut remaining = VecDeque::with_capacity(self.wait_queue.len());
        while let Some(mut entry) = self.wait_queue.pop_front() {
            loop {
                match statemachine::handle(&self.shared.region, self.shared.parker.as_ref(), &mut entry.fault, &self.shared.stats) {
                    Ok(Outcome::Done) => {
                        fault::recycle(entry.fault);
                        break;
                    }
                    Ok(Outcome::ReadPosted) => {
                        self.pending_faults.fetch_add(1, Ordering::AcqRel);
                        self.shared.inflight.insert(entry.fault);
                        break;
                    }
                    Ok(Outcome::NeedsEviction) => {
                        *nevicts_needed += 1;
                        remaining.push_back(entry);
                        break;
                    }
                    Ok(Outcome::InProgress) => {
                        if entry.since.elapsed() >= self.shared.config.wait_before_steal {
                            entry.since = Instant::now();
                            let unblocked = stealing::try_unblock_fault(
                                &self.shared.region,
                                self.shared.parker.as_ref(),
                                &self.shared.inflight,
                                &entry.fault,
                                &self.shared.stats,
                            )
                            .unwrap_or(false);
                            if unblocked {
                                continue;
                            }
                        }
                        remaining.push_back(entry);
                        break;
                    }
                    Err(e) => e.abort_process(),
                }
            }
        }
        self.wait_queue = remaining;
    }

    fn ingest_one_kernel_fault(&mut self, nevicts_needed: &mut usize) {
        let msg = match uffd::try_read_message(self.shared.region.uffd_fd) {
            Ok(Some(msg)) => msg,
            Ok(None) => return,
            Err(e) => e.abort_process(),
        };
        if msg.event != uffd::UFFD_EVENT_PAGEFAULT {
            crate::error::Error::fatal(format!("unsupported uffd event {}", msg.event)).abort_process();
        }

        let addr = (msg.pagefault.address as usize) & !crate::config::CHUNK_MASK;
        let is_wrprotect = msg.pagefault.flags & uffd::UFFD_PAGEFAULT_FLAG_WP != 0;
        let is_write = msg.pagefault.flags & uffd::UFFD_PAGEFAULT_FLAG_WRITE != 0;
        let kind = if is_wrprotect { FaultKind::WriteProtect } else { FaultKind::Missing };

        let mut f = fault::alloc(addr, kind, self.channel, is_write || is_wrprotect);
        match statemachine::handle(&self.shared.region, self.shared.parker.as_ref(), &mut f, &self.shared.stats) {
            Ok(Outcome::Done) => fault::recycle(f),
            Ok(Outcome::ReadPosted) => {
                self.pending_faults.fetch_add(1, Ordering::AcqRel);
                self.shared.inflight.insert(f);
            }
            Ok(Outcome::NeedsEviction) => {
                *nevicts_needed += 1;
                self.wait_queue.push_back(Waiting { fault: f, since: Instant::now() });
            }
            Ok(Outcome::InProgress) => {
                self.wait_queue.push_back(Waiting { fault: f, since: Instant::now() });
            }
            Err(e) => e.abort_process(),
        }
    }

    fn drive_eviction(&mut self, nevicts_needed: usize) {
        let mut done = 0usize;
        let target = nevicts_needed.max(1);
        let mut bumps = 0usize;
        while done < target && bumps < self.shared.config.bumps_per_op {
            let n = match self.shared.eviction.run_batch(&self.shared.region, &self.shared.stats) {
                Ok(n) => n,
                Err(e) => e.abort_process(),
            };
            if n == 0 {
                break;
            }
            done += n;
            bumps += 1;
        }
    }

    fn drain_completions(&mut self) {
        let completions = match self.shared.region.backend.poll_completions(self.channel, self.shared.config.compl_per_op) {
            Ok(c) => c,
            Err(e) => e.abort_process(),
        };
        for c in completions {
            if c.kind != crate::backend::CompletionKind::Read {
                continue;
            }
            let addr = c.cb_ctx as usize;
            if let Some(mut victim) = self.shared.inflight.take(addr) {
                if let Err(e) = statemachine::read_completion(&self.shared.region, self.shared.parker.as_ref(), &mut victim, &self.shared.stats) {
                    e.abort_process();
                }
                self.pending_faults.fetch_sub(1, Ordering::AcqRel);
                fault::recycle(victim);
            }
        }
    }
}

/// Sleeps briefly — used between ticks by callers that want a lighter
/// polling cadence than a hot spin (not used by the handler loop itself,
/// which spins deliberately per spec.md §4.7, but handy for tests driving
/// `tick()` manually while waiting on another thread).
pub fn backoff() {
    std::thread::sleep(Duration::from_micros(50));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;
    use crate::eviction::ReplacementPolicy;
    use crate::region::RegionRegistry;
    use crate::scheduler::{ThreadParkScheduler, WaiterTable};
    use std::sync::Arc;

    fn shared(local_memory: u64) -> Arc<HandlerShared> {
        let registry = RegionRegistry::new();
        let backend = Arc::new(LocalBackend::new());
        let region = registry.register(16 * crate::config::CHUNK_SIZE, true, backend, 0, local_memory).unwrap();
        Arc::new(HandlerShared {
            region,
            config: Config::for_test(local_memory, 0.5),
            eviction: EvictionEngine::new(ReplacementPolicy::None, 4, 2),
            stats: Arc::new(Stats::new()),
            parker: Arc::new(WaiterTable::new(ThreadParkScheduler)),
            inflight: Arc::new(InFlightReads::new()),
        })
    }

    #[test]
    fn tick_with_no_kernel_events_is_a_no_op() {
        let shared = shared(64 * 1024);
        let stop = Arc::new(AtomicBool::new(false));
        let mut handler = HandlerThread::new(shared.clone(), 0, stop);
        handler.tick();
        assert_eq!(shared.stats.snapshot().faults, 0);
        assert!(handler.wait_queue.is_empty());
    }

    #[test]
    fn requeued_in_progress_fault_eventually_resolves() {
        let shared = shared(64 * 1024);
        let stop = Arc::new(AtomicBool::new(false));
        let mut handler = HandlerThread::new(shared.clone(), 0, stop);

        let addr = shared.region.base;
        shared.region.page_flags(addr).try_lock(999).unwrap();
        let f = fault::alloc(addr, FaultKind::Missing, 0, false);
        handler.wait_queue.push_back(Waiting { fault: f, since: Instant::now() });

        let mut nevicts = 0;
        handler.drain_wait_queue(&mut nevicts);
        assert_eq!(handler.wait_queue.len(), 1, "still locked by another owner");

        shared.region.page_flags(addr).unlock(0);
        handler.drain_wait_queue(&mut nevicts);
        assert!(handler.wait_queue.is_empty());
        assert_eq!(shared.stats.snapshot().zero_page_faults, 1);
    }
}
