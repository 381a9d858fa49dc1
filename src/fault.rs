//! Fault descriptor (C3, spec.md §4.3) and its per-thread pool.
//!
//! spec.md §9 resolves the "older vs. newer Fault struct shape" open
//! question in favor of the newer shape: a fault carries everything the
//! state machine needs to drive a page to completion without re-deriving it
//! from the kernel message, including the channel it was submitted on and
//! the scheduler handle of whichever thread is waiting on it.

use crate::flags::current_thread_tag;
use std::cell::RefCell;

/// Why a fault was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// First touch of a missing page.
    Missing,
    /// Write to a read-only (write-protected) present page.
    WriteProtect,
}

/// One in-flight page fault. Allocated from a per-thread pool (below) to
/// avoid a heap allocation on the fault-handling fast path.
#[derive(Debug, Clone)]
pub struct Fault {
    /// Page-aligned faulting address.
    pub addr: usize,
    pub kind: FaultKind,
    /// Backend channel this fault's read/write was submitted on.
    pub channel: usize,
    /// Tag of the handler thread that originally accepted this fault from
    /// the kernel (spec.md §4.9: completion stealing correlates a stolen
    /// completion back to the *originating* thread, not the stealer).
    pub origin_thread: u32,
    /// Opaque resume token for the parked application thread, set once a
    /// [`crate::scheduler::Scheduler::park`] has been performed for it
    /// (see [`crate::scheduler::ParkWake`]).
    pub waiter: Option<usize>,
    /// Backend scratch buffer for an in-flight read, allocated lazily only
    /// when `handle` reserves a backend read (spec.md §4.5 step 4b).
    pub scratch: Option<Box<[u8; crate::config::CHUNK_SIZE]>>,
    /// Set once this fault has posted a read and is awaiting its
    /// completion; guards against double-completing a descriptor.
    pub read_ongoing: bool,
    /// True if the access that raised this fault was a write (kernel
    /// faults set this from `UFFD_PAGEFAULT_FLAG_WRITE`).
    pub is_write: bool,
}

impl Fault {
    pub fn new(addr: usize, kind: FaultKind, channel: usize, is_write: bool) -> Self {
        Self {
            addr,
            kind,
            channel,
            origin_thread: current_thread_tag(),
            waiter: None,
            scratch: None,
            read_ongoing: false,
            is_write,
        }
    }
}

/// Per-thread free list of [`Fault`] allocations (spec.md §4.3: "faults are
/// drawn from a per-thread pool to keep the fault path allocation-free").
/// Since `Fault` no longer needs to outlive the handling thread's stack
/// frame in the common case, the "pool" is just a reusable `Vec` acting as a
/// stack of recycled boxes.
pub struct FaultPool {
    free: RefCell<Vec<Box<Fault>>>,
}

impl FaultPool {
    pub fn new() -> Self {
        Self {
            free: RefCell::new(Vec::new()),
        }
    }

    pub fn alloc(&self, addr: usize, kind: FaultKind, channel: usize, is_write: bool) -> Box<Fault> {
        let fault = Fault::new(addr, kind, channel, is_write);
        match self.free.borrow_mut().pop() {
            Some(mut boxed) => {
                *boxed = fault;
                boxed
            }
            None => Box::new(fault),
        }
    }

    pub fn recycle(&self, boxed: Box<Fault>) {
        let mut free = self.free.borrow_mut();
        // spec.md doesn't size the pool; cap it so a burst doesn't pin
        // unbounded memory to a thread that goes quiet afterward.
        if free.len() < 256 {
            free.push(boxed);
        }
    }
}

impl Default for FaultPool {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static POOL: FaultPool = FaultPool::new();
}

/// Allocates a fault from the calling thread's pool.
pub fn alloc(addr: usize, kind: FaultKind, channel: usize, is_write: bool) -> Box<Fault> {
    POOL.with(|p| p.alloc(addr, kind, channel, is_write))
}

/// Returns a fault to the calling thread's pool. Faults must be recycled on
/// the thread that allocated them — the pool is not `Send`.
pub fn recycle(boxed: Box<Fault>) {
    POOL.with(|p| p.recycle(boxed));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_allocations() {
        let pool = FaultPool::new();
        let f1 = pool.alloc(0x1000, FaultKind::Missing, 0, false);
        let ptr1 = &*f1 as *const Fault;
        pool.recycle(f1);
        let f2 = pool.alloc(0x2000, FaultKind::WriteProtect, 1, true);
        let ptr2 = &*f2 as *const Fault;
        assert_eq!(ptr1, ptr2, "expected recycled allocation to be reused");
        assert_eq!(f2.addr, 0x2000);
        assert_eq!(f2.kind, FaultKind::WriteProtect);
    }

    #[test]
    fn fault_carries_origin_thread() {
        let f = Fault::new(0x3000, FaultKind::Missing, 0, false);
        assert_eq!(f.origin_thread, current_thread_tag());
    }
}
