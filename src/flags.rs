//! Per-page flag word atomics (C1, spec.md §4.1).
//!
//! Each page's state lives in a 16-bit flag word plus an adjacent owner tag
//! identifying which thread currently holds the page-level lock
//! (`WORK_ONGOING`). All multi-bit transitions are a single atomic
//! fetch-or/fetch-and; composite transitions that must observe a precise
//! prior state (e.g. "upgrade to dirty only if present and clean") use CAS
//! on the whole word.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

pub const REGISTERED: u16 = 1 << 0;
pub const PRESENT: u16 = 1 << 1;
pub const DIRTY: u16 = 1 << 2;
pub const NOEVICT: u16 = 1 << 3;
pub const ZEROPAGE: u16 = 1 << 4;
pub const WORK_ONGOING: u16 = 1 << 5;
pub const READ_ONGOING: u16 = 1 << 6;
pub const MAP_ONGOING: u16 = 1 << 7;
pub const EVICT_ONGOING: u16 = 1 << 8;
pub const AWAITED: u16 = 1 << 9;
pub const HOT_MARKER: u16 = 1 << 10;

/// No thread owns the page lock.
pub const NO_OWNER: u32 = 0;

/// Per-thread identity used for the `WORK_ONGOING` owner tag and completion
/// stealing (spec.md "Additional per-page info"). Assigned once per OS
/// thread from a process-wide counter; never reused.
pub fn current_thread_tag() -> u32 {
    thread_local! {
        static TAG: u32 = next_thread_tag();
    }
    TAG.with(|t| *t)
}

fn next_thread_tag() -> u32 {
    use std::sync::atomic::AtomicU32 as Counter;
    static NEXT: Counter = Counter::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Atomic flag word plus owner tag for a single page.
#[derive(Debug)]
pub struct PageFlags {
    bits: AtomicU16,
    owner: AtomicU32,
}

impl Default for PageFlags {
    fn default() -> Self {
        Self {
            bits: AtomicU16::new(0),
            owner: AtomicU32::new(NO_OWNER),
        }
    }
}

impl PageFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire load: use before any data-dependent access to the page frame.
    #[inline]
    pub fn get(&self) -> u16 {
        self.bits.load(Ordering::Acquire)
    }

    /// Sets `mask`, returning the pre-image. Release-ordered.
    #[inline]
    pub fn set(&self, mask: u16) -> u16 {
        self.bits.fetch_or(mask, Ordering::AcqRel)
    }

    /// Clears `mask`, returning the pre-image. Release-ordered (used to
    /// publish, e.g., the clearing of `WORK_ONGOING`).
    #[inline]
    pub fn clear(&self, mask: u16) -> u16 {
        self.bits.fetch_and(!mask, Ordering::AcqRel)
    }

    /// Attempts to atomically OR `WORK_ONGOING` into the word, recording
    /// `owner` as the lock holder on success. Fails (returning the current
    /// flags) if `WORK_ONGOING` was already set by anyone — invariant 1 in
    /// spec.md §3: at most one thread may hold it at a time.
    pub fn try_lock(&self, owner: u32) -> Result<u16, u16> {
        let mut cur = self.bits.load(Ordering::Acquire);
        loop {
            if cur & WORK_ONGOING != 0 {
                return Err(cur);
            }
            match self.bits.compare_exchange_weak(
                cur,
                cur | WORK_ONGOING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => {
                    self.owner.store(owner, Ordering::Release);
                    return Ok(prev);
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Releases the page lock, additionally clearing `extra` in the same
    /// atomic, and clears the owner tag. Release-ordered so that a
    /// subsequent `Acquire` load by another thread observes everything
    /// published before the unlock.
    pub fn unlock(&self, extra: u16) -> u16 {
        let prev = self.bits.fetch_and(!(WORK_ONGOING | extra), Ordering::AcqRel);
        debug_assert_ne!(prev & WORK_ONGOING, 0, "unlock of an unlocked page");
        self.owner.store(NO_OWNER, Ordering::Release);
        prev
    }

    /// Compare-and-swap the whole word. Used for composite transitions that
    /// must observe a precise prior state (e.g. upgrade-to-dirty, or the
    /// eviction batch's "CAS in WORK_ONGOING|EVICT_ONGOING").
    #[inline]
    pub fn compare_exchange(&self, current: u16, new: u16) -> Result<u16, u16> {
        self.bits
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Owner thread tag of whoever currently holds `WORK_ONGOING`, or
    /// [`NO_OWNER`] if unlocked (racy by nature — the caller must re-check
    /// after acting on it, as completion stealing does).
    #[inline]
    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_set(flags: u16, mask: u16) -> bool {
        flags & mask != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_is_exclusive() {
        let pf = PageFlags::new();
        assert!(pf.try_lock(1).is_ok());
        assert!(pf.try_lock(2).is_err());
        pf.unlock(0);
        assert!(pf.try_lock(2).is_ok());
        assert_eq!(pf.owner(), 2);
    }

    #[test]
    fn set_clear_preserve_other_bits() {
        let pf = PageFlags::new();
        pf.set(PRESENT | REGISTERED);
        assert_eq!(pf.get(), PRESENT | REGISTERED);
        pf.set(DIRTY);
        assert_eq!(pf.get(), PRESENT | REGISTERED | DIRTY);
        pf.clear(DIRTY);
        assert_eq!(pf.get(), PRESENT | REGISTERED);
    }

    #[test]
    fn unlock_clears_owner() {
        let pf = PageFlags::new();
        pf.try_lock(current_thread_tag()).unwrap();
        pf.unlock(PRESENT);
        assert_eq!(pf.owner(), NO_OWNER);
        assert_eq!(pf.get() & WORK_ONGOING, 0);
        assert_eq!(pf.get() & PRESENT, 0, "extra clear mask applied");
    }
}
