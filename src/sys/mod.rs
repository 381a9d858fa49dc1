//! Thin `unsafe` wrappers around the raw syscalls this crate needs:
//! anonymous mmap/mprotect/munmap (via `rustix`) and the Linux
//! `userfaultfd(2)` protocol (via hand-rolled `libc` ioctls, since neither
//! `libc` nor `rustix` expose it). Keeping all raw syscalls behind this
//! module means the rest of the crate is ordinary safe Rust over these
//! primitives.

pub mod uffd;

use crate::error::{Error, Result};
use std::ptr::NonNull;

/// Reserves an anonymous, private virtual address range. Used for both the
/// managed region itself and its parallel page-flag array.
pub fn mmap_anon(size: usize, writable: bool) -> Result<NonNull<u8>> {
    use rustix::mm::{mmap_anonymous, MapFlags, ProtFlags};

    let mut prot = ProtFlags::READ;
    if writable {
        prot |= ProtFlags::WRITE;
    }
    // SAFETY: anonymous, fixed-address-free mapping; no aliasing concerns.
    let ptr = unsafe { mmap_anonymous(std::ptr::null_mut(), size, prot, MapFlags::PRIVATE) }
        .map_err(|e| Error::fatal(format!("mmap failed: {e}")))?;
    NonNull::new(ptr as *mut u8).ok_or_else(|| Error::fatal("mmap returned null"))
}

/// Unmaps a range previously returned by [`mmap_anon`].
///
/// # Safety
/// `ptr`/`size` must describe a mapping owned exclusively by the caller.
pub unsafe fn munmap(ptr: NonNull<u8>, size: usize) -> Result<()> {
    rustix::mm::munmap(ptr.as_ptr() as *mut _, size)
        .map_err(|e| Error::fatal(format!("munmap failed: {e}")))
}

/// Drops write protection from a range (used after a WP-fault upgrade to
/// dirty, spec.md §4.5 step 3).
///
/// # Safety
/// `ptr`/`size` must lie within a live mapping.
pub unsafe fn mprotect_rw(ptr: *mut u8, size: usize) -> Result<()> {
    use rustix::mm::{mprotect, MprotectFlags};
    mprotect(ptr as *mut _, size, MprotectFlags::READ | MprotectFlags::WRITE)
        .map_err(|e| Error::fatal(format!("mprotect failed: {e}")))
}

/// Zaps the local mapping for `[addr, addr+size)` without unmapping the
/// VMA, dropping the resident page so the kernel must re-fault it on next
/// access (spec.md §4.8 step 4: "drop the local mapping via kernel zap").
///
/// # Safety
/// `addr`/`size` must lie within a live mapping this thread is allowed to
/// discard (the caller must already hold the page's `WORK_ONGOING` lock).
pub unsafe fn madvise_dontneed(addr: usize, size: usize) -> Result<()> {
    use rustix::mm::{madvise, Advice};
    madvise(addr as *mut _, size, Advice::DontNeed)
        .map_err(|e| Error::fatal(format!("madvise(MADV_DONTNEED) failed: {e}")))
}

/// Pins the calling thread to a specific core (spec.md §4.7: handler
/// threads are "pinned to a dedicated core").
pub fn pin_current_thread_to_core(core_id: usize) -> Result<()> {
    use rustix::process::{sched_setaffinity, CpuSet};

    let mut set = CpuSet::new();
    set.set(core_id);
    // `None` targets the calling thread.
    sched_setaffinity(None, &set).map_err(|e| Error::fatal(format!("sched_setaffinity failed: {e}")))
}
