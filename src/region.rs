//! Region (C2, spec.md §4.2): a contiguous managed virtual range, its
//! parallel page-flag array, and the process-wide registry of regions.

use crate::backend::Backend;
use crate::config::{CHUNK_SIZE, MAX_REGIONS};
use crate::error::{Error, Result};
use crate::flags::PageFlags;
use crate::sys;
use smallvec::SmallVec;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A single registered remote-memory-backed range.
pub struct Region {
    /// Base virtual address of the managed range.
    pub base: usize,
    /// Size of the managed range, in bytes.
    pub size: usize,
    /// Whether the range was registered writable.
    pub writable: bool,
    /// Remote (backend) base offset assigned on registration.
    pub remote_base: u64,
    /// Rotating eviction-scan cursor, in page units from `base`.
    pub next_scan: AtomicUsize,
    /// One [`PageFlags`] per `CHUNK_SIZE`-aligned page.
    flags: Box<[PageFlags]>,
    /// The userfaultfd this region is registered against.
    pub uffd_fd: std::os::unix::io::RawFd,
    /// The backend this region's pages are paged through.
    pub backend: Arc<dyn Backend>,
    /// Backend channel pages in this region are submitted on by default.
    /// (Handler threads each get their own channel; this is only used by
    /// callers without a thread-local channel, e.g. tests.)
    pub default_channel: usize,
    /// Local frame budget this region may occupy, in bytes (`LOCAL_MEMORY`,
    /// spec.md §5 "Memory budget counters"). `MAX_REGIONS = 1`, so this
    /// doubles as the process-wide budget.
    pub local_memory: u64,
    /// Bytes reserved for pages that are either present or have an
    /// in-flight install (a backend read posted but not yet completed).
    /// Always `>= memory_used`.
    pub memory_booked: AtomicU64,
    /// Bytes currently occupied by present pages.
    pub memory_used: AtomicU64,
    refcount: AtomicUsize,
}

impl Region {
    pub fn page_count(&self) -> usize {
        self.size / CHUNK_SIZE
    }

    /// `memory_used / local_memory`, the eviction trigger ratio (spec.md
    /// §4.7 step 3).
    pub fn pressure(&self) -> f64 {
        self.memory_used.load(Ordering::Relaxed) as f64 / self.local_memory as f64
    }

    /// Reserves one page's worth of budget ahead of an install, returning
    /// `false` (and reserving nothing) if doing so would exceed
    /// `local_memory` — the caller must trigger eviction and retry (spec.md
    /// §4.5 "Eviction notifier").
    pub fn try_book_page(&self) -> bool {
        let page = CHUNK_SIZE as u64;
        let mut cur = self.memory_booked.load(Ordering::Relaxed);
        loop {
            if cur + page > self.local_memory {
                return false;
            }
            match self.memory_booked.compare_exchange_weak(
                cur,
                cur + page,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Marks a previously booked page as actually present.
    pub fn commit_page(&self) {
        self.memory_used.fetch_add(CHUNK_SIZE as u64, Ordering::Relaxed);
    }

    /// Releases a page's budget (eviction unmap, or a failed install that
    /// had booked but not yet committed).
    pub fn release_page(&self, was_present: bool) {
        self.memory_booked.fetch_sub(CHUNK_SIZE as u64, Ordering::Relaxed);
        if was_present {
            self.memory_used.fetch_sub(CHUNK_SIZE as u64, Ordering::Relaxed);
        }
    }

    /// Flags for the page containing `addr`. Panics if `addr` is outside
    /// this region — callers must look up the region first.
    pub fn page_flags(&self, addr: usize) -> &PageFlags {
        let idx = (addr - self.base) / CHUNK_SIZE;
        &self.flags[idx]
    }

    pub fn page_index(&self, addr: usize) -> usize {
        (addr - self.base) / CHUNK_SIZE
    }

    pub fn page_addr(&self, idx: usize) -> usize {
        self.base + idx * CHUNK_SIZE
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    /// Remote wire offset for the page at `addr` (spec.md §6: "individual
    /// pages are addressed by `region.remote_base + (page_addr - region.base)`").
    pub fn remote_offset(&self, addr: usize) -> u64 {
        self.remote_base + (addr - self.base) as u64
    }

    fn add_ref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    fn drop_ref(&self) -> usize {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

/// A reference-counted handle to a live region. Dropping the last handle
/// does not itself remove the region — see [`RegionRegistry::remove`] and
/// spec.md §4.2 ("`remove` is only legal when refcount is zero").
pub struct RegionRef(Arc<Region>);

impl RegionRef {
    fn new(region: Arc<Region>) -> Self {
        region.add_ref();
        RegionRef(region)
    }
}

impl Clone for RegionRef {
    fn clone(&self) -> Self {
        RegionRef::new(self.0.clone())
    }
}

impl Drop for RegionRef {
    fn drop(&mut self) {
        self.0.drop_ref();
    }
}

impl std::ops::Deref for RegionRef {
    type Target = Region;
    fn deref(&self) -> &Region {
        &self.0
    }
}

/// A minimal test-and-test-and-set spinlock, matching the single
/// process-wide spinlock spec.md §3/§5 call for around the region list.
/// Region-list contention is rare (registration happens at startup, lookups
/// are read-mostly), so a spinlock is appropriate — but `std` has no
/// built-in one, so this is a small busy-wait CAS loop.
struct SpinLock<T> {
    locked: std::sync::atomic::AtomicBool,
    data: std::cell::UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}

struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    fn new(data: T) -> Self {
        Self {
            locked: std::sync::atomic::AtomicBool::new(false),
            data: std::cell::UnsafeCell::new(data),
        }
    }

    fn lock(&self) -> SpinGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(
                false,
                true,
                std::sync::atomic::Ordering::Acquire,
                std::sync::atomic::Ordering::Relaxed,
            )
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinGuard { lock: self }
    }
}

impl<'a, T> std::ops::Deref for SpinGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> std::ops::DerefMut for SpinGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, std::sync::atomic::Ordering::Release);
    }
}

/// Process-wide registry of live regions, guarded by one spinlock
/// (spec.md §3, §5). Bounded to [`MAX_REGIONS`] (spec.md §4.2 invariant).
pub struct RegionRegistry {
    regions: SpinLock<SmallVec<[Arc<Region>; MAX_REGIONS]>>,
}

impl RegionRegistry {
    pub fn new() -> Self {
        Self {
            regions: SpinLock::new(SmallVec::new()),
        }
    }

    /// Mmaps a fresh anonymous private range, registers it with the kernel
    /// fault source, allocates its flag array, and links it into the
    /// registry (spec.md §4.2 `register`).
    pub fn register(
        &self,
        size: usize,
        writable: bool,
        backend: Arc<dyn Backend>,
        channel: usize,
        local_memory: u64,
    ) -> Result<RegionRef> {
        {
            let regions = self.regions.lock();
            if regions.len() >= MAX_REGIONS {
                return Err(Error::InitFailure(format!(
                    "at most {MAX_REGIONS} region(s) supported"
                )));
            }
        }

        let ptr = sys::mmap_anon(size, writable)?;
        let uffd_fd = sys::uffd::open()?;
        if let Err(e) = sys::uffd::register(uffd_fd, ptr.as_ptr() as usize, size, writable) {
            sys::uffd::close(uffd_fd);
            return Err(e);
        }

        let page_count = size / CHUNK_SIZE;
        let mut flags = Vec::with_capacity(page_count);
        flags.resize_with(page_count, PageFlags::new);

        let remote_base = backend.allocate_remote(size)?;

        let region = Arc::new(Region {
            base: ptr.as_ptr() as usize,
            size,
            writable,
            remote_base,
            next_scan: AtomicUsize::new(0),
            flags: flags.into_boxed_slice(),
            uffd_fd,
            backend,
            default_channel: channel,
            local_memory,
            memory_booked: AtomicU64::new(0),
            memory_used: AtomicU64::new(0),
            refcount: AtomicUsize::new(0),
        });

        self.regions.lock().push(region.clone());
        tracing::info!(base = region.base, size, "region registered");
        Ok(RegionRef::new(region))
    }

    /// Looks up the region containing `addr`. The returned handle holds a
    /// reference for as long as it lives (spec.md §4.2: "A consumer that
    /// acquires a region must hold a reference (`get_mr`) for the duration
    /// of its use").
    pub fn lookup_by_address(&self, addr: usize) -> Option<RegionRef> {
        let regions = self.regions.lock();
        regions
            .iter()
            .find(|r| r.contains(addr))
            .cloned()
            .map(RegionRef::new)
    }

    /// Removes a region. Legal only when its refcount is zero.
    pub fn remove(&self, region: &Region) -> Result<()> {
        if region.refcount.load(Ordering::Acquire) != 0 {
            return Err(Error::fatal("remove() of a region with live references"));
        }
        let mut regions = self.regions.lock();
        let before = regions.len();
        regions.retain(|r| !std::ptr::eq(r.as_ref(), region));
        if regions.len() == before {
            return Err(Error::fatal("remove() of an unregistered region"));
        }
        drop(regions);

        sys::uffd::unregister(region.uffd_fd, region.base, region.size).ok();
        sys::uffd::close(region.uffd_fd);
        region.backend.remove_region()?;
        if let Some(ptr) = NonNull::new(region.base as *mut u8) {
            unsafe { sys::munmap(ptr, region.size).ok() };
        }
        Ok(())
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }
}

impl Default for RegionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience used by tests and the engine to size a region from a
/// [`Config`]-independent byte count.
pub fn page_aligned(size: usize) -> usize {
    (size + CHUNK_SIZE - 1) / CHUNK_SIZE * CHUNK_SIZE
}
