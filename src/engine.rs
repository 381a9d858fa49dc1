//! Public facade (spec.md §4.10): `Engine::init` wires config, backend,
//! and handler threads together; `Engine::shutdown` tears them down.
//!
//! The one managed [`Region`](crate::region::Region) is registered lazily,
//! on the first call that needs it ([`Engine::handle_mmap`]), rather than
//! eagerly at `init` time — `spec.md` names no region size of its own, and
//! the allocation shim only learns the application's requested size when
//! it intercepts the first managed `mmap`.

use crate::backend::local::LocalBackend;
use crate::backend::Backend;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::eviction::{EvictionEngine, ReplacementPolicy};
use crate::handler::{HandlerShared, HandlerThread};
use crate::region::{page_aligned, RegionRef, RegionRegistry};
use crate::scheduler::{ParkWake, ThreadParkScheduler, WaiterTable};
use crate::stats::Stats;
use crate::stealing::InFlightReads;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

static GLOBAL: OnceCell<Arc<Engine>> = OnceCell::new();

/// Top-level runtime handle. Construct via [`Engine::init`]; the process
/// normally holds exactly one, reachable process-wide through
/// [`Engine::global`] for the allocation shim's benefit.
pub struct Engine {
    config: Config,
    backend: Arc<dyn Backend>,
    registry: RegionRegistry,
    region: Mutex<Option<RegionRef>>,
    stats: Arc<Stats>,
    parker: Arc<dyn ParkWake>,
    inflight: Arc<InFlightReads>,
    eviction_policy: ReplacementPolicy,
    stop: Arc<AtomicBool>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Engine {
    /// Reads `LOCAL_MEMORY`/`EVICTION_THRESHOLD` and builds the shared
    /// runtime state. Returns [`Error::InitFailure`] if the required
    /// environment variable is absent or invalid — per spec.md §6, the
    /// caller (the shim) must then fall back to the system allocator.
    pub fn init() -> Result<Arc<Engine>> {
        let config = Config::from_env().map_err(|e| Error::InitFailure(e.to_string()))?;
        let backend = select_backend()?;

        Ok(Arc::new(Engine {
            config,
            backend,
            registry: RegionRegistry::new(),
            region: Mutex::new(None),
            stats: Arc::new(Stats::new()),
            parker: Arc::new(WaiterTable::new(ThreadParkScheduler)),
            inflight: Arc::new(InFlightReads::new()),
            eviction_policy: ReplacementPolicy::SecondChance,
            stop: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        }))
    }

    /// Returns the process-wide engine, lazily calling [`Engine::init`] on
    /// first access. If initialization fails (no `LOCAL_MEMORY` set), a
    /// disabled engine is cached instead so repeated allocation calls
    /// don't repeatedly retry env parsing; every entry point on a disabled
    /// engine returns [`Error::InitFailure`], which the shim interprets as
    /// "pass through to the system allocator".
    pub fn global() -> Arc<Engine> {
        GLOBAL
            .get_or_init(|| Engine::init().unwrap_or_else(|_| Engine::disabled()))
            .clone()
    }

    fn disabled() -> Arc<Engine> {
        Arc::new(Engine {
            config: Config::for_test(0, crate::config::DEFAULT_EVICTION_THRESHOLD),
            backend: Arc::new(LocalBackend::new()),
            registry: RegionRegistry::new(),
            region: Mutex::new(None),
            stats: Arc::new(Stats::new()),
            parker: Arc::new(WaiterTable::new(ThreadParkScheduler)),
            inflight: Arc::new(InFlightReads::new()),
            eviction_policy: ReplacementPolicy::None,
            stop: Arc::new(AtomicBool::new(true)),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Services an intercepted managed `mmap` (spec.md §6): registers the
    /// sole region on first call and spawns its handler threads, or
    /// returns the existing region's base if one is already registered
    /// (spec.md §4.2: `MAX_REGIONS = 1`).
    pub fn handle_mmap(&self, len: usize, writable: bool) -> Result<usize> {
        if self.config.local_memory == 0 {
            return Err(Error::InitFailure("engine disabled".into()));
        }

        let mut region = self.region.lock().unwrap();
        if let Some(existing) = region.as_ref() {
            return Ok(existing.base);
        }

        let size = page_aligned(len);
        let registered = self
            .registry
            .register(size, writable, self.backend.clone(), 0, self.config.local_memory)?;
        let base = registered.base;
        self.spawn_handlers(&registered);
        *region = Some(registered);
        Ok(base)
    }

    /// Services an intercepted `madvise(MADV_DONTNEED)` inside the managed
    /// range (spec.md §6): drops each present page's local frame and
    /// clears `PRESENT`/`DIRTY`, without requiring the page be cold.
    pub fn handle_madvise_dontneed(&self, addr: usize, len: usize) -> Result<()> {
        use crate::config::CHUNK_SIZE;
        use crate::flags::{current_thread_tag, PageFlags, DIRTY, PRESENT};

        let region = self.region.lock().unwrap();
        let region = region.as_ref().ok_or_else(|| Error::fatal("madvise on an unmanaged range"))?;

        let start = addr & !(CHUNK_SIZE - 1);
        let end = addr + len;
        let mut page = start;
        while page < end {
            if region.contains(page) {
                let pf = region.page_flags(page);
                if let Ok(flags) = pf.try_lock(current_thread_tag()) {
                    if PageFlags::is_set(flags, PRESENT) {
                        unsafe { crate::sys::madvise_dontneed(page, CHUNK_SIZE)? };
                        region.release_page(true);
                    }
                    pf.unlock(PRESENT | DIRTY);
                } else {
                    // A handler currently owns this page; leave it to the
                    // normal eviction path rather than contend with it.
                }
            }
            page += CHUNK_SIZE;
        }
        Ok(())
    }

    fn spawn_handlers(&self, region: &RegionRef) {
        let shared = Arc::new(HandlerShared {
            region: region.clone(),
            config: self.config.clone(),
            eviction: EvictionEngine::new(self.eviction_policy, self.config.batch_max, self.config.tlb_flush_min),
            stats: self.stats.clone(),
            parker: self.parker.clone(),
            inflight: self.inflight.clone(),
        });

        let n = handler_count();
        let mut handles = self.handles.lock().unwrap();
        for core in 0..n {
            handles.push(HandlerThread::spawn(shared.clone(), core, core, self.stop.clone()));
        }
    }

    /// Signals every handler thread to stop and blocks until each has
    /// drained its wait queue and joined (spec.md §5).
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let mut handles = self.handles.lock().unwrap();
        for h in handles.drain(..) {
            let _ = h.join();
        }
    }
}

fn select_backend() -> Result<Arc<dyn Backend>> {
    #[cfg(feature = "rdma")]
    {
        if let Ok(endpoint) = std::env::var("RMEM_RDMA_ENDPOINT") {
            let rdma = crate::backend::rdma::RdmaBackend::connect(&endpoint)?;
            return Ok(Arc::new(rdma));
        }
    }
    Ok(Arc::new(LocalBackend::new()))
}

fn handler_count() -> usize {
    let n = std::env::var("RMEM_HANDLER_THREADS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));
    n.min(crate::config::MAX_CHANNELS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_engine_rejects_mmap() {
        let engine = Engine::disabled();
        assert!(engine.handle_mmap(4096, true).is_err());
    }

    #[test]
    fn handle_mmap_is_idempotent_for_the_single_region() {
        std::env::set_var("LOCAL_MEMORY", "1048576");
        let engine = Engine::init().unwrap();
        let base1 = engine.handle_mmap(8192, true).unwrap();
        let base2 = engine.handle_mmap(65536, true).unwrap();
        assert_eq!(base1, base2, "a second mmap call reuses the sole region");
        engine.shutdown();
        std::env::remove_var("LOCAL_MEMORY");
    }
}
