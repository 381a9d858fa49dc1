//! Allocation shim contract (C10, spec.md §6 / §4.14): the policy
//! decisions an interposing `malloc`/`mmap`/`madvise` layer must make,
//! kept as pure functions so they can be unit-tested without linking a
//! real global allocator.

use std::cell::Cell;

/// Mirrors the subset of `mmap(2)`'s flag bits the routing policy cares
/// about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmapFlags {
    pub anonymous: bool,
    pub private: bool,
    pub fixed: bool,
    pub exec: bool,
    pub stack: bool,
}

/// Where an intercepted `mmap` call should be routed (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapRoute {
    /// Forward to [`crate::engine::Engine`]'s region mapper.
    Managed,
    /// Forward to the real `mmap(2)` unchanged.
    PassThrough,
}

/// Classifies an application `mmap` call. Only anonymous, private,
/// non-fixed, non-executable, non-stack mappings are managed — anything
/// else (file-backed, `MAP_FIXED`, executable, or a stack mapping) passes
/// through untouched.
pub fn classify_mmap(flags: MmapFlags) -> MmapRoute {
    if flags.anonymous && flags.private && !flags.fixed && !flags.exec && !flags.stack {
        MmapRoute::Managed
    } else {
        MmapRoute::PassThrough
    }
}

/// The `madvise(2)` advice values this shim interprets within a managed
/// range; anything else is forwarded unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    DontNeed,
    Other,
}

/// What the engine does with an intercepted `madvise` call inside a
/// managed range (spec.md §6: "MADV_DONTNEED → release frames, clear
/// PRESENT/DIRTY").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MadviseAction {
    ReleaseFrame,
    PassThrough,
}

pub fn classify_madvise(advice: Advice) -> MadviseAction {
    match advice {
        Advice::DontNeed => MadviseAction::ReleaseFrame,
        Advice::Other => MadviseAction::PassThrough,
    }
}

thread_local! {
    /// Set for the duration of any call this crate makes into its own
    /// mmap/munmap/madvise wrappers, so a shim sitting in front of the
    /// global allocator can tell "the runtime is calling the system
    /// allocator on its own behalf" apart from "the application is
    /// calling through the interposed symbol" (spec.md §6: "calls
    /// originating inside the runtime pass through … unchanged").
    static IN_RUNTIME_CALL: Cell<bool> = Cell::new(false);
}

/// `true` while the calling thread is inside a runtime-internal
/// allocation call.
pub fn is_managed_call() -> bool {
    IN_RUNTIME_CALL.with(Cell::get)
}

/// Runs `f` with the re-entrancy guard held, so any interposed symbol `f`
/// calls recognises it as an internal call and passes it straight
/// through to the system allocator.
pub fn with_runtime_call<R>(f: impl FnOnce() -> R) -> R {
    IN_RUNTIME_CALL.with(|c| c.set(true));
    let result = f();
    IN_RUNTIME_CALL.with(|c| c.set(false));
    result
}

/// Process-global `extern "C"` interposition entry points. Gated behind
/// `malloc-shim` because overriding the process's live `malloc`/`mmap`
/// symbols is an environment-wide action a library crate should not take
/// by default; these are thin forwarding shims over the policy functions
/// above plus [`crate::engine::Engine`].
#[cfg(feature = "malloc-shim")]
pub mod interpose {
    use super::*;
    use std::os::raw::{c_int, c_void};

    /// # Safety
    /// Must only be linked as the process's `mmap` symbol by a caller
    /// that accepts full `mmap(2)` calling-convention responsibility.
    #[no_mangle]
    pub unsafe extern "C" fn mmap(
        addr: *mut c_void,
        len: usize,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: i64,
    ) -> *mut c_void {
        if is_managed_call() {
            return libc::mmap(addr, len, prot, flags, fd, offset);
        }
        let classified = MmapFlags {
            anonymous: flags & libc::MAP_ANONYMOUS != 0,
            private: flags & libc::MAP_PRIVATE != 0,
            fixed: flags & libc::MAP_FIXED != 0,
            exec: prot & libc::PROT_EXEC != 0,
            stack: flags & libc::MAP_STACK != 0,
        };
        match classify_mmap(classified) {
            MmapRoute::Managed => match crate::engine::Engine::global().handle_mmap(len, prot & libc::PROT_WRITE != 0) {
                Ok(base) => base as *mut c_void,
                // Engine disabled (no LOCAL_MEMORY) or already at
                // MAX_REGIONS: fall back to a real mmap rather than
                // failing the application's allocation outright.
                Err(_) => with_runtime_call(|| libc::mmap(addr, len, prot, flags, fd, offset)),
            },
            MmapRoute::PassThrough => with_runtime_call(|| libc::mmap(addr, len, prot, flags, fd, offset)),
        }
    }

    /// # Safety
    /// Must only be linked as the process's `madvise` symbol.
    #[no_mangle]
    pub unsafe extern "C" fn madvise(addr: *mut c_void, len: usize, advice: c_int) -> c_int {
        if is_managed_call() {
            return libc::madvise(addr, len, advice);
        }
        let classified = if advice == libc::MADV_DONTNEED { Advice::DontNeed } else { Advice::Other };
        match classify_madvise(classified) {
            MadviseAction::ReleaseFrame => {
                if crate::engine::Engine::global().handle_madvise_dontneed(addr as usize, len).is_ok() {
                    0
                } else {
                    with_runtime_call(|| libc::madvise(addr, len, advice))
                }
            }
            MadviseAction::PassThrough => with_runtime_call(|| libc::madvise(addr, len, advice)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_private_mapping_is_managed() {
        let flags = MmapFlags {
            anonymous: true,
            private: true,
            fixed: false,
            exec: false,
            stack: false,
        };
        assert_eq!(classify_mmap(flags), MmapRoute::Managed);
    }

    #[test]
    fn fixed_exec_or_stack_mappings_pass_through() {
        let base = MmapFlags {
            anonymous: true,
            private: true,
            fixed: false,
            exec: false,
            stack: false,
        };
        assert_eq!(classify_mmap(MmapFlags { fixed: true, ..base }), MmapRoute::PassThrough);
        assert_eq!(classify_mmap(MmapFlags { exec: true, ..base }), MmapRoute::PassThrough);
        assert_eq!(classify_mmap(MmapFlags { stack: true, ..base }), MmapRoute::PassThrough);
    }

    #[test]
    fn file_backed_mapping_passes_through() {
        let flags = MmapFlags {
            anonymous: false,
            private: true,
            fixed: false,
            exec: false,
            stack: false,
        };
        assert_eq!(classify_mmap(flags), MmapRoute::PassThrough);
    }

    #[test]
    fn dontneed_releases_frames_other_advice_passes_through() {
        assert_eq!(classify_madvise(Advice::DontNeed), MadviseAction::ReleaseFrame);
        assert_eq!(classify_madvise(Advice::Other), MadviseAction::PassThrough);
    }

    #[test]
    fn runtime_call_guard_is_thread_local_and_resets() {
        assert!(!is_managed_call());
        with_runtime_call(|| assert!(is_managed_call()));
        assert!(!is_managed_call());
    }
}
