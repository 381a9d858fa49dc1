//! The user-space thread scheduler *contract* (spec.md §1: "the user-space
//! thread scheduler used to park/resume the faulting thread" is an external
//! collaborator — only its contract is fixed here).
//!
//! A real embedding plugs in its own cooperative runtime's park/unpark
//! primitives. [`ThreadParkScheduler`] is the reference implementation used
//! by the local backend and all tests so this crate is runnable standalone.

/// Parks and resumes the single application thread that took a given page
/// fault (spec.md §5: "a user thread suspends exactly once per fault").
pub trait Scheduler: Send + Sync {
    /// An opaque resume handle captured at park time.
    type Handle: Send + 'static;

    /// Suspends the calling thread, returning a handle the read-completion
    /// callback will later pass to [`Scheduler::unpark`].
    fn park(&self) -> Self::Handle;

    /// Resumes the thread identified by `handle`. Called from whichever
    /// thread observes the completion — possibly a different thread than
    /// the one that parked it (cross-thread ready, spec.md §4.9 step 3).
    fn unpark(&self, handle: Self::Handle);
}

/// `std::thread::park`/`Thread::unpark`-based scheduler.
#[derive(Debug, Default)]
pub struct ThreadParkScheduler;

impl Scheduler for ThreadParkScheduler {
    type Handle = std::thread::Thread;

    fn park(&self) -> Self::Handle {
        let me = std::thread::current();
        // The caller is expected to call `std::thread::park()` itself right
        // after receiving this handle (handing the handle to another thread
        // first, as the fault machinery does, then parking).
        me
    }

    fn unpark(&self, handle: Self::Handle) {
        handle.unpark();
    }
}

/// Object-safe park/wake surface keyed by an opaque `usize` token, so the
/// fault machinery ([`crate::fault::Fault::waiter`]) doesn't need to be
/// generic over a particular [`Scheduler`] implementation.
pub trait ParkWake: Send + Sync {
    /// Parks the calling thread's resume handle under a fresh token and
    /// returns it. The caller still has to actually suspend itself (e.g.
    /// call `std::thread::park()`) after this returns.
    fn park_and_register(&self) -> usize;

    /// Looks up and removes the handle registered under `token`, then
    /// resumes it. A no-op if `token` is unknown (already woken).
    fn wake(&self, token: usize);
}

/// [`ParkWake`] backed by any [`Scheduler`]: a monotone token counter plus a
/// map from token to parked handle.
pub struct WaiterTable<S: Scheduler> {
    scheduler: S,
    next_token: std::sync::atomic::AtomicUsize,
    parked: std::sync::Mutex<std::collections::HashMap<usize, S::Handle>>,
}

impl<S: Scheduler> WaiterTable<S> {
    pub fn new(scheduler: S) -> Self {
        Self {
            scheduler,
            next_token: std::sync::atomic::AtomicUsize::new(1),
            parked: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl<S: Scheduler> ParkWake for WaiterTable<S> {
    fn park_and_register(&self) -> usize {
        let handle = self.scheduler.park();
        let token = self.next_token.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.parked.lock().unwrap().insert(token, handle);
        token
    }

    fn wake(&self, token: usize) {
        if let Some(handle) = self.parked.lock().unwrap().remove(&token) {
            self.scheduler.unpark(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn park_unpark_round_trip() {
        let sched = Arc::new(ThreadParkScheduler);
        let handle_slot = Arc::new(Mutex::new(None));

        let sched2 = sched.clone();
        let handle_slot2 = handle_slot.clone();
        let worker = std::thread::spawn(move || {
            let handle = sched2.park();
            *handle_slot2.lock().unwrap() = Some(handle);
            std::thread::park_timeout(Duration::from_secs(5));
        });

        // Wait until the worker has published its handle.
        let handle = loop {
            if let Some(h) = handle_slot.lock().unwrap().take() {
                break h;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        std::thread::sleep(Duration::from_millis(5));
        sched.unpark(handle);
        worker.join().unwrap();
    }

    #[test]
    fn waiter_table_wakes_by_token() {
        let table = Arc::new(WaiterTable::new(ThreadParkScheduler));
        let token_slot = Arc::new(Mutex::new(None));

        let table2 = table.clone();
        let token_slot2 = token_slot.clone();
        let worker = std::thread::spawn(move || {
            let token = table2.park_and_register();
            *token_slot2.lock().unwrap() = Some(token);
            std::thread::park_timeout(Duration::from_secs(5));
        });

        let token = loop {
            if let Some(t) = *token_slot.lock().unwrap() {
                break t;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        std::thread::sleep(Duration::from_millis(5));
        table.wake(token);
        worker.join().unwrap();

        // Waking an already-consumed token is a no-op, not an error.
        table.wake(token);
    }
}
