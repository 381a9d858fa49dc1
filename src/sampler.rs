//! Fault sampler (spec.md §4.12 / §9): a fixed-size ring of per-handler
//! fault samples, written by the handler loop and drained by a background
//! thread. The original system samples from a SIGSEGV-adjacent context;
//! Rust's `backtrace` crate is not signal-safe, so this sampler is driven
//! from the regular handler loop instead, keeping the same busy-flag
//! handshake so a real signal-based sampler could slot in later without
//! changing its public shape.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// One recorded fault, minus any stack capture (cheap, always recorded).
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub addr: usize,
    pub is_write: bool,
    pub at: Duration,
}

/// A fixed-capacity, single-writer/single-reader ring buffer slot. `busy`
/// is the handshake: the writer sets it before publishing a new sample and
/// clears it after; the reader only consumes a slot it observes as not
/// busy, and skips slots mid-write rather than blocking (spec.md §9:
/// "single `AtomicBool` 'busy' flag with release/acquire ordering").
struct Slot {
    busy: AtomicBool,
    sample: std::cell::UnsafeCell<Option<Sample>>,
    #[cfg(feature = "sampler")]
    backtrace: std::cell::UnsafeCell<Option<backtrace::Backtrace>>,
}

// SAFETY: each slot is written by exactly one producer thread (the slot's
// owning handler) and consumed by exactly one background drainer thread,
// coordinated through `busy`.
unsafe impl Sync for Slot {}

impl Slot {
    fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            sample: std::cell::UnsafeCell::new(None),
            #[cfg(feature = "sampler")]
            backtrace: std::cell::UnsafeCell::new(None),
        }
    }
}

/// Ring of fault samples shared across handler threads.
pub struct Sampler {
    slots: Box<[Slot]>,
    cursor: AtomicUsize,
    dropped: AtomicUsize,
}

impl Sampler {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::new);
        Self {
            slots: slots.into_boxed_slice(),
            cursor: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Records one fault sample. Called from a handler thread; never
    /// blocks. If the next slot is still busy (the drainer hasn't caught
    /// up), the sample is dropped and counted rather than overwriting data
    /// the drainer might be mid-read on.
    pub fn record(&self, addr: usize, is_write: bool, at: Duration) {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let slot = &self.slots[idx];
        if slot.busy.swap(true, Ordering::Acquire) {
            // Drainer hasn't released this slot from a previous cycle.
            slot.busy.store(false, Ordering::Release);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // SAFETY: `busy` just transitioned false -> true under Acquire, so
        // no drainer is concurrently reading this slot.
        unsafe {
            *slot.sample.get() = Some(Sample { addr, is_write, at });
            #[cfg(feature = "sampler")]
            {
                *slot.backtrace.get() = Some(backtrace::Backtrace::new_unresolved());
            }
        }
        slot.busy.store(false, Ordering::Release);
    }

    /// Drains every slot that isn't currently being written, returning the
    /// samples observed (oldest cursor position first). Intended to be
    /// called periodically from a dedicated background thread, never from
    /// a handler.
    pub fn drain(&self) -> Vec<Sample> {
        let mut out = Vec::new();
        for slot in self.slots.iter() {
            if slot.busy.swap(true, Ordering::Acquire) {
                continue;
            }
            // SAFETY: we just took ownership of this slot via the busy flag.
            let sample = unsafe { (*slot.sample.get()).take() };
            slot.busy.store(false, Ordering::Release);
            if let Some(s) = sample {
                out.push(s);
            }
        }
        out
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_then_drain_round_trips() {
        let sampler = Sampler::new(4);
        sampler.record(0x1000, false, Duration::from_millis(1));
        sampler.record(0x2000, true, Duration::from_millis(2));

        let samples = sampler.drain();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].addr, 0x1000);
        assert!(!samples[0].is_write);
        assert_eq!(samples[1].addr, 0x2000);
        assert!(samples[1].is_write);

        // A second drain with nothing new recorded yields nothing.
        assert!(sampler.drain().is_empty());
    }

    #[test]
    fn ring_wraps_without_panicking() {
        let sampler = Sampler::new(2);
        for i in 0..10 {
            sampler.record(i, false, Duration::from_millis(i as u64));
        }
        let samples = sampler.drain();
        assert!(samples.len() <= 2);
    }
}
