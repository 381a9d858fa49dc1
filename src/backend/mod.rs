//! Backend interface (C4, spec.md §4.3): the polymorphic remote-memory
//! transport. A region is bound to exactly one `Arc<dyn Backend>` for its
//! lifetime; the fault state machine and eviction engine never know which
//! concrete backend they're talking to.

pub mod local;
pub mod rdma;

use crate::config::MAX_CHANNELS;
use crate::error::Result;

/// What kind of operation a [`Completion`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    Read,
    Write,
}

/// One finished backend operation. `cb_ctx` is whatever opaque value the
/// poster passed to `post_read`/`post_write` — in practice the address of
/// the owning [`crate::fault::Fault`], cast to `u64`.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub kind: CompletionKind,
    pub channel: usize,
    pub page: u64,
    pub cb_ctx: u64,
}

/// `{LOCAL, RDMA}` capability set (spec.md §4.3, §9 "Polymorphic backend").
///
/// Channels are integer-indexed, `< MAX_CHANNELS`, and each is mutated by
/// at most one owner thread except via the stealing protocol (§4.9), which
/// polls another thread's channel from the side. Implementations must
/// therefore allow `poll_completions` to be called concurrently from a
/// non-owning thread; `post_read`/`post_write` are only ever called by a
/// channel's owner.
pub trait Backend: Send + Sync {
    /// Posts a read of the page at remote `offset` into `len` bytes
    /// starting at `buf_ptr`. `buf_ptr` must remain valid until the
    /// matching completion is observed via [`Backend::poll_completions`].
    fn post_read(&self, channel: usize, offset: u64, buf_ptr: usize, len: usize, cb_ctx: u64) -> Result<()>;

    /// Posts a write of `len` bytes starting at `buf_ptr` to the page at
    /// remote `offset`.
    fn post_write(&self, channel: usize, offset: u64, buf_ptr: usize, len: usize, cb_ctx: u64) -> Result<()>;

    /// Drains up to `max` finished operations from `channel`'s completion
    /// queue. Safe to call from a thread other than `channel`'s owner (the
    /// stealing protocol does exactly this); completions are idempotent to
    /// consume at most once each.
    fn poll_completions(&self, channel: usize, max: usize) -> Result<Vec<Completion>>;

    /// Reserves `len` contiguous bytes of remote storage for a newly
    /// registered region, returning its base offset.
    fn allocate_remote(&self, len: usize) -> Result<u64>;

    /// Releases whatever remote storage is associated with the sole region
    /// this backend instance serves (spec.md §4.2: `MAX_REGIONS = 1`).
    fn remove_region(&self) -> Result<()>;
}

pub(crate) fn check_channel(channel: usize) -> Result<()> {
    if channel >= MAX_CHANNELS {
        return Err(crate::error::Error::fatal(format!(
            "channel {channel} out of range (MAX_CHANNELS = {MAX_CHANNELS})"
        )));
    }
    Ok(())
}
