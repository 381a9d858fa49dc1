//! Error kinds and policy (spec §7).
//!
//! Only [`Error::Fatal`] and [`Error::InitFailure`] ever leave the engine as
//! a surfaced `Result::Err`. The other variants are internal signals that
//! the fault state machine, handler loop, and eviction engine consume and
//! act on themselves (retry, park, trigger eviction) — see the policy table
//! in spec.md §7.

use std::fmt;

/// Error kinds from spec.md §7's policy table.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Backend returned a transient failure (e.g. posting would block).
    /// Policy: retry on the next handler loop iteration.
    #[error("transient backend error: {0}")]
    TransientBackend(String),

    /// The kernel fault source had nothing for us, or another handler
    /// already consumed the message. Not an error condition.
    #[error("transient kernel event")]
    TransientKernel,

    /// A CAS on the page flag word lost a race. Policy: park the fault on
    /// the wait queue; never surfaced to a caller.
    #[error("page flags contended")]
    ContentionRetry,

    /// No local frame budget is available to install a page. Policy:
    /// trigger eviction, then retry.
    #[error("no local frame budget available")]
    CapacityPressure,

    /// An invariant was violated (duplicate completion, region lookup miss,
    /// refcount underflow, unknown kernel event). Policy: abort the
    /// process via [`Error::abort`].
    #[error("fatal runtime invariant violated: {0}")]
    Fatal(String),

    /// Engine construction failed (backend handshake, missing env var).
    /// Policy: the engine disables itself; callers fall back to the
    /// system allocator.
    #[error("engine initialization failed: {0}")]
    InitFailure(String),
}

impl Error {
    /// Construct a [`Error::Fatal`] from a `Display` message.
    pub fn fatal(msg: impl fmt::Display) -> Self {
        Error::Fatal(msg.to_string())
    }

    /// Log and abort the process. Faults never surface errors to
    /// application code — a memory access either succeeds or crashes.
    pub fn abort_process(&self) -> ! {
        tracing::error!(error = %self, "fatal remote-memory runtime error, aborting");
        std::process::abort();
    }
}

pub type Result<T> = std::result::Result<T, Error>;
