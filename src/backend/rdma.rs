//! RDMA transport (external collaborator, spec.md §1: "RDMA … only its
//! contract is fixed here"). This module defines the trait surface and a
//! skeleton implementation; wiring it to a real verbs library (e.g. an
//! `ibverbs`-style crate) is out of scope.

use super::{Backend, Completion};
use crate::error::{Error, Result};

/// Placeholder RDMA-backed [`Backend`]. Every method fails with
/// [`Error::InitFailure`] unless the `rdma` feature is enabled, at which
/// point they fail with [`Error::TransientBackend`] — a real connection
/// handshake is not implemented here, but the failure mode matches what
/// callers must already handle (retry per spec.md §7's policy table), so
/// the rest of the engine needs no RDMA-specific code path.
pub struct RdmaBackend {
    _private: (),
}

impl RdmaBackend {
    pub fn connect(_endpoint: &str) -> Result<Self> {
        if !cfg!(feature = "rdma") {
            return Err(Error::InitFailure(
                "RDMA backend requires the `rdma` feature".into(),
            ));
        }
        Err(Error::InitFailure(
            "RDMA transport is not wired to a verbs library in this build".into(),
        ))
    }
}

impl Backend for RdmaBackend {
    fn post_read(&self, _channel: usize, _offset: u64, _buf_ptr: usize, _len: usize, _cb_ctx: u64) -> Result<()> {
        Err(Error::TransientBackend("RDMA backend unavailable".into()))
    }

    fn post_write(&self, _channel: usize, _offset: u64, _buf_ptr: usize, _len: usize, _cb_ctx: u64) -> Result<()> {
        Err(Error::TransientBackend("RDMA backend unavailable".into()))
    }

    fn poll_completions(&self, _channel: usize, _max: usize) -> Result<Vec<Completion>> {
        Err(Error::TransientBackend("RDMA backend unavailable".into()))
    }

    fn allocate_remote(&self, _len: usize) -> Result<u64> {
        Err(Error::InitFailure("RDMA backend unavailable".into()))
    }

    fn remove_region(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(all(test, feature = "rdma"))]
mod tests {
    use super::*;

    #[test]
    fn connect_fails_without_a_real_fabric() {
        assert!(RdmaBackend::connect("localhost").is_err());
    }
}
