//! Local test backend (spec.md §4.3: "The local backend services posts
//! synchronously by memcpy with a local arena"; §9 treats it as fully
//! in-scope, not a stub).
//!
//! Payload transfer happens synchronously inside `post_read`/`post_write`
//! (there is no real network round trip to overlap), but the completion is
//! still only observable through `poll_completions`, so callers exercise
//! the exact same post-then-poll protocol a real asynchronous backend
//! would require.

use super::{check_channel, Backend, Completion, CompletionKind};
use crate::config::{CHUNK_SIZE, MAX_CHANNELS};
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::Mutex;

struct Channel {
    completions: Mutex<VecDeque<Completion>>,
}

impl Channel {
    fn new() -> Self {
        Self {
            completions: Mutex::new(VecDeque::new()),
        }
    }
}

/// A single-region, `Vec<u8>`-backed arena standing in for remote memory.
pub struct LocalBackend {
    arena: Mutex<Vec<u8>>,
    channels: Vec<Channel>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            arena: Mutex::new(Vec::new()),
            channels: (0..MAX_CHANNELS).map(|_| Channel::new()).collect(),
        }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for LocalBackend {
    fn post_read(&self, channel: usize, offset: u64, buf_ptr: usize, len: usize, cb_ctx: u64) -> Result<()> {
        check_channel(channel)?;
        debug_assert!(len <= CHUNK_SIZE);
        let arena = self.arena.lock().unwrap();
        let start = offset as usize;
        let end = start.checked_add(len).ok_or_else(|| Error::fatal("read offset overflow"))?;
        if end > arena.len() {
            return Err(Error::fatal("read past end of remote arena"));
        }
        // SAFETY: caller guarantees `buf_ptr` is valid for `len` bytes for
        // the duration of this call (spec.md §4.3 backend contract).
        unsafe {
            std::ptr::copy_nonoverlapping(arena[start..end].as_ptr(), buf_ptr as *mut u8, len);
        }
        drop(arena);
        self.channels[channel].completions.lock().unwrap().push_back(Completion {
            kind: CompletionKind::Read,
            channel,
            page: offset,
            cb_ctx,
        });
        Ok(())
    }

    fn post_write(&self, channel: usize, offset: u64, buf_ptr: usize, len: usize, cb_ctx: u64) -> Result<()> {
        check_channel(channel)?;
        debug_assert!(len <= CHUNK_SIZE);
        let mut arena = self.arena.lock().unwrap();
        let start = offset as usize;
        let end = start.checked_add(len).ok_or_else(|| Error::fatal("write offset overflow"))?;
        if end > arena.len() {
            return Err(Error::fatal("write past end of remote arena"));
        }
        // SAFETY: caller guarantees `buf_ptr` is valid for `len` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(buf_ptr as *const u8, arena[start..end].as_mut_ptr(), len);
        }
        drop(arena);
        self.channels[channel].completions.lock().unwrap().push_back(Completion {
            kind: CompletionKind::Write,
            channel,
            page: offset,
            cb_ctx,
        });
        Ok(())
    }

    fn poll_completions(&self, channel: usize, max: usize) -> Result<Vec<Completion>> {
        check_channel(channel)?;
        let mut q = self.channels[channel].completions.lock().unwrap();
        let n = max.min(q.len());
        Ok(q.drain(..n).collect())
    }

    fn allocate_remote(&self, len: usize) -> Result<u64> {
        let mut arena = self.arena.lock().unwrap();
        let base = arena.len() as u64;
        arena.resize(arena.len() + len, 0);
        Ok(base)
    }

    fn remove_region(&self) -> Result<()> {
        self.arena.lock().unwrap().clear();
        for c in &self.channels {
            c.completions.lock().unwrap().clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_after_write_round_trips() {
        let backend = LocalBackend::new();
        let offset = backend.allocate_remote(CHUNK_SIZE).unwrap();

        let src = vec![0xABu8; CHUNK_SIZE];
        backend
            .post_write(0, offset, src.as_ptr() as usize, CHUNK_SIZE, 42)
            .unwrap();
        let completions = backend.poll_completions(0, 16).unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].kind, CompletionKind::Write);
        assert_eq!(completions[0].cb_ctx, 42);

        let mut dst = vec![0u8; CHUNK_SIZE];
        backend
            .post_read(0, offset, dst.as_mut_ptr() as usize, CHUNK_SIZE, 7)
            .unwrap();
        let completions = backend.poll_completions(0, 16).unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].kind, CompletionKind::Read);
        assert_eq!(dst, src);
    }

    #[test]
    fn poll_respects_max() {
        let backend = LocalBackend::new();
        let offset = backend.allocate_remote(CHUNK_SIZE).unwrap();
        let buf = vec![0u8; CHUNK_SIZE];
        for i in 0..5 {
            backend
                .post_write(0, offset, buf.as_ptr() as usize, CHUNK_SIZE, i)
                .unwrap();
        }
        let first = backend.poll_completions(0, 3).unwrap();
        assert_eq!(first.len(), 3);
        let rest = backend.poll_completions(0, 16).unwrap();
        assert_eq!(rest.len(), 2);
    }
}
