// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Refcounted I/O buffers and their freelists (spec §4.7 "Buffer pool"):
//! two freelists (incoming/outgoing) of up to `STDIO_MAX_FREE_BUF` each,
//! growing lazily and never freed until the multiplexer is destroyed.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Cap on each freelist's size (spec §4.7).
pub const STDIO_MAX_FREE_BUF: usize = 1024;

/// A single refcounted buffer. Cloning an `IOBuffer` bumps the refcount;
/// dropping the last clone does not free the backing storage — it is
/// returned to its pool's freelist by the caller (`BufferPool::release`),
/// matching the spec's "decrement buffer refcount (return to freelist at
/// 0)" rather than relying on `Drop` to do it implicitly.
#[derive(Clone)]
pub struct IOBuffer {
    data: Arc<Vec<u8>>,
}

impl IOBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data: Arc::new(data) }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of live references to this buffer's storage, including this
    /// one.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.data)
    }
}

/// One directional freelist (incoming or outgoing). Allocation grows the
/// pool lazily on first use past its free capacity; buffers above
/// `STDIO_MAX_FREE_BUF` are simply dropped instead of being pooled.
pub struct BufferFreelist {
    free: Mutex<Vec<Vec<u8>>>,
    /// Buffers currently checked out (acquired but not yet released).
    /// Backs `readable()`'s "free-buffer-available" clause (spec §4.7):
    /// the freelist itself grows lazily and never fails to `acquire`, so
    /// backpressure has to come from capping how many buffers are allowed
    /// outstanding at once, not from the freelist's own length.
    outstanding: AtomicUsize,
}

impl Default for BufferFreelist {
    fn default() -> Self {
        Self { free: Mutex::new(Vec::new()), outstanding: AtomicUsize::new(0) }
    }
}

impl BufferFreelist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a buffer from the freelist if one is available, clears it,
    /// and wraps `data` into a fresh `IOBuffer`; otherwise allocates.
    pub fn acquire(&self, data: &[u8]) -> IOBuffer {
        let mut storage = self.free.lock().pop().unwrap_or_default();
        storage.clear();
        storage.extend_from_slice(data);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        IOBuffer::new(storage)
    }

    /// Returns a buffer's backing storage to the freelist once its
    /// refcount has dropped to zero. No-op (storage is dropped) once the
    /// freelist is already at `STDIO_MAX_FREE_BUF`.
    pub fn release(&self, buffer: IOBuffer) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if let Ok(data) = Arc::try_unwrap(buffer.data) {
            let mut free = self.free.lock();
            if free.len() < STDIO_MAX_FREE_BUF {
                free.push(data);
            }
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// `free-buffer-available` (spec §4.7): whether this freelist may
    /// still hand out a buffer without exceeding the pool's cap.
    pub fn has_free(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) < STDIO_MAX_FREE_BUF
    }
}

/// The multiplexer's buffer pool: one freelist for inbound supervisor
/// traffic, one for outbound stdin traffic. Each freelist is independently
/// `Arc`-wrapped so a `FileSink` can hold just the incoming side without
/// pinning the whole pool.
pub struct BufferPool {
    pub incoming: Arc<BufferFreelist>,
    pub outgoing: Arc<BufferFreelist>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self { incoming: Arc::new(BufferFreelist::new()), outgoing: Arc::new(BufferFreelist::new()) }
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_returns_storage_to_freelist() {
        let freelist = BufferFreelist::new();
        let buffer = freelist.acquire(b"hello");
        assert_eq!(freelist.free_count(), 0);

        freelist.release(buffer);
        assert_eq!(freelist.free_count(), 1);
    }

    #[test]
    fn release_is_a_no_op_while_another_clone_is_outstanding() {
        let freelist = BufferFreelist::new();
        let buffer = freelist.acquire(b"hello");
        let clone = buffer.clone();
        assert_eq!(buffer.refcount(), 2);

        freelist.release(buffer);
        assert_eq!(freelist.free_count(), 0, "storage must not return while a clone is alive");

        freelist.release(clone);
        assert_eq!(freelist.free_count(), 1);
    }

    #[test]
    fn freelist_caps_at_stdio_max_free_buf() {
        let freelist = BufferFreelist::new();
        for _ in 0..STDIO_MAX_FREE_BUF + 10 {
            let buffer = freelist.acquire(b"x");
            freelist.release(buffer);
        }
        assert_eq!(freelist.free_count(), STDIO_MAX_FREE_BUF);
    }
}
