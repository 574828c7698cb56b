//! Process-wide pool of fixed-size byte buffers.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Reused across the listener and forwarders to bound allocator pressure
//! on the hot path. See `original_source/proxy/forward.go`'s `sync.Pool`
//! of `[]byte` for the design this mirrors.

use std::sync::Arc;

use parking_lot::Mutex;

/// A pooled, fixed-capacity byte buffer.
///
/// The buffer always owns `capacity` bytes of backing storage. Its
/// logical length (the portion considered valid, e.g. after a `recv`)
/// can be smaller than capacity; [`Buffer::reset`] restores it to
/// capacity without touching the storage.
#[derive(Debug)]
pub struct Buffer {
    data: Box<[u8]>,
    len: usize,
}

impl Buffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: capacity,
        }
    }

    /// Full-capacity mutable view, suitable for `recv_from`.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// View of the logically valid portion of the buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Number of valid bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity of the backing storage.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Mark only the first `len` bytes as valid (e.g. after a short read).
    pub fn truncate(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    fn reset(&mut self) {
        self.len = self.data.len();
    }
}

#[derive(Debug)]
struct Inner {
    capacity: usize,
    free: Mutex<Vec<Buffer>>,
}

/// A thread-safe, unbounded pool of [`Buffer`]s of a fixed capacity.
///
/// Cheap to clone: all clones share the same underlying pool. Grows on
/// contention; has no failure mode.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl BufferPool {
    /// Creates a pool whose buffers each have the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity,
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Fixed capacity of every buffer handed out by this pool.
    pub fn buffer_capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Acquires a buffer, reusing one from the pool if available.
    pub fn acquire(&self) -> Buffer {
        match self.inner.free.lock().pop() {
            Some(buf) => buf,
            None => Buffer::new(self.inner.capacity),
        }
    }

    /// Returns a buffer to the pool. Its logical length is reset to
    /// capacity; content is not zeroed.
    pub fn release(&self, mut buf: Buffer) {
        debug_assert_eq!(buf.capacity(), self.inner.capacity);
        buf.reset();
        self.inner.free.lock().push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_yields_full_capacity() {
        let pool = BufferPool::new(128);
        let buf = pool.acquire();
        assert_eq!(buf.capacity(), 128);
        assert_eq!(buf.len(), 128);
    }

    #[test]
    fn release_restores_logical_length() {
        let pool = BufferPool::new(16);
        let mut buf = pool.acquire();
        buf.truncate(4);
        assert_eq!(buf.as_slice().len(), 4);
        pool.release(buf);

        let reused = pool.acquire();
        assert_eq!(reused.len(), 16);
    }

    #[test]
    fn reuses_released_buffers_instead_of_allocating() {
        let pool = BufferPool::new(8);
        let first = pool.acquire();
        let first_ptr = first.as_slice().as_ptr();
        pool.release(first);

        let second = pool.acquire();
        assert_eq!(second.as_slice().as_ptr(), first_ptr);
    }

    #[test]
    fn grows_under_contention() {
        let pool = BufferPool::new(8);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(a.capacity(), 8);
        assert_eq!(b.capacity(), 8);
    }
}
