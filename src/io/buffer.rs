//! Growable byte buffer.
//!
//! Bytes accumulate at the write position; when an append does not fit the
//! remaining capacity the buffer is reallocated to
//! `(capacity + missing) * 1.5`, keeping existing content and position.
//! Consumers take bytes off the front with [`GrowableBuffer::split_to`] or
//! [`GrowableBuffer::advance`], which compacts the buffer as it drains.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::io::kmp;

#[derive(Debug, Default)]
pub struct GrowableBuffer {
    inner: BytesMut,
    capacity: usize,
}

impl GrowableBuffer {
    /// Creates an empty buffer with room for `capacity` bytes.
    pub fn allocate(capacity: usize) -> Self {
        Self {
            inner: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `src`, growing the buffer if needed.
    pub fn put(&mut self, src: &[u8]) {
        self.ensure_capacity(src.len());
        self.inner.put_slice(src);
    }

    /// Inserts `src` in front of the current content.
    ///
    /// The buffer is reallocated to exactly `src.len() + position()` and the
    /// existing bytes are shifted right.
    pub fn prepend(&mut self, src: &[u8]) {
        let new_size = src.len() + self.inner.len();
        let mut fresh = BytesMut::with_capacity(new_size);
        fresh.put_slice(src);
        fresh.put_slice(&self.inner);
        self.inner = fresh;
        self.capacity = new_size;
    }

    /// Number of bytes currently held (the write position).
    pub fn position(&self) -> usize {
        self.inner.len()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.inner.len())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    /// Removes and returns the first `n` bytes.
    pub fn split_to(&mut self, n: usize) -> Bytes {
        self.inner.split_to(n).freeze()
    }

    /// Discards the first `n` bytes.
    pub fn advance(&mut self, n: usize) {
        self.inner.advance(n);
    }

    /// Offset of the first occurrence of `pattern`, if any.
    pub fn find(&self, pattern: &[u8]) -> Option<usize> {
        kmp::index_of(&self.inner, 0, self.inner.len(), pattern)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    fn ensure_capacity(&mut self, size: usize) {
        let remaining = self.remaining();
        if size > remaining {
            let missing = size - remaining;
            let new_capacity = ((self.capacity + missing) as f64 * 1.5) as usize;
            debug!(old = self.capacity, new = new_capacity, "reallocating buffer");
            self.reallocate(new_capacity);
        }
    }

    fn reallocate(&mut self, new_capacity: usize) {
        let additional = new_capacity.saturating_sub(self.inner.len());
        self.inner.reserve(additional);
        self.capacity = new_capacity;
    }
}

impl AsRef<[u8]> for GrowableBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}
