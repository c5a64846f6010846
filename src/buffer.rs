//! Per-worker buffer pool.
//!
//! Each worker owns two pools (connection-size and handshake-size). A pool
//! hands out [`PooledBuf`] handles granting exclusive access to a
//! fixed-capacity byte buffer; dropping the handle zero-resets the cursors
//! and returns the buffer, so every buffer is returned exactly once. The
//! pool is single-threaded and grows by allocating a fresh buffer when
//! exhausted.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use crate::stats::ServerStats;

#[derive(Debug)]
struct PoolInner {
    free: RefCell<Vec<Box<[u8]>>>,
    buf_capacity: usize,
    created: Cell<usize>,
    in_use: Cell<usize>,
    stats: Arc<ServerStats>,
}

/// Pool of fixed-capacity byte buffers owned by one worker.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Rc<PoolInner>,
}

impl BufferPool {
    /// Creates a pool producing buffers of `buf_capacity` bytes.
    #[must_use]
    pub fn new(buf_capacity: usize, stats: Arc<ServerStats>) -> Self {
        Self {
            inner: Rc::new(PoolInner {
                free: RefCell::new(Vec::new()),
                buf_capacity,
                created: Cell::new(0),
                in_use: Cell::new(0),
                stats,
            }),
        }
    }

    /// Acquires a buffer, allocating a fresh one when the free list is
    /// empty. Growth is not capped.
    #[must_use]
    pub fn acquire(&self) -> PooledBuf {
        let data = self.inner.free.borrow_mut().pop().unwrap_or_else(|| {
            self.inner.created.set(self.inner.created.get() + 1);
            vec![0u8; self.inner.buf_capacity].into_boxed_slice()
        });
        self.inner.in_use.set(self.inner.in_use.get() + 1);
        self.inner.stats.buffer_acquired();
        PooledBuf {
            data,
            read_pos: 0,
            write_pos: 0,
            pool: Rc::clone(&self.inner),
        }
    }

    /// Capacity of every buffer this pool produces.
    #[must_use]
    pub fn buf_capacity(&self) -> usize {
        self.inner.buf_capacity
    }

    /// Number of buffers currently handed out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.inner.in_use.get()
    }

    /// Number of buffers ever allocated by this pool.
    #[must_use]
    pub fn created(&self) -> usize {
        self.inner.created.get()
    }
}

/// Exclusive handle to a pooled buffer.
///
/// The buffer has a consumed cursor (`read_pos`) and a filled cursor
/// (`write_pos`); bytes in `read_pos..write_pos` are in flight. Dropping
/// the handle returns the buffer to its pool.
#[derive(Debug)]
pub struct PooledBuf {
    data: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    pool: Rc<PoolInner>,
}

impl PooledBuf {
    /// Total capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes of space left to fill.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// Number of in-flight bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Returns true if no bytes are in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// The in-flight bytes.
    #[must_use]
    pub fn filled(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// The unfilled tail, for reads from a socket.
    pub fn unfilled(&mut self) -> &mut [u8] {
        &mut self.data[self.write_pos..]
    }

    /// Records `n` bytes filled into [`unfilled`](Self::unfilled).
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.write_pos + n <= self.data.len());
        self.write_pos += n;
    }

    /// Consumes `n` in-flight bytes. Cursors reset to zero once everything
    /// is consumed.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.read_pos + n <= self.write_pos);
        self.read_pos += n;
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// Moves the in-flight bytes to the front, reclaiming consumed space.
    pub fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        self.data.copy_within(self.read_pos..self.write_pos, 0);
        self.write_pos -= self.read_pos;
        self.read_pos = 0;
    }

    /// Appends `src`, which must fit in [`remaining`](Self::remaining).
    pub fn put_slice(&mut self, src: &[u8]) {
        debug_assert!(src.len() <= self.remaining());
        self.data[self.write_pos..self.write_pos + src.len()].copy_from_slice(src);
        self.write_pos += src.len();
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        let data = std::mem::take(&mut self.data);
        self.pool.free.borrow_mut().push(data);
        self.pool.in_use.set(self.pool.in_use.get() - 1);
        self.pool.stats.buffer_released();
    }
}
