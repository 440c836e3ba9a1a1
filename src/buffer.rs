//! Buffer pool and FIFO queue for list-mode data (spec.md §4.7).
//!
//! The mutex-protected free list plus handle-scoped release is the same
//! shape as `drive/inference.rs`'s `CommandQueue`, generalized from one
//! fixed-size command slab to a pool of equal-sized list-mode buffers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::{ApiError, ErrorCode};

/// A pool of fixed-size `u32` buffers. Buffers are handed out by index and
/// must be returned through [`BufferHandle`]'s `Drop` or explicit
/// [`BufferPool::destroy`] (spec.md §4.7 `create`/`request`/`destroy`).
pub struct BufferPool {
    inner: Arc<Mutex<PoolState>>,
    buffer_words: usize,
}

struct PoolState {
    buffers: Vec<Vec<u32>>,
    free: Vec<usize>,
}

impl BufferPool {
    pub fn create(count: usize, buffer_words: usize) -> Self {
        let buffers = (0..count).map(|_| vec![0u32; buffer_words]).collect::<Vec<_>>();
        let free = (0..count).collect();
        Self { inner: Arc::new(Mutex::new(PoolState { buffers, free })), buffer_words }
    }

    pub fn buffer_words(&self) -> usize {
        self.buffer_words
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().buffers.len()
    }

    pub fn available(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    /// Request one free buffer. Fails with `buffer_pool_empty` rather than
    /// blocking (spec.md §4.7).
    pub fn request(&self) -> Result<BufferHandle, ApiError> {
        let mut state = self.inner.lock().unwrap();
        let idx = state.free.pop().ok_or_else(|| ApiError::new(ErrorCode::BufferPoolEmpty, "no free buffers available"))?;
        Ok(BufferHandle { pool: self.inner.clone(), index: idx, released: false })
    }

    /// Tear down the pool. Fails with `buffer_pool_busy` if any
    /// buffer is still checked out (spec.md §4.7).
    pub fn destroy(self) -> Result<(), ApiError> {
        let state = self.inner.lock().unwrap();
        if state.free.len() != state.buffers.len() {
            return Err(ApiError::new(ErrorCode::BufferPoolBusy, "buffers still checked out"));
        }
        Ok(())
    }
}

/// Scoped ownership of one pool buffer; returns it to the free list on
/// drop, matching `drive/inference.rs`'s command-slot RAII release.
pub struct BufferHandle {
    pool: Arc<Mutex<PoolState>>,
    index: usize,
    released: bool,
}

impl BufferHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// The fixed backing size this handle's buffer was allocated with.
    pub fn capacity(&self) -> usize {
        self.pool.lock().unwrap().buffers[self.index].len()
    }

    /// Read the buffer's contents through a closure, avoiding holding a
    /// guard across an API boundary.
    pub fn with<R>(&self, f: impl FnOnce(&[u32]) -> R) -> R {
        let state = self.pool.lock().unwrap();
        f(&state.buffers[self.index])
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u32]) -> R) -> R {
        let mut state = self.pool.lock().unwrap();
        f(&mut state.buffers[self.index])
    }

    /// Release early, without waiting for drop.
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if self.released {
            return;
        }
        let mut state = self.pool.lock().unwrap();
        state.free.push(self.index);
        self.released = true;
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.do_release();
    }
}

/// Where a drained run of words lands (spec.md §4.7 `copy(to_buffer | to_ptr, count)`).
pub enum CopyDestination<'a> {
    ToBuffer(&'a mut Vec<u32>),
    ToPtr(&'a mut [u32]),
}

/// One buffer checked out into the queue, with a logical window into its
/// backing storage: `offset` is where unconsumed data starts, `len` is how
/// much of it remains.
struct QueueEntry {
    handle: BufferHandle,
    offset: usize,
    len: usize,
}

/// FIFO queue of filled buffers awaiting drain (spec.md §4.7
/// `push`/`pop`/`copy`/`compact`/`flush`). The sum of per-entry `len`s is
/// `size()`; the entry count is `count()`.
pub struct Queue {
    entries: Mutex<VecDeque<QueueEntry>>,
}

impl Queue {
    pub fn new() -> Self {
        Self { entries: Mutex::new(VecDeque::new()) }
    }

    /// Enqueue `handle`, whose first `len` words (capped at its capacity)
    /// are meaningful.
    pub fn push(&self, handle: BufferHandle, len: usize) {
        let len = len.min(handle.capacity());
        self.entries.lock().unwrap().push_back(QueueEntry { handle, offset: 0, len });
    }

    pub fn pop(&self) -> Option<BufferHandle> {
        self.entries.lock().unwrap().pop_front().map(|e| e.handle)
    }

    /// Total unconsumed words across every queued buffer.
    pub fn size(&self) -> usize {
        self.entries.lock().unwrap().iter().map(|e| e.len).sum()
    }

    /// Number of buffers currently queued.
    pub fn count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Drain the next `count` words across as many queued buffers as
    /// needed into `dest`. A buffer emptied by the drain is released back
    /// to its pool; a partially drained tail buffer keeps its remaining
    /// words logically repositioned to its front. Fails
    /// `buffer_pool_not_enough` if `count` exceeds the queue's current size.
    pub fn copy(&self, dest: CopyDestination<'_>, count: usize) -> Result<(), ApiError> {
        let mut entries = self.entries.lock().unwrap();
        let available: usize = entries.iter().map(|e| e.len).sum();
        if count > available {
            return Err(ApiError::new(
                ErrorCode::BufferPoolNotEnough,
                format!("requested {} words but only {} queued", count, available),
            ));
        }

        let mut out = Vec::with_capacity(count);
        let mut remaining = count;
        while remaining > 0 {
            let take = {
                let front = entries.front_mut().expect("available covers remaining");
                let take = remaining.min(front.len);
                front.handle.with(|buf| out.extend_from_slice(&buf[front.offset..front.offset + take]));
                front.offset += take;
                front.len -= take;
                take
            };
            remaining -= take;
            if entries.front().map(|e| e.len == 0).unwrap_or(false) {
                entries.pop_front();
            }
        }

        match dest {
            CopyDestination::ToBuffer(v) => {
                v.clear();
                v.extend_from_slice(&out);
            }
            CopyDestination::ToPtr(s) => s[..out.len()].copy_from_slice(&out),
        }
        Ok(())
    }

    /// Coalesce tail data into earlier partially-full buffers, shrinking
    /// the entry count without changing total size (spec.md §4.7
    /// `compact`). Idempotent.
    pub fn compact(&self) {
        let mut entries = self.entries.lock().unwrap();
        let mut i = 0;
        while i + 1 < entries.len() {
            let free = entries[i].handle.capacity() - entries[i].len;
            let movable = free.min(entries[i + 1].len);
            if movable == 0 {
                i += 1;
                continue;
            }
            let moved: Vec<u32> = {
                let next = &entries[i + 1];
                next.handle.with(|buf| buf[next.offset..next.offset + movable].to_vec())
            };
            {
                let dst = &mut entries[i];
                let insert_at = dst.offset + dst.len;
                dst.handle.with_mut(|buf| buf[insert_at..insert_at + movable].copy_from_slice(&moved));
                dst.len += movable;
            }
            {
                let src = &mut entries[i + 1];
                src.offset += movable;
                src.len -= movable;
            }
            if entries[i + 1].len == 0 {
                entries.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Drop every queued buffer, releasing each back to its pool.
    pub fn flush(&self) {
        self.entries.lock().unwrap().clear();
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}
