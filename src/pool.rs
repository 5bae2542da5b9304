use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Size of every buffer handed out by the pool.
pub const BUFFER_SIZE: usize = 32 * 1024;

/// Idle buffers kept around for reuse; anything beyond is freed on release.
const MAX_IDLE: usize = 1024;

/// Pool of fixed-size copy buffers shared by every tunnel in the process.
///
/// `acquire` never blocks on availability: an empty pool allocates.
#[derive(Debug, Default)]
pub struct BufferPool {
    idle: Mutex<Vec<Box<[u8]>>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check out a buffer. It returns to the pool when the guard is dropped,
    /// on every exit path.
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE].into_boxed_slice());
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            buf: Some(buf),
            pool: self,
        }
    }

    fn release(&self, buf: Box<[u8]>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push(buf);
        }
    }

    /// Buffers currently checked out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

/// A buffer on loan from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer<'a> {
    buf: Option<Box<[u8]>>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
