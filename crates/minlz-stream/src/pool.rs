//! Scratch Buffer Pool
//!
//! Every in-flight block needs one or two large scratch buffers (input copy
//! and encode output). At high concurrency and small block sizes, allocating
//! them per block dominates the cost of the pipeline, so buffers are
//! recycled through a shared pool instead.
//!
//! Buffers migrate between threads: the frontend or a worker acquires one,
//! and the dispatcher releases it once the block has been written. Contents
//! are *not* zeroed between uses; callers must bound every emission by the
//! explicit length they produced so stale bytes from a previous block never
//! leak into the stream.

use std::sync::Mutex;

/// A pool of interchangeable byte buffers, all of the same capacity.
#[derive(Debug)]
pub struct BufferPool {
    buf_len: usize,
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create a pool issuing buffers of exactly `buf_len` bytes.
    pub fn new(buf_len: usize) -> Self {
        Self {
            buf_len,
            bufs: Mutex::new(Vec::new()),
        }
    }

    /// The length every issued buffer is restored to.
    pub fn buf_len(&self) -> usize {
        self.buf_len
    }

    /// Take a buffer from the pool, or allocate a fresh one.
    ///
    /// The returned buffer has `len() == buf_len()`. Contents are arbitrary.
    pub fn acquire(&self) -> Vec<u8> {
        let recycled = self.bufs.lock().unwrap().pop();
        match recycled {
            Some(mut buf) => {
                buf.resize(self.buf_len, 0);
                buf
            }
            None => vec![0u8; self.buf_len],
        }
    }

    /// Return a buffer to the pool.
    ///
    /// Undersized buffers (for example the short user-chunk headers) are
    /// silently dropped; only buffers that can serve a full block are kept.
    pub fn release(&self, buf: Vec<u8>) {
        if buf.capacity() >= self.buf_len {
            self.bufs.lock().unwrap().push(buf);
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.bufs.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_len() {
        let pool = BufferPool::new(1024);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 1024);
        assert_eq!(pool.buf_len(), 1024);
    }

    #[test]
    fn test_release_recycles() {
        let pool = BufferPool::new(1024);
        let buf = pool.acquire();
        pool.release(buf);
        assert_eq!(pool.idle(), 1);
        let again = pool.acquire();
        assert_eq!(again.len(), 1024);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_release_drops_undersized() {
        let pool = BufferPool::new(1024);
        pool.release(vec![0u8; 16]);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_release_keeps_oversized() {
        let pool = BufferPool::new(1024);
        pool.release(vec![0u8; 4096]);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.acquire().len(), 1024);
    }

    #[test]
    fn test_acquire_restores_truncated_len() {
        let pool = BufferPool::new(1024);
        let mut buf = pool.acquire();
        buf.truncate(7);
        pool.release(buf);
        assert_eq!(pool.acquire().len(), 1024);
    }

    #[test]
    fn test_concurrent_checkout() {
        use std::sync::Arc;

        let pool = Arc::new(BufferPool::new(256));
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let pool = Arc::clone(&pool);
                scope.spawn(move || {
                    for _ in 0..100 {
                        let buf = pool.acquire();
                        assert_eq!(buf.len(), 256);
                        pool.release(buf);
                    }
                });
            }
        });
    }
}
