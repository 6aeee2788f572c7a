//! Process-wide buffer pools for point-cloud parallel arrays.
//!
//! Two pools exist, keyed on element type (`f32` for coordinates, `u8` for
//! intensity/classification). Acquisition hands out an array of exactly the
//! requested length, reusing any pooled allocation with enough capacity.
//! Release keeps an array only while its capacity stays under
//! [`POOL_CAP_LIMIT`], so one outlier-sized frame cannot pin memory forever.

use std::sync::Mutex;

/// Largest array capacity (elements) the pool will retain on release.
pub const POOL_CAP_LIMIT: usize = 150_000;

pub struct BufferPool<T> {
    free: Mutex<Vec<Vec<T>>>,
}

impl<T: Clone + Default> BufferPool<T> {
    pub const fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Hand out an array of length `len`, zero-initialised.
    ///
    /// Reuses the first pooled array whose capacity covers `len`; allocates
    /// fresh otherwise.
    pub fn acquire(&self, len: usize) -> Vec<T> {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(idx) = free.iter().position(|buf| buf.capacity() >= len) {
            let mut buf = free.swap_remove(idx);
            drop(free);
            buf.clear();
            buf.resize(len, T::default());
            return buf;
        }
        drop(free);
        vec![T::default(); len]
    }

    /// Return an array to the pool. Arrays over [`POOL_CAP_LIMIT`] are
    /// dropped instead of retained.
    pub fn release(&self, buf: Vec<T>) {
        if buf.capacity() > POOL_CAP_LIMIT {
            return;
        }
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.push(buf);
    }

    /// Number of arrays currently pooled.
    pub fn pooled(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

static F32_POOL: BufferPool<f32> = BufferPool::new();
static U8_POOL: BufferPool<u8> = BufferPool::new();

pub fn acquire_f32(len: usize) -> Vec<f32> {
    F32_POOL.acquire(len)
}

pub fn release_f32(buf: Vec<f32>) {
    F32_POOL.release(buf);
}

pub fn acquire_u8(len: usize) -> Vec<u8> {
    U8_POOL.acquire(len)
}

pub fn release_u8(buf: Vec<u8>) {
    U8_POOL.release(buf);
}
