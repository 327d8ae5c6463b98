use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

/// A value that can be cleared for reuse by a later call.
pub trait Recycle {
    /// Clear all per-call contents. Implementations may also release oversized
    /// backing storage.
    fn recycle(&mut self);
}

impl Recycle for Vec<String> {
    fn recycle(&mut self) {
        self.clear();
        if self.capacity() > 1024 {
            self.shrink_to(1024);
        }
    }
}

/// A small free list of reusable buffers shared by concurrent calls.
///
/// Each call takes exclusive ownership of one buffer through [`Pooled`]; buffers
/// are recycled before they go back on the free list.
#[derive(Debug)]
pub struct Pool<T> {
    free: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T: Recycle + Default> Pool<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { free: Mutex::new(Vec::new()), capacity }
    }

    pub fn get(&self) -> Pooled<'_, T> {
        let value = self.free.lock().pop().unwrap_or_default();
        Pooled { pool: self, value }
    }

    #[must_use]
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn put(&self, mut value: T) {
        value.recycle();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(value);
        }
    }
}

impl<T: Recycle + Default> Default for Pool<T> {
    fn default() -> Self {
        Self::new(16)
    }
}

/// Exclusive handle on a pooled buffer, returned to its pool on drop.
pub struct Pooled<'a, T: Recycle + Default> {
    pool: &'a Pool<T>,
    value: T,
}

impl<T: Recycle + Default> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Recycle + Default> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Recycle + Default> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.value));
    }
}
