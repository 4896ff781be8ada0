//! Recycling of the containers a drain fills on every flush cycle.
//!
//! The pool is purely an allocation optimization: a pooled value is
//! [`recycled`](Recycle::recycle) before it goes back on the idle queue, and
//! the flush protocol never depends on getting a particular instance back.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

/// Resets a container to its empty state while keeping its allocation.
pub trait Recycle {
    fn recycle(&mut self);
}

impl<T> Recycle for Vec<T> {
    fn recycle(&mut self) {
        self.clear();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub idle: usize,
}

/// Lock-free object pool with a bounded idle set.
pub struct ObjectPool<T> {
    idle: SegQueue<T>,
    idle_count: AtomicUsize,
    max_idle: usize,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    created: AtomicU64,
    reused: AtomicU64,
}

impl<T> std::fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("max_idle", &self.max_idle)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T: Recycle> ObjectPool<T> {
    pub fn new(max_idle: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            idle: SegQueue::new(),
            idle_count: AtomicUsize::new(0),
            max_idle,
            factory: Box::new(factory),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        })
    }

    /// Borrows an empty value. It returns to the pool when the guard drops.
    pub fn get(self: &Arc<Self>) -> Pooled<T> {
        let value = match self.idle.pop() {
            Some(value) => {
                self.idle_count.fetch_sub(1, Ordering::Relaxed);
                self.reused.fetch_add(1, Ordering::Relaxed);
                value
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                (self.factory)()
            }
        };
        Pooled {
            value: Some(value),
            pool: Arc::clone(self),
        }
    }

    fn put_back(&self, mut value: T) {
        value.recycle();
        if self.idle_count.fetch_add(1, Ordering::Relaxed) < self.max_idle {
            self.idle.push(value);
        } else {
            self.idle_count.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl<T> ObjectPool<T> {
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            idle: self.idle_count.load(Ordering::Relaxed),
        }
    }
}

/// A value borrowed from an [`ObjectPool`].
pub struct Pooled<T: Recycle> {
    value: Option<T>,
    pool: Arc<ObjectPool<T>>,
}

impl<T: Recycle> Pooled<T> {
    /// Takes the value out for good; it will not be returned to the pool.
    pub fn detach(mut self) -> T {
        // `value` is only `None` after detach or drop, both of which consume the guard.
        self.value.take().unwrap_or_else(|| (self.pool.factory)())
    }
}

impl<T: Recycle> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled value accessed after release"))
    }
}

impl<T: Recycle> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value
            .as_mut()
            .unwrap_or_else(|| unreachable!("pooled value accessed after release"))
    }
}

impl<T: Recycle> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.put_back(value);
        }
    }
}

impl<T: Recycle + std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reuses_allocation() {
        let pool = ObjectPool::new(4, || Vec::<u32>::with_capacity(16));
        let ptr = {
            let mut list = pool.get();
            list.extend([1, 2, 3]);
            list.as_ptr()
        };
        let list = pool.get();
        assert!(list.is_empty());
        assert_eq!(list.as_ptr(), ptr);
        assert_eq!(
            pool.stats(),
            PoolStats {
                created: 1,
                reused: 1,
                idle: 0
            }
        );
    }

    #[test]
    fn test_idle_set_is_bounded() {
        let pool = ObjectPool::new(2, Vec::<u8>::new);
        let borrowed: Vec<_> = (0..5).map(|_| pool.get()).collect();
        drop(borrowed);
        assert_eq!(pool.stats().idle, 2);
        assert_eq!(pool.stats().created, 5);
    }

    #[test]
    fn test_detach_skips_return() {
        let pool = ObjectPool::new(2, Vec::<u8>::new);
        let mut buffer = pool.get();
        buffer.push(9);
        let owned = buffer.detach();
        assert_eq!(owned.len(), 1);
        assert_eq!(pool.stats().idle, 0);
    }

    #[test]
    fn test_concurrent_borrowers_never_share() {
        let pool = ObjectPool::new(8, Vec::<usize>::new);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        let mut list = pool.get();
                        assert!(list.is_empty());
                        list.push(t * 1000 + i);
                        assert_eq!(list.len(), 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.created + stats.reused, 8000);
        assert!(stats.idle <= 8);
    }
}
