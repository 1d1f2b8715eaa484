use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A thread-safe pool for reusing allocations, used by the stdnet back-end
/// to recycle read buffers across connection reader threads.
///
/// Objects are lazily created when the pool is empty and run through the
/// reset hook on every acquire, so a recycled buffer is indistinguishable
/// from a fresh one.
#[derive(Clone)]
pub struct ObjectPool<T> {
    pool: Arc<Mutex<VecDeque<T>>>,
    create_fn: Arc<dyn Fn() -> T + Send + Sync>,
    reset_fn: Arc<dyn Fn(&mut T) + Send + Sync>,
    capacity: usize,
}

impl<T: Send + 'static> ObjectPool<T> {
    /// Creates a pool seeded with `initial_size` objects. `create_fn` makes
    /// new objects; `reset_fn` restores a recycled object before reuse.
    pub fn new<F, R>(initial_size: usize, create_fn: F, reset_fn: R) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        let mut pool = VecDeque::with_capacity(initial_size);
        for _ in 0..initial_size {
            pool.push_back(create_fn());
        }

        Self {
            pool: Arc::new(Mutex::new(pool)),
            create_fn: Arc::new(create_fn),
            reset_fn: Arc::new(reset_fn),
            capacity: initial_size,
        }
    }

    /// Acquires an object, creating a new one if the pool is empty.
    pub fn acquire(&self) -> PooledObject<T> {
        let object = self.pool.lock().unwrap().pop_front();
        let mut object = object.unwrap_or_else(|| (self.create_fn)());
        (self.reset_fn)(&mut object);

        PooledObject {
            object: Some(object),
            pool: Arc::clone(&self.pool),
            capacity: self.capacity,
        }
    }

    /// Approximate number of idle objects currently pooled.
    pub fn available(&self) -> usize {
        self.pool.lock().unwrap().len()
    }
}

/// Guard that returns its object to the pool when dropped, unless the pool
/// is already at capacity.
pub struct PooledObject<T> {
    object: Option<T>,
    pool: Arc<Mutex<VecDeque<T>>>,
    capacity: usize,
}

impl<T> PooledObject<T> {
    /// Takes ownership of the inner object, preventing it from returning to
    /// the pool.
    pub fn take(mut self) -> T {
        self.object.take().expect("PooledObject already taken")
    }
}

impl<T> std::ops::Deref for PooledObject<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.object.as_ref().expect("PooledObject is empty")
    }
}

impl<T> std::ops::DerefMut for PooledObject<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.object.as_mut().expect("PooledObject is empty")
    }
}

impl<T> Drop for PooledObject<T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            let mut pool = self.pool.lock().unwrap();
            if pool.len() < self.capacity {
                pool.push_back(object);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_pool(initial: usize) -> ObjectPool<Vec<u8>> {
        ObjectPool::new(initial, || vec![0u8; 1024], |b| b.resize(1024, 0))
    }

    #[test]
    fn pool_reuses_allocations() {
        let pool = buffer_pool(1);

        let obj1 = pool.acquire();
        let ptr1 = obj1.as_ptr();
        drop(obj1);

        let obj2 = pool.acquire();
        assert_eq!(obj2.as_ptr(), ptr1, "pool should reuse the allocation");
    }

    #[test]
    fn reset_runs_on_acquire() {
        let pool = buffer_pool(1);

        let mut obj = pool.acquire();
        obj.truncate(3);
        obj[0] = 0xff;
        drop(obj);

        let obj = pool.acquire();
        assert_eq!(obj.len(), 1024);
        assert_eq!(obj[0], 0);
    }

    #[test]
    fn pool_grows_past_initial_size() {
        let pool = buffer_pool(1);
        let _a = pool.acquire();
        let _b = pool.acquire();
        let _c = pool.acquire();
    }

    #[test]
    fn pool_respects_capacity_limit() {
        let pool = buffer_pool(2);

        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        assert_eq!(pool.available(), 0);

        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn take_removes_from_pool() {
        let pool = buffer_pool(1);
        let obj = pool.acquire();
        let _vec = obj.take();
        assert_eq!(pool.available(), 0);
    }
}
