//! Reusable object pools.
//!
//! Hot request paths (receipt rendering, payload encoding) allocate the same scratch
//! buffers over and over. A pool keeps a bounded number of idle objects around and hands
//! them out behind an RAII guard that resets and returns them on drop.
//!
//! Pools are ordinary values: build them once at startup and pass them to the call sites
//! that need them.
//!
//! # Example
//!
//! ```rust
//! use pos_resilience_runtime::object_pool::ObjectPool;
//! use std::fmt::Write;
//!
//! let builders = ObjectPool::string_builders(32);
//! let line = {
//!     let mut buf = builders.get();
//!     let _ = write!(buf, "{} x {}", 2, "flat white");
//!     buf.clone()
//! };
//! assert_eq!(line, "2 x flat white");
//! assert_eq!(builders.idle(), 1);
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Initial capacity of pooled byte buffers.
pub const BYTE_BUFFER_CAPACITY: usize = 1024;

type Create<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// Bounded pool of reusable `T`.
pub struct ObjectPool<T: Default> {
    idle: Mutex<Vec<T>>,
    create: Create<T>,
    reset: Reset<T>,
    max_idle: usize,
    created: AtomicUsize,
}

impl<T: Default> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("idle", &self.idle())
            .field("max_idle", &self.max_idle)
            .field("created", &self.created())
            .finish_non_exhaustive()
    }
}

impl<T: Default> ObjectPool<T> {
    /// Create a pool.
    ///
    /// * `create` - builds a fresh object when none is idle
    /// * `reset` - clears an object before it goes back to the pool
    /// * `max_idle` - objects beyond this many idle ones are dropped instead of kept
    #[must_use]
    pub fn new<F, R>(create: F, reset: R, max_idle: usize) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            create: Box::new(create),
            reset: Box::new(reset),
            max_idle,
            created: AtomicUsize::new(0),
        }
    }

    /// Take an object from the pool, creating one if none is idle.
    pub fn get(&self) -> Pooled<'_, T> {
        let recycled = self.idle.lock().pop();
        let value = recycled.unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            (self.create)()
        });
        Pooled { pool: self, value }
    }

    /// Idle objects currently held.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Objects created over the pool's lifetime.
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Upper bound on idle objects.
    #[must_use]
    pub const fn max_idle(&self) -> usize {
        self.max_idle
    }

    fn put_back(&self, mut value: T) {
        (self.reset)(&mut value);
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(value);
        }
    }
}

impl ObjectPool<Vec<u8>> {
    /// Byte buffers starting at [`BYTE_BUFFER_CAPACITY`], cleared on return.
    #[must_use]
    pub fn byte_buffers(max_idle: usize) -> Self {
        Self::new(
            || Vec::with_capacity(BYTE_BUFFER_CAPACITY),
            |buf: &mut Vec<u8>| buf.clear(),
            max_idle,
        )
    }
}

impl ObjectPool<String> {
    /// String builders, cleared on return.
    #[must_use]
    pub fn string_builders(max_idle: usize) -> Self {
        Self::new(String::new, String::clear, max_idle)
    }
}

/// An object on loan from an [`ObjectPool`]; goes back on drop.
pub struct Pooled<'a, T: Default> {
    pool: &'a ObjectPool<T>,
    value: T,
}

impl<T: Default + fmt::Debug> fmt::Debug for Pooled<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.value, f)
    }
}

impl<T: Default> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Default> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Default> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        self.pool.put_back(std::mem::take(&mut self.value));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_objects_are_reused_and_reset() {
        let pool = ObjectPool::byte_buffers(4);

        {
            let mut buf = pool.get();
            buf.write_all(b"receipt #1").unwrap();
            assert_eq!(buf.as_slice(), b"receipt #1");
        }
        assert_eq!(pool.idle(), 1);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= BYTE_BUFFER_CAPACITY);
        assert_eq!(pool.created(), 1);
    }

    #[test]
    fn test_idle_objects_are_bounded() {
        let pool = ObjectPool::string_builders(2);

        let loans: Vec<_> = (0..5).map(|_| pool.get()).collect();
        assert_eq!(pool.created(), 5);
        drop(loans);

        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_custom_reset() {
        let pool = ObjectPool::new(Vec::<u32>::new, |v: &mut Vec<u32>| v.truncate(1), 1);
        {
            let mut v = pool.get();
            v.extend([7, 8, 9]);
        }
        assert_eq!(*pool.get(), vec![7]);
    }

    #[test]
    fn test_pool_shared_across_threads() {
        let pool = std::sync::Arc::new(ObjectPool::string_builders(8));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let pool = std::sync::Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut s = pool.get();
                        s.push_str(&i.to_string());
                        assert_eq!(s.len(), 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(pool.created() <= 4);
        assert!(pool.idle() <= pool.max_idle());
    }
}
