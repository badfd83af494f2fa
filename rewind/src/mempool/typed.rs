use std::{
    fmt,
    marker::PhantomData,
    mem::{align_of, size_of},
    ops::{Deref, DerefMut},
    ptr::NonNull,
    sync::Arc,
};

use crate::Error;

use super::{MemoryPool, MAX_ALIGN};

/// A [`MemoryPool`] handing out initialised values of type `T`.
pub struct Pool<T> {
    pool: Arc<MemoryPool>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Pool<T> {
    /// A pool sized for `T`, backed by system pages.
    pub fn new(reserve: usize) -> Result<Self, Error> {
        Self::with_pool(Arc::new(MemoryPool::new(size_of::<T>(), reserve)?))
    }

    /// Use an existing pool. Its objects must be large enough for `T`.
    pub fn with_pool(pool: Arc<MemoryPool>) -> Result<Self, Error> {
        if align_of::<T>() > MAX_ALIGN {
            return Err(Error::NotSupported(
                "pool objects with an alignment above the platform maximum",
            ));
        }
        if pool.object_size() < size_of::<T>() {
            return Err(Error::Other(format!(
                "pool objects of {} bytes cannot hold {} bytes",
                pool.object_size(),
                size_of::<T>()
            )));
        }
        Ok(Self {
            pool,
            _marker: PhantomData,
        })
    }

    /// Move `value` into an object taken from the pool.
    pub fn alloc(&self, value: T) -> Result<PoolBox<T>, Error> {
        let object = self.pool.alloc()?.cast::<T>();
        // SAFETY: the object is aligned and large enough for `T`, checked in `with_pool`.
        unsafe { object.as_ptr().write(value) };
        Ok(PoolBox {
            object,
            pool: self.pool.clone(),
        })
    }

    /// The underlying untyped pool.
    pub fn memory_pool(&self) -> &MemoryPool {
        &self.pool
    }
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pool").field(&self.pool).finish()
    }
}

/// An owned value living in a pool object. Dropping it returns the object to the pool.
pub struct PoolBox<T> {
    object: NonNull<T>,
    pool: Arc<MemoryPool>,
}

// SAFETY: a `PoolBox` owns its value exactly like a `Box` does.
unsafe impl<T: Send> Send for PoolBox<T> {}
// SAFETY: shared access only hands out `&T`.
unsafe impl<T: Sync> Sync for PoolBox<T> {}

impl<T> Deref for PoolBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the object was initialised in `Pool::alloc` and is owned by this box.
        unsafe { self.object.as_ref() }
    }
}

impl<T> DerefMut for PoolBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see `deref`, and `&mut self` guarantees exclusive access.
        unsafe { self.object.as_mut() }
    }
}

impl<T> Drop for PoolBox<T> {
    fn drop(&mut self) {
        // SAFETY: the value is initialised and dropped exactly once, then the object goes back to
        // the pool it came from.
        unsafe {
            self.object.as_ptr().drop_in_place();
            self.pool.free(self.object.cast());
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PoolBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
