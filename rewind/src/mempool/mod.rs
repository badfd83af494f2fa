//! A fixed-size object allocator for the unwinder's own bookkeeping.
//!
//! Unwinding runs in places where the general allocator may be unusable: during early process
//! start-up, or inside a signal handler that interrupted the allocator itself. Pools acquire
//! whole pages from a [`PageSource`] and fall back to the static [`BootstrapArena`] when no
//! pages are available. Freed objects go back on the pool's free list. The pages themselves are
//! handed back to their source when the pool is dropped; arena objects never are.

mod arena;
mod typed;

pub use arena::{BootstrapArena, BOOTSTRAP_ARENA_SIZE};
pub use typed::{Pool, PoolBox};

use std::ptr::NonNull;

use parking_lot::Mutex;
use static_assertions::const_assert;

use crate::Error;

/// Every object handed out by a pool is aligned to this many bytes.
pub const MAX_ALIGN: usize = 16;

/// Bytes at the start of every acquired chunk that link it into the pool's chunk list.
const CHUNK_HEADER: usize = MAX_ALIGN;

/// Smallest reserve derived when a pool is created without one.
const MIN_DEFAULT_RESERVE: usize = 16;

pub(crate) const fn round_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Where a pool gets its memory from.
pub trait PageSource: Send + Sync {
    /// Granularity of [`PageSource::acquire`].
    fn page_size(&self) -> usize;

    /// Acquire `size` bytes, a multiple of the page size, aligned to at least [`MAX_ALIGN`].
    fn acquire(&self, size: usize) -> Option<NonNull<u8>>;

    /// Hand back memory obtained from [`PageSource::acquire`].
    ///
    /// # Safety
    ///
    /// `memory` must have been returned by `acquire(size)` on this source, and must not be used
    /// afterwards.
    unsafe fn release(&self, memory: NonNull<u8>, size: usize);
}

/// Anonymous private mappings from the operating system.
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemPages;

#[cfg(unix)]
impl PageSource for SystemPages {
    fn page_size(&self) -> usize {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size)
            .ok()
            .filter(|size| *size > 0)
            .unwrap_or(4096)
    }

    fn acquire(&self, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: an anonymous mapping with no address hint does not alias existing memory.
        let memory = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if memory == libc::MAP_FAILED {
            tracing::debug!("mmap of {size} bytes failed");
            return None;
        }
        NonNull::new(memory.cast())
    }

    unsafe fn release(&self, memory: NonNull<u8>, size: usize) {
        if libc::munmap(memory.as_ptr().cast(), size) != 0 {
            tracing::warn!(
                "munmap of {size} bytes at {:p} failed: {}",
                memory,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
impl PageSource for SystemPages {
    fn page_size(&self) -> usize {
        4096
    }

    fn acquire(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = std::alloc::Layout::from_size_align(size, self.page_size()).ok()?;
        // SAFETY: the layout has a non-zero size, pools never request zero bytes.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn release(&self, memory: NonNull<u8>, size: usize) {
        if let Ok(layout) = std::alloc::Layout::from_size_align(size, self.page_size()) {
            std::alloc::dealloc(memory.as_ptr(), layout);
        }
    }
}

struct FreeObject {
    next: Option<NonNull<FreeObject>>,
}

/// Written at the start of every chunk acquired from the page source.
struct ChunkHeader {
    next: Option<NonNull<ChunkHeader>>,
    size: usize,
}

const_assert!(std::mem::size_of::<ChunkHeader>() <= CHUNK_HEADER);

struct FreeList {
    head: Option<NonNull<FreeObject>>,
    num_free: usize,
    /// Chunks owned by the pool, newest first.
    chunks: Option<NonNull<ChunkHeader>>,
}

// SAFETY: the list only links memory owned by its pool, and is only touched under the pool lock.
unsafe impl Send for FreeList {}

impl FreeList {
    /// # Safety
    ///
    /// `object` must point to at least `size_of::<FreeObject>()` writable bytes owned by the pool
    /// and not in use.
    unsafe fn push(&mut self, object: NonNull<u8>) {
        let object = object.cast::<FreeObject>();
        object.as_ptr().write(FreeObject { next: self.head });
        self.head = Some(object);
        self.num_free += 1;
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        let object = self.head?;
        // SAFETY: objects on the list were initialised by `push` and are not handed out.
        self.head = unsafe { object.as_ref().next };
        self.num_free -= 1;
        Some(object.cast())
    }
}

/// A pool of fixed-size objects.
pub struct MemoryPool {
    free_list: Mutex<FreeList>,
    object_size: usize,
    reserve: usize,
    chunk_size: usize,
    page_size: usize,
    source: Box<dyn PageSource>,
    arena: &'static BootstrapArena,
}

impl MemoryPool {
    /// A pool of `object_size` byte objects backed by [`SystemPages`] and the global bootstrap
    /// arena. A `reserve` of 0 derives one from the page size.
    pub fn new(object_size: usize, reserve: usize) -> Result<Self, Error> {
        Self::with_source(
            object_size,
            reserve,
            Box::new(SystemPages),
            BootstrapArena::global(),
        )
    }

    /// A pool that acquires its memory from `source`, falling back to `arena`.
    ///
    /// The object size is rounded up to [`MAX_ALIGN`]. Without a reserve, one quarter of a page
    /// worth of objects is kept in reserve, but never fewer than 16. Bulk expansion acquires
    /// enough pages for twice the reserve. One expansion happens before this returns.
    ///
    /// Dropping the pool releases every page it acquired. Objects handed out by it must not be
    /// used afterwards.
    pub fn with_source(
        object_size: usize,
        reserve: usize,
        source: Box<dyn PageSource>,
        arena: &'static BootstrapArena,
    ) -> Result<Self, Error> {
        let page_size = source.page_size();
        let object_size = round_up(object_size.max(1), MAX_ALIGN);
        let reserve = match reserve {
            0 => (page_size / object_size / 4).max(MIN_DEFAULT_RESERVE),
            reserve => reserve,
        };
        let chunk_size = round_up(CHUNK_HEADER + 2 * reserve * object_size, page_size);

        let pool = Self {
            free_list: Mutex::new(FreeList {
                head: None,
                num_free: 0,
                chunks: None,
            }),
            object_size,
            reserve,
            chunk_size,
            page_size,
            source,
            arena,
        };
        pool.expand(&mut pool.free_list.lock())?;

        tracing::debug!(
            "Memory pool of {object_size} byte objects: reserve {reserve}, chunk {chunk_size} bytes"
        );
        Ok(pool)
    }

    fn expand(&self, free_list: &mut FreeList) -> Result<(), Error> {
        let single_page = round_up(CHUNK_HEADER + self.object_size, self.page_size);
        let chunk = [self.chunk_size, single_page]
            .into_iter()
            .find_map(|size| Some((self.source.acquire(size)?, size)));

        let Some((memory, size)) = chunk else {
            tracing::warn!(
                "No pages available, taking a {} byte object from the bootstrap arena",
                self.object_size
            );
            let object = self.arena.alloc(self.object_size)?;
            // SAFETY: the arena handed the object to this pool for good.
            unsafe { free_list.push(object) };
            return Ok(());
        };

        let header = memory.cast::<ChunkHeader>();
        // SAFETY: the header takes the first bytes of memory just acquired for this pool.
        unsafe {
            header.as_ptr().write(ChunkHeader {
                next: free_list.chunks,
                size,
            })
        };
        free_list.chunks = Some(header);

        for offset in (CHUNK_HEADER..=size - self.object_size).step_by(self.object_size) {
            // SAFETY: the object lies inside memory just acquired for this pool, past the header.
            unsafe { free_list.push(memory.byte_add(offset)) };
        }
        Ok(())
    }

    /// Take an object from the pool.
    ///
    /// When the number of free objects is at or below the reserve the pool expands first. A
    /// failed expansion is only an error when no free object is left.
    pub fn alloc(&self) -> Result<NonNull<u8>, Error> {
        let mut free_list = self.free_list.lock();
        if free_list.num_free <= self.reserve {
            if let Err(error) = self.expand(&mut free_list) {
                if free_list.num_free == 0 {
                    tracing::error!("Memory pool exhausted: {error}");
                    return Err(error);
                }
                tracing::warn!("Memory pool could not be replenished: {error}");
            }
        }
        free_list
            .pop()
            .ok_or_else(|| Error::Other("memory pool free list is empty".to_string()))
    }

    /// Put an object back on the free list.
    ///
    /// # Safety
    ///
    /// `object` must have been returned by [`MemoryPool::alloc`] on this pool and must not be
    /// used afterwards.
    pub unsafe fn free(&self, object: NonNull<u8>) {
        self.free_list.lock().push(object);
    }

    /// Number of objects on the free list.
    pub fn num_free(&self) -> usize {
        self.free_list.lock().num_free
    }

    /// Size of the objects, after rounding.
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Free objects kept in reserve.
    pub fn reserve(&self) -> usize {
        self.reserve
    }

    /// Bytes acquired by one bulk expansion.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let mut chunk = self.free_list.get_mut().chunks.take();
        let mut released = 0;
        while let Some(header) = chunk {
            // SAFETY: headers are written by `expand` at the start of chunks this pool owns.
            let ChunkHeader { next, size } = unsafe { header.as_ptr().read() };
            // SAFETY: the chunk came from `acquire(size)`, and the pool's objects die with it.
            unsafe { self.source.release(header.cast(), size) };
            released += size;
            chunk = next;
        }
        tracing::trace!("Memory pool released {released} bytes");
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("object_size", &self.object_size)
            .field("reserve", &self.reserve)
            .field("chunk_size", &self.chunk_size)
            .field("num_free", &self.num_free())
            .finish()
    }
}
