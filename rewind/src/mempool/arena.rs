use std::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use static_assertions::const_assert;

use crate::Error;

use super::{round_up, MAX_ALIGN};

/// Size of the process-wide bootstrap arena.
pub const BOOTSTRAP_ARENA_SIZE: usize = 16 * 1024;

#[repr(C, align(16))]
struct ArenaMemory([u8; BOOTSTRAP_ARENA_SIZE]);

const_assert!(std::mem::align_of::<ArenaMemory>() == MAX_ALIGN);
const_assert!(BOOTSTRAP_ARENA_SIZE % MAX_ALIGN == 0);

/// A small static arena that serves allocations when pages cannot be acquired.
///
/// Allocation advances a single offset with a compare-and-swap loop, so it neither locks nor
/// calls into the system allocator and is usable inside signal handlers. Memory handed out is
/// never returned.
pub struct BootstrapArena {
    memory: UnsafeCell<ArenaMemory>,
    used: AtomicUsize,
}

// SAFETY: every successful `alloc` hands out a range no other call can return, and the arena
// itself never reads or writes its memory.
unsafe impl Sync for BootstrapArena {}

static GLOBAL_ARENA: BootstrapArena = BootstrapArena::new();

impl BootstrapArena {
    /// A fresh, empty arena.
    pub const fn new() -> Self {
        Self {
            memory: UnsafeCell::new(ArenaMemory([0; BOOTSTRAP_ARENA_SIZE])),
            used: AtomicUsize::new(0),
        }
    }

    /// The process-wide arena used by pools that are not given one explicitly.
    pub fn global() -> &'static BootstrapArena {
        &GLOBAL_ARENA
    }

    /// Carve `size` bytes, rounded up to [`MAX_ALIGN`], out of the arena.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, Error> {
        let size = round_up(size.max(1), MAX_ALIGN);
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            let remaining = BOOTSTRAP_ARENA_SIZE - used;
            if size > remaining {
                return Err(Error::BootstrapArenaExhausted {
                    requested: size,
                    remaining,
                });
            }
            match self.used.compare_exchange_weak(
                used,
                used + size,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => used = current,
            }
        }

        // SAFETY: `used + size` does not exceed the arena, so the offset stays inside the
        // allocation, and the base of a static is never null.
        Ok(unsafe { NonNull::new_unchecked(self.memory.get().cast::<u8>().add(used)) })
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Bytes still available.
    pub fn remaining(&self) -> usize {
        BOOTSTRAP_ARENA_SIZE - self.used()
    }
}

impl Default for BootstrapArena {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BootstrapArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapArena")
            .field("used", &self.used())
            .field("size", &BOOTSTRAP_ARENA_SIZE)
            .finish()
    }
}
