//! The procedure-info cache of an address space and its generation counter.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    mempool::{Pool, PoolBox},
    proc_info::ProcInfo,
    Error,
};

/// A snapshot of a [`CacheGeneration`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Generation(pub u64);

/// Counter bumped every time cached unwind information may have become wrong, e.g. because code
/// was loaded or unloaded.
#[derive(Debug, Default)]
pub struct CacheGeneration(AtomicU64);

impl CacheGeneration {
    /// A counter at generation 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current generation.
    pub fn current(&self) -> Generation {
        Generation(self.0.load(Ordering::Acquire))
    }

    /// Advance to a new generation and return it.
    pub fn bump(&self) -> Generation {
        Generation(self.0.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// `true` if no bump happened since `generation` was read.
    pub fn is_current(&self, generation: Generation) -> bool {
        self.current() == generation
    }
}

/// Whether an address space caches procedure information.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachingPolicy {
    /// Every lookup goes to the accessors.
    None,
    /// Lookups are cached for all threads using the address space.
    #[default]
    Global,
}

#[derive(Debug)]
struct CacheEntry {
    info: Arc<ProcInfo>,
    generation: Generation,
}

/// Result of a cache lookup.
#[derive(Debug)]
pub(crate) enum Lookup {
    Hit(Arc<ProcInfo>),
    /// An entry covers the address but was filled in an older generation.
    Stale,
    Miss,
}

/// Cached procedure information keyed by start address. Entries never overlap.
///
/// Entries are immutable once inserted. Invalidation never touches them: a stale entry is only
/// discarded when a later fill finds it in the way.
#[derive(Debug)]
pub(crate) struct UnwindCache {
    entries: RwLock<BTreeMap<u64, PoolBox<CacheEntry>>>,
    pool: Pool<CacheEntry>,
}

impl UnwindCache {
    pub(crate) fn new(reserve: usize) -> Result<Self, Error> {
        Ok(Self {
            entries: RwLock::new(BTreeMap::new()),
            pool: Pool::new(reserve)?,
        })
    }

    pub(crate) fn lookup(&self, ip: u64, generation: Generation) -> Lookup {
        let entries = self.entries.read();
        match entries.range(..=ip).next_back() {
            Some((_, entry)) if entry.info.contains(ip) => {
                if entry.generation == generation {
                    Lookup::Hit(entry.info.clone())
                } else {
                    Lookup::Stale
                }
            }
            _ => Lookup::Miss,
        }
    }

    /// Insert `info`, looked up while `generation` was current. Nothing is inserted if the
    /// generation moved on in the meantime.
    pub(crate) fn insert(
        &self,
        info: Arc<ProcInfo>,
        generation: Generation,
        counter: &CacheGeneration,
    ) -> Result<(), Error> {
        let entry = self.pool.alloc(CacheEntry { info, generation })?;

        let mut entries = self.entries.write();
        if !counter.is_current(generation) {
            tracing::debug!("Cache flushed during lookup, dropping {:#x}", entry.info.start_ip);
            return Ok(());
        }

        let (start, end) = (entry.info.start_ip, entry.info.end_ip);
        let overlapping: Vec<u64> = entries
            .range(..end)
            .rev()
            .take_while(|(_, other)| other.info.end_ip > start)
            .map(|(key, _)| *key)
            .collect();
        for key in overlapping {
            entries.remove(&key);
        }
        entries.insert(start, entry);
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn info(start: u64, end: u64) -> Arc<ProcInfo> {
        Arc::new(ProcInfo::new(start, end))
    }

    #[test]
    fn generations_strictly_increase() {
        let counter = CacheGeneration::new();
        let mut previous = counter.current();
        for _ in 0..100 {
            let next = counter.bump();
            assert!(next > previous);
            assert_eq!(counter.current(), next);
            previous = next;
        }
    }

    #[test]
    fn entries_from_an_old_generation_are_stale() {
        let counter = CacheGeneration::new();
        let cache = UnwindCache::new(4).unwrap();
        let before = counter.current();
        cache.insert(info(0x100, 0x200), before, &counter).unwrap();
        assert!(matches!(cache.lookup(0x150, before), Lookup::Hit(_)));
        assert!(matches!(cache.lookup(0x200, before), Lookup::Miss));

        let after = counter.bump();
        assert!(!counter.is_current(before));
        assert!(matches!(cache.lookup(0x150, after), Lookup::Stale));
        // Still there: stale entries are only removed by a later fill.
        assert_eq!(cache.len(), 1);

        cache.insert(info(0x100, 0x180), after, &counter).unwrap();
        assert!(matches!(cache.lookup(0x150, after), Lookup::Hit(_)));
        assert!(matches!(cache.lookup(0x190, after), Lookup::Miss));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn fills_from_before_a_flush_are_dropped() {
        let counter = CacheGeneration::new();
        let cache = UnwindCache::new(4).unwrap();
        let captured = counter.current();
        counter.bump();
        cache.insert(info(0x100, 0x200), captured, &counter).unwrap();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn overlapping_fills_replace_older_entries() {
        let counter = CacheGeneration::new();
        let cache = UnwindCache::new(4).unwrap();
        let generation = counter.current();
        cache.insert(info(0x100, 0x200), generation, &counter).unwrap();
        cache.insert(info(0x300, 0x400), generation, &counter).unwrap();
        cache.insert(info(0x180, 0x320), generation, &counter).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(matches!(cache.lookup(0x300, generation), Lookup::Hit(hit) if hit.start_ip == 0x180));
    }
}
