// this_file: src/registry.rs
//! In-process index of live caches.
//!
//! Entries live in a skip list ordered by base address, so any pointer into a
//! cache (the base, a pattern, a string) finds its owner in expected
//! `O(log n)`. A second, linear lookup matches the `(dev, ino, mtime)` identity of
//! the file a cache was loaded from. Every entry carries the reference count of
//! its cache and the overflow blocks allocated on its behalf.
//!
//! A single mutex guards the whole structure. Backing stores and overflow blocks
//! of removed entries are released after the mutex is dropped.

use crate::cache::CacheBlob;
use crate::error::{Error, Result};
use crate::stat::FileIdentity;
use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// Highest skip-list level.
pub const MAX_LEVEL: usize = 16;

/// Snapshot of one registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub base: usize,
    pub size: usize,
    pub refcount: usize,
    pub identity: FileIdentity,
    pub overflow_blocks: usize,
    pub is_mapped: bool,
}

impl EntryInfo {
    /// Whether `p` lies inside this entry's range.
    pub fn contains(&self, p: usize) -> bool {
        p >= self.base && p - self.base < self.size
    }
}

/// Aggregate registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub entries: usize,
    pub max_level: usize,
    pub mapped_bytes: usize,
    pub heap_bytes: usize,
    pub overflow_blocks: usize,
    pub overflow_bytes: usize,
}

/// Heap block owned by an entry, freed when the entry is removed.
struct OverflowBlock {
    ptr: NonNull<[u64]>,
}

// SAFETY: the block is uniquely owned by its entry; the registry never reads it.
unsafe impl Send for OverflowBlock {}

impl OverflowBlock {
    fn new(len: usize) -> Option<Self> {
        let words = len.div_ceil(8).max(1);
        let mut words_vec = Vec::<u64>::new();
        words_vec.try_reserve_exact(words).ok()?;
        words_vec.resize(words, 0);
        let raw = Box::into_raw(words_vec.into_boxed_slice());
        NonNull::new(raw).map(|ptr| Self { ptr })
    }

    fn payload(&self) -> NonNull<u8> {
        self.ptr.cast::<u8>()
    }

    fn bytes(&self) -> usize {
        self.ptr.len() * 8
    }
}

impl Drop for OverflowBlock {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from `Box::into_raw` and is released exactly once here.
        unsafe { drop(Box::from_raw(self.ptr.as_ptr())) }
    }
}

struct Entry {
    blob: Arc<CacheBlob>,
    base: usize,
    size: usize,
    refcount: usize,
    identity: FileIdentity,
    overflow: Vec<OverflowBlock>,
    next: SmallVec<[Option<usize>; 4]>,
}

impl Entry {
    fn info(&self) -> EntryInfo {
        EntryInfo {
            base: self.base,
            size: self.size,
            refcount: self.refcount,
            identity: self.identity,
            overflow_blocks: self.overflow.len(),
            is_mapped: self.blob.is_mapped(),
        }
    }
}

/// Skip list over an arena of entries; links are arena indices, `None` = head/end.
struct SkipList {
    slots: Vec<Option<Entry>>,
    free: Vec<usize>,
    heads: [Option<usize>; MAX_LEVEL],
    max_level: usize,
    len: usize,
    rng: StdRng,
}

impl SkipList {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            heads: [None; MAX_LEVEL],
            max_level: 0,
            len: 0,
            rng: StdRng::from_entropy(),
        }
    }

    fn entry(&self, idx: usize) -> Option<&Entry> {
        self.slots.get(idx)?.as_ref()
    }

    fn entry_mut(&mut self, idx: usize) -> Option<&mut Entry> {
        self.slots.get_mut(idx)?.as_mut()
    }

    fn next(&self, from: Option<usize>, level: usize) -> Option<usize> {
        match from {
            None => self.heads[level],
            Some(idx) => self.entry(idx)?.next.get(level).copied().flatten(),
        }
    }

    fn set_next(&mut self, from: Option<usize>, level: usize, to: Option<usize>) {
        match from {
            None => self.heads[level] = to,
            Some(idx) => {
                if let Some(link) = self.entry_mut(idx).and_then(|e| e.next.get_mut(level)) {
                    *link = to;
                }
            }
        }
    }

    /// Last node before `key` on every level in use.
    fn predecessors(&self, key: usize) -> [Option<usize>; MAX_LEVEL] {
        let mut update = [None; MAX_LEVEL];
        let mut cur = None;
        for level in (0..self.max_level).rev() {
            while let Some(n) = self.next(cur, level) {
                match self.entry(n) {
                    Some(e) if e.base < key => cur = Some(n),
                    _ => break,
                }
            }
            update[level] = cur;
        }
        update
    }

    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && self.rng.gen_ratio(1, 4) {
            level += 1;
        }
        level.min(self.max_level + 1)
    }

    fn insert(&mut self, blob: Arc<CacheBlob>, identity: FileIdentity) -> Result<()> {
        let base = blob.base();
        let size = blob.len();
        let update = self.predecessors(base);
        let level = self.random_level();

        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.try_reserve(1).map_err(|e| {
                    Error::ResourceExhausted(format!("registry entry: {}", e))
                })?;
                self.slots.push(None);
                self.slots.len() - 1
            }
        };

        let next = (0..level).map(|l| self.next(update[l], l)).collect();
        self.slots[idx] = Some(Entry {
            blob,
            base,
            size,
            refcount: 1,
            identity,
            overflow: Vec::new(),
            next,
        });
        for (l, pred) in update.iter().enumerate().take(level) {
            self.set_next(*pred, l, Some(idx));
        }
        self.max_level = self.max_level.max(level);
        self.len += 1;
        trace!(
            "registry: inserted {:#x}+{} at level {} ({} live)",
            base,
            size,
            level,
            self.len
        );
        Ok(())
    }

    /// Entry whose `[base, base + size)` range contains `p`.
    fn find(&self, p: usize) -> Option<usize> {
        let mut cur = None;
        for level in (0..self.max_level).rev() {
            while let Some(n) = self.next(cur, level) {
                match self.entry(n) {
                    Some(e) if p >= e.base + e.size => cur = Some(n),
                    _ => break,
                }
            }
        }
        let s = self.next(cur, 0)?;
        let e = self.entry(s)?;
        (p >= e.base && p < e.base + e.size).then_some(s)
    }

    fn find_by_identity(&self, identity: &FileIdentity) -> Option<usize> {
        let mut cur = self.heads[0];
        while let Some(idx) = cur {
            let e = self.entry(idx)?;
            if e.identity == *identity {
                return Some(idx);
            }
            cur = e.next.first().copied().flatten();
        }
        None
    }

    fn remove(&mut self, idx: usize) -> Option<Entry> {
        let base = self.entry(idx)?.base;
        let update = self.predecessors(base);
        for (level, pred) in update.iter().enumerate().take(self.max_level) {
            if self.next(*pred, level) == Some(idx) {
                let succ = self.next(Some(idx), level);
                self.set_next(*pred, level, succ);
            }
        }
        while self.max_level > 0 && self.heads[self.max_level - 1].is_none() {
            self.max_level -= 1;
        }
        let entry = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        self.len -= 1;
        trace!(
            "registry: removed {:#x}+{} ({} live)",
            entry.base,
            entry.size,
            self.len
        );
        Some(entry)
    }

    fn iter(&self) -> impl Iterator<Item = &Entry> + '_ {
        let mut cur = self.heads[0];
        std::iter::from_fn(move || {
            let e = self.entry(cur?)?;
            cur = e.next.first().copied().flatten();
            Some(e)
        })
    }

    fn check(&self) -> std::result::Result<(), String> {
        let mut count = 0;
        let mut prev: Option<&Entry> = None;
        for e in self.iter() {
            if let Some(p) = prev {
                if p.base >= e.base {
                    return Err(format!("level 0 not increasing at {:#x}", e.base));
                }
                if p.base + p.size > e.base {
                    return Err(format!("{:#x} overlaps {:#x}", p.base, e.base));
                }
            }
            if e.refcount == 0 {
                return Err(format!("{:#x} is live with refcount 0", e.base));
            }
            prev = Some(e);
            count += 1;
        }
        if count != self.len {
            return Err(format!("{} entries linked, {} counted", count, self.len));
        }
        for level in 1..MAX_LEVEL {
            let mut cur = self.heads[level];
            let mut last = None;
            while let Some(idx) = cur {
                let e = self.entry(idx).ok_or("link to a free slot")?;
                if e.next.len() <= level {
                    return Err(format!("{:#x} linked above its level", e.base));
                }
                if last.is_some_and(|b| b >= e.base) {
                    return Err(format!("level {} not increasing", level));
                }
                last = Some(e.base);
                cur = e.next[level];
            }
            if level >= self.max_level && self.heads[level].is_some() {
                return Err(format!("level {} used above max level", level));
            }
        }
        if self.max_level > 0 && self.heads[self.max_level - 1].is_none() {
            return Err("top level is empty".into());
        }
        Ok(())
    }
}

/// Shared handle to a cache registry.
///
/// Clones share the same index. [`Registry::global`] is the process-wide
/// instance used by default; separate instances are handy for isolation.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Mutex<SkipList>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Registry {
    /// A new, empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SkipList::new())),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    fn lock(&self) -> MutexGuard<'_, SkipList> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether two handles share one index.
    pub fn same_as(&self, other: &Registry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Admit `blob`, or share the live entry already loaded from the same file.
    ///
    /// Either way the caller owns one new reference to the returned blob. A
    /// duplicate loses the race and is released after the mutex is dropped.
    /// New blobs must not overlap a live entry; distinct live allocations never do.
    pub(crate) fn admit(
        &self,
        blob: Arc<CacheBlob>,
        identity: Option<FileIdentity>,
    ) -> Result<Arc<CacheBlob>> {
        let mut list = self.lock();
        if let Some(id) = identity.filter(|id| *id != FileIdentity::default()) {
            if let Some(entry) = list
                .find_by_identity(&id)
                .and_then(|idx| list.entry_mut(idx))
            {
                entry.refcount += 1;
                trace!("registry: sharing {:#x} for a duplicate load", entry.base);
                return Ok(Arc::clone(&entry.blob));
            }
        }
        list.insert(Arc::clone(&blob), identity.unwrap_or_default())?;
        Ok(blob)
    }

    /// The live entry whose range contains `p`.
    pub fn find_by_addr(&self, p: usize) -> Option<EntryInfo> {
        let list = self.lock();
        list.find(p).and_then(|idx| list.entry(idx)).map(Entry::info)
    }

    /// The live cache loaded from the file with `identity`, with one more reference.
    pub(crate) fn find_by_stat(&self, identity: &FileIdentity) -> Option<Arc<CacheBlob>> {
        let mut list = self.lock();
        let idx = list.find_by_identity(identity)?;
        let entry = list.entry_mut(idx)?;
        entry.refcount += 1;
        Some(Arc::clone(&entry.blob))
    }

    /// Add `n` references to the cache containing `p`.
    pub fn reference(&self, p: usize, n: usize) -> bool {
        let mut list = self.lock();
        let Some(entry) = list.find(p).and_then(|idx| list.entry_mut(idx)) else {
            return false;
        };
        match entry.refcount.checked_add(n) {
            Some(count) => {
                entry.refcount = count;
                true
            }
            None => {
                debug!("refusing {} more references at {:#x}: count would overflow", n, p);
                false
            }
        }
    }

    /// Drop one reference to the cache containing `p`, disposing it at zero.
    pub fn dereference(&self, p: usize) -> bool {
        let removed = {
            let mut list = self.lock();
            let Some(idx) = list.find(p) else {
                return false;
            };
            let remaining = match list.entry_mut(idx) {
                Some(entry) => {
                    entry.refcount = entry.refcount.saturating_sub(1);
                    entry.refcount
                }
                None => return false,
            };
            if remaining > 0 {
                return true;
            }
            list.remove(idx)
        };
        // Unmap or free outside the lock.
        drop(removed);
        true
    }

    /// Allocate `len` zeroed bytes that live as long as the cache containing `p`.
    ///
    /// The block is 8-byte aligned and freed when the cache is disposed.
    pub fn allocate_in(&self, p: usize, len: usize) -> Option<NonNull<u8>> {
        let block = OverflowBlock::new(len)?;
        let payload = block.payload();
        let mut list = self.lock();
        let idx = list.find(p)?;
        let entry = list.entry_mut(idx)?;
        entry.overflow.try_reserve(1).ok()?;
        entry.overflow.push(block);
        trace!(
            "registry: {} overflow bytes attached to {:#x}",
            len,
            entry.base
        );
        Some(payload)
    }

    /// Record the file identity of the cache containing `p`.
    pub(crate) fn update_identity(&self, p: usize, identity: FileIdentity) -> bool {
        let mut list = self.lock();
        match list.find(p).and_then(|idx| list.entry_mut(idx)) {
            Some(entry) => {
                entry.identity = identity;
                true
            }
            None => false,
        }
    }

    /// Number of live caches.
    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entries in address order.
    pub fn entries(&self) -> Vec<EntryInfo> {
        self.lock().iter().map(Entry::info).collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let list = self.lock();
        let mut stats = RegistryStats {
            entries: list.len,
            max_level: list.max_level,
            ..RegistryStats::default()
        };
        for e in list.iter() {
            if e.blob.is_mapped() {
                stats.mapped_bytes += e.size;
            } else {
                stats.heap_bytes += e.size;
            }
            stats.overflow_blocks += e.overflow.len();
            stats.overflow_bytes += e.overflow.iter().map(OverflowBlock::bytes).sum::<usize>();
        }
        stats
    }

    /// Verify ordering, disjointness and level bookkeeping.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        self.lock().check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn blob(len: usize) -> Arc<CacheBlob> {
        Arc::new(CacheBlob::scratch(len))
    }

    #[test]
    fn insert_and_find_by_address() {
        let registry = Registry::new();
        let blobs: Vec<_> = (1..=40).map(|i| blob(i * 16)).collect();
        for b in &blobs {
            registry.admit(Arc::clone(b), None).unwrap();
        }
        registry.check_invariants().unwrap();
        assert_eq!(registry.len(), blobs.len());

        for b in &blobs {
            for p in [b.base(), b.base() + b.len() / 2, b.base() + b.len() - 1] {
                let info = registry.find_by_addr(p).expect("inside a live range");
                assert_eq!(info.base, b.base());
                assert_eq!(info.refcount, 1);
            }
        }
    }

    #[test]
    fn addresses_outside_every_range_miss() {
        let registry = Registry::new();
        let blobs: Vec<_> = (0..20).map(|_| blob(64)).collect();
        for b in &blobs {
            registry.admit(Arc::clone(b), None).unwrap();
        }
        let entries = registry.entries();
        assert!(registry.find_by_addr(entries[0].base - 1).is_none());
        let last = entries[entries.len() - 1];
        assert!(registry.find_by_addr(last.base + last.size).is_none());
        for pair in entries.windows(2) {
            let gap_start = pair[0].base + pair[0].size;
            if gap_start < pair[1].base {
                assert!(registry.find_by_addr(gap_start).is_none());
                assert!(registry.find_by_addr(pair[1].base - 1).is_none());
            }
        }
        assert!(registry.find_by_addr(0).is_none());
    }

    #[test]
    fn random_removals_keep_order() {
        let registry = Registry::new();
        let mut blobs: Vec<_> = (0..200).map(|i| blob(8 + (i % 7) * 8)).collect();
        for b in &blobs {
            registry.admit(Arc::clone(b), None).unwrap();
        }
        blobs.shuffle(&mut rand::thread_rng());
        for (i, b) in blobs.iter().enumerate() {
            assert!(registry.dereference(b.base() + b.len() - 1));
            assert!(registry.find_by_addr(b.base()).is_none());
            if i % 10 == 0 {
                registry.check_invariants().unwrap();
            }
            // Reinsert some to exercise slot reuse.
            if i % 3 == 0 {
                registry.admit(Arc::clone(b), None).unwrap();
                registry.check_invariants().unwrap();
                assert!(registry.dereference(b.base()));
            }
        }
        assert!(registry.is_empty());
        assert_eq!(registry.stats().max_level, 0);
        registry.check_invariants().unwrap();
    }

    #[test]
    fn refcount_follows_references() {
        let registry = Registry::new();
        let b = blob(128);
        registry.admit(Arc::clone(&b), None).unwrap();
        assert!(registry.reference(b.base() + 5, 3));
        assert_eq!(registry.find_by_addr(b.base()).unwrap().refcount, 4);
        for _ in 0..3 {
            assert!(registry.dereference(b.base() + 100));
        }
        assert_eq!(registry.find_by_addr(b.base()).unwrap().refcount, 1);
        assert!(registry.dereference(b.base()));
        assert!(registry.find_by_addr(b.base()).is_none());
        assert!(!registry.dereference(b.base()));
        assert!(!registry.reference(b.base(), 1));
    }

    #[test]
    fn overflowing_reference_is_refused() {
        let registry = Registry::new();
        let b = blob(64);
        registry.admit(Arc::clone(&b), None).unwrap();
        assert!(!registry.reference(b.base(), usize::MAX));
        assert_eq!(registry.find_by_addr(b.base()).unwrap().refcount, 1);
        assert!(registry.reference(b.base(), 1));
        assert_eq!(registry.find_by_addr(b.base()).unwrap().refcount, 2);
        registry.dereference(b.base());
        registry.dereference(b.base());
        assert!(registry.is_empty());
    }

    #[test]
    fn identity_lookup_takes_a_reference() {
        let registry = Registry::new();
        let b = blob(64);
        let id = FileIdentity {
            dev: 1,
            ino: 2,
            mtime: 3,
            mtime_nsec: 4,
        };
        registry.admit(Arc::clone(&b), Some(id)).unwrap();
        let hit = registry.find_by_stat(&id).expect("identity hit");
        assert_eq!(hit.base(), b.base());
        assert_eq!(registry.find_by_addr(b.base()).unwrap().refcount, 2);

        let other = FileIdentity { mtime_nsec: 5, ..id };
        assert!(registry.find_by_stat(&other).is_none());
    }

    #[test]
    fn duplicate_admission_shares_entry() {
        let registry = Registry::new();
        let id = FileIdentity {
            dev: 9,
            ino: 9,
            mtime: 9,
            mtime_nsec: 9,
        };
        let first = registry.admit(blob(64), Some(id)).unwrap();
        let second = registry.admit(blob(64), Some(id)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find_by_addr(first.base()).unwrap().refcount, 2);

        // Caches without a file are never merged.
        registry.admit(blob(64), None).unwrap();
        registry.admit(blob(64), None).unwrap();
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn overflow_blocks_are_released_with_entry() {
        let registry = Registry::new();
        let b = blob(64);
        registry.admit(Arc::clone(&b), None).unwrap();
        let p = registry.allocate_in(b.base() + 1, 10).expect("allocation");
        assert_eq!(p.as_ptr() as usize % 8, 0);
        // SAFETY: the block holds at least 10 bytes and outlives this write.
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0xAB, 10) };
        registry.allocate_in(b.base(), 0).expect("empty allocation");
        let stats = registry.stats();
        assert_eq!(stats.overflow_blocks, 2);
        assert_eq!(stats.overflow_bytes, 16 + 8);

        assert!(registry.dereference(b.base()));
        assert_eq!(registry.stats().overflow_blocks, 0);
        assert!(registry.allocate_in(b.base(), 8).is_none());
    }

    #[test]
    fn levels_are_bounded() {
        let mut list = SkipList::new();
        for _ in 0..10_000 {
            let level = list.random_level();
            assert!((1..=list.max_level + 1).contains(&level));
            assert!(level <= MAX_LEVEL);
            list.max_level = list.max_level.max(level);
        }
    }
}
