//! Buffer cache (tier 0).
//!
//! A fixed-capacity overlay that holds recently-freed mid-size buffers for
//! immediate re-issue. Lookup prefers an exact size match, then settles for
//! anything up to twice the request. When full, the least-recently-touched
//! entry is evicted and the caller performs the real free on it.
//!
//! Cache hits return **unzeroed** memory: the buffer still holds whatever
//! its previous owner wrote. That is the explicit contract; callers who
//! need zeroed memory must clear it themselves. Fresh pool and heap
//! allocations, by contrast, are always zero-filled.

use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::{Arc, Mutex};

use super::stats::MemoryCounters;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    addr: usize,
    size: usize,
    last_used_tick: u64,
}

/// A buffer pushed out to make room; the owner must perform the real free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Evicted {
    pub addr: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreResult {
    /// The buffer was admitted.
    Stored,
    /// The buffer was admitted and the returned entry was pushed out.
    StoredEvicting(Evicted),
    /// Outside the cacheable size range; caller frees normally.
    Rejected,
}

pub(crate) struct ScrapCache {
    entries: Mutex<Vec<CacheEntry>>,
    capacity: usize,
    min_size: usize,
    max_size: usize,
    /// Logical clock for LRU ordering; bumped on every touch.
    tick: AtomicU64,
    counters: Arc<MemoryCounters>,
}

impl ScrapCache {
    pub(crate) fn new(
        capacity: usize,
        min_size: usize,
        max_size: usize,
        counters: Arc<MemoryCounters>,
    ) -> Self {
        Self {
            entries: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            min_size,
            max_size,
            tick: AtomicU64::new(1),
            counters,
        }
    }

    pub(crate) fn cacheable(&self, size: usize) -> bool {
        size >= self.min_size && size <= self.max_size
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Take a buffer able to hold `size` bytes: exact size first, then the
    /// smallest entry within 2x. The returned buffer is NOT zeroed.
    pub(crate) fn take(&self, size: usize) -> Option<Evicted> {
        if !self.cacheable(size) {
            return None;
        }
        let mut entries = self.entries.lock().unwrap();

        let mut best: Option<usize> = None;
        for (i, e) in entries.iter().enumerate() {
            if e.size == size {
                best = Some(i);
                break;
            }
            if e.size > size && e.size <= size * 2 {
                match best {
                    Some(b) if entries[b].size <= e.size => {}
                    _ => best = Some(i),
                }
            }
        }

        match best {
            Some(i) => {
                let entry = entries.swap_remove(i);
                self.counters.cache_hits.incr();
                self.counters.cache_held_bytes.sub(entry.size);
                Some(Evicted {
                    addr: entry.addr,
                    size: entry.size,
                })
            }
            None => {
                self.counters.cache_misses.incr();
                None
            }
        }
    }

    /// Offer a freed buffer to the cache.
    pub(crate) fn store(&self, addr: usize, size: usize) -> StoreResult {
        // A zero-capacity cache is a legal configuration that disables the
        // tier; there is no LRU entry to displace.
        if self.capacity == 0 || !self.cacheable(size) {
            return StoreResult::Rejected;
        }
        let entry = CacheEntry {
            addr,
            size,
            last_used_tick: self.next_tick(),
        };

        let mut entries = self.entries.lock().unwrap();
        self.counters.cache_held_bytes.add(size);

        if entries.len() < self.capacity {
            entries.push(entry);
            return StoreResult::Stored;
        }

        // Full: replace the least-recently-used entry.
        let (lru, _) = entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.last_used_tick)
            .expect("capacity > 0");
        let old = std::mem::replace(&mut entries[lru], entry);
        self.counters.cache_held_bytes.sub(old.size);
        self.counters.cache_evictions.incr();
        StoreResult::StoredEvicting(Evicted {
            addr: old.addr,
            size: old.size,
        })
    }

    /// Refresh an entry's LRU position without taking it.
    #[cfg(test)]
    pub(crate) fn touch(&self, addr: usize) {
        let tick = self.next_tick();
        let mut entries = self.entries.lock().unwrap();
        if let Some(e) = entries.iter_mut().find(|e| e.addr == addr) {
            e.last_used_tick = tick;
        }
    }

    /// Empty the cache; the owner performs the real free on every entry.
    pub(crate) fn drain(&self) -> Vec<Evicted> {
        let mut entries = self.entries.lock().unwrap();
        let drained: Vec<Evicted> = entries
            .drain(..)
            .map(|e| {
                self.counters.cache_held_bytes.sub(e.size);
                Evicted {
                    addr: e.addr,
                    size: e.size,
                }
            })
            .collect();
        drained
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn test_cache(capacity: usize) -> ScrapCache {
        ScrapCache::new(capacity, 64, 64 * 1024, Arc::new(MemoryCounters::default()))
    }

    #[test]
    fn store_then_take_exact() {
        let cache = test_cache(8);
        assert_eq!(cache.store(0x1000, 256), StoreResult::Stored);

        let hit = cache.take(256).expect("exact hit expected");
        assert_eq!(hit.addr, 0x1000);
        assert_eq!(hit.size, 256);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn exact_match_beats_tolerant_match() {
        let cache = test_cache(8);
        cache.store(0x1000, 512);
        cache.store(0x2000, 256);

        // Both entries can hold 256; the exact one must win.
        let hit = cache.take(256).unwrap();
        assert_eq!(hit.addr, 0x2000);
    }

    #[test]
    fn tolerant_match_within_double() {
        let cache = test_cache(8);
        cache.store(0x1000, 500);

        // 300 <= 500 <= 600: acceptable.
        let hit = cache.take(300).expect("tolerant hit expected");
        assert_eq!(hit.addr, 0x1000);
        assert_eq!(hit.size, 500);
    }

    #[test]
    fn oversized_entry_is_not_a_hit() {
        let cache = test_cache(8);
        cache.store(0x1000, 2048);

        // 2048 > 2 * 900: would waste more than half the buffer.
        assert!(cache.take(900).is_none());
        assert_eq!(cache.len(), 1, "miss must not consume the entry");
    }

    #[test]
    fn smaller_entry_never_serves_larger_request() {
        let cache = test_cache(8);
        cache.store(0x1000, 128);
        assert!(cache.take(256).is_none());
    }

    #[test]
    fn out_of_range_sizes_rejected() {
        let cache = test_cache(8);
        assert_eq!(cache.store(0x1000, 32), StoreResult::Rejected);
        assert_eq!(cache.store(0x2000, 128 * 1024), StoreResult::Rejected);
        assert!(cache.take(32).is_none());
    }

    #[test]
    fn zero_capacity_disables_the_cache() {
        let cache = test_cache(0);
        assert_eq!(cache.store(0x1000, 256), StoreResult::Rejected);
        assert!(cache.take(256).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn full_cache_evicts_lru() {
        let cache = test_cache(2);
        cache.store(0x1000, 100);
        cache.store(0x2000, 200);

        // Touch the older entry so the other becomes LRU.
        cache.touch(0x1000);

        match cache.store(0x3000, 300) {
            StoreResult::StoredEvicting(evicted) => {
                assert_eq!(evicted.addr, 0x2000);
                assert_eq!(evicted.size, 200);
            }
            other => panic!("expected eviction, got {other:?}"),
        }
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn drain_returns_everything() {
        let counters = Arc::new(MemoryCounters::default());
        let cache = ScrapCache::new(8, 64, 64 * 1024, Arc::clone(&counters));
        cache.store(0x1000, 100);
        cache.store(0x2000, 200);

        let drained = cache.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(cache.len(), 0);
        assert_eq!(counters.cache_held_bytes.get(), 0);
    }

    #[test]
    fn hit_and_miss_counters() {
        let counters = Arc::new(MemoryCounters::default());
        let cache = ScrapCache::new(8, 64, 64 * 1024, Arc::clone(&counters));
        cache.store(0x1000, 256);

        cache.take(256);
        cache.take(256);

        assert_eq!(counters.cache_hits.get(), 1);
        assert_eq!(counters.cache_misses.get(), 1);
    }
}
