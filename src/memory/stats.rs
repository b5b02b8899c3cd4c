//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., bytes freed may briefly disagree with free counts).
//! This is acceptable for diagnostic display. Do NOT use these values for
//! allocation decisions.
//!
//! Counters are per-context, not process-global: every [`super::router::MemoryContext`]
//! carries its own set, so independent instances in tests never bleed into
//! each other.

use crate::sync::atomic::{AtomicIsize, Ordering};

use super::class_heap::CLASS_COUNT;

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn incr(&self) {
        self.add(1);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-tier allocation traffic.
#[derive(Default)]
pub(crate) struct TierCounters {
    pub allocs: Counter,
    pub frees: Counter,
    pub bytes_allocated: Counter,
    pub bytes_freed: Counter,
}

impl TierCounters {
    fn snapshot(&self) -> TierStats {
        TierStats {
            allocs: self.allocs.get(),
            frees: self.frees.get(),
            bytes_allocated: self.bytes_allocated.get(),
            bytes_freed: self.bytes_freed.get(),
        }
    }
}

/// The full per-context counter set. Every field is independently atomic;
/// nothing here takes a lock, so reading never blocks an allocation path.
#[derive(Default)]
pub(crate) struct MemoryCounters {
    pub pool: TierCounters,
    pub heap: TierCounters,
    pub vm: TierCounters,

    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_held_bytes: Counter,
    pub cache_evictions: Counter,

    pub deferred_depth: Counter,
    pub deferred_kept_bytes: Counter,
    pub deferred_passthrough: Counter,
    pub deferred_evictions: Counter,

    pub corruption_detected: Counter,

    pub total_reserved: Counter,
    pub total_committed: Counter,
}

impl MemoryCounters {
    pub(crate) fn snapshot(&self, class_hits: [usize; CLASS_COUNT]) -> MemoryStats {
        MemoryStats {
            pool: self.pool.snapshot(),
            heap: self.heap.snapshot(),
            vm: self.vm.snapshot(),
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            cache_held_bytes: self.cache_held_bytes.get(),
            cache_evictions: self.cache_evictions.get(),
            deferred_depth: self.deferred_depth.get(),
            deferred_kept_bytes: self.deferred_kept_bytes.get(),
            deferred_passthrough: self.deferred_passthrough.get(),
            deferred_evictions: self.deferred_evictions.get(),
            corruption_detected: self.corruption_detected.get(),
            total_reserved: self.total_reserved.get(),
            total_committed: self.total_committed.get(),
            class_hits,
        }
    }
}

/// Point-in-time snapshot of one tier's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    pub allocs: usize,
    pub frees: usize,
    pub bytes_allocated: usize,
    pub bytes_freed: usize,
}

/// Point-in-time snapshot of a context's counters, for diagnostic display.
#[derive(Debug, Clone)]
pub struct MemoryStats {
    pub pool: TierStats,
    pub heap: TierStats,
    pub vm: TierStats,

    pub cache_hits: usize,
    pub cache_misses: usize,
    pub cache_held_bytes: usize,
    pub cache_evictions: usize,

    pub deferred_depth: usize,
    pub deferred_kept_bytes: usize,
    pub deferred_passthrough: usize,
    pub deferred_evictions: usize,

    pub corruption_detected: usize,

    pub total_reserved: usize,
    pub total_committed: usize,

    /// Allocation hits per size class (16 B granularity, ascending).
    pub class_hits: [usize; CLASS_COUNT],
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn counter_clamps_negative_transients() {
        let c = Counter::new();
        c.sub(5);
        assert_eq!(c.get(), 0, "negative transient must read as zero");
        c.add(12);
        assert_eq!(c.get(), 7);
    }

    #[test]
    fn counter_add_sub_roundtrip() {
        let c = Counter::new();
        c.add(1024);
        c.add(4096);
        c.sub(1024);
        assert_eq!(c.get(), 4096);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let counters = MemoryCounters::default();
        counters.pool.allocs.incr();
        counters.pool.bytes_allocated.add(256);
        counters.cache_hits.incr();
        counters.corruption_detected.incr();

        let stats = counters.snapshot([0; CLASS_COUNT]);
        assert_eq!(stats.pool.allocs, 1);
        assert_eq!(stats.pool.bytes_allocated, 256);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.corruption_detected, 1);
        assert_eq!(stats.heap.allocs, 0);
    }
}
