//! Segmented size-class heap (tier 2).
//!
//! Sixty-four evenly-spaced 16-byte classes serve requests up to 1 KiB out
//! of 1 MiB segments. Segments commit physical pages in 32 KiB sub-chunks as
//! the virgin cursor advances; freed blocks go on per-class free lists and
//! are found again through a coarse+fine occupancy mask that is mirrored
//! into an atomic so callers can skip segments without taking their lock.
//!
//! Fully-freed adjacent blocks are not coalesced across classes or segments.
//! With objects capped at 1 KiB the internal fragmentation this leaves
//! behind is bounded, and it keeps free O(1).

use std::ptr::NonNull;

#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

use crate::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use crate::sync::{Arc, Mutex, RwLock};

use super::arena::VaArena;
use super::error::{AllocError, Tier};
use super::stats::{Counter, MemoryCounters};
use super::vm::{PlatformVmOps, VmOps};

/// Spacing between size classes.
pub(crate) const CLASS_GRANULARITY: usize = 16;
/// Number of size classes.
pub(crate) const CLASS_COUNT: usize = 64;
/// Largest request the heap serves; bigger goes to the pools or the VM tier.
pub const MAX_CLASS_SIZE: usize = CLASS_GRANULARITY * CLASS_COUNT;
/// Address-space footprint of one segment.
pub(crate) const SEGMENT_SIZE: usize = 1024 * 1024;
/// Commit step inside a segment.
pub(crate) const SUB_CHUNK_SIZE: usize = 32 * 1024;
/// Split remainders smaller than this stay attached to the allocation
/// instead of seeding a new free block.
const MIN_SPLIT_REMAINDER: usize = 64;

/// Class index for a request size. Callers have already range-checked.
#[inline]
pub(crate) fn class_for(size: usize) -> usize {
    debug_assert!(size > 0 && size <= MAX_CLASS_SIZE);
    size.next_multiple_of(CLASS_GRANULARITY) / CLASS_GRANULARITY - 1
}

/// Byte capacity of a class.
#[inline]
pub(crate) fn class_size(class: usize) -> usize {
    (class + 1) * CLASS_GRANULARITY
}

/// Two-level class-occupancy mask: one fine bit per class, one coarse bit
/// per group of eight classes. The coarse word lets "find first non-empty
/// class >= n" skip empty groups in one `trailing_zeros`.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ClassMask {
    fine: u64,
    coarse: u64,
}

impl ClassMask {
    const GROUP: usize = 8;

    #[inline]
    pub(crate) fn set(&mut self, class: usize) {
        debug_assert!(class < CLASS_COUNT);
        self.fine |= 1 << class;
        self.coarse |= 1 << (class / Self::GROUP);
    }

    #[inline]
    pub(crate) fn clear(&mut self, class: usize) {
        debug_assert!(class < CLASS_COUNT);
        self.fine &= !(1 << class);
        let group = class / Self::GROUP;
        if self.fine & (0xFF << (group * Self::GROUP)) == 0 {
            self.coarse &= !(1 << group);
        }
    }

    #[inline]
    pub(crate) fn is_set(&self, class: usize) -> bool {
        self.fine & (1 << class) != 0
    }

    pub(crate) fn fine_bits(&self) -> u64 {
        self.fine
    }

    /// Fast check against a raw fine word (the lock-free mirror).
    #[inline]
    pub(crate) fn word_has_at_least(fine: u64, class: usize) -> bool {
        class < CLASS_COUNT && fine & (u64::MAX << class) != 0
    }

    /// First non-empty class >= `class`, or None.
    pub(crate) fn find_at_least(&self, class: usize) -> Option<usize> {
        debug_assert!(class < CLASS_COUNT);
        let mut group = class / Self::GROUP;
        let groups = self.coarse & (u64::MAX << group);
        if groups == 0 {
            return None;
        }
        group = groups.trailing_zeros() as usize;
        loop {
            let lane = (self.fine >> (group * Self::GROUP)) & 0xFF;
            let floor = if group == class / Self::GROUP {
                class % Self::GROUP
            } else {
                0
            };
            let masked = lane & (0xFF << floor) & 0xFF;
            if masked != 0 {
                return Some(group * Self::GROUP + masked.trailing_zeros() as usize);
            }
            let next = self.coarse & (u64::MAX << (group + 1));
            if next == 0 {
                return None;
            }
            group = next.trailing_zeros() as usize;
        }
    }
}

struct SegmentInner {
    mask: ClassMask,
    /// Free block base addresses per class. A block on list `c` spans
    /// exactly `class_size(c)` bytes.
    free_lists: [Vec<usize>; CLASS_COUNT],
    /// Offset of the first never-allocated byte.
    bump_cursor: usize,
    /// Committed prefix in bytes.
    committed: usize,
    /// One bit per 16-byte slot, set while the slot belongs to a free
    /// block. Catches double frees and frees of mid-block addresses.
    #[cfg(debug_assertions)]
    free_map: FixedBitSet,
}

pub(crate) struct Segment {
    base: usize,
    /// Some = sub-reservation carved from the arena (committed through it);
    /// None = standalone platform reservation (released in Drop).
    arena: Option<Arc<VaArena>>,
    /// Lock-free mirror of `inner.mask`'s fine word.
    occupancy: AtomicU64,
    /// Lock-free mirror of the virgin tail length.
    virgin_remaining: AtomicUsize,
    inner: Mutex<SegmentInner>,
    counters: Arc<MemoryCounters>,
    /// Shared with the owning heap: total committed sub-chunks.
    chunks_committed: Arc<AtomicUsize>,
}

impl Segment {
    fn new(
        base: usize,
        arena: Option<Arc<VaArena>>,
        counters: Arc<MemoryCounters>,
        chunks_committed: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            base,
            arena,
            occupancy: AtomicU64::new(0),
            virgin_remaining: AtomicUsize::new(SEGMENT_SIZE),
            inner: Mutex::new(SegmentInner {
                mask: ClassMask::default(),
                free_lists: std::array::from_fn(|_| Vec::new()),
                bump_cursor: 0,
                committed: 0,
                #[cfg(debug_assertions)]
                free_map: FixedBitSet::with_capacity(SEGMENT_SIZE / CLASS_GRANULARITY),
            }),
            counters,
            chunks_committed,
        }
    }

    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + SEGMENT_SIZE
    }

    /// Cheap pre-check without the lock: does this segment *possibly* have
    /// room for `class`? False negatives are impossible; false positives
    /// cost one lock acquisition.
    fn might_serve(&self, class: usize) -> bool {
        ClassMask::word_has_at_least(self.occupancy.load(Ordering::Relaxed), class)
            || self.virgin_remaining.load(Ordering::Relaxed) >= class_size(class)
    }

    /// Allocate one block of `class` from this segment.
    ///
    /// `Ok(None)` means the segment has no room; `Err` means a commit
    /// failed. On success the block is zero-filled and its capacity (which
    /// may exceed the class size when a remainder was too small to split)
    /// is returned with the address.
    fn try_alloc(&self, class: usize) -> Result<Option<(usize, usize)>, AllocError> {
        let needed = class_size(class);
        let mut inner = self.inner.lock().unwrap();

        // Exact-or-next-larger from the free lists first.
        if let Some(found) = inner.mask.find_at_least(class) {
            let addr = inner.free_lists[found]
                .pop()
                .expect("occupancy mask bit set with empty free list");
            if inner.free_lists[found].is_empty() {
                inner.mask.clear(found);
            }

            let block = class_size(found);
            #[cfg(debug_assertions)]
            Self::mark_allocated(&mut inner.free_map, self.base, addr, block);

            let remainder = block - needed;
            let capacity = if remainder >= MIN_SPLIT_REMAINDER {
                let rem_class = class_for(remainder);
                debug_assert_eq!(class_size(rem_class), remainder);
                let rem_addr = addr + needed;
                inner.free_lists[rem_class].push(rem_addr);
                inner.mask.set(rem_class);
                #[cfg(debug_assertions)]
                Self::mark_free(&mut inner.free_map, self.base, rem_addr, remainder);
                needed
            } else {
                block
            };

            self.occupancy
                .store(inner.mask.fine_bits(), Ordering::Relaxed);
            drop(inner);

            // Free-list blocks hold whatever the previous owner wrote;
            // the zero-fill contract is honoured here.
            // Safety: [addr, addr+capacity) is committed and exclusively
            // ours until handed to the caller.
            unsafe { std::ptr::write_bytes(addr as *mut u8, 0, capacity) };
            return Ok(Some((addr, capacity)));
        }

        // Virgin tail: bump, committing sub-chunks on demand.
        if inner.bump_cursor + needed > SEGMENT_SIZE {
            return Ok(None);
        }
        let end = inner.bump_cursor + needed;
        if end > inner.committed {
            let target = end.next_multiple_of(SUB_CHUNK_SIZE).min(SEGMENT_SIZE);
            self.commit_range(inner.committed, target - inner.committed)?;
            self.chunks_committed.fetch_add(
                (target - inner.committed) / SUB_CHUNK_SIZE,
                Ordering::Relaxed,
            );
            inner.committed = target;
        }

        let addr = self.base + inner.bump_cursor;
        inner.bump_cursor = end;
        self.virgin_remaining
            .store(SEGMENT_SIZE - end, Ordering::Relaxed);
        drop(inner);

        // Arena ranges may have been committed and decommitted by a prior
        // tenant, so even virgin offsets can hold stale bytes.
        // Safety: as above.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, needed) };
        Ok(Some((addr, needed)))
    }

    fn commit_range(&self, offset: usize, len: usize) -> Result<(), AllocError> {
        let addr = self.base + offset;
        match &self.arena {
            Some(arena) => arena.commit(addr, len),
            None => {
                let ptr = NonNull::new(addr as *mut u8)
                    .ok_or(AllocError::InvalidRequest("null commit address"))?;
                // Safety: [offset, offset+len) lies inside this segment's
                // own reservation.
                unsafe { PlatformVmOps::commit(ptr, len)? };
                self.counters.total_committed.add(len);
                Ok(())
            }
        }
    }

    /// Return a block to its class's free list.
    fn free(&self, addr: usize, class: usize) {
        debug_assert!(self.contains(addr));
        let mut inner = self.inner.lock().unwrap();

        #[cfg(debug_assertions)]
        Self::mark_free(&mut inner.free_map, self.base, addr, class_size(class));

        inner.free_lists[class].push(addr);
        inner.mask.set(class);
        self.occupancy
            .store(inner.mask.fine_bits(), Ordering::Relaxed);
    }

    #[cfg(debug_assertions)]
    fn mark_free(map: &mut FixedBitSet, base: usize, addr: usize, len: usize) {
        let first = (addr - base) / CLASS_GRANULARITY;
        for slot in first..first + len / CLASS_GRANULARITY {
            debug_assert!(!map.contains(slot), "double free of slot {slot}");
            map.insert(slot);
        }
    }

    #[cfg(debug_assertions)]
    fn mark_allocated(map: &mut FixedBitSet, base: usize, addr: usize, len: usize) {
        let first = (addr - base) / CLASS_GRANULARITY;
        for slot in first..first + len / CLASS_GRANULARITY {
            debug_assert!(map.contains(slot), "allocating a slot not marked free");
            map.set(slot, false);
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        match &self.arena {
            Some(arena) => {
                if let Err(e) = arena.release(self.base) {
                    log::warn!("segment: arena release on drop failed: {e}");
                }
            }
            None => {
                if let Some(ptr) = NonNull::new(self.base as *mut u8) {
                    // Safety: the segment owns its standalone reservation.
                    if let Err(e) = unsafe { PlatformVmOps::release(ptr, SEGMENT_SIZE) } {
                        log::warn!("segment: release on drop failed: {e}");
                    }
                }
                let committed = self.inner.lock().unwrap().committed;
                self.counters.total_committed.sub(committed);
            }
        }
    }
}

// Safety: the base address is only dereferenced through ranges handed out
// under the inner mutex; all shared state is atomic or mutex-guarded.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

pub(crate) struct SegmentedHeap {
    arena: Arc<VaArena>,
    segments: RwLock<Vec<Arc<Segment>>>,
    counters: Arc<MemoryCounters>,
    chunks_committed: Arc<AtomicUsize>,
    class_hits: Vec<Counter>,
}

impl SegmentedHeap {
    pub(crate) fn new(arena: Arc<VaArena>, counters: Arc<MemoryCounters>) -> Self {
        Self {
            arena,
            segments: RwLock::new(Vec::new()),
            counters,
            chunks_committed: Arc::new(AtomicUsize::new(0)),
            class_hits: (0..CLASS_COUNT).map(|_| Counter::new()).collect(),
        }
    }

    /// Total 32 KiB sub-chunks committed across all segments. Free-list
    /// reuse keeps this flat; only virgin-cursor growth moves it.
    #[cfg(test)]
    pub(crate) fn committed_chunks(&self) -> usize {
        self.chunks_committed.load(Ordering::Relaxed)
    }

    pub(crate) fn class_hit_counts(&self) -> [usize; CLASS_COUNT] {
        std::array::from_fn(|i| self.class_hits[i].get())
    }

    /// Allocate `size` bytes (1..=1024), zero-filled.
    ///
    /// Returns the block, its capacity, and the class the capacity maps to
    /// (which is what a later `free` must pass back).
    pub(crate) fn alloc(&self, size: usize) -> Result<(NonNull<u8>, usize, usize), AllocError> {
        if size == 0 || size > MAX_CLASS_SIZE {
            return Err(AllocError::InvalidRequest("size outside heap range"));
        }
        let class = class_for(size);

        // Existing segments first, probing the lock-free mirrors.
        {
            let segments = self.segments.read().unwrap();
            for seg in segments.iter() {
                if !seg.might_serve(class) {
                    continue;
                }
                if let Some((addr, capacity)) = seg.try_alloc(class)? {
                    return Ok(self.finish_alloc(addr, capacity));
                }
            }
        }

        // No room anywhere: grow by one segment and retry on it.
        let seg = self.grow()?;
        match seg.try_alloc(class)? {
            Some((addr, capacity)) => Ok(self.finish_alloc(addr, capacity)),
            None => Err(AllocError::Exhausted {
                tier: Tier::Heap,
                size,
            }),
        }
    }

    fn finish_alloc(&self, addr: usize, capacity: usize) -> (NonNull<u8>, usize, usize) {
        let class = class_for(capacity);
        self.class_hits[class].incr();
        self.counters.heap.allocs.incr();
        self.counters.heap.bytes_allocated.add(capacity);
        // Safety: segment bases are non-null and addr >= base.
        (
            unsafe { NonNull::new_unchecked(addr as *mut u8) },
            capacity,
            class,
        )
    }

    fn grow(&self) -> Result<Arc<Segment>, AllocError> {
        let base = match self.arena.reserve(SEGMENT_SIZE) {
            Some(ptr) => ptr.as_ptr() as usize,
            None => {
                // Arena inactive or exhausted: standalone reservation.
                // Safety: fresh reservation owned by the new segment.
                let ptr = unsafe { PlatformVmOps::reserve(SEGMENT_SIZE)? };
                self.counters.total_reserved.add(SEGMENT_SIZE);
                ptr.as_ptr() as usize
            }
        };
        let from_arena = self.arena.contains(base);
        let seg = Arc::new(Segment::new(
            base,
            from_arena.then(|| Arc::clone(&self.arena)),
            Arc::clone(&self.counters),
            Arc::clone(&self.chunks_committed),
        ));
        self.segments.write().unwrap().push(Arc::clone(&seg));
        Ok(seg)
    }

    /// Return a block allocated at `addr` with capacity class `class`.
    pub(crate) fn free(&self, addr: usize, class: usize) -> Result<(), AllocError> {
        if class >= CLASS_COUNT {
            return Err(AllocError::InvalidRequest("class out of range"));
        }
        let segments = self.segments.read().unwrap();
        let seg = segments
            .iter()
            .find(|s| s.contains(addr))
            .ok_or(AllocError::InvalidRequest("address not in any segment"))?;
        seg.free(addr, class);
        self.counters.heap.frees.incr();
        self.counters.heap.bytes_freed.add(class_size(class));
        Ok(())
    }

    /// Does any segment own `addr`?
    #[cfg(test)]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.segments
            .read()
            .unwrap()
            .iter()
            .any(|s| s.contains(addr))
    }
}

// Standalone segments track their own reservation; the counters for
// arena-backed ones are settled by the arena itself.
impl Drop for SegmentedHeap {
    fn drop(&mut self) {
        let standalone: usize = self
            .segments
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.arena.is_none())
            .count();
        if standalone > 0 {
            self.counters
                .total_reserved
                .sub(standalone * SEGMENT_SIZE);
        }
    }
}
