//! Bump pool allocator (tier 1).
//!
//! A contiguous reservation with an atomically-advanced offset. Allocation
//! is a single `fetch_add` on the fast path; physical pages are committed
//! incrementally in fixed steps the first time the cursor crosses into
//! uncommitted territory. Individual frees are logical no-ops; the pool only
//! empties when the owning context drops it.

use std::ptr::NonNull;

use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{Arc, Mutex};

use super::error::{AllocError, Tier};
use super::stats::MemoryCounters;
use super::vm::{PlatformVmOps, VmOps};

/// All pool blocks are at least this aligned.
pub(crate) const POOL_ALIGN: usize = 16;

pub(crate) struct BumpPool {
    name: &'static str,
    /// Stable id recorded in allocation records (0 = primary, 1 = secondary).
    id: u8,
    base: usize,
    capacity: usize,
    commit_step: usize,
    /// Bump cursor. Never exceeds `capacity`: claims are published with a
    /// compare-exchange, so an over-capacity request fails without ever
    /// moving the cursor.
    used: AtomicUsize,
    /// High-water mark of committed bytes. The mutex serialises the commit
    /// syscall; the atomic mirror lets the fast path skip the lock entirely.
    committed: Mutex<usize>,
    committed_gauge: AtomicUsize,
    counters: Arc<MemoryCounters>,
}

impl BumpPool {
    /// Reserve the pool's address space. No pages are committed until the
    /// first allocation.
    pub(crate) fn init(
        name: &'static str,
        id: u8,
        capacity: usize,
        commit_step: usize,
        counters: Arc<MemoryCounters>,
    ) -> Result<Self, AllocError> {
        debug_assert!(commit_step > 0 && commit_step.is_multiple_of(PlatformVmOps::page_size()));

        let capacity = capacity.next_multiple_of(commit_step);
        // Safety: fresh reservation, released in Drop.
        let base = unsafe { PlatformVmOps::reserve(capacity)? };
        counters.total_reserved.add(capacity);

        Ok(Self {
            name,
            id,
            base: base.as_ptr() as usize,
            capacity,
            commit_step,
            used: AtomicUsize::new(0),
            committed: Mutex::new(0),
            committed_gauge: AtomicUsize::new(0),
            counters,
        })
    }

    pub(crate) fn id(&self) -> u8 {
        self.id
    }

    #[cfg(test)]
    pub(crate) fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn committed_bytes(&self) -> usize {
        self.committed_gauge.load(Ordering::Relaxed)
    }

    /// Bump-allocate `size` bytes, 16-byte aligned, zero-filled.
    ///
    /// Returns the block and its aligned capacity. Exhaustion is an error
    /// value; the caller overflows to the next tier.
    pub(crate) fn alloc(&self, size: usize) -> Result<(NonNull<u8>, usize), AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidRequest("zero-size pool allocation"));
        }
        let span = size.next_multiple_of(POOL_ALIGN);

        // Claim [offset, offset + span) without ever publishing a cursor
        // past capacity. A fetch_add-then-roll-back scheme is unsound here:
        // two concurrent over-capacity claims can interleave their
        // rollbacks around a third thread's success and re-issue its range.
        let mut offset = self.used.load(Ordering::Relaxed);
        let end = loop {
            let end = offset + span;
            if end > self.capacity {
                return Err(AllocError::Exhausted {
                    tier: Tier::Pool,
                    size,
                });
            }
            match self.used.compare_exchange_weak(
                offset,
                end,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break end,
                Err(current) => offset = current,
            }
        };

        if end > self.committed_gauge.load(Ordering::Acquire) {
            if let Err(e) = self.commit_through(end) {
                // Unlike the over-capacity case, concurrent allocations may
                // have succeeded above this claim, so only an exact
                // compare-exchange may undo it; otherwise leak the span.
                let _ = self.used.compare_exchange(
                    end,
                    offset,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
                return Err(e);
            }
        }

        let addr = self.base + offset;
        // Fresh pages arrive zeroed from the kernel and the cursor never
        // revisits an offset, so no explicit zeroing is needed here.
        self.counters.pool.allocs.incr();
        self.counters.pool.bytes_allocated.add(span);

        // Safety: base is non-null and offset < capacity.
        Ok((unsafe { NonNull::new_unchecked(addr as *mut u8) }, span))
    }

    /// Extend the committed prefix to cover `end`, in whole commit steps.
    fn commit_through(&self, end: usize) -> Result<(), AllocError> {
        let mut committed = self.committed.lock().unwrap();
        if end <= *committed {
            return Ok(()); // another thread got here first
        }
        let target = end.next_multiple_of(self.commit_step).min(self.capacity);
        let grow = target - *committed;

        let ptr = NonNull::new((self.base + *committed) as *mut u8)
            .ok_or(AllocError::InvalidRequest("null commit address"))?;
        // Safety: [committed, target) lies inside the pool's reservation.
        if let Err(e) = unsafe { PlatformVmOps::commit(ptr, grow) } {
            log::warn!("{}: commit of {grow} bytes failed: {e}", self.name);
            return Err(e.into());
        }

        *committed = target;
        self.committed_gauge.store(target, Ordering::Release);
        self.counters.total_committed.add(grow);
        Ok(())
    }

    /// Record a logical free. The bytes stay resident until the pool drops;
    /// only the counters move.
    pub(crate) fn free(&self, span: usize) {
        self.counters.pool.frees.incr();
        self.counters.pool.bytes_freed.add(span);
    }
}

impl Drop for BumpPool {
    fn drop(&mut self) {
        if let Some(ptr) = NonNull::new(self.base as *mut u8) {
            // Safety: the pool owns the whole reservation.
            if let Err(e) = unsafe { PlatformVmOps::release(ptr, self.capacity) } {
                log::warn!("{}: release on drop failed: {e}", self.name);
            }
        }
        self.counters.total_reserved.sub(self.capacity);
        self.counters
            .total_committed
            .sub(self.committed_gauge.load(Ordering::Relaxed));
    }
}

// Safety: the raw base address is never handed out mutably except through
// disjoint bump offsets; all shared state is atomic or mutex-guarded.
unsafe impl Send for BumpPool {}
unsafe impl Sync for BumpPool {}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    fn test_pool(capacity: usize) -> BumpPool {
        BumpPool::init(
            "test-pool",
            0,
            capacity,
            MIB,
            Arc::new(MemoryCounters::default()),
        )
        .expect("pool init failed")
    }

    #[test]
    fn alloc_is_aligned_and_zeroed() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = test_pool(4 * MIB);

        let (ptr, span) = pool.alloc(100).expect("alloc failed");
        assert_eq!(ptr.as_ptr() as usize % POOL_ALIGN, 0);
        assert_eq!(span, 112);

        // Safety: span bytes owned by this allocation.
        unsafe {
            let slice = std::slice::from_raw_parts(ptr.as_ptr(), span);
            assert!(slice.iter().all(|&b| b == 0), "pool memory not zeroed");
        }
    }

    #[test]
    fn allocations_do_not_overlap() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = test_pool(4 * MIB);

        let (a, _) = pool.alloc(48).unwrap();
        let (b, _) = pool.alloc(48).unwrap();
        assert!(b.as_ptr() as usize >= a.as_ptr() as usize + 48);

        // Safety: disjoint blocks owned by this test.
        unsafe {
            std::ptr::write_bytes(a.as_ptr(), 0xAA, 48);
            std::ptr::write_bytes(b.as_ptr(), 0xBB, 48);
            assert_eq!(*a.as_ptr(), 0xAA);
            assert_eq!(*b.as_ptr(), 0xBB);
        }
    }

    #[test]
    fn commit_grows_in_steps() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = test_pool(4 * MIB);
        assert_eq!(pool.committed_bytes(), 0, "no pages before first alloc");

        pool.alloc(64).unwrap();
        assert_eq!(pool.committed_bytes(), MIB, "first step committed");

        // Everything inside the first step leaves the commit level alone.
        pool.alloc(MIB / 2).unwrap();
        assert_eq!(pool.committed_bytes(), MIB);

        // Crossing the boundary commits the next step(s).
        pool.alloc(MIB).unwrap();
        assert_eq!(pool.committed_bytes(), 2 * MIB);
    }

    #[test]
    fn exhaustion_leaves_cursor_untouched() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = test_pool(MIB);

        assert!(matches!(
            pool.alloc(2 * MIB),
            Err(AllocError::Exhausted { tier: Tier::Pool, .. })
        ));
        // The failed claim must not have consumed the cursor: the pool can
        // still be filled to the byte.
        assert_eq!(pool.used_bytes(), 0);
        pool.alloc(MIB).expect("pool should still serve after a failed claim");
        assert_eq!(pool.used_bytes(), MIB);
        assert!(pool.alloc(16).is_err());
    }

    #[test]
    fn free_is_logical_only() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = test_pool(4 * MIB);

        let (_, span) = pool.alloc(256).unwrap();
        let used_before = pool.used_bytes();
        pool.free(span);
        assert_eq!(pool.used_bytes(), used_before, "free must not move the cursor");
    }

    #[test]
    fn concurrent_allocs_are_disjoint() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = Arc::new(test_pool(16 * MIB));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                let mut offsets = Vec::new();
                for _ in 0..200 {
                    let (ptr, span) = pool.alloc(64).unwrap();
                    offsets.push((ptr.as_ptr() as usize, span));
                }
                offsets
            }));
        }

        let mut all: Vec<(usize, usize)> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        for w in all.windows(2) {
            assert!(
                w[0].0 + w[0].1 <= w[1].0,
                "overlapping blocks: {:?} and {:?}",
                w[0],
                w[1]
            );
        }
    }
}
