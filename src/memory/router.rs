//! Allocation router.
//!
//! [`MemoryContext`] owns every tier and dispatches by size and state:
//!
//! ```text
//! allocate(size):
//!   cache (64 B..=64 KiB, hit = recycled, UNZEROED)
//!     -> heap  (<= 1 KiB, zeroed)
//!     -> pools (<= max_pool_alloc, zeroed)
//!     -> arena / platform VM (zeroed on fresh commit)
//! ```
//!
//! Frees validate the allocation record first; a missing record or a bad
//! tag is corruption — counted, logged, and the pointer is leaked rather
//! than recycled. VM-level releases route to the arena when the address
//! belongs to it and through the deferred controller otherwise.
//!
//! Contexts are explicit: construct one per subsystem or test, or use the
//! process-wide [`GlobalMemory`] facade when the embedding layer needs
//! plain entry points.

use std::collections::HashMap;
use std::ptr::NonNull;

use crate::sync::{Arc, Mutex, OnceLock};

use super::arena::{ArenaOptions, VaArena};
use super::bump::BumpPool;
use super::class_heap::{SegmentedHeap, MAX_CLASS_SIZE};
use super::config::MemoryConfig;
use super::deferred::{DeferredRelease, ReleaseKind, Verdict};
use super::error::AllocError;
use super::records::{AllocRecord, Owner, RecordTable};
use super::scrap_cache::{ScrapCache, StoreResult};
use super::stats::{MemoryCounters, MemoryStats};
use super::vm::{PlatformVmOps, VmOps};

pub struct MemoryContext {
    config: MemoryConfig,
    counters: Arc<MemoryCounters>,
    arena: Arc<VaArena>,
    primary: BumpPool,
    secondary: BumpPool,
    heap: SegmentedHeap,
    cache: ScrapCache,
    deferred: DeferredRelease,
    records: RecordTable,
}

impl MemoryContext {
    pub fn new(config: MemoryConfig) -> Result<Self, AllocError> {
        let counters = Arc::new(MemoryCounters::default());

        let arena = Arc::new(VaArena::init(
            ArenaOptions {
                size: config.arena_size,
                min_size: config.arena_min_size,
            },
            Arc::clone(&counters),
        ));

        let primary = BumpPool::init(
            "primary pool",
            0,
            config.primary_pool_size,
            config.pool_commit_step,
            Arc::clone(&counters),
        )?;
        let secondary = BumpPool::init(
            "secondary pool",
            1,
            config.secondary_pool_size,
            config.pool_commit_step,
            Arc::clone(&counters),
        )?;

        let heap = SegmentedHeap::new(Arc::clone(&arena), Arc::clone(&counters));
        let cache = ScrapCache::new(
            config.cache_capacity,
            config.cache_min_size,
            config.cache_max_size,
            Arc::clone(&counters),
        );
        let deferred = DeferredRelease::new(config.deferred.clone(), Arc::clone(&counters));

        Ok(Self {
            config,
            counters,
            arena,
            primary,
            secondary,
            heap,
            cache,
            deferred,
            records: RecordTable::new(),
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn arena(&self) -> &VaArena {
        &self.arena
    }

    /// Allocate `size` bytes, 16-byte aligned.
    ///
    /// Fresh blocks are zero-filled. A cache hit recycles a recently-freed
    /// buffer and is NOT zeroed — the explicit tradeoff the cache exists
    /// for.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        // Tier 0: recycled buffers.
        if self.cache.cacheable(size) {
            if let Some(hit) = self.cache.take(size) {
                self.records.update_size(hit.addr, size);
                log::trace!("cache re-issued a {}-byte buffer for {size}", hit.size);
                // Safety: cached buffers keep their live mapping.
                return Some(unsafe { NonNull::new_unchecked(hit.addr as *mut u8) });
            }
        }

        // Tier 2: size-class heap.
        if size <= MAX_CLASS_SIZE {
            match self.heap.alloc(size) {
                Ok((ptr, capacity, class)) => {
                    self.records.insert(
                        ptr.as_ptr() as usize,
                        size,
                        capacity,
                        Owner::Heap {
                            class: class as u8,
                        },
                    );
                    return Some(ptr);
                }
                Err(e) => {
                    log::debug!("heap refused {size} bytes ({e}), overflowing to pools");
                }
            }
        }

        // Tier 1: bump pools.
        if size <= self.config.max_pool_alloc {
            for pool in [&self.primary, &self.secondary] {
                match pool.alloc(size) {
                    Ok((ptr, span)) => {
                        self.records.insert(
                            ptr.as_ptr() as usize,
                            size,
                            span,
                            Owner::Pool(pool.id()),
                        );
                        return Some(ptr);
                    }
                    Err(AllocError::Exhausted { .. }) => continue,
                    Err(e) => {
                        log::warn!("pool allocation of {size} bytes failed: {e}");
                        break;
                    }
                }
            }
        }

        // Last tier: arena, then a direct platform mapping.
        self.vm_alloc(size)
    }

    fn vm_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let addr;
        let capacity;
        if let Some(ptr) = self.arena.alloc(size) {
            addr = ptr.as_ptr() as usize;
            capacity = self
                .arena
                .reservation_size(addr)
                .unwrap_or_else(|| size.next_multiple_of(PlatformVmOps::allocation_granularity()));
        } else {
            let span = size.next_multiple_of(PlatformVmOps::allocation_granularity());
            // Safety: fresh reservation; released through free / deferred.
            let ptr = match unsafe { PlatformVmOps::reserve(span) } {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("platform reservation of {span} bytes failed: {e}");
                    return None;
                }
            };
            // Safety: committing our own fresh reservation.
            if let Err(e) = unsafe { PlatformVmOps::commit(ptr, span) } {
                log::warn!("platform commit of {span} bytes failed: {e}");
                // Safety: rollback of the reservation we just made.
                let _ = unsafe { PlatformVmOps::release(ptr, span) };
                return None;
            }
            self.counters.total_reserved.add(span);
            self.counters.total_committed.add(span);
            addr = ptr.as_ptr() as usize;
            capacity = span;
        }

        self.records.insert(addr, size, capacity, Owner::Vm);
        self.counters.vm.allocs.incr();
        self.counters.vm.bytes_allocated.add(capacity);
        // Safety: both branches produced a non-null mapping.
        Some(unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }

    /// Free a block returned by [`allocate`](Self::allocate).
    ///
    /// A block the cache wants is parked for re-issue instead of going back
    /// to its tier. Corrupt or unknown pointers are leaked, never recycled.
    ///
    /// # Safety
    /// `ptr` must have come from this context's `allocate` and have no
    /// remaining references.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let record = match self.records.validate(addr) {
            Ok(r) => r,
            Err(_) => {
                self.counters.corruption_detected.incr();
                log::warn!("free of corrupt or unknown pointer {addr:#x}; leaking");
                return;
            }
        };

        // The cache only overlays pool and heap blocks; VM mappings go
        // through the release policy instead.
        if record.owner != Owner::Vm && self.cache.cacheable(record.capacity) {
            match self.cache.store(addr, record.capacity) {
                StoreResult::Stored => return,
                StoreResult::StoredEvicting(old) => {
                    // The displaced buffer now really goes back to its tier.
                    if let Ok(old_record) = self.records.validate_remove(old.addr) {
                        // Safety: the evicted buffer left the cache with no
                        // other owner.
                        unsafe { self.free_to_owner(old.addr, &old_record) };
                    }
                    return;
                }
                StoreResult::Rejected => {}
            }
        }

        match self.records.validate_remove(addr) {
            Ok(record) => {
                // Safety: forwarded from the caller.
                unsafe { self.free_to_owner(addr, &record) };
            }
            Err(_) => {
                self.counters.corruption_detected.incr();
                log::warn!("free of corrupt or unknown pointer {addr:#x}; leaking");
            }
        }
    }

    /// # Safety
    /// `addr` must be the base of a live block owned by `record`'s tier.
    unsafe fn free_to_owner(&self, addr: usize, record: &AllocRecord) {
        match record.owner {
            Owner::Pool(id) => {
                // Logical free: the bytes stay resident until the pool drops.
                let pool = if id == 0 { &self.primary } else { &self.secondary };
                pool.free(record.capacity);
            }
            Owner::Heap { class } => {
                if let Err(e) = self.heap.free(addr, class as usize) {
                    self.counters.corruption_detected.incr();
                    log::warn!(
                        "heap free of {addr:#x} (allocated on thread {}) failed ({e}); leaking",
                        record.thread_id
                    );
                }
            }
            Owner::Vm => {
                self.counters.vm.frees.incr();
                self.counters.vm.bytes_freed.add(record.capacity);
                if self.arena.contains(addr) {
                    if let Err(e) = self.arena.release(addr) {
                        log::warn!("arena release of {addr:#x} failed: {e}");
                    }
                } else {
                    // Safety: forwarded from the caller.
                    unsafe {
                        self.deferred
                            .submit(addr, record.capacity, ReleaseKind::Release)
                    };
                }
            }
        }
    }

    /// Resize a block, copying `min(old, new)` bytes on a move.
    ///
    /// Shrinks and growths within the block's capacity stay in place.
    /// `new_size == 0` frees the block and returns `None`.
    ///
    /// # Safety
    /// Same contract as [`free`](Self::free).
    pub unsafe fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        let addr = ptr.as_ptr() as usize;
        if new_size == 0 {
            // Safety: forwarded.
            unsafe { self.free(ptr) };
            return None;
        }

        let record = match self.records.validate(addr) {
            Ok(r) => r,
            Err(_) => {
                self.counters.corruption_detected.incr();
                log::warn!("resize of corrupt or unknown pointer {addr:#x}; refusing");
                return None;
            }
        };

        if new_size <= record.capacity {
            self.records.update_size(addr, new_size);
            return Some(ptr);
        }

        let new_ptr = self.allocate(new_size)?;
        // Safety: both blocks are live and disjoint; the copy length is
        // bounded by both.
        unsafe {
            std::ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                new_ptr.as_ptr(),
                record.size.min(new_size),
            );
            self.free(ptr);
        }
        Some(new_ptr)
    }

    // ------------------------------------------------------------------
    // VM-level surface, for callers managing their own reservations.
    // ------------------------------------------------------------------

    /// Reserve address space: arena first, platform fallback.
    pub fn vm_reserve(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        if let Some(ptr) = self.arena.reserve(size) {
            let addr = ptr.as_ptr() as usize;
            let capacity = self.arena.reservation_size(addr).unwrap_or(size);
            self.records.insert(addr, size, capacity, Owner::Vm);
            return Some(ptr);
        }
        let span = size.next_multiple_of(PlatformVmOps::allocation_granularity());
        // Safety: fresh reservation; released through vm_release.
        match unsafe { PlatformVmOps::reserve(span) } {
            Ok(ptr) => {
                self.counters.total_reserved.add(span);
                self.records
                    .insert(ptr.as_ptr() as usize, size, span, Owner::Vm);
                Some(ptr)
            }
            Err(e) => {
                log::warn!("vm_reserve of {span} bytes failed: {e}");
                None
            }
        }
    }

    /// Commit a range inside a reservation made through [`vm_reserve`](Self::vm_reserve).
    pub fn vm_commit(&self, addr: usize, size: usize) -> Result<(), AllocError> {
        if self.arena.contains(addr) {
            return self.arena.commit(addr, size);
        }
        let ptr =
            NonNull::new(addr as *mut u8).ok_or(AllocError::InvalidRequest("null address"))?;
        // Safety: the caller owns the reservation (vm_reserve contract).
        unsafe { PlatformVmOps::commit(ptr, size)? };
        self.counters.total_committed.add(size);
        Ok(())
    }

    /// Decommit a range. Arena ranges decommit immediately; foreign ranges
    /// run the deferred-release policy.
    pub fn vm_decommit(&self, addr: usize, size: usize) -> Result<Verdict, AllocError> {
        if self.arena.contains(addr) {
            self.arena.decommit(addr, size)?;
            return Ok(Verdict::Passthrough);
        }
        // Safety: the caller owns the mapping (vm_reserve contract).
        Ok(unsafe { self.deferred.submit(addr, size, ReleaseKind::Decommit) })
    }

    /// Release a reservation made through [`vm_reserve`](Self::vm_reserve).
    /// Arena ranges return to the arena's free list immediately; foreign
    /// ranges run the deferred-release policy.
    pub fn vm_release(&self, addr: usize) -> Result<Verdict, AllocError> {
        let record = self.records.validate_remove(addr).inspect_err(|_| {
            self.counters.corruption_detected.incr();
            log::warn!("vm_release of unknown reservation {addr:#x}");
        })?;

        if self.arena.contains(addr) {
            self.arena.release(addr)?;
            return Ok(Verdict::Passthrough);
        }
        // Safety: the reservation belonged to this context and the caller
        // is giving it up.
        Ok(unsafe {
            self.deferred
                .submit(addr, record.capacity, ReleaseKind::Release)
        })
    }

    // ------------------------------------------------------------------
    // Maintenance and introspection.
    // ------------------------------------------------------------------

    /// Run one housekeeping pass: deferred entries past their delay get
    /// their real operation. Call periodically (frame tick, timer).
    pub fn housekeep(&self) {
        self.deferred.housekeeping();
    }

    /// Perform every held deferred operation immediately.
    pub fn flush_deferred(&self) {
        self.deferred.flush_all();
    }

    /// Release everything held back for reuse: cached buffers go back to
    /// their tiers and deferred operations run now. Live allocations are
    /// untouched.
    pub fn purge(&self) {
        for entry in self.cache.drain() {
            if let Ok(record) = self.records.validate_remove(entry.addr) {
                // Safety: a drained buffer left the cache with no other
                // owner.
                unsafe { self.free_to_owner(entry.addr, &record) };
            }
        }
        self.deferred.flush_all();
    }

    pub fn stats(&self) -> MemoryStats {
        self.counters.snapshot(self.heap.class_hit_counts())
    }

    /// Live allocation count (records table), for leak diagnostics.
    pub fn live_allocations(&self) -> usize {
        self.records.len()
    }

    #[cfg(test)]
    pub(crate) fn records(&self) -> &RecordTable {
        &self.records
    }

    #[cfg(test)]
    pub(crate) fn heap(&self) -> &SegmentedHeap {
        &self.heap
    }
}

// ---------------------------------------------------------------------------
// Process-wide facade.
// ---------------------------------------------------------------------------

static GLOBAL: OnceLock<MemoryContext> = OnceLock::new();

/// Pre-init pass-through ledger: address -> page-rounded span, so a block
/// allocated before `init` can still be freed correctly afterwards.
static FALLBACK: OnceLock<Mutex<HashMap<usize, usize>>> = OnceLock::new();

fn fallback() -> &'static Mutex<HashMap<usize, usize>> {
    FALLBACK.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Entry points for embedders that need one process-wide context.
///
/// Calls arriving on any thread before [`init`](GlobalMemory::init) degrade
/// to plain page-granular platform mappings instead of failing, and
/// re-initialization is an idempotent no-op.
pub struct GlobalMemory;

impl GlobalMemory {
    /// Install the process-wide context. Returns `Ok(true)` if this call
    /// installed it, `Ok(false)` if one was already live (the config is
    /// ignored then).
    pub fn init(config: MemoryConfig) -> Result<bool, AllocError> {
        if GLOBAL.get().is_some() {
            return Ok(false);
        }
        let ctx = MemoryContext::new(config)?;
        match GLOBAL.set(ctx) {
            Ok(()) => Ok(true),
            Err(_) => Ok(false), // lost an init race; drop ours
        }
    }

    pub fn context() -> Option<&'static MemoryContext> {
        GLOBAL.get()
    }

    pub fn is_initialized() -> bool {
        GLOBAL.get().is_some()
    }

    /// Allocate through the global context, or page-granular pass-through
    /// before init.
    pub fn allocate(size: usize) -> Option<NonNull<u8>> {
        if let Some(ctx) = GLOBAL.get() {
            return ctx.allocate(size);
        }
        if size == 0 {
            return None;
        }
        let span = size.next_multiple_of(PlatformVmOps::page_size());
        // Safety: fresh mapping; tracked in the fallback ledger.
        let ptr = unsafe { PlatformVmOps::reserve(span).ok()? };
        // Safety: committing our own fresh reservation.
        if unsafe { PlatformVmOps::commit(ptr, span) }.is_err() {
            // Safety: rollback.
            let _ = unsafe { PlatformVmOps::release(ptr, span) };
            return None;
        }
        fallback()
            .lock()
            .unwrap()
            .insert(ptr.as_ptr() as usize, span);
        Some(ptr)
    }

    /// Free through the global context. Blocks from the pre-init
    /// pass-through path are recognized and unmapped directly.
    ///
    /// # Safety
    /// `ptr` must have come from [`GlobalMemory::allocate`] with no
    /// remaining references.
    pub unsafe fn free(ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        if let Some(span) = fallback().lock().unwrap().remove(&addr) {
            // Safety: the ledger says this is a live pass-through mapping.
            if let Err(e) = unsafe { PlatformVmOps::release(ptr, span) } {
                log::warn!("pass-through release of {addr:#x} failed: {e}");
            }
            return;
        }
        match GLOBAL.get() {
            // Safety: forwarded.
            Some(ctx) => unsafe { ctx.free(ptr) },
            None => log::warn!("free of unknown pointer {addr:#x} before init; leaking"),
        }
    }

    /// Release cached and deferred memory. The context itself stays
    /// installed (the embedding layer may still be running); repeated calls
    /// are harmless.
    pub fn shutdown() {
        if let Some(ctx) = GLOBAL.get() {
            ctx.purge();
        }
    }
}
