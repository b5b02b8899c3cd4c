//! High-address virtual-address arena.
//!
//! One contiguous reservation, preferring the top of the user VA range, is
//! carved into granularity-unit sub-reservations through a sorted,
//! maximally-coalesced free-segment list. Nothing here touches physical
//! memory until a caller commits a sub-range.
//!
//! Init failure is non-fatal: the arena reports inactive and callers route
//! around it to plain platform reservations.

use std::collections::HashMap;
use std::ptr::NonNull;

use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{Arc, Mutex};

use super::error::AllocError;
use super::stats::MemoryCounters;
use super::vm::{PlatformVmOps, VmOps};

#[derive(Debug, Clone)]
pub struct ArenaOptions {
    /// Preferred reservation size. Rounded up to allocation granularity.
    pub size: usize,
    /// Smallest reservation worth keeping; below this the arena gives up
    /// and reports inactive.
    pub min_size: usize,
}

impl Default for ArenaOptions {
    fn default() -> Self {
        Self {
            size: 1024 * 1024 * 1024,
            min_size: 64 * 1024 * 1024,
        }
    }
}

/// A run of free granularity units. `start` and `len` are in units, not
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeSeg {
    start: usize,
    len: usize,
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    /// Length in units.
    len: usize,
    /// Diagnostic: committed bytes within this reservation, settled on
    /// release. Saturating; recommits of the same range are not detected.
    committed: usize,
}

struct ArenaState {
    /// Sorted by `start`, disjoint, maximally coalesced.
    free: Vec<FreeSeg>,
    /// Live sub-reservations keyed by start unit.
    reserved: HashMap<usize, Reservation>,
}

pub struct VaArena {
    base: usize,
    size_bytes: usize,
    gran: usize,
    active: bool,
    state: Mutex<ArenaState>,
    /// Lock-free mirror of the total free units, so "is it worth trying"
    /// checks skip the lock.
    free_units: AtomicUsize,
    counters: Arc<MemoryCounters>,
}

impl VaArena {
    /// Reserve the arena. Tries the preferred size top-down, halving on
    /// failure until `min_size`; if nothing sticks the arena comes back
    /// inactive rather than failing init.
    pub(crate) fn init(opts: ArenaOptions, counters: Arc<MemoryCounters>) -> Self {
        let gran = PlatformVmOps::allocation_granularity();
        let mut attempt = opts.size.next_multiple_of(gran).max(gran);
        let min = opts.min_size.next_multiple_of(gran).max(gran);

        let mut placed: Option<(usize, usize)> = None;
        while attempt >= min {
            // Safety: a fresh reservation; released in Drop.
            match unsafe { PlatformVmOps::reserve_topdown(attempt) } {
                Ok(ptr) => {
                    placed = Some((ptr.as_ptr() as usize, attempt));
                    break;
                }
                Err(e) => {
                    log::debug!("arena: {attempt} byte reservation failed ({e}), halving");
                    attempt /= 2;
                }
            }
        }

        match placed {
            Some((base, size_bytes)) => {
                let units = size_bytes / gran;
                counters.total_reserved.add(size_bytes);
                Self {
                    base,
                    size_bytes,
                    gran,
                    active: true,
                    state: Mutex::new(ArenaState {
                        free: vec![FreeSeg { start: 0, len: units }],
                        reserved: HashMap::new(),
                    }),
                    free_units: AtomicUsize::new(units),
                    counters,
                }
            }
            None => {
                log::warn!(
                    "arena: no contiguous reservation >= {min} bytes available; arena inactive"
                );
                Self {
                    base: 0,
                    size_bytes: 0,
                    gran,
                    active: false,
                    state: Mutex::new(ArenaState {
                        free: Vec::new(),
                        reserved: HashMap::new(),
                    }),
                    free_units: AtomicUsize::new(0),
                    counters,
                }
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn free_bytes(&self) -> usize {
        self.free_units.load(Ordering::Relaxed) * self.gran
    }

    /// Does `addr` fall inside the arena's reservation?
    pub fn contains(&self, addr: usize) -> bool {
        self.active && addr >= self.base && addr < self.base + self.size_bytes
    }

    fn units_for(&self, size: usize) -> usize {
        size.next_multiple_of(self.gran) / self.gran
    }

    /// Carve a sub-reservation out of the arena: address space only, no
    /// physical backing. First fit at the lowest address, so released
    /// ranges are re-found deterministically.
    pub fn reserve(&self, size: usize) -> Option<NonNull<u8>> {
        if !self.active || size == 0 {
            return None;
        }
        let want = self.units_for(size);

        // Cheap pre-check; the lock still re-validates.
        if self.free_units.load(Ordering::Relaxed) < want {
            return None;
        }

        let mut state = self.state.lock().unwrap();
        let idx = state.free.iter().position(|seg| seg.len >= want)?;

        let seg = state.free[idx];
        if seg.len == want {
            state.free.remove(idx);
        } else {
            state.free[idx] = FreeSeg {
                start: seg.start + want,
                len: seg.len - want,
            };
        }
        state.reserved.insert(
            seg.start,
            Reservation {
                len: want,
                committed: 0,
            },
        );
        self.free_units.fetch_sub(want, Ordering::Relaxed);

        #[cfg(debug_assertions)]
        Self::check_free_list(&state.free);

        let addr = self.base + seg.start * self.gran;
        NonNull::new(addr as *mut u8)
    }

    /// Commit physical pages for a range inside a live sub-reservation.
    /// The syscall runs under the arena lock so a racing release cannot
    /// pull the reservation out from underneath it.
    pub fn commit(&self, addr: usize, size: usize) -> Result<(), AllocError> {
        let mut state = self.state.lock().unwrap();
        let start = self.find_owner(&state, addr, size)?;
        let ptr = NonNull::new(addr as *mut u8)
            .ok_or(AllocError::InvalidRequest("null commit address"))?;
        // Safety: range verified inside a live sub-reservation, which stays
        // live while the lock is held.
        unsafe { PlatformVmOps::commit(ptr, size)? };

        let r = state.reserved.get_mut(&start).expect("owner just found");
        let span = r.len * self.gran;
        r.committed = (r.committed + size).min(span);
        self.counters.total_committed.add(size);
        Ok(())
    }

    /// Return physical pages for a range inside a live sub-reservation; the
    /// address space stays reserved.
    pub fn decommit(&self, addr: usize, size: usize) -> Result<(), AllocError> {
        let mut state = self.state.lock().unwrap();
        let start = self.find_owner(&state, addr, size)?;
        let ptr = NonNull::new(addr as *mut u8)
            .ok_or(AllocError::InvalidRequest("null decommit address"))?;
        // Safety: range verified inside a live sub-reservation, which stays
        // live while the lock is held.
        unsafe { PlatformVmOps::decommit(ptr, size)? };

        let r = state.reserved.get_mut(&start).expect("owner just found");
        r.committed = r.committed.saturating_sub(size);
        self.counters.total_committed.sub(size);
        Ok(())
    }

    /// Reserve and commit in one step, rolling the reservation back if the
    /// commit fails so no address space leaks.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.reserve(size)?;
        let addr = ptr.as_ptr() as usize;
        match self.commit(addr, size) {
            Ok(()) => Some(ptr),
            Err(e) => {
                log::warn!("arena: commit of {size} bytes at {addr:#x} failed: {e}");
                let _ = self.release(addr);
                None
            }
        }
    }

    /// Hand a sub-reservation back. Physical pages are defensively
    /// decommitted (the caller may or may not have committed them), then
    /// the units merge back into the free list, coalescing with neighbours.
    /// Returns the released size in bytes.
    pub fn release(&self, addr: usize) -> Result<usize, AllocError> {
        if !self.contains(addr) {
            return Err(AllocError::InvalidRequest("address outside arena"));
        }
        let offset = addr - self.base;
        if !offset.is_multiple_of(self.gran) {
            return Err(AllocError::InvalidRequest("address not a reservation base"));
        }
        let start = offset / self.gran;

        let mut state = self.state.lock().unwrap();
        let reservation = state
            .reserved
            .remove(&start)
            .ok_or(AllocError::InvalidRequest("no reservation at address"))?;
        let len = reservation.len;

        // Defensive decommit; harmless on never-committed ranges.
        if let Some(ptr) = NonNull::new(addr as *mut u8) {
            // Safety: range was a live sub-reservation until this call.
            let _ = unsafe { PlatformVmOps::decommit(ptr, len * self.gran) };
        }
        self.counters.total_committed.sub(reservation.committed);

        Self::merge_free(&mut state.free, FreeSeg { start, len });
        self.free_units.fetch_add(len, Ordering::Relaxed);

        #[cfg(debug_assertions)]
        Self::check_free_list(&state.free);

        Ok(len * self.gran)
    }

    /// Length in bytes of the live sub-reservation at `addr`, if any.
    pub(crate) fn reservation_size(&self, addr: usize) -> Option<usize> {
        if !self.contains(addr) {
            return None;
        }
        let offset = addr - self.base;
        if !offset.is_multiple_of(self.gran) {
            return None;
        }
        let state = self.state.lock().unwrap();
        state
            .reserved
            .get(&(offset / self.gran))
            .map(|r| r.len * self.gran)
    }

    /// Start unit of the single live sub-reservation wholly containing
    /// `[addr, addr + size)`.
    fn find_owner(&self, state: &ArenaState, addr: usize, size: usize) -> Result<usize, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidRequest("zero-size range"));
        }
        if !self.contains(addr) || !self.contains(addr + size - 1) {
            return Err(AllocError::InvalidRequest("range outside arena"));
        }
        let offset = addr - self.base;
        state
            .reserved
            .iter()
            .find_map(|(&start, r)| {
                let lo = start * self.gran;
                let hi = lo + r.len * self.gran;
                (offset >= lo && offset + size <= hi).then_some(start)
            })
            .ok_or(AllocError::InvalidRequest("range not inside a reservation"))
    }

    /// Insert `seg` into the sorted free list, coalescing with adjacent
    /// segments on both sides.
    fn merge_free(free: &mut Vec<FreeSeg>, seg: FreeSeg) {
        let idx = free.partition_point(|s| s.start < seg.start);
        free.insert(idx, seg);

        // Right neighbour first so the left merge sees the grown segment.
        if idx + 1 < free.len() && free[idx].start + free[idx].len == free[idx + 1].start {
            free[idx].len += free[idx + 1].len;
            free.remove(idx + 1);
        }
        if idx > 0 && free[idx - 1].start + free[idx - 1].len == free[idx].start {
            free[idx - 1].len += free[idx].len;
            free.remove(idx);
        }
    }

    #[cfg(debug_assertions)]
    fn check_free_list(free: &[FreeSeg]) {
        for w in free.windows(2) {
            debug_assert!(
                w[0].start + w[0].len < w[1].start,
                "free list not sorted/disjoint/coalesced: {w:?}"
            );
        }
        for seg in free {
            debug_assert!(seg.len > 0, "zero-length free segment");
        }
    }
}

impl Drop for VaArena {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Some(ptr) = NonNull::new(self.base as *mut u8) {
            // Safety: the arena owns the whole reservation; no references
            // into it outlive the owning context.
            if let Err(e) = unsafe { PlatformVmOps::release(ptr, self.size_bytes) } {
                log::warn!("arena: release on drop failed: {e}");
            }
        }
        self.counters.total_reserved.sub(self.size_bytes);
    }
}
