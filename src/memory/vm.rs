use std::fmt;
use std::ptr::NonNull;

/// Highest user-space address we will ask for when reserving top-down.
/// Just under the 47-bit user VA limit (x86_64, and the common aarch64
/// configuration), leaving the top 4 GiB to the stack and vdso. Placement
/// failures fall through to descending candidates, so an occupied candidate
/// costs one failed mmap.
const TOPDOWN_CEILING: usize = 0x7FFF_0000_0000;

/// Maximum number of descending placement candidates tried by
/// [`VmOps::reserve_topdown`] before falling back to a plain reservation.
const TOPDOWN_MAX_CANDIDATES: usize = 64;

#[derive(Debug)]
pub enum VmError {
    ReservationFailed(std::io::Error),
    CommitFailed(std::io::Error),
    DecommitFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    PlacementUnavailable { addr: usize, size: usize },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ReservationFailed(e) => write!(f, "VM reservation failed: {e}"),
            VmError::CommitFailed(e) => write!(f, "VM commit failed: {e}"),
            VmError::DecommitFailed(e) => write!(f, "VM decommit failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
            VmError::PlacementUnavailable { addr, size } => write!(
                f,
                "VM placement unavailable: {size} bytes at {addr:#x}"
            ),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReservationFailed(e)
            | VmError::CommitFailed(e)
            | VmError::DecommitFailed(e)
            | VmError::ReleaseFailed(e) => Some(e),
            VmError::PlacementUnavailable { .. } => None,
        }
    }
}

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Reserve address space at exactly `addr`, failing if the range is
    /// already occupied. Never clobbers an existing mapping.
    unsafe fn reserve_at(addr: usize, size: usize) -> Result<NonNull<u8>, VmError>;

    /// Reserve address space preferring the high end of the user VA range.
    ///
    /// Tries a bounded number of descending placement candidates below
    /// [`TOPDOWN_CEILING`]; if none stick, falls back to a plain
    /// [`reserve`](VmOps::reserve) wherever the kernel puts it.
    unsafe fn reserve_topdown(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Decommit (return physical pages, keep address range reserved).
    unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size.
    fn page_size() -> usize;

    /// Unit in which reservations are placed and carved: the larger of the
    /// OS page size and 64 KiB.
    fn allocation_granularity() -> usize {
        Self::page_size().max(64 * 1024)
    }

    /// Bounded-cost probe: can a contiguous block of `size` bytes still be
    /// reserved? Reserves and immediately releases; no pages are committed,
    /// so the cost is two syscalls.
    fn probe_reservable(size: usize) -> bool {
        // Safety: the reservation is released before returning and never
        // dereferenced.
        unsafe {
            match Self::reserve(size) {
                Ok(ptr) => {
                    let _ = Self::release(ptr, size);
                    true
                }
                Err(_) => false,
            }
        }
    }
}

pub(crate) struct PlatformVmOps;

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps, TOPDOWN_CEILING, TOPDOWN_MAX_CANDIDATES};
    use std::io;

    /// Linux: MAP_FIXED_NOREPLACE gives an atomic "place here or fail"
    /// without the clobber hazard of MAP_FIXED.
    #[cfg(target_os = "linux")]
    unsafe fn reserve_at_impl(addr: usize, size: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(VmError::PlacementUnavailable { addr, size });
        }

        match NonNull::new(ptr.cast::<u8>()) {
            Some(p) => Ok(p),
            None => Err(VmError::PlacementUnavailable { addr, size }),
        }
    }

    /// macOS: no MAP_FIXED_NOREPLACE. Pass the address as a hint, then
    /// verify the kernel honoured it; if not, undo and report the placement
    /// as unavailable.
    #[cfg(target_os = "macos")]
    unsafe fn reserve_at_impl(addr: usize, size: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(VmError::PlacementUnavailable { addr, size });
        }

        if ptr as usize != addr {
            // Safety: ptr is a live mapping of exactly `size` bytes we just
            // created; nothing else references it yet.
            unsafe { libc::munmap(ptr, size) };
            return Err(VmError::PlacementUnavailable { addr, size });
        }

        match NonNull::new(ptr.cast::<u8>()) {
            Some(p) => Ok(p),
            None => Err(VmError::PlacementUnavailable { addr, size }),
        }
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn reserve_at(addr: usize, size: usize) -> Result<NonNull<u8>, VmError> {
            debug_assert!(
                addr.is_multiple_of(Self::allocation_granularity()),
                "reserve_at: addr {addr:#x} not granularity-aligned"
            );
            // Safety: forwarded; caller guarantees size > 0.
            unsafe { reserve_at_impl(addr, size) }
        }

        unsafe fn reserve_topdown(size: usize) -> Result<NonNull<u8>, VmError> {
            let gran = Self::allocation_granularity();
            let span = size.next_multiple_of(gran);

            // Descend from the ceiling in strides of the reservation size so
            // consecutive candidates never overlap.
            let stride = span.max(gran);
            let mut candidate = (TOPDOWN_CEILING - span) & !(gran - 1);

            for _ in 0..TOPDOWN_MAX_CANDIDATES {
                // Safety: candidate is granularity-aligned and below the
                // user VA ceiling.
                if let Ok(ptr) = unsafe { Self::reserve_at(candidate, span) } {
                    return Ok(ptr);
                }
                match candidate.checked_sub(stride) {
                    Some(next) if next > 0 => candidate = next,
                    _ => break,
                }
            }

            // High placement unavailable; take whatever the kernel offers.
            // Safety: forwarded.
            unsafe { Self::reserve(span) }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            {
                // Pools and heap segments commit in steps shortly before the
                // memory is written; ask for immediate physical backing to
                // avoid a burst of minor page faults.
                // Safety: FFI call to madvise.
                unsafe {
                    libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_WILLNEED)
                };
            }

            // NOTE: Zeroing is NOT done here. Fresh anonymous pages arrive
            // zeroed from the kernel; recommitted pages may hold stale data
            // (MADV_FREE may not have reclaimed them). Callers that promise
            // zero-fill must zero at the allocator level.

            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Unified path for macOS and Linux: MADV_FREE + mprotect(PROT_NONE).
            //
            // MADV_FREE marks pages for lazy reclamation — the cheapest
            // decommit on both platforms. The kernel reclaims physical pages
            // under pressure; if it doesn't, old data may persist. No zeroing
            // guarantee.
            //
            // MADV_FREE: macOS (all versions), Linux >= 4.5.
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_FREE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, libc::PROT_NONE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // This crate supports only 64-bit targets; page size fits in
                // usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Instead we back every
// "reservation" with a plain heap allocation.
//
// `commit` / `decommit` are intentional no-ops: the memory is always
// accessible once reserved. `release` frees the heap block. Placement
// requests cannot be honoured on the heap, so `reserve_at` refuses and
// `reserve_topdown` degrades to `reserve`; the arena handles both shapes.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn reserve_at(addr: usize, size: usize) -> Result<NonNull<u8>, VmError> {
        Err(VmError::PlacementUnavailable { addr, size })
    }

    unsafe fn reserve_topdown(size: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: forwarded.
        unsafe { Self::reserve(size) }
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // heap memory is always accessible
    }

    unsafe fn decommit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // no-op; memory remains accessible
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }

    fn allocation_granularity() -> usize {
        64 * 1024
    }

    fn probe_reservable(_size: usize) -> bool {
        true
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");

            PlatformVmOps::commit(ptr, size).expect("Commit failed");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            assert_eq!(slice[0], 42);

            PlatformVmOps::decommit(ptr, size).expect("Decommit failed");

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_reserve_zero_size() {
        // mmap with 0 size fails with EINVAL.
        // Safety: Test code.
        let result = unsafe { PlatformVmOps::reserve(0) };
        assert!(result.is_err(), "Reserving 0 bytes should fail");
    }

    #[test]
    fn test_commit_idempotent() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");

            PlatformVmOps::commit(ptr, size).expect("First commit failed");
            PlatformVmOps::commit(ptr, size).expect("Second commit failed (idempotency check)");

            *(ptr.as_ptr()) = 123;

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_decommit_then_recommit() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");

            PlatformVmOps::commit(ptr, size).expect("Commit failed");
            *(ptr.as_ptr()) = 42;
            assert_eq!(*(ptr.as_ptr().cast_const()), 42);

            PlatformVmOps::decommit(ptr, size).expect("Decommit failed");
            PlatformVmOps::commit(ptr, size).expect("Recommit failed");

            // Memory content is undefined after decommit; just write fresh.
            *(ptr.as_ptr()) = 84;
            assert_eq!(*(ptr.as_ptr().cast_const()), 84);

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_partial_commit() {
        // Reserve a large range, commit only a sub-range.
        let page_size = PlatformVmOps::page_size();
        let total_size = page_size * 4;
        let commit_size = page_size * 2;
        let offset = page_size;

        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(total_size).expect("Reserve failed");
            let commit_ptr = NonNull::new(ptr.as_ptr().add(offset)).unwrap();

            PlatformVmOps::commit(commit_ptr, commit_size).expect("Partial commit failed");

            let slice = std::slice::from_raw_parts_mut(commit_ptr.as_ptr(), commit_size);
            slice[0] = 10;
            slice[commit_size - 1] = 20;

            assert_eq!(slice[0], 10);
            assert_eq!(slice[commit_size - 1], 20);

            PlatformVmOps::release(ptr, total_size).expect("Release failed");
        }
    }

    #[test]
    fn test_reserve_at_placement() {
        // The probe-release-replace dance is racy against any concurrent
        // mmap; exclude other tests for its duration.
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let gran = PlatformVmOps::allocation_granularity();
        // Safety: Test code.
        unsafe {
            // Find an address the kernel likes, release it, then re-place there.
            let probe = PlatformVmOps::reserve(gran).expect("probe reserve failed");
            let addr = probe.as_ptr() as usize;
            PlatformVmOps::release(probe, gran).expect("probe release failed");

            let placed = PlatformVmOps::reserve_at(addr, gran).expect("reserve_at failed");
            assert_eq!(placed.as_ptr() as usize, addr);

            // The same range must now be refused.
            assert!(PlatformVmOps::reserve_at(addr, gran).is_err());

            PlatformVmOps::release(placed, gran).expect("Release failed");
        }
    }

    #[test]
    fn test_reserve_topdown_usable() {
        // Placement is best-effort (candidates may be occupied); the
        // contract is only that the reservation succeeds and is usable.
        let size = 4 * 1024 * 1024;
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve_topdown(size).expect("topdown reserve failed");

            PlatformVmOps::commit(ptr, size).expect("Commit failed");
            *(ptr.as_ptr()) = 7;
            *(ptr.as_ptr().add(size - 1)) = 9;
            assert_eq!(*(ptr.as_ptr()), 7);
            assert_eq!(*(ptr.as_ptr().add(size - 1)), 9);

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_probe_reservable_small() {
        assert!(PlatformVmOps::probe_reservable(
            PlatformVmOps::allocation_granularity()
        ));
    }

    #[test]
    fn test_allocation_granularity_floor() {
        let gran = PlatformVmOps::allocation_granularity();
        assert!(gran >= 64 * 1024);
        assert!(gran.is_multiple_of(PlatformVmOps::page_size()));
        assert!(gran.is_power_of_two());
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformVmOps::page_size();
        assert!(size > 0);
        assert_eq!(size & (size - 1), 0, "Page size {size} is not power of two");
    }

    #[test]
    fn test_multiple_reservations() {
        let page_size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr1 = PlatformVmOps::reserve(page_size).expect("Reserve 1 failed");
            let ptr2 = PlatformVmOps::reserve(page_size).expect("Reserve 2 failed");

            assert_ne!(ptr1, ptr2);

            PlatformVmOps::commit(ptr1, page_size).expect("Commit 1 failed");
            PlatformVmOps::commit(ptr2, page_size).expect("Commit 2 failed");

            *(ptr1.as_ptr()) = 1;
            *(ptr2.as_ptr()) = 2;

            assert_eq!(*(ptr1.as_ptr()), 1);
            assert_eq!(*(ptr2.as_ptr()), 2);

            PlatformVmOps::release(ptr1, page_size).expect("Release 1 failed");

            // ptr2 should still be valid
            assert_eq!(*(ptr2.as_ptr()), 2);

            PlatformVmOps::release(ptr2, page_size).expect("Release 2 failed");
        }
    }
}
