//! Deferred release controller.
//!
//! Every return-to-OS request flows through [`DeferredRelease::submit`] and
//! either passes straight through to the real operation or is parked in a
//! fixed-capacity ring for a grace period. A block freed and re-needed
//! within the window is simply still mapped; blocks that age out are
//! released by housekeeping.
//!
//! Three guards bound the held memory:
//!   * a size threshold — small blocks are cheap to remap and pass through;
//!   * a kept-bytes quota — admitting a new entry evicts the oldest until
//!     it fits, and a request bigger than the whole quota passes through;
//!   * a safety valve — every N submits a cheap reservation probe checks
//!     that a large block is still mappable; if not, everything is flushed
//!     and deferral stays disabled until the probe recovers.
//!
//! A request is never silently dropped: every entry leaving the ring, for
//! whatever reason, gets its real operation performed exactly once.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::time::Instant;

use crate::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use crate::sync::{Arc, Mutex};

use super::config::DeferredConfig;
use super::stats::MemoryCounters;
use super::vm::{PlatformVmOps, VmOps};

/// Which real operation the request stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseKind {
    /// Return physical pages, keep the address range reserved.
    Decommit,
    /// Unmap the address range entirely.
    Release,
}

/// What happened to a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Parked in the ring; the real operation runs later.
    Deferred,
    /// The real operation ran before returning.
    Passthrough,
}

#[derive(Debug, Clone, Copy)]
struct DeferredEntry {
    addr: usize,
    size: usize,
    kind: ReleaseKind,
    enqueued: Instant,
}

struct QueueState {
    queue: VecDeque<DeferredEntry>,
    kept_bytes: usize,
}

pub(crate) struct DeferredRelease {
    cfg: DeferredConfig,
    state: Mutex<QueueState>,
    /// Cleared by the safety valve under address-space pressure.
    enabled: AtomicBool,
    /// Submit counter driving the periodic probe.
    op_count: AtomicU32,
    counters: Arc<MemoryCounters>,
}

impl DeferredRelease {
    pub(crate) fn new(cfg: DeferredConfig, counters: Arc<MemoryCounters>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::with_capacity(cfg.queue_capacity),
                kept_bytes: 0,
            }),
            cfg,
            enabled: AtomicBool::new(true),
            op_count: AtomicU32::new(0),
            counters,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Submit a return-to-OS request.
    ///
    /// # Safety
    /// `[addr, addr + size)` must be a live mapping owned by the caller,
    /// with no remaining references; it may be unmapped at any point from
    /// here on.
    pub(crate) unsafe fn submit(&self, addr: usize, size: usize, kind: ReleaseKind) -> Verdict {
        self.maybe_probe();

        if size < self.cfg.pass_threshold
            || size > self.cfg.quota_bytes
            || !self.enabled.load(Ordering::Relaxed)
        {
            // Safety: forwarded from the caller.
            unsafe { self.perform(addr, size, kind) };
            self.counters.deferred_passthrough.incr();
            return Verdict::Passthrough;
        }

        let mut state = self.state.lock().unwrap();

        // Make room: quota first, then ring capacity. Oldest out.
        while state.kept_bytes + size > self.cfg.quota_bytes
            || state.queue.len() >= self.cfg.queue_capacity
        {
            match state.queue.pop_front() {
                Some(old) => {
                    state.kept_bytes -= old.size;
                    self.counters.deferred_depth.sub(1);
                    self.counters.deferred_kept_bytes.sub(old.size);
                    self.counters.deferred_evictions.incr();
                    // Safety: the entry's range was handed to us by its
                    // owner via an earlier submit.
                    unsafe { self.perform(old.addr, old.size, old.kind) };
                }
                None => break,
            }
        }

        state.queue.push_back(DeferredEntry {
            addr,
            size,
            kind,
            enqueued: Instant::now(),
        });
        state.kept_bytes += size;
        self.counters.deferred_depth.incr();
        self.counters.deferred_kept_bytes.add(size);
        Verdict::Deferred
    }

    /// Release everything that has aged past the delay, judged against
    /// `now`. Entries are queued in submit order, so expiry stops at the
    /// first young entry.
    pub(crate) fn housekeeping_at(&self, now: Instant) {
        let mut state = self.state.lock().unwrap();
        while let Some(front) = state.queue.front() {
            if now.duration_since(front.enqueued) < self.cfg.delay {
                break;
            }
            let entry = state.queue.pop_front().expect("front just observed");
            state.kept_bytes -= entry.size;
            self.counters.deferred_depth.sub(1);
            self.counters.deferred_kept_bytes.sub(entry.size);
            // Safety: see submit.
            unsafe { self.perform(entry.addr, entry.size, entry.kind) };
        }
    }

    pub(crate) fn housekeeping(&self) {
        self.housekeeping_at(Instant::now());
    }

    /// Perform the real operation for every held entry immediately.
    pub(crate) fn flush_all(&self) {
        let mut state = self.state.lock().unwrap();
        while let Some(entry) = state.queue.pop_front() {
            state.kept_bytes -= entry.size;
            self.counters.deferred_depth.sub(1);
            self.counters.deferred_kept_bytes.sub(entry.size);
            // Safety: see submit.
            unsafe { self.perform(entry.addr, entry.size, entry.kind) };
        }
        debug_assert_eq!(state.kept_bytes, 0);
    }

    #[cfg(test)]
    pub(crate) fn kept_bytes(&self) -> usize {
        self.state.lock().unwrap().kept_bytes
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Every `probe_interval` submits, check whether a large contiguous
    /// block is still reservable. Address-space pressure flips deferral
    /// off (flushing everything held); recovery flips it back on.
    fn maybe_probe(&self) {
        let n = self.op_count.fetch_add(1, Ordering::Relaxed);
        if !(n + 1).is_multiple_of(self.cfg.probe_interval) {
            return;
        }
        let healthy = PlatformVmOps::probe_reservable(self.cfg.probe_floor);
        if !healthy && self.enabled.swap(false, Ordering::Relaxed) {
            log::debug!(
                "deferred release: probe below {} byte floor, flushing and disabling",
                self.cfg.probe_floor
            );
            self.flush_all();
        } else if healthy && !self.enabled.swap(true, Ordering::Relaxed) {
            log::debug!("deferred release: probe recovered, re-enabling");
        }
    }

    /// The real operation. Failures are logged, not propagated: the caller
    /// already gave the range up.
    unsafe fn perform(&self, addr: usize, size: usize, kind: ReleaseKind) {
        let Some(ptr) = NonNull::new(addr as *mut u8) else {
            return;
        };
        match kind {
            ReleaseKind::Decommit => {
                // Safety: caller contract on submit.
                if let Err(e) = unsafe { PlatformVmOps::decommit(ptr, size) } {
                    log::warn!("deferred decommit of {size} bytes at {addr:#x} failed: {e}");
                } else {
                    self.counters.total_committed.sub(size);
                }
            }
            ReleaseKind::Release => {
                // Safety: caller contract on submit.
                if let Err(e) = unsafe { PlatformVmOps::release(ptr, size) } {
                    log::warn!("deferred release of {size} bytes at {addr:#x} failed: {e}");
                } else {
                    self.counters.total_committed.sub(size);
                    self.counters.total_reserved.sub(size);
                }
            }
        }
    }
}

impl Drop for DeferredRelease {
    fn drop(&mut self) {
        self.flush_all();
    }
}
