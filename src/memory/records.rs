//! Allocation-record table.
//!
//! Every live allocation has a record keyed by its address: requested size,
//! block capacity, a validation tag, the owning tier, and the allocating
//! thread. Keeping the metadata *out of line* (instead of in a header in
//! front of the pointer) means a heap overflow can corrupt user data but not
//! the allocator's own bookkeeping, and a bogus free is detected by lookup
//! rather than by trusting bytes behind the pointer.

use std::collections::HashMap;

use crate::sync::Mutex;

use super::error::AllocError;

/// Tag stamped into every record; checked on every free/resize.
pub(crate) const VALIDATION_TAG: u32 = 0xDEAD_C0DE;

const SHARD_COUNT: usize = 16;

/// Which tier owns the block, and what the tier needs to take it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    /// Bump pool (0 = primary, 1 = secondary). Frees are logical no-ops.
    Pool(u8),
    /// Size-class heap; `class` is the index the capacity maps to.
    Heap { class: u8 },
    /// Arena or direct platform reservation.
    Vm,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct AllocRecord {
    /// Bytes the caller asked for.
    pub size: usize,
    /// Bytes the block can actually hold (class size, pool span, or the
    /// page-rounded reservation).
    pub capacity: usize,
    pub tag: u32,
    pub owner: Owner,
    pub thread_id: u64,
}

/// Sharded address → record map. Shards cut contention between unrelated
/// allocations; the shard index mixes out the low alignment bits first.
pub(crate) struct RecordTable {
    shards: Vec<Mutex<HashMap<usize, AllocRecord>>>,
}

/// Small monotonically-assigned per-thread id. `std::thread::ThreadId` has
/// no stable integer form, so we hand out our own.
fn current_thread_id() -> u64 {
    // Plain std atomic, not the sync shim: this is an id generator, not a
    // synchronization point loom needs to explore, and it must be
    // const-initializable in a static.
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ID: std::cell::Cell<u64> = const { std::cell::Cell::new(0) };
    }
    ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}

impl RecordTable {
    pub(crate) fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    #[inline]
    fn shard(&self, addr: usize) -> &Mutex<HashMap<usize, AllocRecord>> {
        // All allocations are at least 16-byte aligned; shift those bits out
        // so consecutive blocks land in different shards.
        &self.shards[(addr >> 4) % SHARD_COUNT]
    }

    /// Register a fresh allocation. The tag and thread id are filled in here.
    pub(crate) fn insert(&self, addr: usize, size: usize, capacity: usize, owner: Owner) {
        let record = AllocRecord {
            size,
            capacity,
            tag: VALIDATION_TAG,
            owner,
            thread_id: current_thread_id(),
        };
        let previous = self.shard(addr).lock().unwrap().insert(addr, record);
        debug_assert!(
            previous.is_none(),
            "record inserted over a live allocation at {addr:#x}"
        );
    }

    pub(crate) fn get(&self, addr: usize) -> Option<AllocRecord> {
        self.shard(addr).lock().unwrap().get(&addr).copied()
    }

    /// Validate and remove in one shard lock. A missing record or a tag
    /// mismatch is corruption; the record (if any) is left in place so the
    /// caller can leak the block rather than recycle poisoned state.
    pub(crate) fn validate_remove(&self, addr: usize) -> Result<AllocRecord, AllocError> {
        let mut shard = self.shard(addr).lock().unwrap();
        match shard.get(&addr) {
            Some(r) if r.tag == VALIDATION_TAG => Ok(shard.remove(&addr).unwrap()),
            _ => Err(AllocError::Corruption { addr }),
        }
    }

    /// Validate without removing (resize-in-place, cache re-issue).
    pub(crate) fn validate(&self, addr: usize) -> Result<AllocRecord, AllocError> {
        match self.get(addr) {
            Some(r) if r.tag == VALIDATION_TAG => Ok(r),
            _ => Err(AllocError::Corruption { addr }),
        }
    }

    /// Update the requested size of a live record, keeping its capacity and
    /// owner. Used when a resize fits in place or a cached buffer is
    /// re-issued at a different size.
    pub(crate) fn update_size(&self, addr: usize, size: usize) {
        if let Some(r) = self.shard(addr).lock().unwrap().get_mut(&addr) {
            r.size = size;
            r.thread_id = current_thread_id();
        }
    }

    /// Number of live records, for leak checks in tests and shutdown
    /// diagnostics.
    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    /// Deliberately damage a record's tag so corruption handling can be
    /// exercised.
    #[cfg(test)]
    pub(crate) fn corrupt_tag(&self, addr: usize) {
        if let Some(r) = self.shard(addr).lock().unwrap().get_mut(&addr) {
            r.tag = 0;
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let table = RecordTable::new();
        table.insert(0x1000, 100, 112, Owner::Heap { class: 6 });

        let r = table.get(0x1000).expect("record missing");
        assert_eq!(r.size, 100);
        assert_eq!(r.capacity, 112);
        assert_eq!(r.tag, VALIDATION_TAG);
        assert_eq!(r.owner, Owner::Heap { class: 6 });
        assert_ne!(r.thread_id, 0);

        let removed = table.validate_remove(0x1000).expect("validate failed");
        assert_eq!(removed.size, 100);
        assert!(table.get(0x1000).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn missing_record_is_corruption() {
        let table = RecordTable::new();
        assert!(matches!(
            table.validate_remove(0xBEEF0),
            Err(AllocError::Corruption { addr: 0xBEEF0 })
        ));
    }

    #[test]
    fn bad_tag_is_corruption_and_record_stays() {
        let table = RecordTable::new();
        table.insert(0x2000, 64, 64, Owner::Pool(0));
        table.corrupt_tag(0x2000);

        assert!(table.validate_remove(0x2000).is_err());
        // The poisoned record is left in place, not recycled.
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn update_size_keeps_capacity() {
        let table = RecordTable::new();
        table.insert(0x3000, 500, 1024, Owner::Vm);
        table.update_size(0x3000, 900);

        let r = table.get(0x3000).unwrap();
        assert_eq!(r.size, 900);
        assert_eq!(r.capacity, 1024);
    }

    #[test]
    fn thread_ids_differ_across_threads() {
        let table = std::sync::Arc::new(RecordTable::new());
        table.insert(0x10, 16, 16, Owner::Pool(0));

        let t2 = {
            let table = table.clone();
            std::thread::spawn(move || {
                table.insert(0x20, 16, 16, Owner::Pool(0));
            })
        };
        t2.join().unwrap();

        let a = table.get(0x10).unwrap().thread_id;
        let b = table.get(0x20).unwrap().thread_id;
        assert_ne!(a, b);
    }

    #[test]
    fn shards_spread_consecutive_blocks() {
        let table = RecordTable::new();
        // 16-byte-spaced addresses should not all land in shard 0.
        for i in 0..SHARD_COUNT {
            table.insert(0x8000 + i * 16, 16, 16, Owner::Pool(0));
        }
        assert_eq!(table.len(), SHARD_COUNT);
        let populated = table
            .shards
            .iter()
            .filter(|s| !s.lock().unwrap().is_empty())
            .count();
        assert_eq!(populated, SHARD_COUNT);
    }
}
