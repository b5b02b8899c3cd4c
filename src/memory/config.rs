use std::time::Duration;

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Deferred-release policy knobs.
#[derive(Debug, Clone)]
pub struct DeferredConfig {
    /// Requests below this size pass straight through to the real operation.
    pub pass_threshold: usize,
    /// How long an entry is held before housekeeping performs the real
    /// operation.
    pub delay: Duration,
    /// Upper bound on the total bytes held in the queue. Admitting a new
    /// entry evicts the oldest entries until it fits; a single request
    /// larger than the quota passes through.
    pub quota_bytes: usize,
    /// Fixed capacity of the ring buffer. A full ring evicts its oldest
    /// entry; requests are never silently dropped.
    pub queue_capacity: usize,
    /// Safety valve: if the largest reservable block drops below this,
    /// flush everything and disable deferral until the probe recovers.
    pub probe_floor: usize,
    /// Run the reservability probe every N submit operations.
    pub probe_interval: u32,
}

impl Default for DeferredConfig {
    fn default() -> Self {
        Self {
            pass_threshold: 256 * KIB,
            delay: Duration::from_millis(2000),
            quota_bytes: 64 * MIB,
            queue_capacity: 1024,
            probe_floor: 64 * MIB,
            probe_interval: 64,
        }
    }
}

/// Everything the context consumes once at init. Populated by the embedding
/// layer (config file, console); defaults match the tuning the allocator
/// shipped with.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Preferred size of the high-address arena reservation.
    pub arena_size: usize,
    /// Smallest arena we will settle for before reporting inactive.
    pub arena_min_size: usize,
    /// Tier-1 primary bump pool capacity.
    pub primary_pool_size: usize,
    /// Overflow pool behind the primary.
    pub secondary_pool_size: usize,
    /// Incremental commit step for the bump pools.
    pub pool_commit_step: usize,
    /// Largest request the bump pools accept; above this goes to the arena
    /// or the platform VM.
    pub max_pool_alloc: usize,
    /// Buffer cache entry count.
    pub cache_capacity: usize,
    /// Smallest buffer the cache will hold.
    pub cache_min_size: usize,
    /// Largest buffer the cache will hold.
    pub cache_max_size: usize,
    pub deferred: DeferredConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            arena_size: 1024 * MIB,
            arena_min_size: 64 * MIB,
            primary_pool_size: 256 * MIB,
            secondary_pool_size: 128 * MIB,
            pool_commit_step: 4 * MIB,
            max_pool_alloc: 16 * MIB,
            cache_capacity: 128,
            cache_min_size: 64,
            cache_max_size: 64 * KIB,
            deferred: DeferredConfig::default(),
        }
    }
}

impl MemoryConfig {
    /// A configuration scaled down for tests: small arena and pools so a
    /// suite of contexts fits comfortably in one address space.
    #[cfg(test)]
    pub(crate) fn small() -> Self {
        Self {
            arena_size: 64 * MIB,
            arena_min_size: 16 * MIB,
            primary_pool_size: 16 * MIB,
            secondary_pool_size: 8 * MIB,
            pool_commit_step: MIB,
            max_pool_alloc: 2 * MIB,
            cache_capacity: 16,
            cache_min_size: 64,
            cache_max_size: 64 * KIB,
            deferred: DeferredConfig::default(),
        }
    }
}
