#[cfg(not(target_pointer_width = "64"))]
compile_error!("tenure supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// tiers
pub use memory::arena::{ArenaOptions, VaArena};
pub use memory::class_heap::MAX_CLASS_SIZE;

// routing/config/stats
pub use memory::config::{DeferredConfig, MemoryConfig};
pub use memory::deferred::{ReleaseKind, Verdict};
pub use memory::router::{GlobalMemory, MemoryContext};
pub use memory::stats::{MemoryStats, TierStats};

// errors
pub use memory::error::{AllocError, Tier};
pub use memory::vm::VmError;
