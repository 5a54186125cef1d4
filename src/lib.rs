#[cfg(not(target_pointer_width = "64"))]
compile_error!("slabchain supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocators
pub use memory::global::{GlobalSyncAllocator, SharedAllocator, with_global_synchronized_allocator};
pub use memory::slab_allocator::{PoolStats, SlabAllocator, SlabAllocatorConfig};

// scope stack
pub use memory::chain::{
    ChainGuard, LocalAllocator, MAX_CHAIN_DEPTH, active_is_shared, allocate, chain_depth, default_live_slab_count,
    free, reallocate, with_allocator, with_shared_allocator,
};

// configuration
pub use memory::config::{
    default_config, defaults_frozen, set_default_config, set_default_policy, set_default_size_classes,
};
pub use memory::size_class::{DEFAULT_SIZE_CLASSES, MAX_SIZE_CLASSES, SizeClass};

// handles
pub use memory::handle::{Handle, POOL_INDEX_SHIFT, RELATIVE_ID_MASK, SlotId, SlotKind};

// stats
pub use memory::stats::MemoryStats;

// errors
pub use memory::error::AllocError;
pub use memory::vm::VmError;
