use super::error::AllocError;
use super::handle::{Handle, SlotId, SlotKind};
use super::pool::SizeClassPool;
use super::size_class::{self, DEFAULT_SIZE_CLASSES, SizeClass};
use super::stats;
use super::vm;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

/// Configuration for a [`SlabAllocator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlabAllocatorConfig {
    /// Zero memory when it is handed out and scrub it when it is freed.
    pub zero_on_touch: bool,
    /// Serve requests from the general-purpose allocator when no size class
    /// covers them or the covering class cannot grow.
    pub allow_fallback: bool,
    /// Size classes in any order; sorted when the allocator is built.
    pub size_classes: Vec<SizeClass>,
}

impl Default for SlabAllocatorConfig {
    fn default() -> Self {
        Self {
            zero_on_touch: false,
            allow_fallback: true,
            size_classes: DEFAULT_SIZE_CLASSES.to_vec(),
        }
    }
}

/// Occupancy of one size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub slab_size: u32,
    pub slab_count: u64,
    pub live_count: u64,
    pub free_count: u64,
    pub chunk_count: usize,
}

/// A set of size-class pools plus the fallback policy.
///
/// An instance is bound to the thread that owns it. To share one between
/// threads wrap it in a [`SharedAllocator`](crate::SharedAllocator).
pub struct SlabAllocator {
    /// Sorted by ascending slab size.
    pools: Vec<SizeClassPool>,
    zero_on_touch: bool,
    allow_fallback: bool,
    /// Live fallback blocks by address, with their lengths.
    fallback: HashMap<NonNull<u8>, usize>,
    _thread_bound: PhantomData<*const ()>,
}

impl SlabAllocator {
    /// Builds an allocator from a set of size classes.
    ///
    /// Every descriptor is validated before any memory is mapped; then each
    /// class maps its initial chunks.
    ///
    /// # Errors
    ///
    /// - [`AllocError::TooManyClasses`] for more than 255 classes.
    /// - [`AllocError::InvalidConfiguration`] for a malformed or repeated class.
    /// - [`AllocError::AllocationError`] if an initial chunk cannot be mapped.
    pub fn build(classes: &[SizeClass], zero_on_touch: bool, allow_fallback: bool) -> Result<Self, AllocError> {
        let sorted = size_class::sorted_classes(classes)?;
        let pools = sorted
            .into_iter()
            .map(SizeClassPool::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            pools,
            zero_on_touch,
            allow_fallback,
            fallback: HashMap::new(),
            _thread_bound: PhantomData,
        })
    }

    /// # Errors
    ///
    /// Same as [`SlabAllocator::build`].
    pub fn with_config(config: &SlabAllocatorConfig) -> Result<Self, AllocError> {
        Self::build(&config.size_classes, config.zero_on_touch, config.allow_fallback)
    }

    #[must_use]
    pub fn zero_on_touch(&self) -> bool {
        self.zero_on_touch
    }

    #[must_use]
    pub fn allow_fallback(&self) -> bool {
        self.allow_fallback
    }

    /// The configured classes, ascending by slab size.
    #[must_use]
    pub fn size_classes(&self) -> Vec<SizeClass> {
        self.pools.iter().map(SizeClassPool::class).collect()
    }

    #[must_use]
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools
            .iter()
            .map(|p| PoolStats {
                slab_size: p.class().slab_size,
                slab_count: p.slab_count(),
                live_count: p.live_count(),
                free_count: p.free_count(),
                chunk_count: p.chunk_count(),
            })
            .collect()
    }

    /// Live slabs across every class plus live fallback blocks.
    #[must_use]
    pub fn live_slab_count(&self) -> u64 {
        self.pools.iter().map(SizeClassPool::live_count).sum::<u64>() + self.fallback.len() as u64
    }

    /// Smallest class whose slab size is at least `size`.
    fn class_index(&self, size: usize) -> Option<usize> {
        let index = self.pools.partition_point(|p| p.slab_size() < size);
        (index < self.pools.len()).then_some(index)
    }

    /// Allocates at least `size` bytes.
    ///
    /// The request is served by the smallest class that covers it, growing
    /// that class by one chunk if its free list is empty. Requests no class
    /// covers, or whose class cannot grow, go to the general-purpose
    /// allocator when fallback is enabled.
    ///
    /// # Errors
    ///
    /// With fallback disabled: [`AllocError::OutOfCapacity`] when no class
    /// covers `size` or the class is at its cap, and
    /// [`AllocError::AllocationError`] when the class could not map a chunk.
    /// With fallback enabled: [`AllocError::AllocationError`] when the
    /// general-purpose allocator fails too.
    pub fn allocate(&mut self, size: usize) -> Result<Handle, AllocError> {
        let slab = match self.class_index(size) {
            Some(index) => self.allocate_slab(index, size),
            None => Err(AllocError::OutOfCapacity { size }),
        };
        let mut handle = match slab {
            Ok(handle) => handle,
            Err(cause) if self.allow_fallback => self.allocate_fallback(size, &cause)?,
            Err(cause) => return Err(cause),
        };
        if self.zero_on_touch {
            // Safety: the region was just handed out and is valid for writes.
            unsafe { handle.zero() };
        }
        Ok(handle)
    }

    fn allocate_slab(&mut self, index: usize, size: usize) -> Result<Handle, AllocError> {
        let pool = &mut self.pools[index];
        let id = match pool.take_slot() {
            Some(id) => id,
            None => {
                pool.grow().map_err(|e| match e {
                    AllocError::OutOfCapacity { .. } => AllocError::OutOfCapacity { size },
                    e => e,
                })?;
                pool.take_slot().ok_or(AllocError::OutOfCapacity { size })?
            }
        };
        // At most MAX_SIZE_CLASSES pools, so the index fits below 255.
        let slot_id = SlotId::encode(index as u8, id);
        Ok(Handle::new(slot_id, pool.slot_ptr(id), pool.slab_size()))
    }

    fn allocate_fallback(&mut self, size: usize, cause: &AllocError) -> Result<Handle, AllocError> {
        log::trace!("serving {size} bytes from the general allocator ({cause})");
        self.fallback
            .try_reserve(1)
            .map_err(|_| vm::VmError::OutOfMemory { requested: size })?;
        let ptr = vm::heap_allocate(size)?;
        self.fallback.insert(ptr, size);
        stats::FALLBACK_BLOCKS_LIVE.add(1);
        stats::FALLBACK_BYTES_LIVE.add(size);
        Ok(Handle::new(SlotId::FALLBACK, ptr, size))
    }

    /// Checks that `handle` could have come from this allocator.
    ///
    /// A fallback block is accepted only if this allocator handed it out and
    /// it is still live. A released block is indistinguishable from a
    /// foreign one, so both are reported as [`AllocError::InvalidHandle`].
    ///
    /// # Panics
    ///
    /// Panics if the handle names a slab slot that is already free.
    fn check_handle(&self, handle: &Handle) -> Result<(), AllocError> {
        match handle.slot_id().decode() {
            SlotKind::Fallback => match self.fallback.get(&handle.as_ptr()) {
                Some(&len) if len == handle.len() => Ok(()),
                _ => Err(AllocError::InvalidHandle { slot_id: handle.slot_id().raw() }),
            },
            SlotKind::Slab { pool_index, relative } => {
                let raw = handle.slot_id().raw();
                let pool = self
                    .pools
                    .get(pool_index)
                    .ok_or(AllocError::InvalidHandle { slot_id: raw })?;
                pool.check_slot(relative, handle.as_ptr(), handle.len(), raw)
            }
        }
    }

    /// Returns a handle's region to its pool, or to the general-purpose
    /// allocator for fallback blocks.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidHandle`] if the handle does not name a
    /// slot of this allocator. Nothing is released in that case.
    ///
    /// # Panics
    ///
    /// Panics if the slot the handle names is already free.
    pub fn free(&mut self, mut handle: Handle) -> Result<(), AllocError> {
        self.check_handle(&handle)?;
        if self.zero_on_touch {
            // Safety: the region is still owned by the handle.
            unsafe { handle.zero() };
        }
        let (slot_id, ptr, len) = handle.into_raw_parts();
        match slot_id.decode() {
            SlotKind::Fallback => {
                self.fallback.remove(&ptr);
                // Safety: the block was handed out by heap_allocate(len) and is live.
                unsafe { vm::heap_release(ptr, len) };
                stats::sub_saturating(&stats::FALLBACK_BLOCKS_LIVE, 1);
                stats::sub_saturating(&stats::FALLBACK_BYTES_LIVE, len);
                Ok(())
            }
            SlotKind::Slab { pool_index, relative } => self.pools[pool_index].return_slot(relative),
        }
    }

    /// Moves the contents of `handle` into a region of `new_size` bytes.
    ///
    /// The first `min(handle.len(), new_size)` bytes are copied, the old
    /// region is freed, and `handle` is replaced by the new one.
    ///
    /// # Errors
    ///
    /// Returns the error of the failing step ([`SlabAllocator::free`]
    /// validation or [`SlabAllocator::allocate`]). On error `handle` is left
    /// untouched and stays valid.
    ///
    /// # Panics
    ///
    /// Panics if `handle` names a slot that is already free.
    pub fn reallocate(&mut self, handle: &mut Handle, new_size: usize) -> Result<(), AllocError> {
        self.check_handle(handle)?;
        let fresh = self.allocate(new_size)?;
        let count = handle.len().min(new_size);
        // Safety: both regions are live, distinct, and at least `count` bytes.
        unsafe { ptr::copy_nonoverlapping(handle.as_ptr().as_ptr(), fresh.as_ptr().as_ptr(), count) };
        let old = std::mem::replace(handle, fresh);
        self.free(old)
    }

    /// Releases every chunk and all pool bookkeeping.
    ///
    /// Outstanding slab handles dangle afterwards; outstanding fallback
    /// handles stay valid and can still be freed. Calling it again is a
    /// no-op.
    pub fn teardown(&mut self) {
        let live = self.pools.iter().map(SizeClassPool::live_count).sum::<u64>();
        if live > 0 {
            log::warn!("tearing down slab allocator with {live} live slabs");
        }
        self.pools = Vec::new();
    }
}

impl Drop for SlabAllocator {
    fn drop(&mut self) {
        self.teardown();
    }
}
