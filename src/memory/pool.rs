use super::error::AllocError;
use super::size_class::SizeClass;
use super::stats;
use super::vm::{self, VmError};
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// Free-list terminator.
pub(crate) const FREE_LIST_END: u64 = u64::MAX;

/// One contiguous run of slabs obtained from the OS in a single request.
struct Chunk {
    base: NonNull<u8>,
    mapped: usize,
}

impl Chunk {
    fn map(bytes: usize) -> Result<Self, VmError> {
        let (base, mapped) = vm::map_chunk(bytes)?;
        stats::SLAB_CHUNK_BYTES.add(mapped);
        stats::SLAB_CHUNKS_LIVE.add(1);
        Ok(Self { base, mapped })
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // Safety: the chunk came from `map_chunk` and its pool is going away.
        unsafe { vm::unmap_chunk(self.base, self.mapped) };
        stats::sub_saturating(&stats::SLAB_CHUNK_BYTES, self.mapped);
        stats::sub_saturating(&stats::SLAB_CHUNKS_LIVE, 1);
    }
}

/// Slabs of a single size class, grown chunk by chunk.
///
/// Slot `r` lives in chunk `r / growth_increment` at offset
/// `(r % growth_increment) * slab_size`. Every chunk but the last holds
/// exactly `growth_increment` slabs.
///
/// The free list is threaded through `next` (indexed by slot number) rather
/// than through the slab bytes, so freeing a slab never overwrites what the
/// caller left in it.
pub(crate) struct SizeClassPool {
    class: SizeClass,
    chunks: Vec<Chunk>,
    next: Vec<u64>,
    free_head: u64,
    /// Tracks which slots are currently handed out
    live_mask: FixedBitSet,
    live_count: u64,
}

impl SizeClassPool {
    /// Creates the pool and maps its initial chunks.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::AllocationError`] if an initial chunk cannot be
    /// mapped. Chunks mapped before the failure are released.
    pub(crate) fn new(class: SizeClass) -> Result<Self, AllocError> {
        let mut pool = Self {
            class,
            chunks: Vec::new(),
            next: Vec::new(),
            free_head: FREE_LIST_END,
            live_mask: FixedBitSet::new(),
            live_count: 0,
        };
        for _ in 0..class.initial_chunks {
            pool.grow()?;
        }
        Ok(pool)
    }

    pub(crate) fn class(&self) -> SizeClass {
        self.class
    }

    pub(crate) fn slab_size(&self) -> usize {
        self.class.slab_size as usize
    }

    pub(crate) fn slab_count(&self) -> u64 {
        self.next.len() as u64
    }

    pub(crate) fn live_count(&self) -> u64 {
        self.live_count
    }

    pub(crate) fn free_count(&self) -> u64 {
        self.slab_count() - self.live_count
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Adds one chunk of slabs to the pool and pushes them on the free list.
    ///
    /// The new slabs are linked in ascending order, the last one pointing at
    /// the previous free-list head.
    ///
    /// # Errors
    ///
    /// - [`AllocError::OutOfCapacity`] when `max_slab_count` is reached.
    /// - [`AllocError::AllocationError`] when the chunk or its bookkeeping
    ///   cannot be obtained. The pool is unchanged on any error.
    pub(crate) fn grow(&mut self) -> Result<(), AllocError> {
        let current = self.slab_count();
        let cap = u64::from(self.class.max_slab_count);
        if current >= cap {
            log::debug!("size class {}: slab cap {cap} reached", self.class.slab_size);
            return Err(AllocError::OutOfCapacity { size: self.slab_size() });
        }
        let added = u64::from(self.class.growth_increment).min(cap - current);
        // Bounded by the u32 growth increment.
        let added_slabs = added as usize;
        let bytes = added_slabs
            .checked_mul(self.slab_size())
            .ok_or(VmError::OutOfMemory { requested: usize::MAX })?;

        self.chunks
            .try_reserve(1)
            .map_err(|_| VmError::OutOfMemory { requested: size_of::<Chunk>() })?;
        self.next
            .try_reserve(added_slabs)
            .map_err(|_| VmError::OutOfMemory { requested: added_slabs * size_of::<u64>() })?;
        let chunk = Chunk::map(bytes)?;

        log::debug!(
            "size class {}: growing by {added} slabs ({} bytes mapped), {} total",
            self.class.slab_size,
            chunk.mapped,
            current + added
        );

        self.chunks.push(chunk);
        let end = current + added;
        self.next.extend(current + 1..end);
        self.next.push(self.free_head);
        self.free_head = current;
        self.live_mask.grow(self.next.len());
        Ok(())
    }

    /// Pops the free-list head. `None` when the free list is empty.
    pub(crate) fn take_slot(&mut self) -> Option<u64> {
        if self.free_head == FREE_LIST_END {
            return None;
        }
        let id = self.free_head;
        let index = id as usize;
        self.free_head = self.next[index];
        self.live_mask.insert(index);
        self.live_count += 1;
        Some(id)
    }

    /// Checks that `id` names a live slot of this pool located at `ptr`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidHandle`] if `id` is beyond the pool or
    /// `ptr`/`len` do not describe that slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not live (double free).
    pub(crate) fn check_slot(&self, id: u64, ptr: NonNull<u8>, len: usize, slot_id: u64) -> Result<(), AllocError> {
        if id >= self.slab_count() || len != self.slab_size() || self.slot_ptr(id) != ptr {
            return Err(AllocError::InvalidHandle { slot_id });
        }
        assert!(
            self.live_mask.contains(id as usize),
            "double free detected in size class {}: slot {id}",
            self.class.slab_size
        );
        Ok(())
    }

    /// Pushes `id` back on the free-list head.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidHandle`] if `id` is beyond the pool.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already free (double free).
    pub(crate) fn return_slot(&mut self, id: u64) -> Result<(), AllocError> {
        if id >= self.slab_count() {
            return Err(AllocError::InvalidHandle { slot_id: id });
        }
        let index = id as usize;
        assert!(
            self.live_mask.contains(index),
            "double free detected in size class {}: slot {id}",
            self.class.slab_size
        );
        self.live_mask.set(index, false);
        self.next[index] = self.free_head;
        self.free_head = id;
        self.live_count -= 1;
        Ok(())
    }

    /// Address of slot `id`. `id` must be below `slab_count()`.
    pub(crate) fn slot_ptr(&self, id: u64) -> NonNull<u8> {
        let growth = u64::from(self.class.growth_increment);
        let chunk = &self.chunks[(id / growth) as usize];
        let offset = (id % growth) as usize * self.slab_size();
        debug_assert!(offset + self.slab_size() <= chunk.mapped);
        // Safety: offset is within the chunk mapping (every chunk holds at
        // least `id % growth + 1` slabs for an id below slab_count).
        unsafe { chunk.base.add(offset) }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::vm::fault;

    fn pool(slab: u32, growth: u32, initial: u32, max: u32) -> SizeClassPool {
        SizeClassPool::new(SizeClass::new(slab, growth, initial, max)).unwrap()
    }

    #[test]
    fn test_pool_empty_until_grown() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut p = pool(16, 4, 0, 8);
        assert_eq!(p.slab_count(), 0);
        assert_eq!(p.take_slot(), None);

        p.grow().unwrap();
        assert_eq!(p.slab_count(), 4);
        assert_eq!(p.free_count(), 4);
        assert_eq!(p.chunk_count(), 1);
    }

    #[test]
    fn test_pool_ascending_ids() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut p = pool(16, 20, 1, 45);
        let ids: Vec<u64> = std::iter::from_fn(|| p.take_slot()).collect();
        assert_eq!(ids, (0..20).collect::<Vec<_>>());

        p.grow().unwrap();
        p.grow().unwrap();
        let ids: Vec<u64> = std::iter::from_fn(|| p.take_slot()).collect();
        assert_eq!(ids, (20..45).collect::<Vec<_>>());
        assert_eq!(p.chunk_count(), 3);
        assert_eq!(p.slab_count(), 45);
        assert!(matches!(p.grow(), Err(AllocError::OutOfCapacity { size: 16 })));
    }

    #[test]
    fn test_pool_lifo_reuse() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut p = pool(32, 8, 1, 8);
        let a = p.take_slot().unwrap();
        let b = p.take_slot().unwrap();
        assert_eq!((a, b), (0, 1));

        p.return_slot(a).unwrap();
        assert_eq!(p.take_slot(), Some(a));

        p.return_slot(b).unwrap();
        p.return_slot(a).unwrap();
        assert_eq!(p.take_slot(), Some(a));
        assert_eq!(p.take_slot(), Some(b));
        assert_eq!(p.take_slot(), Some(2));
    }

    #[test]
    fn test_pool_grow_links_old_free_list() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut p = pool(8, 2, 1, 10);
        let a = p.take_slot().unwrap();
        p.return_slot(a).unwrap();
        // Free list is [0, 1]; growing puts [2, 3] in front of it.
        p.grow().unwrap();
        let ids: Vec<u64> = std::iter::from_fn(|| p.take_slot()).collect();
        assert_eq!(ids, [2, 3, 0, 1]);
    }

    #[test]
    fn test_pool_slot_addresses() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut p = pool(48, 3, 2, 6);
        let ids: Vec<u64> = std::iter::from_fn(|| p.take_slot()).collect();
        assert_eq!(ids.len(), 6);
        for pair in ids.windows(2).take(2) {
            let gap = p.slot_ptr(pair[1]).as_ptr() as usize - p.slot_ptr(pair[0]).as_ptr() as usize;
            assert_eq!(gap, 48);
        }
        // Slots are writable across their whole width.
        for &id in &ids {
            // Safety: Test code.
            unsafe { p.slot_ptr(id).as_ptr().write_bytes(0xEE, 48) };
        }
    }

    #[test]
    fn test_pool_partial_last_chunk() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut p = pool(64, 4, 0, 6);
        p.grow().unwrap();
        p.grow().unwrap();
        assert_eq!(p.slab_count(), 6);
        assert_eq!(p.chunk_count(), 2);
        let last = p.slot_ptr(5);
        // Safety: Test code.
        unsafe { last.as_ptr().write_bytes(1, 64) };
    }

    #[test]
    fn test_pool_grow_failure_leaves_pool_unchanged() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut p = pool(16, 4, 1, 16);
        let taken = p.take_slot().unwrap();

        fault::fail_next_chunks(1);
        assert!(matches!(p.grow(), Err(AllocError::AllocationError(_))));
        assert_eq!(p.slab_count(), 4);
        assert_eq!(p.chunk_count(), 1);
        assert_eq!(p.live_count(), 1);
        assert_eq!(p.take_slot(), Some(1));

        p.return_slot(taken).unwrap();
        p.grow().unwrap();
        assert_eq!(p.slab_count(), 8);
    }

    #[test]
    fn test_pool_initial_chunk_failure() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        fault::fail_next_chunks(1);
        let result = SizeClassPool::new(SizeClass::new(16, 4, 2, 16));
        assert!(matches!(result, Err(AllocError::AllocationError(_))));
    }

    #[test]
    fn test_pool_return_out_of_range() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut p = pool(16, 4, 1, 4);
        assert!(matches!(p.return_slot(4), Err(AllocError::InvalidHandle { slot_id: 4 })));
    }

    #[test]
    fn test_pool_check_slot() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut p = pool(16, 4, 1, 4);
        let id = p.take_slot().unwrap();
        let ptr = p.slot_ptr(id);
        assert!(p.check_slot(id, ptr, 16, id).is_ok());
        assert!(p.check_slot(id, ptr, 8, id).is_err());
        assert!(p.check_slot(id, p.slot_ptr(1), 16, id).is_err());
        assert!(p.check_slot(9, ptr, 16, 9).is_err());
    }

    #[test]
    #[should_panic(expected = "double free detected")]
    fn test_pool_double_free_panics() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut p = pool(16, 4, 1, 4);
        let id = p.take_slot().unwrap();
        p.return_slot(id).unwrap();
        let _ = p.return_slot(id);
    }

    #[test]
    fn test_pool_chunks_tracked_in_stats() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let before = stats::SLAB_CHUNKS_LIVE.get();
        {
            let p = pool(16, 4, 3, 16);
            assert_eq!(p.chunk_count(), 3);
            assert_eq!(stats::SLAB_CHUNKS_LIVE.get(), before + 3);
        }
        assert_eq!(stats::SLAB_CHUNKS_LIVE.get(), before);
    }
}
