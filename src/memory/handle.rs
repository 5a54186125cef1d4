use std::fmt;
use std::ptr::NonNull;

/// Bit position of the pool index inside a [`SlotId`].
pub const POOL_INDEX_SHIFT: u32 = 56;

/// Mask selecting the pool-relative slot number inside a [`SlotId`].
pub const RELATIVE_ID_MASK: u64 = (1 << POOL_INDEX_SHIFT) - 1;

/// Packed identity of an allocation: pool index in the high byte, the slot
/// number relative to that pool in the low 56 bits.
///
/// Blocks served by the general-purpose allocator carry [`SlotId::FALLBACK`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u64);

/// Result of decoding a [`SlotId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotKind {
    Fallback,
    Slab { pool_index: usize, relative: u64 },
}

impl SlotId {
    pub const FALLBACK: SlotId = SlotId(u64::MAX);

    /// Packs a pool index and a pool-relative slot number.
    ///
    /// Bits of `relative` above [`RELATIVE_ID_MASK`] are discarded. Pool
    /// index 255 is never produced by an allocator, so the result cannot
    /// equal [`SlotId::FALLBACK`] for a real slot.
    #[must_use]
    pub const fn encode(pool_index: u8, relative: u64) -> Self {
        Self((relative & RELATIVE_ID_MASK) | ((pool_index as u64) << POOL_INDEX_SHIFT))
    }

    #[must_use]
    pub const fn decode(self) -> SlotKind {
        if self.0 == Self::FALLBACK.0 {
            return SlotKind::Fallback;
        }
        SlotKind::Slab {
            pool_index: (self.0 >> POOL_INDEX_SHIFT) as usize,
            relative: self.0 & RELATIVE_ID_MASK,
        }
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_fallback(self) -> bool {
        self.0 == Self::FALLBACK.0
    }

    /// Pool-relative slot number, `None` for fallback blocks.
    #[must_use]
    pub const fn relative(self) -> Option<u64> {
        match self.decode() {
            SlotKind::Slab { relative, .. } => Some(relative),
            SlotKind::Fallback => None,
        }
    }

    /// Index of the size class in its allocator, `None` for fallback blocks.
    #[must_use]
    pub const fn pool_index(self) -> Option<usize> {
        match self.decode() {
            SlotKind::Slab { pool_index, .. } => Some(pool_index),
            SlotKind::Fallback => None,
        }
    }
}

impl fmt::Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            SlotKind::Fallback => f.write_str("SlotId(fallback)"),
            SlotKind::Slab { pool_index, relative } => write!(f, "SlotId({pool_index}:{relative})"),
        }
    }
}

/// An owned allocation: the region `pointer..pointer + len` belongs to the
/// holder until the handle is passed back to `free`.
///
/// Handles are move-only. For slab allocations `len` is the slab size of the
/// class (at least the requested size); for fallback blocks it is exactly the
/// requested size.
#[derive(Debug)]
pub struct Handle {
    slot_id: SlotId,
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: a handle is the sole owner of its region; moving it to another
// thread moves that ownership. Freeing it still goes through an allocator
// that serialises access to its pools.
unsafe impl Send for Handle {}

impl Handle {
    pub(crate) fn new(slot_id: SlotId, ptr: NonNull<u8>, len: usize) -> Self {
        Self { slot_id, ptr, len }
    }

    #[must_use]
    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    #[must_use]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.slot_id.is_fallback()
    }

    /// # Safety
    /// The allocator that produced this handle must still be alive (not torn
    /// down or dropped).
    #[must_use]
    pub unsafe fn as_slice(&self) -> &[u8] {
        // Safety: the region is owned by this handle; liveness upheld by caller.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// # Safety
    /// The allocator that produced this handle must still be alive (not torn
    /// down or dropped).
    #[must_use]
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: the region is owned by this handle; liveness upheld by caller.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Splits the handle into its parts without freeing anything.
    #[must_use]
    pub fn into_raw_parts(self) -> (SlotId, NonNull<u8>, usize) {
        (self.slot_id, self.ptr, self.len)
    }

    /// Rebuilds a handle from [`Handle::into_raw_parts`].
    ///
    /// # Safety
    /// The parts must come from a single `into_raw_parts` call and the handle
    /// must not be rebuilt more than once. Allocators detect forged slot ids
    /// where they can, but not every misuse is caught.
    #[must_use]
    pub unsafe fn from_raw_parts(slot_id: SlotId, ptr: NonNull<u8>, len: usize) -> Self {
        Self { slot_id, ptr, len }
    }

    /// # Safety
    /// The region must still be valid for writes.
    pub(crate) unsafe fn zero(&mut self) {
        // Safety: upheld by caller.
        unsafe { self.ptr.as_ptr().write_bytes(0, self.len) };
    }
}
