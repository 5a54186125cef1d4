//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., chunk bytes may briefly disagree with the live chunk
//! count). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Bytes mapped for slab chunks across every allocator instance
crate::sync::static_atomic! {
    pub static SLAB_CHUNK_BYTES: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static SLAB_CHUNKS_LIVE: Counter = Counter::new();
}

// Blocks served by the general-purpose allocator fallback
crate::sync::static_atomic! {
    pub static FALLBACK_BLOCKS_LIVE: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static FALLBACK_BYTES_LIVE: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

/// Process-wide snapshot of the diagnostic counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub slab_chunk_bytes: usize,
    pub slab_chunks_live: usize,
    pub fallback_blocks_live: usize,
    pub fallback_bytes_live: usize,
}

impl MemoryStats {
    #[must_use]
    pub fn snapshot() -> Self {
        Self {
            slab_chunk_bytes: SLAB_CHUNK_BYTES.get(),
            slab_chunks_live: SLAB_CHUNKS_LIVE.get(),
            fallback_blocks_live: FALLBACK_BLOCKS_LIVE.get(),
            fallback_bytes_live: FALLBACK_BYTES_LIVE.get(),
        }
    }
}
