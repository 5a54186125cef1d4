use super::chain::{self, Binding, ChainGuard};
use super::config;
use super::error::AllocError;
use super::handle::Handle;
use super::slab_allocator::SlabAllocator;
use crate::sync::{Arc, Mutex, OnceLock};
use std::sync::PoisonError;

struct SendAllocator(SlabAllocator);

// Safety: a SlabAllocator owns its chunks outright and holds no thread-local
// state; it is only ever reached through the mutex in `SharedAllocator`.
unsafe impl Send for SendAllocator {}

/// A [`SlabAllocator`] behind a mutex, usable from any thread.
///
/// Clones refer to the same allocator. Every operation takes the lock for
/// its own duration only.
#[derive(Clone)]
pub struct SharedAllocator {
    inner: Arc<Mutex<SendAllocator>>,
}

impl SharedAllocator {
    #[must_use]
    pub fn new(allocator: SlabAllocator) -> Self {
        Self { inner: Arc::new(Mutex::new(SendAllocator(allocator))) }
    }

    /// Runs `f` with the lock held.
    ///
    /// A lock poisoned by a panicking holder is recovered: the allocator is
    /// consistent between operations.
    pub fn with<R>(&self, f: impl FnOnce(&mut SlabAllocator) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard.0)
    }

    /// # Errors
    ///
    /// See [`SlabAllocator::allocate`].
    pub fn allocate(&self, size: usize) -> Result<Handle, AllocError> {
        self.with(|a| a.allocate(size))
    }

    /// # Errors
    ///
    /// See [`SlabAllocator::reallocate`].
    pub fn reallocate(&self, handle: &mut Handle, new_size: usize) -> Result<(), AllocError> {
        self.with(|a| a.reallocate(handle, new_size))
    }

    /// # Errors
    ///
    /// See [`SlabAllocator::free`].
    pub fn free(&self, handle: Handle) -> Result<(), AllocError> {
        self.with(|a| a.free(handle))
    }

    #[must_use]
    pub fn live_slab_count(&self) -> u64 {
        self.with(|a| a.live_slab_count())
    }
}

static GLOBAL_SYNC_ALLOCATOR: OnceLock<SharedAllocator> = OnceLock::new();

/// Process-wide shared allocator built from the process-wide defaults.
pub struct GlobalSyncAllocator;

impl GlobalSyncAllocator {
    /// Returns the global allocator, building it on first use.
    ///
    /// Concurrent first callers block until the single construction finishes.
    ///
    /// # Panics
    ///
    /// Panics if the allocator cannot be built (an initial chunk could not be
    /// mapped).
    pub fn get() -> &'static SharedAllocator {
        GLOBAL_SYNC_ALLOCATOR.get_or_init(|| match config::build_default_allocator() {
            Ok(allocator) => {
                log::debug!("built global synchronized slab allocator");
                SharedAllocator::new(allocator)
            }
            Err(e) => panic!("Failed to init GlobalSyncAllocator: {e}"),
        })
    }

    #[must_use]
    pub fn is_initialized() -> bool {
        GLOBAL_SYNC_ALLOCATOR.get().is_some()
    }

    /// Live slabs of the global allocator, 0 if it was never built.
    #[must_use]
    pub fn live_slab_count() -> u64 {
        GLOBAL_SYNC_ALLOCATOR.get().map_or(0, SharedAllocator::live_slab_count)
    }
}

/// Makes the global synchronized allocator active on this thread until the
/// guard is dropped.
///
/// # Panics
///
/// Panics if the thread already has
/// [`MAX_CHAIN_DEPTH`](crate::MAX_CHAIN_DEPTH) scopes active, or if the
/// global allocator cannot be built.
pub fn with_global_synchronized_allocator() -> ChainGuard {
    chain::push(Binding::Shared(GlobalSyncAllocator::get().clone()))
}
