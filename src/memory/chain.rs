//! Per-thread stack of allocator scopes.
//!
//! [`allocate`], [`reallocate`] and [`free`] use whichever allocator sits on
//! top of the calling thread's stack. Scopes are pushed with
//! [`with_allocator`], [`with_shared_allocator`] or
//! [`with_global_synchronized_allocator`](crate::with_global_synchronized_allocator)
//! and popped when the returned [`ChainGuard`] is dropped. With an empty
//! stack the thread's default allocator is used; it is built on first use
//! from the process-wide defaults and released when the thread exits.

use super::config;
use super::error::AllocError;
use super::global::SharedAllocator;
use super::handle::Handle;
use super::slab_allocator::SlabAllocator;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

/// Deepest allowed nesting of allocator scopes on one thread.
pub const MAX_CHAIN_DEPTH: usize = 100;

/// A [`SlabAllocator`] usable from a single thread, cheap to clone.
///
/// Clones refer to the same allocator.
#[derive(Clone)]
pub struct LocalAllocator(Rc<RefCell<SlabAllocator>>);

impl LocalAllocator {
    #[must_use]
    pub fn new(allocator: SlabAllocator) -> Self {
        Self(Rc::new(RefCell::new(allocator)))
    }

    /// Runs `f` with exclusive access to the allocator.
    ///
    /// # Panics
    ///
    /// Panics if called again from inside `f` for the same allocator.
    pub fn with<R>(&self, f: impl FnOnce(&mut SlabAllocator) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }

    #[must_use]
    pub fn live_slab_count(&self) -> u64 {
        self.0.borrow().live_slab_count()
    }
}

impl From<SlabAllocator> for LocalAllocator {
    fn from(allocator: SlabAllocator) -> Self {
        Self::new(allocator)
    }
}

#[derive(Clone)]
pub(crate) enum Binding {
    Local(LocalAllocator),
    Shared(SharedAllocator),
}

impl Binding {
    fn with<R>(&self, f: impl FnOnce(&mut SlabAllocator) -> R) -> R {
        match self {
            Binding::Local(a) => a.with(f),
            // The lock is held for this one operation only.
            Binding::Shared(a) => a.with(f),
        }
    }
}

struct ChainEntry {
    binding: Binding,
    token: u64,
}

struct ChainState {
    entries: Vec<ChainEntry>,
    next_token: u64,
    default: Option<LocalAllocator>,
}

impl ChainState {
    const fn new() -> Self {
        Self { entries: Vec::new(), next_token: 0, default: None }
    }

    fn push(&mut self, binding: Binding) -> ChainGuard {
        assert!(
            self.entries.len() < MAX_CHAIN_DEPTH,
            "too many nested allocator scopes (limit {MAX_CHAIN_DEPTH})"
        );
        let token = self.next_token;
        self.next_token += 1;
        let depth = self.entries.len();
        self.entries.push(ChainEntry { binding, token });
        ChainGuard { depth, token, _not_send: PhantomData }
    }

    /// Drops the entry a guard pushed plus anything pushed after it.
    /// Does nothing if that entry is already gone.
    fn pop(&mut self, depth: usize, token: u64) {
        if self.entries.get(depth).is_some_and(|e| e.token == token) {
            self.entries.truncate(depth);
        }
    }

    fn active(&mut self) -> Result<Binding, AllocError> {
        if let Some(top) = self.entries.last() {
            return Ok(top.binding.clone());
        }
        if let Some(default) = &self.default {
            return Ok(Binding::Local(default.clone()));
        }
        let default = LocalAllocator::new(config::build_default_allocator()?);
        log::debug!("built default slab allocator for thread {:?}", std::thread::current().id());
        self.default = Some(default.clone());
        Ok(Binding::Local(default))
    }
}

thread_local! {
    static CHAIN: RefCell<ChainState> = const { RefCell::new(ChainState::new()) };
}

/// Keeps an allocator scope active; dropping it restores the previous one.
///
/// A guard only ever pops the entry it pushed. Dropping an outer guard
/// before an inner one ends both scopes.
#[must_use = "dropping the guard ends the allocator scope immediately"]
#[derive(Debug)]
pub struct ChainGuard {
    depth: usize,
    token: u64,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ChainGuard {
    fn drop(&mut self) {
        // The thread may be tearing down its locals already.
        let _ = CHAIN.try_with(|chain| chain.borrow_mut().pop(self.depth, self.token));
    }
}

pub(crate) fn push(binding: Binding) -> ChainGuard {
    CHAIN.with(|chain| chain.borrow_mut().push(binding))
}

/// Makes `allocator` the active allocator of this thread until the guard
/// is dropped.
///
/// # Panics
///
/// Panics if the thread already has [`MAX_CHAIN_DEPTH`] scopes active.
pub fn with_allocator(allocator: &LocalAllocator) -> ChainGuard {
    push(Binding::Local(allocator.clone()))
}

/// Like [`with_allocator`] for an allocator shared between threads. Its
/// lock is taken once per allocator call, not for the whole scope.
///
/// # Panics
///
/// Panics if the thread already has [`MAX_CHAIN_DEPTH`] scopes active.
pub fn with_shared_allocator(allocator: &SharedAllocator) -> ChainGuard {
    push(Binding::Shared(allocator.clone()))
}

fn with_active<R>(f: impl FnOnce(&mut SlabAllocator) -> Result<R, AllocError>) -> Result<R, AllocError> {
    let binding = CHAIN.with(|chain| chain.borrow_mut().active())?;
    binding.with(f)
}

/// Allocates from the active allocator. See [`SlabAllocator::allocate`].
///
/// # Errors
///
/// Whatever the active allocator returns, or the error that prevented the
/// thread's default allocator from being built.
pub fn allocate(size: usize) -> Result<Handle, AllocError> {
    with_active(|a| a.allocate(size))
}

/// Reallocates through the active allocator. See [`SlabAllocator::reallocate`].
///
/// The handle must belong to the active allocator.
///
/// # Errors
///
/// As [`allocate`]; `handle` is untouched on error.
pub fn reallocate(handle: &mut Handle, new_size: usize) -> Result<(), AllocError> {
    with_active(|a| a.reallocate(handle, new_size))
}

/// Frees through the active allocator. See [`SlabAllocator::free`].
///
/// The handle must belong to the active allocator.
///
/// # Errors
///
/// [`AllocError::InvalidHandle`] when the active allocator does not own the
/// handle's slot.
pub fn free(handle: Handle) -> Result<(), AllocError> {
    with_active(|a| a.free(handle))
}

/// Number of scopes currently pushed on this thread.
#[must_use]
pub fn chain_depth() -> usize {
    CHAIN.with(|chain| chain.borrow().entries.len())
}

/// Whether the top scope is a shared (lock-guarded) allocator.
#[must_use]
pub fn active_is_shared() -> bool {
    CHAIN.with(|chain| matches!(chain.borrow().entries.last(), Some(ChainEntry { binding: Binding::Shared(_), .. })))
}

/// Live slabs of this thread's default allocator, 0 if it was never built.
#[must_use]
pub fn default_live_slab_count() -> u64 {
    CHAIN.with(|chain| chain.borrow().default.as_ref().map_or(0, LocalAllocator::live_slab_count))
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::size_class::SizeClass;

    fn local(sizes: &[u32]) -> LocalAllocator {
        let classes: Vec<SizeClass> = sizes.iter().map(|&s| SizeClass::new(s, 8, 0, 64)).collect();
        SlabAllocator::build(&classes, false, true).unwrap().into()
    }

    #[test]
    fn test_chain_scope_nesting() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let a = local(&[8]);
        let b = local(&[24]);
        let c = local(&[40]);

        let _ga = with_allocator(&a);
        let h = allocate(5).unwrap();
        assert_eq!(h.len(), 8);
        free(h).unwrap();
        {
            let _gb = with_allocator(&b);
            let h = allocate(5).unwrap();
            assert_eq!(h.len(), 24);
            assert_eq!(b.live_slab_count(), 1);
            {
                let _gc = with_allocator(&c);
                assert_eq!(chain_depth(), 3);
                let h = allocate(5).unwrap();
                assert_eq!(h.len(), 40);
                free(h).unwrap();
            }
            assert_eq!(chain_depth(), 2);
            free(h).unwrap();
        }
        let h = allocate(5).unwrap();
        assert_eq!(h.len(), 8);
        free(h).unwrap();

        for alloc in [&a, &b, &c] {
            assert_eq!(alloc.live_slab_count(), 0);
        }
    }

    /// Runs `f` on a fresh thread so its default allocator is gone (chunks
    /// unmapped) before the test releases `TEST_MUTEX`.
    fn on_fresh_thread(f: impl FnOnce() + Send + 'static) {
        std::thread::spawn(f).join().unwrap();
    }

    #[test]
    fn test_chain_empty_stack_uses_default() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        on_fresh_thread(|| {
            assert_eq!(chain_depth(), 0);
            assert!(!active_is_shared());
            assert_eq!(default_live_slab_count(), 0);

            let h = allocate(100).unwrap();
            assert!(h.len() >= 100);
            assert_eq!(default_live_slab_count(), 1);
            free(h).unwrap();
            assert_eq!(default_live_slab_count(), 0);
        });
    }

    #[test]
    fn test_chain_default_is_per_thread() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        on_fresh_thread(|| {
            let h = allocate(16).unwrap();
            assert_eq!(default_live_slab_count(), 1);

            on_fresh_thread(|| {
                assert_eq!(default_live_slab_count(), 0);
                let h = allocate(16).unwrap();
                assert_eq!(default_live_slab_count(), 1);
                free(h).unwrap();
            });

            assert_eq!(default_live_slab_count(), 1);
            free(h).unwrap();
        });
    }

    #[test]
    fn test_chain_reallocate_uses_active_scope() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let a = local(&[8, 64]);
        let _g = with_allocator(&a);
        let mut h = allocate(8).unwrap();
        // Safety: Test code.
        unsafe { h.as_mut_slice().copy_from_slice(b"chainage") };

        reallocate(&mut h, 50).unwrap();
        assert_eq!(h.len(), 64);
        // Safety: Test code.
        assert_eq!(&unsafe { h.as_slice() }[..8], b"chainage");
        assert_eq!(a.live_slab_count(), 1);

        free(h).unwrap();
        assert_eq!(a.live_slab_count(), 0);
    }

    #[test]
    fn test_chain_guard_dropped_out_of_order() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let a = local(&[8]);
        let b = local(&[16]);
        let c = local(&[32]);

        let ga = with_allocator(&a);
        let gb = with_allocator(&b);
        drop(ga);
        assert_eq!(chain_depth(), 0);

        // The stale inner guard must not pop the new scope.
        let gc = with_allocator(&c);
        drop(gb);
        assert_eq!(chain_depth(), 1);
        let h = allocate(1).unwrap();
        assert_eq!(h.len(), 32);
        free(h).unwrap();
        drop(gc);
        assert_eq!(chain_depth(), 0);
    }

    #[test]
    fn test_chain_leaked_guard_is_harmless() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        on_fresh_thread(|| {
            let a = local(&[8]);
            std::mem::forget(with_allocator(&a));
            assert_eq!(chain_depth(), 1);
            let outer = with_allocator(&a);
            drop(outer);
            assert_eq!(chain_depth(), 1);
            // The leaked entry keeps its allocator alive.
            drop(a);
            let h = allocate(4).unwrap();
            assert_eq!(h.len(), 8);
            free(h).unwrap();
        });
    }

    #[test]
    #[should_panic(expected = "too many nested allocator scopes")]
    fn test_chain_depth_limit() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let a = local(&[8]);
        let guards: Vec<ChainGuard> = (0..MAX_CHAIN_DEPTH).map(|_| with_allocator(&a)).collect();
        assert_eq!(chain_depth(), MAX_CHAIN_DEPTH);
        let _one_too_many = with_allocator(&a);
        drop(guards);
    }

    #[test]
    fn test_chain_depth_limit_is_reusable() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let a = local(&[8]);
        for _ in 0..3 {
            let guards: Vec<ChainGuard> = (0..MAX_CHAIN_DEPTH).map(|_| with_allocator(&a)).collect();
            assert_eq!(chain_depth(), MAX_CHAIN_DEPTH);
            // Dropping a Vec drops front to back; the first guard ends every scope.
            drop(guards);
            assert_eq!(chain_depth(), 0);
        }
    }

    #[test]
    fn test_chain_shared_scope() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let shared = SharedAllocator::new(SlabAllocator::build(&[SizeClass::new(16, 4, 0, 16)], false, true).unwrap());
        let _g = with_shared_allocator(&shared);
        assert!(active_is_shared());
        let h = allocate(10).unwrap();
        assert_eq!(h.len(), 16);
        assert_eq!(shared.live_slab_count(), 1);
        free(h).unwrap();
        assert_eq!(shared.live_slab_count(), 0);
    }

    #[test]
    fn test_chain_free_foreign_handle() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let a = local(&[8]);
        let b = local(&[8, 16]);
        let h = {
            let _g = with_allocator(&b);
            allocate(16).unwrap()
        };
        let _g = with_allocator(&a);
        assert!(matches!(free(h), Err(AllocError::InvalidHandle { .. })));
        assert_eq!(a.live_slab_count(), 0);

        // Fallback blocks are checked against the allocator that served them.
        let from_b = {
            let _g = with_allocator(&b);
            allocate(100).unwrap()
        };
        let from_a = allocate(100).unwrap();
        assert!(from_a.is_fallback() && from_b.is_fallback());
        let (id, ptr, len) = from_b.into_raw_parts();
        // Safety: Test code.
        let foreign = unsafe { Handle::from_raw_parts(id, ptr, len) };
        assert!(matches!(free(foreign), Err(AllocError::InvalidHandle { .. })));
        assert_eq!(a.live_slab_count(), 1);
        assert_eq!(b.live_slab_count(), 1);

        free(from_a).unwrap();
        assert_eq!(a.live_slab_count(), 0);
        let _inner = with_allocator(&b);
        // Safety: Test code.
        free(unsafe { Handle::from_raw_parts(id, ptr, len) }).unwrap();
        assert_eq!(b.live_slab_count(), 0);
    }
}
