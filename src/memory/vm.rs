use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;

/// Alignment of blocks handed out by the general-purpose allocator fallback.
pub(crate) const FALLBACK_ALIGN: usize = 16;

#[derive(Debug)]
pub enum VmError {
    ReservationFailed(std::io::Error),
    CommitFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    OutOfMemory { requested: usize },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ReservationFailed(e) => write!(f, "VM reservation failed: {e}"),
            VmError::CommitFailed(e) => write!(f, "VM commit failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
            VmError::OutOfMemory { requested } => {
                write!(f, "general allocator could not provide {requested} bytes")
            }
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReservationFailed(e) | VmError::CommitFailed(e) | VmError::ReleaseFailed(e) => Some(e),
            VmError::OutOfMemory { .. } => None,
        }
    }
}

/// Abstract interface for the OS memory a size-class pool grows into.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size (default/minimum).
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other("mmap returned null"))),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            // Safety: FFI call to madvise.
            unsafe {
                // Chunks are carved into slabs right away; skip the minor faults.
                libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_WILLNEED)
            };

            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(raw > 0, "sysconf(_SC_PAGESIZE) failed: {}", io::Error::last_os_error());
                // SAFETY/PORTABILITY: this crate supports only 64-bit targets; page size fits in
                // usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Heap mock: heap-backed VmOps (no real mmap)
//
// Used under `cfg(loom)` (loom runs inside a single OS process with its own
// scheduler), under Miri (no FFI), and on targets without the unix mapping
// calls. Every "reservation" is a plain heap block; `commit` is a no-op.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri, not(any(target_os = "macos", target_os = "linux"))))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // heap memory is always accessible
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

/// Reserve and commit `size` bytes (rounded up to whole pages) in one step.
///
/// Returns the base pointer and the mapped length, which is what
/// [`unmap_chunk`] must be called with.
pub(crate) fn map_chunk(size: usize) -> Result<(NonNull<u8>, usize), VmError> {
    #[cfg(test)]
    if fault::take(&fault::CHUNK_FAILURES) {
        return Err(VmError::ReservationFailed(std::io::Error::new(
            std::io::ErrorKind::OutOfMemory,
            "injected chunk failure",
        )));
    }

    let mapped = size.next_multiple_of(PlatformVmOps::page_size());
    // Safety: reserve has no preconditions beyond a sane size.
    let base = unsafe { PlatformVmOps::reserve(mapped)? };
    // Safety: `base..base + mapped` was just reserved.
    if let Err(e) = unsafe { PlatformVmOps::commit(base, mapped) } {
        // Safety: same reservation, not yet handed out.
        if let Err(release) = unsafe { PlatformVmOps::release(base, mapped) } {
            log::warn!("failed to release chunk after commit failure: {release}");
        }
        return Err(e);
    }
    Ok((base, mapped))
}

/// Release a chunk obtained from [`map_chunk`].
///
/// # Safety
/// `base`/`mapped` must come from one successful [`map_chunk`] call and no
/// pointer into the chunk may be used afterwards.
pub(crate) unsafe fn unmap_chunk(base: NonNull<u8>, mapped: usize) {
    // Safety: upheld by caller.
    if let Err(e) = unsafe { PlatformVmOps::release(base, mapped) } {
        log::warn!("failed to release {mapped}-byte chunk: {e}");
    }
}

fn heap_layout(size: usize) -> Result<Layout, VmError> {
    Layout::from_size_align(size.max(1), FALLBACK_ALIGN).map_err(|_| VmError::OutOfMemory { requested: size })
}

/// Obtain `size` bytes from the general-purpose allocator.
///
/// Zero-sized requests are backed by a one-byte block so the pointer stays
/// unique and can be released through [`heap_release`] with the same size.
pub(crate) fn heap_allocate(size: usize) -> Result<NonNull<u8>, VmError> {
    #[cfg(test)]
    if fault::take(&fault::HEAP_FAILURES) {
        return Err(VmError::OutOfMemory { requested: size });
    }

    let layout = heap_layout(size)?;
    // Safety: layout has non-zero size.
    let ptr = unsafe { std::alloc::alloc(layout) };
    NonNull::new(ptr).ok_or(VmError::OutOfMemory { requested: size })
}

/// Return a block obtained from [`heap_allocate`].
///
/// # Safety
/// `ptr` must come from `heap_allocate(size)` with the same `size` and must
/// not be used afterwards.
pub(crate) unsafe fn heap_release(ptr: NonNull<u8>, size: usize) {
    match heap_layout(size) {
        // Safety: same layout as the allocation, upheld by caller.
        Ok(layout) => unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) },
        Err(e) => log::warn!("leaking fallback block: {e}"),
    }
}
