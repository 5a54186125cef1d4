use thiserror::Error;

use super::vm::VmError;

/// Every recoverable failure the allocator surfaces.
///
/// Fatal conditions (scope stack overflow, a detected double free) panic
/// instead of returning one of these.
#[derive(Debug, Error)]
pub enum AllocError {
    /// A size-class descriptor set was rejected before anything was allocated.
    #[error("invalid allocator configuration: {0}")]
    InvalidConfiguration(String),

    /// The OS or the general-purpose allocator refused memory.
    #[error("allocation failed: {0}")]
    AllocationError(#[from] VmError),

    /// No slab was available and the fallback allocator is disabled.
    #[error("out of capacity for a {size}-byte request")]
    OutOfCapacity { size: usize },

    /// The handle does not name a slot of this allocator.
    #[error("invalid handle (slot id {slot_id:#018x})")]
    InvalidHandle { slot_id: u64 },

    /// More size classes were supplied than the handle encoding can address.
    #[error("{count} size classes supplied, at most {max} are supported", max = super::size_class::MAX_SIZE_CLASSES)]
    TooManyClasses { count: usize },

    /// The process-wide defaults cannot change once a default allocator exists.
    #[error("default allocator configuration is frozen once a default allocator has been built")]
    DefaultsFrozen,
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            AllocError::OutOfCapacity { size: 33 }.to_string(),
            "out of capacity for a 33-byte request"
        );
        assert_eq!(
            AllocError::InvalidHandle { slot_id: u64::MAX }.to_string(),
            "invalid handle (slot id 0xffffffffffffffff)"
        );
        assert_eq!(
            AllocError::TooManyClasses { count: 300 }.to_string(),
            "300 size classes supplied, at most 255 are supported"
        );
    }

    #[test]
    fn test_vm_error_is_source() {
        let err = AllocError::from(VmError::OutOfMemory { requested: 8 });
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "general allocator could not provide 8 bytes");
    }
}
