//! Process-wide settings for the allocators built on demand: each thread's
//! default allocator and the global synchronized allocator.
//!
//! The settings can change only until the first of those allocators is
//! built; from then on they are frozen so every default allocator in the
//! process agrees on the same size classes.

use super::error::AllocError;
use super::size_class::{self, DEFAULT_SIZE_CLASSES, SizeClass};
use super::slab_allocator::{SlabAllocator, SlabAllocatorConfig};
use crate::sync::RwLock;
use std::sync::PoisonError;

struct Defaults {
    zero_on_touch: bool,
    allow_fallback: bool,
    /// `None` selects [`DEFAULT_SIZE_CLASSES`].
    size_classes: Option<Vec<SizeClass>>,
    frozen: bool,
}

impl Defaults {
    const fn new() -> Self {
        Self { zero_on_touch: false, allow_fallback: true, size_classes: None, frozen: false }
    }

    fn config(&self) -> SlabAllocatorConfig {
        SlabAllocatorConfig {
            zero_on_touch: self.zero_on_touch,
            allow_fallback: self.allow_fallback,
            size_classes: self.size_classes.clone().unwrap_or_else(|| DEFAULT_SIZE_CLASSES.to_vec()),
        }
    }

    fn ensure_unfrozen(&self) -> Result<(), AllocError> {
        if self.frozen { Err(AllocError::DefaultsFrozen) } else { Ok(()) }
    }
}

crate::sync::static_rwlock! {
    static DEFAULTS: RwLock<Defaults> = RwLock::new(Defaults::new());
}

fn update(f: impl FnOnce(&mut Defaults)) -> Result<(), AllocError> {
    let mut defaults = DEFAULTS.write().unwrap_or_else(PoisonError::into_inner);
    defaults.ensure_unfrozen()?;
    f(&mut defaults);
    Ok(())
}

/// Replaces the whole process-wide default configuration.
///
/// # Errors
///
/// - Validation errors of [`SlabAllocator::build`] for the size classes.
/// - [`AllocError::DefaultsFrozen`] once a default allocator exists.
pub fn set_default_config(config: SlabAllocatorConfig) -> Result<(), AllocError> {
    let classes = size_class::sorted_classes(&config.size_classes)?;
    update(|d| {
        d.zero_on_touch = config.zero_on_touch;
        d.allow_fallback = config.allow_fallback;
        d.size_classes = Some(classes);
    })
}

/// Sets the zeroing and fallback policy of default allocators.
///
/// # Errors
///
/// [`AllocError::DefaultsFrozen`] once a default allocator exists.
pub fn set_default_policy(zero_on_touch: bool, allow_fallback: bool) -> Result<(), AllocError> {
    update(|d| {
        d.zero_on_touch = zero_on_touch;
        d.allow_fallback = allow_fallback;
    })
}

/// Sets the size classes of default allocators.
///
/// # Errors
///
/// - Validation errors of [`SlabAllocator::build`].
/// - [`AllocError::DefaultsFrozen`] once a default allocator exists.
pub fn set_default_size_classes(classes: &[SizeClass]) -> Result<(), AllocError> {
    let classes = size_class::sorted_classes(classes)?;
    update(|d| d.size_classes = Some(classes))
}

/// Current process-wide default configuration.
#[must_use]
pub fn default_config() -> SlabAllocatorConfig {
    DEFAULTS.read().unwrap_or_else(PoisonError::into_inner).config()
}

/// Whether a default allocator has been built, freezing the defaults.
#[must_use]
pub fn defaults_frozen() -> bool {
    DEFAULTS.read().unwrap_or_else(PoisonError::into_inner).frozen
}

/// Freezes the defaults and builds an allocator from them.
pub(crate) fn build_default_allocator() -> Result<SlabAllocator, AllocError> {
    let config = {
        let mut defaults = DEFAULTS.write().unwrap_or_else(PoisonError::into_inner);
        defaults.frozen = true;
        defaults.config()
    };
    SlabAllocator::with_config(&config)
}
