use super::error::AllocError;

/// Upper bound on size classes per allocator.
///
/// Pool index 255 is reserved so that no slab handle can ever encode the
/// all-ones fallback sentinel.
pub const MAX_SIZE_CLASSES: usize = 255;

/// Describes one size class of a [`SlabAllocator`](crate::SlabAllocator).
///
/// `initial_chunks` counts growth chunks: a class starts with
/// `initial_chunks * growth_increment` slabs and then grows by
/// `growth_increment` slabs at a time until `max_slab_count` is reached. The
/// final chunk is shortened when the cap is not a multiple of the increment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SizeClass {
    pub slab_size: u32,
    pub growth_increment: u32,
    pub initial_chunks: u32,
    pub max_slab_count: u32,
}

impl SizeClass {
    #[must_use]
    pub const fn new(slab_size: u32, growth_increment: u32, initial_chunks: u32, max_slab_count: u32) -> Self {
        Self { slab_size, growth_increment, initial_chunks, max_slab_count }
    }

    /// Slabs created eagerly when the owning allocator is built.
    #[must_use]
    pub const fn initial_slab_count(&self) -> u64 {
        self.initial_chunks as u64 * self.growth_increment as u64
    }

    fn validate(&self) -> Result<(), AllocError> {
        if self.slab_size == 0 {
            return Err(AllocError::InvalidConfiguration("slab size must be non-zero".into()));
        }
        if self.growth_increment == 0 {
            return Err(AllocError::InvalidConfiguration(format!(
                "size class {} has a zero growth increment",
                self.slab_size
            )));
        }
        if self.initial_slab_count() > u64::from(self.max_slab_count) {
            return Err(AllocError::InvalidConfiguration(format!(
                "size class {} starts with {} slabs, above its cap of {}",
                self.slab_size,
                self.initial_slab_count(),
                self.max_slab_count
            )));
        }
        Ok(())
    }
}

/// Validate a descriptor set and return it sorted by ascending slab size.
///
/// # Errors
/// - [`AllocError::TooManyClasses`] above [`MAX_SIZE_CLASSES`] descriptors.
/// - [`AllocError::InvalidConfiguration`] for a zero slab size, a zero growth
///   increment, initial slabs above the cap, or a repeated slab size.
pub(crate) fn sorted_classes(classes: &[SizeClass]) -> Result<Vec<SizeClass>, AllocError> {
    if classes.len() > MAX_SIZE_CLASSES {
        return Err(AllocError::TooManyClasses { count: classes.len() });
    }
    let mut sorted = classes.to_vec();
    sorted.sort_unstable_by_key(|c| c.slab_size);
    for class in &sorted {
        class.validate()?;
    }
    if let Some(pair) = sorted.windows(2).find(|w| w[0].slab_size == w[1].slab_size) {
        return Err(AllocError::InvalidConfiguration(format!(
            "slab size {} is configured twice",
            pair[0].slab_size
        )));
    }
    Ok(sorted)
}

const fn unbounded(slab_size: u32, growth_increment: u32) -> SizeClass {
    SizeClass::new(slab_size, growth_increment, 0, u32::MAX)
}

/// Size classes used by default allocators unless the process overrides them.
///
/// Steps of 16 bytes up to 512, then powers of two up to 64 KiB with smaller
/// growth increments for the large classes.
pub const DEFAULT_SIZE_CLASSES: &[SizeClass] = &[
    unbounded(8, 10),
    unbounded(16, 10),
    unbounded(32, 10),
    unbounded(48, 10),
    unbounded(64, 10),
    unbounded(80, 10),
    unbounded(96, 10),
    unbounded(112, 10),
    unbounded(128, 10),
    unbounded(144, 10),
    unbounded(160, 10),
    unbounded(176, 10),
    unbounded(192, 10),
    unbounded(208, 10),
    unbounded(224, 10),
    unbounded(240, 10),
    unbounded(256, 10),
    unbounded(272, 10),
    unbounded(288, 10),
    unbounded(304, 10),
    unbounded(320, 10),
    unbounded(336, 10),
    unbounded(352, 10),
    unbounded(368, 10),
    unbounded(384, 10),
    unbounded(400, 10),
    unbounded(416, 10),
    unbounded(432, 10),
    unbounded(448, 10),
    unbounded(464, 10),
    unbounded(480, 10),
    unbounded(496, 10),
    unbounded(512, 10),
    unbounded(1024, 10),
    unbounded(2048, 10),
    unbounded(4096, 10),
    unbounded(8192, 10),
    unbounded(16384, 5),
    unbounded(32768, 5),
    unbounded(65536, 2),
];

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_size_class_sorted_output() {
        let classes = [SizeClass::new(32, 4, 0, 8), SizeClass::new(8, 4, 1, 8), SizeClass::new(16, 4, 0, 8)];
        let sorted = sorted_classes(&classes).unwrap();
        let sizes: Vec<u32> = sorted.iter().map(|c| c.slab_size).collect();
        assert_eq!(sizes, [8, 16, 32]);
    }

    #[test]
    fn test_size_class_rejects_duplicate() {
        let classes = [SizeClass::new(16, 4, 0, 8), SizeClass::new(16, 2, 0, 4)];
        assert!(matches!(sorted_classes(&classes), Err(AllocError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_size_class_rejects_zero_size() {
        let classes = [SizeClass::new(0, 4, 0, 8)];
        assert!(matches!(sorted_classes(&classes), Err(AllocError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_size_class_rejects_zero_growth() {
        let classes = [SizeClass::new(8, 0, 0, 8)];
        assert!(matches!(sorted_classes(&classes), Err(AllocError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_size_class_rejects_initial_above_cap() {
        let classes = [SizeClass::new(8, 10, 2, 15)];
        assert!(matches!(sorted_classes(&classes), Err(AllocError::InvalidConfiguration(_))));
        // Exactly at the cap is fine.
        assert!(sorted_classes(&[SizeClass::new(8, 10, 2, 20)]).is_ok());
    }

    #[test]
    fn test_size_class_limit() {
        let classes: Vec<SizeClass> = (1..=255).map(|s| SizeClass::new(s, 1, 0, 1)).collect();
        assert_eq!(sorted_classes(&classes).unwrap().len(), 255);

        let classes: Vec<SizeClass> = (1..=256).map(|s| SizeClass::new(s, 1, 0, 1)).collect();
        assert!(matches!(sorted_classes(&classes), Err(AllocError::TooManyClasses { count: 256 })));
    }

    #[test]
    fn test_default_size_classes_are_valid() {
        let sorted = sorted_classes(DEFAULT_SIZE_CLASSES).unwrap();
        assert_eq!(sorted.as_slice(), DEFAULT_SIZE_CLASSES);
        assert_eq!(sorted.first().map(|c| c.slab_size), Some(8));
        assert_eq!(sorted.last().map(|c| c.slab_size), Some(65536));
    }
}
