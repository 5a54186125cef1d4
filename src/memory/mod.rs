pub(crate) mod chain;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod global;
pub(crate) mod handle;
pub(crate) mod pool;
pub(crate) mod size_class;
pub(crate) mod slab_allocator;
pub(crate) mod stats;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
