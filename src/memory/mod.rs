pub(crate) mod arena;
pub(crate) mod bump;
pub(crate) mod class_heap;
pub(crate) mod config;
pub(crate) mod deferred;
pub(crate) mod error;
pub(crate) mod loom_tests;
pub(crate) mod records;
pub(crate) mod router;
pub(crate) mod scrap_cache;
pub(crate) mod stats;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
