//! Live-updatable shared values.
//!
//! Readers take a cheap `Arc` snapshot through `ArcSwap` and never block writers; a
//! request that started with one snapshot finishes with it even if the value is
//! replaced meanwhile.

use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;

/// `DynamicConfig<T>` gives lock-free reads and atomic replacement for shared config.
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: fmt::Debug> fmt::Debug for DynamicConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DynamicConfig").field(&*self.inner.load()).finish()
    }
}

impl<T: Default> Default for DynamicConfig<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value, returning the previous one.
    pub fn set(&self, value: T) -> Arc<T> {
        self.inner.swap(Arc::new(value))
    }

    /// Derive a new value from the current one. Retries if another writer got in first,
    /// so `f` may run more than once.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&T) -> T,
    {
        self.inner.rcu(|current| f(&**current));
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicConfig;
    use std::collections::HashMap;

    #[test]
    fn get_set_update() {
        let cfg = DynamicConfig::new(1);
        assert_eq!(*cfg.get(), 1);
        assert_eq!(*cfg.set(2), 1);
        cfg.update(|v| v + 3);
        assert_eq!(*cfg.get(), 5);
    }

    #[test]
    fn snapshots_are_stable_across_updates() {
        let cfg = DynamicConfig::new(HashMap::from([("/ping", 10)]));
        let before = cfg.get();
        let shared = cfg.clone();
        shared.update(|m| {
            let mut m = m.clone();
            m.insert("/ping", 20);
            m
        });
        assert_eq!(before["/ping"], 10);
        assert_eq!(cfg.get()["/ping"], 20);
    }
}
